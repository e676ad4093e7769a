use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::models::chat::{ActionType, UserType};
use crate::services::query_analyzer::MessageAnalysis;

/// Activity type categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    RequestReceived,
    SessionCreated,
    SessionExpired,
    ActionDecided,
    CacheHit,
    MessageAnswered,
    ContentFiltered,
    BackendFallback,
    DataCaptured,
    ConsentRecorded,
}

impl ActivityType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::RequestReceived => "request_received",
            Self::SessionCreated => "session_created",
            Self::SessionExpired => "session_expired",
            Self::ActionDecided => "action_decided",
            Self::CacheHit => "cache_hit",
            Self::MessageAnswered => "message_answered",
            Self::ContentFiltered => "content_filtered",
            Self::BackendFallback => "backend_fallback",
            Self::DataCaptured => "data_captured",
            Self::ConsentRecorded => "consent_recorded",
        }
    }
}

/// Activity status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityStatus {
    Success,
    Error,
    Warning,
    Info,
}

impl ActivityStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
        }
    }
}

/// One session event handed to the persistence collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct ActivityLog {
    pub session_id: String,
    pub activity_type: ActivityType,
    pub activity_status: ActivityStatus,

    pub user_type: Option<UserType>,
    pub action_type: Option<ActionType>,
    pub message_content: Option<String>,
    pub response_content: Option<String>,

    pub technologies: Vec<String>,
    pub intents: Vec<String>,
    pub engagement_score: Option<f64>,
    pub cached: Option<bool>,

    pub processing_time_ms: Option<u64>,

    pub error_message: Option<String>,
    pub error_type: Option<String>,

    pub created_at: DateTime<Utc>,
    pub custom_fields: Option<HashMap<String, Value>>,
}

impl ActivityLog {
    pub fn builder(session_id: &str, activity_type: ActivityType) -> ActivityLogBuilder {
        ActivityLogBuilder::new(session_id, activity_type)
    }
}

/// Builder pattern for ActivityLog
pub struct ActivityLogBuilder {
    log: ActivityLog,
}

impl ActivityLogBuilder {
    pub fn new(session_id: &str, activity_type: ActivityType) -> Self {
        Self {
            log: ActivityLog {
                session_id: session_id.to_string(),
                activity_type,
                activity_status: ActivityStatus::Success,
                user_type: None,
                action_type: None,
                message_content: None,
                response_content: None,
                technologies: Vec::new(),
                intents: Vec::new(),
                engagement_score: None,
                cached: None,
                processing_time_ms: None,
                error_message: None,
                error_type: None,
                created_at: Utc::now(),
                custom_fields: None,
            },
        }
    }

    pub fn status(mut self, status: ActivityStatus) -> Self {
        self.log.activity_status = status;
        self
    }

    pub fn user_type(mut self, user_type: UserType) -> Self {
        self.log.user_type = Some(user_type);
        self
    }

    pub fn action(mut self, action: ActionType) -> Self {
        self.log.action_type = Some(action);
        self
    }

    pub fn message(mut self, content: impl Into<String>) -> Self {
        self.log.message_content = Some(content.into());
        self
    }

    pub fn response(mut self, content: impl Into<String>) -> Self {
        self.log.response_content = Some(content.into());
        self
    }

    pub fn analysis(mut self, analysis: &MessageAnalysis) -> Self {
        self.log.technologies = analysis.technologies.clone();
        self.log.intents = analysis.intents.clone();
        self
    }

    pub fn engagement(mut self, score: f64) -> Self {
        self.log.engagement_score = Some(score);
        self
    }

    pub fn cached(mut self, cached: bool) -> Self {
        self.log.cached = Some(cached);
        self
    }

    pub fn processing_time(mut self, ms: u64) -> Self {
        self.log.processing_time_ms = Some(ms);
        self
    }

    pub fn error(mut self, error_type: impl Into<String>, message: impl Into<String>) -> Self {
        self.log.activity_status = ActivityStatus::Error;
        self.log.error_type = Some(error_type.into());
        self.log.error_message = Some(message.into());
        self
    }

    pub fn custom_field(mut self, key: &str, value: Value) -> Self {
        self.log
            .custom_fields
            .get_or_insert_with(HashMap::new)
            .insert(key.to_string(), value);
        self
    }

    pub fn build(self) -> ActivityLog {
        self.log
    }
}
