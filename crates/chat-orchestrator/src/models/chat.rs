use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

pub type SessionId = String;

// ===== DOMAIN MODELS =====

/// Audience the caller says it belongs to. Drives the prompt hint and the cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserType {
    Recruiter,
    Client,
    Curious,
    #[default]
    Other,
}

impl UserType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Recruiter => "recruiter",
            Self::Client => "client",
            Self::Curious => "curious",
            Self::Other => "other",
        }
    }

    /// One line appended to the persona preamble.
    pub fn prompt_hint(&self) -> &str {
        match self {
            Self::Recruiter => {
                "The person asking is a recruiter: highlight roles, responsibilities and measurable results."
            }
            Self::Client => {
                "The person asking is a potential client: focus on delivered projects and how problems were solved."
            }
            Self::Curious => {
                "The person asking is simply curious: keep the tone friendly and avoid jargon."
            }
            Self::Other => "Answer in a professional, concise tone.",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Response category owed to the session on the current turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    ShowWelcome,
    RequestDataCapture,
    RequestConsent,
    NormalAnswer,
}

impl ActionType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::ShowWelcome => "show_welcome",
            Self::RequestDataCapture => "request_data_capture",
            Self::RequestConsent => "request_consent",
            Self::NormalAnswer => "normal_answer",
        }
    }
}

/// Next logical state of the engagement flow, reported to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    Initial,
    ConversationActive,
    DataCapturePending,
    ConsentPending,
}

/// A retrieved chunk as exposed to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub source_type: String,
    pub content_preview: String,
    pub metadata: HashMap<String, Value>,
}

impl SourceRef {
    const PREVIEW_CHARS: usize = 100;

    pub fn from_chunk(text: &str, metadata: &HashMap<String, Value>) -> Self {
        let source_type = metadata
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();

        let content_preview = if text.chars().count() > Self::PREVIEW_CHARS {
            let mut preview: String = text.chars().take(Self::PREVIEW_CHARS).collect();
            preview.push_str("...");
            preview
        } else {
            text.to_string()
        };

        let metadata = metadata
            .iter()
            .filter(|(k, _)| k.as_str() != "page_content")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Self {
            source_type,
            content_preview,
            metadata,
        }
    }
}

/// The body of one answered turn. Immutable once built; shared through the
/// response cache as `Arc<AnswerResult>`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnswerResult {
    pub text: String,
    pub sources: Vec<SourceRef>,
    pub model_id: String,
    pub action_type: ActionType,
    pub content_filtered: bool,
}

/// Contact details submitted once the session was asked for them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactData {
    pub email: String,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

// ===== REQUEST MODELS =====

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub user_type: Option<UserType>,
}

#[derive(Debug, Deserialize)]
pub struct CaptureRequest {
    pub session_id: String,
    #[serde(flatten)]
    pub contact: ContactData,
}

#[derive(Debug, Deserialize)]
pub struct ConsentRequest {
    pub session_id: String,
    #[serde(default)]
    pub consent_types: Vec<String>,
}

// ===== RESPONSE MODELS =====

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub session_id: String,
    pub response: String,
    pub sources: Vec<SourceRef>,
    pub model: String,
    pub action_type: ActionType,
    pub next_flow_state: FlowState,
    pub content_filtered: bool,
    pub cached: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct RecordResponse {
    pub session_id: String,
    /// `false` when the flag was already set earlier in the session.
    pub recorded: bool,
    pub flow_state: FlowState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_type_defaults_to_other() {
        let request: ChatRequest = serde_json::from_str(r#"{"message":"hi"}"#).unwrap();
        assert_eq!(request.user_type.unwrap_or_default(), UserType::Other);

        let request: ChatRequest =
            serde_json::from_str(r#"{"message":"hi","user_type":"recruiter"}"#).unwrap();
        assert_eq!(request.user_type, Some(UserType::Recruiter));
    }

    #[test]
    fn test_source_preview_is_truncated() {
        let mut metadata = HashMap::new();
        metadata.insert("type".to_string(), Value::from("project"));
        metadata.insert("page_content".to_string(), Value::from("dup"));

        let long = "x".repeat(150);
        let source = SourceRef::from_chunk(&long, &metadata);
        assert_eq!(source.source_type, "project");
        assert_eq!(source.content_preview.chars().count(), 103);
        assert!(source.content_preview.ends_with("..."));
        assert!(!source.metadata.contains_key("page_content"));

        let short = SourceRef::from_chunk("short text", &HashMap::new());
        assert_eq!(short.source_type, "unknown");
        assert_eq!(short.content_preview, "short text");
    }

    #[test]
    fn test_capture_request_flattens_contact() {
        let request: CaptureRequest =
            serde_json::from_str(r#"{"session_id":"s1","email":"a@b.c","company":"Acme"}"#)
                .unwrap();
        assert_eq!(request.contact.email, "a@b.c");
        assert_eq!(request.contact.company.as_deref(), Some("Acme"));
        assert!(request.contact.role.is_none());
    }
}
