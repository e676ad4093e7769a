use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::models::chat::{ContactData, ConversationTurn, Role, SessionId, UserType};

/// Per-session record held by the conversation memory.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub session_id: SessionId,

    /// Last user type the caller reported.
    pub user_type: UserType,

    /// Turns processed so far, including the current one once begun.
    pub message_count: u32,

    /// Recomputed on every turn from `message_count` and session age.
    pub engagement_score: f64,

    /// Terminal flags: set at most once, never cleared.
    pub data_captured: bool,
    pub consent_given: bool,

    pub capture_attempts: u32,
    pub consent_attempts: u32,

    pub contact: Option<ContactData>,
    pub consent_types: Vec<String>,

    /// Sliding window of user/assistant turns, oldest first.
    pub turns: VecDeque<ConversationTurn>,

    pub created_at: Instant,
    pub last_activity: Instant,
    pub started_at: DateTime<Utc>,
}

impl SessionState {
    pub fn new(session_id: SessionId, now: Instant) -> Self {
        Self {
            session_id,
            user_type: UserType::default(),
            message_count: 0,
            engagement_score: 0.0,
            data_captured: false,
            consent_given: false,
            capture_attempts: 0,
            consent_attempts: 0,
            contact: None,
            consent_types: Vec::new(),
            turns: VecDeque::new(),
            created_at: now,
            last_activity: now,
            started_at: Utc::now(),
        }
    }

    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) > timeout
    }

    pub fn touch(&mut self, now: Instant) {
        if now > self.last_activity {
            self.last_activity = now;
        }
    }

    pub fn refresh_engagement(&mut self, now: Instant) {
        let age = now.saturating_duration_since(self.created_at);
        self.engagement_score = engagement_score(self.message_count, age);
    }

    /// Pushes a turn and drops the oldest ones beyond `max_pairs` pairs.
    pub fn push_turn(&mut self, turn: ConversationTurn, max_pairs: usize) {
        self.turns.push_back(turn);
        while self.turns.len() > max_pairs * 2 {
            self.turns.pop_front();
        }
    }

    pub fn history_pairs(&self) -> usize {
        self.turns
            .iter()
            .zip(self.turns.iter().skip(1))
            .filter(|(a, b)| a.role == Role::User && b.role == Role::Assistant)
            .count()
    }

    /// Complete pairs only, `Human: ..\nAssistant: ..\n\n` each.
    pub fn history_as_text(&self) -> String {
        let mut out = String::new();
        let mut pending_user: Option<&str> = None;

        for turn in &self.turns {
            match turn.role {
                Role::User => pending_user = Some(&turn.text),
                Role::Assistant => {
                    if let Some(user) = pending_user.take() {
                        out.push_str("Human: ");
                        out.push_str(user);
                        out.push_str("\nAssistant: ");
                        out.push_str(&turn.text);
                        out.push_str("\n\n");
                    }
                }
            }
        }

        out
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            user_type: self.user_type,
            message_count: self.message_count,
            engagement_score: self.engagement_score,
            data_captured: self.data_captured,
            consent_given: self.consent_given,
            capture_attempts: self.capture_attempts,
            consent_attempts: self.consent_attempts,
            history_pairs: self.history_pairs(),
            started_at: self.started_at,
        }
    }
}

/// Read-only copy of the counters the flow policy looks at.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub user_type: UserType,
    pub message_count: u32,
    pub engagement_score: f64,
    pub data_captured: bool,
    pub consent_given: bool,
    pub capture_attempts: u32,
    pub consent_attempts: u32,
    pub history_pairs: usize,
    pub started_at: DateTime<Utc>,
}

/// `min(count / 10, 0.6) + min(hours / 2, 0.4)`, capped at 1.0.
pub fn engagement_score(message_count: u32, session_age: Duration) -> f64 {
    let message_component = (message_count as f64 / 10.0).min(0.6);
    let hours = session_age.as_secs_f64() / 3600.0;
    let duration_component = (hours / 2.0).min(0.4);
    (message_component + duration_component).min(1.0)
}
