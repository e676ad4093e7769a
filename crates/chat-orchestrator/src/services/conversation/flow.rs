//! Engagement policy: which response category a session is owed this turn.
//!
//! `decide` is pure. `apply` consumes the attempt the decision asked for and
//! is called by the memory inside the same critical section.

use serde::Serialize;

use super::types::{SessionSnapshot, SessionState};
use crate::config::FlowConfig;
use crate::models::chat::{ActionType, FlowState};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowData {
    /// Attempt number consumed by this turn (1-based), for prompting actions.
    pub attempt: Option<u32>,
    pub max_attempts: Option<u32>,
    pub engagement_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowDecision {
    pub action: ActionType,
    pub flow_data: FlowData,
}

/// Evaluated after `message_count` was incremented for the current turn.
pub fn decide(session: &SessionSnapshot, config: &FlowConfig) -> FlowDecision {
    let score = session.engagement_score;

    if session.message_count == 1 {
        return FlowDecision {
            action: ActionType::ShowWelcome,
            flow_data: FlowData {
                attempt: None,
                max_attempts: None,
                engagement_score: score,
            },
        };
    }

    if !session.data_captured
        && session.message_count >= config.data_capture_after_messages
        && score >= config.engagement_threshold
        && session.capture_attempts < config.max_capture_attempts
    {
        return FlowDecision {
            action: ActionType::RequestDataCapture,
            flow_data: FlowData {
                attempt: Some(session.capture_attempts + 1),
                max_attempts: Some(config.max_capture_attempts),
                engagement_score: score,
            },
        };
    }

    if session.data_captured
        && !session.consent_given
        && session.consent_attempts < config.max_consent_attempts
    {
        return FlowDecision {
            action: ActionType::RequestConsent,
            flow_data: FlowData {
                attempt: Some(session.consent_attempts + 1),
                max_attempts: Some(config.max_consent_attempts),
                engagement_score: score,
            },
        };
    }

    FlowDecision {
        action: ActionType::NormalAnswer,
        flow_data: FlowData {
            attempt: None,
            max_attempts: None,
            engagement_score: score,
        },
    }
}

pub fn apply(state: &mut SessionState, decision: &FlowDecision) {
    match decision.action {
        ActionType::RequestDataCapture => state.capture_attempts += 1,
        ActionType::RequestConsent => state.consent_attempts += 1,
        ActionType::ShowWelcome | ActionType::NormalAnswer => {}
    }
}

/// Gives back the attempt `apply` consumed for a turn that never finished.
pub fn revert(state: &mut SessionState, decision: &FlowDecision) {
    match decision.action {
        ActionType::RequestDataCapture => {
            state.capture_attempts = state.capture_attempts.saturating_sub(1)
        }
        ActionType::RequestConsent => {
            state.consent_attempts = state.consent_attempts.saturating_sub(1)
        }
        ActionType::ShowWelcome | ActionType::NormalAnswer => {}
    }
}

/// Flow state implied by the session counters. A request stays pending
/// while it was asked at least once and its flag is still unset.
pub fn flow_state(session: &SessionSnapshot) -> FlowState {
    if session.message_count == 0 {
        FlowState::Initial
    } else if session.data_captured && !session.consent_given && session.consent_attempts > 0 {
        FlowState::ConsentPending
    } else if !session.data_captured && session.capture_attempts > 0 {
        FlowState::DataCapturePending
    } else {
        FlowState::ConversationActive
    }
}

/// Counters may never run past their configured maxima.
pub fn check_invariants(state: &SessionState, config: &FlowConfig) -> Result<(), String> {
    if state.capture_attempts > config.max_capture_attempts {
        return Err(format!(
            "session {} capture_attempts {} > max {}",
            state.session_id, state.capture_attempts, config.max_capture_attempts
        ));
    }
    if state.consent_attempts > config.max_consent_attempts {
        return Err(format!(
            "session {} consent_attempts {} > max {}",
            state.session_id, state.consent_attempts, config.max_consent_attempts
        ));
    }
    Ok(())
}
