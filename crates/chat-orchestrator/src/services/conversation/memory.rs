use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::flow::{self, FlowDecision};
use super::types::{SessionSnapshot, SessionState};
use crate::config::{FlowConfig, MemoryConfig};
use crate::models::chat::{ContactData, ConversationTurn, FlowState, Role, SessionId, UserType};
use crate::utils::error::ChatError;

/// How the session record was obtained at the start of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOrigin {
    Existing,
    Created,
    /// The previous record sat idle past the timeout and was replaced.
    Expired,
}

/// Everything the orchestrator needs after the pre-backend critical section.
#[derive(Debug, Clone)]
pub struct TurnStart {
    pub decision: FlowDecision,
    pub snapshot: SessionSnapshot,
    pub next_flow_state: FlowState,
    pub history: String,
    pub origin: SessionOrigin,
}

/// Per-session bounded history and counters.
///
/// All mutation happens inside a single `DashMap` shard guard and never
/// spans an `.await`.
pub struct ConversationMemory {
    sessions: DashMap<SessionId, SessionState>,
    history_pairs: usize,
    session_timeout: Duration,
}

impl ConversationMemory {
    pub fn new(config: &MemoryConfig) -> Self {
        info!(
            "Initializing conversation memory: window={} pairs, idle timeout={}m",
            config.history_pairs, config.session_timeout_minutes
        );
        Self {
            sessions: DashMap::new(),
            history_pairs: config.history_pairs,
            session_timeout: Duration::from_secs(config.session_timeout_minutes * 60),
        }
    }

    /// Returns the live session, replacing it first if it went idle.
    pub fn get_or_create(&self, session_id: &str) -> SessionSnapshot {
        let now = Instant::now();
        let mut entry = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionState::new(session_id.to_string(), now));

        if entry.is_idle(now, self.session_timeout) {
            *entry = SessionState::new(session_id.to_string(), now);
        }
        entry.snapshot()
    }

    pub fn begin_turn(
        &self,
        session_id: &str,
        user_type: UserType,
        flow_config: &FlowConfig,
    ) -> Result<TurnStart, ChatError> {
        self.begin_turn_at(session_id, user_type, flow_config, Instant::now())
    }

    /// Idle check, get-or-create, count, engagement, flow decision and
    /// history snapshot in one critical section.
    pub fn begin_turn_at(
        &self,
        session_id: &str,
        user_type: UserType,
        flow_config: &FlowConfig,
        now: Instant,
    ) -> Result<TurnStart, ChatError> {
        let mut origin = SessionOrigin::Existing;
        let mut entry = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                origin = SessionOrigin::Created;
                SessionState::new(session_id.to_string(), now)
            });

        if origin == SessionOrigin::Existing && entry.is_idle(now, self.session_timeout) {
            debug!("Session {} idle past timeout, starting over", session_id);
            *entry = SessionState::new(session_id.to_string(), now);
            origin = SessionOrigin::Expired;
        }

        let state = entry.value_mut();
        state.message_count += 1;
        state.user_type = user_type;
        state.refresh_engagement(now);

        let decision = flow::decide(&state.snapshot(), flow_config);
        flow::apply(state, &decision);
        flow::check_invariants(state, flow_config).map_err(ChatError::InvariantViolation)?;
        state.touch(now);

        let snapshot = state.snapshot();
        Ok(TurnStart {
            next_flow_state: flow::flow_state(&snapshot),
            history: state.history_as_text(),
            decision,
            snapshot,
            origin,
        })
    }

    /// Appends the user message and the final answer. A session swept while
    /// the backends were running is not resurrected.
    pub fn complete_turn(&self, session_id: &str, user_text: &str, assistant_text: &str) -> bool {
        let Some(mut state) = self.sessions.get_mut(session_id) else {
            warn!("Session {} vanished before its turn completed", session_id);
            return false;
        };

        state.push_turn(ConversationTurn::new(Role::User, user_text), self.history_pairs);
        state.push_turn(
            ConversationTurn::new(Role::Assistant, assistant_text),
            self.history_pairs,
        );
        state.touch(Instant::now());
        true
    }

    /// Rolls back the count and flow attempt of a turn whose answer was never
    /// recorded. Ignored when the session was replaced in the meantime.
    pub fn abandon_turn(&self, turn: &TurnStart) -> bool {
        let session_id = &turn.snapshot.session_id;
        let Some(mut state) = self.sessions.get_mut(session_id) else {
            return false;
        };
        if state.started_at != turn.snapshot.started_at {
            debug!("Session {} was replaced, nothing to roll back", session_id);
            return false;
        }

        let state = state.value_mut();
        state.message_count = state.message_count.saturating_sub(1);
        flow::revert(state, &turn.decision);
        state.refresh_engagement(Instant::now());
        warn!(
            "Session {} turn abandoned before completion, counters rolled back",
            session_id
        );
        true
    }

    pub fn append(&self, session_id: &str, role: Role, text: &str) -> Result<(), ChatError> {
        let mut state = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| ChatError::SessionNotFound(session_id.to_string()))?;

        state.push_turn(ConversationTurn::new(role, text), self.history_pairs);
        state.touch(Instant::now());
        Ok(())
    }

    pub fn history_as_text(&self, session_id: &str) -> String {
        self.sessions
            .get(session_id)
            .map(|state| state.history_as_text())
            .unwrap_or_default()
    }

    /// Removes sessions idle longer than the timeout; returns their ids.
    pub fn sweep_idle(&self, now: Instant) -> Vec<SessionId> {
        let mut removed = Vec::new();
        self.sessions.retain(|id, state| {
            if state.is_idle(now, self.session_timeout) {
                removed.push(id.clone());
                false
            } else {
                true
            }
        });

        if !removed.is_empty() {
            info!("Swept {} idle sessions", removed.len());
        }
        removed
    }

    /// Sets `data_captured` once. `Ok(false)` when it was already set.
    pub fn record_data_capture(
        &self,
        session_id: &str,
        contact: ContactData,
    ) -> Result<bool, ChatError> {
        self.update_live(session_id, |state| {
            if state.data_captured {
                return false;
            }
            state.data_captured = true;
            state.contact = Some(contact);
            true
        })
    }

    /// Sets `consent_given` once. `Ok(false)` when it was already set.
    pub fn record_consent(
        &self,
        session_id: &str,
        consent_types: Vec<String>,
    ) -> Result<bool, ChatError> {
        self.update_live(session_id, |state| {
            if state.consent_given {
                return false;
            }
            state.consent_given = true;
            state.consent_types = consent_types;
            true
        })
    }

    fn update_live<F>(&self, session_id: &str, update: F) -> Result<bool, ChatError>
    where
        F: FnOnce(&mut SessionState) -> bool,
    {
        let now = Instant::now();
        let changed = {
            let mut state = self
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| ChatError::SessionNotFound(session_id.to_string()))?;

            if state.is_idle(now, self.session_timeout) {
                None
            } else {
                let changed = update(state.value_mut());
                state.touch(now);
                Some(changed)
            }
        };

        match changed {
            Some(changed) => Ok(changed),
            None => {
                self.sessions
                    .remove_if(session_id, |_, state| state.is_idle(now, self.session_timeout));
                Err(ChatError::SessionNotFound(session_id.to_string()))
            }
        }
    }

    pub fn snapshot(&self, session_id: &str) -> Option<SessionSnapshot> {
        let now = Instant::now();
        self.sessions
            .get(session_id)
            .filter(|state| !state.is_idle(now, self.session_timeout))
            .map(|state| state.snapshot())
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }
}
