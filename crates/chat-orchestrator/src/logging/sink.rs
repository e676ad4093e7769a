use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use super::types::ActivityLog;

/// Destination for activity batches (the session persistence collaborator).
#[async_trait]
pub trait ActivitySink: Send + Sync {
    /// Returns the number of records accepted.
    async fn write_batch(&self, batch: &[ActivityLog]) -> Result<usize>;
}

/// Emits every activity as a structured `tracing` event.
#[derive(Debug, Clone, Default)]
pub struct TracingActivitySink;

#[async_trait]
impl ActivitySink for TracingActivitySink {
    async fn write_batch(&self, batch: &[ActivityLog]) -> Result<usize> {
        for log in batch {
            info!(
                target: "activity",
                session_id = %log.session_id,
                activity_type = log.activity_type.as_str(),
                status = log.activity_status.as_str(),
                user_type = log.user_type.as_ref().map(|u| u.as_str()),
                action_type = log.action_type.as_ref().map(|a| a.as_str()),
                technologies = ?log.technologies,
                intents = ?log.intents,
                engagement_score = log.engagement_score,
                cached = log.cached,
                processing_time_ms = log.processing_time_ms,
                error_type = log.error_type.as_deref(),
                error_message = log.error_message.as_deref(),
                "activity"
            );
        }
        Ok(batch.len())
    }
}
