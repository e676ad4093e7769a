use std::{
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::config::BackendConfig;
use crate::utils::error::BackendError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Embedding,
    Retrieval,
    Generation,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Embedding => "embedding",
            Self::Retrieval => "retrieval",
            Self::Generation => "generation",
        }
    }
}

/// Concurrency permits and the per-call deadline for the three backends.
#[derive(Clone)]
pub struct BackendLimiters {
    pub embedding: Arc<Semaphore>,
    pub retrieval: Arc<Semaphore>,
    pub generation: Arc<Semaphore>,
    pub acquire_timeout: Duration,
    pub call_timeout: Duration,
}

impl BackendLimiters {
    pub fn new(cfg: &BackendConfig) -> Self {
        Self {
            embedding: Arc::new(Semaphore::new(cfg.embedding_concurrency.max(1))),
            retrieval: Arc::new(Semaphore::new(cfg.retrieval_concurrency.max(1))),
            generation: Arc::new(Semaphore::new(cfg.generation_concurrency.max(1))),
            acquire_timeout: Duration::from_millis(cfg.acquire_timeout_ms.max(1)),
            call_timeout: Duration::from_secs(cfg.call_timeout_seconds.max(1)),
        }
    }

    fn semaphore(&self, backend: Backend) -> Arc<Semaphore> {
        match backend {
            Backend::Embedding => self.embedding.clone(),
            Backend::Retrieval => self.retrieval.clone(),
            Backend::Generation => self.generation.clone(),
        }
    }

    pub async fn acquire_timed(
        sem: Arc<Semaphore>,
        acquire_timeout: Duration,
        op: &'static str,
    ) -> Result<(OwnedSemaphorePermit, Duration), BackendError> {
        let start = Instant::now();

        let permit = tokio::time::timeout(acquire_timeout, sem.acquire_owned())
            .await
            .map_err(|_| BackendError::Overloaded { op })?
            .map_err(|e| BackendError::unavailable(op, e))?;

        Ok((permit, start.elapsed()))
    }

    /// Runs one backend call under its permit and the call timeout.
    /// No retries: a timeout is reported to the caller as-is.
    pub async fn run<T, F>(&self, backend: Backend, call: F) -> Result<T, BackendError>
    where
        F: Future<Output = Result<T, BackendError>>,
    {
        let op = backend.as_str();
        let (_permit, waited) =
            Self::acquire_timed(self.semaphore(backend), self.acquire_timeout, op).await?;

        if waited > Duration::from_millis(100) {
            debug!("Waited {:?} for {} permit", waited, op);
        }

        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!("{} call exceeded {:?}", op, self.call_timeout);
                Err(BackendError::Timeout { op })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiters(acquire_ms: u64, call_secs: u64) -> BackendLimiters {
        BackendLimiters::new(&BackendConfig {
            call_timeout_seconds: call_secs,
            embedding_concurrency: 1,
            retrieval_concurrency: 1,
            generation_concurrency: 1,
            acquire_timeout_ms: acquire_ms,
        })
    }

    #[tokio::test]
    async fn test_run_passes_result_through() {
        let limiters = limiters(100, 1);
        let value = limiters
            .run(Backend::Embedding, async { Ok::<_, BackendError>(42) })
            .await
            .unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_call_times_out() {
        let limiters = limiters(100, 1);
        let result = limiters
            .run(Backend::Generation, async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, BackendError>(())
            })
            .await;
        assert_eq!(result, Err(BackendError::Timeout { op: "generation" }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_permits_report_overload() {
        let limiters = limiters(50, 30);
        let _held = limiters.retrieval.clone().acquire_owned().await.unwrap();

        let result = limiters
            .run(Backend::Retrieval, async { Ok::<_, BackendError>(()) })
            .await;
        assert_eq!(result, Err(BackendError::Overloaded { op: "retrieval" }));
    }
}
