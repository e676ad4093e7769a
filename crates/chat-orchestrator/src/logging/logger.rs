use flume::{bounded, Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::sink::ActivitySink;
use super::types::ActivityLog;

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// Max logs held in memory; further logs are dropped.
    pub queue_capacity: usize,

    pub batch_size: usize,

    /// Max wait before a partial batch is flushed (milliseconds)
    pub batch_timeout_ms: u64,

    pub worker_count: usize,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            batch_size: 100,
            batch_timeout_ms: 1000,
            worker_count: 2,
        }
    }
}

/// Fire-and-forget activity queue. Never blocks or fails the request path.
#[derive(Clone)]
pub struct ActivityLogger {
    sender: Sender<ActivityLog>,
}

impl ActivityLogger {
    /// Spawns the workers; must be called inside a tokio runtime.
    pub fn new(sink: Arc<dyn ActivitySink>, config: LoggerConfig) -> Self {
        let (sender, receiver) = bounded(config.queue_capacity.max(1));

        info!(
            "Initializing ActivityLogger: queue={}, batch={}, timeout={}ms, workers={}",
            config.queue_capacity, config.batch_size, config.batch_timeout_ms, config.worker_count
        );

        for worker_id in 0..config.worker_count.max(1) {
            let sink = sink.clone();
            let receiver = receiver.clone();
            let config = config.clone();

            tokio::spawn(async move {
                Self::worker_loop(worker_id, sink, receiver, config).await;
            });
        }

        Self { sender }
    }

    /// Log activity (non-blocking, fire-and-forget)
    pub fn log(&self, activity: ActivityLog) {
        if let Err(e) = self.sender.try_send(activity) {
            warn!("Failed to enqueue activity log (queue full?): {}", e);
        }
    }

    pub fn pending(&self) -> usize {
        self.sender.len()
    }

    async fn worker_loop(
        worker_id: usize,
        sink: Arc<dyn ActivitySink>,
        receiver: Receiver<ActivityLog>,
        config: LoggerConfig,
    ) {
        debug!("Activity worker {} started", worker_id);

        let batch_size = config.batch_size.max(1);
        let mut batch: Vec<ActivityLog> = Vec::with_capacity(batch_size);
        let batch_timeout = Duration::from_millis(config.batch_timeout_ms);

        loop {
            let deadline = tokio::time::Instant::now() + batch_timeout;

            while batch.len() < batch_size {
                match tokio::time::timeout_at(deadline, receiver.recv_async()).await {
                    Ok(Ok(log)) => batch.push(log),
                    Ok(Err(_)) => {
                        // Channel closed: flush and exit
                        if !batch.is_empty() {
                            Self::flush_batch(sink.as_ref(), &batch, worker_id).await;
                        }
                        debug!("Activity worker {} shutting down", worker_id);
                        return;
                    }
                    Err(_) => break,
                }
            }

            if batch.is_empty() {
                sleep(Duration::from_millis(100)).await;
            } else {
                Self::flush_batch(sink.as_ref(), &batch, worker_id).await;
                batch.clear();
            }
        }
    }

    async fn flush_batch(sink: &dyn ActivitySink, batch: &[ActivityLog], worker_id: usize) {
        let start = std::time::Instant::now();

        match sink.write_batch(batch).await {
            Ok(written) => debug!(
                "Worker {} wrote {} activity logs in {:?}",
                worker_id,
                written,
                start.elapsed()
            ),
            Err(e) => error!(
                "Worker {} failed to write {} activity logs: {:#}",
                worker_id,
                batch.len(),
                e
            ),
        }
    }
}
