use crate::notify::MediaService;
use crate::queue::JobQueue;
use crate::storage::ObjectStore;
use crate::worker::{self, Pipeline, WorkerConfig};
use anyhow::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::*;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub worker: WorkerConfig,
    pub status_queue: String,
    /// Independent worker loops sharing the same queue handles.
    pub workers_count: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            worker: WorkerConfig::default(),
            status_queue: "resize-status".into(),
            workers_count: 1,
        }
    }
}

/// Make sure every queue in `names` exists.
///
/// Transient failures are retried forever with a fixed `backoff`; anything
/// else is returned. Yields `false` if cancelled before the queues are ready.
pub async fn bootstrap_queues<Q: JobQueue>(
    cancel_token: &CancellationToken,
    queue: &Q,
    names: &[&str],
    backoff: Duration,
) -> Result<bool, Error> {
    for name in names {
        loop {
            match queue.create_if_absent(name).await {
                Ok(()) => {
                    debug!(queue = %name, "Queue ready");
                    break;
                }
                Err(err) if err.is_transient() => {
                    warn!(
                        queue = %name,
                        error = %err,
                        backoff = ?backoff,
                        "Queue store unavailable, retrying"
                    );
                    tokio::select! {
                        _ = cancel_token.cancelled() => return Ok(false),
                        _ = sleep(backoff) => {},
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
    Ok(true)
}

pub async fn serve<Q, S, N>(
    cancel_token: CancellationToken,
    config: ServerConfig,
    queue: Q,
    store: S,
    media: N,
) -> Result<(), Error>
where
    Q: JobQueue + 'static,
    S: ObjectStore + 'static,
    N: MediaService + 'static,
{
    let names = [config.worker.job_queue.as_str(), config.status_queue.as_str()];
    let backoff = config.worker.transport_backoff;
    if !bootstrap_queues(&cancel_token, &queue, &names, backoff).await? {
        info!("Server cancelled during bootstrap.");
        return Ok(());
    }

    let pipeline = Arc::new(Pipeline::new(queue, store, media, config.status_queue.clone()));

    let mut workers = vec![];
    for id in 0..config.workers_count {
        let cancel_token = cancel_token.clone();
        let pipeline = pipeline.clone();
        let worker_config = config.worker.clone();
        let join_handle = tokio::spawn(
            async move {
                let result = worker::start(cancel_token.clone(), pipeline, worker_config).await;
                if result.is_err() {
                    // One worker hit a fatal queue error; stop the others too.
                    cancel_token.cancel();
                }
                result
            }
            .instrument(info_span!("worker", id)),
        );
        workers.push(join_handle);
    }

    // Wait for all workers to complete
    let mut processed = 0;
    let mut first_error = None;
    for result in futures::future::join_all(workers).await {
        match result? {
            Ok(count) => processed += count,
            Err(err) => {
                first_error.get_or_insert(err);
            }
        }
    }

    info!(processed, "Server stopped.");

    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::MemoryMediaService;
    use crate::queue::{MemoryQueue, QueueError, QueueMessage, QueueResult};
    use crate::storage::MemoryObjectStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Rejects queue creation `transient` times, then fails hard if `fatal`.
    struct StubbornQueue {
        inner: MemoryQueue,
        transient: AtomicU32,
        fatal: bool,
    }

    #[async_trait]
    impl JobQueue for StubbornQueue {
        async fn create_if_absent(&self, queue: &str) -> QueueResult<()> {
            if self.transient.load(Ordering::SeqCst) > 0 {
                self.transient.fetch_sub(1, Ordering::SeqCst);
                return Err(QueueError::Transport("refused".into()));
            }
            if self.fatal {
                return Err(QueueError::QueueNotFound(queue.into()));
            }
            self.inner.create_if_absent(queue).await
        }

        async fn poll(&self, queue: &str) -> QueueResult<Option<QueueMessage>> {
            self.inner.poll(queue).await
        }

        async fn acknowledge(&self, message: &QueueMessage) -> QueueResult<()> {
            self.inner.acknowledge(message).await
        }

        async fn append(&self, queue: &str, payload: &str) -> QueueResult<()> {
            self.inner.append(queue, payload).await
        }
    }

    fn stubborn(transient: u32, fatal: bool) -> StubbornQueue {
        StubbornQueue {
            inner: MemoryQueue::default(),
            transient: AtomicU32::new(transient),
            fatal,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn bootstrap_retries_transient_failures() {
        let queue = stubborn(3, false);
        let started = tokio::time::Instant::now();

        let ready = bootstrap_queues(
            &CancellationToken::new(),
            &queue,
            &["jobs", "status"],
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert!(ready);
        assert!(started.elapsed() >= Duration::from_secs(15));
        queue.inner.append("status", "1").await.unwrap();
    }

    #[tokio::test]
    async fn bootstrap_fails_on_other_errors() {
        let queue = stubborn(0, true);
        let result = bootstrap_queues(
            &CancellationToken::new(),
            &queue,
            &["jobs"],
            Duration::from_secs(5),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn bootstrap_stops_when_cancelled() {
        let queue = stubborn(u32::MAX, false);
        let token = CancellationToken::new();
        let task = {
            let token = token.clone();
            tokio::spawn(async move {
                bootstrap_queues(&token, &queue, &["jobs"], Duration::from_secs(5)).await
            })
        };

        tokio::time::sleep(Duration::from_secs(12)).await;
        token.cancel();
        assert!(!task.await.unwrap().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn serve_runs_workers_until_cancelled() {
        let token = CancellationToken::new();
        let queue = MemoryQueue::default();
        let config = ServerConfig {
            worker: WorkerConfig {
                job_queue: "jobs".into(),
                ..WorkerConfig::default()
            },
            status_queue: "status".into(),
            workers_count: 3,
        };

        let server = tokio::spawn(serve(
            token.clone(),
            config,
            queue.clone(),
            MemoryObjectStore::new(),
            MemoryMediaService::new(),
        ));

        tokio::time::sleep(Duration::from_secs(10)).await;
        token.cancel();
        server.await.unwrap().unwrap();

        // Both queues were created during bootstrap.
        queue.append("jobs", "x").await.unwrap();
        queue.append("status", "x").await.unwrap();
    }
}
