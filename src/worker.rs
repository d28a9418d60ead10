use crate::job::ResizeJob;
use crate::notify::{MediaService, NotifyError, ResizedUris};
use crate::queue::{JobQueue, QueueMessage};
use crate::resize::{self, ResizeError, ResizeResult};
use crate::storage::{ObjectStore, StorageError};
use crate::{status_payload, SizeClass};
use anyhow::Error;
use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinError;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Span};

/// How a single step of a job ended.
///
/// Nothing inside a job is fatal to the worker: a failed step is logged and
/// the job moves on according to the decision table in [`Pipeline::process`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Done,
    Skipped,
    Failed(String),
}

impl StepOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, StepOutcome::Done)
    }

    fn from_result<E: fmt::Display>(result: Result<(), E>) -> Self {
        match result {
            Ok(()) => StepOutcome::Done,
            Err(err) => StepOutcome::Failed(err.to_string()),
        }
    }
}

/// Step by step record of what happened to one queue message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub message_id: i64,
    pub media_id: Option<i64>,
    pub decode: StepOutcome,
    pub variants: Vec<(SizeClass, StepOutcome)>,
    pub notify: StepOutcome,
    pub status: StepOutcome,
    pub cleanup: StepOutcome,
    pub acknowledge: StepOutcome,
}

impl JobReport {
    fn new(message_id: i64) -> Self {
        JobReport {
            message_id,
            media_id: None,
            decode: StepOutcome::Skipped,
            variants: Vec::with_capacity(SizeClass::PROCESSING_ORDER.len()),
            notify: StepOutcome::Skipped,
            status: StepOutcome::Skipped,
            cleanup: StepOutcome::Skipped,
            acknowledge: StepOutcome::Skipped,
        }
    }

    pub fn variant(&self, size: SizeClass) -> Option<&StepOutcome> {
        self.variants
            .iter()
            .find(|(s, _)| *s == size)
            .map(|(_, outcome)| outcome)
    }

    /// Every step completed.
    pub fn is_clean(&self) -> bool {
        self.decode.is_done()
            && self.variants.iter().all(|(_, o)| o.is_done())
            && self.notify.is_done()
            && self.status.is_done()
            && self.cleanup.is_done()
            && self.acknowledge.is_done()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VariantError {
    #[error("reading original: {0}")]
    Read(#[source] StorageError),

    #[error(transparent)]
    Resize(#[from] ResizeError),

    #[error("resize task aborted: {0}")]
    Aborted(#[from] JoinError),

    #[error("writing variant: {0}")]
    Write(#[source] StorageError),
}

impl VariantError {
    /// Storage backend or network failure rather than a bad token or image.
    pub fn is_transient(&self) -> bool {
        match self {
            VariantError::Read(err) | VariantError::Write(err) => err.is_transient(),
            _ => false,
        }
    }
}

/// Everything needed to take one job from the queue to completion.
pub struct Pipeline<Q, S, N> {
    queue: Q,
    store: S,
    media: N,
    status_queue: String,
}

impl<Q, S, N> Pipeline<Q, S, N>
where
    Q: JobQueue,
    S: ObjectStore,
    N: MediaService,
{
    pub fn new(queue: Q, store: S, media: N, status_queue: impl Into<String>) -> Self {
        Pipeline {
            queue,
            store,
            media,
            status_queue: status_queue.into(),
        }
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    /// Run every step for one delivered message.
    ///
    /// | step | on failure |
    /// |---|---|
    /// | decode | acknowledge and drop, no object access |
    /// | variant | next size class still runs |
    /// | notify | status skipped, cleanup and ack still run |
    /// | status, cleanup | later steps still run |
    /// | acknowledge | message is redelivered after its lease |
    #[instrument(skip_all, fields(message_id = message.id, media_id = tracing::field::Empty))]
    pub async fn process(&self, message: &QueueMessage) -> JobReport {
        let mut report = JobReport::new(message.id);

        let job = match ResizeJob::decode(&message.payload) {
            Ok(job) => {
                report.decode = StepOutcome::Done;
                job
            }
            Err(err) => {
                warn!(
                    error = %err,
                    queue = %message.queue,
                    dequeue_count = message.dequeue_count,
                    age_secs = (Utc::now() - message.inserted_at).num_seconds(),
                    "Dropping malformed job"
                );
                report.decode = StepOutcome::Failed(err.to_string());
                report.acknowledge = self.acknowledge(message).await;
                return report;
            }
        };
        report.media_id = Some(job.media_id);
        Span::current().record("media_id", job.media_id);

        let mut original: Option<Arc<Vec<u8>>> = None;
        for size in SizeClass::PROCESSING_ORDER {
            let outcome = match self.produce_variant(&job, size, &mut original).await {
                Ok(result) => {
                    debug!(
                        %size,
                        width = result.width,
                        height = result.height,
                        "Variant written"
                    );
                    StepOutcome::Done
                }
                Err(err) => {
                    error!(
                        %size,
                        error = %err,
                        transient = err.is_transient(),
                        "Variant failed"
                    );
                    StepOutcome::Failed(err.to_string())
                }
            };
            report.variants.push((size, outcome));
        }

        // Status is only emitted once the media service has taken the update.
        match self.notify(&job).await {
            Ok(()) => {
                report.notify = StepOutcome::Done;
                report.status = StepOutcome::from_result(
                    self.queue
                        .append(&self.status_queue, &status_payload(job.media_id))
                        .await,
                );
                if let StepOutcome::Failed(err) = &report.status {
                    error!(error = %err, "Failed to emit status message");
                }
            }
            Err(err) => {
                error!(error = %err, "Failed to notify media service");
                report.notify = StepOutcome::Failed(err.to_string());
            }
        }

        report.cleanup =
            StepOutcome::from_result(self.store.delete_if_exists(&job.source_delete).await);
        if let StepOutcome::Failed(err) = &report.cleanup {
            warn!(error = %err, "Failed to delete original");
        }

        report.acknowledge = self.acknowledge(message).await;
        report
    }

    async fn produce_variant(
        &self,
        job: &ResizeJob,
        size: SizeClass,
        original: &mut Option<Arc<Vec<u8>>>,
    ) -> Result<ResizeResult, VariantError> {
        let source = match original.clone() {
            Some(bytes) => bytes,
            None => {
                let bytes = Arc::new(
                    self.store
                        .read_all(&job.source_read)
                        .await
                        .map_err(VariantError::Read)?,
                );
                *original = Some(bytes.clone());
                bytes
            }
        };

        let result = tokio::task::spawn_blocking(move || resize::resize(&source, size)).await??;
        self.store
            .write_all(job.destination_write.get(size), result.bytes.clone())
            .await
            .map_err(VariantError::Write)?;
        Ok(result)
    }

    async fn notify(&self, job: &ResizeJob) -> Result<(), NotifyError> {
        let uris = ResizedUris {
            media_id: job.media_id,
            large_uri: job.destinations.large.clone(),
            medium_uri: job.destinations.medium.clone(),
            thumbnail_uri: job.destinations.thumbnail.clone(),
        };
        self.media.update_resized_photo_blob_uris(&uris).await
    }

    async fn acknowledge(&self, message: &QueueMessage) -> StepOutcome {
        let outcome = StepOutcome::from_result(self.queue.acknowledge(message).await);
        if let StepOutcome::Failed(err) = &outcome {
            error!(error = %err, "Failed to acknowledge job message");
        }
        outcome
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub job_queue: String,
    /// Sleep after an empty poll.
    pub idle_wait: Duration,
    /// Sleep after a transport failure while polling.
    pub transport_backoff: Duration,
    /// Stop after this many loop iterations; `None` runs until cancelled.
    pub max_iterations: Option<u64>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            job_queue: "resize-jobs".into(),
            idle_wait: Duration::from_secs(1),
            transport_backoff: Duration::from_secs(5),
            max_iterations: None,
        }
    }
}

/// Poll and process jobs until cancelled. Returns the number of jobs processed.
///
/// A job already in progress is always finished before the loop observes
/// cancellation. Transient poll failures are retried after the transport
/// backoff; any other poll failure stops the worker.
pub async fn start<Q, S, N>(
    cancel_token: CancellationToken,
    pipeline: Arc<Pipeline<Q, S, N>>,
    config: WorkerConfig,
) -> Result<u64, Error>
where
    Q: JobQueue,
    S: ObjectStore,
    N: MediaService,
{
    let mut iterations = 0u64;
    let mut processed = 0u64;

    loop {
        if cancel_token.is_cancelled() {
            debug!("Worker Cancelled");
            break;
        }
        if config.max_iterations.is_some_and(|max| iterations >= max) {
            break;
        }
        iterations += 1;

        match pipeline.queue().poll(&config.job_queue).await {
            Ok(Some(message)) => {
                let report = pipeline.process(&message).await;
                processed += 1;
                if report.is_clean() {
                    info!(
                        message_id = report.message_id,
                        media_id = ?report.media_id,
                        "Job completed"
                    );
                } else {
                    warn!(report = ?report, "Job completed with failed steps");
                }
            }
            Ok(None) => {
                if !pause(&cancel_token, config.idle_wait).await {
                    debug!("Worker Cancelled");
                    break;
                }
            }
            Err(err) if err.is_transient() => {
                warn!(
                    error = %err,
                    backoff = ?config.transport_backoff,
                    "Queue unavailable, backing off"
                );
                if !pause(&cancel_token, config.transport_backoff).await {
                    debug!("Worker Cancelled");
                    break;
                }
            }
            Err(err) => {
                error!(message = "Error polling job queue, exiting", error = ?err);
                return Err(err.into());
            }
        }
    }

    info!(processed, "Worker stopped.");
    Ok(processed)
}

/// Sleep unless cancelled first; returns `false` on cancellation.
async fn pause(cancel_token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel_token.cancelled() => false,
        _ = sleep(duration) => true,
    }
}
