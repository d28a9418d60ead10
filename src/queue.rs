//! At-least-once message queue abstraction.
//!
//! Polling never blocks: an empty queue returns `None` and the caller owns the
//! cadence. A polled message stays invisible to other consumers for the
//! visibility timeout and is redelivered unless acknowledged before then.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue does not exist: {0}")]
    QueueNotFound(String),

    #[error("Message {0} is no longer held by this consumer")]
    ReceiptMismatch(i64),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl QueueError {
    /// Connection-level failures that are worth retrying after a backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            QueueError::Transport(_) => true,
            QueueError::Database(sqlx::Error::Database(err)) => err
                .code()
                .is_some_and(|code| is_connection_sqlstate(&code)),
            QueueError::Database(err) => matches!(
                err,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
                    | sqlx::Error::Tls(_)
            ),
            _ => false,
        }
    }
}

/// SQLSTATEs a server sends while it is restarting, failing over or refusing
/// connections: class 08 (connection exception) and 57P01..57P03
/// (admin shutdown, crash shutdown, cannot connect now).
fn is_connection_sqlstate(code: &str) -> bool {
    code.starts_with("08") || code.starts_with("57P0")
}

/// A delivered message together with the receipt needed to acknowledge it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub id: i64,
    pub queue: String,
    pub payload: String,
    pub pop_receipt: Uuid,
    pub dequeue_count: i32,
    pub inserted_at: DateTime<Utc>,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Create the named queue unless it already exists.
    async fn create_if_absent(&self, queue: &str) -> QueueResult<()>;

    async fn poll(&self, queue: &str) -> QueueResult<Option<QueueMessage>>;

    /// Remove a delivered message for good.
    async fn acknowledge(&self, message: &QueueMessage) -> QueueResult<()>;

    async fn append(&self, queue: &str, payload: &str) -> QueueResult<()>;
}

#[async_trait]
impl<T: JobQueue + ?Sized> JobQueue for Arc<T> {
    async fn create_if_absent(&self, queue: &str) -> QueueResult<()> {
        (**self).create_if_absent(queue).await
    }

    async fn poll(&self, queue: &str) -> QueueResult<Option<QueueMessage>> {
        (**self).poll(queue).await
    }

    async fn acknowledge(&self, message: &QueueMessage) -> QueueResult<()> {
        (**self).acknowledge(message).await
    }

    async fn append(&self, queue: &str, payload: &str) -> QueueResult<()> {
        (**self).append(queue, payload).await
    }
}

#[derive(Debug, Clone)]
struct StoredMessage {
    queue: String,
    payload: String,
    inserted_at: DateTime<Utc>,
    visible_at: DateTime<Utc>,
    dequeue_count: i32,
    pop_receipt: Option<Uuid>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    queues: HashSet<String>,
    messages: BTreeMap<i64, StoredMessage>,
    next_id: i64,
}

/// Queue kept in process memory with the same delivery rules as the database queue.
#[derive(Debug, Clone)]
pub struct MemoryQueue {
    inner: Arc<Mutex<MemoryInner>>,
    visibility_timeout: Duration,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

impl MemoryQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            inner: Arc::default(),
            visibility_timeout,
        }
    }

    /// Payloads still held in `queue`, visible or not, oldest first.
    pub fn payloads(&self, queue: &str) -> Vec<String> {
        self.lock()
            .messages
            .values()
            .filter(|m| m.queue == queue)
            .map(|m| m.payload.clone())
            .collect()
    }

    /// Make every in-flight message visible again, as if its lease ran out.
    pub fn expire_leases(&self) {
        let now = Utc::now();
        for message in self.lock().messages.values_mut() {
            message.visible_at = now;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_exists(inner: &MemoryInner, queue: &str) -> QueueResult<()> {
        if inner.queues.contains(queue) {
            Ok(())
        } else {
            Err(QueueError::QueueNotFound(queue.to_string()))
        }
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn create_if_absent(&self, queue: &str) -> QueueResult<()> {
        self.lock().queues.insert(queue.to_string());
        Ok(())
    }

    async fn poll(&self, queue: &str) -> QueueResult<Option<QueueMessage>> {
        let mut inner = self.lock();
        Self::ensure_exists(&inner, queue)?;
        let now = Utc::now();
        let lease = ChronoDuration::from_std(self.visibility_timeout)
            .unwrap_or_else(|_| ChronoDuration::seconds(300));

        let Some((&id, message)) = inner
            .messages
            .iter_mut()
            .find(|(_, m)| m.queue == queue && m.visible_at <= now)
        else {
            return Ok(None);
        };

        let receipt = Uuid::new_v4();
        message.visible_at = now + lease;
        message.dequeue_count += 1;
        message.pop_receipt = Some(receipt);

        Ok(Some(QueueMessage {
            id,
            queue: message.queue.clone(),
            payload: message.payload.clone(),
            pop_receipt: receipt,
            dequeue_count: message.dequeue_count,
            inserted_at: message.inserted_at,
        }))
    }

    async fn acknowledge(&self, message: &QueueMessage) -> QueueResult<()> {
        let mut inner = self.lock();
        let held = inner.messages.get(&message.id).and_then(|m| m.pop_receipt);
        if held != Some(message.pop_receipt) {
            return Err(QueueError::ReceiptMismatch(message.id));
        }
        inner.messages.remove(&message.id);
        Ok(())
    }

    async fn append(&self, queue: &str, payload: &str) -> QueueResult<()> {
        let mut inner = self.lock();
        Self::ensure_exists(&inner, queue)?;
        let now = Utc::now();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.messages.insert(
            id,
            StoredMessage {
                queue: queue.to_string(),
                payload: payload.to_string(),
                inserted_at: now,
                visible_at: now,
                dequeue_count: 0,
                pop_receipt: None,
            },
        );
        Ok(())
    }
}
