use crate::queue::{JobQueue, QueueError, QueueMessage, QueueResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Executor;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, instrument};
use uuid::Uuid;

const FOREIGN_KEY_VIOLATION: &str = "23503";

// Key for `pg_advisory_xact_lock` serialising schema setup across processes.
const SCHEMA_LOCK_KEY: i64 = 0x7068_6f74_6f71;

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: i64,
    queue_name: String,
    payload: String,
    pop_receipt: Uuid,
    dequeue_count: i32,
    inserted_at: DateTime<Utc>,
}

impl From<MessageRow> for QueueMessage {
    fn from(row: MessageRow) -> Self {
        QueueMessage {
            id: row.id,
            queue: row.queue_name,
            payload: row.payload,
            pop_receipt: row.pop_receipt,
            dequeue_count: row.dequeue_count,
            inserted_at: row.inserted_at,
        }
    }
}

/// Queues stored in PostgreSQL tables.
///
/// The pool connects lazily, so constructing a handle never touches the
/// network; the first call to [`JobQueue::create_if_absent`] creates the schema.
#[derive(Clone)]
pub struct DbHandle {
    pool: Arc<PgPool>,
    visibility_timeout: Duration,
    schema_ready: Arc<OnceCell<()>>,
}

impl DbHandle {
    pub fn new(url: &str, visibility_timeout: Duration) -> QueueResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect_lazy(url)?;

        Ok(DbHandle {
            pool: Arc::new(pool),
            visibility_timeout,
            schema_ready: Arc::new(OnceCell::new()),
        })
    }

    /// Create the tables once per handle. Concurrent `CREATE ... IF NOT EXISTS`
    /// from several processes can still collide in the catalog, so the DDL runs
    /// under a transaction-scoped advisory lock.
    async fn ensure_schema(&self) -> QueueResult<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                let mut tx = self.pool.begin().await?;
                sqlx::query("SELECT pg_advisory_xact_lock($1)")
                    .bind(SCHEMA_LOCK_KEY)
                    .execute(&mut *tx)
                    .await?;
                (&mut *tx).execute(include_str!("setup.sql")).await?;
                tx.commit().await?;
                debug!("Queue schema ready");
                Ok::<(), QueueError>(())
            })
            .await?;
        Ok(())
    }

    async fn queue_exists(&self, queue: &str) -> QueueResult<bool> {
        Ok(sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM photoq_queues WHERE name = $1)",
        )
        .bind(queue)
        .fetch_one(&*self.pool)
        .await?)
    }
}

#[async_trait]
impl JobQueue for DbHandle {
    #[instrument(name = "db.create_if_absent", skip(self))]
    async fn create_if_absent(&self, queue: &str) -> QueueResult<()> {
        self.ensure_schema().await?;

        let created = sqlx::query(
            "INSERT INTO photoq_queues (name) VALUES ($1) \
            ON CONFLICT (name) DO NOTHING",
        )
        .bind(queue)
        .execute(&*self.pool)
        .await?
        .rows_affected();

        debug!(created = created > 0, "Queue ready");
        Ok(())
    }

    #[instrument(name = "db.poll", skip(self))]
    async fn poll(&self, queue: &str) -> QueueResult<Option<QueueMessage>> {
        let row = sqlx::query_as::<_, MessageRow>(
            "UPDATE photoq_messages \
                SET visible_at = now() + make_interval(secs => $2), \
                dequeue_count = dequeue_count + 1, \
                pop_receipt = $3 \
            WHERE id = ( \
                SELECT id FROM photoq_messages \
                WHERE queue_name = $1 AND visible_at <= now() \
                ORDER BY id \
                LIMIT 1 \
                FOR UPDATE SKIP LOCKED) \
            RETURNING id, queue_name, payload, pop_receipt, dequeue_count, inserted_at",
        )
        .bind(queue)
        .bind(self.visibility_timeout.as_secs_f64())
        .bind(Uuid::new_v4())
        .fetch_optional(&*self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(row.into())),
            // Only empty polls pay for the lookup.
            None if self.queue_exists(queue).await? => Ok(None),
            None => Err(QueueError::QueueNotFound(queue.to_string())),
        }
    }

    #[instrument(name = "db.acknowledge", skip_all, fields(message_id = message.id))]
    async fn acknowledge(&self, message: &QueueMessage) -> QueueResult<()> {
        let deleted = sqlx::query(
            "DELETE FROM photoq_messages \
            WHERE id = $1 AND pop_receipt = $2",
        )
        .bind(message.id)
        .bind(message.pop_receipt)
        .execute(&*self.pool)
        .await?
        .rows_affected();

        if deleted == 0 {
            return Err(QueueError::ReceiptMismatch(message.id));
        }
        Ok(())
    }

    #[instrument(name = "db.append", skip(self, payload))]
    async fn append(&self, queue: &str, payload: &str) -> QueueResult<()> {
        let result = sqlx::query(
            "INSERT INTO photoq_messages (queue_name, payload) \
            VALUES ($1, $2)",
        )
        .bind(queue)
        .bind(payload)
        .execute(&*self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(err))
                if err.code().as_deref() == Some(FOREIGN_KEY_VIOLATION) =>
            {
                Err(QueueError::QueueNotFound(queue.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Needs a disposable database:
    // PHOTOQ_TEST_DATABASE_URL=postgres://... cargo test -- --ignored
    #[tokio::test]
    #[ignore]
    async fn round_trip_against_postgres() {
        let url = std::env::var("PHOTOQ_TEST_DATABASE_URL").unwrap();
        let db = DbHandle::new(&url, Duration::from_secs(60)).unwrap();
        let queue = format!("test-{}", Uuid::new_v4());

        db.create_if_absent(&queue).await.unwrap();
        db.create_if_absent(&queue).await.unwrap();
        assert!(db.poll(&queue).await.unwrap().is_none());

        db.append(&queue, "hello").await.unwrap();
        let message = db.poll(&queue).await.unwrap().unwrap();
        assert_eq!(message.payload, "hello");
        assert_eq!(message.dequeue_count, 1);
        assert!(db.poll(&queue).await.unwrap().is_none());

        let mut stale = message.clone();
        stale.pop_receipt = Uuid::new_v4();
        assert!(matches!(
            db.acknowledge(&stale).await,
            Err(QueueError::ReceiptMismatch(_))
        ));
        db.acknowledge(&message).await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn poll_of_missing_queue_is_reported() {
        let url = std::env::var("PHOTOQ_TEST_DATABASE_URL").unwrap();
        let db = DbHandle::new(&url, Duration::from_secs(60)).unwrap();
        db.create_if_absent("anything").await.unwrap();

        assert!(matches!(
            db.poll(&format!("never-created-{}", Uuid::new_v4())).await,
            Err(QueueError::QueueNotFound(_))
        ));
    }

    #[tokio::test]
    #[ignore]
    async fn concurrent_bootstrap_from_many_handles() {
        let url = std::env::var("PHOTOQ_TEST_DATABASE_URL").unwrap();
        let queue = format!("test-{}", Uuid::new_v4());
        let handles: Vec<DbHandle> = (0..8)
            .map(|_| DbHandle::new(&url, Duration::from_secs(60)).unwrap())
            .collect();

        let results = futures::future::join_all(
            handles.iter().map(|db| db.create_if_absent(&queue)),
        )
        .await;

        for result in results {
            result.unwrap();
        }
        assert!(handles[0].poll(&queue).await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore]
    async fn append_to_missing_queue_is_reported() {
        let url = std::env::var("PHOTOQ_TEST_DATABASE_URL").unwrap();
        let db = DbHandle::new(&url, Duration::from_secs(60)).unwrap();
        db.create_if_absent("anything").await.unwrap();

        assert!(matches!(
            db.append("never-created", "x").await,
            Err(QueueError::QueueNotFound(_))
        ));
    }
}
