use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, error, info, warn};
use wq_common::{
    headers, AdditionalMessageData, CorrelationId, HeartBeatStatus, Headers, Message, MessageId,
    ReceivedMessage,
};

use crate::context::{CommitHook, RollbackHook};
use crate::{
    ErrorRouter, ExpiredMessageStore, HeartBeatMonitorStore, HeartBeatSender, MessageContext,
    MessageReceiver, MessageReceiverAsync, MessageSender, PoisonMessageHandler, QueueStatus,
    QueueStatusProvider, Result, RollbackReason, Transport, TransportError,
};

const STATUS_WAITING: i64 = 0;
const STATUS_PROCESSING: i64 = 1;

/// Set the first time a receive finds the queue tables missing; later
/// occurrences log at debug only
static LOGGED_MISSING_DATABASE: AtomicBool = AtomicBool::new(false);

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

fn is_missing_schema(e: &sqlx::Error) -> bool {
    e.to_string().contains("no such table")
}

/// SQLite-backed work queue.
///
/// The engine's collaborator traits are synchronous; each call is driven on
/// the runtime captured at construction. Call them from plain threads (the
/// consumer's workers) or from a multi-threaded runtime.
#[derive(Clone)]
pub struct SqliteTransport {
    pool: SqlitePool,
    queue_name: String,
    runtime: Handle,
}

impl SqliteTransport {
    /// Must be called from within a tokio runtime, whose handle is kept
    pub fn new(pool: SqlitePool, queue_name: impl Into<String>) -> Self {
        Self {
            pool,
            queue_name: queue_name.into(),
            runtime: Handle::current(),
        }
    }

    /// Open (or create) the database at `url` and initialize the schema
    pub async fn connect(url: &str, queue_name: impl Into<String>) -> Result<Self> {
        let options = if url.contains(":memory:") {
            // Every connection to an in-memory database is a separate database
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = options.connect(url).await?;

        let transport = Self::new(pool, queue_name);
        transport.init_schema().await?;
        Ok(transport)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the queue tables
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS wq_messages (
                id TEXT PRIMARY KEY,
                queue_name TEXT NOT NULL,
                correlation_id TEXT NOT NULL,
                body BLOB NOT NULL,
                headers TEXT NOT NULL,
                route TEXT,
                status INTEGER NOT NULL DEFAULT 0,
                retry_count INTEGER NOT NULL DEFAULT 0,
                enqueued_at INTEGER NOT NULL,
                visible_at INTEGER NOT NULL,
                expires_at INTEGER,
                heartbeat_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Index for efficient polling
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_wq_messages_poll
            ON wq_messages (queue_name, status, visible_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS wq_error_messages (
                id TEXT PRIMARY KEY,
                queue_name TEXT NOT NULL,
                correlation_id TEXT NOT NULL,
                body BLOB NOT NULL,
                headers TEXT NOT NULL,
                retry_count INTEGER NOT NULL,
                reason TEXT NOT NULL,
                failed_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!(queue = %self.queue_name, "SQLite queue schema initialized");
        Ok(())
    }

    fn block_on<F: Future>(&self, future: F) -> F::Output {
        block_on(&self.runtime, future)
    }

    async fn receive_inner(&self, context: &mut MessageContext) -> Result<Option<ReceivedMessage>> {
        let now = Utc::now().timestamp_millis();
        let row = sqlx::query(
            r#"
            UPDATE wq_messages
            SET status = ?, heartbeat_at = ?
            WHERE id = (
                SELECT id FROM wq_messages
                WHERE queue_name = ? AND status = ? AND visible_at <= ?
                  AND (expires_at IS NULL OR expires_at > ?)
                ORDER BY enqueued_at, rowid
                LIMIT 1
            )
            RETURNING id, correlation_id, body, headers, retry_count, enqueued_at
            "#,
        )
        .bind(STATUS_PROCESSING)
        .bind(now)
        .bind(&self.queue_name)
        .bind(STATUS_WAITING)
        .bind(now)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| self.receive_error(e))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let id: String = row
            .try_get("id")
            .map_err(|e| TransportError::Receive(e.to_string()))?;
        let id = MessageId::new(id);
        context.set_message_id(id.clone());
        context.register_rollback(self.rollback_hook(id.clone()));
        let message = match decode_row(&row, id.clone()) {
            Ok(message) => message,
            Err(reason) => {
                warn!(queue = %self.queue_name, message_id = %id, %reason, "Received unreadable message");
                return Err(TransportError::poison(Some(id), reason));
            }
        };

        debug!(
            queue = %self.queue_name,
            message_id = %message.id,
            retry_count = message.retry_count,
            "Received message"
        );

        context.set_message(&message);
        context.register_commit(self.commit_hook(message.id.clone()));
        Ok(Some(message))
    }

    fn receive_error(&self, e: sqlx::Error) -> TransportError {
        if is_missing_schema(&e) {
            if !LOGGED_MISSING_DATABASE.swap(true, Ordering::Relaxed) {
                error!(
                    queue = %self.queue_name,
                    error = %e,
                    "Queue tables are missing; was the schema initialized?"
                );
            } else {
                debug!(queue = %self.queue_name, "Queue tables are still missing");
            }
        }
        TransportError::Receive(e.to_string())
    }

    fn commit_hook(&self, id: MessageId) -> CommitHook {
        let pool = self.pool.clone();
        let runtime = self.runtime.clone();
        Box::new(move || {
            let result = block_on(&runtime, async {
                sqlx::query("DELETE FROM wq_messages WHERE id = ? AND status = ?")
                    .bind(id.as_str())
                    .bind(STATUS_PROCESSING)
                    .execute(&pool)
                    .await
            })
            .map_err(|e| TransportError::Commit(e.to_string()))?;

            if result.rows_affected() == 0 {
                return Err(TransportError::Commit(format!(
                    "message {id} is no longer held by this consumer"
                )));
            }
            debug!(message_id = %id, "Message committed");
            Ok(())
        })
    }

    fn rollback_hook(&self, id: MessageId) -> RollbackHook {
        let pool = self.pool.clone();
        let runtime = self.runtime.clone();
        Box::new(move |reason| {
            let now = Utc::now().timestamp_millis();
            let (visible_at, increment) = match reason {
                RollbackReason::Retry { delay } => (now.saturating_add(millis(delay)), 1),
                RollbackReason::Abandon => (now, 0),
            };
            block_on(&runtime, async {
                sqlx::query(
                    r#"
                    UPDATE wq_messages
                    SET status = ?, heartbeat_at = NULL, visible_at = ?, retry_count = retry_count + ?
                    WHERE id = ? AND status = ?
                    "#,
                )
                .bind(STATUS_WAITING)
                .bind(visible_at)
                .bind(increment)
                .bind(id.as_str())
                .bind(STATUS_PROCESSING)
                .execute(&pool)
                .await
            })?;
            debug!(message_id = %id, ?reason, "Message rolled back");
            Ok(())
        })
    }

    async fn move_to_errors(&self, id: &MessageId, reason: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let moved = sqlx::query(
            r#"
            INSERT OR REPLACE INTO wq_error_messages
                (id, queue_name, correlation_id, body, headers, retry_count, reason, failed_at)
            SELECT id, queue_name, correlation_id, body, headers, retry_count, ?, ?
            FROM wq_messages WHERE id = ?
            "#,
        )
        .bind(reason)
        .bind(Utc::now().timestamp_millis())
        .bind(id.as_str())
        .execute(&mut *tx)
        .await?;

        if moved.rows_affected() == 0 {
            return Err(TransportError::NotFound(id.to_string()));
        }

        sqlx::query("DELETE FROM wq_messages WHERE id = ?")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        info!(queue = %self.queue_name, message_id = %id, %reason, "Message moved to error store");
        Ok(())
    }

    async fn insert(&self, message: Message, data: &AdditionalMessageData) -> Result<MessageId> {
        let id = MessageId::generate();
        let correlation_id = data.correlation_id.clone().unwrap_or_default();
        let now = Utc::now().timestamp_millis();

        let mut message_headers = message.headers;
        message_headers.extend(data.headers.clone());
        message_headers.insert(headers::CORRELATION_ID.to_string(), correlation_id.to_string());
        if let Some(route) = &data.route {
            message_headers.insert(headers::ROUTE.to_string(), route.clone());
        }

        sqlx::query(
            r#"
            INSERT INTO wq_messages
                (id, queue_name, correlation_id, body, headers, route, status, enqueued_at, visible_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id.as_str())
        .bind(&self.queue_name)
        .bind(correlation_id.as_str())
        .bind(&message.body)
        .bind(serde_json::to_string(&message_headers)?)
        .bind(data.route.as_deref())
        .bind(STATUS_WAITING)
        .bind(now)
        .bind(now.saturating_add(data.delay.map(millis).unwrap_or(0)))
        .bind(data.expiration.map(|e| now.saturating_add(millis(e))))
        .execute(&self.pool)
        .await?;

        debug!(queue = %self.queue_name, message_id = %id, "Message enqueued");
        Ok(id)
    }

    async fn count_where(&self, table: &str, status: Option<i64>) -> Result<u64> {
        let sql = match status {
            Some(_) => format!("SELECT COUNT(*) FROM {table} WHERE queue_name = ? AND status = ?"),
            None => format!("SELECT COUNT(*) FROM {table} WHERE queue_name = ?"),
        };
        let mut query = sqlx::query_scalar::<_, i64>(&sql).bind(&self.queue_name);
        if let Some(status) = status {
            query = query.bind(status);
        }
        let count = query.fetch_one(&self.pool).await?;
        Ok(count.max(0) as u64)
    }
}

/// Drive `future` to completion from synchronous code
fn block_on<F: Future>(runtime: &Handle, future: F) -> F::Output {
    match Handle::try_current() {
        Ok(current) if current.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(|| runtime.block_on(future))
        }
        _ => runtime.block_on(future),
    }
}

fn decode_row(row: &SqliteRow, id: MessageId) -> std::result::Result<ReceivedMessage, String> {
    let raw_headers: String = row.try_get("headers").map_err(|e| e.to_string())?;
    let headers: Headers =
        serde_json::from_str(&raw_headers).map_err(|e| format!("invalid headers: {e}"))?;
    let correlation_id: String = row.try_get("correlation_id").map_err(|e| e.to_string())?;
    let body: Vec<u8> = row.try_get("body").map_err(|e| e.to_string())?;
    let retry_count: i64 = row.try_get("retry_count").map_err(|e| e.to_string())?;
    let enqueued_at: i64 = row.try_get("enqueued_at").map_err(|e| e.to_string())?;

    Ok(ReceivedMessage {
        id,
        correlation_id: CorrelationId::new(correlation_id),
        body,
        headers,
        retry_count: u32::try_from(retry_count).unwrap_or(u32::MAX),
        enqueued_at: from_millis(enqueued_at),
    })
}

impl MessageReceiver for SqliteTransport {
    fn receive(&self, context: &mut MessageContext) -> Result<Option<ReceivedMessage>> {
        self.block_on(self.receive_inner(context))
    }
}

#[async_trait]
impl MessageReceiverAsync for SqliteTransport {
    async fn receive_async(&self, context: &mut MessageContext) -> Result<Option<ReceivedMessage>> {
        self.receive_inner(context).await
    }
}

impl HeartBeatSender for SqliteTransport {
    fn send(&self, message_id: &MessageId) -> Result<HeartBeatStatus> {
        let now = Utc::now();
        let result = self.block_on(async {
            sqlx::query("UPDATE wq_messages SET heartbeat_at = ? WHERE id = ? AND status = ?")
                .bind(now.timestamp_millis())
                .bind(message_id.as_str())
                .bind(STATUS_PROCESSING)
                .execute(&self.pool)
                .await
        })?;

        let last_heartbeat = (result.rows_affected() > 0).then_some(now);
        Ok(HeartBeatStatus::new(message_id.clone(), last_heartbeat))
    }
}

impl PoisonMessageHandler for SqliteTransport {
    fn handle(&self, context: &MessageContext, error: &TransportError) -> Result<()> {
        let id = match (context.message_id(), error) {
            (Some(id), _) => id.clone(),
            (None, TransportError::Poison { message_id: Some(id), .. }) => id.clone(),
            _ => return Err(TransportError::NotFound("poison message without id".to_string())),
        };
        self.block_on(self.move_to_errors(&id, &error.to_string()))
    }
}

impl ErrorRouter for SqliteTransport {
    fn message_failed_processing(
        &self,
        message: &ReceivedMessage,
        _context: &MessageContext,
        reason: &str,
    ) -> Result<()> {
        self.block_on(self.move_to_errors(&message.id, reason))
    }
}

impl MessageSender for SqliteTransport {
    fn send(&self, message: Message, data: &AdditionalMessageData) -> Result<MessageId> {
        self.block_on(self.insert(message, data))
    }

    fn send_batch(&self, messages: Vec<(Message, AdditionalMessageData)>) -> Result<Vec<MessageId>> {
        self.block_on(async {
            let mut ids = Vec::with_capacity(messages.len());
            for (message, data) in messages {
                ids.push(self.insert(message, &data).await?);
            }
            Ok(ids)
        })
    }
}

impl HeartBeatMonitorStore for SqliteTransport {
    fn reset_expired_heartbeats(&self, older_than: Duration) -> Result<usize> {
        let now = Utc::now().timestamp_millis();
        let cutoff = now.saturating_sub(millis(older_than));
        let result = self.block_on(async {
            sqlx::query(
                r#"
                UPDATE wq_messages
                SET status = ?, heartbeat_at = NULL, visible_at = ?
                WHERE queue_name = ? AND status = ? AND heartbeat_at < ?
                "#,
            )
            .bind(STATUS_WAITING)
            .bind(now)
            .bind(&self.queue_name)
            .bind(STATUS_PROCESSING)
            .bind(cutoff)
            .execute(&self.pool)
            .await
        })?;
        Ok(result.rows_affected() as usize)
    }
}

impl ExpiredMessageStore for SqliteTransport {
    fn clear_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let result = self.block_on(async {
            sqlx::query(
                r#"
                DELETE FROM wq_messages
                WHERE queue_name = ? AND status = ? AND expires_at IS NOT NULL AND expires_at <= ?
                "#,
            )
            .bind(&self.queue_name)
            .bind(STATUS_WAITING)
            .bind(now.timestamp_millis())
            .execute(&self.pool)
            .await
        })?;
        Ok(result.rows_affected() as usize)
    }
}

impl QueueStatusProvider for SqliteTransport {
    fn status(&self) -> Result<QueueStatus> {
        self.block_on(async {
            Ok(QueueStatus {
                queue_name: self.queue_name.clone(),
                waiting: self.count_where("wq_messages", Some(STATUS_WAITING)).await?,
                processing: self.count_where("wq_messages", Some(STATUS_PROCESSING)).await?,
                error: self.count_where("wq_error_messages", None).await?,
            })
        })
    }
}

impl Transport for SqliteTransport {
    fn queue_name(&self) -> &str {
        &self.queue_name
    }
}
