//! # PgQueue
//!
//! A job queue adapter backed by the pgmq PostgreSQL extension: messages are
//! delivered at most once per visibility-timeout window, re-sent with a delay
//! for retries, and archived on terminal failure.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;
use tracing::{info, warn};

/// Enumeration of errors for operations with PgQueue.
/// Errors that can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("job envelope could not be serialized: {0}")]
    EnvelopeError(#[from] serde_json::Error),
}

pub type QueueResult<T> = std::result::Result<T, QueueError>;

fn default_priority() -> i32 {
    1
}

fn default_status() -> String {
    "queued".to_owned()
}

/// The JSON envelope stored in the broker for every queued job. The payload
/// and config blobs are opaque to the worker core; only the routing and
/// accounting fields are interpreted here.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub job_type: String,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<String>,
    #[serde(default)]
    pub attempts: i32,
    pub max_attempts: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_trace: Option<String>,
}

impl JobEnvelope {
    /// Whether the envelope's scheduled time has arrived. A missing or
    /// malformed timestamp does not hold a job back.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        match self.parsed_schedule() {
            Some(Ok(scheduled)) => scheduled <= now,
            _ => true,
        }
    }

    /// True when `scheduled_at` is present but unparseable.
    pub fn has_malformed_schedule(&self) -> bool {
        matches!(self.parsed_schedule(), Some(Err(_)))
    }

    fn parsed_schedule(&self) -> Option<Result<DateTime<Utc>, chrono::ParseError>> {
        self.scheduled_at
            .as_deref()
            .map(|raw| DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc)))
    }
}

/// A NewJob to be enqueued into a PgQueue.
#[derive(Clone, Debug)]
pub struct NewJob {
    pub job_type: String,
    /// The JSON payload interpreted by the message handler, not by us.
    pub payload: serde_json::Value,
    pub priority: i32,
    pub user_id: Option<String>,
    /// Seconds before the broker makes the message visible.
    pub delay_seconds: u32,
    /// Per-message override of the queue's default.
    pub max_attempts: Option<i32>,
    pub config: serde_json::Value,
}

impl NewJob {
    pub fn new(job_type: &str, payload: serde_json::Value) -> Self {
        Self {
            job_type: job_type.to_owned(),
            payload,
            priority: default_priority(),
            user_id: None,
            delay_seconds: 0,
            max_attempts: None,
            config: serde_json::Value::Object(Default::default()),
        }
    }
}

/// A job leased from the queue for one processing attempt.
#[derive(Clone, Debug)]
pub struct JobHandle {
    /// Printable form of the broker message id.
    pub id: String,
    /// The broker message id, when the broker assigned one.
    pub msg_id: Option<i64>,
    pub queue_name: String,
    pub worker_id: String,
    /// Attempt count for this lease, already incremented.
    pub attempts: i32,
    pub max_attempts: i32,
    pub started_at: DateTime<Utc>,
    /// The envelope as read from the broker.
    pub envelope: JobEnvelope,
}

impl JobHandle {
    pub fn job_type(&self) -> &str {
        &self.envelope.job_type
    }

    pub fn user_id(&self) -> Option<&str> {
        self.envelope.user_id.as_deref()
    }

    pub fn payload(&self) -> serde_json::Value {
        parse_json_field(&self.envelope.payload)
    }

    pub fn config(&self) -> serde_json::Value {
        parse_json_field(&self.envelope.config)
    }
}

/// Producers sometimes double-encode nested blobs as JSON strings. Decode
/// those transparently; anything else passes through untouched.
fn parse_json_field(value: &serde_json::Value) -> serde_json::Value {
    if let serde_json::Value::String(raw) = value {
        if let Ok(parsed) = serde_json::from_str(raw) {
            return parsed;
        }
    }
    value.clone()
}

/// Counters reported by the broker for one queue.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct QueueMetrics {
    pub queued: i64,
    pub total: i64,
    pub newest_msg_age_sec: Option<i32>,
    pub oldest_msg_age_sec: Option<i32>,
}

/// What to do with one message read from the broker.
#[derive(Debug, PartialEq, Eq)]
enum Disposition {
    /// Not routed to this worker; leave it invisible until the VT expires.
    NotAllowed,
    /// Exceeded its attempt budget; archive and skip.
    ExhaustedAttempts,
    /// Scheduled for the future; skip without claiming.
    NotReady,
    /// Lease it for processing.
    Ready,
}

fn triage_message(envelope: &JobEnvelope, job_types: &[&str], now: DateTime<Utc>) -> Disposition {
    if !job_types.is_empty() && !job_types.contains(&envelope.job_type.as_str()) {
        return Disposition::NotAllowed;
    }

    if envelope.attempts >= envelope.max_attempts {
        return Disposition::ExhaustedAttempts;
    }

    if !envelope.is_ready(now) {
        return Disposition::NotReady;
    }

    Disposition::Ready
}

/// The queue contract consumed by the worker loop. `PgQueue` is the broker
/// implementation; tests substitute fakes.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, queue: &str, job: NewJob) -> QueueResult<String>;

    async fn dequeue(
        &self,
        queue: &str,
        job_types: &[&str],
        worker_id: &str,
        visibility_timeout: i32,
        batch_size: i32,
    ) -> QueueResult<Option<JobHandle>>;

    async fn delete(&self, queue: &str, msg_id: i64) -> QueueResult<bool>;

    async fn archive(&self, queue: &str, msg_id: i64) -> QueueResult<bool>;

    async fn send(
        &self,
        queue: &str,
        envelope: &JobEnvelope,
        delay_seconds: u32,
    ) -> QueueResult<i64>;

    async fn metrics(&self, queue: &str) -> QueueResult<QueueMetrics>;
}

/// A queue implemented on top of the pgmq PostgreSQL extension.
pub struct PgQueue {
    /// A connection pool used to connect to the PostgreSQL database.
    pool: PgPool,
    /// Fleet-wide attempt budget for messages that carry no override.
    default_max_attempts: i32,
    /// Queues already created on the broker. Creation is lazy and idempotent;
    /// the first operation against a queue performs it under this guard.
    known_queues: tokio::sync::Mutex<HashSet<String>>,
    /// Message ids already warned about a malformed schedule. The same
    /// message re-presents on every visibility timeout; it is logged once.
    warned_malformed: std::sync::Mutex<HashSet<i64>>,
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    msg_id: i64,
    message: serde_json::Value,
}

#[derive(sqlx::FromRow)]
struct MetricsRow {
    queue_length: i64,
    newest_msg_age_sec: Option<i32>,
    oldest_msg_age_sec: Option<i32>,
    total_messages: i64,
}

impl PgQueue {
    /// Initialize a new PgQueue backed by a lazily-connected pool.
    pub fn new(url: &str, max_connections: u32, default_max_attempts: i32) -> QueueResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy(url)
            .map_err(|error| QueueError::ConnectionError { error })?;

        Ok(Self::new_from_pool(pool, default_max_attempts))
    }

    /// Initialize a new PgQueue on an existing connection pool.
    pub fn new_from_pool(pool: PgPool, default_max_attempts: i32) -> Self {
        Self {
            pool,
            default_max_attempts,
            known_queues: tokio::sync::Mutex::new(HashSet::new()),
            warned_malformed: std::sync::Mutex::new(HashSet::new()),
        }
    }

    fn warn_malformed_schedule_once(&self, msg_id: i64, envelope: &JobEnvelope) {
        let mut warned = self
            .warned_malformed
            .lock()
            .expect("poisoned malformed-schedule lock");
        if warned.insert(msg_id) {
            warn!(
                msg_id,
                scheduled_at = envelope.scheduled_at.as_deref().unwrap_or_default(),
                "invalid scheduled_at format, processing anyway"
            );
        }
    }

    async fn ensure_queue(&self, queue: &str) -> QueueResult<()> {
        let mut known = self.known_queues.lock().await;
        if known.contains(queue) {
            return Ok(());
        }

        sqlx::query("SELECT pgmq.create($1::text)")
            .bind(queue)
            .execute(&self.pool)
            .await
            .map_err(|error| QueueError::ConnectionError { error })?;

        known.insert(queue.to_owned());

        Ok(())
    }

    async fn send_envelope(
        &self,
        queue: &str,
        envelope: &serde_json::Value,
        delay_seconds: u32,
    ) -> QueueResult<i64> {
        let msg_id: i64 =
            sqlx::query_scalar("SELECT pgmq.send($1::text, $2::jsonb, $3::integer)")
                .bind(queue)
                .bind(envelope)
                .bind(delay_seconds as i32)
                .fetch_one(&self.pool)
                .await
                .map_err(|error| QueueError::QueryError {
                    command: "SEND".to_owned(),
                    error,
                })?;

        Ok(msg_id)
    }
}

#[async_trait]
impl JobQueue for PgQueue {
    /// Enqueue a job. With a positive delay the broker only makes the message
    /// visible after the delay elapses.
    async fn enqueue(&self, queue: &str, job: NewJob) -> QueueResult<String> {
        self.ensure_queue(queue).await?;

        let envelope = build_envelope(&job, Utc::now(), self.default_max_attempts);
        let serialized = serde_json::to_value(&envelope)?;

        let msg_id = self
            .send_envelope(queue, &serialized, job.delay_seconds)
            .await?;

        info!(
            msg_id,
            queue_name = queue,
            job_type = %envelope.job_type,
            priority = envelope.priority,
            "job enqueued"
        );

        Ok(msg_id.to_string())
    }

    /// Read up to `batch_size` messages with a visibility timeout and return
    /// the first one that is routed to this worker and ready to run. Messages
    /// past their attempt budget are archived on the spot; the rest of the
    /// batch stays invisible until the VT expires and naturally returns to
    /// the queue.
    async fn dequeue(
        &self,
        queue: &str,
        job_types: &[&str],
        worker_id: &str,
        visibility_timeout: i32,
        batch_size: i32,
    ) -> QueueResult<Option<JobHandle>> {
        self.ensure_queue(queue).await?;

        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT msg_id, message FROM pgmq.read($1::text, $2::integer, $3::integer)",
        )
        .bind(queue)
        .bind(visibility_timeout)
        .bind(batch_size)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| QueueError::QueryError {
            command: "READ".to_owned(),
            error,
        })?;

        let now = Utc::now();

        for row in rows {
            let envelope: JobEnvelope = match serde_json::from_value(row.message) {
                Ok(envelope) => envelope,
                Err(error) => {
                    warn!(msg_id = row.msg_id, "skipping undecodable message: {}", error);
                    continue;
                }
            };

            if envelope.has_malformed_schedule() {
                self.warn_malformed_schedule_once(row.msg_id, &envelope);
            }

            match triage_message(&envelope, job_types, now) {
                Disposition::NotAllowed | Disposition::NotReady => continue,
                Disposition::ExhaustedAttempts => {
                    warn!(
                        msg_id = row.msg_id,
                        attempts = envelope.attempts,
                        max_attempts = envelope.max_attempts,
                        "archiving message that exceeded max attempts"
                    );
                    self.archive(queue, row.msg_id).await?;
                    continue;
                }
                Disposition::Ready => {
                    let handle = JobHandle {
                        id: row.msg_id.to_string(),
                        msg_id: Some(row.msg_id),
                        queue_name: queue.to_owned(),
                        worker_id: worker_id.to_owned(),
                        attempts: envelope.attempts + 1,
                        max_attempts: envelope.max_attempts,
                        started_at: now,
                        envelope,
                    };

                    info!(
                        job_id = %handle.id,
                        job_type = handle.job_type(),
                        attempts = handle.attempts,
                        worker_id,
                        "job dequeued for processing"
                    );

                    return Ok(Some(handle));
                }
            }
        }

        Ok(None)
    }

    /// Remove a message permanently. This is the completion path.
    async fn delete(&self, queue: &str, msg_id: i64) -> QueueResult<bool> {
        let deleted: bool = sqlx::query_scalar("SELECT pgmq.delete($1::text, $2::bigint)")
            .bind(queue)
            .bind(msg_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "DELETE".to_owned(),
                error,
            })?;

        Ok(deleted)
    }

    /// Move a message to the broker's archive table. This is the
    /// terminal-failure path.
    async fn archive(&self, queue: &str, msg_id: i64) -> QueueResult<bool> {
        let archived: bool = sqlx::query_scalar("SELECT pgmq.archive($1::text, $2::bigint)")
            .bind(queue)
            .bind(msg_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "ARCHIVE".to_owned(),
                error,
            })?;

        Ok(archived)
    }

    /// Insert a fresh message carrying an already-built envelope. Used by the
    /// retry path to requeue with backoff.
    async fn send(
        &self,
        queue: &str,
        envelope: &JobEnvelope,
        delay_seconds: u32,
    ) -> QueueResult<i64> {
        self.ensure_queue(queue).await?;

        let serialized = serde_json::to_value(envelope)?;

        self.send_envelope(queue, &serialized, delay_seconds).await
    }

    async fn metrics(&self, queue: &str) -> QueueResult<QueueMetrics> {
        self.ensure_queue(queue).await?;

        let row: MetricsRow = sqlx::query_as(
            "SELECT queue_length, newest_msg_age_sec, oldest_msg_age_sec, total_messages \
             FROM pgmq.metrics($1::text)",
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await
        .map_err(|error| QueueError::QueryError {
            command: "METRICS".to_owned(),
            error,
        })?;

        Ok(QueueMetrics {
            queued: row.queue_length,
            total: row.total_messages,
            newest_msg_age_sec: row.newest_msg_age_sec,
            oldest_msg_age_sec: row.oldest_msg_age_sec,
        })
    }
}

impl PgQueue {
    /// Close the underlying connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn build_envelope(job: &NewJob, now: DateTime<Utc>, default_max_attempts: i32) -> JobEnvelope {
    let scheduled_at = now + Duration::seconds(i64::from(job.delay_seconds));

    JobEnvelope {
        job_type: job.job_type.clone(),
        status: default_status(),
        priority: job.priority,
        user_id: job.user_id.clone(),
        payload: job.payload.clone(),
        config: job.config.clone(),
        scheduled_at: Some(scheduled_at.to_rfc3339()),
        attempts: 0,
        max_attempts: job.max_attempts.unwrap_or(default_max_attempts),
        retry_count: None,
        error_message: None,
        last_error_trace: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(job_type: &str, attempts: i32, max_attempts: i32) -> JobEnvelope {
        JobEnvelope {
            job_type: job_type.to_owned(),
            status: default_status(),
            priority: 1,
            user_id: None,
            payload: json!({}),
            config: json!({}),
            scheduled_at: None,
            attempts,
            max_attempts,
            retry_count: None,
            error_message: None,
            last_error_trace: None,
        }
    }

    #[test]
    fn test_envelope_deserializes_with_defaults() {
        let value = json!({
            "job_type": "analyze",
            "max_attempts": 3,
        });

        let envelope: JobEnvelope = serde_json::from_value(value).expect("failed to deserialize");

        assert_eq!(envelope.status, "queued");
        assert_eq!(envelope.priority, 1);
        assert_eq!(envelope.attempts, 0);
        assert_eq!(envelope.max_attempts, 3);
        assert_eq!(envelope.retry_count, None);
        assert!(envelope.is_ready(Utc::now()));
    }

    #[test]
    fn test_build_envelope_schedules_after_delay() {
        let now = Utc::now();
        let mut job = NewJob::new("analyze", json!({"repo_id": "r1"}));
        job.delay_seconds = 30;
        job.user_id = Some("u1".to_owned());

        let envelope = build_envelope(&job, now, 3);

        assert_eq!(envelope.attempts, 0);
        assert_eq!(envelope.status, "queued");
        assert_eq!(envelope.max_attempts, 3);
        assert_eq!(envelope.user_id.as_deref(), Some("u1"));
        let scheduled = DateTime::parse_from_rfc3339(envelope.scheduled_at.as_deref().unwrap())
            .expect("scheduled_at should parse back");
        assert_eq!(scheduled.with_timezone(&Utc), now + Duration::seconds(30));
        assert!(!envelope.is_ready(now));
        assert!(envelope.is_ready(now + Duration::seconds(31)));
    }

    #[test]
    fn test_max_attempts_override_wins_over_default() {
        let job = NewJob {
            max_attempts: Some(7),
            ..NewJob::new("process", json!({}))
        };

        let envelope = build_envelope(&job, Utc::now(), 3);

        assert_eq!(envelope.max_attempts, 7);
    }

    #[test]
    fn test_triage_skips_unrouted_job_types() {
        let now = Utc::now();
        let message = envelope("compact", 0, 3);

        assert_eq!(
            triage_message(&message, &["analyze", "process"], now),
            Disposition::NotAllowed
        );
        // An empty allow-list routes everything.
        assert_eq!(triage_message(&message, &[], now), Disposition::Ready);
    }

    #[test]
    fn test_triage_archives_exhausted_attempts() {
        let now = Utc::now();

        let message = envelope("analyze", 3, 3);
        assert_eq!(
            triage_message(&message, &["analyze"], now),
            Disposition::ExhaustedAttempts
        );

        let message = envelope("analyze", 2, 3);
        assert_eq!(triage_message(&message, &["analyze"], now), Disposition::Ready);
    }

    #[test]
    fn test_triage_skips_future_scheduled_messages() {
        let now = Utc::now();
        let mut message = envelope("analyze", 0, 3);
        message.scheduled_at = Some((now + Duration::hours(1)).to_rfc3339());

        assert_eq!(
            triage_message(&message, &["analyze"], now),
            Disposition::NotReady
        );
    }

    #[test]
    fn test_malformed_scheduled_at_is_ready_now() {
        let now = Utc::now();
        let mut message = envelope("analyze", 0, 3);
        message.scheduled_at = Some("not-a-timestamp".to_owned());

        assert!(message.has_malformed_schedule());
        assert_eq!(triage_message(&message, &["analyze"], now), Disposition::Ready);

        let absent = envelope("analyze", 0, 3);
        assert!(!absent.has_malformed_schedule());
    }

    #[tokio::test]
    async fn test_malformed_schedule_is_warned_once_per_message() {
        // connect_lazy never touches the network, so the queue is safe to
        // build without a database here.
        let queue = PgQueue::new("postgres://localhost:5432/unused", 1, 3)
            .expect("failed to build lazy queue");
        let mut message = envelope("analyze", 0, 3);
        message.scheduled_at = Some("not-a-timestamp".to_owned());

        queue.warn_malformed_schedule_once(7, &message);
        queue.warn_malformed_schedule_once(7, &message);
        queue.warn_malformed_schedule_once(8, &message);

        let warned = queue.warned_malformed.lock().unwrap();
        assert_eq!(warned.len(), 2);
        assert!(warned.contains(&7));
        assert!(warned.contains(&8));
    }

    #[test]
    fn test_scheduled_at_with_trailing_z_parses() {
        let mut message = envelope("analyze", 0, 3);
        message.scheduled_at = Some("2020-01-01T00:00:00Z".to_owned());

        assert!(message.is_ready(Utc::now()));
    }

    #[test]
    fn test_payload_decodes_double_encoded_blobs() {
        let mut message = envelope("analyze", 0, 3);
        message.payload = json!("{\"repo_id\": \"r1\"}");

        let handle = JobHandle {
            id: "1".to_owned(),
            msg_id: Some(1),
            queue_name: "processing".to_owned(),
            worker_id: "worker-1".to_owned(),
            attempts: 1,
            max_attempts: 3,
            started_at: Utc::now(),
            envelope: message,
        };

        assert_eq!(handle.payload(), json!({"repo_id": "r1"}));
    }

    #[test]
    fn test_payload_keeps_non_json_strings() {
        assert_eq!(
            parse_json_field(&json!("plain text")),
            json!("plain text")
        );
        assert_eq!(
            parse_json_field(&json!({"already": "decoded"})),
            json!({"already": "decoded"})
        );
    }
}
