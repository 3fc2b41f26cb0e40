//! # Claim registry
//!
//! A table-backed state machine asserting which worker owns which queue
//! message. A partial unique index keeps at most one active-or-successful
//! claim per message; racing claim attempts are serialized by the database
//! and every loser observes a benign conflict.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use thiserror::Error;

/// Name of the partial unique index enforcing claim uniqueness. Insert
/// failures referencing this constraint are conflicts, not infrastructure
/// errors.
pub const ONE_CLAIM_UNIQUE_CONSTRAINT: &str = "queue_processing_registry_one_claim_unique";

/// Enumeration of errors for operations with the claim registry.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("{0} is not a valid ClaimStatus")]
    ParseClaimStatusError(String),
}

pub type RegistryResult<T> = std::result::Result<T, RegistryError>;

/// Enumeration of possible statuses for a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "claim_status")]
#[sqlx(rename_all = "snake_case")]
pub enum ClaimStatus {
    /// A claim inserted by TryClaim, not yet started.
    Pending,
    /// The handler is running the claimed job.
    InProgress,
    /// The claimed job finished and was acknowledged.
    Completed,
    /// The claimed job failed terminally.
    Failed,
    /// The claimed job failed and was re-sent for another attempt.
    Retry,
}

impl ClaimStatus {
    /// Terminal failure states release the message for a new claim.
    pub fn releases_message(&self) -> bool {
        matches!(self, ClaimStatus::Failed | ClaimStatus::Retry)
    }
}

/// Allow casting ClaimStatus from strings.
impl FromStr for ClaimStatus {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ClaimStatus::Pending),
            "in_progress" => Ok(ClaimStatus::InProgress),
            "completed" => Ok(ClaimStatus::Completed),
            "failed" => Ok(ClaimStatus::Failed),
            "retry" => Ok(ClaimStatus::Retry),
            invalid => Err(RegistryError::ParseClaimStatusError(invalid.to_owned())),
        }
    }
}

/// Lifecycle steps a claimed job moves through. The registry persists
/// whichever step the handler reports without enforcing strict ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "claim_step")]
#[sqlx(rename_all = "snake_case")]
pub enum ClaimStep {
    Start,
    Dispatch,
    FileCloned,
    GenerateEmbeddings,
    StoreEmbedsDb,
    DbSaved,
    QueueAck,
    AuditNotifications,
    Done,
}

/// One row of the queue_processing_registry table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ClaimRecord {
    pub id: i64,
    pub message_id: String,
    pub queue_name: String,
    pub step: ClaimStep,
    pub status: ClaimStatus,
    pub claimed_by: String,
    /// Back-reference to the prior claim when this one is a retry.
    pub previous_message_id: Option<i64>,
    pub claimed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Handle to a single claim record, used to drive its lifecycle.
#[async_trait]
pub trait ClaimTracker: Send + Sync {
    /// Mark the job as started.
    async fn start(&mut self) -> RegistryResult<()>;

    /// Persist the step the handler reports.
    async fn update_step(&mut self, step: ClaimStep) -> RegistryResult<()>;

    /// Mark the job as completed.
    async fn completed(&mut self) -> RegistryResult<()>;

    /// Mark the job as failed, optionally rebinding the claim to the message
    /// id observed at failure time.
    async fn fail(&mut self, new_message_id: Option<String>) -> RegistryResult<()>;

    /// Mark the job as being retried, optionally rebinding the claim to the
    /// freshly sent message id.
    async fn retry(&mut self, new_message_id: Option<String>) -> RegistryResult<()>;
}

/// Result of a claim attempt.
pub struct ClaimOutcome {
    /// Whether this worker may process the message.
    pub qualifies: bool,
    /// The tracker for the inserted claim, when one was created.
    pub tracker: Option<Box<dyn ClaimTracker>>,
}

impl ClaimOutcome {
    pub fn rejected() -> Self {
        Self {
            qualifies: false,
            tracker: None,
        }
    }
}

#[async_trait]
pub trait ClaimRegistry: Send + Sync {
    /// Attempt to claim a message for this worker. Exactly one of the
    /// concurrent callers for a given message id succeeds; the rest observe
    /// `qualifies == false`.
    async fn try_claim(
        &self,
        worker_id: &str,
        message_id: &str,
        queue_name: &str,
    ) -> RegistryResult<ClaimOutcome>;
}

/// Claim registry persisted in PostgreSQL.
pub struct PgClaimRegistry {
    pool: PgPool,
}

impl PgClaimRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ClaimRegistry for PgClaimRegistry {
    async fn try_claim(
        &self,
        worker_id: &str,
        message_id: &str,
        queue_name: &str,
    ) -> RegistryResult<ClaimOutcome> {
        // The most recent claim attached to this message, if any.
        let previous: Option<ClaimRecord> = sqlx::query_as(
            r#"
SELECT
    id, message_id, queue_name, step, status, claimed_by,
    previous_message_id, claimed_at, updated_at
FROM
    queue_processing_registry
WHERE
    message_id = $1
ORDER BY
    updated_at DESC
LIMIT 1
            "#,
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| RegistryError::QueryError {
            command: "SELECT".to_owned(),
            error,
        })?;

        if let Some(prior) = &previous {
            if !prior.status.releases_message() {
                // Already handled or being handled.
                return Ok(ClaimOutcome::rejected());
            }
        }

        let insert: Result<ClaimRecord, sqlx::Error> = sqlx::query_as(
            r#"
INSERT INTO queue_processing_registry
    (message_id, queue_name, step, status, claimed_by, previous_message_id, claimed_at, updated_at)
VALUES
    ($1, $2, 'start'::claim_step, 'pending'::claim_status, $3, $4, NOW(), NOW())
RETURNING
    id, message_id, queue_name, step, status, claimed_by,
    previous_message_id, claimed_at, updated_at
            "#,
        )
        .bind(message_id)
        .bind(queue_name)
        .bind(worker_id)
        .bind(previous.as_ref().map(|prior| prior.id))
        .fetch_one(&self.pool)
        .await;

        match insert {
            Ok(record) => Ok(ClaimOutcome {
                qualifies: true,
                tracker: Some(Box::new(PgClaimTracker {
                    pool: self.pool.clone(),
                    record,
                })),
            }),
            Err(sqlx::Error::Database(db_error))
                if db_error.constraint() == Some(ONE_CLAIM_UNIQUE_CONSTRAINT) =>
            {
                // Someone else claimed it first.
                Ok(ClaimOutcome::rejected())
            }
            Err(error) => Err(RegistryError::QueryError {
                command: "INSERT".to_owned(),
                error,
            }),
        }
    }
}

/// Tracker over one persisted claim record.
pub struct PgClaimTracker {
    pool: PgPool,
    record: ClaimRecord,
}

impl PgClaimTracker {
    pub fn record(&self) -> &ClaimRecord {
        &self.record
    }

    async fn persist(
        &mut self,
        status: Option<ClaimStatus>,
        step: Option<ClaimStep>,
        message_id: Option<&str>,
    ) -> RegistryResult<()> {
        let record: ClaimRecord = sqlx::query_as(
            r#"
UPDATE
    queue_processing_registry
SET
    status = COALESCE($2, status),
    step = COALESCE($3, step),
    message_id = COALESCE($4, message_id),
    updated_at = NOW()
WHERE
    id = $1
RETURNING
    id, message_id, queue_name, step, status, claimed_by,
    previous_message_id, claimed_at, updated_at
            "#,
        )
        .bind(self.record.id)
        .bind(status)
        .bind(step)
        .bind(message_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|error| RegistryError::QueryError {
            command: "UPDATE".to_owned(),
            error,
        })?;

        self.record = record;

        Ok(())
    }
}

#[async_trait]
impl ClaimTracker for PgClaimTracker {
    async fn start(&mut self) -> RegistryResult<()> {
        self.persist(Some(ClaimStatus::InProgress), None, None).await
    }

    async fn update_step(&mut self, step: ClaimStep) -> RegistryResult<()> {
        self.persist(None, Some(step), None).await
    }

    async fn completed(&mut self) -> RegistryResult<()> {
        self.persist(Some(ClaimStatus::Completed), Some(ClaimStep::Done), None)
            .await
    }

    async fn fail(&mut self, new_message_id: Option<String>) -> RegistryResult<()> {
        self.persist(Some(ClaimStatus::Failed), None, new_message_id.as_deref())
            .await
    }

    async fn retry(&mut self, new_message_id: Option<String>) -> RegistryResult<()> {
        self.persist(Some(ClaimStatus::Retry), None, new_message_id.as_deref())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_status_from_str() {
        assert_eq!("pending".parse::<ClaimStatus>().unwrap(), ClaimStatus::Pending);
        assert_eq!(
            "in_progress".parse::<ClaimStatus>().unwrap(),
            ClaimStatus::InProgress
        );
        assert_eq!("retry".parse::<ClaimStatus>().unwrap(), ClaimStatus::Retry);
        assert!("banana".parse::<ClaimStatus>().is_err());
    }

    #[test]
    fn test_only_terminal_failures_release_the_message() {
        assert!(ClaimStatus::Failed.releases_message());
        assert!(ClaimStatus::Retry.releases_message());

        assert!(!ClaimStatus::Pending.releases_message());
        assert!(!ClaimStatus::InProgress.releases_message());
        assert!(!ClaimStatus::Completed.releases_message());
    }
}
