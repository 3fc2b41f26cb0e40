//! Retry-or-archive settlement for failed jobs.
//!
//! A failed attempt with budget left is deleted and re-sent with exponential
//! backoff; anything else is archived. Claim updates along the way are
//! best-effort: a tracker that cannot be updated never blocks the queue
//! mutation that already happened.

use std::sync::Arc;

use analysis_common::pgqueue::{JobEnvelope, JobHandle, JobQueue, QueueResult};
use analysis_common::registry::ClaimTracker;
use analysis_common::retry::RetryPolicy;
use analysis_common::tracer::JobTracer;
use tracing::{error, info};

/// How a failed attempt was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettleOutcome {
    /// The job will not run again: it was archived, or could not be touched.
    pub permanent: bool,
    /// The queue mutation (re-send or archive) went through.
    pub handled: bool,
}

pub struct FailurePolicy {
    queue: Arc<dyn JobQueue>,
    retry_policy: RetryPolicy,
}

impl FailurePolicy {
    pub fn new(queue: Arc<dyn JobQueue>, retry_policy: RetryPolicy) -> Self {
        Self {
            queue,
            retry_policy,
        }
    }

    /// Settle a failed attempt: requeue with backoff while attempts remain
    /// and `retry` allows it, archive otherwise.
    pub async fn settle_failure(
        &self,
        job: &JobHandle,
        cause: &anyhow::Error,
        tracker: Option<&mut (dyn ClaimTracker + 'static)>,
        tracer: Option<&mut JobTracer>,
        retry: bool,
    ) -> QueueResult<SettleOutcome> {
        let Some(msg_id) = job.msg_id else {
            error!(
                job_id = %job.id,
                "no broker message id on job; cannot retry or archive"
            );
            if let Some(tracer) = tracer {
                tracer.record_error(Some("missing broker message id"), Some(cause));
            }
            return Ok(SettleOutcome {
                permanent: true,
                handled: false,
            });
        };

        if retry && job.attempts < job.max_attempts {
            self.retry_job(job, msg_id, cause, tracker).await
        } else {
            self.archive_permanently(job, msg_id, cause, tracker, tracer)
                .await
        }
    }

    async fn retry_job(
        &self,
        job: &JobHandle,
        msg_id: i64,
        cause: &anyhow::Error,
        tracker: Option<&mut (dyn ClaimTracker + 'static)>,
    ) -> QueueResult<SettleOutcome> {
        let delay = self.retry_policy.time_until_next_retry(job.attempts as u32);
        let envelope = retry_envelope(job, cause);

        // Remove the current message, then re-send a fresh one with a delay.
        self.queue.delete(&job.queue_name, msg_id).await?;
        let new_msg_id = self
            .queue
            .send(&job.queue_name, &envelope, delay.as_secs() as u32)
            .await?;

        info!(
            job_id = %job.id,
            attempt = job.attempts,
            max_attempts = job.max_attempts,
            delay_seconds = delay.as_secs(),
            "job scheduled for retry"
        );

        if let Some(tracker) = tracker {
            if let Err(error) = tracker.retry(Some(new_msg_id.to_string())).await {
                error!(
                    job_id = %job.id,
                    "job re-queued, but the claim retry update failed; continuing: {}", error
                );
            }
        }

        Ok(SettleOutcome {
            permanent: false,
            handled: true,
        })
    }

    async fn archive_permanently(
        &self,
        job: &JobHandle,
        msg_id: i64,
        cause: &anyhow::Error,
        tracker: Option<&mut (dyn ClaimTracker + 'static)>,
        tracer: Option<&mut JobTracer>,
    ) -> QueueResult<SettleOutcome> {
        let archived = self.queue.archive(&job.queue_name, msg_id).await?;

        if let Some(tracker) = tracker {
            if let Err(error) = tracker.fail(Some(msg_id.to_string())).await {
                error!(
                    job_id = %job.id,
                    "claim failure update threw; continuing: {}", error
                );
            }
        }

        let summary = if archived {
            format!(
                "job {} permanently failed after {} attempts",
                job.id, job.attempts
            )
        } else {
            format!("failed to archive permanently failed job {}", job.id)
        };
        error!(job_id = %job.id, "{}", summary);

        if let Some(tracer) = tracer {
            tracer.record_error(Some(&summary), Some(cause));
        }

        Ok(SettleOutcome {
            permanent: true,
            handled: archived,
        })
    }
}

/// Build the envelope re-sent for a retry: the original envelope with the
/// attempt count carried over and the failure recorded. Broker-assigned ids
/// live outside the envelope, so the fresh send gets a fresh identity.
fn retry_envelope(job: &JobHandle, cause: &anyhow::Error) -> JobEnvelope {
    let mut envelope = job.envelope.clone();
    envelope.attempts = job.attempts;
    envelope.retry_count = Some(job.attempts);
    envelope.error_message = Some(cause.to_string());
    envelope.last_error_trace = Some(format!("{cause:?}"));
    envelope
}
