//! The poll/claim/dispatch/settle loop.
//!
//! Each `QueueWorker` runs one loop: lease a message from the queue, claim it
//! in the registry, hand the payload to the message handler, then settle by
//! deleting the message (success) or routing it through the failure policy
//! (retry or archive). Settled jobs emit an audit event built from the job
//! tracer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time;

use analysis_common::clock::Clock;
use analysis_common::health::HealthHandle;
use analysis_common::pgqueue::{JobHandle, JobQueue};
use analysis_common::registry::{ClaimRegistry, ClaimStep, ClaimTracker};
use analysis_common::tracer::{JobTracer, TraceMetadata};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::audit::AuditNotifier;
use crate::error::WorkerError;
use crate::failure::FailurePolicy;

/// The queue analysis jobs are routed through.
pub const PROCESSING_QUEUE: &str = "processing";
/// Job types this fleet hands to the message handler. Anything else is
/// acknowledged without dispatching.
pub const DISPATCHABLE_JOB_TYPES: [&str; 2] = ["analyze", "process"];

/// Grace period granted to an in-flight job when a worker is asked to stop.
const SHUTDOWN_GRACE: time::Duration = time::Duration::from_secs(5);

/// The analysis pipeline behind the worker. May mutate the claim's step and
/// the tracer's metadata while it runs.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(
        &self,
        payload: serde_json::Value,
        tracker: Option<&mut (dyn ClaimTracker + 'static)>,
        tracer: Option<&mut JobTracer>,
    ) -> anyhow::Result<()>;
}

/// Stand-in dispatch target until an analysis pipeline is wired.
pub struct NoopMessageHandler;

#[async_trait]
impl MessageHandler for NoopMessageHandler {
    async fn handle(
        &self,
        _payload: serde_json::Value,
        _tracker: Option<&mut (dyn ClaimTracker + 'static)>,
        tracer: Option<&mut JobTracer>,
    ) -> anyhow::Result<()> {
        if let Some(tracer) = tracer {
            warn!("no message handler wired, acknowledging without processing");
            tracer.record_error(Some("no message handler wired"), None);
        }
        Ok(())
    }
}

/// Per-worker knobs, carved out of the process configuration.
#[derive(Clone)]
pub struct WorkerSettings {
    pub queue_name: String,
    pub job_types: Vec<String>,
    pub poll_interval: time::Duration,
    pub visibility_timeout_seconds: i32,
    pub batch_size: i32,
    pub consecutive_failure_limit: u32,
    pub enable_job_tracer: bool,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            queue_name: PROCESSING_QUEUE.to_owned(),
            job_types: DISPATCHABLE_JOB_TYPES
                .iter()
                .map(|t| (*t).to_owned())
                .collect(),
            poll_interval: time::Duration::from_secs(5),
            visibility_timeout_seconds: 30,
            batch_size: 10,
            consecutive_failure_limit: 5,
            enable_job_tracer: true,
        }
    }
}

#[derive(Debug, Default)]
struct WorkerStats {
    jobs_processed: u64,
    jobs_failed: u64,
    start_time: Option<DateTime<Utc>>,
    last_job_time: Option<DateTime<Utc>>,
    current_job: Option<String>,
}

/// The observable state of one fleet member.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub worker_id: String,
    pub running: bool,
    pub jobs_processed: u64,
    pub jobs_failed: u64,
    pub uptime_seconds: Option<f64>,
    pub last_job_time: Option<DateTime<Utc>>,
    pub current_job: Option<String>,
}

/// What the registry said about a lease.
enum ClaimDecision {
    /// Claimed; lifecycle updates flow through the tracker.
    Tracked(Box<dyn ClaimTracker>),
    /// No registry wired; process without tracking.
    Untracked,
    /// The registry refused the claim.
    Rejected,
}

/// What one loop iteration did.
enum Iteration {
    /// The queue had nothing for us.
    Idle,
    /// A job was leased and carried to a settlement boundary.
    Processed,
    /// The registry refused the claim: the message is being handled
    /// elsewhere or already settled.
    ClaimRejected,
}

pub struct QueueWorker {
    worker_id: String,
    queue: Arc<dyn JobQueue>,
    registry: Option<Arc<dyn ClaimRegistry>>,
    handler: Arc<dyn MessageHandler>,
    notifier: AuditNotifier,
    failure_policy: FailurePolicy,
    settings: WorkerSettings,
    clock: Arc<dyn Clock>,
    liveness: Option<HealthHandle>,
    running: AtomicBool,
    stats: Mutex<WorkerStats>,
}

impl QueueWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker_id: &str,
        queue: Arc<dyn JobQueue>,
        registry: Option<Arc<dyn ClaimRegistry>>,
        handler: Arc<dyn MessageHandler>,
        notifier: AuditNotifier,
        failure_policy: FailurePolicy,
        settings: WorkerSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            worker_id: worker_id.to_owned(),
            queue,
            registry,
            handler,
            notifier,
            failure_policy,
            settings,
            clock,
            liveness: None,
            running: AtomicBool::new(false),
            stats: Mutex::new(WorkerStats::default()),
        }
    }

    /// Attach a liveness handle reported on every poll.
    pub fn with_liveness(mut self, liveness: HealthHandle) -> Self {
        self.liveness = Some(liveness);
        self
    }

    /// Run the worker until it is stopped or gives up. Blocks the caller.
    pub async fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        {
            let mut stats = self.stats.lock().expect("poisoned worker stats lock");
            stats.start_time = Some(self.clock.now());
        }
        info!(worker_id = %self.worker_id, "worker started");

        self.worker_loop().await;

        self.running.store(false, Ordering::SeqCst);
        info!(worker_id = %self.worker_id, "worker stopped");
    }

    /// Request shutdown. The loop exits after its current iteration; an
    /// in-flight job gets a short grace period to reach a settlement
    /// boundary. Anything still unsettled reappears via the queue's
    /// visibility timeout.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);

        let busy = {
            let stats = self.stats.lock().expect("poisoned worker stats lock");
            stats.current_job.is_some()
        };
        if busy {
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> StatsSnapshot {
        let stats = self.stats.lock().expect("poisoned worker stats lock");
        let uptime_seconds = stats
            .start_time
            .map(|started| (self.clock.now() - started).num_milliseconds() as f64 / 1000.0);

        StatsSnapshot {
            worker_id: self.worker_id.clone(),
            running: self.is_running(),
            jobs_processed: stats.jobs_processed,
            jobs_failed: stats.jobs_failed,
            uptime_seconds,
            last_job_time: stats.last_job_time,
            current_job: stats.current_job.clone(),
        }
    }

    async fn worker_loop(&self) {
        let mut consecutive_failures: u32 = 0;

        while self.running.load(Ordering::SeqCst) {
            if let Some(liveness) = &self.liveness {
                liveness.report_healthy();
            }

            match self.run_iteration().await {
                Ok(Iteration::Idle) => {
                    tokio::time::sleep(self.settings.poll_interval).await;
                }
                Ok(Iteration::Processed) => {
                    consecutive_failures = 0;
                }
                Ok(Iteration::ClaimRejected) => {
                    // The message is owned elsewhere or terminal. A rejected
                    // claim stops the whole worker rather than skipping one
                    // message; operators may prefer a skip here.
                    warn!(
                        worker_id = %self.worker_id,
                        "message already claimed, stopping worker"
                    );
                    break;
                }
                Err(error) => {
                    consecutive_failures += 1;
                    error!(
                        worker_id = %self.worker_id,
                        failures = consecutive_failures,
                        "worker iteration failed: {}",
                        error
                    );
                    if self.backoff_or_stop(consecutive_failures).await {
                        break;
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
    }

    /// Sleep with exponential backoff. Returns true when the worker should
    /// give up.
    async fn backoff_or_stop(&self, failures: u32) -> bool {
        if failures >= self.settings.consecutive_failure_limit {
            error!(
                worker_id = %self.worker_id,
                failures, "too many consecutive failures, stopping worker"
            );
            return true;
        }

        let delay = std::cmp::min(60, 2u64.saturating_pow(failures));
        tokio::time::sleep(time::Duration::from_secs(delay)).await;
        false
    }

    async fn run_iteration(&self) -> Result<Iteration, WorkerError> {
        let job_types: Vec<&str> = self.settings.job_types.iter().map(String::as_str).collect();

        let Some(job) = self
            .queue
            .dequeue(
                &self.settings.queue_name,
                &job_types,
                &self.worker_id,
                self.settings.visibility_timeout_seconds,
                self.settings.batch_size,
            )
            .await?
        else {
            return Ok(Iteration::Idle);
        };

        let tracker = match self.try_claim(&job).await? {
            ClaimDecision::Rejected => return Ok(Iteration::ClaimRejected),
            ClaimDecision::Tracked(tracker) => Some(tracker),
            ClaimDecision::Untracked => None,
        };

        metrics::counter!(
            "analysis_jobs_total",
            &[("queue", self.settings.queue_name.clone())]
        )
        .increment(1);

        let tracer = self.settings.enable_job_tracer.then(JobTracer::new);
        self.process_job(job, tracker, tracer).await;

        Ok(Iteration::Processed)
    }

    /// Drive a single iteration from outside the loop. Test-only.
    #[cfg(test)]
    pub(crate) async fn run_iteration_for_tests(&self) {
        let _unused = self.run_iteration().await;
    }

    async fn try_claim(&self, job: &JobHandle) -> Result<ClaimDecision, WorkerError> {
        let Some(registry) = &self.registry else {
            return Ok(ClaimDecision::Untracked);
        };

        let outcome = registry
            .try_claim(&self.worker_id, &job.id, &self.settings.queue_name)
            .await?;

        match (outcome.qualifies, outcome.tracker) {
            (true, Some(tracker)) => Ok(ClaimDecision::Tracked(tracker)),
            (true, None) => Ok(ClaimDecision::Untracked),
            (false, _) => Ok(ClaimDecision::Rejected),
        }
    }

    /// Carry one leased job to a settlement boundary. Never returns an
    /// error: failures are routed through the failure policy, and the audit
    /// event is published when the attempt settled.
    async fn process_job(
        &self,
        job: JobHandle,
        mut tracker: Option<Box<dyn ClaimTracker>>,
        mut tracer: Option<JobTracer>,
    ) {
        if let Some(tracer) = tracer.as_mut() {
            tracer.add_metadata(seed_metadata(&job));
        }
        {
            let mut stats = self.stats.lock().expect("poisoned worker stats lock");
            stats.current_job = Some(job.id.clone());
        }

        let start = tokio::time::Instant::now();
        let result = self.run_job(&job, &mut tracker, &mut tracer).await;
        let labels = [("queue", self.settings.queue_name.clone())];

        let mut settled = true;
        match result {
            Ok(()) => {
                metrics::histogram!("analysis_jobs_processing_duration_seconds", &labels)
                    .record(start.elapsed().as_secs_f64());
            }
            Err(error) => {
                error!(
                    worker_id = %self.worker_id,
                    job_id = %job.id,
                    "error processing job: {:#}",
                    error
                );
                {
                    let mut stats = self.stats.lock().expect("poisoned worker stats lock");
                    stats.jobs_failed += 1;
                }
                settled = self
                    .fail_job_safe(&job, error, &mut tracker, &mut tracer)
                    .await;
            }
        }

        {
            let mut stats = self.stats.lock().expect("poisoned worker stats lock");
            stats.current_job = None;
        }

        if let Some(tracer) = tracer.as_mut() {
            if let Some(tracker) = tracker.as_deref_mut() {
                if let Err(error) = tracker.update_step(ClaimStep::AuditNotifications).await {
                    warn!(job_id = %job.id, "failed to record audit step: {}", error);
                }
            }
            // Retried attempts are not a settlement; they stay silent until
            // the job completes or is archived.
            if settled {
                self.notifier.notify(tracer).await;
            }
        }
    }

    /// The ordered steps of one attempt. Any error drops the caller into the
    /// safe-fail path.
    async fn run_job(
        &self,
        job: &JobHandle,
        tracker: &mut Option<Box<dyn ClaimTracker>>,
        tracer: &mut Option<JobTracer>,
    ) -> anyhow::Result<()> {
        if let Some(tracer) = tracer.as_mut() {
            tracer.mark_job_started(None, false)?;
        }

        if let Some(tracker) = tracker.as_deref_mut() {
            tracker.update_step(ClaimStep::Dispatch).await?;
        }

        self.dispatch_job(job, tracker, tracer).await?;

        if let Some(tracker) = tracker.as_deref_mut() {
            tracker.update_step(ClaimStep::QueueAck).await?;
        }

        self.acknowledge(job, tracker, tracer).await;

        {
            let mut stats = self.stats.lock().expect("poisoned worker stats lock");
            stats.jobs_processed += 1;
            stats.last_job_time = Some(self.clock.now());
        }

        if let Some(tracer) = tracer.as_mut() {
            tracer.mark_job_finished(None, false)?;
        }

        Ok(())
    }

    /// Hand the payload to the message handler, but only for job types this
    /// fleet dispatches on its processing queue. Everything else is a no-op
    /// that still runs the success path.
    async fn dispatch_job(
        &self,
        job: &JobHandle,
        tracker: &mut Option<Box<dyn ClaimTracker>>,
        tracer: &mut Option<JobTracer>,
    ) -> anyhow::Result<()> {
        if self.settings.queue_name != PROCESSING_QUEUE
            || !DISPATCHABLE_JOB_TYPES.contains(&job.job_type())
        {
            return Ok(());
        }

        if let Some(tracker) = tracker.as_deref_mut() {
            tracker.start().await?;
        }

        self.handler
            .handle(job.payload(), tracker.as_deref_mut(), tracer.as_mut())
            .await
    }

    /// Delete the message from the queue. A delete that does not go through
    /// is recorded on the tracer but the attempt still counts as processed:
    /// the message will reappear after its visibility timeout and the claim
    /// registry resolves the duplicate.
    async fn acknowledge(
        &self,
        job: &JobHandle,
        tracker: &mut Option<Box<dyn ClaimTracker>>,
        tracer: &mut Option<JobTracer>,
    ) {
        let Some(msg_id) = job.msg_id else {
            warn!(job_id = %job.id, "no broker message id on job");
            if let Some(tracer) = tracer.as_mut() {
                tracer.record_error(Some("no broker message id on job"), None);
            }
            return;
        };

        match self.queue.delete(&job.queue_name, msg_id).await {
            Ok(true) => {
                info!(job_id = %job.id, "job completed");
                if let Some(tracker) = tracker.as_deref_mut() {
                    if let Err(error) = tracker.completed().await {
                        error!(
                            job_id = %job.id,
                            "job completed, but the claim completion update failed; continuing: {}",
                            error
                        );
                    }
                }
                metrics::counter!(
                    "analysis_jobs_completed",
                    &[("queue", self.settings.queue_name.clone())]
                )
                .increment(1);
            }
            Ok(false) => {
                let summary = format!("failed to mark job {} as completed", job.id);
                error!(job_id = %job.id, "{}", summary);
                if let Some(tracer) = tracer.as_mut() {
                    tracer.record_error(Some(&summary), None);
                }
            }
            Err(error) => {
                let summary = format!("failed to complete job {}", job.id);
                error!(job_id = %job.id, "{}: {}", summary, error);
                if let Some(tracer) = tracer.as_mut() {
                    tracer.record_error(Some(&summary), Some(&anyhow::Error::new(error)));
                }
            }
        }
    }

    /// Settle a failed attempt without letting settlement errors escape the
    /// loop. Returns whether the attempt settled (archived or untouchable)
    /// as opposed to being re-queued for retry.
    async fn fail_job_safe(
        &self,
        job: &JobHandle,
        cause: anyhow::Error,
        tracker: &mut Option<Box<dyn ClaimTracker>>,
        tracer: &mut Option<JobTracer>,
    ) -> bool {
        let labels = [("queue", self.settings.queue_name.clone())];

        match self
            .failure_policy
            .settle_failure(job, &cause, tracker.as_deref_mut(), tracer.as_mut(), true)
            .await
        {
            Ok(outcome) => {
                if outcome.permanent {
                    metrics::counter!("analysis_jobs_failed", &labels).increment(1);
                } else {
                    metrics::counter!("analysis_jobs_retried", &labels).increment(1);
                }
                outcome.permanent
            }
            Err(error) => {
                error!(job_id = %job.id, "failed to settle failed job: {}", error);
                if let Some(tracer) = tracer.as_mut() {
                    tracer.record_error(
                        Some("failed while marking job as failed"),
                        Some(&anyhow::Error::new(error)),
                    );
                }
                true
            }
        }
    }
}

fn seed_metadata(job: &JobHandle) -> TraceMetadata {
    let payload = job.payload();
    let field = |name: &str| {
        payload
            .get(name)
            .and_then(|value| value.as_str())
            .map(str::to_owned)
    };

    TraceMetadata {
        repo_id: field("repo_id"),
        user_id: field("user_id"),
        job_context_id: field("context_id"),
        job_type: Some(job.job_type().to_owned()),
        repository_branch: field("branch"),
        ..Default::default()
    }
}
