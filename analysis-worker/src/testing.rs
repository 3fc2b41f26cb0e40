//! Fakes for the worker's collaborator traits, shared across test modules.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use analysis_common::mail::{EmailDispatcher, MailError, Template};
use analysis_common::pgqueue::{
    JobEnvelope, JobHandle, JobQueue, NewJob, QueueError, QueueMetrics, QueueResult,
};
use analysis_common::registry::{
    ClaimOutcome, ClaimRegistry, ClaimStep, ClaimTracker, RegistryResult,
};
use analysis_common::tracer::{JobTracer, TraceMetadata};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use crate::worker::MessageHandler;

/// A leased job with the identity fields the worker seeds the tracer from.
pub fn make_job(attempts: i32, max_attempts: i32) -> JobHandle {
    let envelope = JobEnvelope {
        job_type: "analyze".to_owned(),
        status: "queued".to_owned(),
        priority: 1,
        user_id: Some("u1".to_owned()),
        payload: json!({
            "repo_id": "r1",
            "user_id": "u1",
            "context_id": "c1",
            "branch": "main",
        }),
        config: json!({}),
        scheduled_at: None,
        attempts: attempts - 1,
        max_attempts,
        retry_count: None,
        error_message: None,
        last_error_trace: None,
    };

    JobHandle {
        id: "1".to_owned(),
        msg_id: Some(1),
        queue_name: "processing".to_owned(),
        worker_id: "worker-1".to_owned(),
        attempts,
        max_attempts,
        started_at: Utc::now(),
        envelope,
    }
}

/// In-memory queue recording every broker mutation.
pub struct FakeQueue {
    jobs: Mutex<VecDeque<JobHandle>>,
    deleted: Mutex<Vec<(String, i64)>>,
    archived: Mutex<Vec<(String, i64)>>,
    sent: Mutex<Vec<(String, JobEnvelope, u32)>>,
    next_msg_id: AtomicI64,
    last_sent_msg_id: AtomicI64,
    delete_result: AtomicBool,
    archive_result: AtomicBool,
    fail_dequeues: AtomicBool,
}

impl Default for FakeQueue {
    fn default() -> Self {
        Self {
            jobs: Mutex::new(VecDeque::new()),
            deleted: Mutex::new(Vec::new()),
            archived: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            next_msg_id: AtomicI64::new(100),
            last_sent_msg_id: AtomicI64::new(0),
            delete_result: AtomicBool::new(true),
            archive_result: AtomicBool::new(true),
            fail_dequeues: AtomicBool::new(false),
        }
    }
}

impl FakeQueue {
    pub fn push_job(&self, job: JobHandle) {
        self.jobs.lock().unwrap().push_back(job);
    }

    pub fn deleted(&self) -> Vec<(String, i64)> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn archived(&self) -> Vec<(String, i64)> {
        self.archived.lock().unwrap().clone()
    }

    pub fn sent(&self) -> Vec<(String, JobEnvelope, u32)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn last_sent_msg_id(&self) -> i64 {
        self.last_sent_msg_id.load(Ordering::SeqCst)
    }

    pub fn set_delete_result(&self, result: bool) {
        self.delete_result.store(result, Ordering::SeqCst);
    }

    pub fn set_archive_result(&self, result: bool) {
        self.archive_result.store(result, Ordering::SeqCst);
    }

    pub fn set_fail_dequeues(&self, fail: bool) {
        self.fail_dequeues.store(fail, Ordering::SeqCst);
    }

    fn broker_down() -> QueueError {
        QueueError::QueryError {
            command: "READ".to_owned(),
            error: sqlx::Error::PoolClosed,
        }
    }
}

#[async_trait]
impl JobQueue for FakeQueue {
    async fn enqueue(&self, _queue: &str, _job: NewJob) -> QueueResult<String> {
        Ok(self.next_msg_id.fetch_add(1, Ordering::SeqCst).to_string())
    }

    async fn dequeue(
        &self,
        _queue: &str,
        _job_types: &[&str],
        _worker_id: &str,
        _visibility_timeout: i32,
        _batch_size: i32,
    ) -> QueueResult<Option<JobHandle>> {
        if self.fail_dequeues.load(Ordering::SeqCst) {
            return Err(Self::broker_down());
        }
        Ok(self.jobs.lock().unwrap().pop_front())
    }

    async fn delete(&self, queue: &str, msg_id: i64) -> QueueResult<bool> {
        self.deleted.lock().unwrap().push((queue.to_owned(), msg_id));
        Ok(self.delete_result.load(Ordering::SeqCst))
    }

    async fn archive(&self, queue: &str, msg_id: i64) -> QueueResult<bool> {
        self.archived
            .lock()
            .unwrap()
            .push((queue.to_owned(), msg_id));
        Ok(self.archive_result.load(Ordering::SeqCst))
    }

    async fn send(
        &self,
        queue: &str,
        envelope: &JobEnvelope,
        delay_seconds: u32,
    ) -> QueueResult<i64> {
        let msg_id = self.next_msg_id.fetch_add(1, Ordering::SeqCst);
        self.last_sent_msg_id.store(msg_id, Ordering::SeqCst);
        self.sent
            .lock()
            .unwrap()
            .push((queue.to_owned(), envelope.clone(), delay_seconds));
        Ok(msg_id)
    }

    async fn metrics(&self, _queue: &str) -> QueueResult<QueueMetrics> {
        Ok(QueueMetrics::default())
    }
}

/// Lifecycle transitions observed on a fake claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerEvent {
    Started,
    Step(ClaimStep),
    Completed,
    Failed(Option<String>),
    Retried(Option<String>),
}

pub struct FakeTracker {
    events: Arc<Mutex<Vec<TrackerEvent>>>,
}

impl FakeTracker {
    pub fn new() -> (Self, Arc<Mutex<Vec<TrackerEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                events: events.clone(),
            },
            events,
        )
    }

    fn push(&self, event: TrackerEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl ClaimTracker for FakeTracker {
    async fn start(&mut self) -> RegistryResult<()> {
        self.push(TrackerEvent::Started);
        Ok(())
    }

    async fn update_step(&mut self, step: ClaimStep) -> RegistryResult<()> {
        self.push(TrackerEvent::Step(step));
        Ok(())
    }

    async fn completed(&mut self) -> RegistryResult<()> {
        self.push(TrackerEvent::Completed);
        Ok(())
    }

    async fn fail(&mut self, new_message_id: Option<String>) -> RegistryResult<()> {
        self.push(TrackerEvent::Failed(new_message_id));
        Ok(())
    }

    async fn retry(&mut self, new_message_id: Option<String>) -> RegistryResult<()> {
        self.push(TrackerEvent::Retried(new_message_id));
        Ok(())
    }
}

/// Registry fake handing out `FakeTracker`s, or rejecting every claim.
pub struct FakeRegistry {
    qualifies: bool,
    claims: Mutex<Vec<String>>,
    events: Arc<Mutex<Vec<TrackerEvent>>>,
}

impl FakeRegistry {
    pub fn qualifying() -> Self {
        Self {
            qualifies: true,
            claims: Mutex::new(Vec::new()),
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn rejecting() -> Self {
        Self {
            qualifies: false,
            ..Self::qualifying()
        }
    }

    pub fn claims(&self) -> Vec<String> {
        self.claims.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<TrackerEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClaimRegistry for FakeRegistry {
    async fn try_claim(
        &self,
        _worker_id: &str,
        message_id: &str,
        _queue_name: &str,
    ) -> RegistryResult<ClaimOutcome> {
        self.claims.lock().unwrap().push(message_id.to_owned());

        if !self.qualifies {
            return Ok(ClaimOutcome::rejected());
        }

        Ok(ClaimOutcome {
            qualifies: true,
            tracker: Some(Box::new(FakeTracker {
                events: self.events.clone(),
            })),
        })
    }
}

enum HandlerBehavior {
    Succeed,
    SucceedWithEmail(String),
    Fail(String),
}

/// Message handler scripted to succeed, succeed and fill in the user email,
/// or fail.
pub struct FakeHandler {
    behavior: HandlerBehavior,
    calls: Mutex<Vec<serde_json::Value>>,
}

impl FakeHandler {
    pub fn succeeding() -> Self {
        Self {
            behavior: HandlerBehavior::Succeed,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn succeeding_with_email(email: &str) -> Self {
        Self {
            behavior: HandlerBehavior::SucceedWithEmail(email.to_owned()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            behavior: HandlerBehavior::Fail(message.to_owned()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl MessageHandler for FakeHandler {
    async fn handle(
        &self,
        payload: serde_json::Value,
        _tracker: Option<&mut (dyn ClaimTracker + 'static)>,
        tracer: Option<&mut JobTracer>,
    ) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(payload);

        match &self.behavior {
            HandlerBehavior::Succeed => Ok(()),
            HandlerBehavior::SucceedWithEmail(email) => {
                if let Some(tracer) = tracer {
                    tracer.add_metadata(TraceMetadata {
                        user_email: Some(email.clone()),
                        ..Default::default()
                    });
                }
                Ok(())
            }
            HandlerBehavior::Fail(message) => Err(anyhow::anyhow!("{message}")),
        }
    }
}

/// Dispatcher recording every send instead of talking to a transport.
#[derive(Default)]
pub struct FakeDispatcher {
    sent: Mutex<Vec<(Vec<String>, Template, serde_json::Value)>>,
    fail: AtomicBool,
}

impl FakeDispatcher {
    pub fn sent(&self) -> Vec<(Vec<String>, Template, serde_json::Value)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl EmailDispatcher for FakeDispatcher {
    async fn send_templated_html(
        &self,
        to: &[String],
        template: Template,
        context: serde_json::Value,
    ) -> Result<(), MailError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(MailError::TransportError("smtp unreachable".to_owned()));
        }

        self.sent
            .lock()
            .unwrap()
            .push((to.to_vec(), template, context));

        Ok(())
    }
}
