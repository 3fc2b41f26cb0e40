//! Settlement notifications built from the job tracer.
//!
//! Every settled job emits exactly one audit event: a failure email to the
//! audit recipients, or a success email to the user who asked for the
//! analysis. Dispatch is fire-and-forget; a broken transport never fails
//! the worker.

use std::sync::Arc;

use analysis_common::mail::{
    EmailDispatcher, ProjectAnalysisFailure, ProjectAnalysisSuccess, Template,
};
use analysis_common::tracer::JobTracer;
use tracing::{error, warn};

pub struct AuditNotifier {
    dispatcher: Arc<dyn EmailDispatcher>,
    audit_recipients: Vec<String>,
}

impl AuditNotifier {
    pub fn new(dispatcher: Arc<dyn EmailDispatcher>, audit_recipients: Vec<String>) -> Self {
        Self {
            dispatcher,
            audit_recipients,
        }
    }

    /// Close the tracer and publish the audit event. Never throws; dispatch
    /// and configuration problems are logged and the worker moves on.
    pub async fn notify(&self, tracer: &mut JobTracer) {
        if let Err(error) = self.notify_inner(tracer).await {
            error!("error occurred while trying to send an audit email: {:#}", error);
        }
    }

    async fn notify_inner(&self, tracer: &mut JobTracer) -> anyhow::Result<()> {
        let failure = if tracer.has_error() {
            true
        } else if tracer.user_email().is_none() {
            // A success nobody can be told about is an audit-grade failure.
            tracer.record_error(
                Some("no user email has been provided to send the email to"),
                None,
            );
            true
        } else {
            false
        };

        if let Err(error) = tracer.mark_job_settled(None, false) {
            warn!("could not stamp settlement on the tracer: {}", error);
        }

        let report = tracer.report();

        if failure {
            if self.audit_recipients.is_empty() {
                anyhow::bail!("audit recipients are not configured");
            }

            let context = ProjectAnalysisFailure::from_report(&report);
            self.dispatcher
                .send_templated_html(
                    &self.audit_recipients,
                    Template::ProjectAnalysisFailure,
                    serde_json::to_value(context)?,
                )
                .await?;
        } else {
            let to = vec![report.user_email.clone().unwrap_or_default()];
            let context = ProjectAnalysisSuccess::from_report(&report);
            self.dispatcher
                .send_templated_html(
                    &to,
                    Template::ProjectAnalysisSuccess,
                    serde_json::to_value(context)?,
                )
                .await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeDispatcher;
    use analysis_common::tracer::TraceMetadata;

    fn notifier(dispatcher: Arc<FakeDispatcher>) -> AuditNotifier {
        AuditNotifier::new(dispatcher, vec!["audit@x.com".to_owned()])
    }

    fn traced_success(user_email: Option<&str>) -> JobTracer {
        let mut tracer = JobTracer::new();
        tracer.add_metadata(TraceMetadata {
            repository_html_url: Some("https://git.example/r1".to_owned()),
            job_type: Some("analyze".to_owned()),
            user_email: user_email.map(str::to_owned),
            ..Default::default()
        });
        tracer
    }

    #[tokio::test]
    async fn test_success_emails_the_user() {
        let dispatcher = Arc::new(FakeDispatcher::default());
        let mut tracer = traced_success(Some("u@x"));

        notifier(dispatcher.clone()).notify(&mut tracer).await;

        let sent = dispatcher.sent();
        assert_eq!(sent.len(), 1);
        let (to, template, context) = &sent[0];
        assert_eq!(to.as_slice(), &["u@x".to_owned()]);
        assert_eq!(*template, Template::ProjectAnalysisSuccess);
        assert_eq!(context["repository_html_url"], "https://git.example/r1");
        assert!(tracer.job_settled_at().is_some());
    }

    #[tokio::test]
    async fn test_error_emails_the_audit_recipients() {
        let dispatcher = Arc::new(FakeDispatcher::default());
        let mut tracer = traced_success(Some("u@x"));
        tracer.record_error(Some("job exploded"), Some(&anyhow::anyhow!("boom")));

        notifier(dispatcher.clone()).notify(&mut tracer).await;

        let sent = dispatcher.sent();
        assert_eq!(sent.len(), 1);
        let (to, template, context) = &sent[0];
        assert_eq!(to.as_slice(), &["audit@x.com".to_owned()]);
        assert_eq!(*template, Template::ProjectAnalysisFailure);
        assert_eq!(context["error_summary"], "job exploded");
        assert!(context["error_chain"].is_array());
    }

    #[tokio::test]
    async fn test_missing_user_email_degrades_to_failure() {
        let dispatcher = Arc::new(FakeDispatcher::default());
        let mut tracer = traced_success(None);

        notifier(dispatcher.clone()).notify(&mut tracer).await;

        assert!(tracer.has_error());
        let sent = dispatcher.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, Template::ProjectAnalysisFailure);
        assert_eq!(
            sent[0].2["error_summary"],
            "no user email has been provided to send the email to"
        );
    }

    #[tokio::test]
    async fn test_unconfigured_audit_recipients_do_not_crash() {
        let dispatcher = Arc::new(FakeDispatcher::default());
        let notifier = AuditNotifier::new(dispatcher.clone(), Vec::new());
        let mut tracer = traced_success(None);

        notifier.notify(&mut tracer).await;

        assert!(dispatcher.sent().is_empty());
        // Settlement is still stamped even when nothing could be dispatched.
        assert!(tracer.job_settled_at().is_some());
    }

    #[tokio::test]
    async fn test_transport_failures_are_swallowed() {
        let dispatcher = Arc::new(FakeDispatcher::default());
        dispatcher.set_fail(true);
        let mut tracer = traced_success(Some("u@x"));

        notifier(dispatcher.clone()).notify(&mut tracer).await;

        assert!(dispatcher.sent().is_empty());
    }

    #[tokio::test]
    async fn test_notify_is_idempotent_on_the_settlement_stamp() {
        let dispatcher = Arc::new(FakeDispatcher::default());
        let mut tracer = traced_success(Some("u@x"));

        let notifier = notifier(dispatcher.clone());
        notifier.notify(&mut tracer).await;
        let settled = tracer.job_settled_at();
        notifier.notify(&mut tracer).await;

        assert_eq!(tracer.job_settled_at(), settled);
        assert_eq!(dispatcher.sent().len(), 2);
    }
}
