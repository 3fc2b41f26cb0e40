//! Email dispatch contracts for settlement notifications.
//!
//! The worker core never talks SMTP. It builds a template context from the
//! job tracer and hands it to an [`EmailDispatcher`]; the transport behind
//! the dispatcher is somebody else's problem.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::tracer::{ErrorFrame, TraceReport};

#[derive(Error, Debug)]
pub enum MailError {
    #[error("email transport failed: {0}")]
    TransportError(String),
}

/// Templates used by the audit notifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Template {
    ProjectAnalysisFailure,
    ProjectAnalysisSuccess,
}

impl Template {
    pub fn as_str(&self) -> &'static str {
        match self {
            Template::ProjectAnalysisFailure => "project_analysis_failure",
            Template::ProjectAnalysisSuccess => "project_analysis_success",
        }
    }
}

/// Context rendered into the failure template.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProjectAnalysisFailure {
    pub repo_id: Option<String>,
    pub user_id: Option<String>,
    pub repository_html_url: Option<String>,
    pub user_email: Option<String>,
    pub repository_branch: Option<String>,
    pub job_context_id: Option<String>,
    pub job_type: Option<String>,
    pub job_queued_at: Option<String>,
    pub job_started_at: Option<String>,
    pub job_finished_at: Option<String>,
    pub job_settled_at: Option<String>,
    pub error_type: Option<String>,
    pub error_summary: Option<String>,
    pub error_chain: Option<Vec<ErrorFrame>>,
    pub run_ms: Option<i64>,
    pub total_ms: Option<i64>,
}

impl ProjectAnalysisFailure {
    pub fn from_report(report: &TraceReport) -> Self {
        Self {
            repo_id: report.repo_id.clone(),
            user_id: report.user_id.clone(),
            repository_html_url: report.repository_html_url.clone(),
            user_email: report.user_email.clone(),
            repository_branch: report.repository_branch.clone(),
            job_context_id: report.job_context_id.clone(),
            job_type: report.job_type.clone(),
            job_queued_at: report.job_queued_at.clone(),
            job_started_at: report.job_started_at.clone(),
            job_finished_at: report.job_finished_at.clone(),
            job_settled_at: report.job_settled_at.clone(),
            error_type: report.error_type.clone(),
            error_summary: report.error_summary.clone(),
            error_chain: report.error_chain.clone(),
            run_ms: report.run_ms,
            total_ms: report.total_ms,
        }
    }
}

/// Context rendered into the success template.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProjectAnalysisSuccess {
    pub repository_html_url: Option<String>,
    pub repository_branch: Option<String>,
    pub job_type: Option<String>,
    pub job_queued_at: Option<String>,
}

impl ProjectAnalysisSuccess {
    pub fn from_report(report: &TraceReport) -> Self {
        Self {
            repository_html_url: report.repository_html_url.clone(),
            repository_branch: report.repository_branch.clone(),
            job_type: report.job_type.clone(),
            job_queued_at: report.job_queued_at.clone(),
        }
    }
}

/// The dispatcher contract the worker core publishes events through.
#[async_trait]
pub trait EmailDispatcher: Send + Sync {
    async fn send_templated_html(
        &self,
        to: &[String],
        template: Template,
        context: serde_json::Value,
    ) -> Result<(), MailError>;
}

/// Recipients after option rewriting, ready for the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecipientSet {
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
}

/// Shared knobs for all outbound email.
#[derive(Debug, Clone, Default)]
pub struct EmailDispatchOptions {
    /// String prepended to subjects. Applied idempotently and
    /// case-insensitively, so an already-prefixed subject passes through.
    pub subject_prefix: Option<String>,
    /// Safety valve for non-production: when set, To is replaced with this
    /// list, Cc is cleared, and Bcc keeps `always_bcc` minus collisions.
    pub redirect_all_to: Vec<String>,
    /// Addresses silently added to Bcc on every outgoing email, minus any
    /// address already present in To or Cc.
    pub always_bcc: Vec<String>,
}

impl EmailDispatchOptions {
    pub fn rewrite_recipients(&self, to: &[String], cc: &[String], bcc: &[String]) -> RecipientSet {
        let to = dedupe(to);
        let cc = dedupe(cc);
        let bcc = dedupe(bcc);

        if !self.redirect_all_to.is_empty() {
            let redirected_to = dedupe(&self.redirect_all_to);
            let to_set: Vec<String> = redirected_to.iter().map(|a| normalize_email(a)).collect();
            let safe_bcc = dedupe(&self.always_bcc)
                .into_iter()
                .filter(|address| !to_set.contains(&normalize_email(address)))
                .collect();

            return RecipientSet {
                to: redirected_to,
                cc: Vec::new(),
                bcc: safe_bcc,
            };
        }

        let visible: Vec<String> = to
            .iter()
            .chain(cc.iter())
            .map(|a| normalize_email(a))
            .collect();
        let merged: Vec<String> = bcc
            .iter()
            .chain(self.always_bcc.iter())
            .cloned()
            .collect();
        let bcc = dedupe(&merged)
            .into_iter()
            .filter(|address| !visible.contains(&normalize_email(address)))
            .collect();

        RecipientSet { to, cc, bcc }
    }

    pub fn prefix_subject(&self, subject: &str) -> String {
        let Some(prefix) = self.subject_prefix.as_deref().filter(|p| !p.is_empty()) else {
            return subject.to_owned();
        };

        if subject.to_lowercase().starts_with(&prefix.to_lowercase()) {
            return subject.to_owned();
        }

        format!("{prefix} {subject}")
    }
}

fn normalize_email(address: &str) -> String {
    address.trim().to_lowercase()
}

/// De-duplicate preserving first-seen order.
fn dedupe(addresses: &[String]) -> Vec<String> {
    let mut seen = Vec::new();
    let mut out = Vec::new();

    for address in addresses {
        let normalized = normalize_email(address);
        if !seen.contains(&normalized) {
            seen.push(normalized);
            out.push(address.clone());
        }
    }

    out
}

/// A dispatcher that renders nothing and sends nothing: it applies the
/// recipient rewriting and logs the would-be email. The non-production
/// default until a real transport is wired.
pub struct LoggingDispatcher {
    options: EmailDispatchOptions,
}

impl LoggingDispatcher {
    pub fn new(options: EmailDispatchOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl EmailDispatcher for LoggingDispatcher {
    async fn send_templated_html(
        &self,
        to: &[String],
        template: Template,
        context: serde_json::Value,
    ) -> Result<(), MailError> {
        let recipients = self.options.rewrite_recipients(to, &[], &[]);
        let subject = self.options.prefix_subject(template.as_str());

        info!(
            template = template.as_str(),
            subject = %subject,
            to = %recipients.to.join(","),
            bcc = %recipients.bcc.join(","),
            context = %context,
            "email dispatch (dry run)"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addresses(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn test_dedupe_is_case_insensitive_and_order_preserving() {
        let list = addresses(&["A@x.com", "b@x.com", "a@x.com", "B@X.COM"]);

        assert_eq!(dedupe(&list), addresses(&["A@x.com", "b@x.com"]));
    }

    #[test]
    fn test_always_bcc_skips_addresses_already_visible() {
        let options = EmailDispatchOptions {
            always_bcc: addresses(&["audit@x.com", "user@x.com"]),
            ..Default::default()
        };

        let recipients = options.rewrite_recipients(
            &addresses(&["user@x.com"]),
            &addresses(&["cc@x.com"]),
            &[],
        );

        assert_eq!(recipients.to, addresses(&["user@x.com"]));
        assert_eq!(recipients.cc, addresses(&["cc@x.com"]));
        assert_eq!(recipients.bcc, addresses(&["audit@x.com"]));
    }

    #[test]
    fn test_redirect_replaces_to_and_clears_cc() {
        let options = EmailDispatchOptions {
            redirect_all_to: addresses(&["sink@x.com"]),
            always_bcc: addresses(&["audit@x.com", "SINK@x.com"]),
            ..Default::default()
        };

        let recipients = options.rewrite_recipients(
            &addresses(&["user@x.com"]),
            &addresses(&["cc@x.com"]),
            &addresses(&["hidden@x.com"]),
        );

        assert_eq!(recipients.to, addresses(&["sink@x.com"]));
        assert!(recipients.cc.is_empty());
        assert_eq!(recipients.bcc, addresses(&["audit@x.com"]));
    }

    #[test]
    fn test_subject_prefix_is_idempotent_and_case_insensitive() {
        let options = EmailDispatchOptions {
            subject_prefix: Some("[Analysis]".to_owned()),
            ..Default::default()
        };

        assert_eq!(options.prefix_subject("job failed"), "[Analysis] job failed");
        assert_eq!(
            options.prefix_subject("[analysis] job failed"),
            "[analysis] job failed"
        );

        let bare = EmailDispatchOptions::default();
        assert_eq!(bare.prefix_subject("job failed"), "job failed");
    }
}
