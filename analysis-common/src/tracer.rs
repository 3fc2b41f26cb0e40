//! # Job tracer
//!
//! Per-job provenance: identifiers, timing marks, and structured error
//! chains. The tracer is the source of truth for the audit event emitted
//! when a job settles. It lives in memory only; nothing here is persisted.

use std::panic::Location;

use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Messages captured per chain node are capped at this many characters.
const MSG_LIMIT: usize = 200;
/// The formatted stacktrace is capped at this many characters.
const STACKTRACE_LIMIT: usize = 14_000;

/// Enumeration of validation errors for tracer mutations.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TraceError {
    #[error("{field} cannot be before {earlier}")]
    OutOfOrder {
        field: &'static str,
        earlier: &'static str,
    },
}

/// One node of a captured error chain, outermost first.
///
/// Rust exposes neither function names nor dynamic type names through
/// `dyn Error`, so each node carries a `kind` drawn from the worker's error
/// taxonomy next to the display message. The record-site source location
/// fills `file`/`line` on the outermost node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub depth: usize,
    pub kind: String,
    pub msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

/// Identity fields patched onto a tracer. Only populated fields are applied.
#[derive(Debug, Clone, Default)]
pub struct TraceMetadata {
    pub repo_id: Option<String>,
    pub user_id: Option<String>,
    pub job_context_id: Option<String>,
    pub job_type: Option<String>,
    pub repository_branch: Option<String>,
    pub repository_html_url: Option<String>,
    pub user_email: Option<String>,
}

/// Provenance record for one job attempt.
#[derive(Debug, Clone, Default)]
pub struct JobTracer {
    repository_html_url: Option<String>,
    user_email: Option<String>,
    repository_branch: Option<String>,
    job_context_id: Option<String>,
    job_type: Option<String>,
    repo_id: Option<String>,
    user_id: Option<String>,

    job_queued_at: Option<DateTime<FixedOffset>>,
    job_started_at: Option<DateTime<FixedOffset>>,
    job_finished_at: Option<DateTime<FixedOffset>>,
    job_settled_at: Option<DateTime<FixedOffset>>,

    error_type: Option<String>,
    error_stacktrace: Option<String>,
    error_stacktrace_truncated: bool,
    error_summary: Option<String>,
    error_chain: Option<Vec<ErrorFrame>>,
}

impl JobTracer {
    /// A fresh tracer with `job_queued_at` stamped now.
    pub fn new() -> Self {
        Self::queued_at(Utc::now().fixed_offset())
    }

    /// A fresh tracer queued at an explicit instant.
    pub fn queued_at(when: DateTime<FixedOffset>) -> Self {
        Self {
            job_queued_at: Some(when),
            ..Default::default()
        }
    }

    pub fn user_email(&self) -> Option<&str> {
        self.user_email.as_deref()
    }

    pub fn job_queued_at(&self) -> Option<DateTime<FixedOffset>> {
        self.job_queued_at
    }

    pub fn job_started_at(&self) -> Option<DateTime<FixedOffset>> {
        self.job_started_at
    }

    pub fn job_finished_at(&self) -> Option<DateTime<FixedOffset>> {
        self.job_finished_at
    }

    pub fn job_settled_at(&self) -> Option<DateTime<FixedOffset>> {
        self.job_settled_at
    }

    pub fn error_chain(&self) -> Option<&[ErrorFrame]> {
        self.error_chain.as_deref()
    }

    /// Start to finish, in milliseconds.
    pub fn run_ms(&self) -> Option<i64> {
        Some((self.job_finished_at? - self.job_started_at?).num_milliseconds())
    }

    /// Queued to settled, in milliseconds.
    pub fn total_ms(&self) -> Option<i64> {
        Some((self.job_settled_at? - self.job_queued_at?).num_milliseconds())
    }

    pub fn has_error(&self) -> bool {
        let set = |field: &Option<String>| field.as_deref().is_some_and(|s| !s.is_empty());

        set(&self.error_type) || set(&self.error_stacktrace) || set(&self.error_summary)
    }

    /// Patch identity fields. Fields left unset in the patch are untouched.
    pub fn add_metadata(&mut self, patch: TraceMetadata) -> &mut Self {
        let TraceMetadata {
            repo_id,
            user_id,
            job_context_id,
            job_type,
            repository_branch,
            repository_html_url,
            user_email,
        } = patch;

        if let Some(repo_id) = repo_id {
            self.repo_id = Some(repo_id);
        }
        if let Some(user_id) = user_id {
            self.user_id = Some(user_id);
        }
        if let Some(job_context_id) = job_context_id {
            self.job_context_id = Some(job_context_id);
        }
        if let Some(job_type) = job_type {
            self.job_type = Some(job_type);
        }
        if let Some(repository_branch) = repository_branch {
            self.repository_branch = Some(repository_branch);
        }
        if let Some(repository_html_url) = repository_html_url {
            self.repository_html_url = Some(repository_html_url);
        }
        if let Some(user_email) = user_email {
            self.user_email = Some(user_email);
        }

        self
    }

    /// Stamp the start of processing. A second call without `force` is a
    /// no-op.
    pub fn mark_job_started(
        &mut self,
        when: Option<DateTime<FixedOffset>>,
        force: bool,
    ) -> Result<&mut Self, TraceError> {
        if self.job_started_at.is_some() && !force {
            return Ok(self);
        }
        let when = when.unwrap_or_else(|| Utc::now().fixed_offset());
        Self::check_order(Some(when), self.job_queued_at, "job_started_at", "job_queued_at")?;
        self.job_started_at = Some(when);
        Ok(self)
    }

    /// Stamp the end of processing. A second call without `force` is a no-op.
    pub fn mark_job_finished(
        &mut self,
        when: Option<DateTime<FixedOffset>>,
        force: bool,
    ) -> Result<&mut Self, TraceError> {
        if self.job_finished_at.is_some() && !force {
            return Ok(self);
        }
        let when = when.unwrap_or_else(|| Utc::now().fixed_offset());
        Self::check_order(Some(when), self.job_started_at, "job_finished_at", "job_started_at")?;
        Self::check_order(Some(when), self.job_queued_at, "job_finished_at", "job_queued_at")?;
        self.job_finished_at = Some(when);
        Ok(self)
    }

    /// Stamp settlement, the point where the queue fully acknowledged the
    /// job. A second call without `force` is a no-op.
    pub fn mark_job_settled(
        &mut self,
        when: Option<DateTime<FixedOffset>>,
        force: bool,
    ) -> Result<&mut Self, TraceError> {
        if self.job_settled_at.is_some() && !force {
            return Ok(self);
        }
        let when = when.unwrap_or_else(|| Utc::now().fixed_offset());
        Self::check_order(Some(when), self.job_finished_at, "job_settled_at", "job_finished_at")?;
        Self::check_order(Some(when), self.job_queued_at, "job_settled_at", "job_queued_at")?;
        self.job_settled_at = Some(when);
        Ok(self)
    }

    fn check_order(
        value: Option<DateTime<FixedOffset>>,
        earlier: Option<DateTime<FixedOffset>>,
        field: &'static str,
        earlier_name: &'static str,
    ) -> Result<(), TraceError> {
        if let (Some(value), Some(earlier)) = (value, earlier) {
            if value < earlier {
                return Err(TraceError::OutOfOrder {
                    field,
                    earlier: earlier_name,
                });
            }
        }
        Ok(())
    }

    /// Capture an error on the tracer. With an error value the full
    /// cause chain is walked outermost-first into `error_chain`, a plain
    /// stacktrace is formatted and capped, and a summary is derived when
    /// none is supplied. Calling this again is safe and retains the latest
    /// summary.
    #[track_caller]
    pub fn record_error(
        &mut self,
        summary: Option<&str>,
        error: Option<&anyhow::Error>,
    ) -> &mut Self {
        let caller = Location::caller();
        let mut derived_summary = None;

        if let Some(error) = error {
            let chain = build_error_chain(error, caller);

            self.error_type = Some(
                chain
                    .iter()
                    .map(|frame| frame.kind.as_str())
                    .collect::<Vec<_>>()
                    .join(" -> "),
            );

            if let Some(outer) = chain.first() {
                derived_summary = Some(format!("{}: {}", outer.kind, outer.msg));
            }

            let (stacktrace, truncated) = truncate_chars(&format!("{error:?}"), STACKTRACE_LIMIT);
            self.error_stacktrace = Some(stacktrace);
            self.error_stacktrace_truncated = truncated;
            self.error_chain = Some(chain);
        }

        self.error_summary = summary
            .map(str::to_owned)
            .or(derived_summary)
            .or_else(|| self.error_type.clone())
            .or_else(|| Some(String::new()));

        self
    }

    pub fn clear_error(&mut self) -> &mut Self {
        self.error_type = None;
        self.error_stacktrace = None;
        self.error_summary = None;
        self.error_chain = None;
        self.error_stacktrace_truncated = false;
        self
    }

    /// Snapshot the tracer into its serialized form.
    pub fn report(&self) -> TraceReport {
        TraceReport {
            repository_html_url: self.repository_html_url.clone(),
            user_email: self.user_email.clone(),
            repository_branch: self.repository_branch.clone(),
            job_context_id: self.job_context_id.clone(),
            job_type: self.job_type.clone(),
            repo_id: self.repo_id.clone(),
            user_id: self.user_id.clone(),
            job_queued_at: self.job_queued_at.as_ref().map(format_timestamp),
            job_started_at: self.job_started_at.as_ref().map(format_timestamp),
            job_finished_at: self.job_finished_at.as_ref().map(format_timestamp),
            job_settled_at: self.job_settled_at.as_ref().map(format_timestamp),
            error_type: self.error_type.clone(),
            error_stacktrace: self.error_stacktrace.clone(),
            error_stacktrace_truncated: self.error_stacktrace_truncated,
            error_summary: self.error_summary.clone(),
            error_chain: self.error_chain.clone(),
            run_ms: self.run_ms(),
            total_ms: self.total_ms(),
            has_error: self.has_error(),
        }
    }
}

/// The serialized form of a tracer, consumed by the audit notifier and its
/// email templates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceReport {
    pub repository_html_url: Option<String>,
    pub user_email: Option<String>,
    pub repository_branch: Option<String>,
    pub job_context_id: Option<String>,
    pub job_type: Option<String>,
    pub repo_id: Option<String>,
    pub user_id: Option<String>,
    pub job_queued_at: Option<String>,
    pub job_started_at: Option<String>,
    pub job_finished_at: Option<String>,
    pub job_settled_at: Option<String>,
    pub error_type: Option<String>,
    pub error_stacktrace: Option<String>,
    pub error_stacktrace_truncated: bool,
    pub error_summary: Option<String>,
    pub error_chain: Option<Vec<ErrorFrame>>,
    pub run_ms: Option<i64>,
    pub total_ms: Option<i64>,
    pub has_error: bool,
}

/// Render a timestamp as ISO-8601 with microsecond precision. UTC gets a
/// trailing `Z`; any other offset is preserved literally.
pub fn format_timestamp(when: &DateTime<FixedOffset>) -> String {
    let use_z = when.offset().local_minus_utc() == 0;
    when.to_rfc3339_opts(SecondsFormat::Micros, use_z)
}

/// Parse a timestamp rendered by [`format_timestamp`], keeping its offset.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<FixedOffset>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw)
}

fn build_error_chain(error: &anyhow::Error, caller: &Location) -> Vec<ErrorFrame> {
    let file = std::path::Path::new(caller.file())
        .file_name()
        .map(|name| name.to_string_lossy().into_owned());

    error
        .chain()
        .enumerate()
        .map(|(depth, cause)| {
            let (msg, _) = truncate_chars(&cause.to_string(), MSG_LIMIT);
            ErrorFrame {
                depth,
                kind: error_kind(cause).to_owned(),
                msg,
                file: if depth == 0 { file.clone() } else { None },
                line: if depth == 0 { Some(caller.line()) } else { None },
            }
        })
        .collect()
}

/// Map an error to its taxonomy kind via downcasts against the known
/// subsystem errors.
fn error_kind(error: &(dyn std::error::Error + 'static)) -> &'static str {
    if error.downcast_ref::<crate::pgqueue::QueueError>().is_some() {
        "queue"
    } else if error.downcast_ref::<crate::registry::RegistryError>().is_some() {
        "registry"
    } else if error.downcast_ref::<TraceError>().is_some() {
        "trace"
    } else if error.downcast_ref::<sqlx::Error>().is_some() {
        "database"
    } else if error.downcast_ref::<serde_json::Error>().is_some() {
        "serialization"
    } else if error.downcast_ref::<std::io::Error>().is_some() {
        "io"
    } else {
        "error"
    }
}

/// Truncate to a character budget, marking truncation with an ellipsis.
fn truncate_chars(text: &str, limit: usize) -> (String, bool) {
    if text.chars().count() <= limit {
        return (text.to_owned(), false);
    }

    let mut truncated: String = text.chars().take(limit.saturating_sub(1)).collect();
    truncated.push('\u{2026}');
    (truncated, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_json_diff::assert_json_eq;
    use chrono::TimeZone;

    fn utc(secs: i64) -> DateTime<FixedOffset> {
        Utc.timestamp_opt(secs, 0).unwrap().fixed_offset()
    }

    #[test]
    fn test_marks_are_idempotent_without_force() {
        let mut tracer = JobTracer::queued_at(utc(0));

        tracer.mark_job_started(Some(utc(10)), false).unwrap();
        tracer.mark_job_started(Some(utc(99)), false).unwrap();
        assert_eq!(tracer.job_started_at(), Some(utc(10)));

        tracer.mark_job_started(Some(utc(20)), true).unwrap();
        assert_eq!(tracer.job_started_at(), Some(utc(20)));
    }

    #[test]
    fn test_out_of_order_marks_are_rejected() {
        let mut tracer = JobTracer::queued_at(utc(100));

        let error = tracer.mark_job_started(Some(utc(50)), false).unwrap_err();
        assert_eq!(
            error,
            TraceError::OutOfOrder {
                field: "job_started_at",
                earlier: "job_queued_at",
            }
        );

        tracer.mark_job_started(Some(utc(110)), false).unwrap();
        assert!(tracer.mark_job_finished(Some(utc(105)), false).is_err());
        tracer.mark_job_finished(Some(utc(120)), false).unwrap();
        assert!(tracer.mark_job_settled(Some(utc(115)), false).is_err());
        tracer.mark_job_settled(Some(utc(130)), false).unwrap();
    }

    #[test]
    fn test_elapsed_milliseconds() {
        let mut tracer = JobTracer::queued_at(utc(0));
        tracer.mark_job_started(Some(utc(10)), false).unwrap();
        tracer.mark_job_finished(Some(utc(25)), false).unwrap();
        tracer.mark_job_settled(Some(utc(30)), false).unwrap();

        assert_eq!(tracer.run_ms(), Some(15_000));
        assert_eq!(tracer.total_ms(), Some(30_000));
    }

    #[test]
    fn test_add_metadata_patches_only_populated_fields() {
        let mut tracer = JobTracer::queued_at(utc(0));
        tracer.add_metadata(TraceMetadata {
            repo_id: Some("r1".to_owned()),
            user_email: Some("u@x".to_owned()),
            ..Default::default()
        });
        tracer.add_metadata(TraceMetadata {
            repo_id: Some("r2".to_owned()),
            ..Default::default()
        });

        let report = tracer.report();
        assert_eq!(report.repo_id.as_deref(), Some("r2"));
        assert_eq!(report.user_email.as_deref(), Some("u@x"));
    }

    #[test]
    fn test_record_error_walks_the_cause_chain() {
        let mut tracer = JobTracer::queued_at(utc(0));

        let root = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let error = anyhow::Error::new(root).context("failed to clone repository");
        tracer.record_error(None, Some(&error));

        let chain = tracer.error_chain().unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].depth, 0);
        assert_eq!(chain[0].kind, "error");
        assert_eq!(chain[0].msg, "failed to clone repository");
        assert!(chain[0].file.is_some());
        assert!(chain[0].line.is_some());
        assert_eq!(chain[1].depth, 1);
        assert_eq!(chain[1].kind, "io");
        assert_eq!(chain[1].msg, "disk full");
        assert_eq!(chain[1].file, None);

        let report = tracer.report();
        assert_eq!(report.error_type.as_deref(), Some("error -> io"));
        assert_eq!(
            report.error_summary.as_deref(),
            Some("error: failed to clone repository")
        );
        assert!(report.has_error);
    }

    #[test]
    fn test_record_error_supplied_summary_wins() {
        let mut tracer = JobTracer::queued_at(utc(0));
        let error = anyhow::anyhow!("boom");

        tracer.record_error(Some("job exploded"), Some(&error));
        assert_eq!(tracer.report().error_summary.as_deref(), Some("job exploded"));

        // Re-recording retains the latest summary.
        tracer.record_error(Some("still exploded"), None);
        assert_eq!(
            tracer.report().error_summary.as_deref(),
            Some("still exploded")
        );
    }

    #[test]
    fn test_summary_only_does_not_build_a_chain() {
        let mut tracer = JobTracer::queued_at(utc(0));
        tracer.record_error(Some("no user email"), None);

        assert!(tracer.error_chain().is_none());
        assert!(tracer.has_error());
    }

    #[test]
    fn test_long_messages_are_truncated() {
        let mut tracer = JobTracer::queued_at(utc(0));
        let error = anyhow::anyhow!("x".repeat(500));
        tracer.record_error(None, Some(&error));

        let chain = tracer.error_chain().unwrap();
        assert_eq!(chain[0].msg.chars().count(), 200);
        assert!(chain[0].msg.ends_with('\u{2026}'));
    }

    #[test]
    fn test_clear_error_resets_all_error_fields() {
        let mut tracer = JobTracer::queued_at(utc(0));
        tracer.record_error(Some("bad"), Some(&anyhow::anyhow!("boom")));
        assert!(tracer.has_error());

        tracer.clear_error();
        assert!(!tracer.has_error());
        assert!(tracer.error_chain().is_none());
        assert!(!tracer.report().error_stacktrace_truncated);
    }

    #[test]
    fn test_empty_summary_is_not_an_error() {
        let mut tracer = JobTracer::queued_at(utc(0));
        tracer.record_error(None, None);

        assert_eq!(tracer.report().error_summary.as_deref(), Some(""));
        assert!(!tracer.has_error());
    }

    #[test]
    fn test_utc_timestamps_render_with_trailing_z() {
        let when = utc(1_600_000_000);
        let rendered = format_timestamp(&when);

        assert!(rendered.ends_with('Z'), "got {rendered}");
        assert_eq!(parse_timestamp(&rendered).unwrap(), when);
    }

    #[test]
    fn test_non_utc_offsets_are_preserved_literally() {
        let offset = FixedOffset::east_opt(2 * 3600).unwrap();
        let when = offset.timestamp_opt(1_600_000_000, 0).unwrap();
        let rendered = format_timestamp(&when);

        assert!(rendered.ends_with("+02:00"), "got {rendered}");
        let parsed = parse_timestamp(&rendered).unwrap();
        assert_eq!(parsed, when);
        assert_eq!(parsed.offset(), when.offset());
    }

    #[test]
    fn test_report_round_trips_through_json() {
        let mut tracer = JobTracer::queued_at(utc(0));
        tracer.add_metadata(TraceMetadata {
            repo_id: Some("r1".to_owned()),
            job_type: Some("analyze".to_owned()),
            ..Default::default()
        });
        tracer.mark_job_started(Some(utc(5)), false).unwrap();
        tracer.mark_job_finished(Some(utc(9)), false).unwrap();
        tracer.mark_job_settled(Some(utc(12)), false).unwrap();
        tracer
            .record_error(None, Some(&anyhow::anyhow!("boom").context("outer")));

        let report = tracer.report();
        let serialized = serde_json::to_value(&report).unwrap();
        let parsed: TraceReport = serde_json::from_value(serialized.clone()).unwrap();

        assert_eq!(parsed, report);
        assert_json_eq!(serialized, serde_json::to_value(&parsed).unwrap());

        // Timestamps survive structurally, normalized to Z.
        let queued = parsed.job_queued_at.as_deref().unwrap();
        assert!(queued.ends_with('Z'));
        assert_eq!(parse_timestamp(queued).unwrap(), utc(0));
    }
}
