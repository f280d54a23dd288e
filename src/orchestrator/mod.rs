//! Orchestrator client abstraction.
//!
//! Jobs are one-shot containerized units identified by name and grouped by
//! labels. The engine needs only a handful of operations from the runtime:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    Orchestrator                           │
//! │                                                           │
//! │   create_job(spec)          labels: session-id=<id>       │
//! │   list_jobs(selector)               agent-alias=<alias>   │
//! │   stop_job(name)                    managed-by=jobfleet   │
//! │   delete_job(name)                  ttl-seconds-after-... │
//! │   read_logs(name)                                         │
//! │   collect_expired()                                       │
//! └──────────────────────────────────────────────────────────┘
//!          │                                  │
//!          ▼                                  ▼
//!   DockerOrchestrator                InMemoryOrchestrator
//!   (labeled containers)              (tests, --dry-run)
//! ```

pub mod docker;
pub mod memory;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::OrchestratorError;

pub use docker::DockerOrchestrator;
pub use memory::InMemoryOrchestrator;

/// Label carrying the owning session id. Present on every job.
pub const LABEL_SESSION_ID: &str = "session-id";
/// Label distinguishing jobs within a multi-job session.
pub const LABEL_AGENT_ALIAS: &str = "agent-alias";
/// Label marking jobs created by this engine.
pub const LABEL_MANAGED_BY: &str = "managed-by";
/// Label holding the job's TTL after completion, in seconds.
pub const LABEL_TTL: &str = "ttl-seconds-after-finished";
pub const MANAGED_BY: &str = "jobfleet";

/// Result type for orchestrator operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Declarative description of one job. Jobs are one-shot and never
/// restarted.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    /// How long a finished job is kept before garbage collection.
    pub ttl_after_finished: Duration,
    pub memory_limit_mb: u64,
    pub cpu_shares: u32,
}

impl JobSpec {
    pub fn session_id(&self) -> Option<&str> {
        self.labels.get(LABEL_SESSION_ID).map(String::as_str)
    }

    pub fn agent_alias(&self) -> Option<&str> {
        self.labels.get(LABEL_AGENT_ALIAS).map(String::as_str)
    }
}

/// Native job state as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    /// Created but not yet running.
    Pending,
    Active,
    Succeeded,
    Failed,
}

impl JobPhase {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Active => write!(f, "active"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A job as observed in the runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct JobInfo {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub phase: JobPhase,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobInfo {
    /// Alias label, falling back to the job name.
    pub fn display_alias(&self) -> &str {
        self.labels
            .get(LABEL_AGENT_ALIAS)
            .map(String::as_str)
            .unwrap_or(&self.name)
    }

    /// Whether a finished job has outlived its TTL label.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        if !self.phase.is_finished() {
            return false;
        }
        let (Some(finished), Some(ttl)) = (
            self.finished_at,
            self.labels
                .get(LABEL_TTL)
                .and_then(|t| t.parse::<i64>().ok()),
        ) else {
            return false;
        };
        finished + chrono::TimeDelta::seconds(ttl) <= now
    }
}

/// Equality-based label query, e.g. `session-id=abc,agent-alias=web`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LabelSelector {
    terms: Vec<(String, String)>,
}

impl LabelSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// All jobs of one session.
    pub fn session(session_id: &str) -> Self {
        Self::new().with(LABEL_SESSION_ID, session_id)
    }

    /// All jobs created by this engine.
    pub fn managed() -> Self {
        Self::new().with(LABEL_MANAGED_BY, MANAGED_BY)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.terms.push((key.into(), value.into()));
        self
    }

    pub fn terms(&self) -> &[(String, String)] {
        &self.terms
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.terms
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
    }
}

impl std::fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rendered: Vec<String> = self
            .terms
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        write!(f, "{}", rendered.join(","))
    }
}

/// The operations the engine needs from a container orchestrator.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Submit a job. The job starts as soon as the runtime schedules it.
    async fn create_job(&self, spec: &JobSpec) -> Result<()>;

    /// All jobs whose labels match `selector`.
    async fn list_jobs(&self, selector: &LabelSelector) -> Result<Vec<JobInfo>>;

    /// Stop a running job, keeping it (and its logs) around.
    async fn stop_job(&self, name: &str) -> Result<()>;

    /// Delete a job and everything it owns.
    async fn delete_job(&self, name: &str) -> Result<()>;

    /// Combined stdout/stderr of a job. Output longer than `max_bytes` keeps
    /// its first and last bytes with an omission marker between them.
    async fn read_logs(&self, name: &str, max_bytes: usize) -> Result<String>;

    /// Remove finished jobs past their TTL. Returns how many were removed.
    async fn collect_expired(&self) -> Result<usize> {
        Ok(0)
    }
}

/// Upper bound on the head kept by [`LogCapture`].
const LOG_HEAD_BYTES: usize = 4 * 1024;

/// Bounded capture of a job's output.
///
/// Keeps the first bytes (where the log path marker is printed) and a
/// trailing window (where summaries such as `FLAG_FOUND:` lines are
/// printed). Whatever falls between is replaced by an omission marker.
pub(crate) struct LogCapture {
    head: String,
    tail: String,
    head_max: usize,
    tail_max: usize,
    omitted: usize,
}

impl LogCapture {
    pub(crate) fn new(max_bytes: usize) -> Self {
        let head_max = (max_bytes / 4).min(LOG_HEAD_BYTES);
        Self {
            head: String::new(),
            tail: String::new(),
            head_max,
            tail_max: max_bytes - head_max,
            omitted: 0,
        }
    }

    pub(crate) fn push(&mut self, mut text: &str) {
        // The head only grows until the tail has started.
        if self.tail.is_empty() && self.omitted == 0 {
            let room = self.head_max.saturating_sub(self.head.len());
            let mut cut = text.len().min(room);
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            self.head.push_str(&text[..cut]);
            text = &text[cut..];
        }
        if text.is_empty() {
            return;
        }
        self.tail.push_str(text);
        // Trim lazily so long streams aren't shifted on every chunk.
        if self.tail.len() > self.tail_max.saturating_mul(2) {
            self.trim();
        }
    }

    fn trim(&mut self) {
        if self.tail.len() <= self.tail_max {
            return;
        }
        let mut start = self.tail.len() - self.tail_max;
        while !self.tail.is_char_boundary(start) {
            start += 1;
        }
        self.tail.drain(..start);
        self.omitted += start;
    }

    /// Bytes dropped so far.
    pub(crate) fn omitted(&self) -> usize {
        self.omitted
    }

    pub(crate) fn finish(mut self) -> String {
        self.trim();
        if self.omitted == 0 {
            self.head.push_str(&self.tail);
            return self.head;
        }
        format!(
            "{}\n[... {} bytes omitted ...]\n{}",
            self.head, self.omitted, self.tail
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_selector_matching() {
        let selector = LabelSelector::session("s1").with(LABEL_AGENT_ALIAS, "web");
        assert_eq!(selector.to_string(), "session-id=s1,agent-alias=web");
        assert!(selector.matches(&labels(&[
            ("session-id", "s1"),
            ("agent-alias", "web"),
            ("managed-by", "jobfleet"),
        ])));
        assert!(!selector.matches(&labels(&[("session-id", "s1")])));
        assert!(!selector.matches(&labels(&[("session-id", "s2"), ("agent-alias", "web")])));
        assert!(LabelSelector::new().matches(&BTreeMap::new()));
    }

    #[test]
    fn test_job_expiry() {
        let now = Utc::now();
        let mut job = JobInfo {
            name: "j".to_string(),
            labels: labels(&[(LABEL_TTL, "60")]),
            phase: JobPhase::Succeeded,
            finished_at: Some(now - chrono::TimeDelta::seconds(61)),
        };
        assert!(job.is_expired(now));

        job.finished_at = Some(now - chrono::TimeDelta::seconds(10));
        assert!(!job.is_expired(now));

        job.phase = JobPhase::Active;
        job.finished_at = None;
        assert!(!job.is_expired(now));
    }

    #[test]
    fn test_display_alias_falls_back_to_name() {
        let job = JobInfo {
            name: "jobfleet-abc".to_string(),
            labels: BTreeMap::new(),
            phase: JobPhase::Pending,
            finished_at: None,
        };
        assert_eq!(job.display_alias(), "jobfleet-abc");
    }

    #[test]
    fn test_log_capture_short_output_is_untouched() {
        let mut capture = LogCapture::new(64);
        capture.push("LOG_FILE_PATH:/tmp/a.log\n");
        capture.push("done\n");
        assert_eq!(capture.omitted(), 0);
        assert_eq!(capture.finish(), "LOG_FILE_PATH:/tmp/a.log\ndone\n");
    }

    #[test]
    fn test_log_capture_keeps_head_and_tail() {
        let mut capture = LogCapture::new(1024);
        capture.push("LOG_FILE_PATH:/tmp/run.log\n");
        for _ in 0..5_000 {
            capture.push("noise noise noise\n");
        }
        capture.push("FLAG_FOUND:flag{late}\n");
        assert!(capture.omitted() > 0);

        let out = capture.finish();
        assert!(out.starts_with("LOG_FILE_PATH:/tmp/run.log\n"));
        assert!(out.ends_with("FLAG_FOUND:flag{late}\n"));
        assert!(out.contains("bytes omitted"));
        assert!(out.len() < 1024 + 64);
    }

    #[test]
    fn test_log_capture_respects_char_boundaries() {
        let mut capture = LogCapture::new(8);
        capture.push("éééééééééé");
        let out = capture.finish();
        assert!(out.starts_with('é'));
        assert!(out.ends_with("ééé"));
    }
}
