//! Session progress.
//!
//! Reduces the orchestrator's view of a session's jobs into counts and a
//! single [`SessionStatus`]. Nothing is cached; every call lists jobs afresh.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::OrchestratorError;
use crate::orchestrator::{JobPhase, LabelSelector, Orchestrator};
use crate::session::SessionStatus;

/// Per-job state as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl From<JobPhase> for JobState {
    fn from(phase: JobPhase) -> Self {
        match phase {
            JobPhase::Pending => Self::Pending,
            JobPhase::Active => Self::Running,
            JobPhase::Succeeded => Self::Completed,
            JobPhase::Failed => Self::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    pub name: String,
    pub alias: String,
    pub state: JobState,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Aggregated progress of one session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionProgress {
    pub session_id: String,
    pub total_jobs: u32,
    pub completed_jobs: u32,
    pub failed_jobs: u32,
    pub running_jobs: u32,
    pub pending_jobs: u32,
    pub jobs: Vec<JobProgress>,
}

impl SessionProgress {
    pub fn from_jobs(session_id: impl Into<String>, mut jobs: Vec<JobProgress>) -> Self {
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        let count = |state: JobState| jobs.iter().filter(|j| j.state == state).count() as u32;
        Self {
            session_id: session_id.into(),
            total_jobs: jobs.len() as u32,
            completed_jobs: count(JobState::Completed),
            failed_jobs: count(JobState::Failed),
            running_jobs: count(JobState::Running),
            pending_jobs: count(JobState::Pending),
            jobs,
        }
    }

    pub fn status(&self) -> SessionStatus {
        derive_status(
            self.total_jobs,
            self.completed_jobs,
            self.failed_jobs,
            self.running_jobs,
        )
    }

    /// Jobs that reached a final state.
    pub fn finished_jobs(&self) -> u32 {
        self.completed_jobs + self.failed_jobs
    }
}

/// Session status from job counts.
///
/// Rules apply in order: no jobs is `Unknown`; all jobs finished with at
/// least one failure is `Failed`; all succeeded is `Completed`; any running
/// is `Running`; otherwise `Pending`.
pub fn derive_status(total: u32, completed: u32, failed: u32, running: u32) -> SessionStatus {
    if total == 0 {
        return SessionStatus::Unknown;
    }
    if failed > 0 && completed.saturating_add(failed) == total {
        return SessionStatus::Failed;
    }
    if completed == total {
        return SessionStatus::Completed;
    }
    if running > 0 {
        return SessionStatus::Running;
    }
    SessionStatus::Pending
}

/// Reads job state for sessions from the orchestrator.
pub struct ProgressAggregator {
    orchestrator: Arc<dyn Orchestrator>,
}

impl ProgressAggregator {
    pub fn new(orchestrator: Arc<dyn Orchestrator>) -> Self {
        Self { orchestrator }
    }

    pub async fn progress(&self, session_id: &str) -> Result<SessionProgress, OrchestratorError> {
        let jobs = self
            .orchestrator
            .list_jobs(&LabelSelector::session(session_id))
            .await?;

        let jobs = jobs
            .into_iter()
            .map(|job| JobProgress {
                alias: job.display_alias().to_string(),
                state: job.phase.into(),
                finished_at: job.finished_at,
                name: job.name,
            })
            .collect();

        Ok(SessionProgress::from_jobs(session_id, jobs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatchConfig;
    use crate::dispatch::JobDispatcher;
    use crate::orchestrator::InMemoryOrchestrator;
    use crate::session::{AgentConfig, ExecutionConfig, SessionRequest};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_no_jobs_is_unknown() {
        assert_eq!(derive_status(0, 0, 0, 0), SessionStatus::Unknown);
    }

    #[test]
    fn test_rule_order() {
        assert_eq!(derive_status(3, 2, 1, 0), SessionStatus::Failed);
        assert_eq!(derive_status(3, 3, 0, 0), SessionStatus::Completed);
        // A failure with work still in flight is not final yet.
        assert_eq!(derive_status(3, 1, 1, 1), SessionStatus::Running);
        assert_eq!(derive_status(3, 1, 1, 0), SessionStatus::Pending);
        assert_eq!(derive_status(2, 0, 0, 0), SessionStatus::Pending);
    }

    #[tokio::test]
    async fn test_parallel_session_with_one_failure() {
        let orch = Arc::new(InMemoryOrchestrator::new());
        let dispatcher = JobDispatcher::new(orch.clone(), DispatchConfig::default());
        let request = SessionRequest {
            name: "trio".to_string(),
            parallel_agents: ["web", "net", "osint"]
                .iter()
                .map(|a| AgentConfig {
                    alias: a.to_string(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let exec = ExecutionConfig::from_request(&request).unwrap();
        let id = crate::session::new_session_id();
        let names = dispatcher.dispatch(&id, &exec, &request).await.unwrap();

        orch.set_phase(&names[0], JobPhase::Succeeded).await.unwrap();
        orch.set_phase(&names[1], JobPhase::Succeeded).await.unwrap();
        orch.set_phase(&names[2], JobPhase::Failed).await.unwrap();

        let aggregator = ProgressAggregator::new(orch);
        let progress = aggregator.progress(&id).await.unwrap();
        assert_eq!(
            (
                progress.total_jobs,
                progress.completed_jobs,
                progress.failed_jobs
            ),
            (3, 2, 1)
        );
        assert_eq!(progress.status(), SessionStatus::Failed);
        assert_eq!(progress.jobs[2].alias, "osint");
        assert_eq!(progress.jobs[2].state, JobState::Failed);
    }

    #[tokio::test]
    async fn test_unknown_session_has_no_jobs() {
        let aggregator = ProgressAggregator::new(Arc::new(InMemoryOrchestrator::new()));
        let progress = aggregator.progress("nope").await.unwrap();
        assert_eq!(progress.total_jobs, 0);
        assert_eq!(progress.status(), SessionStatus::Unknown);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        /// Job counts that can actually occur: every job is in one state.
        fn counts() -> impl Strategy<Value = (u32, u32, u32, u32)> {
            (0u32..20, 0u32..20, 0u32..20, 0u32..20)
                .prop_map(|(c, f, r, p)| (c + f + r + p, c, f, r))
        }

        proptest! {
            #[test]
            fn nonempty_is_never_unknown((total, c, f, r) in counts()) {
                let status = derive_status(total, c, f, r);
                prop_assert_eq!(status == SessionStatus::Unknown, total == 0);
            }

            #[test]
            fn completed_only_when_all_succeeded((total, c, f, r) in counts()) {
                let status = derive_status(total, c, f, r);
                prop_assert_eq!(status == SessionStatus::Completed, total > 0 && c == total);
            }

            #[test]
            fn failed_only_when_all_finished((total, c, f, r) in counts()) {
                let status = derive_status(total, c, f, r);
                prop_assert_eq!(
                    status == SessionStatus::Failed,
                    f > 0 && c + f == total
                );
            }

            #[test]
            fn running_needs_unfinished_running_job((total, c, f, r) in counts()) {
                if derive_status(total, c, f, r) == SessionStatus::Running {
                    prop_assert!(r > 0);
                    prop_assert!(c + f < total);
                }
            }

            #[test]
            fn terminal_matches_all_finished((total, c, f, r) in counts()) {
                let status = derive_status(total, c, f, r);
                prop_assert_eq!(status.is_terminal(), total > 0 && c + f == total);
            }
        }
    }
}
