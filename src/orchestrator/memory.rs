//! In-process orchestrator.
//!
//! Keeps jobs in a map instead of running anything. Tests drive job phases
//! and logs directly; `--dry-run` uses it to exercise dispatch and the
//! monitor without a container runtime.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::error::OrchestratorError;
use crate::orchestrator::{
    JobInfo, JobPhase, JobSpec, LabelSelector, LogCapture, Orchestrator, Result,
};

#[derive(Debug, Clone)]
struct FakeJob {
    spec: JobSpec,
    info: JobInfo,
    logs: String,
}

#[derive(Default)]
struct Faults {
    create: HashSet<String>,
    logs: HashSet<String>,
    list: bool,
}

/// Job runtime backed by a map.
pub struct InMemoryOrchestrator {
    jobs: RwLock<BTreeMap<String, FakeJob>>,
    faults: RwLock<Faults>,
}

impl InMemoryOrchestrator {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(BTreeMap::new()),
            faults: RwLock::new(Faults::default()),
        }
    }

    /// Move a job to `phase`. Finished phases stamp `finished_at`.
    pub async fn set_phase(&self, name: &str, phase: JobPhase) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(name)
            .ok_or_else(|| OrchestratorError::JobNotFound {
                job_name: name.to_string(),
            })?;
        job.info.phase = phase;
        job.info.finished_at = phase.is_finished().then(Utc::now);
        Ok(())
    }

    /// Replace a job's captured output.
    pub async fn set_logs(&self, name: &str, logs: impl Into<String>) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(name)
            .ok_or_else(|| OrchestratorError::JobNotFound {
                job_name: name.to_string(),
            })?;
        job.logs = logs.into();
        Ok(())
    }

    /// Make `create_job` fail for this job name.
    pub async fn fail_creation_of(&self, name: impl Into<String>) {
        self.faults.write().await.create.insert(name.into());
    }

    /// Make `read_logs` fail for this job name.
    pub async fn fail_logs_of(&self, name: impl Into<String>) {
        self.faults.write().await.logs.insert(name.into());
    }

    /// Make every `list_jobs` call fail (or succeed again).
    pub async fn set_list_failure(&self, fail: bool) {
        self.faults.write().await.list = fail;
    }

    /// Names of all jobs currently known.
    pub async fn job_names(&self) -> Vec<String> {
        self.jobs.read().await.keys().cloned().collect()
    }

    /// The spec a job was created from.
    pub async fn spec(&self, name: &str) -> Option<JobSpec> {
        self.jobs.read().await.get(name).map(|j| j.spec.clone())
    }

    /// Backdate a finished job, for TTL tests.
    pub async fn set_finished_at(&self, name: &str, at: chrono::DateTime<Utc>) {
        if let Some(job) = self.jobs.write().await.get_mut(name) {
            job.info.finished_at = Some(at);
        }
    }
}

impl Default for InMemoryOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Orchestrator for InMemoryOrchestrator {
    async fn create_job(&self, spec: &JobSpec) -> Result<()> {
        if self.faults.read().await.create.contains(&spec.name) {
            return Err(OrchestratorError::JobCreationFailed {
                job_name: spec.name.clone(),
                reason: "injected failure".to_string(),
            });
        }

        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&spec.name) {
            return Err(OrchestratorError::JobAlreadyExists {
                job_name: spec.name.clone(),
            });
        }

        jobs.insert(
            spec.name.clone(),
            FakeJob {
                spec: spec.clone(),
                info: JobInfo {
                    name: spec.name.clone(),
                    labels: spec.labels.clone(),
                    phase: JobPhase::Pending,
                    finished_at: None,
                },
                logs: String::new(),
            },
        );
        tracing::debug!(job = %spec.name, "Created in-memory job");
        Ok(())
    }

    async fn list_jobs(&self, selector: &LabelSelector) -> Result<Vec<JobInfo>> {
        if self.faults.read().await.list {
            return Err(OrchestratorError::Api {
                reason: "injected list failure".to_string(),
            });
        }
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| selector.matches(&j.info.labels))
            .map(|j| j.info.clone())
            .collect())
    }

    async fn stop_job(&self, name: &str) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(name)
            .ok_or_else(|| OrchestratorError::JobNotFound {
                job_name: name.to_string(),
            })?;
        if !job.info.phase.is_finished() {
            job.info.phase = JobPhase::Failed;
            job.info.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn delete_job(&self, name: &str) -> Result<()> {
        self.jobs
            .write()
            .await
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| OrchestratorError::JobNotFound {
                job_name: name.to_string(),
            })
    }

    async fn read_logs(&self, name: &str, max_bytes: usize) -> Result<String> {
        if self.faults.read().await.logs.contains(name) {
            return Err(OrchestratorError::LogReadFailed {
                job_name: name.to_string(),
                reason: "injected log failure".to_string(),
            });
        }
        let jobs = self.jobs.read().await;
        let job = jobs.get(name).ok_or_else(|| OrchestratorError::JobNotFound {
            job_name: name.to_string(),
        })?;
        let mut capture = LogCapture::new(max_bytes);
        capture.push(&job.logs);
        Ok(capture.finish())
    }

    async fn collect_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, j| !j.info.is_expired(now));
        Ok(before - jobs.len())
    }
}
