//! Job dispatch.
//!
//! Turns a validated [`ExecutionConfig`] into orchestrator jobs. Creation is
//! all-or-nothing from the caller's point of view: when job K of N fails, the
//! jobs already created for the session are deleted before the error is
//! returned.

pub mod scripts;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::DispatchConfig;
use crate::error::{DispatchError, OrchestratorError};
use crate::orchestrator::{
    JobSpec, LABEL_AGENT_ALIAS, LABEL_MANAGED_BY, LABEL_SESSION_ID, LABEL_TTL, LabelSelector,
    MANAGED_BY, Orchestrator,
};
use crate::session::{AgentConfig, ExecutionConfig, SessionRequest};

use self::scripts::{JobEnv, common_env, ctf_env, job_name, log_file_path, queue_file_path};

/// Builds job specs for sessions and submits them.
pub struct JobDispatcher {
    orchestrator: Arc<dyn Orchestrator>,
    config: DispatchConfig,
}

impl JobDispatcher {
    pub fn new(orchestrator: Arc<dyn Orchestrator>, config: DispatchConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    /// Job names a session will get, in creation order.
    pub fn job_names(&self, session_id: &str, exec: &ExecutionConfig) -> Vec<String> {
        match exec {
            ExecutionConfig::Parallel { agents } => (0..agents.len())
                .map(|i| job_name(&self.config.name_prefix, session_id, Some(i)))
                .collect(),
            _ => vec![job_name(&self.config.name_prefix, session_id, None)],
        }
    }

    fn base_spec(&self, name: String, session_id: &str, alias: Option<&str>) -> JobSpec {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_SESSION_ID.to_string(), session_id.to_string());
        labels.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string());
        labels.insert(
            LABEL_TTL.to_string(),
            self.config.ttl_after_finished_secs.to_string(),
        );
        if let Some(alias) = alias {
            labels.insert(LABEL_AGENT_ALIAS.to_string(), alias.to_string());
        }

        JobSpec {
            name,
            image: self.config.image.clone(),
            command: Vec::new(),
            env: BTreeMap::new(),
            labels,
            ttl_after_finished: Duration::from_secs(self.config.ttl_after_finished_secs),
            memory_limit_mb: self.config.memory_limit_mb,
            cpu_shares: self.config.cpu_shares,
        }
    }

    /// Agent override, then request model, then the configured default.
    fn resolve_model<'a>(
        &'a self,
        request: &'a SessionRequest,
        agent: Option<&'a AgentConfig>,
    ) -> &'a str {
        agent
            .and_then(|a| a.model.as_deref())
            .or(request.model.as_deref())
            .unwrap_or(&self.config.default_model)
    }

    /// Build every job spec for a session without touching the orchestrator.
    pub fn build_specs(
        &self,
        session_id: &str,
        exec: &ExecutionConfig,
        request: &SessionRequest,
    ) -> Vec<JobSpec> {
        let names = self.job_names(session_id, exec);
        let no_extra = BTreeMap::new();
        let task = request.task.as_deref().unwrap_or_default();

        match exec {
            ExecutionConfig::Parallel { agents } => agents
                .iter()
                .zip(names)
                .map(|(agent, name)| {
                    let alias = agent.alias.trim();
                    let log_file = log_file_path(&self.config.log_dir, &name);
                    let mut spec = self.base_spec(name, session_id, Some(alias));
                    spec.env = common_env(
                        request,
                        &JobEnv {
                            session_id,
                            alias,
                            model: self.resolve_model(request, Some(agent)),
                            task: agent.task.as_deref().unwrap_or(task),
                            log_file: &log_file,
                            extra: &agent.env,
                        },
                    );
                    spec.command = sh(scripts::single_script(&self.config, &log_file));
                    spec
                })
                .collect(),
            _ => {
                let Some(name) = names.into_iter().next() else {
                    return Vec::new();
                };
                let log_file = log_file_path(&self.config.log_dir, &name);
                let mut spec = self.base_spec(name.clone(), session_id, None);
                spec.env = common_env(
                    request,
                    &JobEnv {
                        session_id,
                        alias: &name,
                        model: self.resolve_model(request, None),
                        task,
                        log_file: &log_file,
                        extra: &no_extra,
                    },
                );

                let script = match exec {
                    ExecutionConfig::Queue { queue_file } => {
                        spec.env.insert(
                            "QUEUE_FILE".to_string(),
                            queue_file_path(&self.config.log_dir, &name),
                        );
                        scripts::queue_script(&self.config, &log_file, queue_file)
                    }
                    ExecutionConfig::Ctf(ctf) => {
                        spec.env.extend(ctf_env(ctf));
                        scripts::ctf_script(&self.config, &log_file, ctf)
                    }
                    _ => scripts::single_script(&self.config, &log_file),
                };
                spec.command = sh(script);
                vec![spec]
            }
        }
    }

    /// Create all jobs for a session. Returns their names in creation order.
    pub async fn dispatch(
        &self,
        session_id: &str,
        exec: &ExecutionConfig,
        request: &SessionRequest,
    ) -> Result<Vec<String>, DispatchError> {
        let specs = self.build_specs(session_id, exec, request);
        let total = specs.len();
        let mut created: Vec<String> = Vec::with_capacity(total);

        for (i, spec) in specs.iter().enumerate() {
            if let Err(e) = self.orchestrator.create_job(spec).await {
                tracing::error!(
                    session_id = %session_id,
                    job = %spec.name,
                    index = i + 1,
                    total,
                    error = %e,
                    "Job creation failed, rolling back session"
                );
                self.rollback(session_id, &created).await;
                return Err(DispatchError::Submission {
                    index: i + 1,
                    total,
                    source: e,
                });
            }
            created.push(spec.name.clone());
        }

        tracing::info!(
            session_id = %session_id,
            mode = %exec.mode(),
            jobs = total,
            "Dispatched session jobs"
        );
        Ok(created)
    }

    /// Best-effort removal of jobs created before a failure.
    async fn rollback(&self, session_id: &str, created: &[String]) {
        for name in created {
            if let Err(e) = self.orchestrator.delete_job(name).await {
                tracing::warn!(
                    session_id = %session_id,
                    job = %name,
                    error = %e,
                    "Failed to delete job during rollback"
                );
            }
        }
    }

    /// Stop every job of a session. Returns how many were stopped.
    pub async fn stop_session_jobs(&self, session_id: &str) -> Result<usize, OrchestratorError> {
        let jobs = self
            .orchestrator
            .list_jobs(&LabelSelector::session(session_id))
            .await?;

        let mut stopped = 0;
        let mut first_err = None;
        for job in jobs.iter().filter(|j| !j.phase.is_finished()) {
            match self.orchestrator.stop_job(&job.name).await {
                Ok(()) => stopped += 1,
                Err(OrchestratorError::JobNotFound { .. }) => {}
                Err(e) => {
                    tracing::warn!(session_id = %session_id, job = %job.name, error = %e, "Failed to stop job");
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(stopped),
        }
    }

    /// Delete every job of a session. Returns how many were deleted.
    pub async fn delete_session_jobs(&self, session_id: &str) -> Result<usize, OrchestratorError> {
        let jobs = self
            .orchestrator
            .list_jobs(&LabelSelector::session(session_id))
            .await?;

        let mut deleted = 0;
        let mut first_err = None;
        for job in &jobs {
            match self.orchestrator.delete_job(&job.name).await {
                Ok(()) | Err(OrchestratorError::JobNotFound { .. }) => deleted += 1,
                Err(e) => {
                    tracing::warn!(session_id = %session_id, job = %job.name, error = %e, "Failed to delete job");
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(deleted),
        }
    }
}

fn sh(script: String) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script]
}
