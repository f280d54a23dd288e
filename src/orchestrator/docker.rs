//! Docker-backed orchestrator.
//!
//! Each job is a labeled, one-shot container. Phases come from container
//! inspection; the TTL label is enforced by [`Orchestrator::collect_expired`].

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerStateStatusEnum, HostConfig, RestartPolicy, RestartPolicyNameEnum};
use chrono::{DateTime, Utc};
use futures::StreamExt;

use crate::error::OrchestratorError;
use crate::orchestrator::{
    JobInfo, JobPhase, JobSpec, LabelSelector, LogCapture, Orchestrator, Result,
};

/// Grace period before a stopped container is killed.
const STOP_GRACE_SECS: i64 = 10;

/// Connect to the local Docker daemon.
///
/// Tries bollard's defaults (`DOCKER_HOST`, then `/var/run/docker.sock`) and
/// then the Docker Desktop socket under `$HOME`.
pub async fn connect_docker() -> Result<Docker> {
    if let Ok(docker) = Docker::connect_with_local_defaults()
        && docker.ping().await.is_ok()
    {
        return Ok(docker);
    }

    if let Some(home) = dirs::home_dir() {
        let desktop_sock = home.join(".docker/run/docker.sock");
        if desktop_sock.exists() {
            let sock_str = desktop_sock.to_string_lossy();
            if let Ok(docker) =
                Docker::connect_with_socket(&sock_str, 120, bollard::API_DEFAULT_VERSION)
                && docker.ping().await.is_ok()
            {
                return Ok(docker);
            }
        }
    }

    Err(OrchestratorError::DockerNotAvailable {
        reason: "no reachable daemon at DOCKER_HOST, /var/run/docker.sock or ~/.docker/run/docker.sock"
            .to_string(),
    })
}

fn status_code(err: &BollardError) -> Option<u16> {
    match err {
        BollardError::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

fn phase_of(status: Option<ContainerStateStatusEnum>, exit_code: Option<i64>) -> JobPhase {
    match status {
        Some(ContainerStateStatusEnum::RUNNING)
        | Some(ContainerStateStatusEnum::PAUSED)
        | Some(ContainerStateStatusEnum::RESTARTING)
        | Some(ContainerStateStatusEnum::REMOVING) => JobPhase::Active,
        Some(ContainerStateStatusEnum::EXITED) => {
            if exit_code == Some(0) {
                JobPhase::Succeeded
            } else {
                JobPhase::Failed
            }
        }
        Some(ContainerStateStatusEnum::DEAD) => JobPhase::Failed,
        Some(ContainerStateStatusEnum::CREATED)
        | Some(ContainerStateStatusEnum::EMPTY)
        | None => JobPhase::Pending,
    }
}

/// Docker reports unfinished containers as `0001-01-01T00:00:00Z`.
fn parse_finished_at(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(raw?).ok()?.with_timezone(&Utc);
    (parsed.timestamp() > 0).then_some(parsed)
}

/// Orchestrator that runs jobs as Docker containers.
pub struct DockerOrchestrator {
    docker: Docker,
}

impl DockerOrchestrator {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// Connect to the local daemon.
    pub async fn connect() -> Result<Self> {
        Ok(Self::new(connect_docker().await?))
    }

    fn container_config(spec: &JobSpec) -> Config<String> {
        let restart_policy = RestartPolicy {
            name: Some(RestartPolicyNameEnum::NO),
            maximum_retry_count: None,
        };

        let host_config = HostConfig {
            memory: Some((spec.memory_limit_mb * 1024 * 1024) as i64),
            cpu_shares: Some(i64::from(spec.cpu_shares)),
            network_mode: Some("bridge".to_string()),
            restart_policy: Some(restart_policy),
            cap_drop: Some(vec!["ALL".to_string()]),
            cap_add: Some(vec!["CHOWN".to_string()]),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            tmpfs: Some(
                [("/tmp".to_string(), "size=512M".to_string())]
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        };

        Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            env: Some(
                spec.env
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect(),
            ),
            labels: Some(
                spec.labels
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    async fn inspect(&self, name: &str, labels: BTreeMap<String, String>) -> Result<Option<JobInfo>> {
        let inspected = match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(i) => i,
            // Removed between list and inspect.
            Err(e) if status_code(&e) == Some(404) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let state = inspected.state.unwrap_or_default();
        let phase = phase_of(state.status, state.exit_code);
        let finished_at = if phase.is_finished() {
            parse_finished_at(state.finished_at.as_deref())
        } else {
            None
        };

        Ok(Some(JobInfo {
            name: name.to_string(),
            labels,
            phase,
            finished_at,
        }))
    }
}

#[async_trait]
impl Orchestrator for DockerOrchestrator {
    async fn create_job(&self, spec: &JobSpec) -> Result<()> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(Some(options), Self::container_config(spec))
            .await
            .map_err(|e| match status_code(&e) {
                Some(409) => OrchestratorError::JobAlreadyExists {
                    job_name: spec.name.clone(),
                },
                _ => OrchestratorError::JobCreationFailed {
                    job_name: spec.name.clone(),
                    reason: e.to_string(),
                },
            })?;

        if let Err(e) = self
            .docker
            .start_container::<String>(&response.id, None)
            .await
        {
            if let Err(rm) = self
                .docker
                .remove_container(
                    &response.id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await
            {
                tracing::warn!(job = %spec.name, error = %rm, "Failed to remove unstarted container");
            }
            return Err(OrchestratorError::JobCreationFailed {
                job_name: spec.name.clone(),
                reason: format!("failed to start container: {}", e),
            });
        }

        tracing::info!(
            job = %spec.name,
            container_id = %response.id,
            "Created and started job container"
        );
        Ok(())
    }

    async fn list_jobs(&self, selector: &LabelSelector) -> Result<Vec<JobInfo>> {
        let mut filters = HashMap::new();
        if !selector.terms().is_empty() {
            filters.insert(
                "label".to_string(),
                selector
                    .terms()
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect::<Vec<_>>(),
            );
        }

        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;

        let mut jobs = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let Some(name) = summary
                .names
                .as_ref()
                .and_then(|names| names.first())
                .map(|n| n.trim_start_matches('/').to_string())
            else {
                continue;
            };
            let labels: BTreeMap<String, String> =
                summary.labels.unwrap_or_default().into_iter().collect();
            if let Some(info) = self.inspect(&name, labels).await? {
                jobs.push(info);
            }
        }
        Ok(jobs)
    }

    async fn stop_job(&self, name: &str) -> Result<()> {
        match self
            .docker
            .stop_container(name, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
            .await
        {
            Ok(()) => Ok(()),
            // Already stopped.
            Err(e) if status_code(&e) == Some(304) => Ok(()),
            Err(e) if status_code(&e) == Some(404) => Err(OrchestratorError::JobNotFound {
                job_name: name.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_job(&self, name: &str) -> Result<()> {
        self.docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| match status_code(&e) {
                Some(404) => OrchestratorError::JobNotFound {
                    job_name: name.to_string(),
                },
                _ => e.into(),
            })
    }

    async fn read_logs(&self, name: &str, max_bytes: usize) -> Result<String> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            ..Default::default()
        };

        let mut stream = self.docker.logs(name, Some(options));
        let mut capture = LogCapture::new(max_bytes);

        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message })
                | Ok(LogOutput::StdErr { message })
                | Ok(LogOutput::Console { message }) => {
                    capture.push(&String::from_utf8_lossy(&message));
                }
                Ok(LogOutput::StdIn { .. }) => {}
                Err(e) if status_code(&e) == Some(404) => {
                    return Err(OrchestratorError::JobNotFound {
                        job_name: name.to_string(),
                    });
                }
                Err(e) => {
                    return Err(OrchestratorError::LogReadFailed {
                        job_name: name.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        if capture.omitted() > 0 {
            tracing::debug!(job = %name, omitted = capture.omitted(), "Job output truncated");
        }
        Ok(capture.finish())
    }

    async fn collect_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let mut removed = 0;
        for job in self.list_jobs(&LabelSelector::managed()).await? {
            if !job.is_expired(now) {
                continue;
            }
            match self.delete_job(&job.name).await {
                Ok(()) | Err(OrchestratorError::JobNotFound { .. }) => removed += 1,
                Err(e) => {
                    tracing::warn!(job = %job.name, error = %e, "Failed to remove expired job");
                }
            }
        }
        Ok(removed)
    }
}
