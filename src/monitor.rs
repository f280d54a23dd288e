//! Background session monitor.
//!
//! Every cycle garbage-collects expired jobs, then walks the sessions that
//! still need attention in id order:
//!
//! ```text
//!   progress ──▶ derive status ──▶ persist if changed
//!                     │
//!                     └─ Completed/Failed and not yet notified
//!                            ──▶ extract results ──▶ notify ──▶ webhook_sent
//! ```
//!
//! Failures are per session: they are logged and the session is retried on
//! the next cycle. Only the shutdown signal ends the loop.

use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::MonitorConfig;
use crate::dispatch::scripts::LOG_FILE_MARKER;
use crate::error::Error;
use crate::extract::{ExtractedResults, ResultExtractor};
use crate::orchestrator::Orchestrator;
use crate::progress::{ProgressAggregator, SessionProgress};
use crate::session::{Session, SessionStatus, SessionStore};
use crate::webhook::{Notifier, WebhookPayload};

/// What one cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub visited: usize,
    pub updated: usize,
    pub notified: usize,
    pub errors: usize,
    pub collected: usize,
}

enum Outcome {
    Unchanged,
    Updated,
    Notified,
}

/// Polls job state for every unfinished session.
pub struct JobMonitor {
    store: Arc<SessionStore>,
    orchestrator: Arc<dyn Orchestrator>,
    aggregator: ProgressAggregator,
    extractor: ResultExtractor,
    notifier: Arc<dyn Notifier>,
    config: MonitorConfig,
    pod_log_bytes: usize,
}

impl JobMonitor {
    pub fn new(
        store: Arc<SessionStore>,
        orchestrator: Arc<dyn Orchestrator>,
        notifier: Arc<dyn Notifier>,
        config: MonitorConfig,
        pod_log_bytes: usize,
    ) -> Self {
        Self {
            aggregator: ProgressAggregator::new(orchestrator.clone()),
            extractor: ResultExtractor::new(orchestrator.clone(), config.max_log_bytes),
            store,
            orchestrator,
            notifier,
            config,
            pod_log_bytes,
        }
    }

    /// Run a single monitoring cycle.
    pub async fn poll_once(&self) -> CycleReport {
        let mut report = CycleReport::default();

        if self.config.collect_garbage {
            match self.orchestrator.collect_expired().await {
                Ok(0) => {}
                Ok(n) => {
                    tracing::info!(removed = n, "Removed expired jobs");
                    report.collected = n;
                }
                Err(e) => tracing::warn!(error = %e, "Expired job collection failed"),
            }
        }

        for session in self.store.monitored().await {
            report.visited += 1;
            match self.check_session(&session).await {
                Ok(Outcome::Unchanged) => {}
                Ok(Outcome::Updated) => report.updated += 1,
                Ok(Outcome::Notified) => {
                    report.updated += 1;
                    report.notified += 1;
                }
                Err(e) => {
                    report.errors += 1;
                    tracing::error!(
                        session_id = %session.id,
                        error = %e,
                        "Session check failed, will retry next cycle"
                    );
                }
            }
        }

        report
    }

    async fn check_session(&self, session: &Session) -> Result<Outcome, Error> {
        let progress = self.aggregator.progress(&session.id).await?;
        let status = progress.status();
        let finished = progress.finished_jobs();

        let mut changed = false;
        let updated = self
            .store
            .update(&session.id, |s| {
                // Stopped by the user since this cycle started.
                if s.status == SessionStatus::Stopped {
                    return false;
                }
                changed = s.status != status
                    || s.current_step != finished
                    || s.total_steps != progress.total_jobs
                    || s.completed_steps != progress.completed_jobs;
                if changed {
                    if s.status != status {
                        tracing::info!(
                            session_id = %s.id,
                            from = %s.status,
                            to = %status,
                            "Session status changed"
                        );
                    }
                    s.status = status;
                    s.current_step = finished;
                    s.total_steps = progress.total_jobs;
                    s.completed_steps = progress.completed_jobs;
                }
                changed
            })
            .await?;

        if updated.status == SessionStatus::Stopped
            || !updated.status.is_terminal()
            || updated.webhook_sent
        {
            return Ok(if changed {
                Outcome::Updated
            } else {
                Outcome::Unchanged
            });
        }

        self.finalize(&updated, &progress).await?;
        Ok(Outcome::Notified)
    }

    /// Record results and send the terminal notification.
    async fn finalize(&self, session: &Session, progress: &SessionProgress) -> Result<(), Error> {
        let results = match self.extractor.extract(&session.id).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(session_id = %session.id, error = %e, "Result extraction failed");
                ExtractedResults::default()
            }
        };

        if !results.is_empty() {
            self.store
                .update(&session.id, |s| {
                    let before = (
                        s.outputs.clone(),
                        s.flags_found.len(),
                        s.vulnerabilities.len(),
                    );
                    s.outputs.extend(results.outputs.clone());
                    s.flags_found.extend(results.flags_found.iter().cloned());
                    s.vulnerabilities
                        .extend(results.vulnerabilities.iter().cloned());
                    before
                        != (
                            s.outputs.clone(),
                            s.flags_found.len(),
                            s.vulnerabilities.len(),
                        )
                })
                .await?;
        }

        let payload = self.build_payload(session, progress, &results);
        self.notifier.notify(payload).await?;
        self.store.mark_webhook_sent(&session.id).await?;

        tracing::info!(
            session_id = %session.id,
            status = %session.status,
            flags = results.flags_found.len(),
            "Session finished, notification queued"
        );
        Ok(())
    }

    fn build_payload(
        &self,
        session: &Session,
        progress: &SessionProgress,
        results: &ExtractedResults,
    ) -> WebhookPayload {
        let job_name = session
            .primary_job()
            .map(str::to_string)
            .or_else(|| progress.jobs.first().map(|j| j.name.clone()))
            .unwrap_or_default();

        let primary_output = progress
            .jobs
            .iter()
            .find(|j| j.name == job_name)
            .and_then(|j| results.outputs.get(&j.alias));

        WebhookPayload {
            session_id: session.id.clone(),
            log_path: results.outputs.values().find_map(|text| parse_log_path(text)),
            pod_logs: primary_output.map(|text| tail(text, self.pod_log_bytes).to_string()),
            file_content: None,
            job_name,
            status: session.status,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Poll until `shutdown` fires (or its sender is dropped).
    pub async fn run(self, shutdown: oneshot::Receiver<()>) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut shutdown = std::pin::pin!(shutdown);

        tracing::info!(
            interval_secs = self.config.poll_interval.as_secs_f64(),
            "Job monitor started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.poll_once().await;
                    if report.updated > 0 || report.errors > 0 {
                        tracing::debug!(?report, "Monitor cycle finished");
                    }
                }
                _ = &mut shutdown => {
                    tracing::info!("Job monitor shutting down");
                    break;
                }
            }
        }
    }
}

/// Handle to a spawned monitor task.
pub struct MonitorHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl MonitorHandle {
    /// Signal the monitor to stop and wait for the current cycle to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Err(e) = self.handle.await {
            tracing::error!(error = %e, "Monitor task ended abnormally");
        }
    }
}

/// Start `monitor` on the runtime.
pub fn spawn_monitor(monitor: JobMonitor) -> MonitorHandle {
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle = tokio::spawn(monitor.run(shutdown_rx));
    MonitorHandle {
        shutdown_tx: Some(shutdown_tx),
        handle,
    }
}

/// Path from the first `LOG_FILE_PATH:<path>` line of a job's output.
pub fn parse_log_path(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        line.trim()
            .strip_prefix(LOG_FILE_MARKER)
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
    })
}

/// Last `max` bytes of `text`, starting on a char boundary.
fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
