//! Session lifecycle facade.
//!
//! The surface an HTTP layer (or the CLI) drives: create, adopt, inspect,
//! stop, delete and export sessions. Background progress tracking is the
//! monitor's job; everything here acts immediately on request.

use std::collections::BTreeMap;
use std::sync::Arc;

use rust_decimal::Decimal;

use crate::dispatch::JobDispatcher;
use crate::error::{DispatchError, Error, Result, StoreError};
use crate::extract::{ExtractedResults, ResultExtractor};
use crate::orchestrator::{LabelSelector, Orchestrator};
use crate::progress::{ProgressAggregator, SessionProgress};
use crate::session::{
    ExecutionConfig, Session, SessionMode, SessionRequest, SessionStatus, SessionStore,
    new_session_id,
};

pub struct SessionManager {
    store: Arc<SessionStore>,
    orchestrator: Arc<dyn Orchestrator>,
    dispatcher: JobDispatcher,
    aggregator: ProgressAggregator,
    extractor: ResultExtractor,
}

fn not_found(id: &str) -> Error {
    Error::SessionNotFound { id: id.to_string() }
}

/// Finished, already notified, or stopped: `stop` leaves these alone.
fn is_settled(session: &Session) -> bool {
    session.status.is_terminal()
        || session.webhook_sent
        || session.status == SessionStatus::Stopped
}

impl SessionManager {
    pub fn new(
        store: Arc<SessionStore>,
        orchestrator: Arc<dyn Orchestrator>,
        dispatcher: JobDispatcher,
        max_log_bytes: usize,
    ) -> Self {
        Self {
            aggregator: ProgressAggregator::new(orchestrator.clone()),
            extractor: ResultExtractor::new(orchestrator.clone(), max_log_bytes),
            store,
            orchestrator,
            dispatcher,
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Validate a request, create its jobs and record the session.
    pub async fn create(&self, request: SessionRequest) -> Result<Session> {
        let exec = ExecutionConfig::from_request(&request)?;
        let id = new_session_id();

        let job_names = self.dispatcher.dispatch(&id, &exec, &request).await?;
        let session = Session::new(id.clone(), &request, exec.mode(), job_names);

        if let Err(e) = self.store.insert(session.clone()).await {
            // Jobs without a session record would never be monitored.
            if let Err(cleanup) = self.dispatcher.delete_session_jobs(&id).await {
                tracing::warn!(session_id = %id, error = %cleanup, "Failed to delete orphaned jobs");
            }
            return Err(e.into());
        }

        tracing::info!(
            session_id = %session.id,
            name = %session.name,
            mode = %session.mode,
            jobs = session.job_names.len(),
            "Session created"
        );
        Ok(session)
    }

    /// Track jobs that an external automation layer created with a
    /// `session-id` label.
    pub async fn adopt(&self, session_id: &str, request: SessionRequest) -> Result<Session> {
        if self.store.get(session_id).await.is_some() {
            return Err(StoreError::AlreadyExists {
                id: session_id.to_string(),
            }
            .into());
        }

        let mut job_names: Vec<String> = self
            .orchestrator
            .list_jobs(&LabelSelector::session(session_id))
            .await?
            .into_iter()
            .map(|j| j.name)
            .collect();
        if job_names.is_empty() {
            return Err(DispatchError::InvalidRequest(format!(
                "no jobs labeled session-id={}",
                session_id
            ))
            .into());
        }
        job_names.sort();

        let session = Session::new(session_id, &request, SessionMode::Automation, job_names);
        self.store.insert(session.clone()).await?;
        tracing::info!(
            session_id = %session_id,
            jobs = session.job_names.len(),
            "Adopted externally created jobs"
        );
        Ok(session)
    }

    pub async fn list(&self) -> Vec<Session> {
        self.store.list().await
    }

    pub async fn get(&self, id: &str) -> Result<Session> {
        self.store.get(id).await.ok_or_else(|| not_found(id))
    }

    /// Live job progress for a session.
    pub async fn progress(&self, id: &str) -> Result<SessionProgress> {
        self.get(id).await?;
        Ok(self.aggregator.progress(id).await?)
    }

    /// Findings for a session: the recorded ones once it has been finalized,
    /// otherwise read live from the jobs.
    pub async fn results(&self, id: &str) -> Result<ExtractedResults> {
        let session = self.get(id).await?;
        if session.webhook_sent {
            return Ok(ExtractedResults {
                outputs: session.outputs,
                flags_found: session.flags_found,
                vulnerabilities: session.vulnerabilities,
            });
        }
        Ok(self.extractor.extract(id).await?)
    }

    /// Stop a session's jobs and mark it `Stopped`.
    ///
    /// Finished sessions are returned unchanged. If the monitor finalizes the
    /// session while its jobs are being stopped, the finalized record wins.
    pub async fn stop(&self, id: &str) -> Result<Session> {
        let session = self.get(id).await?;
        if is_settled(&session) {
            return Ok(session);
        }

        let stopped = self.dispatcher.stop_session_jobs(id).await?;
        let session = self
            .store
            .update(id, |s| {
                if is_settled(s) {
                    return false;
                }
                s.status = SessionStatus::Stopped;
                true
            })
            .await?;
        if session.status == SessionStatus::Stopped {
            tracing::info!(session_id = %id, jobs = stopped, "Session stopped");
        } else {
            tracing::info!(
                session_id = %id,
                status = %session.status,
                "Session finished while stopping; keeping final status"
            );
        }
        Ok(session)
    }

    /// Delete a session and all of its jobs.
    ///
    /// The record is kept if job deletion fails, so the call can be retried.
    pub async fn delete(&self, id: &str) -> Result<Session> {
        self.get(id).await?;
        let deleted = self.dispatcher.delete_session_jobs(id).await?;
        let session = self.store.remove(id).await?;
        tracing::info!(session_id = %id, jobs = deleted, "Session deleted");
        Ok(session)
    }

    /// Record spend reported for a session.
    pub async fn record_cost(&self, id: &str, actual_cost: Decimal) -> Result<Session> {
        let session = self
            .store
            .update(id, |s| {
                let changed = s.actual_cost != actual_cost;
                s.actual_cost = actual_cost;
                changed
            })
            .await
            .map_err(|e| match e {
                StoreError::NotFound { id } => Error::SessionNotFound { id },
                other => other.into(),
            })?;
        if session.over_budget() {
            tracing::warn!(
                session_id = %id,
                actual = %session.actual_cost,
                limit = ?session.cost_limit,
                "Session has reached its cost limit"
            );
        }
        Ok(session)
    }

    /// Every session, keyed by id.
    pub async fn export(&self) -> BTreeMap<String, Session> {
        self.store.snapshot().await
    }
}
