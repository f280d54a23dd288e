//! Durable queue of undelivered notifications, keyed by session id.
//!
//! An entry is written before the notification is handed to a delivery
//! worker and removed only after the endpoint acknowledged it. Whatever is
//! left on disk at startup is delivered again.

use std::collections::BTreeMap;
use std::path::PathBuf;

use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::persist::{self, Loaded};
use crate::webhook::WebhookPayload;

pub struct Outbox {
    path: Option<PathBuf>,
    entries: Mutex<BTreeMap<String, WebhookPayload>>,
}

impl Outbox {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Open (or create) the outbox file. A corrupt file is backed up.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let entries = match persist::load_json_or_backup(&path)? {
            Loaded::Parsed(entries) => entries,
            Loaded::Missing | Loaded::Recovered { .. } => BTreeMap::new(),
        };
        Ok(Self {
            path: Some(path),
            entries: Mutex::new(entries),
        })
    }

    async fn persist(&self, entries: &BTreeMap<String, WebhookPayload>) -> Result<(), StoreError> {
        match self.path {
            Some(ref path) => persist::write_json_atomic(path, entries).await,
            None => Ok(()),
        }
    }

    /// Record `payload` unless its session already has a pending entry.
    /// Returns whether it was added.
    pub async fn insert_if_absent(&self, payload: &WebhookPayload) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(&payload.session_id) {
            return Ok(false);
        }
        entries.insert(payload.session_id.clone(), payload.clone());
        if let Err(e) = self.persist(&entries).await {
            entries.remove(&payload.session_id);
            return Err(e);
        }
        Ok(true)
    }

    /// Drop a delivered entry. Returns whether it was present.
    pub async fn remove(&self, session_id: &str) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock().await;
        let Some(removed) = entries.remove(session_id) else {
            return Ok(false);
        };
        if let Err(e) = self.persist(&entries).await {
            entries.insert(session_id.to_string(), removed);
            return Err(e);
        }
        Ok(true)
    }

    pub async fn contains(&self, session_id: &str) -> bool {
        self.entries.lock().await.contains_key(session_id)
    }

    /// Pending entries, ordered by session id.
    pub async fn pending(&self) -> Vec<WebhookPayload> {
        self.entries.lock().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionStatus;
    use chrono::Utc;
    use tempfile::TempDir;

    fn payload(id: &str) -> WebhookPayload {
        WebhookPayload {
            session_id: id.to_string(),
            job_name: format!("jobfleet-{}", id),
            status: SessionStatus::Completed,
            timestamp: Utc::now(),
            log_path: None,
            pod_logs: Some("done".to_string()),
            file_content: None,
        }
    }

    #[tokio::test]
    async fn test_insert_once_and_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("outbox.json");

        let outbox = Outbox::open(&path).unwrap();
        assert!(outbox.insert_if_absent(&payload("a")).await.unwrap());
        assert!(!outbox.insert_if_absent(&payload("a")).await.unwrap());
        assert!(outbox.insert_if_absent(&payload("b")).await.unwrap());

        let reopened = Outbox::open(&path).unwrap();
        let pending = reopened.pending().await;
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].session_id, "a");
        assert_eq!(pending[0].pod_logs.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn test_remove_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("outbox.json");

        let outbox = Outbox::open(&path).unwrap();
        outbox.insert_if_absent(&payload("a")).await.unwrap();
        assert!(outbox.remove("a").await.unwrap());
        assert!(!outbox.remove("a").await.unwrap());

        assert!(Outbox::open(&path).unwrap().is_empty().await);
    }
}
