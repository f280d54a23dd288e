//! Session repository.
//!
//! All reads and writes of the session map go through [`SessionStore`]. The
//! map sits behind a single `RwLock`; mutations persist the whole map while
//! the write lock is held, so the file on disk always reflects a prefix of
//! the mutation order. A mutation whose write fails is not applied in memory
//! either.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::Utc;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::persist::{self, Loaded};
use crate::session::Session;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// In-memory session map mirrored to a JSON file.
pub struct SessionStore {
    path: Option<PathBuf>,
    sessions: RwLock<BTreeMap<String, Session>>,
}

impl SessionStore {
    /// A store with no backing file.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            sessions: RwLock::new(BTreeMap::new()),
        }
    }

    /// Open (or create) a store backed by `path`.
    ///
    /// A corrupt file is moved to `<path>.backup` and the store starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let sessions = match persist::load_json_or_backup::<BTreeMap<String, Session>>(&path)? {
            Loaded::Parsed(map) => {
                tracing::info!(
                    path = %path.display(),
                    sessions = map.len(),
                    "Loaded persisted sessions"
                );
                map
            }
            Loaded::Missing => {
                tracing::debug!(path = %path.display(), "No persisted sessions, starting empty");
                BTreeMap::new()
            }
            Loaded::Recovered { .. } => BTreeMap::new(),
        };

        Ok(Self {
            path: Some(path),
            sessions: RwLock::new(sessions),
        })
    }

    async fn persist_locked(&self, sessions: &BTreeMap<String, Session>) -> Result<()> {
        match self.path {
            Some(ref path) => persist::write_json_atomic(path, sessions).await,
            None => Ok(()),
        }
    }

    /// Write the current map to disk.
    pub async fn save(&self) -> Result<()> {
        let sessions = self.sessions.read().await;
        self.persist_locked(&sessions).await
    }

    /// Insert a new session. Fails if the id is already taken.
    pub async fn insert(&self, session: Session) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.id) {
            return Err(StoreError::AlreadyExists { id: session.id });
        }
        let id = session.id.clone();
        sessions.insert(id.clone(), session);
        if let Err(e) = self.persist_locked(&sessions).await {
            sessions.remove(&id);
            return Err(e);
        }
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<Session> {
        self.sessions.read().await.get(id).cloned()
    }

    /// All sessions, ordered by id.
    pub async fn list(&self) -> Vec<Session> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Sessions the monitor should still poll, ordered by id.
    pub async fn monitored(&self) -> Vec<Session> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.needs_monitoring())
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Copy of the full map.
    pub async fn snapshot(&self) -> BTreeMap<String, Session> {
        self.sessions.read().await.clone()
    }

    /// Apply `f` to a session under the write lock.
    ///
    /// `f` works on a copy and returns whether it changed anything. Only then
    /// is `updated_at` bumped and the map persisted; the copy replaces the
    /// stored session once the write succeeded. Returns the stored session.
    pub async fn update<F>(&self, id: &str, f: F) -> Result<Session>
    where
        F: FnOnce(&mut Session) -> bool,
    {
        let mut sessions = self.sessions.write().await;
        let current = sessions.get(id).ok_or_else(|| StoreError::NotFound {
            id: id.to_string(),
        })?;

        let mut next = current.clone();
        if !f(&mut next) {
            return Ok(current.clone());
        }
        next.updated_at = Utc::now();

        let previous = sessions.insert(id.to_string(), next.clone());
        if let Err(e) = self.persist_locked(&sessions).await {
            if let Some(previous) = previous {
                sessions.insert(id.to_string(), previous);
            }
            return Err(e);
        }
        Ok(next)
    }

    /// Set `webhook_sent`. Returns `false` if it was already set.
    pub async fn mark_webhook_sent(&self, id: &str) -> Result<bool> {
        let mut first = false;
        self.update(id, |s| {
            if s.webhook_sent {
                return false;
            }
            s.webhook_sent = true;
            first = true;
            true
        })
        .await?;
        Ok(first)
    }

    /// Set `webhook_delivered`. Missing sessions are ignored, since a session
    /// may be deleted while its notification is in flight.
    pub async fn mark_webhook_delivered(&self, id: &str) -> Result<()> {
        match self
            .update(id, |s| {
                let changed = !s.webhook_delivered;
                s.webhook_delivered = true;
                changed
            })
            .await
        {
            Ok(_) | Err(StoreError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Remove a session and persist.
    pub async fn remove(&self, id: &str) -> Result<Session> {
        let mut sessions = self.sessions.write().await;
        let removed = sessions.remove(id).ok_or_else(|| StoreError::NotFound {
            id: id.to_string(),
        })?;
        if let Err(e) = self.persist_locked(&sessions).await {
            sessions.insert(id.to_string(), removed);
            return Err(e);
        }
        Ok(removed)
    }
}
