//! Terminal-state notifications.
//!
//! ```text
//!  JobMonitor ──notify()──▶ Outbox (disk) ──▶ mpsc ──▶ dispatcher task
//!                                                        │ semaphore(workers)
//!                                                        ▼
//!                                          POST <WEBHOOK_URL>, retries
//!                                                        │ 2xx
//!                                                        ▼
//!                                  outbox.remove + session.webhook_delivered
//! ```
//!
//! `notify` returns as soon as the payload is durable and queued. Delivery is
//! at-least-once; receivers deduplicate on the `Idempotency-Key` header,
//! which carries the session id.

pub mod outbox;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;

use crate::config::WebhookConfig;
use crate::error::WebhookError;
use crate::session::{SessionStatus, SessionStore};

pub use outbox::Outbox;

/// Header receivers use to deduplicate redeliveries.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Body POSTed to the webhook endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub session_id: String,
    /// First job of the session.
    pub job_name: String,
    pub status: SessionStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_logs: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_content: Option<String>,
}

/// Accepts terminal-state notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Queue `payload` for delivery. Returns once it is queued, never after
    /// network I/O.
    async fn notify(&self, payload: WebhookPayload) -> Result<(), WebhookError>;
}

/// Delay before retry number `attempt` (1-based): `initial * 2^(attempt-1)`.
fn backoff_delay(initial: Duration, attempt: u32) -> Duration {
    initial.saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
}

/// Status codes worth retrying. Other client errors won't change on retry.
fn is_retryable(status: reqwest::StatusCode) -> bool {
    status.is_server_error()
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
}

struct Delivery {
    client: reqwest::Client,
    url: String,
    secret: Option<SecretString>,
    max_attempts: u32,
    initial_backoff: Duration,
    outbox: Arc<Outbox>,
    store: Arc<SessionStore>,
}

impl Delivery {
    async fn post_once(&self, payload: &WebhookPayload) -> Result<(), WebhookError> {
        let mut request = self
            .client
            .post(&self.url)
            .header(IDEMPOTENCY_HEADER, &payload.session_id)
            .json(payload);
        if let Some(ref secret) = self.secret {
            request = request.bearer_auth(secret.expose_secret());
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(WebhookError::Status {
                status: status.as_u16(),
            })
        }
    }

    /// POST with retries. On success the outbox entry is cleared and the
    /// session marked delivered; on failure the entry stays for the next run.
    async fn deliver(&self, payload: WebhookPayload) {
        let session_id = payload.session_id.clone();
        let mut attempt = 1;
        loop {
            match self.post_once(&payload).await {
                Ok(()) => {
                    tracing::info!(session_id = %session_id, attempt, "Webhook delivered");
                    if let Err(e) = self.outbox.remove(&session_id).await {
                        tracing::error!(session_id = %session_id, error = %e, "Failed to clear outbox entry");
                    }
                    if let Err(e) = self.store.mark_webhook_delivered(&session_id).await {
                        tracing::error!(session_id = %session_id, error = %e, "Failed to record webhook delivery");
                    }
                    return;
                }
                Err(e) => {
                    let retryable = match e {
                        WebhookError::Status { status } => reqwest::StatusCode::from_u16(status)
                            .map(is_retryable)
                            .unwrap_or(false),
                        _ => true,
                    };
                    if !retryable || attempt >= self.max_attempts {
                        tracing::error!(
                            session_id = %session_id,
                            attempt,
                            error = %e,
                            "Webhook delivery failed; left in outbox for replay"
                        );
                        return;
                    }
                    let delay = backoff_delay(self.initial_backoff, attempt);
                    tracing::warn!(
                        session_id = %session_id,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Webhook delivery failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Outbox-backed webhook sender with a bounded pool of delivery workers.
pub struct WebhookNotifier {
    tx: Option<mpsc::Sender<WebhookPayload>>,
    outbox: Arc<Outbox>,
    capacity: usize,
}

impl WebhookNotifier {
    /// Start the dispatcher task and replay whatever the outbox holds.
    ///
    /// Without a URL nothing is spawned and [`Notifier::notify`] only logs.
    /// The returned handle completes after every sender is dropped and the
    /// in-flight deliveries have finished.
    pub async fn spawn(
        config: &WebhookConfig,
        outbox: Arc<Outbox>,
        store: Arc<SessionStore>,
    ) -> Result<(Self, Option<JoinHandle<()>>), WebhookError> {
        let Some(ref url) = config.url else {
            tracing::info!("WEBHOOK_URL not set; session notifications are disabled");
            return Ok((
                Self {
                    tx: None,
                    outbox,
                    capacity: config.queue_capacity,
                },
                None,
            ));
        };

        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        let delivery = Arc::new(Delivery {
            client,
            url: url.clone(),
            secret: config.secret.clone(),
            max_attempts: config.max_attempts.max(1),
            initial_backoff: config.initial_backoff,
            outbox: outbox.clone(),
            store,
        });

        // Snapshot before anything new can be queued.
        let replay = outbox.pending().await;
        if !replay.is_empty() {
            tracing::info!(pending = replay.len(), "Replaying undelivered webhooks");
        }

        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let workers = config.workers.max(1);
        let handle = tokio::spawn(run_dispatcher(rx, replay, delivery, workers));

        tracing::info!(url = %url, workers, "Webhook notifier started");
        Ok((
            Self {
                tx: Some(tx),
                outbox,
                capacity: config.queue_capacity,
            },
            Some(handle),
        ))
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, payload: WebhookPayload) -> Result<(), WebhookError> {
        let Some(ref tx) = self.tx else {
            tracing::info!(
                session_id = %payload.session_id,
                status = %payload.status,
                "No webhook endpoint configured; skipping notification"
            );
            return Ok(());
        };

        if !self.outbox.insert_if_absent(&payload).await? {
            tracing::debug!(session_id = %payload.session_id, "Notification already pending");
        }

        tx.try_send(payload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => WebhookError::QueueFull {
                capacity: self.capacity,
            },
            mpsc::error::TrySendError::Closed(_) => WebhookError::Closed,
        })
    }
}

async fn run_dispatcher(
    mut rx: mpsc::Receiver<WebhookPayload>,
    replay: Vec<WebhookPayload>,
    delivery: Arc<Delivery>,
    workers: usize,
) {
    let semaphore = Arc::new(Semaphore::new(workers));

    let mut replay = replay.into_iter();
    loop {
        let payload = match replay.next() {
            Some(p) => p,
            None => match rx.recv().await {
                Some(p) => p,
                None => break,
            },
        };

        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };
        let delivery = delivery.clone();
        tokio::spawn(async move {
            delivery.deliver(payload).await;
            drop(permit);
        });
    }

    // Wait for in-flight deliveries.
    let _ = semaphore.acquire_many(workers as u32).await;
    tracing::debug!("Webhook dispatcher stopped");
}

/// Notifier that records payloads in memory.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: tokio::sync::Mutex<Vec<WebhookPayload>>,
    fail: std::sync::atomic::AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<WebhookPayload> {
        self.sent.lock().await.clone()
    }

    /// Make subsequent `notify` calls fail (or succeed again).
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, payload: WebhookPayload) -> Result<(), WebhookError> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(WebhookError::Closed);
        }
        self.sent.lock().await.push(payload);
        Ok(())
    }
}
