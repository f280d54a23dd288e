//! End-to-end session flow against a local webhook receiver.
//!
//! Jobs run on the in-memory runtime; the notifier POSTs to an axum server
//! bound to an ephemeral port.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use secrecy::SecretString;
use tokio::sync::Mutex;

use jobfleet::config::{DispatchConfig, MonitorConfig, WebhookConfig};
use jobfleet::dispatch::JobDispatcher;
use jobfleet::orchestrator::{InMemoryOrchestrator, JobPhase, Orchestrator};
use jobfleet::session::{AgentConfig, SessionMode};
use jobfleet::webhook::{Outbox, WebhookNotifier, WebhookPayload};
use jobfleet::{JobMonitor, Session, SessionManager, SessionRequest, SessionStatus, SessionStore};

#[derive(Debug, Clone)]
struct Received {
    body: serde_json::Value,
    idempotency_key: Option<String>,
    authorization: Option<String>,
}

#[derive(Clone, Default)]
struct Receiver {
    received: Arc<Mutex<Vec<Received>>>,
    /// Requests answered with 500 before the receiver starts accepting.
    fail_first: Arc<AtomicUsize>,
}

async fn hook(
    State(receiver): State<Receiver>,
    headers: HeaderMap,
    body: String,
) -> StatusCode {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let remaining = receiver.fail_first.load(Ordering::SeqCst);
    if remaining > 0 {
        receiver.fail_first.store(remaining - 1, Ordering::SeqCst);
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    receiver.received.lock().await.push(Received {
        body: serde_json::from_str(&body).unwrap_or(serde_json::Value::Null),
        idempotency_key: header("idempotency-key"),
        authorization: header("authorization"),
    });
    StatusCode::OK
}

async fn start_receiver(fail_first: usize) -> (String, Receiver) {
    let receiver = Receiver::default();
    receiver.fail_first.store(fail_first, Ordering::SeqCst);
    let app = Router::new()
        .route("/hook", post(hook))
        .with_state(receiver.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}/hook", addr), receiver)
}

fn webhook_config(url: String) -> WebhookConfig {
    WebhookConfig {
        url: Some(url),
        secret: Some(SecretString::from("s3cret".to_string())),
        max_attempts: 3,
        initial_backoff: Duration::from_millis(10),
        timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

struct Harness {
    orch: Arc<InMemoryOrchestrator>,
    store: Arc<SessionStore>,
    manager: SessionManager,
    monitor: JobMonitor,
    notifier: Arc<WebhookNotifier>,
    delivery: tokio::task::JoinHandle<()>,
}

async fn harness(config: WebhookConfig) -> Harness {
    let orch = Arc::new(InMemoryOrchestrator::new());
    let dyn_orch: Arc<dyn Orchestrator> = orch.clone();
    let store = Arc::new(SessionStore::in_memory());
    let (notifier, delivery) =
        WebhookNotifier::spawn(&config, Arc::new(Outbox::in_memory()), store.clone())
            .await
            .unwrap();
    let notifier = Arc::new(notifier);

    let manager = SessionManager::new(
        store.clone(),
        dyn_orch.clone(),
        JobDispatcher::new(dyn_orch.clone(), DispatchConfig::default()),
        64 * 1024,
    );
    let monitor = JobMonitor::new(
        store.clone(),
        dyn_orch,
        notifier.clone(),
        MonitorConfig::default(),
        config.pod_log_bytes,
    );
    Harness {
        orch,
        store,
        manager,
        monitor,
        notifier,
        delivery: delivery.unwrap(),
    }
}

impl Harness {
    /// Drop every sender and wait for in-flight deliveries.
    async fn drain(self) -> Arc<SessionStore> {
        let Harness {
            store,
            manager,
            monitor,
            notifier,
            delivery,
            ..
        } = self;
        drop(monitor);
        drop(manager);
        drop(notifier);
        tokio::time::timeout(Duration::from_secs(10), delivery)
            .await
            .expect("delivery task did not finish")
            .unwrap();
        store
    }
}

#[tokio::test]
async fn test_single_session_is_delivered_once() {
    let (url, receiver) = start_receiver(0).await;
    let h = harness(webhook_config(url)).await;

    let session = h
        .manager
        .create(SessionRequest {
            name: "scan".to_string(),
            task: Some("look around".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    let job = session.job_names[0].clone();

    h.orch.set_phase(&job, JobPhase::Active).await.unwrap();
    h.monitor.poll_once().await;
    assert_eq!(
        h.store.get(&session.id).await.unwrap().status,
        SessionStatus::Running
    );

    h.orch
        .set_logs(
            &job,
            "LOG_FILE_PATH:/tmp/jobfleet/run.log\nfound flag{integration}\nCVE-2021-44228\n",
        )
        .await
        .unwrap();
    h.orch.set_phase(&job, JobPhase::Succeeded).await.unwrap();
    let report = h.monitor.poll_once().await;
    assert_eq!(report.notified, 1);

    // Later cycles have nothing to send.
    assert_eq!(h.monitor.poll_once().await.notified, 0);

    let session_id = session.id.clone();
    let store = h.drain().await;

    let received = receiver.received.lock().await.clone();
    assert_eq!(received.len(), 1);
    let hit = &received[0];
    assert_eq!(hit.idempotency_key.as_deref(), Some(session_id.as_str()));
    assert_eq!(hit.authorization.as_deref(), Some("Bearer s3cret"));
    assert_eq!(hit.body["sessionId"], session_id.as_str());
    assert_eq!(hit.body["jobName"], job.as_str());
    assert_eq!(hit.body["status"], "Completed");
    assert_eq!(hit.body["logPath"], "/tmp/jobfleet/run.log");
    assert!(hit.body.get("fileContent").is_none());

    let stored = store.get(&session_id).await.unwrap();
    assert!(stored.webhook_sent);
    assert!(stored.webhook_delivered);
    assert!(stored.flags_found.contains("flag{integration}"));
    assert!(stored.vulnerabilities.contains("CVE-2021-44228"));
}

#[tokio::test]
async fn test_parallel_failure_is_retried_until_accepted() {
    let (url, receiver) = start_receiver(2).await;
    let h = harness(webhook_config(url)).await;

    let agents = ["red", "green", "blue"]
        .iter()
        .map(|alias| AgentConfig {
            alias: alias.to_string(),
            ..Default::default()
        })
        .collect();
    let session = h
        .manager
        .create(SessionRequest {
            name: "fan-out".to_string(),
            parallel_agents: agents,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(session.job_names.len(), 3);

    let phases = [JobPhase::Succeeded, JobPhase::Succeeded, JobPhase::Failed];
    for (job, phase) in session.job_names.iter().zip(phases) {
        h.orch.set_phase(job, phase).await.unwrap();
    }
    h.monitor.poll_once().await;

    let session_id = session.id.clone();
    let store = h.drain().await;

    let received = receiver.received.lock().await.clone();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].body["status"], "Failed");
    assert_eq!(receiver.fail_first.load(Ordering::SeqCst), 0);

    let stored = store.get(&session_id).await.unwrap();
    assert_eq!(stored.status, SessionStatus::Failed);
    assert_eq!((stored.current_step, stored.completed_steps), (3, 2));
    assert!(stored.webhook_delivered);
}

#[tokio::test]
async fn test_rejected_payload_stays_in_outbox() {
    let (url, receiver) = start_receiver(usize::MAX).await;
    let outbox = Arc::new(Outbox::in_memory());
    let session_store = Arc::new(SessionStore::in_memory());
    let config = WebhookConfig {
        max_attempts: 2,
        ..webhook_config(url)
    };
    let (notifier, delivery) =
        WebhookNotifier::spawn(&config, outbox.clone(), session_store.clone())
            .await
            .unwrap();

    let orch: Arc<dyn Orchestrator> = Arc::new(InMemoryOrchestrator::new());
    let manager = SessionManager::new(
        session_store.clone(),
        orch.clone(),
        JobDispatcher::new(orch.clone(), DispatchConfig::default()),
        4096,
    );
    let session = manager
        .create(SessionRequest {
            name: "unlucky".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    let monitor = JobMonitor::new(
        session_store.clone(),
        orch.clone(),
        Arc::new(notifier),
        MonitorConfig::default(),
        1024,
    );
    let job = &session.job_names[0];
    orch.stop_job(job).await.unwrap();
    monitor.poll_once().await;
    drop(monitor);
    drop(manager);

    tokio::time::timeout(Duration::from_secs(10), delivery.unwrap())
        .await
        .expect("delivery task did not finish")
        .unwrap();

    assert!(receiver.received.lock().await.is_empty());
    assert!(outbox.contains(&session.id).await);
    let stored = session_store.get(&session.id).await.unwrap();
    assert!(stored.webhook_sent);
    assert!(!stored.webhook_delivered);
}

#[tokio::test]
async fn test_pending_outbox_entry_is_replayed_on_start() {
    let (url, receiver) = start_receiver(0).await;
    let dir = tempfile::TempDir::new().unwrap();
    let outbox_path = dir.path().join("webhook_outbox.json");

    let store = Arc::new(SessionStore::in_memory());
    let request = SessionRequest {
        name: "left over".to_string(),
        ..Default::default()
    };
    let mut session = Session::new(
        "replay-1",
        &request,
        SessionMode::Single,
        vec!["jobfleet-replay-1".to_string()],
    );
    session.status = SessionStatus::Completed;
    session.webhook_sent = true;
    store.insert(session).await.unwrap();

    // Queued by a previous run that exited before delivering.
    {
        let previous = Outbox::open(&outbox_path).unwrap();
        let payload = WebhookPayload {
            session_id: "replay-1".to_string(),
            job_name: "jobfleet-replay-1".to_string(),
            status: SessionStatus::Completed,
            timestamp: chrono::Utc::now(),
            log_path: None,
            pod_logs: Some("done".to_string()),
            file_content: None,
        };
        assert!(previous.insert_if_absent(&payload).await.unwrap());
    }

    let outbox = Arc::new(Outbox::open(&outbox_path).unwrap());
    assert_eq!(outbox.len().await, 1);
    let (notifier, delivery) =
        WebhookNotifier::spawn(&webhook_config(url), outbox.clone(), store.clone())
            .await
            .unwrap();
    drop(notifier);
    tokio::time::timeout(Duration::from_secs(10), delivery.unwrap())
        .await
        .expect("delivery task did not finish")
        .unwrap();

    let received = receiver.received.lock().await.clone();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].body["sessionId"], "replay-1");
    assert_eq!(received[0].idempotency_key.as_deref(), Some("replay-1"));
    assert!(outbox.is_empty().await);
    assert!(Outbox::open(&outbox_path).unwrap().is_empty().await);
    assert!(store.get("replay-1").await.unwrap().webhook_delivered);
}
