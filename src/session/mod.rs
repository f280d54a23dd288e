//! Session data model.
//!
//! A session is the user-facing unit of work. It expands into one or more
//! orchestrator jobs depending on its [`ExecutionConfig`]:
//!
//! ```text
//! SessionRequest ──from_request()──▶ ExecutionConfig
//!                                      ├─ Single    → 1 job
//!                                      ├─ Parallel  → 1 job per agent alias
//!                                      ├─ Queue     → 1 job, queue file materialized first
//!                                      └─ Ctf       → 1 job, challenge env injected
//! ```

pub mod store;

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::DispatchError;

pub use store::SessionStore;

/// Execution topology of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionMode {
    Single,
    Parallel,
    Queue,
    #[serde(rename = "CTF")]
    Ctf,
    /// Jobs were created by an external automation layer and adopted here.
    Automation,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Parallel => "parallel",
            Self::Queue => "queue",
            Self::Ctf => "ctf",
            Self::Automation => "automation",
        }
    }
}

impl std::fmt::Display for SessionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Session-level status, derived from constituent job states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SessionStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Stopped,
    /// No jobs were found for the session.
    Unknown,
}

impl SessionStatus {
    /// Terminal states trigger result extraction and the webhook.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Stopped => "Stopped",
            Self::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One agent in a parallel session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    /// Distinguishes this agent's job within the session.
    pub alias: String,
    /// Task prompt; falls back to the session task.
    #[serde(default)]
    pub task: Option<String>,
    /// Model override for this agent.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Challenge wiring for CTF sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CtfConfig {
    pub challenge_name: String,
    #[serde(default)]
    pub target_ip: Option<String>,
    #[serde(default)]
    pub target_subnet: Option<String>,
    #[serde(default = "default_ctf_time_limit")]
    pub time_limit_minutes: u32,
}

fn default_ctf_time_limit() -> u32 {
    60
}

/// A session creation request as received from the API layer.
///
/// Kept verbatim on the session as `original_config`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRequest {
    pub name: String,
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub cost_limit: Option<Decimal>,
    #[serde(default)]
    pub estimated_cost: Option<Decimal>,
    #[serde(default)]
    pub debug: bool,
    /// Extra environment for every job. Reserved keys are ignored.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub parallel_agents: Vec<AgentConfig>,
    #[serde(default)]
    pub queue_items: Vec<String>,
    #[serde(default)]
    pub queue_file_content: Option<String>,
    #[serde(default)]
    pub ctf_config: Option<CtfConfig>,
}

/// Validated execution topology, resolved once at the API boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionConfig {
    Single,
    Parallel { agents: Vec<AgentConfig> },
    /// `queue_file` is the exact content written to the queue file.
    Queue { queue_file: String },
    Ctf(CtfConfig),
}

impl ExecutionConfig {
    /// Resolve the execution mode of a request.
    ///
    /// When a request carries more than one mode payload the first match in
    /// the order **Parallel > Queue > CTF > Single** wins. Callers that set
    /// several fields rely on this order.
    pub fn from_request(request: &SessionRequest) -> Result<Self, DispatchError> {
        let has_parallel = !request.parallel_agents.is_empty();
        let has_queue = !request.queue_items.is_empty()
            || request
                .queue_file_content
                .as_deref()
                .is_some_and(|c| !c.trim().is_empty());
        let has_ctf = request.ctf_config.is_some();

        let present = [has_parallel, has_queue, has_ctf]
            .iter()
            .filter(|p| **p)
            .count();
        if present > 1 {
            tracing::warn!(
                name = %request.name,
                parallel = has_parallel,
                queue = has_queue,
                ctf = has_ctf,
                "Request sets several mode payloads; using Parallel > Queue > CTF precedence"
            );
        }

        if has_parallel {
            validate_aliases(&request.parallel_agents)?;
            return Ok(Self::Parallel {
                agents: request.parallel_agents.clone(),
            });
        }

        if has_queue {
            let queue_file = match request.queue_file_content.as_deref() {
                Some(content) if !content.trim().is_empty() => content.to_string(),
                _ => request.queue_items.join("\n"),
            };
            if queue_file.trim().is_empty() {
                return Err(DispatchError::InvalidRequest(
                    "queue items are all blank".to_string(),
                ));
            }
            return Ok(Self::Queue { queue_file });
        }

        if let Some(ref ctf) = request.ctf_config {
            if ctf.challenge_name.trim().is_empty() {
                return Err(DispatchError::InvalidRequest(
                    "ctfConfig.challengeName must not be empty".to_string(),
                ));
            }
            if ctf.time_limit_minutes == 0 {
                return Err(DispatchError::InvalidRequest(
                    "ctfConfig.timeLimitMinutes must be at least 1".to_string(),
                ));
            }
            return Ok(Self::Ctf(ctf.clone()));
        }

        Ok(Self::Single)
    }

    pub fn mode(&self) -> SessionMode {
        match self {
            Self::Single => SessionMode::Single,
            Self::Parallel { .. } => SessionMode::Parallel,
            Self::Queue { .. } => SessionMode::Queue,
            Self::Ctf(_) => SessionMode::Ctf,
        }
    }

    /// Number of jobs this configuration expands into.
    pub fn job_count(&self) -> usize {
        match self {
            Self::Parallel { agents } => agents.len(),
            _ => 1,
        }
    }
}

fn validate_aliases(agents: &[AgentConfig]) -> Result<(), DispatchError> {
    let mut seen = HashSet::new();
    for agent in agents {
        let alias = agent.alias.trim();
        if alias.is_empty() {
            return Err(DispatchError::InvalidRequest(
                "every parallel agent needs a non-empty alias".to_string(),
            ));
        }
        if !seen.insert(alias) {
            return Err(DispatchError::InvalidRequest(format!(
                "duplicate agent alias '{}'",
                alias
            )));
        }
    }
    Ok(())
}

/// A session record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub name: String,
    pub mode: SessionMode,
    pub job_names: Vec<String>,
    pub status: SessionStatus,
    pub current_step: u32,
    pub total_steps: u32,
    pub completed_steps: u32,
    pub cost_limit: Option<Decimal>,
    pub estimated_cost: Option<Decimal>,
    pub actual_cost: Decimal,
    /// Raw captured output keyed by agent alias (or job name).
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    #[serde(default)]
    pub flags_found: BTreeSet<String>,
    #[serde(default)]
    pub vulnerabilities: BTreeSet<String>,
    /// Set once when the terminal notification was enqueued. Never reverts.
    #[serde(default)]
    pub webhook_sent: bool,
    /// Set when the endpoint acknowledged the notification.
    #[serde(default)]
    pub webhook_delivered: bool,
    pub original_config: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Create a session record for freshly dispatched jobs.
    pub fn new(
        id: impl Into<String>,
        request: &SessionRequest,
        mode: SessionMode,
        job_names: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        let total = job_names.len() as u32;
        Self {
            id: id.into(),
            name: request.name.clone(),
            mode,
            job_names,
            status: SessionStatus::Pending,
            current_step: 0,
            total_steps: total,
            completed_steps: 0,
            cost_limit: request.cost_limit,
            estimated_cost: request.estimated_cost,
            actual_cost: Decimal::ZERO,
            outputs: BTreeMap::new(),
            flags_found: BTreeSet::new(),
            vulnerabilities: BTreeSet::new(),
            webhook_sent: false,
            webhook_delivered: false,
            original_config: serde_json::to_value(request).unwrap_or(serde_json::Value::Null),
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the monitor still has work to do for this session.
    pub fn needs_monitoring(&self) -> bool {
        !self.webhook_sent && self.status != SessionStatus::Stopped
    }

    /// Whether spend has reached the configured limit.
    pub fn over_budget(&self) -> bool {
        self.cost_limit
            .is_some_and(|limit| self.actual_cost >= limit)
    }

    /// Representative job for notifications.
    pub fn primary_job(&self) -> Option<&str> {
        self.job_names.first().map(String::as_str)
    }
}

/// Generate a new session id.
pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
