//! Job naming, environment and shell scripts per execution mode.
//!
//! Every job runs `sh -c <script>`. The agent reads its task from `$TASK`
//! and its settings from the common environment; scripts only handle the
//! plumbing around it (log capture, queue file, time limit, flag grep).

use std::collections::BTreeMap;

use crate::config::DispatchConfig;
use crate::session::{CtfConfig, SessionRequest};

/// Orchestrators reject names longer than a DNS label.
pub const MAX_JOB_NAME_LEN: usize = 63;

/// Marker line printed by every job so the monitor can report the log path.
pub const LOG_FILE_MARKER: &str = "LOG_FILE_PATH:";
/// Prefix of lines the CTF script prints for each captured flag.
pub const FLAG_FOUND_MARKER: &str = "FLAG_FOUND:";

/// Environment keys set by the dispatcher. Request env cannot override them.
pub const RESERVED_ENV_KEYS: &[&str] = &[
    "SESSION_ID",
    "SESSION_NAME",
    "AGENT_ALIAS",
    "MODEL",
    "COST_LIMIT",
    "DEBUG",
    "TASK",
    "LOG_FILE",
    "QUEUE_FILE",
    "CTF_CHALLENGE",
    "CTF_TARGET_IP",
    "CTF_TARGET_SUBNET",
    "CTF_TIME_LIMIT_MINUTES",
];

/// Lowercase DNS-label form of `raw`: `[a-z0-9-]`, no leading, trailing or
/// doubled dashes, at most [`MAX_JOB_NAME_LEN`] characters.
pub fn sanitize_dns_label(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            out.push(c);
        } else if !out.is_empty() && !out.ends_with('-') {
            out.push('-');
        }
    }
    out.truncate(MAX_JOB_NAME_LEN);
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// Deterministic job name for a session.
///
/// `<prefix>-<session id without dashes>` for single-job modes, with
/// `-<index>` appended for parallel jobs. The prefix is shortened first so
/// the id and index always survive.
pub fn job_name(prefix: &str, session_id: &str, index: Option<usize>) -> String {
    let simple: String = session_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    let suffix = match index {
        Some(i) => format!("{}-{}", simple, i),
        None => simple,
    };

    let room = MAX_JOB_NAME_LEN.saturating_sub(suffix.len() + 1);
    let mut prefix = sanitize_dns_label(prefix);
    prefix.truncate(room);
    while prefix.ends_with('-') {
        prefix.pop();
    }

    if prefix.is_empty() {
        sanitize_dns_label(&suffix)
    } else {
        sanitize_dns_label(&format!("{}-{}", prefix, suffix))
    }
}

/// Where a job tees its output inside the container.
pub fn log_file_path(log_dir: &str, job_name: &str) -> String {
    format!("{}/{}.log", log_dir.trim_end_matches('/'), job_name)
}

pub fn queue_file_path(log_dir: &str, job_name: &str) -> String {
    format!("{}/{}.queue", log_dir.trim_end_matches('/'), job_name)
}

/// Single-quote `s` for POSIX sh.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r#"'\''"#))
}

fn is_valid_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Per-job values layered over the session request.
pub(crate) struct JobEnv<'a> {
    pub session_id: &'a str,
    pub alias: &'a str,
    pub model: &'a str,
    pub task: &'a str,
    pub log_file: &'a str,
    pub extra: &'a BTreeMap<String, String>,
}

/// Environment shared by every mode.
///
/// Request and agent env go in first; reserved keys and keys that aren't
/// valid variable names are dropped with a warning.
pub(crate) fn common_env(request: &SessionRequest, job: &JobEnv<'_>) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();

    for (key, value) in request.env.iter().chain(job.extra.iter()) {
        if RESERVED_ENV_KEYS.contains(&key.as_str()) {
            tracing::warn!(session_id = %job.session_id, key = %key, "Ignoring reserved env override");
            continue;
        }
        if !is_valid_env_key(key) {
            tracing::warn!(session_id = %job.session_id, key = %key, "Ignoring invalid env key");
            continue;
        }
        env.insert(key.clone(), value.clone());
    }

    env.insert("SESSION_ID".to_string(), job.session_id.to_string());
    env.insert("SESSION_NAME".to_string(), request.name.clone());
    env.insert("AGENT_ALIAS".to_string(), job.alias.to_string());
    env.insert("MODEL".to_string(), job.model.to_string());
    env.insert("TASK".to_string(), job.task.to_string());
    env.insert("LOG_FILE".to_string(), job.log_file.to_string());
    env.insert("DEBUG".to_string(), request.debug.to_string());
    if let Some(limit) = request.cost_limit {
        env.insert("COST_LIMIT".to_string(), limit.to_string());
    }
    env
}

/// CTF challenge variables.
pub(crate) fn ctf_env(ctf: &CtfConfig) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("CTF_CHALLENGE".to_string(), ctf.challenge_name.clone());
    env.insert(
        "CTF_TIME_LIMIT_MINUTES".to_string(),
        ctf.time_limit_minutes.to_string(),
    );
    if let Some(ref ip) = ctf.target_ip {
        env.insert("CTF_TARGET_IP".to_string(), ip.clone());
    }
    if let Some(ref subnet) = ctf.target_subnet {
        env.insert("CTF_TARGET_SUBNET".to_string(), subnet.clone());
    }
    env
}

/// Preamble: create the log directory and announce the log path.
fn preamble(config: &DispatchConfig, log_file: &str) -> String {
    format!(
        "mkdir -p {dir}\necho {marker}\n",
        dir = shell_quote(config.log_dir.trim_end_matches('/')),
        marker = shell_quote(&format!("{}{}", LOG_FILE_MARKER, log_file)),
    )
}

/// Run `invocation`, teeing combined output to `log_file`, keeping the
/// agent's exit status (plain `sh` has no `pipefail`).
fn tee_run(invocation: &str, log_file: &str) -> String {
    format!(
        "status_file=$(mktemp)\n\
         {{ {invocation} 2>&1; echo $? > \"$status_file\"; }} | tee {log}\n\
         status=$(cat \"$status_file\")\n\
         rm -f \"$status_file\"\n",
        invocation = invocation,
        log = shell_quote(log_file),
    )
}

/// Single and parallel jobs: run the agent once.
pub(crate) fn single_script(config: &DispatchConfig, log_file: &str) -> String {
    let mut script = preamble(config, log_file);
    script.push_str(&tee_run(
        &format!("{} \"$TASK\"", config.agent_command),
        log_file,
    ));
    script.push_str("exit \"$status\"\n");
    script
}

/// Heredoc delimiter that doesn't occur as a line of `content`.
fn heredoc_delimiter(content: &str) -> String {
    let mut delimiter = "JOBFLEET_QUEUE_EOF".to_string();
    let mut n = 0;
    while content.lines().any(|line| line == delimiter) {
        n += 1;
        delimiter = format!("JOBFLEET_QUEUE_EOF_{}", n);
    }
    delimiter
}

/// Queue jobs: materialize the queue file, then hand it to the agent.
///
/// The heredoc is quoted so `$`, backticks and backslashes in the queue
/// content reach the file untouched.
pub(crate) fn queue_script(config: &DispatchConfig, log_file: &str, queue_file: &str) -> String {
    let delimiter = heredoc_delimiter(queue_file);
    let mut body = queue_file.to_string();
    if !body.ends_with('\n') {
        body.push('\n');
    }

    let mut script = preamble(config, log_file);
    script.push_str("cat > \"$QUEUE_FILE\" <<'");
    script.push_str(&delimiter);
    script.push_str("'\n");
    script.push_str(&body);
    script.push_str(&delimiter);
    script.push('\n');
    script.push_str(&tee_run(
        &format!("{} --queue-file \"$QUEUE_FILE\"", config.agent_command),
        log_file,
    ));
    script.push_str("exit \"$status\"\n");
    script
}

/// CTF jobs: bounded agent run, then report every distinct flag in the log.
pub(crate) fn ctf_script(config: &DispatchConfig, log_file: &str, ctf: &CtfConfig) -> String {
    let limit_secs = u64::from(ctf.time_limit_minutes) * 60;
    let mut script = preamble(config, log_file);
    script.push_str(&tee_run(
        &format!("timeout {} {} \"$TASK\"", limit_secs, config.agent_command),
        log_file,
    ));
    script.push_str(&format!(
        "grep -oiE 'flag\\{{[^}}]*\\}}' {log} | sort -u | sed 's/^/{marker}/'\n",
        log = shell_quote(log_file),
        marker = FLAG_FOUND_MARKER,
    ));
    script.push_str("exit \"$status\"\n");
    script
}
