//! Findings extraction from job output.
//!
//! Flags and vulnerability indicators are pulled out of each job's captured
//! output. A job whose logs can't be read contributes its error text as
//! output and no findings; the other jobs are unaffected.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, LazyLock};

use aho_corasick::{AhoCorasick, MatchKind};
use regex::Regex;
use serde::Serialize;

use crate::error::OrchestratorError;
use crate::orchestrator::{LabelSelector, Orchestrator};

static FLAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)flag\{[^}\r\n]*\}").expect("flag pattern is valid"));

static CVE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bCVE-\d{4}-\d{4,7}\b").expect("CVE pattern is valid"));

/// Vulnerability keywords and the label each one is reported under.
const VULN_KEYWORDS: &[(&str, &str)] = &[
    ("sql injection", "SQL Injection"),
    ("sqli", "SQL Injection"),
    ("cross-site scripting", "Cross-Site Scripting (XSS)"),
    ("cross site scripting", "Cross-Site Scripting (XSS)"),
    ("xss", "Cross-Site Scripting (XSS)"),
    ("command injection", "Command Injection"),
    ("os command injection", "Command Injection"),
    ("remote code execution", "Remote Code Execution (RCE)"),
    ("rce", "Remote Code Execution (RCE)"),
    ("path traversal", "Path Traversal"),
    ("directory traversal", "Path Traversal"),
    ("local file inclusion", "File Inclusion"),
    ("remote file inclusion", "File Inclusion"),
    ("lfi", "File Inclusion"),
    ("server-side request forgery", "Server-Side Request Forgery (SSRF)"),
    ("ssrf", "Server-Side Request Forgery (SSRF)"),
    ("xml external entity", "XML External Entity (XXE)"),
    ("xxe", "XML External Entity (XXE)"),
    ("cross-site request forgery", "Cross-Site Request Forgery (CSRF)"),
    ("csrf", "Cross-Site Request Forgery (CSRF)"),
    ("insecure deserialization", "Insecure Deserialization"),
    ("open redirect", "Open Redirect"),
    ("idor", "Insecure Direct Object Reference (IDOR)"),
    ("privilege escalation", "Privilege Escalation"),
    ("buffer overflow", "Buffer Overflow"),
    ("authentication bypass", "Authentication Bypass"),
];

static VULN_MATCHER: LazyLock<AhoCorasick> = LazyLock::new(|| {
    AhoCorasick::builder()
        .ascii_case_insensitive(true)
        .match_kind(MatchKind::Standard)
        .build(VULN_KEYWORDS.iter().map(|(k, _)| *k))
        .expect("vulnerability keywords are valid")
});

/// Findings from one or more outputs.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedResults {
    /// Raw output keyed by agent alias (or job name).
    pub outputs: BTreeMap<String, String>,
    pub flags_found: BTreeSet<String>,
    pub vulnerabilities: BTreeSet<String>,
}

impl ExtractedResults {
    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty() && self.flags_found.is_empty() && self.vulnerabilities.is_empty()
    }
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Flags exactly as they appear, deduplicated.
pub fn find_flags(text: &str) -> BTreeSet<String> {
    FLAG_RE
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// CVE ids (uppercased) and canonical labels for keyword hits.
///
/// Keywords only count on word boundaries, so `force` is not `rce`.
pub fn find_vulnerabilities(text: &str) -> BTreeSet<String> {
    let mut found: BTreeSet<String> = CVE_RE
        .find_iter(text)
        .map(|m| m.as_str().to_ascii_uppercase())
        .collect();

    let bytes = text.as_bytes();
    for mat in VULN_MATCHER.find_overlapping_iter(text) {
        let before_ok = mat.start() == 0 || !is_word_byte(bytes[mat.start() - 1]);
        let after_ok = mat.end() == bytes.len() || !is_word_byte(bytes[mat.end()]);
        if before_ok && after_ok {
            found.insert(VULN_KEYWORDS[mat.pattern().as_usize()].1.to_string());
        }
    }
    found
}

/// Reads job logs and extracts findings per session.
pub struct ResultExtractor {
    orchestrator: Arc<dyn Orchestrator>,
    max_log_bytes: usize,
}

impl ResultExtractor {
    pub fn new(orchestrator: Arc<dyn Orchestrator>, max_log_bytes: usize) -> Self {
        Self {
            orchestrator,
            max_log_bytes,
        }
    }

    /// Extract findings from every job of a session.
    ///
    /// Only listing the session's jobs can fail; per-job log errors are
    /// recorded as that job's output.
    pub async fn extract(&self, session_id: &str) -> Result<ExtractedResults, OrchestratorError> {
        let jobs = self
            .orchestrator
            .list_jobs(&LabelSelector::session(session_id))
            .await?;

        let mut results = ExtractedResults::default();
        for job in jobs {
            let key = job.display_alias().to_string();
            match self.orchestrator.read_logs(&job.name, self.max_log_bytes).await {
                Ok(text) => {
                    results.flags_found.extend(find_flags(&text));
                    results.vulnerabilities.extend(find_vulnerabilities(&text));
                    results.outputs.insert(key, text);
                }
                Err(e) => {
                    tracing::warn!(
                        session_id = %session_id,
                        job = %job.name,
                        error = %e,
                        "Could not read job logs"
                    );
                    results
                        .outputs
                        .insert(key, format!("error fetching logs: {}", e));
                }
            }
        }

        tracing::debug!(
            session_id = %session_id,
            flags = results.flags_found.len(),
            vulnerabilities = results.vulnerabilities.len(),
            "Extracted session results"
        );
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{InMemoryOrchestrator, JobSpec, LABEL_AGENT_ALIAS, LABEL_SESSION_ID};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_flags_case_insensitive_and_deduplicated() {
        let text = "got flag{abc}\nagain flag{abc} and FLAG{Upper_1}\nbroken flag{no close\nflag{}";
        let flags = find_flags(text);
        assert_eq!(
            flags.into_iter().collect::<Vec<_>>(),
            vec!["FLAG{Upper_1}", "flag{abc}", "flag{}"]
        );
    }

    #[test]
    fn test_flag_does_not_span_lines() {
        assert!(find_flags("flag{line one\nline two}").is_empty());
    }

    #[test]
    fn test_vulnerabilities() {
        let text = "Found cve-2021-44228 in log4j; possible SQLi on /login, \
                    reflected XSS, and Remote Code Execution. Brute force attempts only.";
        let vulns = find_vulnerabilities(text);
        assert!(vulns.contains("CVE-2021-44228"));
        assert!(vulns.contains("SQL Injection"));
        assert!(vulns.contains("Cross-Site Scripting (XSS)"));
        assert!(vulns.contains("Remote Code Execution (RCE)"));
        assert_eq!(vulns.len(), 4);
    }

    #[test]
    fn test_keywords_need_word_boundaries() {
        assert!(find_vulnerabilities("enforce sources; boxxss; idorable").is_empty());
    }

    fn spec(name: &str, session: &str, alias: &str) -> JobSpec {
        JobSpec {
            name: name.to_string(),
            image: "alpine:latest".to_string(),
            command: Vec::new(),
            env: BTreeMap::new(),
            labels: [
                (LABEL_SESSION_ID.to_string(), session.to_string()),
                (LABEL_AGENT_ALIAS.to_string(), alias.to_string()),
            ]
            .into_iter()
            .collect(),
            ttl_after_finished: std::time::Duration::from_secs(60),
            memory_limit_mb: 128,
            cpu_shares: 256,
        }
    }

    #[tokio::test]
    async fn test_extract_isolates_log_errors() {
        let orch = Arc::new(InMemoryOrchestrator::new());
        orch.create_job(&spec("j0", "s", "web")).await.unwrap();
        orch.create_job(&spec("j1", "s", "net")).await.unwrap();
        orch.set_logs("j0", "pwned: flag{web_1}\nCVE-2023-1234 confirmed")
            .await
            .unwrap();
        orch.fail_logs_of("j1").await;

        let extractor = ResultExtractor::new(orch, 4096);
        let results = extractor.extract("s").await.unwrap();

        assert!(results.flags_found.contains("flag{web_1}"));
        assert!(results.vulnerabilities.contains("CVE-2023-1234"));
        assert!(results.outputs["net"].starts_with("error fetching logs:"));
        assert!(results.outputs["web"].contains("flag{web_1}"));
    }

    #[tokio::test]
    async fn test_extract_keeps_findings_printed_after_long_output() {
        let orch = Arc::new(InMemoryOrchestrator::new());
        orch.create_job(&spec("j0", "s", "ctf")).await.unwrap();
        let mut logs = String::from("LOG_FILE_PATH:/tmp/jobfleet/j0.log\n");
        logs.push_str(&"scanning 10.0.0.0/24 ...\n".repeat(12_500));
        logs.push_str("FLAG_FOUND:flag{late}\n");
        assert!(logs.len() > 300_000);
        orch.set_logs("j0", logs).await.unwrap();

        let max = crate::config::MonitorConfig::default().max_log_bytes;
        let results = ResultExtractor::new(orch, max).extract("s").await.unwrap();

        let output = &results.outputs["ctf"];
        assert!(output.len() < max + 64);
        assert!(results.flags_found.contains("flag{late}"));
        assert_eq!(
            crate::monitor::parse_log_path(output).as_deref(),
            Some("/tmp/jobfleet/j0.log")
        );
    }
}
