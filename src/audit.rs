//! Tamper-evident audit trail and threshold alerting.
//!
//! One JSON line per request is appended to `audit-YYYY-MM-DD.jsonl` under the audit
//! directory. Each entry carries a SHA-256 checksum over its own canonical serialization
//! (with the checksum field empty), so edits to a stored line are detectable with
//! [`AuditEntry::verify`].

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::config::AuditConfig;
use crate::policy::{RiskLevel, Tier, Verdict};

/// How a request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Succeeded,
    /// Ran but exited non-zero, or failed in transport.
    Failed,
    Blocked,
    Discovery,
    Background,
    InteractionRequired,
}

impl AuditOutcome {
    /// Outcomes that count toward the alert window.
    pub fn is_alerting(self) -> bool {
        matches!(self, AuditOutcome::Blocked | AuditOutcome::Failed)
    }
}

/// One immutable audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub event_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
    #[serde(default)]
    pub verdicts: Vec<Verdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<RiskLevel>,
    pub outcome: AuditOutcome,
    /// Whether a verified authorization code forgave a failed layer.
    #[serde(default)]
    pub escaped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub checksum: String,
}

impl AuditEntry {
    pub fn new(outcome: AuditOutcome) -> Self {
        Self {
            timestamp: Utc::now(),
            event_id: Uuid::new_v4().to_string(),
            command: None,
            action: None,
            host_id: None,
            tier: None,
            verdicts: Vec::new(),
            risk_level: None,
            outcome,
            escaped: false,
            exit_code: None,
            duration_ms: 0,
            sandbox: None,
            error: None,
            checksum: String::new(),
        }
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_host(mut self, host_id: impl Into<String>, tier: Option<Tier>) -> Self {
        self.host_id = Some(host_id.into());
        self.tier = tier;
        self
    }

    pub fn with_verdicts(mut self, verdicts: Vec<Verdict>, risk_level: Option<RiskLevel>, escaped: bool) -> Self {
        self.verdicts = verdicts;
        self.risk_level = risk_level;
        self.escaped = escaped;
        self
    }

    pub fn with_result(mut self, exit_code: Option<i32>, duration_ms: u64) -> Self {
        self.exit_code = exit_code;
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_sandbox(mut self, sandbox: Option<String>) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    fn digest(&self) -> String {
        let mut unsealed = self.clone();
        unsealed.checksum.clear();
        let canonical = serde_json::to_vec(&unsealed).unwrap_or_default();
        hex::encode(Sha256::digest(&canonical))
    }

    /// Compute and store the checksum. Call after the last builder step.
    pub fn seal(mut self) -> Self {
        self.checksum = self.digest();
        self
    }

    /// Whether the stored checksum matches the entry's content.
    pub fn verify(&self) -> bool {
        !self.checksum.is_empty() && self.checksum == self.digest()
    }
}

/// Fired when blocked/failed entries reach the threshold inside the window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub triggered_at: DateTime<Utc>,
    pub count: usize,
    pub window_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_host: Option<String>,
}

/// Append-only writer with a sliding alert window.
pub struct AuditLogger {
    dir: PathBuf,
    config: AuditConfig,
    write_lock: tokio::sync::Mutex<()>,
    window: Mutex<VecDeque<DateTime<Utc>>>,
    http: reqwest::Client,
}

impl AuditLogger {
    /// `base_dir` is the directory in which a relative `config.dir` is resolved.
    pub fn new(config: AuditConfig, base_dir: &Path) -> Self {
        let dir = crate::ssh::keys::expand_path(&config.dir, base_dir);
        Self {
            dir,
            config,
            write_lock: tokio::sync::Mutex::new(()),
            window: Mutex::new(VecDeque::new()),
            http: reqwest::Client::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("audit-{}.jsonl", date.format("%Y-%m-%d")))
    }

    /// Seal, append and feed the alert window. Returns the alert if this entry fired one.
    pub async fn record(&self, entry: AuditEntry) -> Result<Option<Alert>> {
        let entry = entry.seal();
        if self.config.enabled {
            self.append(&entry).await?;
        }
        let alert = self.observe(&entry);
        if let Some(alert) = &alert {
            self.dispatch(alert);
        }
        Ok(alert)
    }

    async fn append(&self, entry: &AuditEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry).context("serialize audit entry")?;
        line.push(b'\n');
        let path = self.file_for(entry.timestamp.date_naive());

        let _guard = self.write_lock.lock().await;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("create audit dir {}", self.dir.display()))?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("open {}", path.display()))?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    fn observe(&self, entry: &AuditEntry) -> Option<Alert> {
        if !entry.outcome.is_alerting() || self.config.alert_threshold == 0 {
            return None;
        }
        let window = i64::try_from(self.config.alert_window_secs)
            .ok()
            .and_then(ChronoDuration::try_seconds)
            .unwrap_or(ChronoDuration::MAX);
        let mut recent = self.window.lock();
        recent.push_back(entry.timestamp);
        while recent
            .front()
            .is_some_and(|t| entry.timestamp.signed_duration_since(*t) > window)
        {
            recent.pop_front();
        }
        if recent.len() < self.config.alert_threshold {
            return None;
        }
        let count = recent.len();
        recent.clear();
        Some(Alert {
            triggered_at: entry.timestamp,
            count,
            window_secs: self.config.alert_window_secs,
            last_command: entry.command.clone(),
            last_host: entry.host_id.clone(),
        })
    }

    fn dispatch(&self, alert: &Alert) {
        tracing::warn!(
            count = alert.count,
            window_secs = alert.window_secs,
            host = alert.last_host.as_deref().unwrap_or("-"),
            "security alert: blocked/failed threshold reached"
        );
        let Some(url) = self.config.webhook_url.clone() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let client = self.http.clone();
        let body = alert.clone();
        runtime.spawn(async move {
            match client.post(&url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => {
                    tracing::debug!(status = %resp.status(), "alert webhook delivered");
                }
                Ok(resp) => tracing::warn!(status = %resp.status(), "alert webhook rejected"),
                Err(err) => tracing::warn!(error = %err, "alert webhook failed"),
            }
        });
    }

    /// Read back every entry recorded on `date`.
    pub async fn read_day(&self, date: NaiveDate) -> Result<Vec<AuditEntry>> {
        let path = self.file_for(date);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
        };
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).context("parse audit line"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Layer, Severity};
    use tempfile::TempDir;

    fn logger(dir: &TempDir, threshold: usize) -> AuditLogger {
        let config = AuditConfig {
            dir: "audit".into(),
            alert_threshold: threshold,
            alert_window_secs: 60,
            ..AuditConfig::default()
        };
        AuditLogger::new(config, dir.path())
    }

    fn blocked(command: &str) -> AuditEntry {
        AuditEntry::new(AuditOutcome::Blocked)
            .with_command(command)
            .with_host("local", Some(Tier::Standard))
            .with_verdicts(
                vec![Verdict::block(Layer::Blacklist, Severity::Critical, "blacklisted")],
                None,
                false,
            )
    }

    #[test]
    fn sealed_entry_verifies_and_detects_tampering() {
        let entry = blocked("rm -rf /").seal();
        assert!(entry.verify());

        let mut tampered = entry.clone();
        tampered.command = Some("ls".into());
        assert!(!tampered.verify());

        assert!(!AuditEntry::new(AuditOutcome::Succeeded).verify());
    }

    #[test]
    fn event_ids_are_unique() {
        let a = AuditEntry::new(AuditOutcome::Succeeded);
        let b = AuditEntry::new(AuditOutcome::Succeeded);
        assert_ne!(a.event_id, b.event_id);
    }

    #[tokio::test]
    async fn entries_land_in_day_partitioned_file() -> Result<()> {
        let tmp = TempDir::new()?;
        let log = logger(&tmp, 100);
        log.record(blocked("rm -rf /")).await?;
        log.record(AuditEntry::new(AuditOutcome::Succeeded).with_command("ls")).await?;

        let today = Utc::now().date_naive();
        let path = log.file_for(today);
        assert!(path.file_name().is_some_and(|n| n.to_string_lossy().starts_with("audit-")));
        let entries = log.read_day(today).await?;
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(AuditEntry::verify));
        assert_eq!(entries[0].outcome, AuditOutcome::Blocked);
        Ok(())
    }

    #[tokio::test]
    async fn disabled_logger_writes_nothing() -> Result<()> {
        let tmp = TempDir::new()?;
        let config = AuditConfig {
            enabled: false,
            dir: "audit".into(),
            ..AuditConfig::default()
        };
        let log = AuditLogger::new(config, tmp.path());
        log.record(blocked("rm -rf /")).await?;
        assert!(!tmp.path().join("audit").exists());
        Ok(())
    }

    #[tokio::test]
    async fn alert_fires_at_threshold_and_resets() -> Result<()> {
        let tmp = TempDir::new()?;
        let log = logger(&tmp, 3);
        assert!(log.record(blocked("a")).await?.is_none());
        assert!(log.record(AuditEntry::new(AuditOutcome::Succeeded)).await?.is_none());
        assert!(log.record(blocked("b")).await?.is_none());
        let alert = log.record(blocked("c")).await?.expect("third block alerts");
        assert_eq!(alert.count, 3);
        assert_eq!(alert.last_command.as_deref(), Some("c"));
        assert!(log.record(blocked("d")).await?.is_none());
        Ok(())
    }

    #[test]
    fn old_entries_fall_out_of_the_window() {
        let tmp = TempDir::new().unwrap();
        let log = logger(&tmp, 2);
        let mut stale = blocked("old");
        stale.timestamp = Utc::now() - ChronoDuration::seconds(120);
        assert!(log.observe(&stale).is_none());
        assert!(log.observe(&blocked("new")).is_none());
    }

    #[test]
    fn huge_alert_window_saturates() {
        let tmp = TempDir::new().unwrap();
        let config = AuditConfig {
            dir: "audit".into(),
            alert_threshold: 2,
            alert_window_secs: u64::MAX,
            ..AuditConfig::default()
        };
        let log = AuditLogger::new(config, tmp.path());
        let mut stale = blocked("old");
        stale.timestamp = Utc::now() - ChronoDuration::days(365);
        assert!(log.observe(&stale).is_none());
        assert_eq!(log.observe(&blocked("new")).map(|a| a.count), Some(2));
    }
}
