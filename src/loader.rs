//! Configuration providers.
//!
//! [`FileConfigProvider`] reads `gateway.json` plus optional rule files from one directory.
//! Rule files that fail to parse never widen what is allowed: the whitelist, graylist and
//! security-level tables fall back to empty (deny-by-default) tables, and the blacklist keeps
//! its built-in entries. Each such fallback is recorded in [`GatewayConfig::degraded`].

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;

use crate::config::{
    BlacklistConfig, CommandTable, GatewayConfig, HostDescriptor, PresetTemplate, SecurityLevelConfig,
};
use crate::policy::BlacklistFilter;

pub const AUTH_CODE_ENV: &str = "GATEWAY_AUTH_CODE";

/// Source of the immutable gateway configuration.
pub trait ConfigProvider: Send + Sync {
    fn load(&self) -> Result<GatewayConfig>;
}

/// An in-memory configuration, validated on load.
impl ConfigProvider for GatewayConfig {
    fn load(&self) -> Result<GatewayConfig> {
        validate_hosts(&self.hosts)?;
        Ok(self.clone())
    }
}

#[derive(Debug, Clone)]
pub struct FileConfigProvider {
    dir: PathBuf,
}

enum RuleFile<T> {
    Missing,
    Loaded(T),
    Malformed(String),
}

fn read_rule<T: DeserializeOwned>(path: &Path) -> RuleFile<T> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return RuleFile::Missing,
        Err(err) => return RuleFile::Malformed(err.to_string()),
    };
    match serde_json::from_str(&text) {
        Ok(value) => RuleFile::Loaded(value),
        Err(err) => RuleFile::Malformed(err.to_string()),
    }
}

impl FileConfigProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn degrade(config: &mut GatewayConfig, file: &str, error: &str, fallback: &str) {
        tracing::warn!(file, error, fallback, "rule file unusable");
        config.degraded.push(format!("{file}: {error} ({fallback})"));
    }

    fn apply_rule_files(&self, config: &mut GatewayConfig) {
        match read_rule::<BlacklistConfig>(&self.dir.join("blacklist.json")) {
            RuleFile::Missing => {}
            RuleFile::Loaded(blacklist) => match BlacklistFilter::new(&blacklist) {
                Ok(_) => config.blacklist = blacklist,
                Err(err) => Self::degrade(config, "blacklist.json", &format!("{err:#}"), "built-in blacklist kept"),
            },
            RuleFile::Malformed(err) => {
                Self::degrade(config, "blacklist.json", &err, "built-in blacklist kept")
            }
        }

        for (file, graylist) in [("whitelist.json", false), ("graylist.json", true)] {
            let table = match read_rule::<CommandTable>(&self.dir.join(file)) {
                RuleFile::Missing => continue,
                RuleFile::Loaded(table) => table,
                RuleFile::Malformed(err) => {
                    Self::degrade(config, file, &err, "empty table, commands denied");
                    CommandTable::default()
                }
            };
            if graylist {
                config.graylist = table;
            } else {
                config.whitelist = table;
            }
        }

        match read_rule::<SecurityLevelConfig>(&self.dir.join("security_levels.json")) {
            RuleFile::Missing => {}
            RuleFile::Loaded(levels) => config.security_levels = levels,
            RuleFile::Malformed(err) => {
                Self::degrade(config, "security_levels.json", &err, "all commands classified unknown");
                config.security_levels = SecurityLevelConfig {
                    read: Vec::new(),
                    safe: Vec::new(),
                    write: Vec::new(),
                    danger: Vec::new(),
                    aliases: Default::default(),
                    pipe_transitions: Vec::new(),
                    ..SecurityLevelConfig::default()
                };
            }
        }

        match read_rule::<Vec<PresetTemplate>>(&self.dir.join("presets.json")) {
            RuleFile::Missing => {}
            RuleFile::Loaded(presets) => config.presets = presets,
            RuleFile::Malformed(err) => {
                Self::degrade(config, "presets.json", &err, "no presets");
                config.presets = Vec::new();
            }
        }
    }
}

impl ConfigProvider for FileConfigProvider {
    fn load(&self) -> Result<GatewayConfig> {
        let main = self.dir.join("gateway.json");
        let mut config: GatewayConfig = match std::fs::read_to_string(&main) {
            Ok(text) => serde_json::from_str(&text)
                .with_context(|| format!("failed to parse {}", main.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(dir = %self.dir.display(), "no gateway.json, using defaults");
                GatewayConfig::default()
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", main.display()))
            }
        };
        config.base_dir = self.dir.clone();
        self.apply_rule_files(&mut config);

        if let Ok(code) = std::env::var(AUTH_CODE_ENV) {
            if !code.is_empty() {
                config.authorization.code = Some(code);
            }
        }

        validate_hosts(&config.hosts)?;
        tracing::info!(
            hosts = config.hosts.len(),
            degraded = config.degraded.len(),
            "configuration loaded"
        );
        Ok(config)
    }
}

/// Unique ids, complete ssh descriptors, resolvable and acyclic jump chains.
pub fn validate_hosts(hosts: &[HostDescriptor]) -> Result<()> {
    let mut by_id: HashMap<&str, &HostDescriptor> = HashMap::new();
    for host in hosts {
        if host.id.trim().is_empty() {
            bail!("host with empty id");
        }
        if by_id.insert(host.id.as_str(), host).is_some() {
            bail!("duplicate host id '{}'", host.id);
        }
        if !host.is_local() && (host.address.is_empty() || host.username.is_empty()) {
            bail!("ssh host '{}' needs address and username", host.id);
        }
    }

    for host in hosts {
        let mut seen = BTreeSet::from([host.id.as_str()]);
        let mut current = host;
        while let Some(jump) = current.jump_host.as_deref() {
            let next = *by_id
                .get(jump)
                .with_context(|| format!("host '{}' jumps through unknown host '{jump}'", current.id))?;
            if next.is_local() {
                bail!("host '{}' cannot jump through local host '{jump}'", current.id);
            }
            if !seen.insert(jump) {
                bail!("jump chain of host '{}' forms a cycle at '{jump}'", host.id);
            }
            current = next;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Credentials, HostKind};
    use tempfile::TempDir;

    fn ssh(id: &str, jump: Option<&str>) -> HostDescriptor {
        HostDescriptor {
            id: id.into(),
            kind: HostKind::Ssh,
            address: format!("{id}.internal"),
            username: "ops".into(),
            credentials: Credentials::default(),
            jump_host: jump.map(String::from),
            ..HostDescriptor::local()
        }
    }

    #[test]
    fn jump_cycles_and_dangling_references_are_rejected() {
        assert!(validate_hosts(&[ssh("a", Some("b")), ssh("b", None)]).is_ok());
        let err = validate_hosts(&[ssh("a", Some("b")), ssh("b", Some("a"))]).unwrap_err();
        assert!(err.to_string().contains("cycle"));
        let err = validate_hosts(&[ssh("a", Some("ghost"))]).unwrap_err();
        assert!(err.to_string().contains("unknown host"));
        assert!(validate_hosts(&[ssh("a", Some("a"))]).is_err());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        assert!(validate_hosts(&[ssh("a", None), ssh("a", None)]).is_err());
    }

    #[test]
    fn missing_directory_contents_yield_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = FileConfigProvider::new(tmp.path()).load().unwrap();
        assert!(config.host("local").is_some());
        assert!(config.whitelist.contains("ls"));
        assert!(config.degraded.is_empty());
        assert_eq!(config.base_dir, tmp.path());
    }

    #[test]
    fn malformed_whitelist_degrades_to_empty_table() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("whitelist.json"), "{ not json").unwrap();
        std::fs::write(tmp.path().join("blacklist.json"), r#"{"patterns": ["("]}"#).unwrap();
        let config = FileConfigProvider::new(tmp.path()).load().unwrap();
        assert!(config.whitelist.is_empty());
        assert!(config.graylist.contains("systemctl"));
        assert!(config.blacklist.exact.iter().any(|e| e == "rm -rf /"));
        assert_eq!(config.degraded.len(), 2);
    }

    #[test]
    fn rule_files_override_defaults() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("gateway.json"),
            r#"{"hosts":[{"id":"web","kind":"ssh","address":"10.0.0.5","username":"deploy"}],"default_tier":"high"}"#,
        )
        .unwrap();
        std::fs::write(
            tmp.path().join("whitelist.json"),
            r#"{"uptime": {"allowed_flags": ["-p"]}}"#,
        )
        .unwrap();
        let config = FileConfigProvider::new(tmp.path()).load().unwrap();
        assert_eq!(config.hosts[0].id, "web");
        assert_eq!(config.whitelist.commands.len(), 1);
        assert!(config.whitelist.contains("uptime"));
    }

    #[test]
    fn malformed_gateway_json_is_fatal() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("gateway.json"), "[1,2").unwrap();
        assert!(FileConfigProvider::new(tmp.path()).load().is_err());
    }
}
