//! Configuration types for hosts, rule tables, sandbox, connection pool, and audit.
//!
//! Every section has a `Default` so a partial `gateway.json` is enough to run.

use crate::output::OutputFormat;
use crate::policy::{RiskLevel, Tier};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

fn default_true() -> bool {
    true
}

// ── Gateway ───────────────────────────────────────────────────────

/// Complete gateway configuration, loaded once at startup and immutable thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_hosts")]
    pub hosts: Vec<HostDescriptor>,
    /// Tier used when neither the request nor the host names one.
    #[serde(default)]
    pub default_tier: Tier,
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default = "default_max_timeout_ms")]
    pub max_timeout_ms: u64,
    #[serde(default)]
    pub blacklist: BlacklistConfig,
    #[serde(default = "default_whitelist")]
    pub whitelist: CommandTable,
    #[serde(default = "default_graylist")]
    pub graylist: CommandTable,
    #[serde(default)]
    pub pipes: PipeConfig,
    /// Paths no command may name, whether or not it is listed.
    #[serde(default = "default_sensitive_paths")]
    pub sensitive_paths: Vec<String>,
    #[serde(default)]
    pub security_levels: SecurityLevelConfig,
    #[serde(default)]
    pub ast: AstConfig,
    #[serde(default = "default_presets")]
    pub presets: Vec<PresetTemplate>,
    #[serde(default)]
    pub resources: ResourceLimitsConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub authorization: AuthorizationConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub interaction: InteractionConfig,
    #[serde(default)]
    pub background: BackgroundConfig,
    /// Directory relative paths (key files, log dirs) resolve against.
    #[serde(skip)]
    pub base_dir: PathBuf,
    /// Rule sources that failed to load and were replaced by deny-by-default tables.
    #[serde(skip)]
    pub degraded: Vec<String>,
}

fn default_timeout_ms() -> u64 {
    30_000
}
fn default_max_timeout_ms() -> u64 {
    600_000
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            hosts: default_hosts(),
            default_tier: Tier::Standard,
            default_timeout_ms: default_timeout_ms(),
            max_timeout_ms: default_max_timeout_ms(),
            blacklist: BlacklistConfig::default(),
            whitelist: default_whitelist(),
            graylist: default_graylist(),
            pipes: PipeConfig::default(),
            sensitive_paths: default_sensitive_paths(),
            security_levels: SecurityLevelConfig::default(),
            ast: AstConfig::default(),
            presets: default_presets(),
            resources: ResourceLimitsConfig::default(),
            sandbox: SandboxConfig::default(),
            ssh: SshConfig::default(),
            audit: AuditConfig::default(),
            authorization: AuthorizationConfig::default(),
            output: OutputConfig::default(),
            interaction: InteractionConfig::default(),
            background: BackgroundConfig::default(),
            base_dir: PathBuf::from("."),
            degraded: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// Look up a host by id.
    pub fn host(&self, id: &str) -> Option<&HostDescriptor> {
        self.hosts.iter().find(|h| h.id == id)
    }

    /// Resolve a configured path against `base_dir` (absolute and `~/` paths pass through).
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        crate::ssh::keys::expand_path(path, &self.base_dir)
    }
}

// ── Hosts ─────────────────────────────────────────────────────────

/// Where a host runs commands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostKind {
    #[default]
    Local,
    Ssh,
}

/// One configured execution target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostDescriptor {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kind: HostKind,
    #[serde(default)]
    pub address: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credentials: Credentials,
    /// Id of another host to tunnel through.
    #[serde(default)]
    pub jump_host: Option<String>,
    /// Tier applied when the request does not override it.
    #[serde(default)]
    pub security_level: Option<Tier>,
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
    #[serde(default)]
    pub command_timeout_ms: Option<u64>,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}

impl HostDescriptor {
    /// The implicit local host.
    pub fn local() -> Self {
        Self {
            id: "local".into(),
            name: "Local machine".into(),
            kind: HostKind::Local,
            address: "localhost".into(),
            port: default_ssh_port(),
            username: String::new(),
            credentials: Credentials::default(),
            jump_host: None,
            security_level: None,
            connect_timeout_ms: None,
            command_timeout_ms: None,
            description: Some("Commands run on the gateway host".into()),
        }
    }

    pub fn is_local(&self) -> bool {
        self.kind == HostKind::Local
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

fn default_hosts() -> Vec<HostDescriptor> {
    vec![HostDescriptor::local()]
}

/// SSH credentials. Secrets never appear in `Debug` output.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub key_path: Option<String>,
    #[serde(default, skip_serializing)]
    pub passphrase: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("key_path", &self.key_path)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

// ── Rule tables ───────────────────────────────────────────────────

/// Commands that are never allowed, under any tier or authorization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlacklistConfig {
    /// Whole commands (whitespace-normalized) that are forbidden.
    #[serde(default)]
    pub exact: Vec<String>,
    /// Regular expressions matched against the whole command.
    #[serde(default)]
    pub patterns: Vec<String>,
}

impl Default for BlacklistConfig {
    fn default() -> Self {
        Self {
            exact: [
                "rm -rf /",
                "rm -rf /*",
                "rm -fr /",
                "rm -rf ~",
                ":(){ :|:& };:",
                "shutdown",
                "reboot",
                "halt",
                "poweroff",
                "init 0",
                "init 6",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            patterns: [
                r"\brm\s+(-[a-zA-Z]*\s+)*-[a-zA-Z]*[rR][a-zA-Z]*\s+(-[a-zA-Z]*\s+)*(/|/\*|~/?)(\s|$)",
                r"(^|[;&|]\s*)(sudo\s+)?mkfs(\.[a-z0-9]+)?\b",
                r"\bdd\s+.*\bof=/dev/(sd|hd|nvme|vd|xvd|mmcblk)",
                r">\s*/dev/(sd|hd|nvme|vd|xvd|mmcblk)",
                r"\bchmod\s+(-[a-zA-Z]+\s+)*0?777\s+/(\s|$)",
                r"\bchown\s+(-[a-zA-Z]+\s+)*\S+\s+/(\s|$)",
                r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
                r"(^|[;&|]\s*)(sudo\s+)?(shutdown|reboot|halt|poweroff)\b",
                r"\bcrontab\s+-r\b",
                r"\buserdel\s+(-[a-zA-Z]+\s+)*root\b",
                r"\bpasswd\s+root\b",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

/// Command name → rule, used for both the whitelist and the graylist.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandTable {
    pub commands: BTreeMap<String, CommandRule>,
}

impl CommandTable {
    pub fn get(&self, name: &str) -> Option<&CommandRule> {
        self.commands.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Per-command flag and path restrictions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandRule {
    /// Allowed flag prefixes; `"*"` allows any flag.
    #[serde(default)]
    pub allowed_flags: Vec<String>,
    #[serde(default)]
    pub paths: PathRule,
    /// Graylist risk tag (write or danger). Ignored for whitelist entries.
    #[serde(default)]
    pub risk: Option<RiskLevel>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Path prefix allow/deny lists. An empty allow list permits any path not denied.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathRule {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

const SENSITIVE_PATHS: &[&str] = &[
    "/etc/shadow",
    "/etc/gshadow",
    "/etc/sudoers",
    "/root/.ssh",
    "~/.ssh",
    "~/.gnupg",
    "~/.aws",
    "/proc/kcore",
    "/dev/mem",
];

fn default_sensitive_paths() -> Vec<String> {
    strings(SENSITIVE_PATHS)
}

fn rule(flags: &[&str], allow: &[&str]) -> CommandRule {
    CommandRule {
        allowed_flags: strings(flags),
        paths: PathRule {
            allow: strings(allow),
            deny: strings(SENSITIVE_PATHS),
        },
        risk: None,
        description: None,
    }
}

fn tagged(flags: &[&str], risk: RiskLevel, description: &str) -> CommandRule {
    CommandRule {
        risk: Some(risk),
        description: Some(description.into()),
        ..rule(flags, &[])
    }
}

fn default_whitelist() -> CommandTable {
    let mut commands = BTreeMap::new();
    let any_path: &[&str] = &[];
    let entries: Vec<(&str, CommandRule)> = vec![
        ("ls", rule(&["-l", "-a", "-h", "-t", "-r", "-R", "-S", "-1", "-d", "-i", "--color"], any_path)),
        ("cat", rule(&["-n", "-b", "-A", "-s"], any_path)),
        ("head", rule(&["-n", "-c", "-q"], any_path)),
        ("tail", rule(&["-n", "-c", "-q"], any_path)),
        ("grep", rule(&["-i", "-v", "-n", "-c", "-r", "-R", "-E", "-F", "-w", "-l", "-o", "-e", "-A", "-B", "-C", "--color"], any_path)),
        ("ps", rule(&["-e", "-f", "-a", "-u", "-x", "-o", "--sort"], any_path)),
        ("df", rule(&["-h", "-T", "-i", "-k", "-m"], any_path)),
        ("du", rule(&["-h", "-s", "-c", "-d", "--max-depth"], any_path)),
        ("free", rule(&["-h", "-m", "-g", "-b"], any_path)),
        ("uptime", rule(&["-p", "-s"], any_path)),
        ("whoami", rule(&[], any_path)),
        ("id", rule(&["-u", "-g", "-n"], any_path)),
        ("hostname", rule(&["-f", "-i", "-I"], any_path)),
        ("uname", rule(&["-a", "-r", "-s", "-m", "-n"], any_path)),
        ("pwd", rule(&[], any_path)),
        ("date", rule(&["-u", "-R", "-I"], any_path)),
        ("echo", rule(&["-n", "-e"], any_path)),
        ("wc", rule(&["-l", "-w", "-c", "-m"], any_path)),
        ("sort", rule(&["-n", "-r", "-k", "-u", "-h", "-t"], any_path)),
        ("uniq", rule(&["-c", "-d", "-u", "-i"], any_path)),
        ("find", rule(&["-name", "-iname", "-type", "-maxdepth", "-mindepth", "-size", "-mtime", "-mmin", "-newer", "-path", "-print"], any_path)),
        ("stat", rule(&["-c", "-f", "-L"], any_path)),
        ("netstat", rule(&["-t", "-u", "-l", "-n", "-p", "-a"], any_path)),
        ("ss", rule(&["-t", "-u", "-l", "-n", "-p", "-a", "-s"], any_path)),
        ("journalctl", rule(&["-u", "-n", "--since", "--until", "--no-pager", "-p", "-b"], any_path)),
        ("top", rule(&["-b", "-n", "-o"], any_path)),
        ("mkdir", rule(&["-p", "-v"], &["/tmp", "/var/tmp", "~"])),
        ("touch", rule(&["-c", "-a", "-m"], &["/tmp", "/var/tmp", "~"])),
    ];
    for (name, r) in entries {
        commands.insert(name.to_string(), r);
    }
    CommandTable { commands }
}

fn default_graylist() -> CommandTable {
    let mut commands = BTreeMap::new();
    let entries: Vec<(&str, CommandRule)> = vec![
        ("systemctl", tagged(&["--no-pager", "--now", "-l"], RiskLevel::Write, "service management")),
        ("service", tagged(&[], RiskLevel::Write, "legacy service management")),
        ("docker", tagged(&["-a", "-f", "-q", "--tail", "--since", "-n", "--format"], RiskLevel::Write, "container management")),
        ("cp", tagged(&["-r", "-R", "-p", "-a", "-v", "-n"], RiskLevel::Write, "file copy")),
        ("mv", tagged(&["-v", "-n", "-f"], RiskLevel::Write, "file move")),
        ("apt-get", tagged(&["-y", "-q", "--no-install-recommends"], RiskLevel::Write, "package management")),
        ("kill", tagged(&["-9", "-15", "-TERM", "-KILL", "-HUP", "-s"], RiskLevel::Danger, "process signalling")),
        ("rm", tagged(&["-f", "-r", "-R", "-v", "-i"], RiskLevel::Danger, "file removal")),
        ("chmod", tagged(&["-R", "-v"], RiskLevel::Danger, "permission change")),
    ];
    for (name, r) in entries {
        commands.insert(name.to_string(), r);
    }
    CommandTable { commands }
}

/// Rules for pipe chains.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipeConfig {
    /// Maximum number of pipe segments.
    #[serde(default = "default_max_pipe_depth")]
    pub max_depth: usize,
    /// Commands allowed after the first segment.
    #[serde(default)]
    pub allowed_commands: Vec<String>,
    /// Commands never allowed anywhere in a pipe chain.
    #[serde(default)]
    pub forbidden_commands: Vec<String>,
}

fn default_max_pipe_depth() -> usize {
    4
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_pipe_depth(),
            allowed_commands: strings(&[
                "grep", "head", "tail", "wc", "sort", "uniq", "cut", "tr", "column",
            ]),
            forbidden_commands: strings(&[
                "sh", "bash", "zsh", "dash", "ksh", "sudo", "su", "xargs", "tee", "python",
                "python3", "perl", "ruby", "node", "nc", "ncat", "netcat", "curl", "wget", "dd",
                "eval", "exec", "source",
            ]),
        }
    }
}

/// Which special shell operators are permitted. All off by default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperatorRules {
    #[serde(default)]
    pub allow_semicolon: bool,
    #[serde(default)]
    pub allow_background: bool,
    #[serde(default)]
    pub allow_chaining: bool,
    #[serde(default)]
    pub allow_subshell: bool,
}

/// Redirection permissions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedirectRule {
    /// Risk levels whose segments may redirect output.
    #[serde(default)]
    pub allowed_levels: Vec<RiskLevel>,
    /// Target path prefixes that are never writable.
    #[serde(default)]
    pub denied_paths: Vec<String>,
}

impl Default for RedirectRule {
    fn default() -> Self {
        Self {
            allowed_levels: vec![RiskLevel::Read, RiskLevel::Safe],
            denied_paths: strings(&[
                "/etc", "/bin", "/sbin", "/usr", "/boot", "/lib", "/dev", "/proc", "/sys", "/root",
                "~/.ssh", "~/.bashrc", "~/.profile",
            ]),
        }
    }
}

/// Declarative risk classification tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityLevelConfig {
    #[serde(default)]
    pub read: Vec<String>,
    #[serde(default)]
    pub safe: Vec<String>,
    #[serde(default)]
    pub write: Vec<String>,
    #[serde(default)]
    pub danger: Vec<String>,
    /// Alias → canonical command prefix (e.g. `ll` → `ls -l`).
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
    /// Allowed `from->to` level transitions inside pipe chains.
    #[serde(default)]
    pub pipe_transitions: Vec<String>,
    #[serde(default)]
    pub redirect: RedirectRule,
    #[serde(default)]
    pub operators: OperatorRules,
}

impl Default for SecurityLevelConfig {
    fn default() -> Self {
        Self {
            read: strings(&[
                "ls", "cat", "head", "tail", "grep", "ps", "df", "du", "free", "uptime", "whoami",
                "id", "hostname", "uname", "pwd", "date", "wc", "sort", "uniq", "find", "stat",
                "netstat", "ss", "journalctl", "top", "cut", "tr", "column",
                "systemctl status", "systemctl is-active", "systemctl list-units",
                "service --status-all", "docker ps", "docker logs", "docker images",
                "docker inspect", "docker stats --no-stream",
            ]),
            safe: strings(&["echo", "mkdir", "touch"]),
            write: strings(&[
                "systemctl restart", "systemctl start", "systemctl stop", "systemctl reload",
                "systemctl enable", "service", "docker restart", "docker start", "docker stop",
                "docker pull", "cp", "mv", "apt-get install", "apt-get update",
            ]),
            danger: strings(&[
                "rm", "kill", "chmod", "systemctl disable", "systemctl mask", "docker rm",
                "docker rmi", "docker system prune", "apt-get remove", "apt-get purge",
            ]),
            aliases: [("ll", "ls -l"), ("la", "ls -a"), ("l", "ls")]
                .into_iter()
                .map(|(a, b)| (a.to_string(), b.to_string()))
                .collect(),
            pipe_transitions: strings(&["read->read", "read->safe", "safe->read", "safe->safe"]),
            redirect: RedirectRule::default(),
            operators: OperatorRules::default(),
        }
    }
}

/// Structural thresholds for the AST analyzer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AstConfig {
    #[serde(default = "default_max_nesting_depth")]
    pub max_nesting_depth: usize,
    #[serde(default = "default_max_pipes")]
    pub max_pipes: usize,
}

fn default_max_nesting_depth() -> usize {
    3
}
fn default_max_pipes() -> usize {
    5
}

impl Default for AstConfig {
    fn default() -> Self {
        Self {
            max_nesting_depth: default_max_nesting_depth(),
            max_pipes: default_max_pipes(),
        }
    }
}

// ── Presets ───────────────────────────────────────────────────────

/// Named command template with `{{param}}` placeholders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresetTemplate {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub commands: Vec<String>,
    #[serde(default)]
    pub params: Vec<PresetParam>,
}

/// One preset parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresetParam {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub default: Option<String>,
    /// Regex the value must match in full; defaults to a shell-inert character set.
    #[serde(default)]
    pub pattern: Option<String>,
}

fn default_presets() -> Vec<PresetTemplate> {
    let param = |name: &str, description: &str, default: Option<&str>| PresetParam {
        name: name.into(),
        description: description.into(),
        required: default.is_none(),
        default: default.map(String::from),
        pattern: None,
    };
    vec![
        PresetTemplate {
            name: "system_overview".into(),
            description: "Uptime, memory and disk usage".into(),
            commands: strings(&["uptime", "free -h", "df -h"]),
            params: Vec::new(),
        },
        PresetTemplate {
            name: "service_status".into(),
            description: "Status and recent logs of a systemd unit".into(),
            commands: strings(&[
                "systemctl status {{service}} --no-pager",
                "journalctl -u {{service}} -n {{lines}} --no-pager",
            ]),
            params: vec![
                param("service", "systemd unit name", None),
                param("lines", "number of log lines", Some("50")),
            ],
        },
        PresetTemplate {
            name: "tail_log".into(),
            description: "Last lines of a log file".into(),
            commands: strings(&["tail -n {{lines}} {{path}}"]),
            params: vec![
                param("path", "absolute log file path", None),
                param("lines", "number of lines", Some("100")),
            ],
        },
        PresetTemplate {
            name: "find_process".into(),
            description: "Processes whose command line matches a name".into(),
            commands: strings(&["ps aux | grep {{name}}"]),
            params: vec![param("name", "process name fragment", None)],
        },
    ]
}

// ── Execution ─────────────────────────────────────────────────────

/// Resource limits for local command execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimitsConfig {
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: u32,
    #[serde(default = "default_cpus")]
    pub cpus: f64,
    #[serde(default = "default_max_cpu_time_seconds")]
    pub max_cpu_time_seconds: u64,
    #[serde(default = "default_max_subprocesses")]
    pub max_subprocesses: u32,
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u32,
    /// Upper bound for per-request memory overrides.
    #[serde(default = "default_memory_ceiling_mb")]
    pub memory_ceiling_mb: u32,
    /// Upper bound for per-request cpu overrides.
    #[serde(default = "default_cpu_ceiling")]
    pub cpu_ceiling: f64,
}

fn default_max_memory_mb() -> u32 {
    512
}
fn default_cpus() -> f64 {
    1.0
}
fn default_max_cpu_time_seconds() -> u64 {
    60
}
fn default_max_subprocesses() -> u32 {
    256
}
fn default_max_file_size_mb() -> u32 {
    100
}
fn default_memory_ceiling_mb() -> u32 {
    4096
}
fn default_cpu_ceiling() -> f64 {
    4.0
}

impl Default for ResourceLimitsConfig {
    fn default() -> Self {
        Self {
            max_memory_mb: default_max_memory_mb(),
            cpus: default_cpus(),
            max_cpu_time_seconds: default_max_cpu_time_seconds(),
            max_subprocesses: default_max_subprocesses(),
            max_file_size_mb: default_max_file_size_mb(),
            memory_ceiling_mb: default_memory_ceiling_mb(),
            cpu_ceiling: default_cpu_ceiling(),
        }
    }
}

/// Sandbox backend selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxBackend {
    #[default]
    Auto,
    Docker,
    Firejail,
    Bubblewrap,
    None,
}

/// Sandbox backend and options for the high and maximum tiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default)]
    pub backend: SandboxBackend,
    #[serde(default = "default_sandbox_image")]
    pub image: String,
    /// Unprivileged `uid:gid` used inside containers.
    #[serde(default = "default_sandbox_user")]
    pub user: String,
    /// Extra Firejail arguments appended after the built-in isolation flags.
    #[serde(default)]
    pub firejail_args: Vec<String>,
}

fn default_sandbox_image() -> String {
    "alpine:3.20".into()
}
fn default_sandbox_user() -> String {
    "65534:65534".into()
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: SandboxBackend::Auto,
            image: default_sandbox_image(),
            user: default_sandbox_user(),
            firejail_args: Vec::new(),
        }
    }
}

/// SSH pool, retry and concurrency settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    /// Global cap on concurrent remote operations.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Maximum cached ready connections.
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: usize,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Connect attempts after the first failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Initial backoff, doubled per attempt.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    /// known_hosts file to verify server keys against. Unset accepts and logs the fingerprint.
    #[serde(default)]
    pub known_hosts: Option<String>,
}

fn default_max_concurrent() -> usize {
    5
}
fn default_max_pool_size() -> usize {
    10
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    500
}
fn default_keepalive_secs() -> u64 {
    30
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_pool_size: default_max_pool_size(),
            connect_timeout_ms: default_connect_timeout_ms(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            keepalive_secs: default_keepalive_secs(),
            known_hosts: None,
        }
    }
}

/// Audit logging and alerting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Directory holding `audit-YYYY-MM-DD.jsonl` files.
    #[serde(default = "default_audit_dir")]
    pub dir: String,
    /// Blocked/failed entries within the window that fire an alert.
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: usize,
    #[serde(default = "default_alert_window_secs")]
    pub alert_window_secs: u64,
    #[serde(default)]
    pub webhook_url: Option<String>,
}

fn default_audit_dir() -> String {
    "logs/audit".into()
}
fn default_alert_threshold() -> usize {
    5
}
fn default_alert_window_secs() -> u64 {
    300
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_audit_dir(),
            alert_threshold: default_alert_threshold(),
            alert_window_secs: default_alert_window_secs(),
            webhook_url: None,
        }
    }
}

/// Authorization secret for the escape path and confirmations.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct AuthorizationConfig {
    #[serde(default, skip_serializing)]
    pub code: Option<String>,
}

impl fmt::Debug for AuthorizationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizationConfig")
            .field("code", &self.code.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Output shaping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_max_output_bytes")]
    pub max_bytes: usize,
    #[serde(default)]
    pub default_format: OutputFormat,
}

fn default_max_output_bytes() -> usize {
    64 * 1024
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_max_output_bytes(),
            default_format: OutputFormat::Text,
        }
    }
}

/// Output signatures of processes stuck waiting for input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionConfig {
    #[serde(default = "default_signatures")]
    pub signatures: Vec<String>,
}

fn default_signatures() -> Vec<String> {
    strings(&[
        r"(?im)^\[sudo\] password for",
        r"(?im)password\s*(for\s+\S+)?\s*:\s*$",
        r"(?im)passphrase for key",
        r"(?i)\((y|yes)/(n|no)\)",
        r"(?i)\[(Y/n|y/N)\]",
        r"(?i)do you want to continue\?",
        r"(?i)are you sure",
        r"(?i)could not get lock",
        r"(?i)unable to acquire the dpkg frontend lock",
        r"(?i)waiting for cache lock",
        r"(?i)press any key",
    ])
}

impl Default for InteractionConfig {
    fn default() -> Self {
        Self {
            signatures: default_signatures(),
        }
    }
}

/// Detached task output locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundConfig {
    #[serde(default = "default_task_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_remote_log_dir")]
    pub remote_log_dir: String,
}

fn default_task_log_dir() -> String {
    "logs/tasks".into()
}
fn default_remote_log_dir() -> String {
    "/tmp".into()
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            log_dir: default_task_log_dir(),
            remote_log_dir: default_remote_log_dir(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_config_default_has_local_host() {
        let c = GatewayConfig::default();
        let local = c.host("local").expect("local host");
        assert!(local.is_local());
        assert_eq!(c.default_tier, Tier::Standard);
        assert!(c.degraded.is_empty());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let c: GatewayConfig = serde_json::from_str(
            r#"{"hosts":[{"id":"web","kind":"ssh","address":"10.0.0.5","username":"deploy"}]}"#,
        )
        .expect("parse");
        assert_eq!(c.hosts.len(), 1);
        assert_eq!(c.hosts[0].port, 22);
        assert!(c.whitelist.contains("ls"));
        assert_eq!(c.ssh.max_concurrent, 5);
    }

    #[test]
    fn credentials_debug_redacts_secrets() {
        let creds = Credentials {
            key_path: Some("~/.ssh/id_ed25519".into()),
            passphrase: Some("hunter2".into()),
            password: Some("swordfish".into()),
        };
        let debug = format!("{creds:?}");
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("swordfish"));
        assert!(debug.contains("id_ed25519"));
    }

    #[test]
    fn graylist_entries_carry_risk_tags() {
        let gray = default_graylist();
        assert_eq!(gray.get("systemctl").and_then(|r| r.risk), Some(RiskLevel::Write));
        assert_eq!(gray.get("rm").and_then(|r| r.risk), Some(RiskLevel::Danger));
    }

    #[test]
    fn audit_config_default() {
        let a = AuditConfig::default();
        assert!(a.enabled);
        assert_eq!(a.dir, "logs/audit");
        assert!(a.webhook_url.is_none());
    }
}
