//! Per-execution resource limits and their renderings for each backend.

use crate::config::ResourceLimitsConfig;
use serde::{Deserialize, Serialize};
use std::process::Command;

/// Effective limits for one execution, after request overrides are clamped to the ceilings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_mb: u32,
    pub cpus: f64,
    pub cpu_time_secs: u64,
    pub max_processes: u32,
    pub max_file_size_mb: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self::from_config(&ResourceLimitsConfig::default(), None, None)
    }
}

impl ResourceLimits {
    /// Apply optional `memory` (MiB) and `cpus` overrides, clamped to the configured ceilings.
    pub fn from_config(config: &ResourceLimitsConfig, memory: Option<u32>, cpus: Option<f64>) -> Self {
        let memory_mb = memory
            .unwrap_or(config.max_memory_mb)
            .clamp(16, config.memory_ceiling_mb.max(16));
        let cpus = cpus
            .filter(|c| c.is_finite() && *c > 0.0)
            .unwrap_or(config.cpus)
            .clamp(0.1, config.cpu_ceiling.max(0.1));
        Self {
            memory_mb,
            cpus,
            cpu_time_secs: config.max_cpu_time_seconds,
            max_processes: config.max_subprocesses,
            max_file_size_mb: config.max_file_size_mb,
        }
    }

    /// `ulimit` statements for backends without native limits. Each is separate so a shell
    /// lacking one option still applies the rest.
    pub fn ulimit_prefix(&self) -> String {
        let memory_kb = u64::from(self.memory_mb) * 1024;
        let file_blocks = u64::from(self.max_file_size_mb) * 2048;
        format!(
            "ulimit -v {memory_kb} 2>/dev/null; \
             ulimit -t {} 2>/dev/null; \
             ulimit -u {} 2>/dev/null; \
             ulimit -f {file_blocks} 2>/dev/null; ",
            self.cpu_time_secs, self.max_processes
        )
    }

    pub fn docker_args(&self) -> Vec<String> {
        vec![
            "--memory".into(),
            format!("{}m", self.memory_mb),
            "--memory-swap".into(),
            format!("{}m", self.memory_mb),
            "--cpus".into(),
            format!("{}", self.cpus),
            "--pids-limit".into(),
            self.max_processes.to_string(),
            "--ulimit".into(),
            format!("cpu={0}:{0}", self.cpu_time_secs),
        ]
    }

    pub fn firejail_args(&self) -> Vec<String> {
        let mb = 1024 * 1024;
        vec![
            format!("--rlimit-as={}", u64::from(self.memory_mb) * mb),
            format!("--rlimit-cpu={}", self.cpu_time_secs),
            format!("--rlimit-nproc={}", self.max_processes),
            format!("--rlimit-fsize={}", u64::from(self.max_file_size_mb) * mb),
        ]
    }
}

/// Split a command into its program and arguments.
pub(crate) fn program_and_args(cmd: &Command) -> (String, Vec<String>) {
    let program = cmd.get_program().to_string_lossy().to_string();
    let args = cmd
        .get_args()
        .map(|s| s.to_string_lossy().to_string())
        .collect();
    (program, args)
}

/// Shell prologue that applies the ulimits and then execs the original program unchanged.
pub(crate) fn limited_exec_args(cmd: &Command, limits: &ResourceLimits) -> Vec<String> {
    let (program, args) = program_and_args(cmd);
    let mut out = vec![
        "-c".to_string(),
        format!("{}exec \"$0\" \"$@\"", limits.ulimit_prefix()),
        program,
    ];
    out.extend(args);
    out
}
