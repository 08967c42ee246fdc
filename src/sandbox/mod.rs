//! Pluggable sandbox backends and the local executor that drives them.

mod bubblewrap;
mod detect;
mod docker;
mod executor;
mod firejail;
mod limits;

pub use bubblewrap::BubblewrapSandbox;
pub use docker::{DockerSandbox, GATEWAY_LABEL};
pub use executor::{ExecutionResult, Isolation, SandboxExecutor};
pub use firejail::FirejailSandbox;
pub use limits::ResourceLimits;

use std::process::Command;
use std::sync::Arc;

use crate::config::SandboxConfig;

/// Sandbox backend for OS-level isolation.
pub trait Sandbox: Send + Sync {
    /// Rewrite `cmd` so it runs inside this backend under `limits`.
    fn wrap_command(&self, cmd: &mut Command, limits: &ResourceLimits) -> std::io::Result<()>;

    /// Check if this sandbox backend is available on the current platform.
    fn is_available(&self) -> bool;

    /// Human-readable name of this sandbox backend.
    fn name(&self) -> &str;

    /// Description of what this sandbox provides.
    fn description(&self) -> &str;

    /// Whether commands run in a separate container filesystem.
    fn is_container(&self) -> bool {
        false
    }
}

/// Direct spawn with a `ulimit` prologue. Always available.
#[derive(Debug, Clone, Default)]
pub struct NoopSandbox;

impl Sandbox for NoopSandbox {
    fn wrap_command(&self, cmd: &mut Command, limits: &ResourceLimits) -> std::io::Result<()> {
        let mut limited = Command::new("sh");
        limited.args(limits::limited_exec_args(cmd, limits));
        *cmd = limited;
        Ok(())
    }

    fn is_available(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        "none"
    }

    fn description(&self) -> &str {
        "No isolation; resource limits applied with ulimit"
    }
}

/// Create the backend used for sandboxed execution. Falls back to [`NoopSandbox`].
pub fn create_sandbox(config: &SandboxConfig) -> Arc<dyn Sandbox> {
    detect::create_sandbox_impl(config)
}

/// Create a container backend, or report why none is available.
pub fn create_container_sandbox(config: &SandboxConfig) -> std::io::Result<Arc<dyn Sandbox>> {
    detect::create_container_impl(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_sandbox_name() {
        assert_eq!(NoopSandbox.name(), "none");
        assert!(!NoopSandbox.is_container());
    }

    #[test]
    fn noop_sandbox_is_always_available() {
        assert!(NoopSandbox.is_available());
    }

    #[test]
    fn noop_sandbox_injects_ulimit_prologue() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo test");
        NoopSandbox
            .wrap_command(&mut cmd, &ResourceLimits::default())
            .unwrap();
        assert_eq!(cmd.get_program().to_string_lossy(), "sh");
        let args: Vec<String> = cmd.get_args().map(|s| s.to_string_lossy().into()).collect();
        assert!(args[1].starts_with("ulimit -v"));
        assert_eq!(args.last().map(String::as_str), Some("echo test"));
    }
}
