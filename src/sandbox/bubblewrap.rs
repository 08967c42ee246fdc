//! Bubblewrap sandbox: unprivileged namespaces over a read-only view of the host.
//!
//! bwrap has no native resource limits, so the ulimit prologue runs inside the jail.

use std::process::Command;

use super::limits::limited_exec_args;
use super::{ResourceLimits, Sandbox};

#[derive(Debug, Clone, Default)]
pub struct BubblewrapSandbox;

impl BubblewrapSandbox {
    pub fn new() -> std::io::Result<Self> {
        if Self::is_installed() {
            Ok(Self)
        } else {
            Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "Bubblewrap not found. Install with: sudo apt install bubblewrap",
            ))
        }
    }

    fn is_installed() -> bool {
        Command::new("bwrap")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }
}

impl Sandbox for BubblewrapSandbox {
    fn wrap_command(&self, cmd: &mut Command, limits: &ResourceLimits) -> std::io::Result<()> {
        let inner = limited_exec_args(cmd, limits);

        let mut bwrap = Command::new("bwrap");
        bwrap.args([
            "--ro-bind",
            "/",
            "/",
            "--dev",
            "/dev",
            "--proc",
            "/proc",
            "--tmpfs",
            "/tmp",
            "--unshare-all",
            "--die-with-parent",
            "--new-session",
            "--cap-drop",
            "ALL",
            "--",
            "sh",
        ]);
        bwrap.args(inner);

        *cmd = bwrap;
        Ok(())
    }

    fn is_available(&self) -> bool {
        Self::is_installed()
    }

    fn name(&self) -> &str {
        "bubblewrap"
    }

    fn description(&self) -> &str {
        "User namespace sandbox with read-only root (requires bwrap)"
    }
}
