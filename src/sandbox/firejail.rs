//! Firejail sandbox (Linux user-space sandboxing).
//!
//! Firejail is a SUID sandbox program that Linux applications use to sandbox themselves.

use std::process::Command;

use super::limits::program_and_args;
use super::{ResourceLimits, Sandbox};

/// Firejail sandbox backend for Linux.
#[derive(Debug, Clone, Default)]
pub struct FirejailSandbox {
    extra_args: Vec<String>,
}

impl FirejailSandbox {
    /// Create a new Firejail sandbox with operator-supplied extra flags.
    pub fn new(extra_args: Vec<String>) -> std::io::Result<Self> {
        if Self::is_installed() {
            Ok(Self { extra_args })
        } else {
            Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "Firejail not found. Install with: sudo apt install firejail",
            ))
        }
    }

    fn is_installed() -> bool {
        Command::new("firejail")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }
}

impl Sandbox for FirejailSandbox {
    fn wrap_command(&self, cmd: &mut Command, limits: &ResourceLimits) -> std::io::Result<()> {
        let (program, args) = program_and_args(cmd);

        let mut firejail_cmd = Command::new("firejail");
        firejail_cmd.args([
            "--quiet",
            "--noprofile",
            "--net=none",
            "--caps.drop=all",
            "--nonewprivs",
            "--noroot",
            "--private-dev",
            "--private-tmp",
            "--nosound",
            "--no3d",
        ]);
        firejail_cmd.args(limits.firejail_args());
        firejail_cmd.args(&self.extra_args);
        firejail_cmd.arg("--");
        firejail_cmd.arg(&program);
        firejail_cmd.args(&args);

        *cmd = firejail_cmd;
        Ok(())
    }

    fn is_available(&self) -> bool {
        Self::is_installed()
    }

    fn name(&self) -> &str {
        "firejail"
    }

    fn description(&self) -> &str {
        "Linux namespace jail with dropped capabilities (requires firejail to be installed)"
    }
}
