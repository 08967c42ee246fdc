//! Docker sandbox (container isolation).
//!
//! Every command runs in a fresh `docker run --rm` container with no network, a read-only
//! root, all capabilities dropped and an unprivileged user. Containers carry a generated
//! `--name` so a timed-out run can be killed through the daemon.

use std::process::Command;

use super::limits::program_and_args;
use super::{ResourceLimits, Sandbox};
use crate::config::SandboxConfig;

/// Label applied to all containers started by the gateway (for filtering and cleanup).
pub const GATEWAY_LABEL: &str = "secure-shell-gateway=true";

const NAME_PREFIX: &str = "gateway-";

/// Name given to a wrapped `docker run`, if `cmd` is one.
pub fn container_name(cmd: &Command) -> Option<String> {
    if cmd.get_program() != "docker" {
        return None;
    }
    let args: Vec<_> = cmd.get_args().collect();
    args.windows(2)
        .find(|w| w[0] == "--name")
        .map(|w| w[1].to_string_lossy().into_owned())
}

/// `docker kill` a container. Killing the CLI client alone leaves the container running.
pub async fn kill_container(name: &str) {
    let result = tokio::process::Command::new("docker")
        .args(["kill", name])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await;
    match result {
        Ok(status) if status.success() => tracing::info!(container = name, "container killed"),
        Ok(status) => tracing::debug!(container = name, %status, "docker kill did not succeed"),
        Err(err) => tracing::warn!(container = name, error = %err, "docker kill failed to start"),
    }
}

/// Docker sandbox backend.
#[derive(Debug, Clone)]
pub struct DockerSandbox {
    image: String,
    user: String,
}

impl Default for DockerSandbox {
    fn default() -> Self {
        let config = SandboxConfig::default();
        Self {
            image: config.image,
            user: config.user,
        }
    }
}

impl DockerSandbox {
    /// Create a Docker sandbox from config, failing if the daemon is unreachable.
    pub fn new(config: &SandboxConfig) -> std::io::Result<Self> {
        if Self::is_installed() {
            Ok(Self::unchecked(config))
        } else {
            Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "Docker not available (CLI missing or daemon not running)",
            ))
        }
    }

    /// Build without probing the daemon.
    pub fn unchecked(config: &SandboxConfig) -> Self {
        Self {
            image: config.image.trim().to_string(),
            user: config.user.trim().to_string(),
        }
    }

    /// Check if Docker daemon is reachable (CLI present + daemon running).
    fn is_installed() -> bool {
        Command::new("docker")
            .arg("info")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn isolation_args(&self) -> Vec<String> {
        [
            "--network",
            "none",
            "--read-only",
            "--cap-drop",
            "ALL",
            "--security-opt",
            "no-new-privileges",
            "--tmpfs",
            "/tmp:rw,noexec,nosuid,size=64m",
            "--label",
            GATEWAY_LABEL,
            "--user",
        ]
        .into_iter()
        .map(String::from)
        .chain(std::iter::once(self.user.clone()))
        .collect()
    }
}

impl Sandbox for DockerSandbox {
    fn wrap_command(&self, cmd: &mut Command, limits: &ResourceLimits) -> std::io::Result<()> {
        let (program, args) = program_and_args(cmd);

        let mut docker_cmd = Command::new("docker");
        docker_cmd.args(["run", "--rm", "--init"]);
        docker_cmd.arg("--name").arg(format!("{NAME_PREFIX}{}", uuid::Uuid::new_v4().simple()));
        docker_cmd.args(self.isolation_args());
        docker_cmd.args(limits.docker_args());
        docker_cmd.arg(&self.image);
        docker_cmd.arg(&program);
        docker_cmd.args(&args);

        *cmd = docker_cmd;
        Ok(())
    }

    fn is_available(&self) -> bool {
        Self::is_installed()
    }

    fn name(&self) -> &str {
        "docker"
    }

    fn description(&self) -> &str {
        "Docker container isolation (requires docker)"
    }

    fn is_container(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wrapped(sandbox: &DockerSandbox) -> Vec<String> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo hello");
        sandbox
            .wrap_command(&mut cmd, &ResourceLimits::default())
            .unwrap();
        assert_eq!(cmd.get_program().to_string_lossy(), "docker");
        cmd.get_args().map(|s| s.to_string_lossy().into()).collect()
    }

    #[test]
    fn docker_sandbox_name() {
        let sandbox = DockerSandbox::default();
        assert_eq!(sandbox.name(), "docker");
        assert!(sandbox.is_container());
    }

    #[test]
    fn docker_sandbox_default_image_and_user() {
        let sandbox = DockerSandbox::default();
        assert_eq!(sandbox.image, "alpine:3.20");
        assert_eq!(sandbox.user, "65534:65534");
    }

    #[test]
    fn docker_wrap_command_isolates_container() {
        let args = wrapped(&DockerSandbox::default());
        assert_eq!(&args[..2], ["run", "--rm"]);
        for flag in ["--read-only", "--init"] {
            assert!(args.contains(&flag.to_string()), "missing {flag}");
        }
        let pair = |a: &str, b: &str| args.windows(2).any(|w| w[0] == a && w[1] == b);
        assert!(pair("--network", "none"));
        assert!(pair("--cap-drop", "ALL"));
        assert!(pair("--security-opt", "no-new-privileges"));
        assert!(pair("--user", "65534:65534"));
        assert!(pair("--memory", "512m"));
        assert!(args.contains(&GATEWAY_LABEL.to_string()));
    }

    #[test]
    fn docker_wrap_command_keeps_shell_invocation_after_image() {
        let config = SandboxConfig {
            image: "debian:bookworm-slim".into(),
            ..SandboxConfig::default()
        };
        let args = wrapped(&DockerSandbox::unchecked(&config));
        let image = args
            .iter()
            .position(|a| a == "debian:bookworm-slim")
            .expect("image present");
        assert_eq!(&args[image + 1..], ["sh", "-c", "echo hello"]);
    }

    #[test]
    fn each_wrap_gets_a_distinct_container_name() {
        let sandbox = DockerSandbox::default();
        let mut first = Command::new("sh");
        first.arg("-c").arg("id");
        sandbox.wrap_command(&mut first, &ResourceLimits::default()).unwrap();
        let mut second = Command::new("sh");
        second.arg("-c").arg("id");
        sandbox.wrap_command(&mut second, &ResourceLimits::default()).unwrap();

        let a = container_name(&first).expect("named");
        let b = container_name(&second).expect("named");
        assert!(a.starts_with(NAME_PREFIX));
        assert_ne!(a, b);
        assert!(container_name(&Command::new("sh")).is_none());
    }

    #[test]
    fn docker_new_fails_without_daemon() {
        if DockerSandbox::is_installed() {
            return;
        }
        assert!(DockerSandbox::new(&SandboxConfig::default()).is_err());
    }
}
