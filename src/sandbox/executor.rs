//! Local command execution under a sandbox backend, resource limits and a hard timeout.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;

use super::docker::{container_name, kill_container};
use super::{create_container_sandbox, create_sandbox, NoopSandbox, ResourceLimits, Sandbox};
use crate::config::{GatewayConfig, SandboxConfig};
use crate::error::{GatewayError, Result};
use crate::policy::Tier;
use crate::tasks::{BackgroundTask, TaskRegistry, TaskState};

/// Cap on captured bytes per stream; the formatter truncates further.
const MAX_CAPTURE_BYTES: usize = 8 * 1024 * 1024;
/// How long to wait for pipes to drain after the process exits.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// How strongly a local command is isolated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Isolation {
    /// Direct spawn with ulimits.
    Direct,
    /// The configured sandbox backend.
    Sandboxed,
    /// A container backend; fails if none is available.
    Container,
}

impl Isolation {
    pub fn for_tier(tier: Tier) -> Self {
        match tier {
            Tier::Basic | Tier::Standard => Isolation::Direct,
            Tier::High => Isolation::Sandboxed,
            Tier::Maximum => Isolation::Container,
        }
    }
}

/// Captured output of a finished command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    /// Exit status; `-1` when the process was ended by a signal.
    pub exit_code: i32,
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout followed by stderr, for signature scanning.
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Runs commands on the gateway host.
pub struct SandboxExecutor {
    direct: Arc<dyn Sandbox>,
    sandbox: Arc<dyn Sandbox>,
    container: OnceCell<std::result::Result<Arc<dyn Sandbox>, String>>,
    config: SandboxConfig,
    task_log_dir: PathBuf,
    tasks: Arc<TaskRegistry>,
}

impl SandboxExecutor {
    pub fn new(config: &GatewayConfig, tasks: Arc<TaskRegistry>) -> Self {
        Self::with_sandbox(config, create_sandbox(&config.sandbox), tasks)
    }

    /// Use an explicit backend for the high tier.
    pub fn with_sandbox(config: &GatewayConfig, sandbox: Arc<dyn Sandbox>, tasks: Arc<TaskRegistry>) -> Self {
        tracing::info!(backend = sandbox.name(), "local sandbox backend selected");
        Self {
            direct: Arc::new(NoopSandbox),
            sandbox,
            container: OnceCell::new(),
            config: config.sandbox.clone(),
            task_log_dir: config.resolve_path(&config.background.log_dir),
            tasks,
        }
    }

    pub fn sandbox_name(&self) -> &str {
        self.sandbox.name()
    }

    async fn backend(&self, isolation: Isolation) -> Result<Arc<dyn Sandbox>> {
        match isolation {
            Isolation::Direct => Ok(self.direct.clone()),
            Isolation::Sandboxed => Ok(self.sandbox.clone()),
            Isolation::Container if self.sandbox.is_container() => Ok(self.sandbox.clone()),
            Isolation::Container => {
                let detected = self
                    .container
                    .get_or_init(|| async {
                        let config = self.config.clone();
                        tokio::task::spawn_blocking(move || {
                            create_container_sandbox(&config).map_err(|e| e.to_string())
                        })
                        .await
                        .unwrap_or_else(|e| Err(e.to_string()))
                    })
                    .await;
                detected.clone().map_err(|message| GatewayError::SandboxUnavailable {
                    backend: "docker".into(),
                    message,
                })
            }
        }
    }

    async fn prepare(
        &self,
        command: &str,
        isolation: Isolation,
        limits: &ResourceLimits,
    ) -> Result<(tokio::process::Command, Option<String>)> {
        let backend = self.backend(isolation).await?;
        let mut cmd = std::process::Command::new("sh");
        cmd.arg("-c").arg(command);
        backend.wrap_command(&mut cmd, limits)?;
        let container = container_name(&cmd);
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        let mut cmd = tokio::process::Command::from(cmd);
        cmd.stdin(Stdio::null());
        Ok((cmd, container))
    }

    /// Run to completion or kill the whole process group when `timeout` expires.
    pub async fn run(
        &self,
        command: &str,
        isolation: Isolation,
        limits: &ResourceLimits,
        timeout: Duration,
    ) -> Result<ExecutionResult> {
        let (mut cmd, container) = self.prepare(command, isolation, limits).await?;
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let started = Instant::now();
        let mut child = cmd.spawn()?;
        let pid = child.id();
        let stdout = Arc::new(Mutex::new(Vec::new()));
        let stderr = Arc::new(Mutex::new(Vec::new()));
        let mut readers = vec![
            spawn_reader(child.stdout.take(), stdout.clone()),
            spawn_reader(child.stderr.take(), stderr.clone()),
        ];

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => {
                let status = status?;
                for reader in &mut readers {
                    if tokio::time::timeout(DRAIN_GRACE, &mut *reader).await.is_err() {
                        reader.abort();
                    }
                }
                let result = ExecutionResult {
                    stdout: lossy(&stdout),
                    stderr: lossy(&stderr),
                    exit_code: status.code().unwrap_or(-1),
                    duration_ms: started.elapsed().as_millis() as u64,
                };
                tracing::debug!(exit_code = result.exit_code, duration_ms = result.duration_ms, "local command finished");
                Ok(result)
            }
            Err(_) => {
                if let Some(name) = &container {
                    kill_container(name).await;
                }
                kill_process_group(pid);
                if let Err(err) = child.kill().await {
                    tracing::debug!(error = %err, "child already gone after group kill");
                }
                for reader in &readers {
                    reader.abort();
                }
                let elapsed = started.elapsed();
                tracing::warn!(elapsed_ms = elapsed.as_millis() as u64, "local command timed out and was killed");
                let partial = ExecutionResult {
                    stdout: lossy(&stdout),
                    stderr: lossy(&stderr),
                    exit_code: -1,
                    duration_ms: elapsed.as_millis() as u64,
                };
                Err(GatewayError::Timeout {
                    elapsed,
                    partial_output: partial.combined(),
                })
            }
        }
    }

    /// Launch detached with output redirected to a per-task log file. Exempt from the timeout.
    pub async fn spawn_background(
        &self,
        host_id: &str,
        command: &str,
        isolation: Isolation,
        limits: &ResourceLimits,
    ) -> Result<BackgroundTask> {
        tokio::fs::create_dir_all(&self.task_log_dir).await?;
        let mut task = BackgroundTask::new(host_id, command, String::new());
        let log_path = self.task_log_dir.join(format!("{}.log", task.task_id));
        task.log_file = log_path.display().to_string();

        let log = std::fs::File::create(&log_path)?;
        let log_err = log.try_clone()?;
        let (mut cmd, _) = self.prepare(command, isolation, limits).await?;
        cmd.stdout(Stdio::from(log)).stderr(Stdio::from(log_err));

        let mut child = cmd.spawn()?;
        task.pid = child.id();
        self.tasks.insert(task.clone());
        tracing::info!(task_id = %task.task_id, pid = ?task.pid, log = %task.log_file, "background task started");

        let tasks = self.tasks.clone();
        let task_id = task.task_id.clone();
        tokio::spawn(async move {
            let state = match child.wait().await {
                Ok(status) => TaskState::Exited {
                    code: status.code(),
                },
                Err(err) => TaskState::Failed {
                    message: err.to_string(),
                },
            };
            tracing::info!(task_id = %task_id, ?state, "background task ended");
            tasks.set_state(&task_id, state);
        });

        Ok(task)
    }
}

fn spawn_reader<R>(pipe: Option<R>, sink: Arc<Mutex<Vec<u8>>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut pipe) = pipe else {
            return;
        };
        let mut chunk = [0u8; 8192];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let mut buf = sink.lock();
                    let room = MAX_CAPTURE_BYTES.saturating_sub(buf.len());
                    buf.extend_from_slice(&chunk[..n.min(room)]);
                }
            }
        }
    })
}

fn lossy(buf: &Mutex<Vec<u8>>) -> String {
    String::from_utf8_lossy(&buf.lock()).into_owned()
}

/// The child leads its own process group, so grandchildren die with it.
#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    let Some(pgid) = pid.and_then(|p| libc::pid_t::try_from(p).ok()) else {
        return;
    };
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } != 0 {
        let err = std::io::Error::last_os_error();
        tracing::debug!(error = %err, pgid, "process group kill failed");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxBackend;

    fn executor(dir: &std::path::Path) -> SandboxExecutor {
        let mut config = GatewayConfig::default();
        config.sandbox.backend = SandboxBackend::None;
        config.base_dir = dir.to_path_buf();
        SandboxExecutor::new(&config, Arc::new(TaskRegistry::new()))
    }

    #[test]
    fn isolation_follows_tier() {
        assert_eq!(Isolation::for_tier(Tier::Standard), Isolation::Direct);
        assert_eq!(Isolation::for_tier(Tier::High), Isolation::Sandboxed);
        assert_eq!(Isolation::for_tier(Tier::Maximum), Isolation::Container);
    }

    #[tokio::test]
    async fn runs_command_and_captures_streams() {
        let dir = tempfile::tempdir().unwrap();
        let result = executor(dir.path())
            .run(
                "echo out; echo err >&2; exit 3",
                Isolation::Direct,
                &ResourceLimits::default(),
                Duration::from_secs(10),
            )
            .await
            .unwrap();
        assert_eq!(result.stdout.trim(), "out");
        assert_eq!(result.stderr.trim(), "err");
        assert_eq!(result.exit_code, 3);
        assert!(!result.success());
    }

    #[tokio::test]
    async fn timeout_kills_and_keeps_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let started = Instant::now();
        let err = executor(dir.path())
            .run(
                "echo started; sleep 30",
                Isolation::Direct,
                &ResourceLimits::default(),
                Duration::from_millis(500),
            )
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(5));
        match err {
            GatewayError::Timeout { partial_output, .. } => {
                assert!(partial_output.contains("started"))
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    /// Absent or a zombie awaiting its reaper.
    #[cfg(target_os = "linux")]
    fn is_dead(pid: &str) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .is_some_and(|rest| rest.trim_start().starts_with('Z')),
            Err(_) => true,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn timeout_kills_grandchildren_in_the_group() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("bg.pid");
        let command = format!("sleep 30 & echo $! > {}; wait", pid_file.display());
        let err = executor(dir.path())
            .run(&command, Isolation::Direct, &ResourceLimits::default(), Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Timeout { .. }));

        let pid = std::fs::read_to_string(&pid_file).unwrap();
        let pid = pid.trim();
        let mut dead = false;
        for _ in 0..20 {
            if is_dead(pid) {
                dead = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(dead, "background sleep {pid} survived the timeout");
    }

    #[tokio::test]
    async fn background_task_writes_log_and_registers() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        let task = exec
            .spawn_background("local", "echo from-task", Isolation::Direct, &ResourceLimits::default())
            .await
            .unwrap();
        assert!(task.log_file.ends_with(".log"));
        assert!(task.pid.is_some());

        for _ in 0..50 {
            if exec.tasks.running() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(
            exec.tasks.get(&task.task_id).map(|t| t.state),
            Some(TaskState::Exited { code: Some(0) })
        );
        let log = std::fs::read_to_string(&task.log_file).unwrap();
        assert!(log.contains("from-task"));
    }
}
