//! Integration tests: backend selection, command wrapping, local execution and timeouts.

use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};

use secure_shell_gateway::config::{GatewayConfig, SandboxBackend, SandboxConfig};
use secure_shell_gateway::sandbox::{
    create_sandbox, DockerSandbox, FirejailSandbox, Isolation, NoopSandbox, ResourceLimits, Sandbox,
    SandboxExecutor, GATEWAY_LABEL,
};
use secure_shell_gateway::tasks::{TaskRegistry, TaskState};
use secure_shell_gateway::GatewayError;

fn args_of(cmd: &Command) -> Vec<String> {
    cmd.get_args().map(|s| s.to_string_lossy().into_owned()).collect()
}

fn executor(tmp: &tempfile::TempDir) -> SandboxExecutor {
    let mut config = GatewayConfig {
        base_dir: tmp.path().to_path_buf(),
        ..GatewayConfig::default()
    };
    config.sandbox.backend = SandboxBackend::None;
    SandboxExecutor::with_sandbox(&config, Arc::new(NoopSandbox), Arc::new(TaskRegistry::new()))
}

#[test]
fn create_sandbox_none_returns_noop() {
    let config = SandboxConfig {
        backend: SandboxBackend::None,
        ..SandboxConfig::default()
    };
    assert_eq!(create_sandbox(&config).name(), "none");
}

#[test]
fn create_sandbox_auto_returns_available_backend() {
    assert!(create_sandbox(&SandboxConfig::default()).is_available());
}

#[test]
fn noop_sandbox_prepends_ulimits_and_keeps_argv() {
    let mut cmd = Command::new("echo");
    cmd.arg("hello");
    NoopSandbox
        .wrap_command(&mut cmd, &ResourceLimits::default())
        .unwrap();
    assert_eq!(cmd.get_program().to_string_lossy(), "sh");
    let args = args_of(&cmd);
    assert!(args[1].contains("ulimit -v"));
    assert_eq!(&args[2..], ["echo", "hello"]);
}

#[test]
fn docker_wrapping_is_locked_down() {
    let sandbox = DockerSandbox::unchecked(&SandboxConfig::default());
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg("id");
    sandbox.wrap_command(&mut cmd, &ResourceLimits::default()).unwrap();
    assert_eq!(cmd.get_program().to_string_lossy(), "docker");
    let args = args_of(&cmd);
    for expected in ["--rm", "--read-only", "--cap-drop", "no-new-privileges", "--pids-limit"] {
        assert!(args.iter().any(|a| a == expected), "missing {expected}: {args:?}");
    }
    assert!(args.windows(2).any(|w| w[0] == "--network" && w[1] == "none"));
    assert!(args.windows(2).any(|w| w[0] == "--user" && w[1] == "65534:65534"));
    assert_eq!(&args[args.len() - 3..], ["sh", "-c", "id"]);
    assert!(args
        .windows(2)
        .any(|w| w[0] == "--name" && w[1].starts_with("gateway-")));
}

#[test]
fn firejail_wrapping_uses_native_rlimits() {
    let Ok(sandbox) = FirejailSandbox::new(vec!["--hostname=jail".into()]) else {
        return;
    };
    let mut cmd = Command::new("true");
    sandbox.wrap_command(&mut cmd, &ResourceLimits::default()).unwrap();
    assert_eq!(cmd.get_program().to_string_lossy(), "firejail");
    let args = args_of(&cmd);
    assert!(args.iter().any(|a| a == "--net=none"));
    assert!(args.iter().any(|a| a.starts_with("--rlimit-nproc=")));
    assert!(args.iter().any(|a| a == "--hostname=jail"));
    assert_eq!(args.last().map(String::as_str), Some("true"));
}

#[tokio::test]
async fn direct_execution_captures_streams_and_exit_code() {
    let tmp = tempfile::tempdir().unwrap();
    let result = executor(&tmp)
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
}

#[tokio::test]
async fn timeout_kills_the_process_group_within_margin() {
    let tmp = tempfile::tempdir().unwrap();
    let started = Instant::now();
    let err = executor(&tmp)
        .run(
            "echo started; sleep 30 & sleep 30",
            Isolation::Direct,
            &ResourceLimits::default(),
            Duration::from_millis(300),
        )
        .await
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(5));
    match err {
        GatewayError::Timeout { partial_output, .. } => assert!(partial_output.contains("started")),
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn background_task_writes_log_and_finishes() {
    let tmp = tempfile::tempdir().unwrap();
    let tasks = Arc::new(TaskRegistry::new());
    let mut config = GatewayConfig {
        base_dir: tmp.path().to_path_buf(),
        ..GatewayConfig::default()
    };
    config.sandbox.backend = SandboxBackend::None;
    let exec = SandboxExecutor::with_sandbox(&config, Arc::new(NoopSandbox), tasks.clone());

    let task = exec
        .spawn_background("local", "echo bg-done", Isolation::Direct, &ResourceLimits::default())
        .await
        .unwrap();
    assert!(task.task_id.starts_with("task-"));

    for _ in 0..100 {
        if matches!(tasks.get(&task.task_id).map(|t| t.state), Some(TaskState::Exited { .. })) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(
        tasks.get(&task.task_id).map(|t| t.state),
        Some(TaskState::Exited { code: Some(0) })
    );
    let log = std::fs::read_to_string(&task.log_file).unwrap();
    assert_eq!(log.trim(), "bg-done");
}

fn running_gateway_containers() -> Option<usize> {
    let out = Command::new("docker")
        .args(["ps", "-q", "--filter", &format!("label={GATEWAY_LABEL}")])
        .output()
        .ok()?;
    out.status
        .success()
        .then(|| String::from_utf8_lossy(&out.stdout).lines().count())
}

#[tokio::test]
async fn container_timeout_stops_the_container() {
    let Ok(docker) = DockerSandbox::new(&SandboxConfig::default()) else {
        return;
    };
    let Some(before) = running_gateway_containers() else {
        return;
    };
    let tmp = tempfile::tempdir().unwrap();
    let mut config = GatewayConfig {
        base_dir: tmp.path().to_path_buf(),
        ..GatewayConfig::default()
    };
    config.sandbox.backend = SandboxBackend::Docker;
    let exec = SandboxExecutor::with_sandbox(&config, Arc::new(docker), Arc::new(TaskRegistry::new()));

    let err = exec
        .run("sleep 60", Isolation::Container, &ResourceLimits::default(), Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Timeout { .. }), "{err:?}");
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(running_gateway_containers(), Some(before));
}
