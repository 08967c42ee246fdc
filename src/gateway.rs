//! Request orchestration: host resolution, validation, dispatch, formatting and audit.
//!
//! [`Gateway::handle`] never fails; every error is converted into a [`Response`], and every
//! command path appends exactly one audit entry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::audit::{AuditEntry, AuditLogger, AuditOutcome};
use crate::config::{GatewayConfig, HostDescriptor};
use crate::error::GatewayError;
use crate::interaction::InteractionDetector;
use crate::loader::{validate_hosts, ConfigProvider};
use crate::output::{FormattedOutput, OutputFormatter};
use crate::policy::{
    Clearance, Layer, PipelineOutcome, PipelineReport, RiskLevel, SecurityPipeline, Severity, Tier,
};
use crate::presets::{PresetExpander, PresetInfo};
use crate::protocol::{Action, ErrorBody, HostAsset, Request, Response};
use crate::sandbox::{create_sandbox, Isolation, ResourceLimits, Sandbox, SandboxExecutor};
use crate::ssh::{ConnectionManager, ExecOptions, ManagerStatus};
use crate::tasks::{BackgroundTask, TaskRegistry};

/// Payload of a successful command.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub host_id: String,
    pub command: String,
    pub tier: Tier,
    pub risk_level: RiskLevel,
    pub clearance: Clearance,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
    #[serde(flatten)]
    pub output: FormattedOutput,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct PresetResult {
    preset: String,
    results: Vec<CommandResult>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GatewayStatus {
    started_at: DateTime<Utc>,
    hosts: Vec<HostAsset>,
    local_sandbox: String,
    connections: ManagerStatus,
    tasks: Vec<BackgroundTask>,
    running_tasks: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    degraded: Vec<String>,
}

/// What running one command produced.
enum CommandOutcome {
    Done(CommandResult),
    Stop(Response),
}

pub struct Gateway {
    config: GatewayConfig,
    pipeline: SecurityPipeline,
    presets: PresetExpander,
    formatter: OutputFormatter,
    interaction: InteractionDetector,
    audit: AuditLogger,
    executor: Arc<SandboxExecutor>,
    connections: ConnectionManager,
    tasks: Arc<TaskRegistry>,
    started_at: DateTime<Utc>,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> anyhow::Result<Self> {
        let sandbox = create_sandbox(&config.sandbox);
        Self::with_sandbox(config, sandbox)
    }

    pub fn from_provider(provider: &dyn ConfigProvider) -> anyhow::Result<Self> {
        Self::new(provider.load()?)
    }

    /// Build with an explicit high-tier sandbox backend.
    pub fn with_sandbox(config: GatewayConfig, sandbox: Arc<dyn Sandbox>) -> anyhow::Result<Self> {
        validate_hosts(&config.hosts)?;
        let pipeline = SecurityPipeline::from_config(&config).context("security rules")?;
        let presets = PresetExpander::new(&config.presets).context("presets")?;
        let interaction =
            InteractionDetector::new(&config.interaction.signatures).context("interaction signatures")?;
        let tasks = Arc::new(TaskRegistry::new());
        let executor = Arc::new(SandboxExecutor::with_sandbox(&config, sandbox, tasks.clone()));
        let connections = ConnectionManager::new(&config, executor.clone(), tasks.clone());
        for degraded in &config.degraded {
            tracing::warn!(%degraded, "running with degraded rule set");
        }
        tracing::info!(hosts = config.hosts.len(), default_tier = %config.default_tier, "gateway ready");
        Ok(Self {
            formatter: OutputFormatter::new(config.output.max_bytes),
            audit: AuditLogger::new(config.audit.clone(), &config.base_dir),
            pipeline,
            presets,
            interaction,
            executor,
            connections,
            tasks,
            started_at: Utc::now(),
            config,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    /// Close every connection and fail queued waiters.
    pub async fn shutdown(&self) {
        self.connections.disconnect_all().await;
    }

    pub async fn handle(&self, request: Request) -> Response {
        if let Some(action) = request.action {
            return self.handle_action(action, &request).await;
        }

        let subject = match (&request.command, &request.preset) {
            (Some(command), None) if !command.trim().is_empty() => command.clone(),
            (None, Some(preset)) => format!("preset:{preset}"),
            _ => {
                let err = GatewayError::InvalidRequest(
                    "exactly one of command, action or preset is required".into(),
                );
                return self.fail_unrouted(&request, err).await;
            }
        };

        let host = match self.resolve_host(&request, &subject).await {
            Ok(host) => host,
            Err(discovery) => return discovery,
        };
        let tier = request
            .security_level
            .or(host.security_level)
            .unwrap_or(self.config.default_tier);

        match &request.preset {
            Some(preset) => self.run_preset(host, tier, preset, &request).await,
            None => match self.run_command(host, tier, &subject, &request).await {
                CommandOutcome::Done(result) => Response::success(result),
                CommandOutcome::Stop(response) => response,
            },
        }
    }

    async fn resolve_host(&self, request: &Request, subject: &str) -> Result<&HostDescriptor, Response> {
        let message = match request.host_id.as_deref() {
            Some(id) => match self.config.host(id) {
                Some(host) => return Ok(host),
                None => format!("host '{id}' is not configured; choose one of the listed hosts"),
            },
            None => "hostId is required; choose one of the listed hosts".to_string(),
        };
        tracing::info!(host = ?request.host_id, "host not resolved, returning discovery");
        let mut entry = AuditEntry::new(AuditOutcome::Discovery)
            .with_command(subject)
            .with_error(message.clone());
        entry.host_id = request.host_id.clone();
        self.record(entry).await;
        Err(Response::Discovery {
            message,
            assets: self.assets(),
        })
    }

    fn assets(&self) -> Vec<HostAsset> {
        self.config
            .hosts
            .iter()
            .map(|h| HostAsset::from_host(h, self.config.default_tier))
            .collect()
    }

    async fn record(&self, entry: AuditEntry) {
        if let Err(err) = self.audit.record(entry).await {
            tracing::error!(error = %format!("{err:#}"), "failed to write audit entry");
        }
    }

    async fn fail_unrouted(&self, request: &Request, err: GatewayError) -> Response {
        let mut entry = AuditEntry::new(AuditOutcome::Failed).with_error(err.to_string());
        entry.command = request.command.clone();
        entry.host_id = request.host_id.clone();
        self.record(entry).await;
        Response::error(ErrorBody::from(&err))
    }

    async fn handle_action(&self, action: Action, request: &Request) -> Response {
        let started = Instant::now();
        let response = match action {
            Action::ListHosts => Response::success(serde_json::json!({ "hosts": self.assets() })),
            Action::ListPresets => {
                let presets: Vec<PresetInfo> = self.presets.list();
                Response::success(serde_json::json!({ "presets": presets }))
            }
            Action::GetStatus => Response::success(GatewayStatus {
                started_at: self.started_at,
                hosts: self.assets(),
                local_sandbox: self.executor.sandbox_name().to_string(),
                connections: self.connections.status(),
                tasks: self.tasks.list(),
                running_tasks: self.tasks.running(),
                degraded: self.config.degraded.clone(),
            }),
            Action::TestConnection => {
                let host = match self.resolve_host(request, action.as_str()).await {
                    Ok(host) => host,
                    Err(discovery) => return discovery,
                };
                match self.connections.test_connection(&host.id).await {
                    Ok(check) => Response::success(check),
                    Err(err) => {
                        tracing::warn!(host = %host.id, error = %err, "connection test failed");
                        let mut body = ErrorBody::from(&err);
                        body.host_id = Some(host.id.clone());
                        Response::error(body)
                    }
                }
            }
        };

        let outcome = match &response {
            Response::Error { .. } => AuditOutcome::Failed,
            _ => AuditOutcome::Succeeded,
        };
        let mut entry = AuditEntry::new(outcome)
            .with_action(action.as_str())
            .with_result(None, started.elapsed().as_millis() as u64);
        entry.host_id = request.host_id.clone();
        if let Some(body) = response.error_body() {
            entry.error = Some(body.reason.clone());
        }
        self.record(entry).await;
        response
    }

    async fn run_preset(&self, host: &HostDescriptor, tier: Tier, preset: &str, request: &Request) -> Response {
        let commands = match self.presets.expand(preset, &request.param_strings()) {
            Ok(commands) => commands,
            Err(err) => {
                let entry = AuditEntry::new(AuditOutcome::Blocked)
                    .with_command(format!("preset:{preset}"))
                    .with_host(&host.id, Some(tier))
                    .with_error(err.to_string());
                self.record(entry).await;
                let mut body = ErrorBody::new("invalid_request", err.to_string());
                body.host_id = Some(host.id.clone());
                return Response::error(body);
            }
        };

        tracing::info!(preset, host = %host.id, commands = commands.len(), "running preset");
        let mut results = Vec::with_capacity(commands.len());
        for command in &commands {
            match self.run_command(host, tier, command, request).await {
                CommandOutcome::Done(result) => results.push(result),
                CommandOutcome::Stop(response) => return response,
            }
        }
        Response::success(PresetResult {
            preset: preset.to_string(),
            results,
        })
    }

    /// Validate, execute and audit one concrete command.
    async fn run_command(&self, host: &HostDescriptor, tier: Tier, command: &str, request: &Request) -> CommandOutcome {
        let started = Instant::now();
        let report = self.pipeline.evaluate(
            command,
            tier,
            request.require_admin.as_deref(),
            request.double_confirm,
        );
        for verdict in &report.verdicts {
            tracing::debug!(host = %host.id, layer = %verdict.layer, passed = verdict.passed, reason = %verdict.reason, "layer decision");
        }

        let entry = AuditEntry::new(AuditOutcome::Succeeded)
            .with_command(command)
            .with_host(&host.id, Some(tier));

        let clearance = match &report.outcome {
            PipelineOutcome::Allowed { clearance } => *clearance,
            PipelineOutcome::Blocked { verdict } => {
                tracing::info!(host = %host.id, layer = %verdict.layer, reason = %verdict.reason, "command blocked");
                let mut body = ErrorBody::blocked(verdict);
                body.risk_level = Some(report.risk);
                body.host_id = Some(host.id.clone());
                self.finish_blocked(entry, &report, started).await;
                return CommandOutcome::Stop(Response::error(body));
            }
            PipelineOutcome::ConfirmationRequired { required, prompt } => {
                tracing::info!(host = %host.id, risk = %report.risk, confirmation = ?required, "confirmation required");
                let reason = report
                    .verdicts
                    .last()
                    .map(|v| v.reason.clone())
                    .unwrap_or_else(|| "confirmation required".into());
                let body = ErrorBody {
                    code: "confirmation_required".into(),
                    reason,
                    layer: Some(Layer::Confirmation),
                    severity: Some(Severity::Medium),
                    risk_level: Some(report.risk),
                    confirmation: Some(*required),
                    prompt: Some(prompt.clone()),
                    host_id: Some(host.id.clone()),
                    ..ErrorBody::default()
                };
                self.finish_blocked(entry, &report, started).await;
                return CommandOutcome::Stop(Response::error(body));
            }
        };

        let entry = entry.with_verdicts(
            report.verdicts.clone(),
            Some(report.risk),
            clearance == Clearance::Escaped,
        );
        let isolation = Isolation::for_tier(tier);
        let sandbox = host.is_local().then(|| match isolation {
            Isolation::Direct => "none".to_string(),
            Isolation::Sandboxed => self.executor.sandbox_name().to_string(),
            Isolation::Container => "docker".to_string(),
        });
        let entry = entry.with_sandbox(sandbox.clone());
        let options = ExecOptions {
            timeout: self.timeout_for(host, request),
            isolation,
            limits: ResourceLimits::from_config(&self.config.resources, request.memory, request.cpus),
        };

        if request.is_long_running {
            return match self.connections.spawn_background(&host.id, command, &options).await {
                Ok(task) => {
                    let mut entry = entry.with_result(None, started.elapsed().as_millis() as u64);
                    entry.outcome = AuditOutcome::Background;
                    self.record(entry).await;
                    CommandOutcome::Stop(Response::Background { task })
                }
                Err(err) => CommandOutcome::Stop(self.finish_failed(entry, host, err, started).await),
            };
        }

        tracing::info!(host = %host.id, %tier, risk = %report.risk, "executing command");
        let result = match self.connections.execute(&host.id, command, &options).await {
            Ok(result) => result,
            Err(GatewayError::Timeout { elapsed, partial_output }) => {
                if let Some(found) = self.interaction.scan(&partial_output) {
                    return CommandOutcome::Stop(
                        self.finish_interaction(entry, host, found, partial_output, started).await,
                    );
                }
                let err = GatewayError::Timeout { elapsed, partial_output };
                return CommandOutcome::Stop(self.finish_failed(entry, host, err, started).await);
            }
            Err(err) => return CommandOutcome::Stop(self.finish_failed(entry, host, err, started).await),
        };

        let format = request.output_format.unwrap_or(self.config.output.default_format);
        let output = self.formatter.format(&result, format);
        let entry = entry.with_result(Some(result.exit_code), result.duration_ms);

        let combined = result.combined();
        if let Some(found) = self.interaction.scan(&combined) {
            return CommandOutcome::Stop(self.finish_interaction(entry, host, found, combined, started).await);
        }

        if !result.success() {
            let mut entry = entry.with_error(format!("exit code {}", result.exit_code));
            entry.outcome = AuditOutcome::Failed;
            self.record(entry).await;
            let body = ErrorBody {
                host_id: Some(host.id.clone()),
                risk_level: Some(report.risk),
                output: Some(output),
                ..ErrorBody::new(
                    "execution_failure",
                    format!("command exited with code {}", result.exit_code),
                )
            };
            return CommandOutcome::Stop(Response::error(body));
        }

        self.record(entry).await;
        CommandOutcome::Done(CommandResult {
            host_id: host.id.clone(),
            command: command.to_string(),
            tier,
            risk_level: report.risk,
            clearance,
            sandbox,
            output,
        })
    }

    fn timeout_for(&self, host: &HostDescriptor, request: &Request) -> Duration {
        let ms = request
            .timeout
            .or(host.command_timeout_ms)
            .unwrap_or(self.config.default_timeout_ms)
            .clamp(1, self.config.max_timeout_ms.max(1));
        Duration::from_millis(ms)
    }

    async fn finish_blocked(&self, entry: AuditEntry, report: &PipelineReport, started: Instant) {
        let mut entry = entry
            .with_verdicts(report.verdicts.clone(), Some(report.risk), false)
            .with_result(None, started.elapsed().as_millis() as u64);
        entry.outcome = AuditOutcome::Blocked;
        if let Some(last) = report.verdicts.iter().rev().find(|v| !v.passed) {
            entry.error = Some(format!("{}: {}", last.layer, last.reason));
        }
        self.record(entry).await;
    }

    async fn finish_failed(&self, entry: AuditEntry, host: &HostDescriptor, err: GatewayError, started: Instant) -> Response {
        tracing::warn!(host = %host.id, code = err.code(), error = %err, "command failed");
        let mut entry = entry
            .with_result(None, started.elapsed().as_millis() as u64)
            .with_error(err.to_string());
        entry.outcome = AuditOutcome::Failed;
        self.record(entry).await;

        let mut body = ErrorBody::from(&err);
        body.host_id = Some(host.id.clone());
        if let GatewayError::Timeout { partial_output, .. } = &err {
            if !partial_output.is_empty() {
                body.output = Some(self.formatter.format(
                    &crate::sandbox::ExecutionResult {
                        stdout: partial_output.clone(),
                        stderr: String::new(),
                        exit_code: -1,
                        duration_ms: started.elapsed().as_millis() as u64,
                    },
                    crate::output::OutputFormat::Text,
                ));
            }
        }
        Response::error(body)
    }

    async fn finish_interaction(
        &self,
        entry: AuditEntry,
        host: &HostDescriptor,
        found: crate::interaction::InteractionMatch,
        partial_output: String,
        started: Instant,
    ) -> Response {
        tracing::warn!(host = %host.id, signature = %found.signature, "command blocked on interactive input");
        let mut entry = entry
            .with_result(None, started.elapsed().as_millis() as u64)
            .with_error(format!("interactive prompt: {}", found.excerpt));
        entry.outcome = AuditOutcome::InteractionRequired;
        self.record(entry).await;
        let (partial_output, _) = crate::output::truncate(&partial_output, self.config.output.max_bytes);
        Response::interaction(&host.id, found, partial_output)
    }
}
