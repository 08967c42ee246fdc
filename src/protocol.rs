//! Request and response shapes exchanged at the process boundary.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{HostDescriptor, HostKind};
use crate::error::GatewayError;
use crate::interaction::InteractionMatch;
use crate::output::{FormattedOutput, OutputFormat};
use crate::policy::{Confirmation, Layer, RiskLevel, Severity, Tier, Verdict};
use crate::tasks::BackgroundTask;

/// Non-command operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Action {
    ListHosts,
    TestConnection,
    GetStatus,
    ListPresets,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::ListHosts => "listHosts",
            Action::TestConnection => "testConnection",
            Action::GetStatus => "getStatus",
            Action::ListPresets => "listPresets",
        }
    }
}

/// One gateway call. Exactly one of `command`, `action` or `preset` is expected.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub action: Option<Action>,
    #[serde(default)]
    pub preset: Option<String>,
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
    #[serde(default)]
    pub host_id: Option<String>,
    #[serde(default)]
    pub security_level: Option<Tier>,
    /// Milliseconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub is_long_running: bool,
    /// Authorization code.
    #[serde(default)]
    pub require_admin: Option<String>,
    #[serde(default)]
    pub double_confirm: bool,
    #[serde(default)]
    pub output_format: Option<OutputFormat>,
    /// Memory limit override in MiB, clamped to the configured ceiling.
    #[serde(default)]
    pub memory: Option<u32>,
    #[serde(default)]
    pub cpus: Option<f64>,
}

impl Request {
    pub fn command(command: impl Into<String>) -> Self {
        Self {
            command: Some(command.into()),
            ..Self::default()
        }
    }

    pub fn action(action: Action) -> Self {
        Self {
            action: Some(action),
            ..Self::default()
        }
    }

    pub fn on_host(mut self, host_id: impl Into<String>) -> Self {
        self.host_id = Some(host_id.into());
        self
    }

    pub fn at_tier(mut self, tier: Tier) -> Self {
        self.security_level = Some(tier);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.require_admin = Some(code.into());
        self
    }

    /// Preset parameters as strings; scalars are stringified, other values dropped.
    pub fn param_strings(&self) -> BTreeMap<String, String> {
        self.params
            .iter()
            .filter_map(|(k, v)| {
                let s = match v {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    _ => return None,
                };
                Some((k.clone(), s))
            })
            .collect()
    }
}

/// Host entry as shown to callers. Credentials are never included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostAsset {
    pub id: String,
    pub name: String,
    pub kind: HostKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub security_level: Tier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jump_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl HostAsset {
    pub fn from_host(host: &HostDescriptor, default_tier: Tier) -> Self {
        let remote = !host.is_local();
        Self {
            id: host.id.clone(),
            name: host.display_name().to_string(),
            kind: host.kind,
            address: remote.then(|| format!("{}:{}", host.address, host.port)),
            username: remote.then(|| host.username.clone()),
            security_level: host.security_level.unwrap_or(default_tier),
            jump_host: host.jump_host.clone(),
            description: host.description.clone(),
        }
    }
}

/// Error payload. Policy blocks carry the layer; confirmation blocks add the prompt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub code: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer: Option<Layer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<RiskLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation: Option<Confirmation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_id: Option<String>,
    /// Output of a command that ran and failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<FormattedOutput>,
}

impl ErrorBody {
    pub fn new(code: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            reason: reason.into(),
            ..Self::default()
        }
    }

    pub fn blocked(verdict: &Verdict) -> Self {
        Self {
            code: "blocked_by_policy".into(),
            reason: verdict.reason.clone(),
            layer: Some(verdict.layer),
            severity: Some(verdict.severity),
            rule: verdict.rule.clone(),
            ..Self::default()
        }
    }
}

impl From<&GatewayError> for ErrorBody {
    fn from(err: &GatewayError) -> Self {
        ErrorBody::new(err.code(), err.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Success {
        result: Value,
    },
    Error {
        #[serde(flatten)]
        error: ErrorBody,
    },
    Discovery {
        message: String,
        assets: Vec<HostAsset>,
    },
    Background {
        task: BackgroundTask,
    },
    #[serde(rename_all = "camelCase")]
    InteractionRequired {
        host_id: String,
        signature: String,
        excerpt: String,
        partial_output: String,
        message: String,
    },
}

impl Response {
    pub fn success(result: impl Serialize) -> Self {
        match serde_json::to_value(result) {
            Ok(result) => Response::Success { result },
            Err(err) => Response::error(ErrorBody::new("internal_error", err.to_string())),
        }
    }

    pub fn error(error: ErrorBody) -> Self {
        Response::Error { error }
    }

    pub fn interaction(host_id: &str, found: InteractionMatch, partial_output: String) -> Self {
        Response::InteractionRequired {
            host_id: host_id.to_string(),
            message: format!(
                "command is waiting for interactive input ('{}'); rerun it non-interactively",
                found.excerpt
            ),
            signature: found.signature,
            excerpt: found.excerpt,
            partial_output,
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            Response::Success { .. } => "success",
            Response::Error { .. } => "error",
            Response::Discovery { .. } => "discovery",
            Response::Background { .. } => "background",
            Response::InteractionRequired { .. } => "interaction_required",
        }
    }

    pub fn error_body(&self) -> Option<&ErrorBody> {
        match self {
            Response::Error { error } => Some(error),
            _ => None,
        }
    }
}
