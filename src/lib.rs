//! secure-shell-gateway: policy-enforcing command execution on local and SSH hosts.
//!
//! A [`Gateway`] resolves the target host and security tier, runs the command through the
//! [`policy::SecurityPipeline`], dispatches it to the [`sandbox::SandboxExecutor`] or the
//! [`ssh::ConnectionManager`], shapes the output and writes an [`audit::AuditEntry`].

pub mod audit;
pub mod config;
pub mod error;
pub mod gateway;
pub mod interaction;
pub mod loader;
pub mod output;
pub mod policy;
pub mod presets;
pub mod protocol;
pub mod sandbox;
pub mod ssh;
pub mod tasks;

pub use audit::{Alert, AuditEntry, AuditLogger, AuditOutcome};
pub use config::{GatewayConfig, HostDescriptor, HostKind, SandboxBackend};
pub use error::{GatewayError, Result};
pub use gateway::{CommandResult, Gateway};
pub use loader::{ConfigProvider, FileConfigProvider};
pub use output::OutputFormat;
pub use policy::{Confirmation, Layer, RiskLevel, SecurityPipeline, Severity, Tier, Verdict};
pub use protocol::{Action, Request, Response};
pub use sandbox::{create_sandbox, NoopSandbox, Sandbox, SandboxExecutor};
pub use ssh::ConnectionManager;
