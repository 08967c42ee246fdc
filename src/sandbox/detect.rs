//! Backend selection and auto-detection. Detection runs once, when the gateway starts.

use std::sync::Arc;

use crate::config::{SandboxBackend, SandboxConfig};
use crate::sandbox::Sandbox;

use super::{BubblewrapSandbox, DockerSandbox, FirejailSandbox, NoopSandbox};

/// Create the configured backend, falling back to [`NoopSandbox`] when it is missing.
pub(super) fn create_sandbox_impl(config: &SandboxConfig) -> Arc<dyn Sandbox> {
    match config.backend {
        SandboxBackend::None => Arc::new(NoopSandbox),
        SandboxBackend::Firejail => match FirejailSandbox::new(config.firejail_args.clone()) {
            Ok(sandbox) => Arc::new(sandbox),
            Err(err) => {
                tracing::warn!(error = %err, "Firejail requested but not available, falling back to ulimit only");
                Arc::new(NoopSandbox)
            }
        },
        SandboxBackend::Bubblewrap => match BubblewrapSandbox::new() {
            Ok(sandbox) => Arc::new(sandbox),
            Err(err) => {
                tracing::warn!(error = %err, "Bubblewrap requested but not available, falling back to ulimit only");
                Arc::new(NoopSandbox)
            }
        },
        SandboxBackend::Docker => match DockerSandbox::new(config) {
            Ok(sandbox) => Arc::new(sandbox),
            Err(err) => {
                tracing::warn!(error = %err, "Docker requested but not available, falling back to ulimit only");
                Arc::new(NoopSandbox)
            }
        },
        SandboxBackend::Auto => detect_best_sandbox(config),
    }
}

/// Container backend for the maximum tier. No fallback: absence is an error.
pub(super) fn create_container_impl(config: &SandboxConfig) -> std::io::Result<Arc<dyn Sandbox>> {
    DockerSandbox::new(config).map(|s| Arc::new(s) as Arc<dyn Sandbox>)
}

fn detect_best_sandbox(config: &SandboxConfig) -> Arc<dyn Sandbox> {
    #[cfg(target_os = "linux")]
    {
        if let Ok(sandbox) = BubblewrapSandbox::new() {
            tracing::info!("Bubblewrap sandbox enabled");
            return Arc::new(sandbox);
        }

        if let Ok(sandbox) = FirejailSandbox::new(config.firejail_args.clone()) {
            tracing::info!("Firejail sandbox enabled");
            return Arc::new(sandbox);
        }
    }

    if let Ok(sandbox) = DockerSandbox::new(config) {
        tracing::info!("Docker sandbox enabled");
        return Arc::new(sandbox);
    }

    tracing::info!("No sandbox backend available, using ulimit only");
    Arc::new(NoopSandbox)
}
