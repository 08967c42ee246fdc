//! russh client: handshake, authentication, exec channels.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect, Sig};
use russh_keys::key;

use super::keys::AuthMethod;
use crate::config::HostDescriptor;
use crate::error::{GatewayError, Result};
use crate::sandbox::ExecutionResult;

/// Host-key policy and identity for one connection.
pub struct ClientHandler {
    host_id: String,
    address: String,
    port: u16,
    known_hosts: Option<PathBuf>,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint();
        let Some(path) = &self.known_hosts else {
            tracing::info!(host = %self.host_id, %fingerprint, "accepting server key");
            return Ok(true);
        };
        match russh_keys::check_known_hosts_path(&self.address, self.port, server_public_key, path) {
            Ok(true) => Ok(true),
            Ok(false) => {
                tracing::warn!(host = %self.host_id, %fingerprint, "server key not in known_hosts");
                Ok(false)
            }
            Err(err) => {
                tracing::warn!(host = %self.host_id, %fingerprint, error = %err, "server key check failed");
                Ok(false)
            }
        }
    }
}

/// An authenticated SSH connection. Tunnelled sessions keep their jump session alive.
pub struct SshSession {
    host_id: String,
    handle: Handle<ClientHandler>,
    connected_at: DateTime<Utc>,
    _via: Option<Arc<SshSession>>,
}

impl std::fmt::Debug for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession")
            .field("host_id", &self.host_id)
            .field("connected_at", &self.connected_at)
            .field("tunnelled", &self._via.is_some())
            .finish()
    }
}

impl SshSession {
    /// Handshake and authenticate, directly or through `via`.
    pub async fn open(
        host: &HostDescriptor,
        auth: &[AuthMethod],
        config: Arc<client::Config>,
        known_hosts: Option<PathBuf>,
        via: Option<Arc<SshSession>>,
    ) -> Result<Self> {
        let handler = ClientHandler {
            host_id: host.id.clone(),
            address: host.address.clone(),
            port: host.port,
            known_hosts,
        };

        let mut handle = match &via {
            Some(jump) => {
                let channel = jump
                    .handle
                    .channel_open_direct_tcpip(host.address.clone(), u32::from(host.port), "127.0.0.1", 0)
                    .await
                    .map_err(|e| {
                        GatewayError::transport(
                            &host.id,
                            format!("tunnel through '{}' failed: {e}", jump.host_id),
                        )
                    })?;
                client::connect_stream(config, channel.into_stream(), handler).await?
            }
            None => client::connect(config, (host.address.as_str(), host.port), handler).await?,
        };

        authenticate(&mut handle, host, auth).await?;
        tracing::info!(host = %host.id, tunnelled = via.is_some(), "ssh session ready");

        Ok(Self {
            host_id: host.id.clone(),
            handle,
            connected_at: Utc::now(),
            _via: via,
        })
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    /// Run `command` on a fresh channel. On timeout the remote process is signalled and the
    /// channel closed.
    pub async fn exec(&self, command: &str, timeout: Duration) -> Result<ExecutionResult> {
        let started = Instant::now();
        let mut channel = self.handle.channel_open_session().await?;
        channel.exec(true, command).await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code: Option<i32> = None;

        let finished = tokio::time::timeout(timeout, async {
            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                    ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => {
                        stderr.extend_from_slice(data)
                    }
                    ChannelMsg::ExitStatus { exit_status } => {
                        exit_code = Some(i32::try_from(exit_status).unwrap_or(-1))
                    }
                    ChannelMsg::ExitSignal { .. } => {
                        exit_code.get_or_insert(-1);
                    }
                    _ => {}
                }
            }
        })
        .await;

        let result = ExecutionResult {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code: exit_code.unwrap_or(-1),
            duration_ms: started.elapsed().as_millis() as u64,
        };

        if finished.is_err() {
            if let Err(err) = channel.signal(Sig::KILL).await {
                tracing::debug!(error = %err, "remote kill signal not delivered");
            }
            if let Err(err) = channel.close().await {
                tracing::debug!(error = %err, "channel close after timeout failed");
            }
            tracing::warn!(host = %self.host_id, elapsed_ms = result.duration_ms, "remote command timed out");
            return Err(GatewayError::Timeout {
                elapsed: started.elapsed(),
                partial_output: result.combined(),
            });
        }
        Ok(result)
    }

    pub async fn disconnect(&self) {
        if let Err(err) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            tracing::debug!(host = %self.host_id, error = %err, "disconnect failed");
        }
    }
}

async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    host: &HostDescriptor,
    methods: &[AuthMethod],
) -> Result<()> {
    for method in methods {
        let accepted = match method {
            AuthMethod::PublicKey(key) => {
                handle
                    .authenticate_publickey(host.username.clone(), key.clone())
                    .await?
            }
            AuthMethod::Password(password) => {
                handle
                    .authenticate_password(host.username.clone(), password.clone())
                    .await?
            }
        };
        if accepted {
            return Ok(());
        }
        tracing::debug!(host = %host.id, ?method, "authentication method rejected");
    }
    Err(GatewayError::AuthenticationRejected {
        host: host.id.clone(),
        user: host.username.clone(),
    })
}

/// Quote `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("ls -la"), "'ls -la'");
        assert_eq!(shell_quote("echo 'hi'"), r"'echo '\''hi'\'''");
    }
}
