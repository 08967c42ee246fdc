//! Connection manager: per-host SSH sessions with pooling, retry, a global concurrency gate
//! and jump-host tunnelling. Local hosts are dispatched to the sandbox executor.
//!
//! Lock order is host establishment lock, then a gate permit per connect attempt. A permit is
//! never held while sleeping between attempts or while waiting on another host's lock.

mod client;
mod gate;
pub mod keys;

pub use client::{shell_quote, SshSession};
pub use gate::{ConcurrencyGate, GateStatus, Permit};

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use russh::client as russh_client;
use serde::{Deserialize, Serialize};

use crate::config::{GatewayConfig, HostDescriptor, SshConfig};
use crate::error::{GatewayError, Result};
use crate::sandbox::{ExecutionResult, Isolation, ResourceLimits, SandboxExecutor};
use crate::tasks::{BackgroundTask, TaskRegistry, TaskState};

/// Jump chains are validated acyclic at load time; this bounds recursion regardless.
const MAX_JUMP_DEPTH: usize = 8;
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const PROBE_COMMAND: &str = "echo gateway-ping";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Ready,
    Error,
    Closed,
}

/// How to run one command.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub timeout: Duration,
    /// Local hosts only.
    pub isolation: Isolation,
    /// Local hosts only.
    pub limits: ResourceLimits,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub host_id: String,
    pub state: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerStatus {
    pub gate: GateStatus,
    pub pool_size: usize,
    pub max_pool_size: usize,
    pub connections: Vec<ConnectionStatus>,
}

/// Result of a connectivity round-trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionCheck {
    pub host_id: String,
    pub latency_ms: u64,
    pub output: String,
}

struct PoolEntry {
    session: Arc<SshSession>,
    last_used: DateTime<Utc>,
}

/// Ready sessions keyed by host id, evicted least recently used first.
#[derive(Default)]
struct Pool {
    entries: HashMap<String, PoolEntry>,
    lru: VecDeque<String>,
}

impl Pool {
    fn touch(&mut self, host_id: &str) {
        self.lru.retain(|id| id != host_id);
        self.lru.push_back(host_id.to_string());
    }

    fn get(&mut self, host_id: &str) -> Option<Arc<SshSession>> {
        let entry = self.entries.get_mut(host_id)?;
        if entry.session.is_closed() {
            self.remove(host_id);
            return None;
        }
        entry.last_used = Utc::now();
        let session = entry.session.clone();
        self.touch(host_id);
        Some(session)
    }

    /// Insert and return whatever was evicted to stay within `max`.
    fn insert(&mut self, session: Arc<SshSession>, max: usize) -> Vec<Arc<SshSession>> {
        let host_id = session.host_id().to_string();
        let mut evicted: Vec<Arc<SshSession>> = self.remove(&host_id).into_iter().collect();
        while self.entries.len() >= max.max(1) {
            let Some(oldest) = self.lru.pop_front() else {
                break;
            };
            if let Some(entry) = self.entries.remove(&oldest) {
                tracing::debug!(host = %oldest, "evicting pooled connection");
                evicted.push(entry.session);
            }
        }
        self.entries.insert(
            host_id.clone(),
            PoolEntry {
                session,
                last_used: Utc::now(),
            },
        );
        self.touch(&host_id);
        evicted
    }

    fn remove(&mut self, host_id: &str) -> Option<Arc<SshSession>> {
        self.lru.retain(|id| id != host_id);
        self.entries.remove(host_id).map(|e| e.session)
    }

    fn drain(&mut self) -> Vec<Arc<SshSession>> {
        self.lru.clear();
        self.entries.drain().map(|(_, e)| e.session).collect()
    }
}

/// Owns every remote connection and the concurrency gate.
pub struct ConnectionManager {
    hosts: HashMap<String, HostDescriptor>,
    ssh: SshConfig,
    base_dir: PathBuf,
    known_hosts: Option<PathBuf>,
    remote_log_dir: String,
    client_config: Arc<russh_client::Config>,
    gate: Arc<ConcurrencyGate>,
    pool: Mutex<Pool>,
    host_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    states: Mutex<HashMap<String, (ConnectionState, Option<String>)>>,
    local: Arc<SandboxExecutor>,
    tasks: Arc<TaskRegistry>,
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

impl ConnectionManager {
    pub fn new(config: &GatewayConfig, local: Arc<SandboxExecutor>, tasks: Arc<TaskRegistry>) -> Self {
        let client_config = russh_client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(config.ssh.keepalive_secs.max(1))),
            keepalive_max: 3,
            ..Default::default()
        };
        Self {
            hosts: config
                .hosts
                .iter()
                .map(|h| (h.id.clone(), h.clone()))
                .collect(),
            ssh: config.ssh.clone(),
            base_dir: config.base_dir.clone(),
            known_hosts: config.ssh.known_hosts.as_deref().map(|p| config.resolve_path(p)),
            remote_log_dir: config.background.remote_log_dir.clone(),
            client_config: Arc::new(client_config),
            gate: ConcurrencyGate::new(config.ssh.max_concurrent),
            pool: Mutex::new(Pool::default()),
            host_locks: Mutex::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
            local,
            tasks,
        }
    }

    pub fn gate(&self) -> &Arc<ConcurrencyGate> {
        &self.gate
    }

    fn host(&self, host_id: &str) -> Result<&HostDescriptor> {
        self.hosts
            .get(host_id)
            .ok_or_else(|| GatewayError::UnknownHost(host_id.to_string()))
    }

    fn set_state(&self, host_id: &str, state: ConnectionState, error: Option<String>) {
        self.states
            .lock()
            .insert(host_id.to_string(), (state, error));
    }

    fn host_lock(&self, host_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.host_locks
            .lock()
            .entry(host_id.to_string())
            .or_default()
            .clone()
    }

    /// A ready session for `host_id`, from the pool or freshly established.
    fn connection<'a>(&'a self, host_id: &'a str, depth: usize) -> BoxFuture<'a, Result<Arc<SshSession>>> {
        Box::pin(async move {
            if let Some(session) = self.pool.lock().get(host_id) {
                return Ok(session);
            }
            if depth > MAX_JUMP_DEPTH {
                return Err(GatewayError::Configuration(format!(
                    "jump chain for '{host_id}' is deeper than {MAX_JUMP_DEPTH}"
                )));
            }

            let lock = self.host_lock(host_id);
            let _establishing = lock.lock().await;
            if let Some(session) = self.pool.lock().get(host_id) {
                return Ok(session);
            }

            let host = self.host(host_id)?;
            if host.is_local() {
                return Err(GatewayError::InvalidRequest(format!(
                    "host '{host_id}' is local and has no ssh session"
                )));
            }
            let via = match &host.jump_host {
                Some(jump) => Some(self.connection(jump, depth + 1).await?),
                None => None,
            };

            let session = Arc::new(self.connect_with_retry(host, via).await?);
            let evicted = self.pool.lock().insert(session.clone(), self.ssh.max_pool_size);
            for old in evicted {
                if old.host_id() != host_id {
                    self.set_state(old.host_id(), ConnectionState::Closed, None);
                }
                if Arc::strong_count(&old) == 1 {
                    tokio::spawn(async move { old.disconnect().await });
                }
            }
            Ok(session)
        })
    }

    async fn connect_with_retry(
        &self,
        host: &HostDescriptor,
        via: Option<Arc<SshSession>>,
    ) -> Result<SshSession> {
        let auth = keys::resolve_auth(host, &self.base_dir).await?;
        let timeout = Duration::from_millis(host.connect_timeout_ms.unwrap_or(self.ssh.connect_timeout_ms));
        let attempts = self.ssh.max_retries + 1;
        let mut backoff = Duration::from_millis(self.ssh.retry_backoff_ms);

        for attempt in 1..=attempts {
            let permit = self.gate.acquire().await?;
            self.set_state(&host.id, ConnectionState::Connecting, None);
            let outcome = tokio::time::timeout(
                timeout,
                SshSession::open(
                    host,
                    &auth,
                    self.client_config.clone(),
                    self.known_hosts.clone(),
                    via.clone(),
                ),
            )
            .await
            .unwrap_or_else(|_| {
                Err(GatewayError::transport(
                    &host.id,
                    format!("connect timed out after {}ms", timeout.as_millis()),
                ))
            });
            drop(permit);

            match outcome {
                Ok(session) => {
                    self.set_state(&host.id, ConnectionState::Ready, None);
                    return Ok(session);
                }
                Err(err) => {
                    self.set_state(&host.id, ConnectionState::Error, Some(err.to_string()));
                    if !err.is_retryable() || attempt == attempts {
                        tracing::error!(host = %host.id, attempt, error = %err, "ssh connect failed");
                        return Err(err);
                    }
                    tracing::warn!(host = %host.id, attempt, backoff_ms = backoff.as_millis() as u64, error = %err, "ssh connect failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
        Err(GatewayError::transport(&host.id, "no connection attempts made"))
    }

    /// Run `command` on `host_id` under `options.timeout`.
    pub async fn execute(&self, host_id: &str, command: &str, options: &ExecOptions) -> Result<ExecutionResult> {
        let host = self.host(host_id)?;
        if host.is_local() {
            return self
                .local
                .run(command, options.isolation, &options.limits, options.timeout)
                .await;
        }

        let mut reconnected = false;
        loop {
            let session = self.connection(host_id, 0).await?;
            let permit = self.gate.acquire().await?;
            let outcome = session.exec(command, options.timeout).await;
            drop(permit);
            match outcome {
                Err(GatewayError::Ssh(err)) if !reconnected => {
                    tracing::warn!(host = %host_id, error = %err, "pooled session failed, reconnecting");
                    self.evict(host_id);
                    reconnected = true;
                }
                Err(err @ GatewayError::Ssh(_)) => {
                    self.evict(host_id);
                    return Err(err);
                }
                other => return other,
            }
        }
    }

    fn evict(&self, host_id: &str) {
        self.pool.lock().remove(host_id);
        self.set_state(host_id, ConnectionState::Closed, None);
    }

    /// Launch detached: locally through the executor, remotely with `nohup`.
    pub async fn spawn_background(
        &self,
        host_id: &str,
        command: &str,
        options: &ExecOptions,
    ) -> Result<BackgroundTask> {
        let host = self.host(host_id)?;
        if host.is_local() {
            return self
                .local
                .spawn_background(host_id, command, options.isolation, &options.limits)
                .await;
        }

        let mut task = BackgroundTask::new(host_id, command, String::new());
        task.log_file = format!(
            "{}/{}.log",
            self.remote_log_dir.trim_end_matches('/'),
            task.task_id
        );
        let launcher = format!(
            "nohup sh -c {} > {} 2>&1 < /dev/null & echo $!",
            shell_quote(command),
            shell_quote(&task.log_file)
        );
        let session = self.connection(host_id, 0).await?;
        let permit = self.gate.acquire().await?;
        let launched = session.exec(&launcher, Duration::from_secs(15)).await;
        drop(permit);
        let launched = launched?;

        task.pid = launched.stdout.trim().parse().ok();
        task.state = TaskState::Detached;
        self.tasks.insert(task.clone());
        tracing::info!(host = %host_id, task_id = %task.task_id, pid = ?task.pid, "remote background task started");
        Ok(task)
    }

    /// Connect (if needed) and time an echo round-trip.
    pub async fn test_connection(&self, host_id: &str) -> Result<ConnectionCheck> {
        let host = self.host(host_id)?;
        let started = Instant::now();
        let timeout = Duration::from_millis(host.connect_timeout_ms.unwrap_or(self.ssh.connect_timeout_ms));
        let options = ExecOptions {
            timeout,
            isolation: Isolation::Direct,
            limits: ResourceLimits::default(),
        };
        let result = self.execute(host_id, PROBE_COMMAND, &options).await?;
        if !result.success() {
            return Err(GatewayError::transport(
                host_id,
                format!("connection check exited with {}: {}", result.exit_code, result.stderr.trim()),
            ));
        }
        Ok(ConnectionCheck {
            host_id: host_id.to_string(),
            latency_ms: started.elapsed().as_millis() as u64,
            output: result.stdout.trim().to_string(),
        })
    }

    /// Snapshot of the gate, the pool and every remote host's connection state.
    pub fn status(&self) -> ManagerStatus {
        let pool = self.pool.lock();
        let states = self.states.lock();
        let mut connections: Vec<ConnectionStatus> = self
            .hosts
            .values()
            .filter(|h| !h.is_local())
            .map(|h| {
                let (state, last_error) = states
                    .get(&h.id)
                    .cloned()
                    .unwrap_or((ConnectionState::Idle, None));
                let entry = pool.entries.get(&h.id);
                ConnectionStatus {
                    host_id: h.id.clone(),
                    state,
                    connected_at: entry.map(|e| e.session.connected_at()),
                    last_used: entry.map(|e| e.last_used),
                    last_error,
                }
            })
            .collect();
        connections.sort_by(|a, b| a.host_id.cmp(&b.host_id));
        ManagerStatus {
            gate: self.gate.status(),
            pool_size: pool.entries.len(),
            max_pool_size: self.ssh.max_pool_size,
            connections,
        }
    }

    /// Close every pooled session and fail every queued waiter. Safe to call repeatedly.
    pub async fn disconnect_all(&self) -> usize {
        let drained = self.gate.drain();
        let sessions = self.pool.lock().drain();
        let closed = sessions.len();
        for session in sessions {
            self.set_state(session.host_id(), ConnectionState::Closed, None);
            session.disconnect().await;
        }
        if closed > 0 || drained > 0 {
            tracing::info!(closed, drained, "connection manager disconnected");
        }
        closed
    }
}
