//! Credential resolution: path expansion and private-key loading.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use russh_keys::key::KeyPair;

use crate::config::HostDescriptor;
use crate::error::{GatewayError, Result};

const DEFAULT_KEYS: &[&str] = &["id_ed25519", "id_ecdsa", "id_rsa"];

/// Expand `~` to the home directory and resolve relative paths against `base`.
pub fn expand_path(path: &str, base: &Path) -> PathBuf {
    let path = path.trim();
    if path == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"));
    }
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    let candidate = PathBuf::from(path);
    if candidate.is_absolute() {
        candidate
    } else {
        base.join(candidate)
    }
}

/// One way of proving identity to a server, tried in order.
#[derive(Clone)]
pub enum AuthMethod {
    PublicKey(Arc<KeyPair>),
    Password(String),
}

impl std::fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMethod::PublicKey(_) => f.write_str("PublicKey(..)"),
            AuthMethod::Password(_) => f.write_str("Password(<redacted>)"),
        }
    }
}

/// Decode a private key file, decrypting it with `passphrase` when given.
pub async fn load_key(path: &Path, passphrase: Option<&str>) -> Result<Arc<KeyPair>> {
    let pem = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| GatewayError::Key(format!("cannot read {}: {e}", path.display())))?;
    russh_keys::decode_secret_key(&pem, passphrase)
        .map(Arc::new)
        .map_err(|e| GatewayError::Key(format!("cannot decode {}: {e}", path.display())))
}

/// Build the authentication attempts for `host`. Keyboard-interactive is never offered.
pub async fn resolve_auth(host: &HostDescriptor, base: &Path) -> Result<Vec<AuthMethod>> {
    let creds = &host.credentials;
    let mut methods = Vec::new();

    match &creds.key_path {
        Some(key_path) => {
            let path = expand_path(key_path, base);
            methods.push(AuthMethod::PublicKey(
                load_key(&path, creds.passphrase.as_deref()).await?,
            ));
        }
        None if creds.password.is_none() => {
            if let Some(key) = default_key(creds.passphrase.as_deref()).await {
                methods.push(AuthMethod::PublicKey(key));
            }
        }
        None => {}
    }
    if let Some(password) = &creds.password {
        methods.push(AuthMethod::Password(password.clone()));
    }

    if methods.is_empty() {
        return Err(GatewayError::Key(format!(
            "no usable credentials for host '{}'",
            host.id
        )));
    }
    Ok(methods)
}

async fn default_key(passphrase: Option<&str>) -> Option<Arc<KeyPair>> {
    let ssh_dir = dirs::home_dir()?.join(".ssh");
    for name in DEFAULT_KEYS {
        let path = ssh_dir.join(name);
        if !path.exists() {
            continue;
        }
        match load_key(&path, passphrase).await {
            Ok(key) => return Some(key),
            Err(err) => tracing::debug!(error = %err, "skipping default key"),
        }
    }
    None
}
