//! Secret lookup for API tokens and storage credentials.
//!
//! Two providers, selected by `[secrets] provider`:
//!
//! - `env`: process environment variables
//! - `file`: one file per secret under `[secrets] dir`, contents trimmed
//!   (the layout of Docker/Kubernetes mounted secrets)

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::SecretsConfig;
use crate::error::{KbError, Result};
use crate::traits::SecretStore;

pub struct EnvSecretStore;

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn get_secret(&self, name: &str) -> Result<String> {
        match std::env::var(name) {
            Ok(v) if !v.trim().is_empty() => Ok(v),
            _ => Err(KbError::NotFound(format!(
                "secret '{}' (environment variable not set)",
                name
            ))),
        }
    }
}

pub struct FileSecretStore {
    dir: PathBuf,
}

impl FileSecretStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn get_secret(&self, name: &str) -> Result<String> {
        if name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(KbError::config(format!("invalid secret name '{}'", name)));
        }
        let path = self.dir.join(name);
        match tokio::fs::read_to_string(&path).await {
            Ok(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
            Ok(_) => Err(KbError::NotFound(format!("secret '{}' is empty", name))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(KbError::NotFound(
                format!("secret '{}' ({} missing)", name, path.display()),
            )),
            Err(e) => Err(KbError::TransientIo(format!(
                "reading secret '{}': {}",
                name, e
            ))),
        }
    }
}

pub fn create_secret_store(config: &SecretsConfig) -> Result<Arc<dyn SecretStore>> {
    match config.provider.as_str() {
        "env" => Ok(Arc::new(EnvSecretStore)),
        "file" => {
            let dir = config
                .dir
                .clone()
                .ok_or_else(|| KbError::config("secrets.dir is required for provider 'file'"))?;
            Ok(Arc::new(FileSecretStore::new(dir)))
        }
        other => Err(KbError::config(format!(
            "unknown secrets provider '{}'",
            other
        ))),
    }
}
