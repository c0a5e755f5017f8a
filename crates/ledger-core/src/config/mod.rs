//! Runtime configuration for ledger clients.
//!
//! `LedgerConfig` is read from an optional JSON file and then overridden by
//! `LEDGER_*` environment variables. Only the public API key and a user token
//! live here; both are redacted from `Debug` output.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::db::{LocalStore, RuntimeContext, StoreLocation};
use crate::error::{Error, Result};
use crate::remote::{HttpRemoteClient, OfflineRemote, RemoteClient};
use crate::sync::DEFAULT_PULL_LIMIT;
use crate::util::{is_http_url, normalize_text_option};

const ENV_REMOTE_URL: &str = "LEDGER_REMOTE_URL";
const ENV_API_KEY: &str = "LEDGER_API_KEY";
const ENV_ACCESS_TOKEN: &str = "LEDGER_ACCESS_TOKEN";
const ENV_DB_PATH: &str = "LEDGER_DB_PATH";
const ENV_USER_ID: &str = "LEDGER_USER_ID";
const ENV_PULL_BATCH_SIZE: &str = "LEDGER_PULL_BATCH_SIZE";
const ENV_SYNC_INTERVAL_SECS: &str = "LEDGER_SYNC_INTERVAL_SECS";

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct LedgerConfig {
    /// Base URL of the authoritative backend; `None` keeps every write queued
    pub remote_url: Option<String>,
    pub api_key: Option<String>,
    pub access_token: Option<String>,
    /// Local database file; `None` uses an in-memory store
    pub db_path: Option<PathBuf>,
    pub user_id: Option<String>,
    pub pull_batch_size: u32,
    /// Background sync period; `None` disables the periodic sweep
    pub sync_interval_secs: Option<u64>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            remote_url: None,
            api_key: None,
            access_token: None,
            db_path: None,
            user_id: None,
            pull_batch_size: DEFAULT_PULL_LIMIT,
            sync_interval_secs: None,
        }
    }
}

impl std::fmt::Debug for LedgerConfig {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("LedgerConfig")
            .field("remote_url", &self.remote_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("db_path", &self.db_path)
            .field("user_id", &self.user_id)
            .field("pull_batch_size", &self.pull_batch_size)
            .field("sync_interval_secs", &self.sync_interval_secs)
            .finish()
    }
}

impl LedgerConfig {
    /// Read a JSON config file, then apply environment overrides
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.apply_env(|name| std::env::var(name).ok())
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> Result<Self> {
        Self::default().apply_env(|name| std::env::var(name).ok())
    }

    /// Override fields from `lookup` (normally the process environment),
    /// then normalize and validate
    pub fn apply_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let text = |name: &str| normalize_text_option(lookup(name));

        if let Some(url) = text(ENV_REMOTE_URL) {
            self.remote_url = Some(url);
        }
        if let Some(key) = text(ENV_API_KEY) {
            self.api_key = Some(key);
        }
        if let Some(token) = text(ENV_ACCESS_TOKEN) {
            self.access_token = Some(token);
        }
        if let Some(path) = text(ENV_DB_PATH) {
            self.db_path = Some(PathBuf::from(path));
        }
        if let Some(user) = text(ENV_USER_ID) {
            self.user_id = Some(user);
        }
        if let Some(raw) = text(ENV_PULL_BATCH_SIZE) {
            self.pull_batch_size = parse_number(&raw, ENV_PULL_BATCH_SIZE)?;
        }
        if let Some(raw) = text(ENV_SYNC_INTERVAL_SECS) {
            self.sync_interval_secs = Some(parse_number(&raw, ENV_SYNC_INTERVAL_SECS)?);
        }

        self.normalize();
        self.validate()?;
        Ok(self)
    }

    fn normalize(&mut self) {
        self.remote_url = normalize_text_option(self.remote_url.take())
            .map(|url| url.trim_end_matches('/').to_string());
        self.api_key = normalize_text_option(self.api_key.take());
        self.access_token = normalize_text_option(self.access_token.take());
        self.user_id = normalize_text_option(self.user_id.take());
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(url) = &self.remote_url {
            if !is_http_url(url) {
                return Err(Error::InvalidInput(
                    "remote_url must include http:// or https://".to_string(),
                ));
            }
            if self.api_key.is_none() {
                return Err(Error::InvalidInput(
                    "api_key is required when remote_url is set".to_string(),
                ));
            }
        }
        if self.pull_batch_size == 0 {
            return Err(Error::InvalidInput(
                "pull_batch_size must be at least 1".to_string(),
            ));
        }
        if self.sync_interval_secs == Some(0) {
            return Err(Error::InvalidInput(
                "sync_interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// HTTP remote when a URL is configured, otherwise an offline stand-in
    pub fn remote_client(&self) -> Result<Arc<dyn RemoteClient>> {
        match (&self.remote_url, &self.api_key) {
            (Some(url), Some(key)) => Ok(Arc::new(
                HttpRemoteClient::new(url.as_str(), key.as_str())?
                    .with_access_token(self.access_token.clone()),
            )),
            (Some(_), None) => Err(Error::InvalidInput(
                "api_key is required when remote_url is set".to_string(),
            )),
            (None, _) => {
                tracing::debug!("No remote configured, writes stay queued locally");
                Ok(Arc::new(OfflineRemote))
            }
        }
    }

    pub fn local_store(&self) -> LocalStore {
        let location = self
            .db_path
            .clone()
            .map_or(StoreLocation::Memory, StoreLocation::File);
        LocalStore::new(location, RuntimeContext::detect())
    }

    pub fn sync_interval(&self) -> Option<Duration> {
        self.sync_interval_secs.map(Duration::from_secs)
    }
}

fn parse_number<T: std::str::FromStr>(raw: &str, name: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| Error::InvalidInput(format!("{name} must be a positive number, got '{raw}'")))
}
