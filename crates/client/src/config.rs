//! Client configuration

use crate::error::ClientError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix, e.g. `TURNSTILE_BASE_URL` or `TURNSTILE_ENDPOINTS__LOGIN`
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Top-level client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// API base URL, without a trailing slash
    pub base_url: String,

    /// Per-request timeout in seconds (0 disables the timeout)
    pub timeout_secs: u64,

    /// User agent sent with every request
    pub user_agent: String,

    /// Account endpoint paths
    pub endpoints: Endpoints,

    /// Refresh token storage
    pub storage: StorageConfig,
}

/// Paths of the account endpoints, relative to the base URL
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    pub login: String,
    pub register: String,
    pub refresh: String,
    pub me: String,
    /// Server-side logout notification; skipped when unset
    pub logout: Option<String>,
}

/// Where the refresh token is persisted
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the token file; defaults to the platform data directory
    pub dir: Option<PathBuf>,

    /// Name of the storage slot
    pub key: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            timeout_secs: 30,
            user_agent: concat!("turnstile-client/", env!("CARGO_PKG_VERSION")).to_string(),
            endpoints: Endpoints::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            login: "/user/login".to_string(),
            register: "/user/register".to_string(),
            refresh: "/user/refresh-token".to_string(),
            me: "/user/me".to_string(),
            logout: Some("/user/logout".to_string()),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: None,
            key: "refreshToken".to_string(),
        }
    }
}

impl Endpoints {
    /// Whether `path` is login, register or refresh.
    ///
    /// These never carry a bearer token and never trigger a renewal.
    pub fn is_bootstrap(&self, path: &str) -> bool {
        let path = path.split(['?', '#']).next().unwrap_or(path);
        [&self.login, &self.register, &self.refresh]
            .iter()
            .any(|endpoint| endpoint.as_str() == path)
    }
}

impl StorageConfig {
    /// Directory the token file lives in
    pub fn resolved_dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("turnstile")
        })
    }
}

impl ClientConfig {
    /// Configuration pointing at `base_url`, everything else defaulted
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Request timeout, if enabled
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }

    /// Load configuration from an optional file and `TURNSTILE_*` environment variables
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or a value has the wrong type
    pub fn load(path: Option<&Path>) -> Result<Self, ClientError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that serde cannot
    pub fn validate(&self) -> Result<(), ClientError> {
        let url = url::Url::parse(&self.base_url).map_err(|e| {
            ClientError::Configuration(format!("invalid base_url {:?}: {e}", self.base_url))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ClientError::Configuration(format!(
                "base_url must be http or https, got {}",
                url.scheme()
            )));
        }

        let endpoints = &self.endpoints;
        for path in [
            &endpoints.login,
            &endpoints.register,
            &endpoints.refresh,
            &endpoints.me,
        ]
        .into_iter()
        .chain(endpoints.logout.as_ref())
        {
            if !path.starts_with('/') {
                return Err(ClientError::Configuration(format!(
                    "endpoint path {path:?} must start with '/'"
                )));
            }
        }

        if self.storage.key.is_empty() || self.storage.key.contains(['/', '\\']) {
            return Err(ClientError::Configuration(format!(
                "invalid storage key {:?}",
                self.storage.key
            )));
        }

        Ok(())
    }
}
