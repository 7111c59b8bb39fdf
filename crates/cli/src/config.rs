//! CLI configuration utilities

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use turnstile_client::ClientConfig;

/// Data directory: `--data-dir`, then `TURNSTILE_STATE_DIR`, then the platform data directory
pub fn resolve_data_dir(data_dir: Option<PathBuf>) -> PathBuf {
    data_dir.unwrap_or_else(|| {
        if let Ok(state_dir) = std::env::var("TURNSTILE_STATE_DIR") {
            PathBuf::from(state_dir)
        } else {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("turnstile")
        }
    })
}

/// Default location of the configuration file
pub fn default_config_path(data_dir: &Path) -> PathBuf {
    data_dir.join("config.json")
}

/// Load client configuration from `path` (or the default file, if present) and
/// the environment, then apply command line overrides.
pub fn load_client_config(
    path: Option<&Path>,
    data_dir: &Path,
    base_url: Option<String>,
) -> Result<ClientConfig> {
    let default_path = default_config_path(data_dir);
    let path = path.or_else(|| default_path.exists().then_some(default_path.as_path()));

    let mut config = ClientConfig::load(path).with_context(|| match path {
        Some(path) => format!("Failed to load configuration from {}", path.display()),
        None => "Failed to load configuration from the environment".to_string(),
    })?;

    if let Some(base_url) = base_url {
        config.base_url = base_url;
    }
    if config.storage.dir.is_none() {
        config.storage.dir = Some(data_dir.to_path_buf());
    }

    config.validate()?;
    Ok(config)
}

/// Save client configuration to a JSON file
pub fn save_client_config<P: AsRef<Path>>(config: &ClientConfig, path: P) -> Result<()> {
    let content = serde_json::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Generate a default configuration file
pub fn generate_default_config<P: AsRef<Path>>(path: P) -> Result<()> {
    save_client_config(&ClientConfig::default(), path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = default_config_path(dir.path());
        generate_default_config(&path).unwrap();

        let config = load_client_config(None, dir.path(), Some("https://api.example.com".into())).unwrap();
        assert_eq!(config.base_url, "https://api.example.com");
        assert_eq!(config.endpoints.refresh, "/user/refresh-token");
        assert_eq!(config.storage.dir.as_deref(), Some(dir.path()));
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_client_config(None, dir.path(), Some("nowhere".into())).is_err());
    }
}
