//! Runtime configuration and its on-disk location.
//!
//! `navrt.json` holds a [`RuntimeConfig`]; missing fields take defaults and a
//! missing file means all defaults.

use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "navrt.json";
pub const LOG_FILE: &str = "navrt.log";
pub const CONFIG_DIR_ENV: &str = "NAVRT_CONFIG_DIR";

/// Tunables of the runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Cache-busting token appended to asset and API URLs
    pub app_version: String,
    pub default_route: String,
    pub not_found_route: String,
    pub login_route: String,
    /// Root prepended to the endpoint table
    pub api_path: String,
    pub cache_limit_kb: f64,
    pub cache_ttl_ms: u64,
    pub request_timeout_ms: u64,
    /// View ids disposed on every navigation instead of kept warm
    pub do_not_cache: Vec<String>,
    /// Lifetime of the stored user record
    pub user_ttl_minutes: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            default_route: "home".to_string(),
            not_found_route: "pagenotfound".to_string(),
            login_route: "login".to_string(),
            api_path: "/api".to_string(),
            cache_limit_kb: 2000.0,
            cache_ttl_ms: 3_600_000,
            request_timeout_ms: 5000,
            do_not_cache: Vec::new(),
            user_ttl_minutes: 60,
        }
    }
}

impl RuntimeConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Read `path`; a missing file yields defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Load `navrt.json` from the resolved config directory
    pub fn load(paths: &PathConfig) -> Result<Self> {
        Self::load_from(&config_file(CONFIG_FILE, paths))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, text).with_context(|| format!("Failed to write config: {}", path.display()))
    }
}

/// Configuration for overriding default application paths
#[derive(Debug, Clone, Default)]
pub struct PathConfig {
    /// Custom config directory (from CLI or ENV)
    pub config_dir: Option<PathBuf>,
}

impl PathConfig {
    /// Priority: CLI arg → ENV var (NAVRT_CONFIG_DIR) → None (use defaults)
    pub fn from_env_and_cli(cli_dir: Option<PathBuf>) -> Self {
        let config_dir = cli_dir.or_else(|| std::env::var(CONFIG_DIR_ENV).ok().map(PathBuf::from));
        Self { config_dir }
    }
}

/// Get path to a configuration file
///
/// Priority:
/// 1. CLI --config-dir argument
/// 2. NAVRT_CONFIG_DIR environment variable
/// 3. Local folder IF navrt.json or navrt.log exists there
/// 4. Platform-specific config directory from dirs-next
pub fn config_file(name: &str, config: &PathConfig) -> PathBuf {
    get_config_dir(config).join(name)
}

/// Same resolution as [`config_file`] but for data (logs)
pub fn data_file(name: &str, config: &PathConfig) -> PathBuf {
    get_data_dir(config).join(name)
}

/// Create the config and data directories if missing
pub fn ensure_dirs(config: &PathConfig) -> Result<()> {
    let config_dir = get_config_dir(config);
    let data_dir = get_data_dir(config);

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)
            .with_context(|| format!("Failed to create config directory: {}", config_dir.display()))?;
    }
    if data_dir != config_dir && !data_dir.exists() {
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;
    }
    Ok(())
}

fn has_local_files(dir: &Path) -> bool {
    [CONFIG_FILE, LOG_FILE].iter().any(|f| dir.join(f).exists())
}

fn resolve_dir(config: &PathConfig, platform: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = &config.config_dir {
        return dir.clone();
    }
    if let Ok(current_dir) = std::env::current_dir() {
        if has_local_files(&current_dir) {
            return current_dir;
        }
    }
    match platform {
        Some(dir) => dir.join("navrt"),
        None => PathBuf::from("."),
    }
}

fn get_config_dir(config: &PathConfig) -> PathBuf {
    resolve_dir(config, dirs_next::config_dir())
}

fn get_data_dir(config: &PathConfig) -> PathBuf {
    resolve_dir(config, dirs_next::data_dir())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("navrt_test_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_config_file_with_custom_dir() {
        let config = PathConfig {
            config_dir: Some(PathBuf::from("/custom")),
        };
        assert_eq!(config_file("test.json", &config), PathBuf::from("/custom/test.json"));
        assert_eq!(data_file("navrt.log", &config), PathBuf::from("/custom/navrt.log"));
    }

    #[test]
    fn test_cli_dir_wins() {
        let config = PathConfig::from_env_and_cli(Some(PathBuf::from("/from/cli")));
        assert_eq!(config.config_dir, Some(PathBuf::from("/from/cli")));
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = temp_dir();
        let config = RuntimeConfig::load_from(&dir.join(CONFIG_FILE)).unwrap();
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.cache_ttl(), Duration::from_secs(3600));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = temp_dir();
        let path = dir.join(CONFIG_FILE);
        std::fs::write(&path, r#"{"app_version": "9.9", "do_not_cache": ["login"]}"#).unwrap();

        let paths = PathConfig {
            config_dir: Some(dir.clone()),
        };
        let config = RuntimeConfig::load(&paths).unwrap();
        assert_eq!(config.app_version, "9.9");
        assert_eq!(config.do_not_cache, vec!["login"]);
        assert_eq!(config.request_timeout_ms, 5000);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = temp_dir();
        let path = dir.join(CONFIG_FILE);
        let config = RuntimeConfig {
            cache_limit_kb: 10.0,
            ..Default::default()
        };
        config.save_to(&path).unwrap();
        assert_eq!(RuntimeConfig::load_from(&path).unwrap(), config);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_bad_json_is_an_error() {
        let dir = temp_dir();
        let path = dir.join(CONFIG_FILE);
        std::fs::write(&path, "{not json").unwrap();
        let err = RuntimeConfig::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
