//! Process configuration.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (CHRISEON_HOME, CHRISEON_DATABASE, provider keys, ...)
//! 2. Config file (.chriseon/config.yaml)
//! 3. Defaults (~/.chriseon)
//!
//! Config file discovery:
//! - Searches current directory and parents for .chriseon/config.yaml
//! - Relative paths in the config file are relative to the .chriseon/ directory
//!
//! [`Settings`] is built once at startup and passed by reference. Invalid
//! settings are fatal.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::core::executor::{ExecutionMode, DEFAULT_PROVIDER_TIMEOUT};
use crate::secrets::SecretStore;

pub const ENV_HOME: &str = "CHRISEON_HOME";
pub const ENV_DATABASE: &str = "CHRISEON_DATABASE";
pub const ENV_MASTER_KEY: &str = "KEY_ENCRYPTION_MASTER_KEY_B64";
pub const ENV_DISABLE_SUBPROCESS: &str = "CHRISEON_DISABLE_PROVIDER_SUBPROCESS";
pub const ENV_PROVIDER_TIMEOUT: &str = "CHRISEON_PROVIDER_TIMEOUT_SECS";
pub const ENV_WORKER_CONCURRENCY: &str = "CHRISEON_WORKER_CONCURRENCY";

/// Provider → environment variable holding its managed key
pub const MANAGED_KEY_VARS: [(&str, &str); 5] = [
    ("openai", "OPENAI_API_KEY"),
    ("anthropic", "ANTHROPIC_API_KEY"),
    ("gemini", "GEMINI_API_KEY"),
    ("xai", "XAI_API_KEY"),
    ("deepseek", "DEEPSEEK_API_KEY"),
];

pub const DEFAULT_JUDGE_MODEL: &str = "grok-3-mini";
pub const DEFAULT_WORKER_CONCURRENCY: usize = 2;

const CONFIG_DIR: &str = ".chriseon";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not determine a home directory; set CHRISEON_HOME")]
    NoHome,

    #[error("KEY_ENCRYPTION_MASTER_KEY_B64 is not set")]
    MissingMasterKey,

    #[error("KEY_ENCRYPTION_MASTER_KEY_B64 is invalid: {0}")]
    InvalidMasterKey(String),

    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },

    #[error("failed to load config file {path}: {message}")]
    File { path: PathBuf, message: String },
}

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .chriseon/)
    pub home: Option<String>,
    /// SQLite database file (relative to .chriseon/)
    pub database: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProvidersConfig {
    pub timeout_seconds: Option<u64>,
    /// "isolated" or "inline"
    pub isolation: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkerConfig {
    pub concurrency: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScoringConfig {
    pub judge_model: Option<String>,
}

/// Platform-configured provider keys
#[derive(Clone, Default)]
pub struct ManagedKeys {
    keys: HashMap<String, String>,
}

impl ManagedKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_env<F>(env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut keys = Self::new();
        for (provider, var) in MANAGED_KEY_VARS {
            if let Some(value) = env(var) {
                keys = keys.with(provider, value);
            }
        }
        keys
    }

    /// Set a key; blank values are ignored
    pub fn with(mut self, provider: &str, key: impl Into<String>) -> Self {
        let key = key.into().trim().to_string();
        if !key.is_empty() {
            self.keys.insert(provider.to_ascii_lowercase(), key);
        }
        self
    }

    pub fn get(&self, provider: &str) -> Option<&str> {
        self.keys
            .get(&provider.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn providers(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.keys.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for ManagedKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedKeys")
            .field("providers", &self.providers())
            .finish()
    }
}

/// Resolved settings with absolute paths
#[derive(Debug, Clone)]
pub struct Settings {
    /// Engine state directory (event logs, job queue)
    pub home: PathBuf,
    pub database: PathBuf,

    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,

    pub execution_mode: ExecutionMode,
    pub provider_timeout: Duration,
    pub worker_concurrency: usize,
    pub judge_model: String,
    pub managed_keys: ManagedKeys,

    /// None when no master key is configured
    secrets: Option<Arc<SecretStore>>,
}

impl Settings {
    /// Load from the process environment, discovered config file and defaults
    pub fn load() -> Result<Self, ConfigError> {
        let default_home = dirs::home_dir().ok_or(ConfigError::NoHome)?.join(CONFIG_DIR);
        let config_file = std::env::current_dir()
            .ok()
            .and_then(|dir| find_config_file(&dir));

        Self::load_from(|key| std::env::var(key).ok(), config_file, default_home)
    }

    /// Load with an explicit environment and config file
    pub fn load_from<F>(
        env: F,
        config_file: Option<PathBuf>,
        default_home: PathBuf,
    ) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        let (file, config_dir) = match &config_file {
            Some(path) => (
                load_config_file(path)?,
                path.parent().map(Path::to_path_buf),
            ),
            None => (ConfigFile::default(), None),
        };
        let relative = |raw: &str| match &config_dir {
            Some(dir) => resolve_path(dir, raw),
            None => PathBuf::from(raw),
        };

        let home = env(ENV_HOME)
            .map(PathBuf::from)
            .or_else(|| file.paths.home.as_deref().map(relative))
            .unwrap_or(default_home);

        let database = env(ENV_DATABASE)
            .map(PathBuf::from)
            .or_else(|| file.paths.database.as_deref().map(relative))
            .unwrap_or_else(|| home.join("chriseon.db"));

        let execution_mode = match env(ENV_DISABLE_SUBPROCESS) {
            Some(flag) => {
                if parse_flag(ENV_DISABLE_SUBPROCESS, &flag)? {
                    ExecutionMode::Inline
                } else {
                    ExecutionMode::Isolated
                }
            }
            None => match file.providers.isolation.as_deref() {
                Some(raw) => ExecutionMode::parse(raw).ok_or_else(|| ConfigError::InvalidValue {
                    key: "providers.isolation".to_string(),
                    value: raw.to_string(),
                })?,
                None => ExecutionMode::default(),
            },
        };

        let timeout_secs = match env(ENV_PROVIDER_TIMEOUT) {
            Some(raw) => parse_positive(ENV_PROVIDER_TIMEOUT, &raw)? as u64,
            None => file
                .providers
                .timeout_seconds
                .unwrap_or(DEFAULT_PROVIDER_TIMEOUT.as_secs()),
        };
        if timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "providers.timeout_seconds".to_string(),
                value: "0".to_string(),
            });
        }

        let worker_concurrency = match env(ENV_WORKER_CONCURRENCY) {
            Some(raw) => parse_positive(ENV_WORKER_CONCURRENCY, &raw)?,
            None => file.worker.concurrency.unwrap_or(DEFAULT_WORKER_CONCURRENCY),
        }
        .max(1);

        let secrets = match env(ENV_MASTER_KEY) {
            Some(raw) => Some(Arc::new(
                SecretStore::from_master_key_b64(&raw)
                    .map_err(|e| ConfigError::InvalidMasterKey(e.to_string()))?,
            )),
            None => None,
        };

        Ok(Self {
            home,
            database,
            config_file,
            execution_mode,
            provider_timeout: Duration::from_secs(timeout_secs),
            worker_concurrency,
            judge_model: file
                .scoring
                .judge_model
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_JUDGE_MODEL.to_string()),
            managed_keys: ManagedKeys::from_env(env),
            secrets,
        })
    }

    /// Per-run event logs
    pub fn runs_dir(&self) -> PathBuf {
        self.home.join("runs")
    }

    pub fn queue_path(&self) -> PathBuf {
        self.home.join("jobs.jsonl")
    }

    /// The process-wide secret store. Required by anything touching BYOK keys.
    pub fn secret_store(&self) -> Result<Arc<SecretStore>, ConfigError> {
        self.secrets.clone().ok_or(ConfigError::MissingMasterKey)
    }

    pub fn with_secret_store(mut self, store: SecretStore) -> Self {
        self.secrets = Some(Arc::new(store));
        self
    }
}

/// Find config file by searching `start` and its parents
pub fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_DIR).join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            return None;
        }
    }
}

fn load_config_file(path: &Path) -> Result<ConfigFile, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::File {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    serde_yaml::from_str(&content).map_err(|e| ConfigError::File {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

fn resolve_path(base: &Path, raw: &str) -> PathBuf {
    let path = PathBuf::from(raw);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

fn parse_flag(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.to_string(),
        }),
    }
}

fn parse_positive(key: &str, raw: &str) -> Result<usize, ConfigError> {
    raw.trim()
        .parse::<usize>()
        .ok()
        .filter(|n| *n > 0)
        .ok_or_else(|| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use tempfile::TempDir;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let settings =
            Settings::load_from(env_of(&[]), None, PathBuf::from("/tmp/chriseon-home")).unwrap();

        assert_eq!(settings.home, PathBuf::from("/tmp/chriseon-home"));
        assert_eq!(settings.database, PathBuf::from("/tmp/chriseon-home/chriseon.db"));
        assert_eq!(settings.queue_path(), PathBuf::from("/tmp/chriseon-home/jobs.jsonl"));
        assert_eq!(settings.execution_mode, ExecutionMode::Isolated);
        assert_eq!(settings.provider_timeout, Duration::from_secs(45));
        assert_eq!(settings.worker_concurrency, 2);
        assert_eq!(settings.judge_model, "grok-3-mini");
        assert!(matches!(
            settings.secret_store(),
            Err(ConfigError::MissingMasterKey)
        ));
    }

    #[test]
    fn test_env_overrides() {
        let key = STANDARD.encode([5u8; 32]);
        let settings = Settings::load_from(
            env_of(&[
                (ENV_HOME, "/srv/chriseon"),
                (ENV_DISABLE_SUBPROCESS, "1"),
                (ENV_PROVIDER_TIMEOUT, "5"),
                (ENV_MASTER_KEY, &key),
                ("OPENAI_API_KEY", "sk-managed"),
                ("XAI_API_KEY", "  "),
            ]),
            None,
            PathBuf::from("/unused"),
        )
        .unwrap();

        assert_eq!(settings.runs_dir(), PathBuf::from("/srv/chriseon/runs"));
        assert_eq!(settings.execution_mode, ExecutionMode::Inline);
        assert_eq!(settings.provider_timeout, Duration::from_secs(5));
        assert_eq!(settings.managed_keys.get("openai"), Some("sk-managed"));
        assert_eq!(settings.managed_keys.get("xai"), None);
        assert!(settings.secret_store().is_ok());
        assert!(!format!("{:?}", settings).contains("sk-managed"));
    }

    #[test]
    fn test_malformed_master_key_is_fatal() {
        let short = STANDARD.encode([5u8; 16]);
        let result = Settings::load_from(
            env_of(&[(ENV_MASTER_KEY, &short)]),
            None,
            PathBuf::from("/tmp/x"),
        );
        assert!(matches!(result, Err(ConfigError::InvalidMasterKey(_))));
    }

    #[test]
    fn test_invalid_numbers_are_fatal() {
        for (key, value) in [
            (ENV_PROVIDER_TIMEOUT, "soon"),
            (ENV_WORKER_CONCURRENCY, "0"),
            (ENV_DISABLE_SUBPROCESS, "maybe"),
        ] {
            let result = Settings::load_from(env_of(&[(key, value)]), None, PathBuf::from("/tmp/x"));
            assert!(
                matches!(result, Err(ConfigError::InvalidValue { .. })),
                "{} = {} should be rejected",
                key,
                value
            );
        }
    }

    #[test]
    fn test_config_file_discovery_and_relative_paths() {
        let temp = TempDir::new().unwrap();
        let config_dir = temp.path().join(".chriseon");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(
            config_dir.join("config.yaml"),
            "version: \"1\"\npaths:\n  home: state\nproviders:\n  timeout_seconds: 30\n  isolation: inline\nworker:\n  concurrency: 4\nscoring:\n  judge_model: grok-3-fast\n",
        )
        .unwrap();

        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        let found = find_config_file(&nested).unwrap();
        assert_eq!(found, config_dir.join("config.yaml"));

        let settings =
            Settings::load_from(env_of(&[]), Some(found), PathBuf::from("/unused")).unwrap();
        assert_eq!(settings.home, config_dir.join("state"));
        assert_eq!(settings.provider_timeout, Duration::from_secs(30));
        assert_eq!(settings.execution_mode, ExecutionMode::Inline);
        assert_eq!(settings.worker_concurrency, 4);
        assert_eq!(settings.judge_model, "grok-3-fast");
    }
}
