/// Configuration for the detection engine and its ambient services.
///
/// Each subsystem owns a struct with `from_env()` and `validate()`, composed by
/// `Config::from_env()` the way the rest of this codebase expects.
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;

use crate::models::Severity;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub policy: PolicyConfig,
    pub watcher: WatcherConfig,
    pub signatures: SignatureConfig,
    pub reputation: ReputationConfig,
    pub security: SecurityConfig,
    pub logging: LoggingConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            server: ServerConfig::from_env()?,
            storage: StorageConfig::from_env()?,
            policy: PolicyConfig::from_env()?,
            watcher: WatcherConfig::from_env()?,
            signatures: SignatureConfig::from_env()?,
            reputation: ReputationConfig::from_env()?,
            security: SecurityConfig::from_env()?,
            logging: LoggingConfig::from_env()?,
        })
    }

    pub fn validate(&self) -> Result<()> {
        self.server.validate()?;
        self.storage.validate()?;
        self.policy.validate()?;
        self.watcher.validate()?;
        self.reputation.validate()?;
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            policy: PolicyConfig::default(),
            watcher: WatcherConfig::default(),
            signatures: SignatureConfig::default(),
            reputation: ReputationConfig::default(),
            security: SecurityConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_workers: usize,
    pub cors_allowed_origins: Vec<String>,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("SERVER_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("Invalid SERVER_PORT")?,
            max_workers: env::var("MAX_WORKERS")
                .unwrap_or_else(|_| "6".to_string())
                .parse()
                .context("Invalid MAX_WORKERS")?,
            cors_allowed_origins: env::var("CORS_ALLOWED_ORIGINS")
                .unwrap_or_else(|_| "*".to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .collect(),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            anyhow::bail!("MAX_WORKERS must be at least 1");
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_workers: 6,
            cors_allowed_origins: vec!["*".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub db_path: String,
    pub quarantine_dir: String,
    pub uploads_dir: String,
    pub anomaly_model_path: String,
}

impl StorageConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            db_path: env::var("STORAGE_DB_PATH").unwrap_or_else(|_| "./data/sentryd.db".to_string()),
            quarantine_dir: env::var("QUARANTINE_DIR").unwrap_or_else(|_| "./data/quarantine".to_string()),
            uploads_dir: env::var("UPLOADS_DIR").unwrap_or_else(|_| "./data/uploads".to_string()),
            anomaly_model_path: env::var("ANOMALY_MODEL_PATH")
                .unwrap_or_else(|_| "./data/models/anomaly_iforest.json".to_string()),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.db_path.is_empty() {
            anyhow::bail!("STORAGE_DB_PATH must not be empty");
        }
        Ok(())
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: "./data/sentryd.db".to_string(),
            quarantine_dir: "./data/quarantine".to_string(),
            uploads_dir: "./data/uploads".to_string(),
            anomaly_model_path: "./data/models/anomaly_iforest.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    Simulate,
    Rename,
    Quarantine,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub mode: PolicyMode,
    pub min_severity: Severity,
}

impl PolicyConfig {
    pub fn from_env() -> Result<Self> {
        let mode = match env::var("POLICY_MODE").unwrap_or_else(|_| "simulate".to_string()).to_lowercase().as_str() {
            "rename" => PolicyMode::Rename,
            "quarantine" => PolicyMode::Quarantine,
            _ => PolicyMode::Simulate,
        };
        let min_severity = env::var("POLICY_MIN_SEVERITY")
            .unwrap_or_else(|_| "high".to_string())
            .parse::<Severity>()
            .map_err(anyhow::Error::msg)
            .context("Invalid POLICY_MIN_SEVERITY")?;
        Ok(Self { mode, min_severity })
    }

    pub fn validate(&self) -> Result<()> {
        Ok(())
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            mode: PolicyMode::Simulate,
            min_severity: Severity::High,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    pub dirs: Vec<String>,
    pub debounce_ms: u64,
    pub recursive: bool,
    pub queue_capacity: usize,
}

impl WatcherConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            dirs: env::var("WATCH_DIRS")
                .unwrap_or_default()
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            debounce_ms: env::var("WATCH_DEBOUNCE_MS")
                .unwrap_or_else(|_| "250".to_string())
                .parse()
                .context("Invalid WATCH_DEBOUNCE_MS")?,
            recursive: env::var("WATCH_RECURSIVE")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .context("Invalid WATCH_RECURSIVE")?,
            queue_capacity: env::var("JOB_QUEUE_CAPACITY")
                .unwrap_or_else(|_| "4096".to_string())
                .parse()
                .context("Invalid JOB_QUEUE_CAPACITY")?,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            anyhow::bail!("JOB_QUEUE_CAPACITY must be at least 1");
        }
        Ok(())
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            dirs: Vec::new(),
            debounce_ms: 250,
            recursive: true,
            queue_capacity: 4096,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureConfig {
    pub signatures_dir: String,
}

impl SignatureConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            signatures_dir: env::var("SIGNATURES_DIR").unwrap_or_else(|_| "./data/signatures".to_string()),
        })
    }
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            signatures_dir: "./data/signatures".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReputationConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub max_requests_per_minute: u32,
    pub poll_interval_secs: u64,
    pub analysis_timeout_secs: u64,
    pub max_retries: u32,
}

impl ReputationConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            api_key: env::var("REP_API_KEY").ok(),
            base_url: env::var("REP_BASE_URL")
                .unwrap_or_else(|_| "https://www.virustotal.com/api/v3".to_string()),
            max_requests_per_minute: env::var("REP_MAX_REQUESTS_PER_MINUTE")
                .unwrap_or_else(|_| "4".to_string())
                .parse()
                .context("Invalid REP_MAX_REQUESTS_PER_MINUTE")?,
            poll_interval_secs: env::var("REP_POLL_INTERVAL_S")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .context("Invalid REP_POLL_INTERVAL_S")?,
            analysis_timeout_secs: env::var("REP_ANALYSIS_TIMEOUT_S")
                .unwrap_or_else(|_| "300".to_string())
                .parse()
                .context("Invalid REP_ANALYSIS_TIMEOUT_S")?,
            max_retries: 6,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_requests_per_minute == 0 {
            anyhow::bail!("REP_MAX_REQUESTS_PER_MINUTE must be at least 1");
        }
        Ok(())
    }
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://www.virustotal.com/api/v3".to_string(),
            max_requests_per_minute: 4,
            poll_interval_secs: 5,
            analysis_timeout_secs: 300,
            max_retries: 6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub agent_token: Option<String>,
}

impl SecurityConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            agent_token: env::var("AGENT_TOKEN").ok(),
        })
    }

    pub fn validate(&self) -> Result<()> {
        Ok(())
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self { agent_token: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl LoggingConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            json: env::var("LOG_JSON")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        })
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn severity_threshold_parses() {
        assert_eq!("high".parse::<Severity>().unwrap(), Severity::High);
        assert!("bogus".parse::<Severity>().is_err());
    }
}
