use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::poller::PollerConfig;
use crate::provider::{AdapterConfig, MapperRule};
use crate::reconciliation::ReconciliationConfig;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    pub gateway: GatewayConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub poller: PollerSection,
    #[serde(default)]
    pub reconciliation: ReconciliationSection,
    #[serde(default)]
    pub email: EmailConfig,
    /// JSON file with users, services, providers and orders loaded at startup
    #[serde(default)]
    pub seed_file: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rotation {
    Hourly,
    Daily,
    Never,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LoggingConfig {
    pub level: String,
    /// Stdout only when unset
    #[serde(default)]
    pub dir: Option<String>,
    pub file: String,
    pub json: bool,
    pub rotation: Rotation,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
            file: "reseller.log".to_string(),
            json: false,
            rotation: Rotation::Daily,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: i64,
}

fn default_token_ttl() -> i64 {
    24 * 3600
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LedgerConfig {
    pub max_cas_retries: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_cas_retries: crate::ledger::DEFAULT_MAX_CAS_RETRIES,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProviderConfig {
    pub timeout_secs: u64,
    pub status_retries: u32,
    pub status_backoff_ms: u64,
    /// Name rules applied after the built-in ones
    #[serde(default)]
    pub rules: Vec<MapperRule>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        let defaults = AdapterConfig::default();
        Self {
            timeout_secs: defaults.timeout.as_secs(),
            status_retries: defaults.status_retries,
            status_backoff_ms: defaults.status_backoff.as_millis() as u64,
            rules: Vec::new(),
        }
    }
}

impl ProviderConfig {
    pub fn adapter_config(&self) -> AdapterConfig {
        AdapterConfig {
            timeout: Duration::from_secs(self.timeout_secs),
            status_retries: self.status_retries,
            status_backoff: Duration::from_millis(self.status_backoff_ms),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PollerSection {
    pub enabled: bool,
    pub interval_secs: u64,
    pub batch_size: usize,
}

impl Default for PollerSection {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            batch_size: 100,
        }
    }
}

impl PollerSection {
    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            poll_interval: Duration::from_secs(self.interval_secs),
            batch_size: self.batch_size,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ReconciliationSection {
    pub enabled: bool,
    pub interval_secs: u64,
    pub batch_size: usize,
    pub alert_after_attempts: u32,
}

impl Default for ReconciliationSection {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            batch_size: 100,
            alert_after_attempts: 5,
        }
    }
}

impl ReconciliationSection {
    pub fn reconciliation_config(&self) -> ReconciliationConfig {
        ReconciliationConfig {
            scan_interval: Duration::from_secs(self.interval_secs),
            batch_size: self.batch_size,
            alert_after_attempts: self.alert_after_attempts,
        }
    }
}

/// Without `webhook_url` emails are only logged
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EmailConfig {
    #[serde(default)]
    pub webhook_url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_secs: 10,
        }
    }
}

impl AppConfig {
    /// Load `config/{env}.yaml`
    pub fn load(env: &str) -> anyhow::Result<Self> {
        Self::load_from_path(format!("config/{}.yaml", env))
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let config: AppConfig = serde_yaml::from_str(content)?;
        if config.auth.jwt_secret.trim().is_empty() {
            anyhow::bail!("auth.jwt_secret must not be empty");
        }
        Ok(config)
    }
}
