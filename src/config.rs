use serde::{Deserialize, Serialize};
use std::env;

use crate::error::{LedgerError, LedgerResult};

pub const DEFAULT_CONFIG_FILE: &str = "config/audit-ledger";
pub const CONFIG_PATH_VAR: &str = "AUDIT_LEDGER_CONFIG";
pub const ENV_PREFIX: &str = "AUDIT_LEDGER";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub signing: SigningConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub verification: VerificationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SigningConfig {
    /// JSON keyring holding the signing keys
    #[serde(default = "default_keyring_path")]
    pub keyring_path: String,
    /// Create a keyring with a fresh key when the file does not exist
    #[serde(default = "default_true")]
    pub generate_if_missing: bool,
    /// How often the keyring file is checked for changes; 0 disables reloading
    #[serde(default = "default_reload_interval_secs")]
    pub reload_interval_secs: u64,
}

/// Append retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_max_append_attempts")]
    pub max_append_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationConfig {
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Jobs still running after this long are cancelled
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
    #[serde(default = "default_max_retained_jobs")]
    pub max_retained_jobs: usize,
}

impl AppConfig {
    /// Load from the optional TOML file, then `AUDIT_LEDGER__SECTION__KEY`
    /// environment variables.
    pub fn load() -> LedgerResult<Self> {
        let path = env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::load_from(&path)
    }

    pub fn load_from(path: &str) -> LedgerResult<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| LedgerError::ConfigError(format!("Failed to build config: {}", e)))?;

        let app_config: AppConfig = config.try_deserialize().map_err(|e| {
            LedgerError::ConfigError(format!("Failed to deserialize config: {}", e))
        })?;
        app_config.validate()?;
        Ok(app_config)
    }

    pub fn validate(&self) -> LedgerResult<()> {
        if self.database.url.trim().is_empty() {
            return Err(LedgerError::ConfigError("database.url must be set".to_string()));
        }
        if self.database.max_connections == 0 {
            return Err(LedgerError::ConfigError(
                "database.max_connections must be at least 1".to_string(),
            ));
        }
        if self.signing.keyring_path.trim().is_empty() {
            return Err(LedgerError::ConfigError(
                "signing.keyring_path must be set".to_string(),
            ));
        }
        if self.ledger.max_append_attempts == 0 {
            return Err(LedgerError::ConfigError(
                "ledger.max_append_attempts must be at least 1".to_string(),
            ));
        }
        if self.ledger.base_backoff_ms > self.ledger.max_backoff_ms {
            return Err(LedgerError::ConfigError(format!(
                "ledger.base_backoff_ms ({}) exceeds ledger.max_backoff_ms ({})",
                self.ledger.base_backoff_ms, self.ledger.max_backoff_ms
            )));
        }
        if self.verification.page_size == 0 {
            return Err(LedgerError::ConfigError(
                "verification.page_size must be at least 1".to_string(),
            ));
        }
        if self.verification.deadline_secs == 0 {
            return Err(LedgerError::ConfigError(
                "verification.deadline_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            keyring_path: default_keyring_path(),
            generate_if_missing: default_true(),
            reload_interval_secs: default_reload_interval_secs(),
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_append_attempts: default_max_append_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            deadline_secs: default_deadline_secs(),
            max_retained_jobs: default_max_retained_jobs(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_database_url() -> String {
    "sqlite://audit-ledger.db".to_string()
}

fn default_max_connections() -> u32 {
    8
}

fn default_keyring_path() -> String {
    "keys/keyring.json".to_string()
}

fn default_true() -> bool {
    true
}

fn default_reload_interval_secs() -> u64 {
    5
}

fn default_max_append_attempts() -> u32 {
    5
}

fn default_base_backoff_ms() -> u64 {
    10
}

fn default_max_backoff_ms() -> u64 {
    200
}

fn default_page_size() -> usize {
    500
}

fn default_deadline_secs() -> u64 {
    300
}

fn default_max_retained_jobs() -> usize {
    100
}
