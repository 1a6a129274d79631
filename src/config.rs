use crate::trust::envelope::EnvelopeConfig;
use crate::trust::session::TokenOptions;
use config::{Config, ConfigError, Environment, File};
use envtrust_types::TrustStoreRecord;
use serde::Deserialize;
use std::time::Duration;

/// Daemon listener and trust-store configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DaemonConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Budget for authenticating a single request
    #[serde(default = "default_auth_timeout_ms")]
    pub auth_timeout_ms: u64,
    /// Registered identities. The daemon never learns principals any other way.
    #[serde(default)]
    pub trust_store: Vec<TrustStoreRecord>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7433
}

fn default_auth_timeout_ms() -> u64 {
    2_000
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            auth_timeout_ms: default_auth_timeout_ms(),
            trust_store: Vec::new(),
        }
    }
}

/// Envelope freshness and layout
#[derive(Debug, Deserialize, Clone)]
pub struct EnvelopeSettings {
    /// Accepted clock skew around the envelope timestamp
    #[serde(default = "default_max_skew_secs")]
    pub max_skew_secs: u64,
    /// Also seal each variable individually
    #[serde(default)]
    pub per_variable: bool,
}

fn default_max_skew_secs() -> u64 {
    300
}

impl Default for EnvelopeSettings {
    fn default() -> Self {
        Self {
            max_skew_secs: default_max_skew_secs(),
            per_variable: false,
        }
    }
}

/// Session token issuing
#[derive(Debug, Deserialize, Clone)]
pub struct SessionSettings {
    #[serde(default = "default_lifetime_secs")]
    pub lifetime_secs: u64,
    #[serde(default)]
    pub not_before_secs: u64,
    #[serde(default = "default_issuer")]
    pub issuer: String,
    #[serde(default = "default_audience")]
    pub audience: Vec<String>,
    #[serde(default = "default_scope")]
    pub scope: String,
}

fn default_lifetime_secs() -> u64 {
    15 * 60
}

fn default_issuer() -> String {
    "envtrust".to_string()
}

fn default_audience() -> Vec<String> {
    vec!["envtrust-daemon".to_string()]
}

fn default_scope() -> String {
    "session".to_string()
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            lifetime_secs: default_lifetime_secs(),
            not_before_secs: 0,
            issuer: default_issuer(),
            audience: default_audience(),
            scope: default_scope(),
        }
    }
}

/// Secret memory handling
#[derive(Debug, Deserialize, Clone)]
pub struct MemorySettings {
    /// Pin private key buffers in RAM where the platform supports it
    #[serde(default = "default_lock")]
    pub lock: bool,
}

fn default_lock() -> bool {
    true
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            lock: default_lock(),
        }
    }
}

/// Root application configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub envelope: EnvelopeSettings,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub memory: MemorySettings,
}

impl AppConfig {
    /// Load configuration from files and environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            // Start with default config file
            .add_source(File::with_name("config/default").required(false))
            // Override with local config if present
            .add_source(File::with_name("config/local").required(false))
            // e.g., ENVTRUST_DAEMON__PORT, ENVTRUST_MEMORY__LOCK
            .add_source(
                Environment::with_prefix("ENVTRUST")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}

impl DaemonConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }
}

impl From<&EnvelopeSettings> for EnvelopeConfig {
    fn from(settings: &EnvelopeSettings) -> Self {
        EnvelopeConfig {
            max_skew: Duration::from_secs(settings.max_skew_secs),
            per_variable: settings.per_variable,
        }
    }
}

impl From<&SessionSettings> for TokenOptions {
    fn from(settings: &SessionSettings) -> Self {
        TokenOptions {
            expires_in: Duration::from_secs(settings.lifetime_secs),
            not_before: Duration::from_secs(settings.not_before_secs),
            issuer: settings.issuer.clone(),
            audience: settings.audience.clone(),
            scope: settings.scope.clone(),
            agent_id: None,
        }
    }
}
