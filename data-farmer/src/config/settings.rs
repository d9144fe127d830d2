//! Application settings and configuration

use config::{Config, ConfigError, Environment, File};
use market_common::data::BarValidatorConfig;
use market_common::error::ConfigurationError;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::rate_limit::{RateCategory, RateLimitSettings};
use crate::upstream::{ConnectParams, ContractDefaults};

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Database configuration
    pub database: DatabaseSettings,
    /// Upstream session target and retry policy
    #[serde(default)]
    pub upstream: UpstreamSettings,
    /// Health monitoring
    #[serde(default)]
    pub session: SessionSettings,
    /// Per-category pacing and violation backoff
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    /// Historical backfill behaviour
    #[serde(default)]
    pub backfill: BackfillSettings,
}

/// Database connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

/// Upstream session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: i32,
    /// How long connect() waits for the session-ready signal
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Connect attempts ensure_connected() may spend before giving up
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the second attempt; doubles per attempt
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    #[serde(default)]
    pub contract: ContractDefaults,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7497
}

fn default_client_id() -> i32 {
    1
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_reconnect_base_delay_ms() -> u64 {
    1000
}

fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            client_id: default_client_id(),
            connect_timeout_secs: default_connect_timeout_secs(),
            max_retries: default_max_retries(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            contract: ContractDefaults::default(),
        }
    }
}

impl UpstreamSettings {
    pub fn connect_params(&self) -> ConnectParams {
        ConnectParams {
            host: self.host.clone(),
            port: self.port,
            client_id: self.client_id,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Pause before reconnect attempt `attempt` (1-based); zero for the first
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 1u64 << (attempt - 2).min(20);
        Duration::from_millis(
            self.reconnect_base_delay_ms
                .saturating_mul(factor)
                .min(self.reconnect_max_delay_ms),
        )
    }
}

/// Session health monitoring settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    /// Silence after which a connected session is marked unhealthy
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
    /// Silence on the data path after which a warning is logged
    #[serde(default = "default_data_staleness_secs")]
    pub data_staleness_secs: u64,
    #[serde(default = "default_command_buffer")]
    pub command_buffer: usize,
}

fn default_health_check_interval_secs() -> u64 {
    30
}

fn default_heartbeat_timeout_secs() -> u64 {
    300
}

fn default_data_staleness_secs() -> u64 {
    600
}

fn default_command_buffer() -> usize {
    256
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            health_check_interval_secs: default_health_check_interval_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            data_staleness_secs: default_data_staleness_secs(),
            command_buffer: default_command_buffer(),
        }
    }
}

/// Historical backfill settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillSettings {
    /// Largest span, in calendar days, one request may cover
    #[serde(default = "default_max_chunk_days")]
    pub max_chunk_days: u32,
    /// Pause between symbols in a bulk backfill
    #[serde(default = "default_inter_symbol_delay_ms")]
    pub inter_symbol_delay_ms: u64,
    #[serde(default = "default_historical_timeout_secs")]
    pub historical_timeout_secs: u64,
    /// Extra attempts for a chunk that failed transiently (timeout, lost connection)
    #[serde(default = "default_chunk_retries")]
    pub chunk_retries: u32,
    #[serde(default = "default_bar_size")]
    pub bar_size: String,
    #[serde(default = "default_what_to_show")]
    pub what_to_show: String,
    /// Regular trading hours only
    #[serde(default = "default_true")]
    pub use_rth: bool,
    #[serde(default = "default_min_price")]
    pub min_price: Decimal,
    #[serde(default = "default_max_price")]
    pub max_price: Decimal,
}

fn default_max_chunk_days() -> u32 {
    365
}

fn default_inter_symbol_delay_ms() -> u64 {
    1000
}

fn default_historical_timeout_secs() -> u64 {
    30
}

fn default_chunk_retries() -> u32 {
    1
}

fn default_bar_size() -> String {
    "1 day".to_string()
}

fn default_what_to_show() -> String {
    "TRADES".to_string()
}

fn default_true() -> bool {
    true
}

fn default_min_price() -> Decimal {
    dec!(0.001)
}

fn default_max_price() -> Decimal {
    dec!(10000)
}

impl Default for BackfillSettings {
    fn default() -> Self {
        Self {
            max_chunk_days: default_max_chunk_days(),
            inter_symbol_delay_ms: default_inter_symbol_delay_ms(),
            historical_timeout_secs: default_historical_timeout_secs(),
            chunk_retries: default_chunk_retries(),
            bar_size: default_bar_size(),
            what_to_show: default_what_to_show(),
            use_rth: true,
            min_price: default_min_price(),
            max_price: default_max_price(),
        }
    }
}

impl BackfillSettings {
    pub fn validator_config(&self) -> BarValidatorConfig {
        BarValidatorConfig {
            min_price: self.min_price,
            max_price: self.max_price,
        }
    }

    pub fn historical_timeout(&self) -> Duration {
        Duration::from_secs(self.historical_timeout_secs)
    }

    pub fn inter_symbol_delay(&self) -> Duration {
        Duration::from_millis(self.inter_symbol_delay_ms)
    }
}

impl Settings {
    /// Load settings from configuration files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_prefix("DATA_FARMER")
    }

    /// Load settings with a custom environment variable prefix
    pub fn load_with_prefix(env_prefix: &str) -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config_dir = Self::config_dir();

        let s = Config::builder()
            // Start with default configuration
            .add_source(File::with_name(&format!("{}/default", config_dir)).required(false))
            // Add environment-specific configuration
            .add_source(File::with_name(&format!("{}/{}", config_dir, run_mode)).required(false))
            // Add local overrides (not checked into git)
            .add_source(File::with_name(&format!("{}/local", config_dir)).required(false))
            // Add environment variables (e.g., DATA_FARMER__DATABASE__URL)
            .add_source(
                Environment::with_prefix(env_prefix)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        s.try_deserialize()
    }

    /// Get the configuration directory path
    fn config_dir() -> String {
        std::env::var("DATA_FARMER_CONFIG_DIR").unwrap_or_else(|_| "config".into())
    }

    /// Create default settings (useful for testing)
    pub fn default_settings() -> Self {
        Settings {
            database: DatabaseSettings {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "postgresql://localhost/market_data".into()),
                max_connections: default_max_connections(),
                min_connections: default_min_connections(),
            },
            upstream: UpstreamSettings::default(),
            session: SessionSettings::default(),
            rate_limit: RateLimitSettings::default(),
            backfill: BackfillSettings::default(),
        }
    }

    /// Reject settings that would make the engine misbehave
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.database.url.trim().is_empty() {
            return Err(ConfigurationError::MissingField("database.url".into()));
        }
        if self.database.min_connections > self.database.max_connections {
            return Err(ConfigurationError::invalid(
                "database.min_connections",
                "must not exceed max_connections",
            ));
        }
        if self.upstream.port == 0 {
            return Err(ConfigurationError::invalid("upstream.port", "must be non-zero"));
        }
        if self.upstream.connect_timeout_secs == 0 {
            return Err(ConfigurationError::invalid(
                "upstream.connect_timeout_secs",
                "must be at least 1",
            ));
        }
        if self.session.health_check_interval_secs == 0 {
            return Err(ConfigurationError::invalid(
                "session.health_check_interval_secs",
                "must be at least 1",
            ));
        }

        for category in RateCategory::ALL {
            let limit = self.rate_limit.limit(category);
            if limit.max_requests == 0 || limit.window_secs == 0 {
                return Err(ConfigurationError::invalid(
                    format!("rate_limit.{}", category),
                    "max_requests and window_secs must be positive",
                ));
            }
        }
        if self.rate_limit.base_penalty_secs > self.rate_limit.max_penalty_secs {
            return Err(ConfigurationError::invalid(
                "rate_limit.base_penalty_secs",
                "must not exceed max_penalty_secs",
            ));
        }
        if !(0.0..1.0).contains(&self.rate_limit.jitter_ratio) {
            return Err(ConfigurationError::invalid(
                "rate_limit.jitter_ratio",
                "must be in [0, 1)",
            ));
        }

        if self.backfill.max_chunk_days == 0 {
            return Err(ConfigurationError::invalid(
                "backfill.max_chunk_days",
                "must be at least 1",
            ));
        }
        if self.backfill.historical_timeout_secs == 0 {
            return Err(ConfigurationError::invalid(
                "backfill.historical_timeout_secs",
                "must be at least 1",
            ));
        }
        if self.backfill.min_price >= self.backfill.max_price {
            return Err(ConfigurationError::invalid(
                "backfill.min_price",
                "must be below max_price",
            ));
        }

        Ok(())
    }
}
