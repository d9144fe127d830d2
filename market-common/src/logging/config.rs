//! Logging configuration and initialization.

use std::env;
use std::io::IsTerminal;

use tracing_subscriber::fmt::time::{ChronoLocal, ChronoUtc};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable multi-line format
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
    /// JSON lines for log aggregation
    Json,
}

impl LogFormat {
    /// Parse format from string; unknown values fall back to pretty
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Pretty,
        }
    }
}

/// Timestamp format for log entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimestampFormat {
    /// Local time with offset
    #[default]
    Local,
    /// UTC (ISO 8601)
    Utc,
    /// No timestamps
    None,
}

impl TimestampFormat {
    /// Parse format from string; unknown values fall back to local
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "utc" => TimestampFormat::Utc,
            "none" | "off" => TimestampFormat::None,
            _ => TimestampFormat::Local,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Output format
    pub format: LogFormat,
    /// Timestamp format
    pub timestamps: TimestampFormat,
    /// Level filter used when `RUST_LOG` is not set
    pub default_level: String,
    /// Include source file and line
    pub include_location: bool,
    /// Include thread IDs
    pub include_thread_ids: bool,
    /// Include target (module path)
    pub include_target: bool,
    /// Application name, logged once at startup
    pub app_name: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Pretty,
            timestamps: TimestampFormat::Local,
            default_level: "info".to_string(),
            include_location: true,
            include_thread_ids: false,
            include_target: true,
            app_name: None,
        }
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|s| s == "true" || s == "1")
        .unwrap_or(default)
}

impl LogConfig {
    /// Create config from environment variables
    ///
    /// Reads `LOG_FORMAT`, `LOG_TIMESTAMPS`, `LOG_LEVEL`, `LOG_LOCATION`,
    /// `LOG_THREAD_IDS` and `LOG_APP_NAME`.
    pub fn from_env() -> Self {
        Self {
            format: env::var("LOG_FORMAT")
                .map(|s| LogFormat::parse(&s))
                .unwrap_or_default(),
            timestamps: env::var("LOG_TIMESTAMPS")
                .map(|s| TimestampFormat::parse(&s))
                .unwrap_or_default(),
            default_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            include_location: env_flag("LOG_LOCATION", true),
            include_thread_ids: env_flag("LOG_THREAD_IDS", false),
            include_target: true,
            app_name: env::var("LOG_APP_NAME").ok(),
        }
    }

    /// JSON output with UTC timestamps, for log shipping
    pub fn json() -> Self {
        Self {
            format: LogFormat::Json,
            timestamps: TimestampFormat::Utc,
            include_thread_ids: true,
            ..Default::default()
        }
    }

    /// Compact output without locations, for long-running workers
    pub fn compact() -> Self {
        Self {
            format: LogFormat::Compact,
            include_location: false,
            ..Default::default()
        }
    }

    /// Set the application name
    pub fn with_app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = Some(name.into());
        self
    }

    /// Set the default log level
    pub fn with_default_level(mut self, level: impl Into<String>) -> Self {
        self.default_level = level.into();
        self
    }
}

/// Initialize the global subscriber with the given configuration
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_logging(config: LogConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.default_level));

    tracing_subscriber::registry()
        .with(build_layer(&config))
        .with(env_filter)
        .try_init()?;

    if let Some(ref app) = config.app_name {
        tracing::info!(app = %app, format = ?config.format, "Logging initialized");
    }

    Ok(())
}

fn build_layer(config: &LogConfig) -> BoxedLayer {
    let base = fmt::layer()
        .with_target(config.include_target)
        .with_thread_ids(config.include_thread_ids)
        .with_file(config.include_location)
        .with_line_number(config.include_location)
        .with_ansi(config.format != LogFormat::Json && std::io::stdout().is_terminal());

    macro_rules! timed {
        ($layer:expr) => {
            match config.timestamps {
                TimestampFormat::Local => $layer
                    .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f %z".to_string()))
                    .boxed(),
                TimestampFormat::Utc => $layer
                    .with_timer(ChronoUtc::new("%Y-%m-%dT%H:%M:%S%.3fZ".to_string()))
                    .boxed(),
                TimestampFormat::None => $layer.without_time().boxed(),
            }
        };
    }

    match config.format {
        LogFormat::Json => timed!(base.json().flatten_event(true)),
        LogFormat::Compact => timed!(base.compact()),
        LogFormat::Pretty => timed!(base.pretty()),
    }
}
