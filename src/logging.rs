//! Tracing subscriber setup

use anyhow::{anyhow, Result};
use tracing_subscriber::{
    filter::LevelFilter,
    fmt::{self, time::ChronoUtc},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Microsecond UTC timestamps.
const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingConfig {
    pub debug: bool,
    pub json: bool,
}

impl LoggingConfig {
    pub fn default_level(&self) -> LevelFilter {
        if self.debug {
            LevelFilter::DEBUG
        } else {
            LevelFilter::INFO
        }
    }

    /// `RUST_LOG` wins over the level chosen by `--debug`.
    pub fn env_filter(&self) -> EnvFilter {
        EnvFilter::builder()
            .with_default_directive(self.default_level().into())
            .from_env_lossy()
    }
}

/// Install the global subscriber. Call once at startup.
pub fn init_logging(config: LoggingConfig) -> Result<()> {
    let registry = tracing_subscriber::registry().with(config.env_filter());

    let result = if config.json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_timer(ChronoUtc::new(TIME_FORMAT.to_string()))
                    .with_current_span(true)
                    .with_span_list(false),
            )
            .try_init()
    } else {
        registry
            .with(
                fmt::layer()
                    .with_timer(ChronoUtc::new(TIME_FORMAT.to_string()))
                    .with_target(false),
            )
            .try_init()
    };

    result.map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))
}
