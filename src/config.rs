//! Broker configuration: CLI flags, defaults, and validation.
//!
//! A struct with a sane `Default`, a constructor from the parsed external input, and a
//! validation pass that clamps out-of-range values and logs a warning rather than
//! panicking.

use std::time::Duration;

use clap::Parser;
use tracing::warn;

/// Command-line flags accepted by the broker binary.
#[derive(Debug, Parser)]
#[command(
    name = "market_broker",
    about = "Central broker for a small fixed-catalog electronic marketplace"
)]
pub struct Args {
    /// TCP port to listen on.
    #[arg(long, default_value_t = 5000)]
    pub port: u16,

    /// Uniform starting stock per catalog item, seeded on seller registration.
    #[arg(long, default_value_t = 1000.0)]
    pub default_stock: f64,

    /// Sale duration in seconds; must be in (0, 60].
    #[arg(long, default_value_t = 60)]
    pub sale_duration_secs: u64,

    /// Expiry sweeper tick interval, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    pub sweep_interval_ms: u64,

    /// "pretty" (human-readable) or "json" (structured) log output.
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

/// Output format for the `tracing-subscriber` layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Validated runtime configuration, built from `Config::from_args`.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub default_stock: f64,
    pub sale_duration: Duration,
    pub sweep_interval: Duration,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5000,
            default_stock: 1000.0,
            sale_duration: Duration::from_secs(60),
            sweep_interval: Duration::from_millis(1000),
            log_format: LogFormat::Pretty,
        }
    }
}

impl Config {
    /// Builds a `Config` from parsed CLI args, clamping each out-of-range value back to
    /// its default and logging a warning rather than panicking.
    pub fn from_args(args: Args) -> Self {
        let mut config = Config::default();
        config.port = args.port;

        config.default_stock = if args.default_stock > 0.0 {
            args.default_stock
        } else {
            warn!(value = args.default_stock, "invalid --default-stock, using default");
            config.default_stock
        };

        config.sale_duration = if args.sale_duration_secs > 0 && args.sale_duration_secs <= 60 {
            Duration::from_secs(args.sale_duration_secs)
        } else {
            warn!(
                value = args.sale_duration_secs,
                "invalid --sale-duration-secs (must be in (0, 60]), using default"
            );
            config.sale_duration
        };

        config.sweep_interval = if args.sweep_interval_ms > 0 {
            Duration::from_millis(args.sweep_interval_ms)
        } else {
            warn!(value = args.sweep_interval_ms, "invalid --sweep-interval-ms, using default");
            config.sweep_interval
        };

        config.log_format = match args.log_format.as_str() {
            "json" => LogFormat::Json,
            "pretty" => LogFormat::Pretty,
            other => {
                warn!(value = other, "unknown --log-format, using pretty");
                LogFormat::Pretty
            }
        };

        config
    }
}
