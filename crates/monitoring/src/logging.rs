//! Logging configuration and initialization
//!
//! Console logging through tracing-subscriber, honoring the configured
//! level (overridable via `RUST_LOG`) and output format (plain or
//! JSON).

use anyhow::{Result, anyhow};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing for the process.
///
/// `level` is the default filter (`debug`, `info`, `warn`, `error`,
/// `fatal`, `panic`); the `RUST_LOG` environment variable takes
/// precedence when set. `format` selects between human-readable plain
/// output and JSON lines.
pub fn init_logging(level: &str, format: &str) -> Result<()> {
    let level = effective_level(level);
    let configured =
        EnvFilter::try_new(level).map_err(|e| anyhow!("invalid log level '{level}': {e}"))?;
    let env_filter = EnvFilter::try_from_default_env().unwrap_or(configured);

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(false),
                )
                .try_init()
                .map_err(|e| anyhow!("failed to initialize tracing subscriber: {e}"))?;
        }
        "plain" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().with_target(false))
                .try_init()
                .map_err(|e| anyhow!("failed to initialize tracing subscriber: {e}"))?;
        }
        other => return Err(anyhow!("invalid log format '{other}'")),
    }

    info!("📝 Logging initialized (level: {level}, format: {format})");
    Ok(())
}

/// tracing has no levels above `error`; `fatal` and `panic` collapse
/// onto it.
fn effective_level(level: &str) -> &str {
    match level {
        "fatal" | "panic" => "error",
        other => other,
    }
}
