//! Telemetry and Observability
//!
//! Sets up `tracing-subscriber` for the daemon and the operator client.
//! Log level comes from config and `RUST_LOG` overrides it. The daemon logs
//! pretty output in debug builds and JSON in release builds; the operator
//! client only writes to stderr so command replies on stdout stay clean.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn filter_for(log_level: &str) -> EnvFilter {
    let default_filter = format!(
        "{},evolver_engine={},sdk={}",
        log_level, log_level, log_level
    );

    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&default_filter))
}

/// Initialize the daemon subscriber with the given log level from config.
///
/// Priority: `RUST_LOG` env var > `log_level` parameter > default "info"
pub fn init_telemetry_with_level(log_level: &str) {
    let env_filter = filter_for(log_level);

    #[cfg(debug_assertions)]
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().pretty().with_target(false))
            .try_init()
            .ok();
    }

    #[cfg(not(debug_assertions))]
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_current_span(true))
            .try_init()
            .ok();
    }
}

/// Initialize a compact stderr subscriber for one-shot client commands.
pub fn init_client_telemetry(log_level: &str) {
    tracing_subscriber::registry()
        .with(filter_for(log_level))
        .with(fmt::layer().compact().with_writer(std::io::stderr))
        .try_init()
        .ok();
}
