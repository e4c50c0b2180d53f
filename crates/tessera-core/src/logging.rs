//! Tracing subscriber setup
//!
//! `RUST_LOG` wins when set. Otherwise the verbose/debug switches pick the
//! level for this crate: `debug` for developer output, `info` for
//! communication output, `warn` when quiet.

use crate::config::LoggingConfig;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter directive implied by the output switches
pub fn default_directive(config: &LoggingConfig) -> &'static str {
    if config.debug {
        "tessera_core=debug,tessera_protocol=debug"
    } else if config.verbose {
        "tessera_core=info,tessera_protocol=info"
    } else {
        "tessera_core=warn,tessera_protocol=warn"
    }
}

/// Install the global subscriber.
///
/// Returns `false` when a subscriber was already installed, which keeps
/// repeated calls from tests and embedding applications harmless.
pub fn init(config: &LoggingConfig) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| default_directive(config).into());

    let registry = tracing_subscriber::registry().with(filter);
    let result = if config.json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    };
    result.is_ok()
}
