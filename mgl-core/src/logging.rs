//! Tracing subscriber setup shared by binaries and integration harnesses.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::GeneralConfig;

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over `general.log_level`. Output is
/// human-readable unless `general.json_logs` is set. Returns `false` when a
/// subscriber was already installed, which is not an error.
pub fn init(config: &GeneralConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if config.json_logs {
        registry.with(fmt::layer().json().with_current_span(false)).try_init()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()
    };
    installed.is_ok()
}
