//! Logging setup.
//!
//! Installs a `tracing_subscriber` registry with an `EnvFilter` read from
//! `RUST_LOG` (default `rtc_session=debug`) and either pretty or JSON output.

use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::{EnvFilter, Registry};

const DEFAULT_FILTER: &str = "rtc_session=debug";

/// Install the global subscriber.
///
/// Returns `false` if a subscriber was already installed; the existing one is
/// kept.
pub fn init_tracing(json: bool) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let result = if json {
        Registry::default()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        Registry::default()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
    };

    match result {
        Ok(()) => {
            tracing::info!(json, "Tracing initialized");
            true
        }
        Err(_) => false,
    }
}
