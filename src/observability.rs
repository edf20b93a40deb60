//! Logging initialization
//!
//! `RUST_LOG` wins when set; otherwise the configured default level
//! applies to this crate only. Safe to call more than once (later calls
//! are no-ops), which keeps test setups simple.

use tracing_subscriber::EnvFilter;

/// Initializes the global tracing subscriber
pub fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("intentmesh={default_level}")));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init();
}
