//! `tracing` subscriber setup.
//!
//! Both initializers write to stderr and are no-ops once a global
//! subscriber exists. `RUST_LOG`, when set, overrides `level`.

use tracing_subscriber::EnvFilter;

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Human-readable compact lines.
pub fn init_subscriber(level: &str) {
    let _ = tracing_subscriber::fmt()
        .compact()
        .with_target(true)
        .with_env_filter(filter(level))
        .with_writer(std::io::stderr)
        .try_init();
}

/// One JSON object per line, for log shippers.
pub fn init_json_subscriber(level: &str) {
    let _ = tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter(level))
        .with_writer(std::io::stderr)
        .try_init();
}
