//! # Observability & Tracing
//!
//! Structured logging for the whole pipeline is done with the `tracing` crate.
//! Components log with structured fields rather than interpolated strings:
//!
//! ```text
//! INFO Registered event handler event="AppStarted" handler="LogStart" subdomain=app
//! WARN component="UpdateQuotes" failed - storage error: database is locked
//! INFO component="UpdateQuotes" waiting 2s before next attempt
//! ```
//!
//! Log levels are taken from `RUST_LOG` when it is set, otherwise from the
//! default passed to [`setup_tracing`].
//!
//! ```bash
//! RUST_LOG=debug cargo run
//! RUST_LOG=pipeline_core::dag=debug cargo run
//! ```

use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. Call once, at process start.
pub fn setup_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
