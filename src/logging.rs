//! Logging setup
//!
//! The library only emits `tracing` events; binaries and tests opt into
//! output by calling [`init`].

use std::io::IsTerminal;

use tracing_subscriber::{fmt, EnvFilter};

/// Install a stderr subscriber
///
/// `RUST_LOG` takes precedence over `default_filter`. Installing twice is
/// harmless: later calls leave the first subscriber in place.
pub fn init(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let use_ansi = std::env::var_os("NO_COLOR").is_none() && std::io::stderr().is_terminal();

    let _ = fmt::fmt()
        .with_env_filter(filter)
        .with_ansi(use_ansi)
        .with_writer(std::io::stderr)
        .with_target(true)
        .compact()
        .try_init();
}
