//! Tracing subscriber setup for the binary.
//!
//! `RUST_LOG` controls the filter (default `caseflow=info`). Setting
//! `CASEFLOW_LOG_FORMAT=json` emits one JSON object per event.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

pub const LOG_FORMAT_ENV: &str = "CASEFLOW_LOG_FORMAT";

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("caseflow=info"))
}

/// Installs the global subscriber. Later calls are ignored.
pub fn init_logging() {
    let json = std::env::var(LOG_FORMAT_ENV)
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let registry = tracing_subscriber::registry().with(default_filter());
    let result = if json {
        registry
            .with(fmt::layer().json().with_target(true).with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_names(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    };
    let _ = result;
}
