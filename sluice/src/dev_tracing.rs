//! Tracing setup for demos and tests.
//!
//! The reactor logs connection lifecycle at `debug` and per-frame activity at
//! `trace` under the `sluice_core` target. Nothing is printed unless one of
//! these helpers installs a subscriber.

use tracing_subscriber::EnvFilter;

/// Directive used by [`init_test_tracing`] when `RUST_LOG` is unset.
pub const TEST_FILTER: &str = "sluice=debug,sluice_core=debug";

/// Fallback variable read when `RUST_LOG` is unset.
pub const LOG_ENV: &str = "SLUICE_LOG";

/// Install a stderr subscriber when `RUST_LOG` or `SLUICE_LOG` is set.
///
/// Thread names are printed, so reactor callbacks show up as
/// `sluice-reactor`. A no-op when neither variable is set or a global
/// subscriber is already installed.
pub fn init_tracing() {
    if let Some(filter) = env_filter() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_thread_names(true)
            .try_init();
    }
}

/// Install a subscriber whose output is captured by the test harness.
///
/// Falls back to [`TEST_FILTER`] so a failing test shows the reactor's
/// lifecycle without any environment setup.
pub fn init_test_tracing() {
    let filter = env_filter().unwrap_or_else(|| EnvFilter::new(TEST_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_test_writer()
        .try_init();
}

fn env_filter() -> Option<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_from_env(LOG_ENV))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_test_filter_parses() {
        assert!(EnvFilter::try_new(TEST_FILTER).is_ok());
    }

    #[test]
    fn test_repeated_init_is_harmless() {
        init_test_tracing();
        init_test_tracing();
        init_tracing();
        tracing::debug!(target: "sluice", "still logging");
    }
}
