//! Tracing setup for driver processes and test binaries.
//!
//! The driver reports through `tracing`; nothing is printed unless a
//! subscriber is installed. Binaries call [`init_logger`] once; test
//! suites call [`init_test_logger`], which is safe to call from every test.
//!
//! Verbosity is resolved in this order:
//! 1. `verbose`: debug level for the driver
//! 2. `quiet`: errors only
//! 3. `RUST_LOG`
//! 4. info level for the driver

use std::sync::Once;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const VERBOSE_FILTER: &str = "appdrive=debug";
const QUIET_FILTER: &str = "appdrive=error";
const DEFAULT_FILTER: &str = "appdrive=info";

static TEST_LOGGER: Once = Once::new();

/// Builds the level filter for the given verbosity flags.
#[must_use]
pub fn filter_for(verbose: bool, quiet: bool) -> EnvFilter {
    if verbose {
        EnvFilter::new(VERBOSE_FILTER)
    } else if quiet {
        EnvFilter::new(QUIET_FILTER)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
    }
}

/// Installs the global subscriber.
///
/// Must be called at most once per process; a second global subscriber
/// is rejected and the call becomes a no-op.
pub fn init_logger(verbose: bool, quiet: bool, no_color: bool) {
    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_level(true)
        .with_ansi(!no_color && should_use_colors())
        .compact();

    let _ = tracing_subscriber::registry()
        .with(filter_for(verbose, quiet))
        .with(fmt_layer)
        .try_init();
}

/// Installs a subscriber that writes through the test harness's capture.
///
/// Idempotent, so every test may call it.
pub fn init_test_logger() {
    TEST_LOGGER.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(filter_for(false, false))
            .with(fmt::layer().with_test_writer().with_target(false).compact())
            .try_init();
    });
}

/// Whether colored output is appropriate.
///
/// `NO_COLOR` disables colors; `FORCE_COLOR` forces them; CI logs stay plain.
#[must_use]
pub fn should_use_colors() -> bool {
    if std::env::var_os("NO_COLOR").is_some() {
        return false;
    }
    if std::env::var_os("FORCE_COLOR").is_some() {
        return true;
    }
    !crate::config::running_on_ci()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn no_color_wins_over_force_color() {
        unsafe {
            std::env::set_var("NO_COLOR", "1");
            std::env::set_var("FORCE_COLOR", "1");
        }
        assert!(!should_use_colors());
        unsafe {
            std::env::remove_var("NO_COLOR");
        }
        assert!(should_use_colors());
        unsafe {
            std::env::remove_var("FORCE_COLOR");
        }
    }

    #[test]
    fn test_logger_is_idempotent() {
        init_test_logger();
        init_test_logger();
        tracing::info!("still fine");
    }
}
