//! Structured logging setup.
//!
//! Installs an env-filtered `tracing` subscriber once per process. Safe to
//! call multiple times (from tests and from the embedding binary's `main`) —
//! only the first call takes effect.

use crate::config::LoggingConfig;
use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

static INIT: OnceCell<()> = OnceCell::new();

/// Initialize the global tracing subscriber from a [`LoggingConfig`].
///
/// The `level` field is used as the default filter directive when
/// `RUST_LOG` is unset. Idempotent: later calls are no-ops.
pub fn init_tracing(config: &LoggingConfig) {
    INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true);

        if subscriber.try_init().is_err() {
            // Another subscriber is already installed (e.g. set by the
            // embedding binary); nothing to do.
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let cfg = LoggingConfig::default();
        init_tracing(&cfg);
        init_tracing(&cfg); // must not panic
    }
}
