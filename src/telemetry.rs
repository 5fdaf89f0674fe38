//! Logging setup for hosts embedding the sign-in core.

use anyhow::{Context, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::diagnostics::{DiagnosticsLayer, DiagnosticsLog};

/// Install the global subscriber: `RUST_LOG` filtered (default `info`)
/// console output, plus the diagnostics buffer when one is given.
pub fn init_logging(diagnostics: Option<DiagnosticsLog>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(diagnostics.map(DiagnosticsLayer::new))
        .try_init()
        .context("Failed to install tracing subscriber")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        let _ = init_logging(Some(DiagnosticsLog::new()));
        assert!(init_logging(None).is_err());
    }
}
