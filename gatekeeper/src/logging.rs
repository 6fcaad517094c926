//! Diagnostic tracing for operators debugging a run.
//!
//! Tracing output goes to stderr and is controlled by `RUST_LOG`. It is never
//! part of the validation record: reports, tokens, acceptance records and the
//! recovery log under `artifacts/validation_runs/` are written regardless of
//! the filter.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset or unparsable.
const DEFAULT_FILTER: &str = "warn";

/// Install the global subscriber: `RUST_LOG` filter, compact lines on stderr.
///
/// ```bash
/// RUST_LOG=gatekeeper::gate=debug gatekeeper run --mission-kind build --tier light -- make check
/// ```
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .compact(),
        )
        .init();
}
