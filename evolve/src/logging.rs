//! Development-time tracing for debugging the loop.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: diagnostics via `RUST_LOG`, output to stderr.
//!   Not persisted, not part of the product output.
//!
//! - **Run files (`io/ledger`, `io/state_store`, `io/session_log`)**: the
//!   durable record of each iteration. Always written, unaffected by
//!   `RUST_LOG`. Progress lines on stdout come from `main`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`, defaulting to `warn`. Output: stderr, compact format.
/// `verbose` raises the default to `info` when `RUST_LOG` is unset.
///
/// # Example
/// ```bash
/// RUST_LOG=evolve=debug evolve run desires.md ledger.md state.json session.jsonl ...
/// ```
pub fn init(verbose: bool) {
    let default = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
