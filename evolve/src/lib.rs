//! Sandboxed, bounded self-modification loop.
//!
//! Each iteration asks a model for a structured proposal (new desires text
//! plus whole-file writes), validates it, applies accepted writes inside the
//! desires document's directory, and records the result in an append-only
//! ledger, a resumable state snapshot and a JSON Lines session log.
//!
//! - **[`core`]**: Pure, deterministic logic (response validation, path
//!   containment, ledger format, budget). No I/O.
//! - **[`io`]**: Side effects (files, child processes, HTTP). The model client
//!   and bootstrap hook sit behind traits so tests can script them.
//!
//! [`iteration`] runs one attempt; [`looping`] drives a bounded run of them.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod iteration;
pub mod logging;
pub mod looping;
pub mod status;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
