//! Stable exit codes for the evolve CLI.

/// The run used its iteration budget (or had nothing left to do), or
/// `status` succeeded.
pub const OK: i32 = 0;
/// Invalid arguments or config, or an unexpected I/O error.
pub const INVALID: i32 = 1;
/// An iteration failed and the run stopped early.
pub const ABORTED: i32 = 2;
/// The bootstrap hook failed.
pub const BOOTSTRAP_FAILED: i32 = 3;
/// Another run holds the lock on the state file.
pub const LOCKED: i32 = 4;
