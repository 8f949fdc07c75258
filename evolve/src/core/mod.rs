//! Deterministic, pure logic shared by the evolve loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests.

pub mod budget;
pub mod digest;
pub mod ledger_block;
pub mod path;
pub mod response;
pub mod types;
