//! Side-effecting pieces of the evolve loop: files, processes, network.

pub mod apply;
pub mod bootstrap;
pub mod config;
pub mod context;
pub mod ledger;
pub mod lock;
pub mod model;
pub mod process;
pub mod prompt;
pub mod session_log;
pub mod state_store;
