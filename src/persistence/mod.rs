//! Persistence layer modules.

pub mod atomic;
pub mod run_store;

pub use run_store::RunStore;
