#![forbid(unsafe_code)]

//! `agent-dispatch` dispatches coding-task runs to external agent CLIs.
//!
//! Runs live in a file-backed store, move through a guarded lifecycle
//! (`created -> running -> completed | failed`, with resume re-arming a
//! finished run), and survive daemon crashes through startup
//! reconciliation.

pub mod audit;
pub mod backend;
pub mod config;
pub mod errors;
pub mod models;
pub mod orchestrator;
pub mod persistence;

pub use config::DispatchConfig;
pub use errors::{AppError, Result};
