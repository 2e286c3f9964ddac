//! Run orchestration modules.
//!
//! Covers the run state machine, the task runner that drives a backend
//! call, startup reconciliation, the polling daemon, and the operator
//! command surface.

pub mod daemon;
pub mod reconciler;
pub mod run_manager;
pub mod state_machine;
pub mod task_runner;
