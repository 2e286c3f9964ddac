//! Domain model module declarations.

pub mod request;
pub mod result;
pub mod run;

pub use request::Request;
pub use result::{ResultStatus, RunError, RunResult, TokenUsage};
pub use run::{Constraints, Run, RunMode, RunSpec, RunState};
