//! Orchestration engine for cotflow
//!
//! This crate moves sessions through a pipeline of THINK / EXECUTE /
//! INTEGRATE phases:
//!
//! - [`orchestrator`]: the session state machine (`advance`, `resume`, `cancel`, ...)
//! - [`context`]: per-step variable maps built from persisted results and adapters
//! - [`dispatcher`]: the in-process task queue with bounded concurrency and retries
//! - [`driver`]: loops that re-advance sessions when their tasks finish
//! - [`debug`]: single-step dry runs with mock data
//!
//! External consumers (the CLI) should go through
//! [`orchestrator::OrchestratorHandle`].

pub mod context;
pub mod debug;
pub mod dispatcher;
pub mod driver;
pub mod orchestrator;
mod steps;

pub use context::{Context, build_context, build_step_context};
pub use debug::{DebugOptions, DebugRunResult, Debugger, MockData};
pub use dispatcher::{
    BatchStatus, Dispatcher, TaskCompletion, TaskFailure, TaskRequest, TaskSpec, backoff_delay,
};
pub use driver::Driver;
pub use orchestrator::{
    AdvanceOutcome, AdvanceReport, Orchestrator, OrchestratorHandle, StatusSnapshot, StepTasks,
};
pub use steps::extract_queries;
