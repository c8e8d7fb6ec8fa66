//! cotflow - multi-phase THINK / EXECUTE / INTEGRATE pipeline orchestrator
//!
//! A session walks an ordered list of phases. Each phase runs three steps:
//! a THINK completion that plans, an EXECUTE step that fans the plan out to a
//! search backend (or passes through), and an INTEGRATE completion that
//! produces the phase result later phases read from.
//!
//! cotflow can be used in two ways:
//! - **CLI**: the `cotflow` binary exposes `create`, `advance`, `run`,
//!   `status`, `list`, `resume`, `cancel` and `debug-run-step`
//! - **Library**: build an [`OrchestratorHandle`] and drive sessions in-process
//!
//! # Quick Start (CLI)
//!
//! ```bash
//! # Create a session with a topic
//! cotflow create --set topic="edge inference" --id demo
//!
//! # Drive it to completion
//! cotflow run demo
//!
//! # Inspect the stored results
//! cotflow status demo --json
//!
//! # Render phase 2 THINK against stored context without calling a backend
//! cotflow debug-run-step demo --phase 2 --step think --dry-run
//! ```
//!
//! # Quick Start (Library)
//!
//! ```rust,no_run
//! use cotflow::{CliArgs, Config, OrchestratorHandle};
//! use serde_json::{Map, json};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::discover(&CliArgs::default())?;
//!     let handle = OrchestratorHandle::from_config(config)?;
//!
//!     let mut params = Map::new();
//!     params.insert("topic".into(), json!("edge inference"));
//!     let session = handle.orchestrator().create_session(params, None).await?;
//!
//!     let report = handle.driver().run_session(&session.id).await?;
//!     println!("{} -> {:?}", report.session_id, report.outcome);
//!     Ok(())
//! }
//! ```
//!
//! # Stable Public API
//!
//! - [`OrchestratorHandle`], [`Orchestrator`], [`Driver`], [`Debugger`]
//! - [`AdvanceOutcome`] and [`AdvanceReport`] - results of one `advance`
//! - [`Config`] and [`ConfigBuilder`] - configuration management
//! - [`CotflowError`] - library error type
//! - [`ExitCode`] - CLI exit codes

pub mod cli;

pub use cotflow_config::{CliArgs, Config, ConfigBuilder, ConfigSource};
pub use cotflow_engine::{
    AdvanceOutcome, AdvanceReport, BatchStatus, Context, DebugOptions, DebugRunResult, Debugger,
    Dispatcher, Driver, MockData, Orchestrator, OrchestratorHandle, StatusSnapshot, StepTasks,
    TaskRequest, build_context, build_step_context,
};
pub use cotflow_store::{JsonFileStore, MemoryStore, PhaseRecord, SessionRecord, Store, TaskRecord};
pub use cotflow_strategy::{PhaseStrategy, StepSpec, StrategyRegistry};
pub use cotflow_utils::error::{CotflowError, UserFriendlyError};
pub use cotflow_utils::exit_codes::ExitCode;
pub use cotflow_utils::types::{SessionId, SessionStatus, StepName, TaskId};

/// Template rendering, re-exported for callers writing custom pipelines.
pub use cotflow_prompt_template::render;

/// Tolerant JSON decoding of model output.
pub use cotflow_extraction::decode;
