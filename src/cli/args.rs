//! CLI argument definitions and parsing structures
//!
//! This module defines the command-line interface structure using clap,
//! including the main `Cli` struct and all subcommand enums.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use cotflow_config::CliArgs;
use cotflow_utils::types::StepName;

/// cotflow - multi-phase LLM pipeline orchestrator
#[derive(Parser, Debug)]
#[command(name = "cotflow")]
#[command(about = "Drive multi-phase THINK / EXECUTE / INTEGRATE pipelines over LLM backends")]
#[command(long_about = r#"
cotflow moves a session through an ordered list of phases. Every phase runs a
THINK completion, an EXECUTE step (search fan-out or pass-through) and an
INTEGRATE completion whose result feeds later phases.

EXAMPLES:
  # Create a session with domain parameters
  cotflow create --set topic="edge inference"
  cotflow create --id demo --config-json '{"topic": "edge inference"}'

  # Move one step forward (dispatches work or records finished work)
  cotflow advance demo

  # Drive a session until it completes, fails or blocks
  cotflow run demo

  # Render a step against stored context without calling any backend
  cotflow debug-run-step demo --phase 2 --step think --dry-run

  # Retry a failed session from the step that failed
  cotflow resume demo

CONFIGURATION:
  Configuration is loaded with precedence: CLI flags > environment > config file > defaults
  The config file is discovered by searching upward from CWD for .cotflow/config.toml
  COTFLOW_HOME overrides the state directory
"#)]
#[command(version)]
pub struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding session, phase and task records
    #[arg(long, global = true)]
    pub state_dir: Option<String>,

    /// Pipeline definition file (TOML); the built-in pipeline is used otherwise
    #[arg(long, global = true)]
    pub pipeline: Option<String>,

    /// Completion model override
    #[arg(long, global = true)]
    pub model: Option<String>,

    /// Maximum number of backend calls in flight
    #[arg(long, global = true)]
    pub max_concurrency: Option<usize>,

    /// Attempts per task before it is marked FAILED
    #[arg(long, global = true)]
    pub max_attempts: Option<u32>,

    /// Per-call timeout in seconds
    #[arg(long, global = true)]
    pub call_timeout: Option<u64>,

    /// Emit machine-readable JSON on stdout
    #[arg(long, global = true)]
    pub json: bool,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log format on stderr
    #[arg(long, global = true, value_enum, default_value_t = LogFormatArg::Compact)]
    pub log_format: LogFormatArg,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Configuration overrides carried by the global flags.
    #[must_use]
    pub fn config_args(&self) -> CliArgs {
        CliArgs {
            config_path: self.config.clone(),
            state_dir: self.state_dir.clone(),
            pipeline: self.pipeline.clone(),
            verbose: self.verbose.then_some(true),
            model: self.model.clone(),
            max_concurrency: self.max_concurrency,
            max_attempts: self.max_attempts,
            call_timeout_secs: self.call_timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    Compact,
    Json,
}

/// Step selector accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StepArg {
    Think,
    Execute,
    Integrate,
}

impl From<StepArg> for StepName {
    fn from(step: StepArg) -> Self {
        match step {
            StepArg::Think => StepName::Think,
            StepArg::Execute => StepName::Execute,
            StepArg::Integrate => StepName::Integrate,
        }
    }
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a new session at phase 1 THINK
    ///
    /// EXAMPLES:
    ///   cotflow create --set topic="edge inference"
    ///   cotflow create --id demo --config-json '{"topic": "X", "depth": 2}'
    Create {
        /// Session id (generated when omitted)
        #[arg(long)]
        id: Option<String>,

        /// Session parameters as a JSON object
        #[arg(long, value_name = "JSON")]
        config_json: Option<String>,

        /// Session parameter as key=value; values that parse as JSON are kept typed
        #[arg(long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,
    },

    /// Move a session one step forward
    ///
    /// Dispatches the current step's work, or records it once every task has
    /// settled. Never waits on a backend: run it again (or use `run`) to pick
    /// up finished work.
    Advance {
        /// Session id
        id: String,
    },

    /// Advance a session until it completes, fails or blocks
    Run {
        /// Session id
        id: String,

        /// Poll interval in milliseconds while tasks are in flight
        #[arg(long, default_value_t = 500)]
        poll_ms: u64,
    },

    /// Show a session, its phase rows and task counts
    Status {
        /// Session id
        id: String,
    },

    /// List all sessions
    List,

    /// Re-open a FAILED or stuck session at the step where it stopped
    Resume {
        /// Session id
        id: String,
    },

    /// Cancel a session; later advances report it as terminal
    Cancel {
        /// Session id
        id: String,
    },

    /// Run a single step in isolation, optionally with mock data
    ///
    /// EXAMPLES:
    ///   cotflow debug-run-step demo --phase 1 --step think --dry-run
    ///   cotflow debug-run-step demo --phase 2 --step integrate --mock mock.json
    ///   cotflow debug-run-step demo --phase 1 --step execute --skip-search --save
    #[command(name = "debug-run-step")]
    DebugRunStep {
        /// Session id
        id: String,

        /// Phase number (1-based)
        #[arg(long)]
        phase: u32,

        /// Step to run
        #[arg(long, value_enum)]
        step: StepArg,

        /// Render only; never call a backend or write rows
        #[arg(long)]
        dry_run: bool,

        /// Write the step result onto the stored phase row
        #[arg(long)]
        save: bool,

        /// Answer EXECUTE searches with placeholders instead of calling the backend
        #[arg(long)]
        skip_search: bool,

        /// JSON file with mock data (context, thinkResult, executeResult, searchResults)
        #[arg(long, value_name = "FILE")]
        mock: Option<PathBuf>,
    },
}

impl Commands {
    /// Operation name used in error reports.
    #[must_use]
    pub const fn operation(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Advance { .. } => "advance",
            Self::Run { .. } => "run",
            Self::Status { .. } => "status",
            Self::List => "list",
            Self::Resume { .. } => "resume",
            Self::Cancel { .. } => "cancel",
            Self::DebugRunStep { .. } => "debug-run-step",
        }
    }
}

/// Build the clap command for help generation and tests.
#[must_use]
pub fn build_cli() -> clap::Command {
    <Cli as clap::CommandFactory>::command()
}
