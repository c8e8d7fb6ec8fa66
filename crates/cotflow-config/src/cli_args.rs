use std::path::PathBuf;

/// Configuration overrides taken from the command line.
///
/// Every field is optional; `None` means "not given on the command line".
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    pub config_path: Option<PathBuf>,
    pub state_dir: Option<String>,
    pub pipeline: Option<String>,
    pub verbose: Option<bool>,
    pub model: Option<String>,
    pub max_concurrency: Option<usize>,
    pub max_attempts: Option<u32>,
    pub call_timeout_secs: Option<u64>,
}
