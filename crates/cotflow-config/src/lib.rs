//! Configuration management for cotflow
//!
//! Hierarchical configuration with discovery and precedence:
//! CLI > environment > file > defaults. The TOML file lives at
//! `.cotflow/config.toml` and is found by searching upward from the working
//! directory. Every section is optional.
//!
//! ```toml
//! [defaults]
//! state_dir = ".cotflow/state"
//! pipeline = "pipeline.toml"
//! lease_ttl_secs = 300
//!
//! [dispatcher]
//! max_concurrency = 3
//! max_attempts = 3
//! initial_backoff_ms = 1000
//! max_backoff_ms = 30000
//! call_timeout_secs = 120
//!
//! [llm.completion]
//! base_url = "https://openrouter.ai/api/v1"
//! api_key_env = "OPENROUTER_API_KEY"
//! model = "openai/gpt-4o-mini"
//!
//! [llm.search]
//! base_url = "https://api.perplexity.ai"
//! api_key_env = "PERPLEXITY_API_KEY"
//! model = "sonar"
//! ```

mod builder;
mod cli_args;
mod discovery;
mod model;
mod sources;
mod validation;

pub use builder::ConfigBuilder;
pub use cli_args::CliArgs;
pub use model::*;
pub use sources::ConfigSource;
