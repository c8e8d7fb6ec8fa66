//! Completion and search backends.
//!
//! The engine talks to external services only through the
//! [`CompletionBackend`] and [`SearchBackend`] traits. Backends are built once
//! from configuration and shared as `Arc<dyn ...>`; tests inject the scripted
//! fakes instead.

pub(crate) mod http_client;
mod openai_backend;
mod perplexity_backend;
mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod fake;

use std::sync::Arc;

use cotflow_config::Config;

pub use cotflow_utils::error::LlmError;
pub use openai_backend::OpenAiCompatibleBackend;
pub use perplexity_backend::PerplexitySearchBackend;
pub use types::{
    CompletionBackend, CompletionRequest, CompletionResponse, Message, Role, SearchBackend,
    SearchRequest, SearchResponse, TokenUsage,
};

/// Build the completion backend described by `[llm.completion]`.
///
/// # Errors
///
/// Returns `LlmError::Misconfiguration` if the API key is missing or the HTTP
/// client cannot be constructed.
pub fn completion_backend_from_config(
    config: &Config,
) -> Result<Arc<dyn CompletionBackend>, LlmError> {
    let timeout = config.dispatch_settings().call_timeout;
    let backend = OpenAiCompatibleBackend::from_settings(&config.completion_settings(), timeout)?;
    Ok(Arc::new(backend))
}

/// Build the search backend described by `[llm.search]`.
///
/// # Errors
///
/// Returns `LlmError::Misconfiguration` if the API key is missing or the HTTP
/// client cannot be constructed.
pub fn search_backend_from_config(config: &Config) -> Result<Arc<dyn SearchBackend>, LlmError> {
    let timeout = config.dispatch_settings().call_timeout;
    let backend = PerplexitySearchBackend::from_settings(&config.search_settings(), timeout)?;
    Ok(Arc::new(backend))
}
