//! Orchestrator façade for external consumers.
//!
//! The CLI builds one `OrchestratorHandle` per process. The handle owns the
//! configured store, pipeline and backends, and hands out the orchestrator,
//! the debug harness and the driver that share them.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use cotflow_config::{CliArgs, Config};
//! use cotflow_engine::orchestrator::OrchestratorHandle;
//! use serde_json::Map;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::discover(&CliArgs::default())?;
//!     let handle = OrchestratorHandle::from_config(config)?;
//!     let session = handle.orchestrator().create_session(Map::new(), None).await?;
//!     let report = handle.driver().run_session(&session.id).await?;
//!     println!("{:?}", report.outcome);
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use std::sync::Arc;

use cotflow_config::Config;
use cotflow_llm::{
    CompletionBackend, CompletionRequest, CompletionResponse, SearchBackend, SearchRequest,
    SearchResponse, completion_backend_from_config, search_backend_from_config,
};
use cotflow_store::{JsonFileStore, Store};
use cotflow_strategy::StrategyRegistry;
use cotflow_utils::error::{CotflowError, LlmError};

use super::Orchestrator;
use crate::debug::Debugger;
use crate::dispatcher::Dispatcher;
use crate::driver::Driver;

/// Configured orchestrator plus the pieces built around it.
pub struct OrchestratorHandle {
    orchestrator: Orchestrator,
    config: Config,
}

impl OrchestratorHandle {
    /// Build the handle with HTTP backends from `[llm.*]`.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - the state directory cannot be opened
    /// - the pipeline file fails to load or validate
    /// - an API key named by `api_key_env` is not set
    pub fn from_config(config: Config) -> Result<Self, CotflowError> {
        let completion = completion_backend_from_config(&config)?;
        let search = search_backend_from_config(&config)?;
        Self::with_backends(config, completion, search)
    }

    /// Build the handle without backends, for commands that never call one
    /// (create, status, list, cancel, resume, dry runs).
    ///
    /// Any backend call made through this handle fails as misconfigured.
    ///
    /// # Errors
    ///
    /// As [`OrchestratorHandle::from_config`], minus the API key checks.
    pub fn offline(config: Config) -> Result<Self, CotflowError> {
        let unavailable = Arc::new(Unavailable);
        Self::with_backends(config, unavailable.clone(), unavailable)
    }

    /// Build the handle around injected backends.
    ///
    /// # Errors
    ///
    /// Returns error if the state directory or pipeline file cannot be loaded.
    pub fn with_backends(
        config: Config,
        completion: Arc<dyn CompletionBackend>,
        search: Arc<dyn SearchBackend>,
    ) -> Result<Self, CotflowError> {
        let store: Arc<dyn Store> = Arc::new(JsonFileStore::open(config.state_dir())?);
        let registry = match config.pipeline_path() {
            Some(path) => StrategyRegistry::load(&path)?,
            None => StrategyRegistry::builtin(),
        };
        let dispatcher = Dispatcher::new(store, completion, search, config.dispatch_settings());
        let orchestrator = Orchestrator::new(Arc::new(registry), dispatcher, config.lease_ttl());
        Ok(Self {
            orchestrator,
            config,
        })
    }

    #[must_use]
    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn debugger(&self) -> Debugger {
        Debugger::new(self.orchestrator.clone())
    }

    #[must_use]
    pub fn driver(&self) -> Driver {
        Driver::new(self.orchestrator.clone())
    }

    /// Wait for every queued task to finish before the process exits.
    pub async fn shutdown(&self) {
        self.orchestrator.dispatcher().wait_idle().await;
    }
}

/// Stand-in backend for handles built with [`OrchestratorHandle::offline`].
struct Unavailable;

impl Unavailable {
    fn error() -> LlmError {
        LlmError::Misconfiguration("no backend configured for this command".to_string())
    }
}

#[async_trait]
impl CompletionBackend for Unavailable {
    fn name(&self) -> &str {
        "unavailable"
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        Err(Self::error())
    }
}

#[async_trait]
impl SearchBackend for Unavailable {
    fn name(&self) -> &str {
        "unavailable"
    }

    async fn search(&self, _request: SearchRequest) -> Result<SearchResponse, LlmError> {
        Err(Self::error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use cotflow_utils::test_support::TempStateDir;
    use serde_json::Map;

    #[tokio::test]
    async fn test_offline_handle_manages_sessions() {
        let dir = TempStateDir::new();
        let config = Config::minimal_for_testing(&dir.path);
        let handle = OrchestratorHandle::offline(config).unwrap();

        let created = handle
            .orchestrator()
            .create_session(Map::new(), None)
            .await
            .unwrap();
        let listed = handle.orchestrator().list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, created.id);
        assert_eq!(handle.orchestrator().registry().phase_count(), 3);
    }

    #[tokio::test]
    async fn test_pipeline_file_is_loaded() {
        let dir = TempStateDir::new();
        let pipeline: Utf8PathBuf = dir.path.join("pipeline.toml");
        std::fs::write(
            &pipeline,
            "[[phases]]\nphase = 1\n[phases.think]\nprompt = \"t\"\n[phases.integrate]\nprompt = \"i\"\n",
        )
        .unwrap();

        let mut config = Config::minimal_for_testing(&dir.path);
        config.defaults.pipeline = Some(pipeline.to_string());
        let handle = OrchestratorHandle::offline(config).unwrap();
        assert_eq!(handle.orchestrator().registry().phase_count(), 1);
    }
}
