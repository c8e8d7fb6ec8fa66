use camino::Utf8PathBuf;
use std::collections::HashMap;

use cotflow_utils::error::ConfigError;

use super::{
    CompletionProviderConfig, Config, ConfigSource, Defaults, DispatcherConfig, LlmConfig,
    SearchProviderConfig,
};

impl Config {
    /// Create a builder for programmatic configuration.
    ///
    /// ```rust
    /// use cotflow_config::Config;
    ///
    /// let config = Config::builder()
    ///     .base_dir("/srv/pipelines")
    ///     .max_concurrency(8)
    ///     .completion_model("openai/gpt-4o")
    ///     .build()
    ///     .expect("valid config");
    /// assert_eq!(config.dispatch_settings().max_concurrency, 8);
    /// ```
    #[must_use]
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }
}

/// Fluent construction of a [`Config`] without files or environment.
///
/// All values set via the builder are attributed to
/// [`ConfigSource::Programmatic`].
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    base_dir: Option<Utf8PathBuf>,
    defaults: Defaults,
    dispatcher: DispatcherConfig,
    completion: Option<CompletionProviderConfig>,
    search: Option<SearchProviderConfig>,
    touched: Vec<&'static str>,
}

impl ConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory that anchors relative paths. Defaults to `.`.
    #[must_use]
    pub fn base_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.base_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn state_dir(mut self, dir: impl Into<String>) -> Self {
        self.defaults.state_dir = Some(dir.into());
        self.touched.push("state_dir");
        self
    }

    #[must_use]
    pub fn pipeline(mut self, path: impl Into<String>) -> Self {
        self.defaults.pipeline = Some(path.into());
        self.touched.push("pipeline");
        self
    }

    #[must_use]
    pub fn lease_ttl_secs(mut self, secs: u64) -> Self {
        self.defaults.lease_ttl_secs = Some(secs);
        self.touched.push("lease_ttl_secs");
        self
    }

    #[must_use]
    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.dispatcher.max_concurrency = Some(n);
        self.touched.push("max_concurrency");
        self
    }

    #[must_use]
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.dispatcher.max_attempts = Some(n);
        self.touched.push("max_attempts");
        self
    }

    /// Backoff bounds in milliseconds.
    #[must_use]
    pub fn backoff_ms(mut self, initial: u64, max: u64) -> Self {
        self.dispatcher.initial_backoff_ms = Some(initial);
        self.dispatcher.max_backoff_ms = Some(max);
        self.touched.push("initial_backoff_ms");
        self.touched.push("max_backoff_ms");
        self
    }

    #[must_use]
    pub fn call_timeout_secs(mut self, secs: u64) -> Self {
        self.dispatcher.call_timeout_secs = Some(secs);
        self.touched.push("call_timeout_secs");
        self
    }

    #[must_use]
    pub fn completion_model(mut self, model: impl Into<String>) -> Self {
        self.completion.get_or_insert_with(Default::default).model = Some(model.into());
        self.touched.push("completion_model");
        self
    }

    #[must_use]
    pub fn completion_endpoint(
        mut self,
        base_url: impl Into<String>,
        api_key_env: impl Into<String>,
    ) -> Self {
        let c = self.completion.get_or_insert_with(Default::default);
        c.base_url = Some(base_url.into());
        c.api_key_env = Some(api_key_env.into());
        self.touched.push("completion_base_url");
        self.touched.push("completion_api_key_env");
        self
    }

    #[must_use]
    pub fn search_endpoint(
        mut self,
        base_url: impl Into<String>,
        api_key_env: impl Into<String>,
    ) -> Self {
        let s = self.search.get_or_insert_with(Default::default);
        s.base_url = Some(base_url.into());
        s.api_key_env = Some(api_key_env.into());
        self.touched.push("search_base_url");
        self.touched.push("search_api_key_env");
        self
    }

    /// Build and validate.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if validation fails.
    pub fn build(self) -> Result<Config, ConfigError> {
        let source_attribution: HashMap<String, ConfigSource> = self
            .touched
            .iter()
            .map(|key| ((*key).to_string(), ConfigSource::Programmatic))
            .collect();

        let config = Config {
            defaults: self.defaults,
            dispatcher: self.dispatcher,
            llm: LlmConfig {
                completion: self.completion,
                search: self.search,
            },
            source_attribution,
            base_dir: self.base_dir.unwrap_or_else(|| Utf8PathBuf::from(".")),
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_attribution() {
        let config = Config::builder()
            .max_attempts(5)
            .backoff_ms(10, 20)
            .build()
            .unwrap();
        assert_eq!(
            config.source_attribution.get("max_attempts"),
            Some(&ConfigSource::Programmatic)
        );
        assert!(!config.source_attribution.contains_key("max_concurrency"));
        let effective = config.effective_config();
        assert_eq!(
            effective.get("max_attempts"),
            Some(&("5".to_string(), "programmatic".to_string()))
        );
        assert_eq!(
            effective.get("max_concurrency"),
            Some(&("3".to_string(), "default".to_string()))
        );
    }

    #[test]
    fn test_builder_validates() {
        assert!(Config::builder().max_concurrency(0).build().is_err());
    }
}
