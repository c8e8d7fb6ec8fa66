use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use super::Config;

/// Where a configuration value came from, highest precedence first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Command-line flag
    Cli,
    /// Environment variable
    Env,
    /// `config.toml` at the given path
    ConfigFile(PathBuf),
    /// `Config::builder()`
    Programmatic,
    /// Built-in default
    Default,
}

impl ConfigSource {
    /// Stable short label used in `cotflow config` output.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Cli => "cli",
            Self::Env => "env",
            Self::ConfigFile(_) => "config",
            Self::Programmatic => "programmatic",
            Self::Default => "default",
        }
    }
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfigFile(path) => write!(f, "config ({})", path.display()),
            other => f.write_str(other.label()),
        }
    }
}

impl Config {
    /// Effective configuration as `key -> (value, source label)`.
    #[must_use]
    pub fn effective_config(&self) -> BTreeMap<String, (String, String)> {
        let mut out = BTreeMap::new();
        let mut add = |key: &str, value: String| {
            let source = self
                .source_attribution
                .get(key)
                .unwrap_or(&ConfigSource::Default)
                .label()
                .to_string();
            out.insert(key.to_string(), (value, source));
        };

        let dispatch = self.dispatch_settings();
        let completion = self.completion_settings();
        let search = self.search_settings();

        add("state_dir", self.state_dir().to_string());
        if let Some(pipeline) = self.pipeline_path() {
            add("pipeline", pipeline.to_string());
        }
        add("verbose", self.verbose().to_string());
        add("lease_ttl_secs", self.lease_ttl().as_secs().to_string());
        add("max_concurrency", dispatch.max_concurrency.to_string());
        add("max_attempts", dispatch.max_attempts.to_string());
        add(
            "initial_backoff_ms",
            dispatch.initial_backoff.as_millis().to_string(),
        );
        add("max_backoff_ms", dispatch.max_backoff.as_millis().to_string());
        add(
            "backoff_multiplier",
            dispatch.backoff_multiplier.to_string(),
        );
        add(
            "call_timeout_secs",
            dispatch.call_timeout.as_secs().to_string(),
        );
        add("completion_base_url", completion.base_url);
        add("completion_api_key_env", completion.api_key_env);
        add("completion_model", completion.model);
        add("search_base_url", search.base_url);
        add("search_api_key_env", search.api_key_env);
        add("search_model", search.model);

        out
    }
}
