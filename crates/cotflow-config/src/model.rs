use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::sources::ConfigSource;

/// Environment variable that overrides the state directory
pub const COTFLOW_HOME_ENV: &str = "COTFLOW_HOME";

pub const DEFAULT_MAX_CONCURRENCY: usize = 3;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 1_000;
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 30_000;
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_LEASE_TTL_SECS: u64 = 300;

pub const DEFAULT_COMPLETION_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_COMPLETION_API_KEY_ENV: &str = "OPENROUTER_API_KEY";
pub const DEFAULT_COMPLETION_MODEL: &str = "openai/gpt-4o-mini";
pub const DEFAULT_SEARCH_BASE_URL: &str = "https://api.perplexity.ai";
pub const DEFAULT_SEARCH_API_KEY_ENV: &str = "PERPLEXITY_API_KEY";
pub const DEFAULT_SEARCH_MODEL: &str = "sonar";

/// Fully resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub defaults: Defaults,
    pub dispatcher: DispatcherConfig,
    pub llm: LlmConfig,
    /// Where each key's effective value came from
    pub source_attribution: HashMap<String, ConfigSource>,
    /// Directory that anchors relative paths (config file root or working dir)
    pub base_dir: Utf8PathBuf,
}

/// `[defaults]` section
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Defaults {
    pub state_dir: Option<String>,
    pub pipeline: Option<String>,
    pub verbose: Option<bool>,
    pub lease_ttl_secs: Option<u64>,
}

/// `[dispatcher]` section
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DispatcherConfig {
    pub max_concurrency: Option<usize>,
    pub max_attempts: Option<u32>,
    pub initial_backoff_ms: Option<u64>,
    pub max_backoff_ms: Option<u64>,
    pub backoff_multiplier: Option<f64>,
    pub call_timeout_secs: Option<u64>,
}

/// `[llm]` section
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LlmConfig {
    pub completion: Option<CompletionProviderConfig>,
    pub search: Option<SearchProviderConfig>,
}

/// `[llm.completion]`: an OpenAI-compatible chat completions endpoint
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CompletionProviderConfig {
    pub base_url: Option<String>,
    pub api_key_env: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// `[llm.search]`: a Perplexity-style search endpoint
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SearchProviderConfig {
    pub base_url: Option<String>,
    pub api_key_env: Option<String>,
    pub model: Option<String>,
}

/// Resolved retry and concurrency settings for the task dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchSettings {
    pub max_concurrency: usize,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    pub call_timeout: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: Duration::from_millis(DEFAULT_INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(DEFAULT_MAX_BACKOFF_MS),
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            call_timeout: Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS),
        }
    }
}

/// Resolved completion endpoint settings.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionSettings {
    pub base_url: String,
    pub api_key_env: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// Resolved search endpoint settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchSettings {
    pub base_url: String,
    pub api_key_env: String,
    pub model: String,
}

impl Config {
    /// Dispatcher settings with defaults applied.
    #[must_use]
    pub fn dispatch_settings(&self) -> DispatchSettings {
        let d = &self.dispatcher;
        DispatchSettings {
            max_concurrency: d.max_concurrency.unwrap_or(DEFAULT_MAX_CONCURRENCY),
            max_attempts: d.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            initial_backoff: Duration::from_millis(
                d.initial_backoff_ms.unwrap_or(DEFAULT_INITIAL_BACKOFF_MS),
            ),
            max_backoff: Duration::from_millis(d.max_backoff_ms.unwrap_or(DEFAULT_MAX_BACKOFF_MS)),
            backoff_multiplier: d.backoff_multiplier.unwrap_or(DEFAULT_BACKOFF_MULTIPLIER),
            call_timeout: Duration::from_secs(
                d.call_timeout_secs.unwrap_or(DEFAULT_CALL_TIMEOUT_SECS),
            ),
        }
    }

    /// Completion endpoint settings with defaults applied.
    #[must_use]
    pub fn completion_settings(&self) -> CompletionSettings {
        let c = self.llm.completion.clone().unwrap_or_default();
        CompletionSettings {
            base_url: c
                .base_url
                .unwrap_or_else(|| DEFAULT_COMPLETION_BASE_URL.to_string()),
            api_key_env: c
                .api_key_env
                .unwrap_or_else(|| DEFAULT_COMPLETION_API_KEY_ENV.to_string()),
            model: c.model.unwrap_or_else(|| DEFAULT_COMPLETION_MODEL.to_string()),
            temperature: c.temperature,
            max_tokens: c.max_tokens,
        }
    }

    /// Search endpoint settings with defaults applied.
    #[must_use]
    pub fn search_settings(&self) -> SearchSettings {
        let s = self.llm.search.clone().unwrap_or_default();
        SearchSettings {
            base_url: s
                .base_url
                .unwrap_or_else(|| DEFAULT_SEARCH_BASE_URL.to_string()),
            api_key_env: s
                .api_key_env
                .unwrap_or_else(|| DEFAULT_SEARCH_API_KEY_ENV.to_string()),
            model: s.model.unwrap_or_else(|| DEFAULT_SEARCH_MODEL.to_string()),
        }
    }

    /// How long a session claim stays valid before it is considered stale.
    #[must_use]
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.defaults.lease_ttl_secs.unwrap_or(DEFAULT_LEASE_TTL_SECS))
    }

    #[must_use]
    pub fn verbose(&self) -> bool {
        self.defaults.verbose.unwrap_or(false)
    }

    /// State directory.
    ///
    /// Precedence: `COTFLOW_HOME` > `[defaults] state_dir` (relative paths are
    /// anchored at [`Config::base_dir`]) > `<base_dir>/.cotflow/state`.
    #[must_use]
    pub fn state_dir(&self) -> Utf8PathBuf {
        if let Ok(home) = std::env::var(COTFLOW_HOME_ENV)
            && !home.is_empty()
        {
            return Utf8PathBuf::from(home);
        }
        match &self.defaults.state_dir {
            Some(dir) => self.anchor(dir),
            None => self.base_dir.join(".cotflow").join("state"),
        }
    }

    /// Pipeline definition file, if one is configured.
    #[must_use]
    pub fn pipeline_path(&self) -> Option<Utf8PathBuf> {
        self.defaults.pipeline.as_deref().map(|p| self.anchor(p))
    }

    fn anchor(&self, path: &str) -> Utf8PathBuf {
        let p = Utf8Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.base_dir.join(p)
        }
    }

    /// Minimal configuration rooted at `base_dir`, for tests.
    #[cfg(any(test, feature = "test-utils"))]
    #[must_use]
    pub fn minimal_for_testing(base_dir: &Utf8Path) -> Self {
        Self {
            defaults: Defaults::default(),
            dispatcher: DispatcherConfig::default(),
            llm: LlmConfig::default(),
            source_attribution: HashMap::new(),
            base_dir: base_dir.to_path_buf(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_defaults() {
        let config = Config::minimal_for_testing(Utf8Path::new("/tmp/x"));
        let settings = config.dispatch_settings();
        assert_eq!(settings, DispatchSettings::default());
        assert_eq!(settings.max_concurrency, 3);
        assert_eq!(settings.max_attempts, 3);
    }

    #[test]
    fn test_relative_paths_anchor_at_base_dir() {
        let mut config = Config::minimal_for_testing(Utf8Path::new("/work/project"));
        config.defaults.pipeline = Some("pipes/main.toml".into());
        assert_eq!(
            config.pipeline_path().unwrap(),
            Utf8PathBuf::from("/work/project/pipes/main.toml")
        );
        config.defaults.pipeline = Some("/abs/p.toml".into());
        assert_eq!(config.pipeline_path().unwrap(), Utf8PathBuf::from("/abs/p.toml"));
    }

    #[test]
    fn test_completion_settings_merge_partial_section() {
        let mut config = Config::minimal_for_testing(Utf8Path::new("/w"));
        config.llm.completion = Some(CompletionProviderConfig {
            model: Some("custom/model".into()),
            ..Default::default()
        });
        let s = config.completion_settings();
        assert_eq!(s.model, "custom/model");
        assert_eq!(s.base_url, DEFAULT_COMPLETION_BASE_URL);
    }
}
