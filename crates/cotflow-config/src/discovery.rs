use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

use cotflow_utils::error::ConfigError;

use super::{CliArgs, Config, ConfigSource, Defaults, DispatcherConfig, LlmConfig};

/// Environment variable overriding the completion model
pub const COTFLOW_MODEL_ENV: &str = "COTFLOW_MODEL";

/// TOML configuration file structure
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlConfig {
    defaults: Option<Defaults>,
    dispatcher: Option<DispatcherConfig>,
    llm: Option<LlmConfig>,
}

impl Config {
    /// Discover and load configuration with precedence: CLI > env > file > defaults
    ///
    /// Uses the current working directory for config file discovery when no
    /// explicit path is provided in `cli_args`.
    pub fn discover(cli_args: &CliArgs) -> Result<Self> {
        let start_dir = env::current_dir().context("Failed to get current directory")?;
        Self::discover_from(&start_dir, cli_args)
    }

    /// Discover and load configuration starting from a specific directory.
    ///
    /// This is the path-driven variant used by tests to avoid process-global state.
    pub fn discover_from(start_dir: &Path, cli_args: &CliArgs) -> Result<Self> {
        let mut source_attribution = HashMap::new();
        let mut defaults = Defaults::default();
        let mut dispatcher = DispatcherConfig::default();
        let mut llm = LlmConfig::default();

        let config_path = match &cli_args.config_path {
            Some(explicit) => {
                if !explicit.exists() {
                    return Err(ConfigError::NotFound {
                        path: explicit.display().to_string(),
                    }
                    .into());
                }
                Some(explicit.clone())
            }
            None => Self::discover_config_file_from(start_dir)?,
        };

        let mut base_dir = utf8(start_dir)?;

        if let Some(path) = &config_path {
            let file_config = Self::load_config_file(path)
                .with_context(|| format!("Failed to load config file: {}", path.display()))?;
            let mut layer = Layer {
                source: ConfigSource::ConfigFile(path.clone()),
                attribution: &mut source_attribution,
            };

            // `<root>/.cotflow/config.toml` anchors relative paths at `<root>`
            if let Some(root) = path
                .parent()
                .filter(|dir| dir.file_name().is_some_and(|n| n == ".cotflow"))
                .and_then(Path::parent)
                .or_else(|| path.parent())
            {
                base_dir = utf8(root)?;
            }

            if let Some(d) = file_config.defaults {
                layer.apply(&mut defaults.state_dir, d.state_dir, "state_dir");
                layer.apply(&mut defaults.pipeline, d.pipeline, "pipeline");
                layer.apply(&mut defaults.verbose, d.verbose, "verbose");
                layer.apply(&mut defaults.lease_ttl_secs, d.lease_ttl_secs, "lease_ttl_secs");
            }

            if let Some(d) = file_config.dispatcher {
                layer.apply(
                    &mut dispatcher.max_concurrency,
                    d.max_concurrency,
                    "max_concurrency",
                );
                layer.apply(&mut dispatcher.max_attempts, d.max_attempts, "max_attempts");
                layer.apply(
                    &mut dispatcher.initial_backoff_ms,
                    d.initial_backoff_ms,
                    "initial_backoff_ms",
                );
                layer.apply(
                    &mut dispatcher.max_backoff_ms,
                    d.max_backoff_ms,
                    "max_backoff_ms",
                );
                layer.apply(
                    &mut dispatcher.backoff_multiplier,
                    d.backoff_multiplier,
                    "backoff_multiplier",
                );
                layer.apply(
                    &mut dispatcher.call_timeout_secs,
                    d.call_timeout_secs,
                    "call_timeout_secs",
                );
            }

            if let Some(file_llm) = file_config.llm {
                if let Some(completion) = file_llm.completion {
                    layer.mark("completion_base_url", completion.base_url.is_some());
                    layer.mark("completion_api_key_env", completion.api_key_env.is_some());
                    layer.mark("completion_model", completion.model.is_some());
                    llm.completion = Some(completion);
                }
                if let Some(search) = file_llm.search {
                    layer.mark("search_base_url", search.base_url.is_some());
                    layer.mark("search_api_key_env", search.api_key_env.is_some());
                    layer.mark("search_model", search.model.is_some());
                    llm.search = Some(search);
                }
            }
        }

        // Environment overrides the file
        if let Ok(model) = env::var(COTFLOW_MODEL_ENV)
            && !model.is_empty()
        {
            llm.completion.get_or_insert_with(Default::default).model = Some(model);
            source_attribution.insert("completion_model".to_string(), ConfigSource::Env);
        }
        if env::var(super::COTFLOW_HOME_ENV).is_ok_and(|v| !v.is_empty()) {
            source_attribution.insert("state_dir".to_string(), ConfigSource::Env);
        }

        // CLI overrides everything
        let mut layer = Layer {
            source: ConfigSource::Cli,
            attribution: &mut source_attribution,
        };
        layer.apply(&mut defaults.state_dir, cli_args.state_dir.clone(), "state_dir");
        layer.apply(&mut defaults.pipeline, cli_args.pipeline.clone(), "pipeline");
        layer.apply(&mut defaults.verbose, cli_args.verbose, "verbose");
        layer.apply(
            &mut dispatcher.max_concurrency,
            cli_args.max_concurrency,
            "max_concurrency",
        );
        layer.apply(&mut dispatcher.max_attempts, cli_args.max_attempts, "max_attempts");
        layer.apply(
            &mut dispatcher.call_timeout_secs,
            cli_args.call_timeout_secs,
            "call_timeout_secs",
        );
        if let Some(model) = &cli_args.model {
            llm.completion.get_or_insert_with(Default::default).model = Some(model.clone());
            layer.mark("completion_model", true);
        }

        let config = Self {
            defaults,
            dispatcher,
            llm,
            source_attribution,
            base_dir,
        };

        config.validate()?;

        Ok(config)
    }

    /// Discover config file by searching upward from a given directory.
    ///
    /// Walks up the directory tree looking for `.cotflow/config.toml`, stopping
    /// at repository root markers (.git, .hg, .svn) or the filesystem root.
    pub fn discover_config_file_from(start_dir: &Path) -> Result<Option<PathBuf>> {
        let mut current_dir = start_dir.to_path_buf();

        loop {
            let config_path = current_dir.join(".cotflow").join("config.toml");
            if config_path.exists() {
                return Ok(Some(config_path));
            }

            if current_dir.join(".git").exists()
                || current_dir.join(".hg").exists()
                || current_dir.join(".svn").exists()
            {
                break;
            }

            match current_dir.parent() {
                Some(parent) => current_dir = parent.to_path_buf(),
                None => break,
            }
        }

        Ok(None)
    }

    fn load_config_file(path: &Path) -> Result<TomlConfig> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: TomlConfig = toml::from_str(&content)
            .map_err(|e| ConfigError::InvalidFile(format!("{}: {e}", path.display())))?;
        Ok(config)
    }

    /// Discover configuration without any CLI overrides.
    pub fn discover_from_env_and_fs() -> Result<Self> {
        Self::discover(&CliArgs::default())
    }
}

/// One precedence layer being folded into the configuration.
struct Layer<'a> {
    source: ConfigSource,
    attribution: &'a mut HashMap<String, ConfigSource>,
}

impl Layer<'_> {
    fn apply<T>(&mut self, target: &mut Option<T>, value: Option<T>, key: &str) {
        if let Some(v) = value {
            *target = Some(v);
            self.mark(key, true);
        }
    }

    fn mark(&mut self, key: &str, present: bool) {
        if present {
            self.attribution.insert(key.to_string(), self.source.clone());
        }
    }
}

fn utf8(path: &Path) -> Result<Utf8PathBuf> {
    Utf8PathBuf::from_path_buf(path.to_path_buf()).map_err(|p| {
        ConfigError::DiscoveryFailed {
            reason: format!("path is not valid UTF-8: {}", p.display()),
        }
        .into()
    })
}
