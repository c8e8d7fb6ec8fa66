use cotflow_utils::error::ConfigError;

use super::Config;

impl Config {
    /// Reject values the dispatcher or backends cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] naming the first offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let d = &self.dispatcher;

        if d.max_concurrency == Some(0) {
            return Err(invalid("max_concurrency", "must be at least 1"));
        }
        if d.max_attempts == Some(0) {
            return Err(invalid("max_attempts", "must be at least 1"));
        }
        if d.call_timeout_secs == Some(0) {
            return Err(invalid("call_timeout_secs", "must be at least 1"));
        }
        if let Some(m) = d.backoff_multiplier
            && !(m >= 1.0 && m.is_finite())
        {
            return Err(invalid("backoff_multiplier", "must be a finite number >= 1.0"));
        }
        if let (Some(initial), Some(max)) = (d.initial_backoff_ms, d.max_backoff_ms)
            && initial > max
        {
            return Err(invalid(
                "initial_backoff_ms",
                &format!("{initial} exceeds max_backoff_ms {max}"),
            ));
        }
        if self.defaults.lease_ttl_secs == Some(0) {
            return Err(invalid("lease_ttl_secs", "must be at least 1"));
        }

        if let Some(completion) = &self.llm.completion {
            if let Some(t) = completion.temperature
                && !(0.0..=2.0).contains(&t)
            {
                return Err(invalid("temperature", &t.to_string()));
            }
            if completion.max_tokens == Some(0) {
                return Err(invalid("max_tokens", "must be at least 1"));
            }
            check_url("completion_base_url", completion.base_url.as_deref())?;
        }
        if let Some(search) = &self.llm.search {
            check_url("search_base_url", search.base_url.as_deref())?;
        }

        Ok(())
    }
}

fn check_url(key: &str, url: Option<&str>) -> Result<(), ConfigError> {
    match url {
        Some(u) if !(u.starts_with("https://") || u.starts_with("http://")) => {
            Err(invalid(key, &format!("'{u}' is not an http(s) URL")))
        }
        _ => Ok(()),
    }
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}
