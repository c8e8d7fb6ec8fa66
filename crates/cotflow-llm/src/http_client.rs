//! Shared HTTP client for the HTTP-based backends.
//!
//! One `reqwest::Client` is built per backend at startup and reused for every
//! call. This layer maps HTTP failures onto [`LlmError`] but does not retry:
//! retry with backoff belongs to the task dispatcher, which sees every
//! attempt and records it on the task row.

use cotflow_utils::error::LlmError;
use cotflow_utils::redaction::redact_secrets;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Upper bound for any single request
const DEFAULT_MAX_HTTP_TIMEOUT: Duration = Duration::from_secs(300);

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub(crate) struct HttpClient {
    client: Arc<Client>,
    max_timeout: Duration,
}

impl HttpClient {
    /// # Errors
    ///
    /// Returns `LlmError::Misconfiguration` if the client cannot be constructed
    pub fn new() -> Result<Self, LlmError> {
        let client = Client::builder()
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| {
                LlmError::Misconfiguration(format!("Failed to build HTTP client: {e}"))
            })?;

        Ok(Self {
            client: Arc::new(client),
            max_timeout: DEFAULT_MAX_HTTP_TIMEOUT,
        })
    }

    pub fn post(&self, url: &str) -> RequestBuilder {
        self.client.post(url)
    }

    /// Send a request once with `min(request_timeout, max_timeout)`.
    ///
    /// # Errors
    ///
    /// - `ProviderAuth` for 401/403
    /// - `ProviderQuota` for 429
    /// - `ProviderOutage` for 5xx
    /// - `Timeout` when the deadline passes
    /// - `Transport` for connection failures
    /// - `Misconfiguration` for other 4xx, which retrying cannot fix
    pub async fn send(
        &self,
        request_builder: RequestBuilder,
        request_timeout: Duration,
        provider_name: &str,
    ) -> Result<Response, LlmError> {
        let effective_timeout = request_timeout.min(self.max_timeout);

        let request = request_builder
            .timeout(effective_timeout)
            .build()
            .map_err(|e| LlmError::Transport(format!("Failed to build request: {e}")))?;

        debug!(
            provider = provider_name,
            timeout_secs = effective_timeout.as_secs(),
            "Executing HTTP request"
        );

        match self.client.execute(request).await {
            Ok(response) => {
                let status = response.status();
                if status.is_client_error() {
                    return Err(map_client_error(status, provider_name));
                }
                if status.is_server_error() {
                    return Err(LlmError::ProviderOutage(format!(
                        "{provider_name} returned server error: {status}"
                    )));
                }
                Ok(response)
            }
            Err(e) if e.is_timeout() => Err(LlmError::Timeout {
                duration: effective_timeout,
            }),
            Err(e) => Err(LlmError::Transport(format!(
                "{provider_name} request failed: {}",
                redact_secrets(&e.to_string())
            ))),
        }
    }
}

/// Map HTTP client error status codes to `LlmError` variants
fn map_client_error(status: StatusCode, provider_name: &str) -> LlmError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            LlmError::ProviderAuth(format!("{provider_name} authentication failed: {status}"))
        }
        StatusCode::TOO_MANY_REQUESTS => {
            LlmError::ProviderQuota(format!("{provider_name} rate limit exceeded: {status}"))
        }
        StatusCode::REQUEST_TIMEOUT => LlmError::Timeout {
            duration: Duration::ZERO,
        },
        _ => LlmError::Misconfiguration(format!("{provider_name} rejected request: {status}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_client_construction() {
        assert!(HttpClient::new().is_ok());
    }

    #[test]
    fn test_map_client_error_auth() {
        let err = map_client_error(StatusCode::UNAUTHORIZED, "completion");
        assert!(matches!(err, LlmError::ProviderAuth(_)));
        assert!(!err.is_transient());
        let err = map_client_error(StatusCode::FORBIDDEN, "completion");
        assert!(matches!(err, LlmError::ProviderAuth(_)));
    }

    #[test]
    fn test_map_client_error_quota_is_transient() {
        let err = map_client_error(StatusCode::TOO_MANY_REQUESTS, "search");
        assert!(matches!(err, LlmError::ProviderQuota(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn test_map_client_error_other() {
        let err = map_client_error(StatusCode::BAD_REQUEST, "search");
        assert!(matches!(err, LlmError::Misconfiguration(ref m) if m.contains("400")));
        assert!(!err.is_transient());
    }
}
