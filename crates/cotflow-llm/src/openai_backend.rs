//! OpenAI-compatible chat completions backend.
//!
//! Works with any endpoint that speaks the `/chat/completions` protocol
//! (OpenRouter, OpenAI, local gateways). `structured_output` maps to
//! `response_format: {"type": "json_object"}`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use cotflow_config::CompletionSettings;
use cotflow_utils::error::LlmError;

use crate::http_client::HttpClient;
use crate::types::{
    CompletionBackend, CompletionRequest, CompletionResponse, Message, TokenUsage,
};

const DEFAULT_MAX_TOKENS: u32 = 2048;
const DEFAULT_TEMPERATURE: f32 = 0.7;

/// HTTP request parameters resolved for one call
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct HttpParams {
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for HttpParams {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
        }
    }
}

pub struct OpenAiCompatibleBackend {
    client: HttpClient,
    endpoint: String,
    api_key: String,
    default_model: String,
    default_params: HttpParams,
    timeout: Duration,
}

impl OpenAiCompatibleBackend {
    /// # Errors
    ///
    /// Returns `LlmError::Misconfiguration` if the HTTP client cannot be constructed
    pub fn new(
        api_key: String,
        base_url: &str,
        default_model: String,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        Ok(Self {
            client: HttpClient::new()?,
            endpoint: chat_endpoint(base_url),
            api_key,
            default_model,
            default_params: HttpParams::default(),
            timeout,
        })
    }

    /// Build from resolved settings, reading the API key from the environment.
    ///
    /// # Errors
    ///
    /// Returns `LlmError::Misconfiguration` if the API key variable is unset
    /// or empty, or the HTTP client cannot be constructed.
    pub fn from_settings(
        settings: &CompletionSettings,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        let api_key = api_key_from_env(&settings.api_key_env, "[llm.completion]")?;
        let mut backend =
            Self::new(api_key, &settings.base_url, settings.model.clone(), timeout)?;
        if let Some(t) = settings.temperature {
            backend.default_params.temperature = t;
        }
        if let Some(m) = settings.max_tokens {
            backend.default_params.max_tokens = m;
        }
        Ok(backend)
    }

    /// Request values win over backend defaults.
    fn resolve_params(&self, request: &CompletionRequest) -> (String, HttpParams) {
        let model = request
            .model
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| self.default_model.clone());
        let params = HttpParams {
            max_tokens: request.max_tokens.unwrap_or(self.default_params.max_tokens),
            temperature: request.temperature.unwrap_or(self.default_params.temperature),
        };
        (model, params)
    }
}

#[async_trait]
impl CompletionBackend for OpenAiCompatibleBackend {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let (model, params) = self.resolve_params(&request);

        debug!(
            provider = self.name(),
            model = %model,
            max_tokens = params.max_tokens,
            temperature = params.temperature,
            structured = request.structured_output,
            "Invoking completion backend"
        );

        let body = ChatRequest {
            model: model.clone(),
            messages: &request.messages,
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            stream: false,
            response_format: request
                .structured_output
                .then_some(ResponseFormat { kind: "json_object" }),
        };

        let builder = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .header("X-Title", "cotflow")
            .json(&body);

        let response = self.client.send(builder, self.timeout, self.name()).await?;
        let parsed: ChatResponse = response.json().await.map_err(|e| {
            LlmError::Transport(format!("Failed to parse completion response: {e}"))
        })?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| {
                LlmError::Transport("Completion response has no message content".into())
            })?;

        let usage = parsed.usage.map(|u| TokenUsage {
            input: u.prompt_tokens,
            output: u.completion_tokens,
        });

        debug!(provider = self.name(), usage = ?usage, "Completion finished");

        Ok(CompletionResponse {
            text,
            usage,
            provider: self.name().to_string(),
            model_used: parsed.model.unwrap_or(model),
        })
    }
}

/// `<base>/chat/completions`, tolerating a base that already includes it.
pub(crate) fn chat_endpoint(base_url: &str) -> String {
    let trimmed = base_url.trim_end_matches('/');
    if trimmed.ends_with("/chat/completions") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/chat/completions")
    }
}

pub(crate) fn api_key_from_env(var: &str, section: &str) -> Result<String, LlmError> {
    match std::env::var(var) {
        Ok(key) if !key.trim().is_empty() => Ok(key),
        _ => Err(LlmError::Misconfiguration(format!(
            "API key not found in environment variable '{var}'. \
             Set it or configure a different api_key_env in {section}."
        ))),
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: String,
    messages: &'a [Message],
    max_tokens: u32,
    temperature: f32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatResponse {
    pub choices: Vec<Choice>,
    pub usage: Option<Usage>,
    pub model: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Choice {
    pub message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ResponseMessage {
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}
