//! Perplexity-style search backend.
//!
//! The endpoint speaks chat completions but answers from live web results and
//! returns source URLs in a top-level `citations` array.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use cotflow_config::SearchSettings;
use cotflow_utils::error::LlmError;

use crate::http_client::HttpClient;
use crate::openai_backend::{ChatResponse, api_key_from_env, chat_endpoint};
use crate::types::{Message, SearchBackend, SearchRequest, SearchResponse, TokenUsage};

const DEFAULT_SYSTEM_INSTRUCTION: &str =
    "You are a research assistant. Answer from current web sources and cite them.";
const SEARCH_TEMPERATURE: f32 = 0.2;
const SEARCH_MAX_TOKENS: u32 = 2000;

pub struct PerplexitySearchBackend {
    client: HttpClient,
    endpoint: String,
    api_key: String,
    model: String,
    timeout: Duration,
}

impl PerplexitySearchBackend {
    /// # Errors
    ///
    /// Returns `LlmError::Misconfiguration` if the HTTP client cannot be constructed
    pub fn new(
        api_key: String,
        base_url: &str,
        model: String,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        Ok(Self {
            client: HttpClient::new()?,
            endpoint: chat_endpoint(base_url),
            api_key,
            model,
            timeout,
        })
    }

    /// # Errors
    ///
    /// Returns `LlmError::Misconfiguration` if the API key variable is unset or empty
    pub fn from_settings(settings: &SearchSettings, timeout: Duration) -> Result<Self, LlmError> {
        let api_key = api_key_from_env(&settings.api_key_env, "[llm.search]")?;
        Self::new(api_key, &settings.base_url, settings.model.clone(), timeout)
    }

    fn messages(request: &SearchRequest) -> Vec<Message> {
        let system = request
            .system_instruction
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(DEFAULT_SYSTEM_INSTRUCTION);
        vec![Message::system(system), Message::user(&request.query)]
    }
}

#[async_trait]
impl SearchBackend for PerplexitySearchBackend {
    fn name(&self) -> &str {
        "perplexity"
    }

    async fn search(&self, request: SearchRequest) -> Result<SearchResponse, LlmError> {
        debug!(
            provider = self.name(),
            model = %self.model,
            query_len = request.query.len(),
            "Invoking search backend"
        );

        let messages = Self::messages(&request);
        let body = SearchBody {
            model: &self.model,
            messages: &messages,
            temperature: SEARCH_TEMPERATURE,
            max_tokens: SEARCH_MAX_TOKENS,
            return_citations: true,
        };

        let builder = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body);

        let response = self.client.send(builder, self.timeout, self.name()).await?;
        let parsed: PerplexityResponse = response.json().await.map_err(|e| {
            LlmError::Transport(format!("Failed to parse search response: {e}"))
        })?;

        into_search_response(parsed, self.name(), &self.model)
    }
}

fn into_search_response(
    parsed: PerplexityResponse,
    provider: &str,
    requested_model: &str,
) -> Result<SearchResponse, LlmError> {
    let answer = parsed
        .chat
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| LlmError::Transport("Search response has no message content".into()))?;

    Ok(SearchResponse {
        answer,
        citations: parsed.citations,
        usage: parsed.chat.usage.map(|u| TokenUsage {
            input: u.prompt_tokens,
            output: u.completion_tokens,
        }),
        provider: provider.to_string(),
        model_used: parsed
            .chat
            .model
            .unwrap_or_else(|| requested_model.to_string()),
    })
}

#[derive(Debug, Serialize)]
struct SearchBody<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    max_tokens: u32,
    return_citations: bool,
}

#[derive(Debug, Deserialize)]
struct PerplexityResponse {
    #[serde(flatten)]
    chat: ChatResponse,
    #[serde(default)]
    citations: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_system_instruction_when_blank() {
        let req = SearchRequest {
            query: "rust async".into(),
            system_instruction: Some("  ".into()),
        };
        let messages = PerplexitySearchBackend::messages(&req);
        assert_eq!(messages[0], Message::system(DEFAULT_SYSTEM_INSTRUCTION));
        assert_eq!(messages[1], Message::user("rust async"));
    }

    #[test]
    fn test_parse_response_with_citations() {
        let raw = r#"{
            "model": "sonar",
            "choices": [{"message": {"role": "assistant", "content": "answer"}}],
            "usage": {"prompt_tokens": 5, "completion_tokens": 7},
            "citations": ["https://a.example", "https://b.example"]
        }"#;
        let parsed: PerplexityResponse = serde_json::from_str(raw).unwrap();
        let resp = into_search_response(parsed, "perplexity", "fallback").unwrap();
        assert_eq!(resp.answer, "answer");
        assert_eq!(resp.citations.len(), 2);
        assert_eq!(resp.usage.unwrap().total(), 12);
        assert_eq!(resp.model_used, "sonar");
    }

    #[test]
    fn test_parse_response_without_citations() {
        let raw = r#"{"choices": [{"message": {"content": "x"}}]}"#;
        let parsed: PerplexityResponse = serde_json::from_str(raw).unwrap();
        let resp = into_search_response(parsed, "perplexity", "fallback").unwrap();
        assert!(resp.citations.is_empty());
        assert_eq!(resp.model_used, "fallback");
    }

    #[test]
    fn test_empty_choices_is_error() {
        let raw = r#"{"choices": []}"#;
        let parsed: PerplexityResponse = serde_json::from_str(raw).unwrap();
        let err = into_search_response(parsed, "perplexity", "m").unwrap_err();
        assert!(matches!(err, LlmError::Transport(_)));
    }
}
