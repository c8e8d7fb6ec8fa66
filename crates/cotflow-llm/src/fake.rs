//! Scripted in-process backends for tests.
//!
//! Rules match on a substring of the prompt (the last user message for
//! completions, the query for searches). Each rule holds a queue of replies;
//! the last reply repeats once the queue drains, so `[Err, Ok]` fails the
//! first call and succeeds on every retry after it.

use async_trait::async_trait;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use cotflow_utils::error::LlmError;

use crate::types::{
    CompletionBackend, CompletionRequest, CompletionResponse, SearchBackend, SearchRequest,
    SearchResponse, TokenUsage,
};

type Reply = Result<String, LlmError>;

struct Rule {
    needle: String,
    replies: Vec<Reply>,
    served: usize,
}

impl Rule {
    fn next_reply(&mut self) -> Reply {
        let idx = self.served.min(self.replies.len().saturating_sub(1));
        self.served += 1;
        self.replies
            .get(idx)
            .cloned()
            .unwrap_or_else(|| Ok(String::new()))
    }
}

/// Shared matching and bookkeeping for both fakes.
struct Script {
    rules: Mutex<Vec<Rule>>,
    default_reply: Mutex<Reply>,
    calls: Mutex<Vec<String>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Script {
    fn new(default_reply: Reply) -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            default_reply: Mutex::new(default_reply),
            calls: Mutex::new(Vec::new()),
            delay: None,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    fn push_rule(&self, needle: &str, replies: Vec<Reply>) {
        if let Ok(mut rules) = self.rules.lock() {
            rules.push(Rule {
                needle: needle.to_string(),
                replies,
                served: 0,
            });
        }
    }

    async fn respond(&self, prompt: &str) -> Reply {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(prompt.to_string());
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let reply = self.pick(prompt);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        reply
    }

    fn pick(&self, prompt: &str) -> Reply {
        if let Ok(mut rules) = self.rules.lock()
            && let Some(rule) = rules.iter_mut().find(|r| prompt.contains(&r.needle))
        {
            return rule.next_reply();
        }
        self.default_reply
            .lock()
            .map(|r| r.clone())
            .unwrap_or_else(|_| Ok(String::new()))
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

/// Completion backend driven by a script of replies.
pub struct ScriptedCompletion {
    script: Script,
}

impl ScriptedCompletion {
    /// Every unmatched prompt answers `default_text`.
    #[must_use]
    pub fn new(default_text: impl Into<String>) -> Self {
        Self {
            script: Script::new(Ok(default_text.into())),
        }
    }

    /// Prompts containing `needle` answer `text`.
    #[must_use]
    pub fn on(self, needle: &str, text: impl Into<String>) -> Self {
        self.script.push_rule(needle, vec![Ok(text.into())]);
        self
    }

    /// Prompts containing `needle` answer each reply in turn, repeating the last.
    #[must_use]
    pub fn on_sequence(self, needle: &str, replies: Vec<Result<String, LlmError>>) -> Self {
        self.script.push_rule(needle, replies);
        self
    }

    /// Unmatched prompts fail with `error`.
    #[must_use]
    pub fn failing_by_default(self, error: LlmError) -> Self {
        if let Ok(mut d) = self.script.default_reply.lock() {
            *d = Err(error);
        }
        self
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.script.delay = Some(delay);
        self
    }

    /// Prompts seen so far, in call order.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.script.calls()
    }

    /// Highest number of calls that were in flight at once.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.script.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionBackend for ScriptedCompletion {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let prompt = request.last_user_content().unwrap_or_default().to_string();
        let text = self.script.respond(&prompt).await?;
        Ok(CompletionResponse {
            usage: Some(TokenUsage {
                input: prompt.len() as u64,
                output: text.len() as u64,
            }),
            text,
            provider: self.name().to_string(),
            model_used: request.model.unwrap_or_else(|| "scripted-model".to_string()),
        })
    }
}

/// Search backend driven by a script of answers.
pub struct ScriptedSearch {
    script: Script,
}

impl ScriptedSearch {
    #[must_use]
    pub fn new(default_answer: impl Into<String>) -> Self {
        Self {
            script: Script::new(Ok(default_answer.into())),
        }
    }

    #[must_use]
    pub fn on(self, needle: &str, answer: impl Into<String>) -> Self {
        self.script.push_rule(needle, vec![Ok(answer.into())]);
        self
    }

    #[must_use]
    pub fn on_sequence(self, needle: &str, replies: Vec<Result<String, LlmError>>) -> Self {
        self.script.push_rule(needle, replies);
        self
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.script.delay = Some(delay);
        self
    }

    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.script.calls()
    }

    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.script.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SearchBackend for ScriptedSearch {
    fn name(&self) -> &str {
        "scripted-search"
    }

    async fn search(&self, request: SearchRequest) -> Result<SearchResponse, LlmError> {
        let answer = self.script.respond(&request.query).await?;
        Ok(SearchResponse {
            answer,
            citations: vec![format!("https://search.invalid/{}", request.query.len())],
            usage: None,
            provider: self.name().to_string(),
            model_used: "scripted-search".to_string(),
        })
    }
}
