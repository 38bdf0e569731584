//! Text generation backends.
//!
//! [`TextGenerator`] is the seam between the pipeline and any chat-style
//! model. Synthetic data generation and the inference gateway each hold one:
//!
//! | Provider | Type | Used for |
//! |----------|------|----------|
//! | `openai` | [`OpenAiCompatible`] | synthesis (OpenAI), inference (vLLM, llama.cpp, TGI, OpenAI) |
//! | `extractive` | [`ExtractiveGenerator`] | offline inference from retrieved context |
//! | `disabled` | [`DisabledGenerator`] | synthesis without a credential |
//!
//! A missing credential never fails construction; it yields a
//! [`DisabledGenerator`] whose [`check_configured`](TextGenerator::check_configured)
//! reports the problem, so the server still starts and the stage that needs
//! the model answers with a clear error.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{InferenceConfig, SynthesisConfig};
use crate::index::tokenize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Overrides the backend's default model.
    pub model: Option<String>,
    pub messages: Vec<Message>,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error: {status}: {body}")]
    Api { status: u16, body: String },
    #[error("failed to parse response: {0}")]
    Parse(String),
    #[error("provider not configured: {0}")]
    NotConfigured(String),
    #[error("model call timed out after {0}s")]
    Timeout(u64),
}

impl LlmError {
    /// The service rejected our credentials.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, LlmError::Api { status: 401 | 403, .. })
    }

    /// The service cannot answer any request right now: a rate limit or
    /// server error that outlasted the retries, or a failed connection.
    pub fn is_service_down(&self) -> bool {
        match self {
            LlmError::Api { status, .. } => *status == 429 || *status >= 500,
            LlmError::Http(e) => !e.is_decode(),
            _ => false,
        }
    }
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    fn name(&self) -> &str;

    /// Cheap pre-flight check run before any work is scheduled.
    fn check_configured(&self) -> Result<(), LlmError> {
        Ok(())
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError>;
}

/// Client for any server exposing `POST {base_url}/v1/chat/completions`.
pub struct OpenAiCompatible {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    max_retries: u32,
}

impl OpenAiCompatible {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        default_model: String,
        timeout_secs: u64,
        max_retries: u32,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            default_model,
            max_retries,
        })
    }

    async fn send_once(&self, url: &str, body: &serde_json::Value) -> Result<String, LlmError> {
        let mut builder = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .json(body);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }
        let response = builder.send().await?;

        let status = response.status().as_u16();
        if status != 200 {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api { status, body });
        }

        let json: serde_json::Value = response.json().await?;
        parse_completion(&json)
    }
}

#[async_trait]
impl TextGenerator for OpenAiCompatible {
    fn name(&self) -> &str {
        &self.default_model
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|m| {
                json!({
                    "role": match m.role {
                        Role::System => "system",
                        Role::User => "user",
                    },
                    "content": m.content,
                })
            })
            .collect();
        let body = json!({
            "model": request.model.as_deref().unwrap_or(&self.default_model),
            "messages": messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });

        debug!("chat completion request to {}", url);

        let mut last_err = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(backoff(attempt)).await;
            }

            match self.send_once(&url, &body).await {
                Ok(text) => return Ok(text),
                Err(LlmError::Api { status, body }) if status == 429 || status >= 500 => {
                    warn!(status, attempt, "chat completion failed, retrying");
                    last_err = Some(LlmError::Api { status, body });
                }
                Err(LlmError::Http(e)) if e.is_timeout() || e.is_connect() => {
                    warn!(error = %e, attempt, "chat completion failed, retrying");
                    last_err = Some(LlmError::Http(e));
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| LlmError::Parse("no attempts made".into())))
    }
}

/// Delay before retry number `attempt` (1-based): 1s, 2s, 4s, capped at 32s.
pub(crate) fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(1 << attempt.saturating_sub(1).min(5))
}

fn parse_completion(json: &serde_json::Value) -> Result<String, LlmError> {
    json["choices"][0]["message"]["content"]
        .as_str()
        .map(|s| s.to_string())
        .ok_or_else(|| LlmError::Parse("missing choices[0].message.content".into()))
}

/// Offline answerer: returns the context sentences that best overlap the
/// question. Needs no model server, so chat works on a fresh checkout.
pub struct ExtractiveGenerator {
    max_sentences: usize,
}

impl Default for ExtractiveGenerator {
    fn default() -> Self {
        Self { max_sentences: 3 }
    }
}

const CONTEXT_MARKER: &str = "Context:\n";
const QUESTION_MARKER: &str = "\n\nQuestion: ";

impl ExtractiveGenerator {
    fn answer(&self, prompt: &str) -> String {
        let (context, question) = match (prompt.find(CONTEXT_MARKER), prompt.rfind(QUESTION_MARKER)) {
            (Some(c), Some(q)) if c < q => (
                &prompt[c + CONTEXT_MARKER.len()..q],
                &prompt[q + QUESTION_MARKER.len()..],
            ),
            _ => ("", prompt),
        };

        let terms: std::collections::HashSet<String> = tokenize(question).into_iter().collect();
        let mut scored: Vec<(usize, usize, &str)> = context
            .split(['.', '!', '?', '\n'])
            .map(str::trim)
            .filter(|s| s.len() > 20)
            .enumerate()
            .map(|(pos, s)| {
                let overlap = tokenize(s).iter().filter(|t| terms.contains(*t)).count();
                (overlap, pos, s)
            })
            .filter(|(overlap, _, _)| *overlap > 0)
            .collect();

        if scored.is_empty() {
            return "I could not find this in the indexed papers. Collect papers on the topic and \
                    build the index, or configure an inference server for free-form answers."
                .to_string();
        }

        scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        scored.truncate(self.max_sentences);
        scored.sort_by_key(|(_, pos, _)| *pos);
        let sentences: Vec<&str> = scored.into_iter().map(|(_, _, s)| s).collect();
        format!("From the retrieved papers: {}.", sentences.join(". "))
    }
}

#[async_trait]
impl TextGenerator for ExtractiveGenerator {
    fn name(&self) -> &str {
        "extractive"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        let prompt = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        Ok(self.answer(prompt))
    }
}

/// Placeholder for a backend that cannot be used.
pub struct DisabledGenerator {
    reason: String,
}

impl DisabledGenerator {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl TextGenerator for DisabledGenerator {
    fn name(&self) -> &str {
        "disabled"
    }

    fn check_configured(&self) -> Result<(), LlmError> {
        Err(LlmError::NotConfigured(self.reason.clone()))
    }

    async fn complete(&self, _request: &CompletionRequest) -> Result<String, LlmError> {
        Err(LlmError::NotConfigured(self.reason.clone()))
    }
}

fn read_key(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|k| !k.trim().is_empty())
}

/// Builds the synthetic data generator.
pub fn create_synthesizer(config: &SynthesisConfig) -> anyhow::Result<Arc<dyn TextGenerator>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledGenerator::new(
            "synthesis.provider is 'disabled'",
        ))),
        "openai" => match read_key(&config.api_key_env) {
            Some(key) => Ok(Arc::new(OpenAiCompatible::new(
                &config.base_url,
                Some(key),
                config.model.clone(),
                config.timeout_secs,
                config.max_retries,
            )?)),
            None => Ok(Arc::new(DisabledGenerator::new(format!(
                "{} is not set",
                config.api_key_env
            )))),
        },
        other => anyhow::bail!("Unknown synthesis provider: {}", other),
    }
}

/// Builds the chat backend used by the inference gateway.
pub fn create_inference_backend(config: &InferenceConfig) -> anyhow::Result<Arc<dyn TextGenerator>> {
    match config.provider.as_str() {
        "extractive" => Ok(Arc::new(ExtractiveGenerator::default())),
        "openai" => {
            let key = config.api_key_env.as_deref().and_then(read_key);
            Ok(Arc::new(OpenAiCompatible::new(
                &config.base_url,
                key,
                config.base_model.clone(),
                config.timeout_secs,
                config.max_retries,
            )?))
        }
        other => anyhow::bail!("Unknown inference provider: {}", other),
    }
}
