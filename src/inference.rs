//! Inference gateway: chat with optional retrieval, and base-vs-finetuned
//! comparison.
//!
//! `finetuned` requests are routed to the model named in the adapter
//! manifest (`{data_dir}/adapters/latest.json`). Without a manifest they fall
//! back to the base model and say so in `notice`. With `use_rag`, the top 3
//! hybrid-search chunks are prepended as context; before the first index
//! build the question is answered without context, again with a notice.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::PipelineError;
use crate::extract::truncate_chars;
use crate::finetune::load_manifest;
use crate::llm::{CompletionRequest, LlmError, Message};
use crate::pipeline::Pipeline;
use crate::search::{search, SearchMode};

pub const RAG_TOP_K: usize = 3;
const SOURCE_PREVIEW_CHARS: usize = 200;
const MAX_MESSAGE_CHARS: usize = 2000;
/// Relevance margin a model needs to win a comparison.
const WIN_MARGIN: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    Base,
    #[default]
    Finetuned,
}

impl FromStr for ModelType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "base" => Ok(ModelType::Base),
            "finetuned" => Ok(ModelType::Finetuned),
            other => Err(format!("Unknown model type: {}. Use base or finetuned.", other)),
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ModelType::Base => "base",
            ModelType::Finetuned => "finetuned",
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub model_type: ModelType,
    #[serde(default = "default_use_rag")]
    pub use_rag: bool,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_use_rag() -> bool {
    true
}
fn default_max_tokens() -> u32 {
    512
}
fn default_temperature() -> f32 {
    0.7
}

impl ChatRequest {
    pub fn new(message: impl Into<String>, model_type: ModelType, use_rag: bool) -> Self {
        Self {
            message: message.into(),
            model_type,
            use_rag,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        validate_message("message", &self.message)?;
        if !(64..=2048).contains(&self.max_tokens) {
            return Err(PipelineError::invalid("max_tokens must be between 64 and 2048"));
        }
        if !self.temperature.is_finite() || !(0.0..=2.0).contains(&self.temperature) {
            return Err(PipelineError::invalid("temperature must be between 0.0 and 2.0"));
        }
        Ok(())
    }
}

fn validate_message(field: &str, text: &str) -> Result<(), PipelineError> {
    let len = text.chars().count();
    if text.trim().is_empty() || len > MAX_MESSAGE_CHARS {
        return Err(PipelineError::invalid(format!(
            "{} must be between 1 and {} characters",
            field, MAX_MESSAGE_CHARS
        )));
    }
    Ok(())
}

/// A retrieved chunk cited in a chat answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceRef {
    pub chunk_id: String,
    pub doc_id: String,
    pub title: String,
    pub text: String,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatReply {
    pub message: String,
    /// The model type that actually answered.
    pub model_used: ModelType,
    /// The model name sent to the backend.
    pub model_id: String,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<SourceRef>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notice: Option<String>,
}

#[tracing::instrument(skip_all, fields(model_type = %req.model_type, use_rag = req.use_rag))]
pub async fn chat(p: &Pipeline, req: &ChatRequest) -> Result<ChatReply, PipelineError> {
    req.validate()?;
    let started = Instant::now();
    let mut notices: Vec<&str> = Vec::new();

    let (model_used, model_id) = match req.model_type {
        ModelType::Base => (ModelType::Base, p.config.inference.base_model.clone()),
        ModelType::Finetuned => match load_manifest(&p.config.adapters_dir()) {
            Some(manifest) => (ModelType::Finetuned, manifest.served_model),
            None => {
                notices.push("No fine-tuned adapter is available yet; answered with the base model.");
                (ModelType::Base, p.config.inference.base_model.clone())
            }
        },
    };

    let mut prompt = req.message.clone();
    let mut sources = None;
    if req.use_rag {
        let snapshot = p.index.snapshot();
        if snapshot.is_empty() {
            notices.push("The search index has not been built yet; answered without retrieved context.");
        } else {
            let hits = search(&snapshot, p.embedder.as_ref(), &req.message, RAG_TOP_K, SearchMode::Hybrid).await?;
            if !hits.is_empty() {
                let context = hits
                    .iter()
                    .map(|h| h.text.as_str())
                    .collect::<Vec<_>>()
                    .join("\n\n");
                prompt = rag_prompt(&context, &req.message);
            }
            debug!(hits = hits.len(), "retrieved context");
            sources = Some(
                hits.into_iter()
                    .map(|h| SourceRef {
                        text: truncate_chars(&h.text, SOURCE_PREVIEW_CHARS).to_string(),
                        chunk_id: h.chunk_id,
                        doc_id: h.doc_id,
                        title: h.metadata.title,
                        score: h.score,
                    })
                    .collect(),
            );
        }
    }

    let completion = CompletionRequest {
        model: Some(model_id.clone()),
        messages: vec![
            Message::system(p.config.inference.system_prompt.clone()),
            Message::user(prompt),
        ],
        temperature: req.temperature,
        max_tokens: req.max_tokens,
    };

    let timeout = Duration::from_secs(p.config.inference.timeout_secs);
    let text = match tokio::time::timeout(timeout, p.inference.complete(&completion)).await {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => return Err(inference_unavailable(p, &e)),
        Err(_) => return Err(inference_unavailable(p, &LlmError::Timeout(timeout.as_secs()))),
    };

    Ok(ChatReply {
        message: text.trim().to_string(),
        model_used,
        model_id,
        latency_ms: started.elapsed().as_millis() as u64,
        sources,
        notice: if notices.is_empty() {
            None
        } else {
            Some(notices.join(" "))
        },
    })
}

pub fn rag_prompt(context: &str, question: &str) -> String {
    format!(
        "Based on the following research context, answer the question.\n\nContext:\n{}\n\nQuestion: {}",
        context, question
    )
}

fn inference_unavailable(p: &Pipeline, e: &LlmError) -> PipelineError {
    PipelineError::GenerationUnavailable {
        reason: format!("inference backend failed: {}", e),
        hint: format!(
            "Check the inference server at {} or set inference.provider = \"extractive\"",
            p.config.inference.base_url
        ),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompareRequest {
    pub question: String,
    /// Expected answer; enables scoring.
    #[serde(default)]
    pub reference: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Winner {
    Base,
    Finetuned,
    Tie,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evaluation {
    pub base_relevance: f64,
    pub finetuned_relevance: f64,
    pub winner: Winner,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompareReply {
    pub question: String,
    pub base_response: String,
    pub finetuned_response: String,
    pub finetuned_available: bool,
    pub comparison: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<Evaluation>,
}

/// Asks both models the same question, without retrieval.
#[tracing::instrument(skip_all)]
pub async fn compare(p: &Pipeline, req: &CompareRequest) -> Result<CompareReply, PipelineError> {
    validate_message("question", &req.question)?;

    let base_req = ChatRequest::new(req.question.clone(), ModelType::Base, false);
    let tuned_req = ChatRequest::new(req.question.clone(), ModelType::Finetuned, false);
    let (base, tuned) = tokio::join!(chat(p, &base_req), chat(p, &tuned_req));
    let (base, tuned) = (base?, tuned?);

    let finetuned_available = tuned.model_used == ModelType::Finetuned;
    let evaluation = req
        .reference
        .as_deref()
        .filter(|r| !r.trim().is_empty())
        .map(|reference| evaluate(&base.message, &tuned.message, reference));

    let comparison = render_comparison(
        &req.question,
        &base.message,
        &tuned.message,
        finetuned_available,
        evaluation.as_ref(),
    );

    Ok(CompareReply {
        question: req.question.clone(),
        base_response: base.message,
        finetuned_response: tuned.message,
        finetuned_available,
        comparison,
        evaluation,
    })
}

/// Share of distinct reference words that appear in `answer`.
pub fn word_overlap(answer: &str, reference: &str) -> f64 {
    let answer_words: std::collections::HashSet<String> =
        answer.split_whitespace().map(str::to_lowercase).collect();
    let reference_words: std::collections::HashSet<String> =
        reference.split_whitespace().map(str::to_lowercase).collect();
    if reference_words.is_empty() {
        return 0.0;
    }
    let hits = reference_words.intersection(&answer_words).count();
    hits as f64 / reference_words.len() as f64
}

pub fn evaluate(base: &str, finetuned: &str, reference: &str) -> Evaluation {
    let base_relevance = word_overlap(base, reference);
    let finetuned_relevance = word_overlap(finetuned, reference);
    let winner = if finetuned_relevance > base_relevance + WIN_MARGIN {
        Winner::Finetuned
    } else if base_relevance > finetuned_relevance + WIN_MARGIN {
        Winner::Base
    } else {
        Winner::Tie
    };
    Evaluation {
        base_relevance,
        finetuned_relevance,
        winner,
    }
}

fn render_comparison(
    question: &str,
    base: &str,
    finetuned: &str,
    finetuned_available: bool,
    evaluation: Option<&Evaluation>,
) -> String {
    let mut out = format!("Question: {}\n\n=== Base model ===\n{}\n\n", question, base);
    if finetuned_available {
        out.push_str(&format!("=== Fine-tuned model ===\n{}\n", finetuned));
    } else {
        out.push_str(&format!(
            "=== Fine-tuned model (unavailable, base model used) ===\n{}\n",
            finetuned
        ));
    }
    if let Some(e) = evaluation {
        out.push_str(&format!(
            "\nRelevance: base {:.2}, fine-tuned {:.2}; winner: {}\n",
            e.base_relevance,
            e.finetuned_relevance,
            match e.winner {
                Winner::Base => "base",
                Winner::Finetuned => "finetuned",
                Winner::Tie => "tie",
            }
        ));
    }
    out
}
