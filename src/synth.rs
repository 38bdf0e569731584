//! Synthetic QA generation.
//!
//! Picks indexed papers least-recently-used first, asks the synthesis model
//! for question/answer pairs grounded in each paper, and appends them to the
//! JSONL dataset in the LLaMA-3 instruction format the trainer consumes.
//!
//! Each paper is committed on its own: pairs are appended, the paper's
//! `last_generated_at` is stamped and the registry count is raised under the
//! commit gate. A failure part-way keeps every paper already written.
//!
//! | Failure | Outcome |
//! |---------|---------|
//! | credential missing | `GenerationUnavailable` before any work |
//! | HTTP 401/403 mid-run | `GenerationUnavailable`, earlier papers kept |
//! | 429/5xx after retries, connection failure | `GenerationUnavailable`, earlier papers kept |
//! | call timeout | run stops, status `partial` |
//! | malformed response, other 4xx | one follow-up request, then the paper is reported short |

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::extract::truncate_chars;
use crate::llm::{CompletionRequest, LlmError, Message};
use crate::models::QaPair;
use crate::pipeline::Pipeline;
use crate::state::Stage;

const MAX_PAPERS: usize = 100;
const MAX_PAIRS_PER_PAPER: usize = 20;
const CONTENT_CHARS: usize = 2000;
const PREVIEW_LEN: usize = 3;
pub const EDGE_CASE: &str = "edge_case";

#[derive(Debug, Clone, Deserialize)]
pub struct GenerateRequest {
    #[serde(default = "default_num_papers")]
    pub num_papers: usize,
    #[serde(default = "default_qa_per_paper")]
    pub qa_per_paper: usize,
}

fn default_num_papers() -> usize {
    10
}
fn default_qa_per_paper() -> usize {
    3
}

impl Default for GenerateRequest {
    fn default() -> Self {
        Self {
            num_papers: default_num_papers(),
            qa_per_paper: default_qa_per_paper(),
        }
    }
}

impl GenerateRequest {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if !(1..=MAX_PAPERS).contains(&self.num_papers) {
            return Err(PipelineError::invalid(format!(
                "num_papers must be between 1 and {}",
                MAX_PAPERS
            )));
        }
        if !(1..=MAX_PAIRS_PER_PAPER).contains(&self.qa_per_paper) {
            return Err(PipelineError::invalid(format!(
                "qa_per_paper must be between 1 and {}",
                MAX_PAIRS_PER_PAPER
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationReport {
    /// `success` or `partial`.
    pub status: String,
    pub qa_pairs_generated: u64,
    pub papers_processed: u64,
    /// Papers that received fewer than the requested number of pairs.
    pub papers_short: Vec<String>,
    pub filepath: String,
    pub preview: Vec<QaPair>,
    pub message: String,
}

/// Held for the duration of one generation run.
pub struct GenerationPermit {
    _guard: OwnedMutexGuard<()>,
}

/// Checks everything that can be checked without calling the model and
/// claims the single generation slot.
pub fn begin(p: &Pipeline, req: &GenerateRequest) -> Result<GenerationPermit, PipelineError> {
    req.validate()?;
    p.synthesizer
        .check_configured()
        .map_err(|e| unavailable(p, &e))?;
    if !p.index.is_loaded() {
        return Err(PipelineError::IndexNotReady(
            "no papers have been indexed; collect papers and build the index first".to_string(),
        ));
    }
    p.generation_lock
        .clone()
        .try_lock_owned()
        .map(|guard| GenerationPermit { _guard: guard })
        .map_err(|_| PipelineError::StageBusy(Stage::Generate))
}

struct PaperContext {
    doc_id: String,
    title: String,
    abstract_text: String,
    content: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum PairKind {
    Regular,
    EdgeCase,
}

enum Stop {
    /// This request produced nothing usable; the next one may.
    Skip(String),
    TimedOut,
    Fatal(PipelineError),
}

#[tracing::instrument(skip_all, fields(num_papers = req.num_papers, qa_per_paper = req.qa_per_paper))]
pub async fn run(
    p: &Pipeline,
    req: &GenerateRequest,
    _permit: GenerationPermit,
) -> Result<GenerationReport, PipelineError> {
    let _activity = p.registry.begin(Stage::Generate);

    let papers = {
        let _gate = p.commit_lock.lock().await;
        select_papers(p, req.num_papers).await?
    };
    if papers.is_empty() {
        return Err(PipelineError::IndexNotReady(
            "no indexed papers available; build the index first".to_string(),
        ));
    }

    let (regular, edge) = split_counts(req.qa_per_paper, p.config.synthesis.include_edge_cases);
    let mut generated = 0u64;
    let mut processed = 0u64;
    let mut short = Vec::new();
    let mut preview = Vec::new();
    let mut timed_out = false;

    for paper in &papers {
        let mut pairs = Vec::new();
        let mut stop = None;
        for (kind, wanted) in [(PairKind::Regular, regular), (PairKind::EdgeCase, edge)] {
            if wanted == 0 {
                continue;
            }
            match generate_for_paper(p, paper, kind, wanted).await {
                Ok(mut got) => pairs.append(&mut got),
                Err(s) => {
                    stop = Some(s);
                    break;
                }
            }
        }

        if !pairs.is_empty() {
            let records: Vec<QaPair> = pairs
                .into_iter()
                .map(|(question, answer, kind)| QaPair {
                    text: format_instruction(&p.config.inference.system_prompt, &question, &answer),
                    source_doc_id: paper.doc_id.clone(),
                    question,
                    answer,
                    kind,
                    generated_at: Utc::now(),
                })
                .collect();
            let n = records.len() as u64;

            {
                let _gate = p.commit_lock.lock().await;
                p.dataset.append(&records)?;
                sqlx::query("UPDATE papers SET last_generated_at = ? WHERE doc_id = ?")
                    .bind(Utc::now().timestamp_millis())
                    .bind(&paper.doc_id)
                    .execute(&p.pool)
                    .await?;
                p.registry.record_qa_pairs(n);
            }

            generated += n;
            processed += 1;
            if (n as usize) < req.qa_per_paper {
                short.push(paper.doc_id.clone());
            }
            for r in records {
                if preview.len() < PREVIEW_LEN {
                    preview.push(r);
                }
            }
        } else if stop.is_none() {
            short.push(paper.doc_id.clone());
        }

        match stop {
            None | Some(Stop::Skip(_)) => {}
            Some(Stop::TimedOut) => {
                warn!(doc_id = %paper.doc_id, "generation call timed out; stopping run");
                timed_out = true;
                break;
            }
            Some(Stop::Fatal(PipelineError::GenerationUnavailable { reason, hint })) => {
                return Err(PipelineError::GenerationUnavailable {
                    reason: format!("{} ({} pairs saved before the failure)", reason, generated),
                    hint,
                });
            }
            Some(Stop::Fatal(e)) => return Err(e),
        }
    }

    info!(generated, processed, short = short.len(), "generation finished");

    let filepath = p.dataset.path().display().to_string();
    let mut message = format!(
        "Generated {} QA pairs from {} papers into {}",
        generated, processed, filepath
    );
    if !short.is_empty() {
        message.push_str(&format!("; {} papers fell short of {} pairs", short.len(), req.qa_per_paper));
    }
    if timed_out {
        message.push_str("; stopped early after a generation timeout");
    }

    Ok(GenerationReport {
        status: if timed_out { "partial" } else { "success" }.to_string(),
        qa_pairs_generated: generated,
        papers_processed: processed,
        papers_short: short,
        filepath,
        preview,
        message,
    })
}

/// Regular and edge-case counts for one paper. Edge cases take one slot when
/// enabled and there is room for at least one regular pair.
fn split_counts(qa_per_paper: usize, include_edge_cases: bool) -> (usize, usize) {
    if include_edge_cases && qa_per_paper >= 2 {
        (qa_per_paper - 1, 1)
    } else {
        (qa_per_paper, 0)
    }
}

async fn select_papers(p: &Pipeline, limit: usize) -> Result<Vec<PaperContext>, PipelineError> {
    let rows = sqlx::query(
        r#"
        SELECT doc_id, title, abstract FROM papers
        WHERE EXISTS (
            SELECT 1 FROM chunks c
            WHERE c.doc_id = papers.doc_id AND c.indexed_version IS NOT NULL
        )
        ORDER BY last_generated_at IS NOT NULL, last_generated_at, doc_id
        LIMIT ?
        "#,
    )
    .bind(limit as i64)
    .fetch_all(&p.pool)
    .await?;

    let mut papers = Vec::with_capacity(rows.len());
    for row in rows {
        let doc_id: String = row.get("doc_id");
        let texts: Vec<String> = sqlx::query_scalar(
            "SELECT text FROM chunks WHERE doc_id = ? AND indexed_version IS NOT NULL ORDER BY chunk_index",
        )
        .bind(&doc_id)
        .fetch_all(&p.pool)
        .await?;
        let joined = texts.join(" ");
        papers.push(PaperContext {
            doc_id,
            title: row.get("title"),
            abstract_text: row.get("abstract"),
            content: truncate_chars(&joined, CONTENT_CHARS).to_string(),
        });
    }
    Ok(papers)
}

/// Up to `wanted` pairs of one kind: one request, plus one follow-up for any
/// shortfall.
async fn generate_for_paper(
    p: &Pipeline,
    paper: &PaperContext,
    kind: PairKind,
    wanted: usize,
) -> Result<Vec<(String, String, String)>, Stop> {
    let mut pairs: Vec<(String, String, String)> = Vec::new();
    let mut seen = HashSet::new();

    for attempt in 0..2 {
        let remaining = wanted - pairs.len();
        if remaining == 0 {
            break;
        }
        let asked: Vec<&str> = pairs.iter().map(|(q, _, _)| q.as_str()).collect();
        let prompt = match kind {
            PairKind::Regular => qa_prompt(paper, remaining, &asked),
            PairKind::EdgeCase => edge_case_prompt(paper, remaining),
        };

        let content = match call_model(p, prompt).await {
            Ok(c) => c,
            Err(Stop::Skip(reason)) => {
                warn!(doc_id = %paper.doc_id, attempt, error = %reason, "generation request rejected");
                continue;
            }
            Err(stop) => return Err(stop),
        };

        match parse_qa_response(&content) {
            Ok(items) => {
                for item in items {
                    if pairs.len() == wanted {
                        break;
                    }
                    if !seen.insert(item.question.to_lowercase()) {
                        continue;
                    }
                    let kind_label = match kind {
                        PairKind::EdgeCase => EDGE_CASE.to_string(),
                        PairKind::Regular => item.kind.unwrap_or_else(|| "factual".to_string()),
                    };
                    pairs.push((item.question, item.answer, kind_label));
                }
            }
            Err(e) => warn!(doc_id = %paper.doc_id, attempt, error = %e, "unparseable generation response"),
        }
    }

    Ok(pairs)
}

async fn call_model(p: &Pipeline, prompt: String) -> Result<String, Stop> {
    let cfg = &p.config.synthesis;
    let request = CompletionRequest {
        model: None,
        messages: vec![Message::user(prompt)],
        temperature: cfg.temperature,
        max_tokens: cfg.max_tokens,
    };
    match tokio::time::timeout(
        Duration::from_secs(cfg.timeout_secs),
        p.synthesizer.complete(&request),
    )
    .await
    {
        Err(_) => Err(Stop::TimedOut),
        Ok(Ok(content)) => Ok(content),
        Ok(Err(LlmError::Timeout(_))) => Err(Stop::TimedOut),
        Ok(Err(LlmError::Http(e))) if e.is_timeout() => Err(Stop::TimedOut),
        Ok(Err(e))
            if e.is_auth_failure()
                || e.is_service_down()
                || matches!(e, LlmError::NotConfigured(_)) =>
        {
            Err(Stop::Fatal(unavailable(p, &e)))
        }
        Ok(Err(e)) => Err(Stop::Skip(e.to_string())),
    }
}

fn unavailable(p: &Pipeline, e: &LlmError) -> PipelineError {
    let cfg = &p.config.synthesis;
    if e.is_service_down() {
        return PipelineError::GenerationUnavailable {
            reason: format!("the generation service is not answering ({})", e),
            hint: format!("Check that {} is reachable and retry", cfg.base_url),
        };
    }
    let reason = if e.is_auth_failure() {
        format!("the generation service rejected the credential ({})", e)
    } else {
        e.to_string()
    };
    PipelineError::GenerationUnavailable {
        reason,
        hint: format!(
            "Set {} in the environment or .env file and retry",
            cfg.api_key_env
        ),
    }
}

fn qa_prompt(paper: &PaperContext, n: usize, asked: &[&str]) -> String {
    let mut prompt = format!(
        r#"You are a research assistant creating quiz questions from academic papers.

Paper Title: {title}

Abstract:
{abstract_text}

Content (first 2000 chars):
{content}

Generate {n} high-quality question-answer pairs that:
1. Cover key findings, methods, and concepts
2. Range from factual to conceptual questions
3. Have detailed, accurate answers based only on the provided text
4. Use appropriate academic terminology

Return as JSON array with format:
[{{"question": "...", "answer": "...", "type": "factual|conceptual|methodological"}}]

IMPORTANT: Base answers ONLY on the provided text. If something isn't mentioned, don't invent it."#,
        title = paper.title,
        abstract_text = paper.abstract_text,
        content = paper.content,
        n = n,
    );
    if !asked.is_empty() {
        prompt.push_str("\n\nDo not repeat these questions:\n");
        for q in asked {
            prompt.push_str("- ");
            prompt.push_str(q);
            prompt.push('\n');
        }
    }
    prompt
}

fn edge_case_prompt(paper: &PaperContext, n: usize) -> String {
    format!(
        r#"Create {n} "trick" questions about this paper that test if a model hallucinates:

Paper Title: {title}
Abstract: {abstract_text}

Generate questions that:
1. Ask about details NOT in the paper (fake statistics, made-up experiments)
2. Include plausible-sounding but incorrect premises
3. Have answers that CORRECTLY identify the misinformation

Format as JSON array:
[{{"question": "...", "answer": "The paper does not mention/contain...", "type": "edge_case"}}]"#,
        n = n,
        title = paper.title,
        abstract_text = paper.abstract_text,
    )
}

/// Renders a pair in the LLaMA-3 instruct chat template.
pub fn format_instruction(system_prompt: &str, question: &str, answer: &str) -> String {
    format!(
        "<|begin_of_text|><|start_header_id|>system<|end_header_id|>\n\n{}<|eot_id|>\
         <|start_header_id|>user<|end_header_id|>\n\n{}<|eot_id|>\
         <|start_header_id|>assistant<|end_header_id|>\n\n{}<|eot_id|>",
        system_prompt, question, answer
    )
}

#[derive(Debug, PartialEq)]
struct RawPair {
    question: String,
    answer: String,
    kind: Option<String>,
}

/// Accepts a bare JSON array, an array inside a ```json fence, an object
/// wrapping the array (`{"questions": [...]}`), or a single pair object.
fn parse_qa_response(content: &str) -> Result<Vec<RawPair>, String> {
    let body = strip_fence(content);
    let value: serde_json::Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(first) => {
            let start = body.find('[');
            let end = body.rfind(']');
            match (start, end) {
                (Some(s), Some(e)) if s < e => serde_json::from_str(&body[s..=e])
                    .map_err(|e| format!("invalid JSON: {}", e))?,
                _ => return Err(format!("invalid JSON: {}", first)),
            }
        }
    };

    let items = match value {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(mut obj) => {
            let wrapped = ["questions", "qa_pairs", "pairs", "data"]
                .iter()
                .find_map(|k| match obj.remove(*k) {
                    Some(serde_json::Value::Array(items)) => Some(items),
                    _ => None,
                });
            match wrapped {
                Some(items) => items,
                None => vec![serde_json::Value::Object(obj)],
            }
        }
        _ => return Err("expected a JSON array of pairs".to_string()),
    };

    Ok(items
        .into_iter()
        .filter_map(|item| {
            let question = item.get("question")?.as_str()?.trim().to_string();
            let answer = item.get("answer")?.as_str()?.trim().to_string();
            if question.is_empty() || answer.is_empty() {
                return None;
            }
            let kind = item
                .get("type")
                .and_then(|t| t.as_str())
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty());
            Some(RawPair {
                question,
                answer,
                kind,
            })
        })
        .collect())
}

fn strip_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(start) = trimmed.find("```") else {
        return trimmed;
    };
    let after = &trimmed[start + 3..];
    // Skip the info string (`json`) up to the end of the fence line.
    let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after[body_start..];
    match body.find("```") {
        Some(end) => body[..end].trim(),
        None => body.trim(),
    }
}
