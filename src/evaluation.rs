//! Batch comparison of the base and fine-tuned models on held-out QA pairs.
//!
//! Questions come from the validation share of the dataset (see
//! [`dataset::is_held_out`]), so the fine-tuned model has not seen them.
//! Before any pair is held out (small datasets, ratio 0) the most recent
//! pairs are used instead and the report says so.
//!
//! Each question goes to both models without retrieval and each answer is
//! scored against the stored answer by word overlap. A markdown report and
//! its JSON twin are written to `{data_dir}/reports/`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::dataset;
use crate::error::PipelineError;
use crate::extract::truncate_chars;
use crate::finetune::load_manifest;
use crate::inference::{chat, evaluate, ChatRequest, ModelType, Winner};
use crate::models::QaPair;
use crate::pipeline::Pipeline;

pub const MAX_QUESTIONS: usize = 100;
/// Relevance above which an answer counts as correct.
const CORRECT_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, Deserialize)]
pub struct EvaluateRequest {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    20
}

impl Default for EvaluateRequest {
    fn default() -> Self {
        Self {
            limit: default_limit(),
        }
    }
}

impl EvaluateRequest {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if !(1..=MAX_QUESTIONS).contains(&self.limit) {
            return Err(PipelineError::invalid(format!(
                "limit must be between 1 and {}",
                MAX_QUESTIONS
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QuestionResult {
    pub question: String,
    pub expected_answer: String,
    pub base_answer: String,
    pub finetuned_answer: String,
    pub base_relevance: f64,
    pub finetuned_relevance: f64,
    pub base_latency_ms: u64,
    pub finetuned_latency_ms: u64,
    pub winner: Winner,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelMetrics {
    /// Share of answers with relevance above 0.5.
    pub accuracy: f64,
    pub avg_relevance: f64,
    pub avg_latency_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonStats {
    pub total_questions: usize,
    pub finetuned_wins: usize,
    pub base_wins: usize,
    pub ties: usize,
    pub finetuned_win_rate: f64,
    pub base: ModelMetrics,
    pub finetuned: ModelMetrics,
    /// Relative change in average relevance; 0 when the base scored 0.
    pub improvement_percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaluationReport {
    /// False when the questions were not held out of training.
    pub held_out: bool,
    pub finetuned_available: bool,
    pub stats: ComparisonStats,
    pub results: Vec<QuestionResult>,
    pub report_path: String,
    pub message: String,
}

#[tracing::instrument(skip_all, fields(limit = req.limit))]
pub async fn run(p: &Pipeline, req: &EvaluateRequest) -> Result<EvaluationReport, PipelineError> {
    req.validate()?;

    let pairs = p.dataset.read_all()?;
    if pairs.is_empty() {
        return Err(PipelineError::EmptyDataset {
            path: p.dataset.path().display().to_string(),
        });
    }
    let (questions, held_out) = pick_questions(pairs, p.config.training.validation_ratio, req.limit);
    let finetuned_available = load_manifest(&p.config.adapters_dir()).is_some();

    let mut results = Vec::with_capacity(questions.len());
    for pair in &questions {
        let base_req = ChatRequest::new(pair.question.clone(), ModelType::Base, false);
        let tuned_req = ChatRequest::new(pair.question.clone(), ModelType::Finetuned, false);
        let (base, tuned) = tokio::join!(chat(p, &base_req), chat(p, &tuned_req));
        let (base, tuned) = (base?, tuned?);

        let scored = evaluate(&base.message, &tuned.message, &pair.answer);
        results.push(QuestionResult {
            question: pair.question.clone(),
            expected_answer: pair.answer.clone(),
            base_answer: base.message,
            finetuned_answer: tuned.message,
            base_relevance: scored.base_relevance,
            finetuned_relevance: scored.finetuned_relevance,
            base_latency_ms: base.latency_ms,
            finetuned_latency_ms: tuned.latency_ms,
            winner: scored.winner,
        });
    }

    let stats = comparison_stats(&results);
    let report_path = write_reports(
        &p.config.reports_dir(),
        &stats,
        &results,
        held_out,
        finetuned_available,
    )?;
    info!(
        questions = stats.total_questions,
        finetuned_wins = stats.finetuned_wins,
        improvement_percent = stats.improvement_percent,
        "evaluation finished"
    );

    let mut message = format!(
        "Compared models on {} {} questions: fine-tuned won {}, base won {}, {} ties",
        stats.total_questions,
        if held_out { "held-out" } else { "recent" },
        stats.finetuned_wins,
        stats.base_wins,
        stats.ties
    );
    if !finetuned_available {
        message.push_str("; no fine-tuned adapter yet, both sides used the base model");
    }

    Ok(EvaluationReport {
        held_out,
        finetuned_available,
        stats,
        results,
        report_path: report_path.display().to_string(),
        message,
    })
}

/// Up to `limit` held-out pairs, or the `limit` most recent pairs when none
/// are held out.
fn pick_questions(pairs: Vec<QaPair>, ratio: f64, limit: usize) -> (Vec<QaPair>, bool) {
    let split = dataset::split(pairs, ratio);
    if split.validation.is_empty() {
        let recent = split.train.len().saturating_sub(limit);
        (split.train[recent..].to_vec(), false)
    } else {
        (split.validation.into_iter().take(limit).collect(), true)
    }
}

fn metrics(
    results: &[QuestionResult],
    relevance: impl Fn(&QuestionResult) -> f64,
    latency: impl Fn(&QuestionResult) -> u64,
) -> ModelMetrics {
    let n = results.len().max(1) as f64;
    ModelMetrics {
        accuracy: results
            .iter()
            .filter(|&r| relevance(r) > CORRECT_THRESHOLD)
            .count() as f64
            / n,
        avg_relevance: results.iter().map(|r| relevance(r)).sum::<f64>() / n,
        avg_latency_ms: results.iter().map(|r| latency(r) as f64).sum::<f64>() / n,
    }
}

pub fn comparison_stats(results: &[QuestionResult]) -> ComparisonStats {
    let count = |w: Winner| results.iter().filter(|r| r.winner == w).count();
    let base = metrics(results, |r| r.base_relevance, |r| r.base_latency_ms);
    let finetuned = metrics(results, |r| r.finetuned_relevance, |r| r.finetuned_latency_ms);
    let finetuned_wins = count(Winner::Finetuned);
    let improvement_percent = if base.avg_relevance > 0.0 {
        (finetuned.avg_relevance - base.avg_relevance) / base.avg_relevance * 100.0
    } else {
        0.0
    };

    ComparisonStats {
        total_questions: results.len(),
        finetuned_wins,
        base_wins: count(Winner::Base),
        ties: count(Winner::Tie),
        finetuned_win_rate: finetuned_wins as f64 / results.len().max(1) as f64,
        base,
        finetuned,
        improvement_percent,
    }
}

fn write_reports(
    dir: &Path,
    stats: &ComparisonStats,
    results: &[QuestionResult],
    held_out: bool,
    finetuned_available: bool,
) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let stem = format!("comparison_{}", Utc::now().format("%Y%m%d_%H%M%S_%3f"));
    let markdown = dir.join(format!("{}.md", stem));
    std::fs::write(&markdown, render_markdown(stats, results, held_out, finetuned_available))?;
    let json = serde_json::json!({
        "held_out": held_out,
        "finetuned_available": finetuned_available,
        "stats": stats,
        "results": results,
    });
    std::fs::write(dir.join(format!("{}.json", stem)), serde_json::to_vec_pretty(&json)?)?;
    Ok(markdown)
}

fn render_markdown(
    stats: &ComparisonStats,
    results: &[QuestionResult],
    held_out: bool,
    finetuned_available: bool,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Model Comparison Report\n");
    let _ = writeln!(out, "Generated: {}\n", Utc::now().to_rfc3339());
    if !held_out {
        let _ = writeln!(out, "> Questions were not held out of training.\n");
    }
    if !finetuned_available {
        let _ = writeln!(out, "> No fine-tuned adapter was available; both columns are the base model.\n");
    }
    let _ = writeln!(out, "## Summary\n");
    let _ = writeln!(out, "| Metric | Base | Fine-tuned |");
    let _ = writeln!(out, "|--------|------|------------|");
    let _ = writeln!(out, "| Wins | {} | {} |", stats.base_wins, stats.finetuned_wins);
    let _ = writeln!(out, "| Accuracy | {:.1}% | {:.1}% |", stats.base.accuracy * 100.0, stats.finetuned.accuracy * 100.0);
    let _ = writeln!(out, "| Avg relevance | {:.3} | {:.3} |", stats.base.avg_relevance, stats.finetuned.avg_relevance);
    let _ = writeln!(out, "| Avg latency (ms) | {:.0} | {:.0} |", stats.base.avg_latency_ms, stats.finetuned.avg_latency_ms);
    let _ = writeln!(
        out,
        "\n{} questions, {} ties, fine-tuned win rate {:.1}%, improvement {:.1}%\n",
        stats.total_questions,
        stats.ties,
        stats.finetuned_win_rate * 100.0,
        stats.improvement_percent
    );

    let _ = writeln!(out, "## Questions\n");
    for (i, r) in results.iter().enumerate() {
        let _ = writeln!(out, "### {}. {}\n", i + 1, r.question);
        let _ = writeln!(out, "**Expected:** {}\n", truncate_chars(&r.expected_answer, 200));
        let _ = writeln!(out, "| Model | Answer | Relevance |");
        let _ = writeln!(out, "|-------|--------|-----------|");
        let _ = writeln!(out, "| Base | {} | {:.3} |", cell(&r.base_answer), r.base_relevance);
        let _ = writeln!(out, "| Fine-tuned | {} | {:.3} |\n", cell(&r.finetuned_answer), r.finetuned_relevance);
    }
    out
}

fn cell(text: &str) -> String {
    truncate_chars(text, 150).replace('|', "\\|").replace('\n', " ")
}
