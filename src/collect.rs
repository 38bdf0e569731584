//! Paper collection: fetch, deduplicate, clean, chunk, persist.
//!
//! Papers are fetched page by page from the configured [`PaperSource`].
//! Each page is committed in its own transaction under the pipeline commit
//! gate, and the registry's `papers_collected` is raised before the gate is
//! released. A failure on the first page is `SourceUnavailable`; a failure
//! on a later page keeps the pages already stored and reports `partial`.
//!
//! Deduplication is by exact `doc_id`. A paper already present (from this
//! or an earlier run) is counted as a duplicate and left untouched.
//!
//! [`PaperSource`]: crate::sources::PaperSource

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::chunk::chunk_text;
use crate::error::PipelineError;
use crate::extract::clean_text;
use crate::models::Paper;
use crate::pipeline::Pipeline;
use crate::sources::SourceQuery;
use crate::state::Stage;

pub const MAX_PAPERS_PER_RUN: usize = 500;
const PREVIEW_LEN: usize = 5;

#[derive(Debug, Clone, Deserialize)]
pub struct CollectRequest {
    pub category: String,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default = "default_num_papers")]
    pub num_papers: usize,
}

fn default_num_papers() -> usize {
    10
}

impl CollectRequest {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.category.trim().is_empty() {
            return Err(PipelineError::invalid("category must not be empty"));
        }
        if self.num_papers == 0 || self.num_papers > MAX_PAPERS_PER_RUN {
            return Err(PipelineError::invalid(format!(
                "num_papers must be between 1 and {}",
                MAX_PAPERS_PER_RUN
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectReport {
    /// `success` or `partial`.
    pub status: String,
    pub papers_collected: u64,
    pub papers_fetched: u64,
    pub duplicates: u64,
    pub chunks_created: u64,
    pub preview: Vec<String>,
    pub message: String,
}

#[derive(Default)]
struct PageOutcome {
    inserted: u64,
    duplicates: u64,
    chunks: u64,
    titles: Vec<String>,
}

#[tracing::instrument(skip_all, fields(category = %req.category))]
pub async fn collect(p: &Pipeline, req: &CollectRequest) -> Result<CollectReport, PipelineError> {
    req.validate()?;
    let _activity = p.registry.begin(Stage::Collect);

    let page_size = p.config.source.page_size;
    let mut fetched = 0usize;
    let mut totals = PageOutcome::default();
    let mut partial_error: Option<String> = None;

    while fetched < req.num_papers {
        let want = page_size.min(req.num_papers - fetched);
        let query = SourceQuery {
            category: req.category.trim().to_string(),
            query: req.query.clone(),
            start: fetched,
            max_results: want,
        };

        let page = match p.source.fetch(&query).await {
            Ok(page) => page,
            Err(e) if fetched == 0 => {
                return Err(PipelineError::SourceUnavailable(format!(
                    "{} source: {}",
                    p.source.name(),
                    e
                )));
            }
            Err(e) => {
                warn!(error = %e, fetched, "source failed mid-collection; keeping stored pages");
                partial_error = Some(e.to_string());
                break;
            }
        };

        let exhausted = page.len() < want;
        let page: Vec<Paper> = page.into_iter().take(want).collect();
        fetched += page.len();

        let outcome = {
            let _gate = p.commit_lock.lock().await;
            let outcome = persist_page(&p.pool, &page, &p.config.chunking).await?;
            p.registry.record_papers(outcome.inserted);
            outcome
        };

        totals.inserted += outcome.inserted;
        totals.duplicates += outcome.duplicates;
        totals.chunks += outcome.chunks;
        totals.titles.extend(outcome.titles);

        if exhausted || page.is_empty() {
            break;
        }
    }

    info!(
        fetched,
        inserted = totals.inserted,
        duplicates = totals.duplicates,
        chunks = totals.chunks,
        "collection finished"
    );

    let status = if partial_error.is_some() { "partial" } else { "success" };
    let mut message = format!(
        "Collected {} new papers ({} fetched, {} already stored, {} chunks)",
        totals.inserted, fetched, totals.duplicates, totals.chunks
    );
    if let Some(e) = partial_error {
        message.push_str(&format!("; stopped early: {}", e));
    }

    Ok(CollectReport {
        status: status.to_string(),
        papers_collected: totals.inserted,
        papers_fetched: fetched as u64,
        duplicates: totals.duplicates,
        chunks_created: totals.chunks,
        preview: totals.titles.into_iter().take(PREVIEW_LEN).collect(),
        message,
    })
}

async fn persist_page(
    pool: &SqlitePool,
    papers: &[Paper],
    chunking: &crate::config::ChunkingConfig,
) -> Result<PageOutcome, PipelineError> {
    let mut outcome = PageOutcome::default();
    let now = chrono::Utc::now().timestamp();
    let mut tx = pool.begin().await?;

    for paper in papers {
        let cleaned = Paper {
            title: clean_text(&paper.title),
            abstract_text: clean_text(&paper.abstract_text),
            full_text: clean_text(&paper.full_text),
            ..paper.clone()
        };
        let authors_json = serde_json::to_string(&cleaned.authors).map_err(anyhow::Error::from)?;

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO papers
                (doc_id, category, title, authors_json, abstract, full_text, published_at, source_url, collected_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&cleaned.doc_id)
        .bind(&cleaned.category)
        .bind(&cleaned.title)
        .bind(&authors_json)
        .bind(&cleaned.abstract_text)
        .bind(&cleaned.full_text)
        .bind(cleaned.published.map(|d| d.timestamp()))
        .bind(&cleaned.source_url)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            outcome.duplicates += 1;
            continue;
        }

        let chunks = chunk_text(
            &cleaned.doc_id,
            &cleaned.body(),
            chunking.max_tokens,
            chunking.overlap_tokens,
        );
        for chunk in &chunks {
            sqlx::query(
                "INSERT INTO chunks (chunk_id, doc_id, chunk_index, text, hash) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&chunk.chunk_id)
            .bind(&chunk.doc_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.text)
            .bind(&chunk.hash)
            .execute(&mut *tx)
            .await?;
        }

        outcome.inserted += 1;
        outcome.chunks += chunks.len() as u64;
        outcome.titles.push(cleaned.title);
    }

    tx.commit().await?;
    Ok(outcome)
}

/// Number of stored papers.
pub async fn count_papers(pool: &SqlitePool) -> Result<u64, sqlx::Error> {
    let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM papers")
        .fetch_one(pool)
        .await?;
    Ok(n.max(0) as u64)
}
