//! Dual keyword + vector index over chunks.
//!
//! An [`IndexSnapshot`] holds both structures, built from one list of
//! [`IndexedChunk`]s so both cover exactly the same chunk slots. A chunk
//! with no indexable terms has a slot but no postings. Snapshots are immutable;
//! [`IndexEngine`] swaps in a new `Arc<IndexSnapshot>` at the end of a build,
//! so a reader holding the previous snapshot keeps a complete, consistent
//! view until it drops it.
//!
//! Durable state lives in SQLite: chunk vectors in `chunk_vectors`, and the
//! build that indexed each chunk in `chunks.indexed_version`. The in-memory
//! snapshot is reloaded from those tables at startup.
//!
//! Each stored vector records the embedding model and dimension that made
//! it. Only vectors matching the current provider are loaded; the others
//! count as pending and the next build re-embeds them.

use anyhow::anyhow;
use sqlx::{Row, SqlitePool};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, warn};

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::PipelineError;
use crate::models::ChunkMetadata;
use crate::pipeline::Pipeline;
use crate::state::Stage;

/// BM25 term-frequency saturation.
const K1: f64 = 1.2;
/// BM25 length normalisation.
const B: f64 = 0.75;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "can", "for", "from", "has", "have",
    "how", "in", "into", "is", "it", "its", "of", "on", "or", "our", "that", "the", "their",
    "then", "there", "these", "this", "those", "to", "was", "we", "were", "what", "when", "where",
    "which", "who", "why", "with",
];

/// Lowercase alphanumeric tokens of length ≥ 2, minus stopwords.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .filter(|t| t.chars().count() >= 2 && !STOPWORDS.contains(&t.as_str()))
        .collect()
}

/// A chunk together with everything the index stores for it.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedChunk {
    pub chunk_id: String,
    pub doc_id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Copy)]
struct Posting {
    slot: usize,
    tf: u32,
}

/// One immutable index version.
#[derive(Debug)]
pub struct IndexSnapshot {
    version: u64,
    /// Sorted by `chunk_id`; a slot is a position in this list.
    chunks: Vec<IndexedChunk>,
    postings: HashMap<String, Vec<Posting>>,
    /// Token count per slot. Every chunk has one, including chunks whose
    /// text is all stopwords: those sit in the keyword structure with no
    /// postings, so keyword queries never match them while vector queries
    /// still can.
    lengths: Vec<u32>,
    avg_length: f64,
}

impl IndexSnapshot {
    pub fn empty() -> Self {
        Self::build(0, Vec::new())
    }

    pub fn build(version: u64, mut chunks: Vec<IndexedChunk>) -> Self {
        chunks.sort_by(|a, b| a.chunk_id.cmp(&b.chunk_id));
        chunks.dedup_by(|a, b| a.chunk_id == b.chunk_id);

        let mut postings: HashMap<String, Vec<Posting>> = HashMap::new();
        let mut lengths = Vec::with_capacity(chunks.len());

        for (slot, chunk) in chunks.iter().enumerate() {
            let tokens = tokenize(&chunk.text);
            lengths.push(tokens.len() as u32);

            let mut tf: HashMap<String, u32> = HashMap::new();
            for token in tokens {
                *tf.entry(token).or_insert(0) += 1;
            }
            for (term, count) in tf {
                postings.entry(term).or_default().push(Posting { slot, tf: count });
            }
        }

        let avg_length = if lengths.is_empty() {
            0.0
        } else {
            lengths.iter().map(|l| *l as f64).sum::<f64>() / lengths.len() as f64
        };
        Self {
            version,
            chunks,
            postings,
            lengths,
            avg_length,
        }
    }

    /// A new version containing this snapshot's chunks plus `additions`.
    /// An addition replaces an existing chunk with the same id.
    pub fn extend(&self, version: u64, additions: Vec<IndexedChunk>) -> Self {
        let replaced: HashSet<&str> = additions.iter().map(|c| c.chunk_id.as_str()).collect();
        let mut all: Vec<IndexedChunk> = self
            .chunks
            .iter()
            .filter(|c| !replaced.contains(c.chunk_id.as_str()))
            .cloned()
            .collect();
        all.extend(additions);
        Self::build(version, all)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunk(&self, slot: usize) -> &IndexedChunk {
        &self.chunks[slot]
    }

    /// BM25 score for every chunk containing at least one query term.
    pub fn keyword_scores(&self, query_terms: &[String]) -> Vec<(usize, f64)> {
        let n = self.chunks.len() as f64;
        let avg = self.avg_length.max(f64::EPSILON);
        let unique: HashSet<&String> = query_terms.iter().collect();
        let mut scores: HashMap<usize, f64> = HashMap::new();

        for term in unique {
            let Some(list) = self.postings.get(term) else {
                continue;
            };
            let df = list.len() as f64;
            let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
            for p in list {
                let tf = p.tf as f64;
                let dl = self.lengths[p.slot] as f64;
                let denom = tf + K1 * (1.0 - B + B * dl / avg);
                *scores.entry(p.slot).or_insert(0.0) += idf * tf * (K1 + 1.0) / denom;
            }
        }

        scores.into_iter().collect()
    }

    /// Cosine similarity for every chunk with a strictly positive score.
    pub fn vector_scores(&self, query: &[f32]) -> Vec<(usize, f64)> {
        self.chunks
            .iter()
            .enumerate()
            .filter_map(|(slot, c)| {
                let sim = cosine_similarity(query, &c.embedding) as f64;
                (sim > 0.0).then_some((slot, sim))
            })
            .collect()
    }
}

/// Owner of the current snapshot and the single-build permit.
pub struct IndexEngine {
    current: RwLock<Arc<IndexSnapshot>>,
    build_lock: Arc<Mutex<()>>,
}

/// Held for the duration of one index build.
pub struct BuildPermit {
    _guard: OwnedMutexGuard<()>,
}

impl IndexEngine {
    pub fn new(snapshot: IndexSnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
            build_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn snapshot(&self) -> Arc<IndexSnapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_loaded(&self) -> bool {
        !self.snapshot().is_empty()
    }

    /// Claims the build permit, or fails if another build holds it.
    pub fn try_begin_build(&self) -> Result<BuildPermit, PipelineError> {
        self.build_lock
            .clone()
            .try_lock_owned()
            .map(|guard| BuildPermit { _guard: guard })
            .map_err(|_| PipelineError::StageBusy(Stage::Index))
    }

    fn install(&self, snapshot: Arc<IndexSnapshot>) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = snapshot;
    }
}

/// Result of one `build_index` call.
#[derive(Debug, Clone, serde::Serialize)]
pub struct IndexReport {
    pub status: String,
    pub chunks_indexed: u64,
    pub documents_processed: u64,
    pub index_version: u64,
    pub message: String,
}

/// Loads the latest snapshot from the database, keeping only vectors made by
/// `model` with `dims` dimensions.
pub async fn load_snapshot(pool: &SqlitePool, model: &str, dims: usize) -> anyhow::Result<IndexSnapshot> {
    let version: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM index_builds")
        .fetch_one(pool)
        .await?;

    let rows = sqlx::query(
        r#"
        SELECT c.chunk_id, c.doc_id, c.chunk_index, c.text, p.title, p.category, v.embedding
        FROM chunks c
        JOIN chunk_vectors v ON v.chunk_id = c.chunk_id AND v.model = ? AND v.dims = ?
        JOIN papers p ON p.doc_id = c.doc_id
        WHERE c.indexed_version IS NOT NULL
        "#,
    )
    .bind(model)
    .bind(dims as i64)
    .fetch_all(pool)
    .await?;

    let stale: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM chunk_vectors WHERE model != ? OR dims != ?",
    )
    .bind(model)
    .bind(dims as i64)
    .fetch_one(pool)
    .await?;
    if stale > 0 {
        warn!(
            stale,
            model, dims, "chunk vectors from another embedding model; the next index build re-embeds them"
        );
    }

    let chunks = rows
        .iter()
        .map(|row| {
            let blob: Vec<u8> = row.get("embedding");
            IndexedChunk {
                chunk_id: row.get("chunk_id"),
                doc_id: row.get("doc_id"),
                text: row.get("text"),
                metadata: ChunkMetadata {
                    title: row.get("title"),
                    category: row.get("category"),
                    chunk_index: row.get("chunk_index"),
                },
                embedding: blob_to_vec(&blob),
            }
        })
        .collect();

    Ok(IndexSnapshot::build(version.max(0) as u64, chunks))
}

struct PendingChunk {
    chunk_id: String,
    doc_id: String,
    text: String,
    metadata: ChunkMetadata,
}

/// Chunks never indexed, plus indexed chunks whose stored vector was made
/// by a different model or dimension.
async fn find_pending_chunks(
    pool: &SqlitePool,
    model: &str,
    dims: usize,
) -> Result<Vec<PendingChunk>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT c.chunk_id, c.doc_id, c.chunk_index, c.text, p.title, p.category
        FROM chunks c
        JOIN papers p ON p.doc_id = c.doc_id
        LEFT JOIN chunk_vectors v ON v.chunk_id = c.chunk_id AND v.model = ? AND v.dims = ?
        WHERE c.indexed_version IS NULL OR v.chunk_id IS NULL
        ORDER BY c.doc_id, c.chunk_index
        "#,
    )
    .bind(model)
    .bind(dims as i64)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| PendingChunk {
            chunk_id: row.get("chunk_id"),
            doc_id: row.get("doc_id"),
            text: row.get("text"),
            metadata: ChunkMetadata {
                title: row.get("title"),
                category: row.get("category"),
                chunk_index: row.get("chunk_index"),
            },
        })
        .collect())
}

/// Indexes every chunk not yet indexed and installs the new snapshot.
///
/// Embeddings for all pending chunks are computed before anything is
/// written; the vectors and `indexed_version` marks are then committed in
/// one transaction, and only after the commit is the new snapshot
/// installed. A failure at any point leaves the previous version in place.
#[tracing::instrument(skip_all)]
pub async fn run_build(p: &Pipeline, _permit: BuildPermit) -> Result<IndexReport, PipelineError> {
    let _activity = p.registry.begin(Stage::Index);
    let current = p.index.snapshot();

    let model = p.embedder.model_name().to_string();
    let dims = p.embedder.dims();
    let pending = {
        let _gate = p.commit_lock.lock().await;
        find_pending_chunks(&p.pool, &model, dims).await?
    };

    if pending.is_empty() {
        info!(version = current.version(), "index up to date");
        return Ok(IndexReport {
            status: "up_to_date".to_string(),
            chunks_indexed: 0,
            documents_processed: 0,
            index_version: current.version(),
            message: "No new chunks to index".to_string(),
        });
    }

    let mut vectors = Vec::with_capacity(pending.len());
    for batch in pending.chunks(p.config.embedding.batch_size) {
        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
        let embedded = p.embedder.embed(&texts).await.map_err(|e| {
            PipelineError::Internal(e.context("embedding provider failed; index left unchanged"))
        })?;
        if embedded.len() != texts.len() {
            return Err(anyhow!(
                "embedding provider returned {} vectors for {} chunks",
                embedded.len(),
                texts.len()
            )
            .into());
        }
        if let Some(bad) = embedded.iter().find(|v| v.len() != dims) {
            return Err(anyhow!(
                "embedding provider {} returned a {}-dimensional vector; expected {}",
                model,
                bad.len(),
                dims
            )
            .into());
        }
        vectors.extend(embedded);
    }

    let version = current.version() + 1;
    let chunks_indexed = pending.len() as u64;
    let documents_processed = pending
        .iter()
        .map(|c| c.doc_id.as_str())
        .collect::<HashSet<_>>()
        .len() as u64;

    let additions: Vec<IndexedChunk> = pending
        .into_iter()
        .zip(vectors)
        .map(|(c, embedding)| IndexedChunk {
            chunk_id: c.chunk_id,
            doc_id: c.doc_id,
            text: c.text,
            metadata: c.metadata,
            embedding,
        })
        .collect();

    let _gate = p.commit_lock.lock().await;
    let mut tx = p.pool.begin().await?;
    for chunk in &additions {
        sqlx::query(
            r#"
            INSERT INTO chunk_vectors (chunk_id, doc_id, model, dims, embedding)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(chunk_id) DO UPDATE SET
                model = excluded.model,
                dims = excluded.dims,
                embedding = excluded.embedding
            "#,
        )
        .bind(&chunk.chunk_id)
        .bind(&chunk.doc_id)
        .bind(&model)
        .bind(dims as i64)
        .bind(vec_to_blob(&chunk.embedding))
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE chunks SET indexed_version = ? WHERE chunk_id = ?")
            .bind(version as i64)
            .bind(&chunk.chunk_id)
            .execute(&mut *tx)
            .await?;
    }
    sqlx::query(
        "INSERT INTO index_builds (version, built_at, chunks_indexed, documents_processed) VALUES (?, ?, ?, ?)",
    )
    .bind(version as i64)
    .bind(chrono::Utc::now().timestamp())
    .bind(chunks_indexed as i64)
    .bind(documents_processed as i64)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    let next = Arc::new(current.extend(version, additions));
    let added = next.len().saturating_sub(current.len()) as u64;
    p.index.install(next);
    p.registry.record_chunks_indexed(added);

    info!(version, chunks_indexed, documents_processed, "index build complete");

    Ok(IndexReport {
        status: "success".to_string(),
        chunks_indexed,
        documents_processed,
        index_version: version,
        message: format!(
            "Indexed {} chunks from {} papers (index version {})",
            chunks_indexed, documents_processed, version
        ),
    })
}

#[cfg(test)]
impl IndexSnapshot {
    fn chunk_ids(&self) -> impl Iterator<Item = &str> {
        self.chunks.iter().map(|c| c.chunk_id.as_str())
    }

    fn keyword_chunk_ids(&self) -> HashSet<&str> {
        self.postings
            .values()
            .flatten()
            .map(|p| self.chunks[p.slot].chunk_id.as_str())
            .collect()
    }

    fn document_count(&self) -> usize {
        self.chunks
            .iter()
            .map(|c| c.doc_id.as_str())
            .collect::<HashSet<_>>()
            .len()
    }
}
