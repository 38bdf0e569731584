//! Keyword, vector, and hybrid retrieval over an [`IndexSnapshot`].
//!
//! # Search Modes
//!
//! | Mode | Ranking |
//! |------|---------|
//! | `keyword` | BM25 over chunk text |
//! | `vector` | Cosine similarity of query and chunk embeddings |
//! | `hybrid` | Reciprocal Rank Fusion of the two rankings |
//!
//! # Hybrid Fusion
//!
//! Both rankings are computed independently and truncated to a candidate
//! depth of `max(4 × top_k, 20)`. Each chunk then scores
//!
//! ```text
//! score = Σ  1 / (60 + rank)
//! ```
//!
//! over the rankings it appears in (rank is 1-based). The weighting is
//! fixed: keyword and vector lists contribute equally and `k = 60`. Rank
//! fusion sidesteps the incompatible scales of BM25 and cosine scores.
//!
//! In every mode ties are broken by `chunk_id` ascending, so identical
//! index + query + `top_k` always produce identical output.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::embedding::{embed_query, EmbeddingProvider};
use crate::index::{tokenize, IndexSnapshot};
use crate::models::ChunkMetadata;

/// Reciprocal Rank Fusion constant.
pub const RRF_K: f64 = 60.0;
/// Lower bound on per-ranking candidate depth in hybrid mode.
const MIN_CANDIDATES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Keyword,
    Vector,
    #[default]
    Hybrid,
}

impl FromStr for SearchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keyword" => Ok(SearchMode::Keyword),
            "vector" => Ok(SearchMode::Vector),
            "hybrid" => Ok(SearchMode::Hybrid),
            other => Err(format!(
                "Unknown search mode: {}. Use keyword, vector, or hybrid.",
                other
            )),
        }
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SearchMode::Keyword => "keyword",
            SearchMode::Vector => "vector",
            SearchMode::Hybrid => "hybrid",
        })
    }
}

/// One ranked chunk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub chunk_id: String,
    pub doc_id: String,
    pub text: String,
    pub score: f64,
    pub metadata: ChunkMetadata,
}

/// Runs a query against `snapshot`.
///
/// An empty or whitespace-only query, `top_k = 0`, or an empty snapshot
/// yields an empty list. Only `vector` and `hybrid` touch the embedding
/// provider.
pub async fn search(
    snapshot: &IndexSnapshot,
    embedder: &dyn EmbeddingProvider,
    query: &str,
    top_k: usize,
    mode: SearchMode,
) -> anyhow::Result<Vec<SearchHit>> {
    if query.trim().is_empty() || top_k == 0 || snapshot.is_empty() {
        return Ok(Vec::new());
    }

    let ranked = match mode {
        SearchMode::Keyword => {
            let mut ranked = snapshot.keyword_scores(&tokenize(query));
            sort_ranked(&mut ranked);
            ranked
        }
        SearchMode::Vector => {
            let q = embed_query(embedder, query).await?;
            let mut ranked = snapshot.vector_scores(&q);
            sort_ranked(&mut ranked);
            ranked
        }
        SearchMode::Hybrid => {
            let depth = (top_k * 4).max(MIN_CANDIDATES);

            let mut keyword = snapshot.keyword_scores(&tokenize(query));
            sort_ranked(&mut keyword);
            keyword.truncate(depth);

            let q = embed_query(embedder, query).await?;
            let mut vector = snapshot.vector_scores(&q);
            sort_ranked(&mut vector);
            vector.truncate(depth);

            let mut fused = reciprocal_rank_fusion(&[keyword.as_slice(), vector.as_slice()]);
            sort_ranked(&mut fused);
            fused
        }
    };

    Ok(ranked
        .into_iter()
        .take(top_k)
        .map(|(slot, score)| {
            let c = snapshot.chunk(slot);
            SearchHit {
                chunk_id: c.chunk_id.clone(),
                doc_id: c.doc_id.clone(),
                text: c.text.clone(),
                score,
                metadata: c.metadata.clone(),
            }
        })
        .collect())
}

/// Fuses ranked lists (each already sorted best-first) by summing
/// `1 / (RRF_K + rank)`.
fn reciprocal_rank_fusion(rankings: &[&[(usize, f64)]]) -> Vec<(usize, f64)> {
    let mut fused: HashMap<usize, f64> = HashMap::new();
    for ranking in rankings {
        for (i, (slot, _)) in ranking.iter().enumerate() {
            *fused.entry(*slot).or_insert(0.0) += 1.0 / (RRF_K + (i + 1) as f64);
        }
    }
    fused.into_iter().collect()
}

/// Score descending, then slot ascending. Slots follow `chunk_id` order, so
/// this is the `chunk_id` tie-break.
fn sort_ranked(ranked: &mut [(usize, f64)]) {
    ranked.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashProvider;
    use crate::index::IndexedChunk;

    fn snapshot(embedder: &HashProvider, texts: &[(&str, &str)]) -> IndexSnapshot {
        let chunks = texts
            .iter()
            .map(|(id, text)| IndexedChunk {
                chunk_id: id.to_string(),
                doc_id: id.split('_').next().unwrap().to_string(),
                text: text.to_string(),
                metadata: ChunkMetadata {
                    title: "t".into(),
                    category: "cs.CL".into(),
                    chunk_index: 0,
                },
                embedding: embedder.embed_one(text),
            })
            .collect();
        IndexSnapshot::build(1, chunks)
    }

    fn corpus(embedder: &HashProvider) -> IndexSnapshot {
        snapshot(
            embedder,
            &[
                ("p1_chunk_0000", "Self-attention lets transformers relate tokens."),
                ("p1_chunk_0001", "Multi-head attention splits the representation."),
                ("p2_chunk_0000", "Recurrent networks process tokens sequentially."),
                ("p3_chunk_0000", "Protein folding predicted by deep networks."),
                ("p4_chunk_0000", "Attention heads can be pruned after training."),
            ],
        )
    }

    #[tokio::test]
    async fn test_empty_query_returns_nothing() {
        let e = HashProvider::new(128);
        let snap = corpus(&e);
        for mode in [SearchMode::Keyword, SearchMode::Vector, SearchMode::Hybrid] {
            assert!(search(&snap, &e, "", 5, mode).await.unwrap().is_empty());
            assert!(search(&snap, &e, "   ", 5, mode).await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_empty_index_returns_nothing() {
        let e = HashProvider::new(128);
        let snap = IndexSnapshot::empty();
        for mode in [SearchMode::Keyword, SearchMode::Vector, SearchMode::Hybrid] {
            assert!(search(&snap, &e, "attention", 5, mode).await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_keyword_ranks_matching_chunks_only() {
        let e = HashProvider::new(128);
        let snap = corpus(&e);
        let hits = search(&snap, &e, "attention", 10, SearchMode::Keyword)
            .await
            .unwrap();
        assert_eq!(hits.len(), 3);
        assert!(hits.iter().all(|h| h.text.to_lowercase().contains("attention")));
    }

    #[tokio::test]
    async fn test_keyword_ties_broken_by_chunk_id() {
        let e = HashProvider::new(128);
        let snap = snapshot(
            &e,
            &[
                ("c_chunk_0000", "graph networks"),
                ("a_chunk_0000", "graph networks"),
                ("b_chunk_0000", "graph networks"),
            ],
        );
        let hits = search(&snap, &e, "graph", 3, SearchMode::Keyword)
            .await
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["a_chunk_0000", "b_chunk_0000", "c_chunk_0000"]);
    }

    #[tokio::test]
    async fn test_hybrid_respects_top_k_and_ordering() {
        let e = HashProvider::new(128);
        let snap = corpus(&e);
        for k in 1..=6 {
            let hits = search(&snap, &e, "attention in transformers", k, SearchMode::Hybrid)
                .await
                .unwrap();
            assert!(hits.len() <= k);
            for pair in hits.windows(2) {
                assert!(pair[0].score >= pair[1].score);
            }
        }
    }

    #[tokio::test]
    async fn test_hybrid_is_reproducible() {
        let e = HashProvider::new(128);
        let snap = corpus(&e);
        let a = search(&snap, &e, "attention tokens", 4, SearchMode::Hybrid)
            .await
            .unwrap();
        let b = search(&snap, &e, "attention tokens", 4, SearchMode::Hybrid)
            .await
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0].chunk_id, "p1_chunk_0000");
    }

    #[test]
    fn test_rrf_rewards_agreement() {
        let keyword = vec![(0usize, 9.0), (1, 5.0)];
        let vector = vec![(1usize, 0.9), (2, 0.8)];
        let mut fused = reciprocal_rank_fusion(&[keyword.as_slice(), vector.as_slice()]);
        sort_ranked(&mut fused);
        assert_eq!(fused[0].0, 1);
        assert!((fused[0].1 - (1.0 / 62.0 + 1.0 / 61.0)).abs() < 1e-12);
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("vector".parse::<SearchMode>().unwrap(), SearchMode::Vector);
        assert!("semantic".parse::<SearchMode>().is_err());
    }
}
