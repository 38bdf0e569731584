//! Core data models used throughout Paper Harness.
//!
//! These types represent the papers, chunks, and synthetic QA pairs that flow
//! through the collect → index → synthesize pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A paper record as produced by a [`PaperSource`](crate::sources::PaperSource).
///
/// The same shape is used for the JSON files read by the directory source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Paper {
    pub doc_id: String,
    pub category: String,
    pub title: String,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(rename = "abstract", default)]
    pub abstract_text: String,
    #[serde(default)]
    pub full_text: String,
    #[serde(default)]
    pub published: Option<DateTime<Utc>>,
    #[serde(default)]
    pub source_url: Option<String>,
}

impl Paper {
    /// Text that is chunked and indexed for this paper.
    pub fn body(&self) -> String {
        let mut parts = Vec::with_capacity(3);
        for part in [&self.title, &self.abstract_text, &self.full_text] {
            let trimmed = part.trim();
            if !trimmed.is_empty() {
                parts.push(trimmed);
            }
        }
        parts.join("\n\n")
    }
}

/// A chunk of a paper's text.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub chunk_id: String,
    pub doc_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub hash: String,
}

/// Attribution metadata attached to every indexed chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub title: String,
    pub category: String,
    pub chunk_index: i64,
}

/// One instruction/answer pair in the synthetic dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaPair {
    pub source_doc_id: String,
    pub question: String,
    pub answer: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub generated_at: DateTime<Utc>,
    /// The pair rendered in the instruction-tuning chat template.
    pub text: String,
}
