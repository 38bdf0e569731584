//! Paper source abstraction.
//!
//! A [`PaperSource`] turns a category plus optional free-text query into a
//! page of [`Paper`] records. Two implementations ship with the crate:
//!
//! | Provider | Type | Notes |
//! |----------|------|-------|
//! | `arxiv` | [`ArxivSource`](crate::connector_arxiv::ArxivSource) | Atom API over HTTP |
//! | `directory` | [`DirectorySource`](crate::connector_fs::DirectorySource) | Local `*.json` paper records |
//!
//! Sources never touch the database. Deduplication and persistence happen in
//! [`collect`](crate::collect).

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::Config;
use crate::connector_arxiv::ArxivSource;
use crate::connector_fs::DirectorySource;
use crate::models::Paper;

/// One page request against a source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceQuery {
    pub category: String,
    pub query: Option<String>,
    /// Zero-based offset into the result list.
    pub start: usize,
    pub max_results: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("could not reach {url}: {message}")]
    Unreachable { url: String, message: String },

    #[error("source returned HTTP {status}")]
    Http { status: u16 },

    #[error("malformed source response: {0}")]
    Parse(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait PaperSource: Send + Sync {
    fn name(&self) -> &str;

    /// Fetches one page. An empty vector means the source is exhausted.
    async fn fetch(&self, query: &SourceQuery) -> Result<Vec<Paper>, SourceError>;
}

/// Builds the source named by `source.provider`.
pub fn create_source(config: &Config) -> anyhow::Result<Arc<dyn PaperSource>> {
    match config.source.provider.as_str() {
        "arxiv" => Ok(Arc::new(ArxivSource::new(&config.source)?)),
        "directory" => Ok(Arc::new(DirectorySource::new(&config.source)?)),
        other => anyhow::bail!("Unknown source provider: {}", other),
    }
}
