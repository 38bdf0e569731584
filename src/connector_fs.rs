use anyhow::{Context, Result};
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::SourceConfig;
use crate::models::Paper;
use crate::sources::{PaperSource, SourceError, SourceQuery};

/// Offline source reading paper records from `*.json` files under a root
/// directory. Each file holds one [`Paper`] or an array of them.
pub struct DirectorySource {
    root: PathBuf,
    include: GlobSet,
    exclude: GlobSet,
}

impl DirectorySource {
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let root = config
            .root
            .clone()
            .ok_or_else(|| anyhow::anyhow!("source.root must be set for the directory source"))?;
        Self::with_globs(root, &config.include_globs, &config.exclude_globs)
    }

    pub fn with_globs(root: PathBuf, include: &[String], exclude: &[String]) -> Result<Self> {
        let mut default_excludes = vec!["**/.git/**".to_string()];
        default_excludes.extend(exclude.iter().cloned());
        Ok(Self {
            root,
            include: build_globset(include)?,
            exclude: build_globset(&default_excludes)?,
        })
    }

    fn scan(&self) -> Result<Vec<Paper>, SourceError> {
        if !self.root.exists() {
            return Err(SourceError::Unreachable {
                url: self.root.display().to_string(),
                message: "directory does not exist".to_string(),
            });
        }

        let mut papers = Vec::new();
        for entry in WalkDir::new(&self.root) {
            let entry = entry.map_err(|e| SourceError::Io(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let relative = path.strip_prefix(&self.root).unwrap_or(path);
            let rel_str = relative.to_string_lossy();

            if self.exclude.is_match(rel_str.as_ref()) || !self.include.is_match(rel_str.as_ref()) {
                continue;
            }

            match read_records(path) {
                Ok(records) => papers.extend(records),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable paper record"),
            }
        }

        // Sort for deterministic paging
        papers.sort_by(|a, b| a.doc_id.cmp(&b.doc_id));
        papers.dedup_by(|a, b| a.doc_id == b.doc_id);
        Ok(papers)
    }
}

#[async_trait]
impl PaperSource for DirectorySource {
    fn name(&self) -> &str {
        "directory"
    }

    async fn fetch(&self, query: &SourceQuery) -> Result<Vec<Paper>, SourceError> {
        let needle = query
            .query
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(str::to_lowercase);

        let matching = self.scan()?.into_iter().filter(|p| {
            p.category == query.category
                && needle.as_ref().map_or(true, |n| {
                    p.title.to_lowercase().contains(n) || p.abstract_text.to_lowercase().contains(n)
                })
        });

        Ok(matching.skip(query.start).take(query.max_results).collect())
    }
}

fn read_records(path: &Path) -> Result<Vec<Paper>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&content)?;
    let records = if value.is_array() {
        serde_json::from_value(value)?
    } else {
        vec![serde_json::from_value(value)?]
    };
    Ok(records)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
