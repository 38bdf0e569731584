//! Append-only JSONL store for synthetic QA pairs.
//!
//! One [`QaPair`] per line. Each append is a single `write_all` followed by
//! `sync_data`, so a crash loses at most the batch being written and never
//! leaves earlier lines damaged. Readers skip lines that fail to parse, and
//! an append after a torn final line starts on a fresh line.
//!
//! [`split`] divides the pairs into training and held-out validation sets
//! for fine-tuning and evaluation.

use sha2::{Digest, Sha256};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::models::QaPair;

#[derive(Debug, Clone)]
pub struct Dataset {
    path: PathBuf,
}

impl Dataset {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, pairs: &[QaPair]) -> anyhow::Result<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut buf = String::new();
        if ends_mid_line(&self.path)? {
            buf.push('\n');
        }
        for pair in pairs {
            buf.push_str(&serde_json::to_string(pair)?);
            buf.push('\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(buf.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    /// Number of well-formed pairs. A missing file counts as empty.
    pub fn count(&self) -> anyhow::Result<u64> {
        Ok(self.read_all()?.len() as u64)
    }

    pub fn read_all(&self) -> anyhow::Result<Vec<QaPair>> {
        let file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut pairs = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<QaPair>(&line) {
                Ok(pair) => pairs.push(pair),
                Err(e) => tracing::debug!(error = %e, "skipping malformed dataset line"),
            }
        }
        Ok(pairs)
    }
}

/// True when the file exists, is non-empty and its last byte is not a
/// newline.
fn ends_mid_line(path: &Path) -> std::io::Result<bool> {
    let mut file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

#[derive(Debug, Default)]
pub struct Split {
    pub train: Vec<QaPair>,
    pub validation: Vec<QaPair>,
}

/// Whether `pair` is held out at `ratio`. Membership depends only on the
/// pair's paper and question, so a pair keeps its side as the dataset grows.
pub fn is_held_out(pair: &QaPair, ratio: f64) -> bool {
    if ratio <= 0.0 {
        return false;
    }
    let digest = Sha256::new()
        .chain_update(pair.source_doc_id.as_bytes())
        .chain_update([0u8])
        .chain_update(pair.question.as_bytes())
        .finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(head) as f64 / u64::MAX as f64) < ratio
}

/// Partitions `pairs` by [`is_held_out`]. Training never comes out empty:
/// if every pair would be held out, all of them train instead.
pub fn split(pairs: Vec<QaPair>, ratio: f64) -> Split {
    let (validation, train): (Vec<QaPair>, Vec<QaPair>) =
        pairs.into_iter().partition(|p| is_held_out(p, ratio));
    if train.is_empty() {
        return Split {
            train: validation,
            validation: Vec::new(),
        };
    }
    Split { train, validation }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn pair(q: &str) -> QaPair {
        QaPair {
            source_doc_id: "2401.00001".into(),
            question: q.into(),
            answer: "a".into(),
            kind: "factual".into(),
            generated_at: Utc::now(),
            text: "t".into(),
        }
    }

    #[test]
    fn test_missing_file_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let ds = Dataset::new(tmp.path().join("none.jsonl"));
        assert_eq!(ds.count().unwrap(), 0);
    }

    #[test]
    fn test_append_creates_parents_and_accumulates() {
        let tmp = tempfile::tempdir().unwrap();
        let ds = Dataset::new(tmp.path().join("synthetic/qa.jsonl"));
        ds.append(&[pair("one"), pair("two")]).unwrap();
        ds.append(&[pair("three")]).unwrap();
        let all = ds.read_all().unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[2].question, "three");
    }

    #[test]
    fn test_malformed_lines_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let ds = Dataset::new(tmp.path().join("qa.jsonl"));
        ds.append(&[pair("ok")]).unwrap();
        let mut f = OpenOptions::new().append(true).open(ds.path()).unwrap();
        f.write_all(b"{\"truncated\": \n").unwrap();
        assert_eq!(ds.count().unwrap(), 1);
    }

    #[test]
    fn test_append_after_torn_line_starts_fresh_line() {
        let tmp = tempfile::tempdir().unwrap();
        let ds = Dataset::new(tmp.path().join("qa.jsonl"));
        ds.append(&[pair("before")]).unwrap();
        let mut f = OpenOptions::new().append(true).open(ds.path()).unwrap();
        f.write_all(b"{\"source_doc_id\": \"24").unwrap();
        drop(f);

        ds.append(&[pair("after")]).unwrap();
        let questions: Vec<String> = ds.read_all().unwrap().into_iter().map(|p| p.question).collect();
        assert_eq!(questions, vec!["before", "after"]);
    }

    #[test]
    fn test_split_is_stable_as_dataset_grows() {
        let all: Vec<QaPair> = (0..200).map(|i| pair(&format!("question {}", i))).collect();
        let small = split(all[..100].to_vec(), 0.5);
        let large = split(all.clone(), 0.5);

        assert_eq!(small.train.len() + small.validation.len(), 100);
        assert!((60..=140).contains(&large.validation.len()));
        for held in &small.validation {
            assert!(large.validation.iter().any(|p| p.question == held.question));
        }
    }

    #[test]
    fn test_split_without_ratio_trains_on_everything() {
        let pairs = vec![pair("a"), pair("b")];
        let s = split(pairs, 0.0);
        assert_eq!(s.train.len(), 2);
        assert!(s.validation.is_empty());
    }

    #[test]
    fn test_split_never_leaves_training_empty() {
        let held = (0..50)
            .map(|i| pair(&format!("q{}", i)))
            .find(|p| is_held_out(p, 0.5))
            .unwrap();
        let s = split(vec![held], 0.5);
        assert_eq!(s.train.len(), 1);
        assert!(s.validation.is_empty());
    }
}
