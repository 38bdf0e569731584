//! In-process collaborators shared by the library and HTTP tests.

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use paper_harness::config::{parse_config, Config};
use paper_harness::embedding::HashProvider;
use paper_harness::llm::{CompletionRequest, ExtractiveGenerator, LlmError, TextGenerator};
use paper_harness::models::Paper;
use paper_harness::pipeline::{Collaborators, Pipeline};
use paper_harness::sources::{PaperSource, SourceError, SourceQuery};
use paper_harness::trainer::{ProgressFn, Trainer, TrainingOutcome, TrainingProgress, TrainingRequest};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Notify;

const TOPICS: &[(&str, &str)] = &[
    ("Attention Mechanisms in Transformers", "Self-attention relates every token to every other token. Multi-head attention runs attention in parallel."),
    ("Retrieval Augmented Generation", "A retriever selects passages that ground the answers of a generator."),
    ("Low Rank Adaptation", "LoRA freezes pretrained weights and trains low rank update matrices."),
    ("Instruction Tuning", "Models fine-tuned on instructions follow unseen instructions better."),
    ("Tokenization with Byte Pair Encoding", "BPE merges frequent symbol pairs into subword units."),
    ("Dense Passage Retrieval", "Dual encoders embed questions and passages into one vector space."),
    ("Chain of Thought Prompting", "Intermediate reasoning steps improve arithmetic and commonsense tasks."),
    ("Mixture of Experts", "A router sends each token to a small subset of expert networks."),
    ("Speculative Decoding", "A draft model proposes tokens that a large model verifies in parallel."),
    ("Quantized Fine-Tuning", "Four-bit quantization lets adapters train on a single GPU."),
    ("Contrastive Sentence Embeddings", "Contrastive objectives pull paraphrases together in embedding space."),
    ("Long Context Transformers", "Sparse attention patterns extend the usable context window."),
];

pub fn sample_papers(category: &str) -> Vec<Paper> {
    TOPICS
        .iter()
        .enumerate()
        .map(|(i, (title, abstract_text))| Paper {
            doc_id: format!("2401.{:05}", i + 1),
            category: category.to_string(),
            title: title.to_string(),
            authors: vec!["A. Author".to_string()],
            abstract_text: abstract_text.to_string(),
            full_text: String::new(),
            published: None,
            source_url: None,
        })
        .collect()
}

/// Serves a fixed paper list, paging by `start` and `max_results`.
pub struct MockSource {
    pub papers: Vec<Paper>,
    pub fail: AtomicBool,
    /// Every fetch from this call number on fails.
    pub fail_from_call: AtomicUsize,
    pub calls: AtomicUsize,
}

impl MockSource {
    pub fn new(papers: Vec<Paper>) -> Self {
        Self {
            papers,
            fail: AtomicBool::new(false),
            fail_from_call: AtomicUsize::new(usize::MAX),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl PaperSource for MockSource {
    fn name(&self) -> &str {
        "mock"
    }

    async fn fetch(&self, query: &SourceQuery) -> Result<Vec<Paper>, SourceError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) || call >= self.fail_from_call.load(Ordering::SeqCst) {
            return Err(SourceError::Unreachable {
                url: "mock://papers".to_string(),
                message: "connection refused".to_string(),
            });
        }
        Ok(self
            .papers
            .iter()
            .filter(|p| p.category == query.category)
            .skip(query.start)
            .take(query.max_results)
            .cloned()
            .collect())
    }
}

#[derive(Debug, Clone, Copy)]
pub enum SynthFailure {
    Status(u16),
    Timeout,
}

/// Answers every generation request with five distinct QA pairs, until
/// `fail_after` calls have been answered.
#[derive(Default)]
pub struct MockSynthesizer {
    pub calls: AtomicUsize,
    pub fail_after: Option<(usize, SynthFailure)>,
}

impl MockSynthesizer {
    pub fn failing_after(calls: usize, failure: SynthFailure) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_after: Some((calls, failure)),
        }
    }
}

#[async_trait]
impl TextGenerator for MockSynthesizer {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(&self, _request: &CompletionRequest) -> Result<String, LlmError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some((answered, failure)) = self.fail_after {
            if call >= answered {
                return Err(match failure {
                    SynthFailure::Status(status) => LlmError::Api {
                        status,
                        body: "mock failure".to_string(),
                    },
                    SynthFailure::Timeout => LlmError::Timeout(1),
                });
            }
        }
        let pairs: Vec<serde_json::Value> = (0..5)
            .map(|i| {
                serde_json::json!({
                    "question": format!("Question {} of call {}?", i, call),
                    "answer": format!("Answer {} of call {}.", i, call),
                    "type": "factual",
                })
            })
            .collect();
        Ok(serde_json::Value::Array(pairs).to_string())
    }
}

/// Trains instantly unless gated; a gated trainer waits for `release`.
#[derive(Default)]
pub struct MockTrainer {
    pub gated: bool,
    pub release: Notify,
    pub fail: bool,
}

impl MockTrainer {
    pub fn gated() -> Self {
        Self {
            gated: true,
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl Trainer for MockTrainer {
    fn name(&self) -> &str {
        "mock"
    }

    fn is_available(&self) -> Result<(), String> {
        Ok(())
    }

    async fn train(&self, _request: &TrainingRequest, progress: ProgressFn<'_>) -> Result<TrainingOutcome> {
        progress(TrainingProgress {
            step: 1,
            epoch: 0.5,
            loss: Some(1.9),
        });
        if self.gated {
            self.release.notified().await;
        }
        if self.fail {
            anyhow::bail!("CUDA out of memory");
        }
        Ok(TrainingOutcome {
            train_loss: 1.25,
            train_runtime: 3.5,
        })
    }
}

pub struct Harness {
    pub tmp: TempDir,
    pub config: Config,
    pub source: Arc<MockSource>,
    pub synthesizer: Arc<MockSynthesizer>,
    pub trainer: Arc<MockTrainer>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_trainer(MockTrainer::default())
    }

    pub fn with_trainer(trainer: MockTrainer) -> Self {
        Self::build(trainer, MockSynthesizer::default())
    }

    pub fn with_synthesizer(synthesizer: MockSynthesizer) -> Self {
        Self::build(MockTrainer::default(), synthesizer)
    }

    fn build(trainer: MockTrainer, synthesizer: MockSynthesizer) -> Self {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().display().to_string();
        let config = parse_config(&format!(
            r#"
[db]
path = "{root}/ph.sqlite"

[storage]
data_dir = "{root}/data"

[chunking]
max_tokens = 64
overlap_tokens = 8

[embedding]
provider = "hash"
dims = 64

[source]
page_size = 4
request_delay_ms = 0

[training]
timeout_secs = 30
"#
        ))
        .unwrap();

        Self {
            tmp,
            config,
            source: Arc::new(MockSource::new(sample_papers("cs.CL"))),
            synthesizer: Arc::new(synthesizer),
            trainer: Arc::new(trainer),
        }
    }

    pub async fn open(&self) -> Pipeline {
        self.open_with_embedding_dims(64).await
    }

    pub async fn open_with_embedding_dims(&self, dims: usize) -> Pipeline {
        let collaborators = Collaborators {
            embedder: Arc::new(HashProvider::new(dims)),
            source: self.source.clone(),
            synthesizer: self.synthesizer.clone(),
            inference: Arc::new(ExtractiveGenerator::default()),
            trainer: self.trainer.clone(),
        };
        Pipeline::open_with(self.config.clone(), collaborators)
            .await
            .unwrap()
    }
}
