//! Pipeline orchestrator.
//!
//! [`Pipeline`] owns the database pool, the collaborators, the index engine,
//! the status registry and the job slot. Every surface (CLI, HTTP, library
//! callers) goes through it.
//!
//! # Stage ordering
//!
//! ```text
//! collect ──► build_index ──► generate ──► finetune
//!                  │                          │
//!                  └──────► search/chat ◄─────┘
//! ```
//!
//! Each stage commits its durable output and its registry increment while
//! holding `commit_lock`, and a downstream stage selects its inputs under
//! the same lock. A stage therefore never consumes upstream output whose
//! count has not been registered yet.
//!
//! # Foreground and background
//!
//! The `collect`, `build_index`, `generate` and `finetune` methods run a
//! stage to completion. The `submit_*` variants check every precondition
//! that needs no work (validation, busy guards, credentials, the job slot),
//! then hand the stage to the [`TaskRegistry`] and return at once.

use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::collect::{self, CollectReport, CollectRequest};
use crate::config::Config;
use crate::dataset::Dataset;
use crate::db;
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::error::PipelineError;
use crate::finetune::{self, FineTuneJob, FinetuneAck, FinetuneReport, Hyperparameters, JobSlot};
use crate::index::{self, IndexEngine, IndexReport};
use crate::evaluation::{self, EvaluateRequest, EvaluationReport};
use crate::inference::{self, ChatReply, ChatRequest, CompareReply, CompareRequest};
use crate::llm::{create_inference_backend, create_synthesizer, TextGenerator};
use crate::migrate;
use crate::search::{self, SearchHit, SearchMode};
use crate::sources::{create_source, PaperSource};
use crate::state::{Baseline, PipelineState, Stage, StatusRegistry};
use crate::synth::{self, GenerateRequest, GenerationReport};
use crate::tasks::{TaskAck, TaskRecord, TaskRegistry};
use crate::trainer::{create_trainer, Trainer};

/// External services the pipeline talks to.
pub struct Collaborators {
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub source: Arc<dyn PaperSource>,
    pub synthesizer: Arc<dyn TextGenerator>,
    pub inference: Arc<dyn TextGenerator>,
    pub trainer: Arc<dyn Trainer>,
}

impl Collaborators {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            embedder: create_provider(&config.embedding).context("embedding provider")?,
            source: create_source(config).context("paper source")?,
            synthesizer: create_synthesizer(&config.synthesis).context("synthesis provider")?,
            inference: create_inference_backend(&config.inference).context("inference backend")?,
            trainer: create_trainer(&config.training).context("training backend")?,
        })
    }
}

/// `GET /health` body.
#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub status: String,
    pub initialized: bool,
    pub index_loaded: bool,
}

/// `POST /search` body.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResults {
    pub query: String,
    pub results: Vec<SearchHit>,
    pub search_type: SearchMode,
    pub total_results: usize,
}

pub const MAX_TOP_K: usize = 20;

pub struct Pipeline {
    pub(crate) config: Config,
    pub(crate) pool: sqlx::SqlitePool,
    pub(crate) registry: StatusRegistry,
    pub(crate) index: IndexEngine,
    pub(crate) embedder: Arc<dyn EmbeddingProvider>,
    pub(crate) source: Arc<dyn PaperSource>,
    pub(crate) synthesizer: Arc<dyn TextGenerator>,
    pub(crate) inference: Arc<dyn TextGenerator>,
    pub(crate) trainer: Arc<dyn Trainer>,
    pub(crate) jobs: Arc<JobSlot>,
    pub(crate) tasks: Arc<TaskRegistry>,
    pub(crate) dataset: Dataset,
    pub(crate) commit_lock: tokio::sync::Mutex<()>,
    pub(crate) generation_lock: Arc<tokio::sync::Mutex<()>>,
}

impl Pipeline {
    /// Opens the pipeline with collaborators built from `config`.
    pub async fn open(config: Config) -> Result<Self> {
        let collaborators = Collaborators::from_config(&config)?;
        Self::open_with(config, collaborators).await
    }

    /// Opens the database, applies migrations and restores state from what
    /// is already on disk.
    pub async fn open_with(config: Config, collaborators: Collaborators) -> Result<Self> {
        let pool = db::connect(&config).await?;
        migrate::apply(&pool).await?;

        let interrupted = finetune::fail_interrupted_jobs(&pool).await?;
        if interrupted > 0 {
            warn!(interrupted, "marked fine-tuning jobs from a previous run as failed");
        }

        let snapshot = index::load_snapshot(
            &pool,
            collaborators.embedder.model_name(),
            collaborators.embedder.dims(),
        )
        .await
        .context("Failed to load index snapshot")?;
        let dataset = Dataset::new(config.dataset_path());
        let baseline = Baseline {
            papers_collected: collect::count_papers(&pool).await?,
            chunks_indexed: snapshot.len() as u64,
            qa_pairs_generated: dataset.count()?,
            model_trained: finetune::load_manifest(&config.adapters_dir()).is_some(),
        };
        let last_job = finetune::load_last_job(&pool).await?;

        info!(
            papers = baseline.papers_collected,
            chunks = baseline.chunks_indexed,
            qa_pairs = baseline.qa_pairs_generated,
            model_trained = baseline.model_trained,
            index_version = snapshot.version(),
            "pipeline state restored"
        );

        let registry = StatusRegistry::new();
        registry.restore(baseline);

        let pipeline = Self {
            config,
            pool,
            registry,
            index: IndexEngine::new(snapshot),
            embedder: collaborators.embedder,
            source: collaborators.source,
            synthesizer: collaborators.synthesizer,
            inference: collaborators.inference,
            trainer: collaborators.trainer,
            jobs: Arc::new(JobSlot::with_last(last_job)),
            tasks: Arc::new(TaskRegistry::new()),
            dataset,
            commit_lock: tokio::sync::Mutex::new(()),
            generation_lock: Arc::new(tokio::sync::Mutex::new(())),
        };
        pipeline.registry.mark_initialized();
        Ok(pipeline)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn health(&self) -> Health {
        Health {
            status: "healthy".to_string(),
            initialized: self.registry.is_initialized(),
            index_loaded: self.index.is_loaded(),
        }
    }

    pub fn status(&self) -> PipelineState {
        self.registry.snapshot()
    }

    pub async fn collect(&self, req: &CollectRequest) -> Result<CollectReport, PipelineError> {
        collect::collect(self, req).await
    }

    pub async fn build_index(&self) -> Result<IndexReport, PipelineError> {
        let permit = self.index.try_begin_build()?;
        index::run_build(self, permit).await
    }

    pub async fn generate(&self, req: &GenerateRequest) -> Result<GenerationReport, PipelineError> {
        let permit = synth::begin(self, req)?;
        synth::run(self, req, permit).await
    }

    /// Claims the job slot and trains to completion.
    pub async fn finetune(&self, hp: Hyperparameters) -> Result<FinetuneReport, PipelineError> {
        let lease = finetune::claim(self, hp)?;
        finetune::run(self, lease).await
    }

    pub fn finetune_status(&self) -> Option<FineTuneJob> {
        self.jobs.current()
    }

    pub async fn search(
        &self,
        query: &str,
        top_k: usize,
        mode: SearchMode,
    ) -> Result<SearchResults, PipelineError> {
        if !(1..=MAX_TOP_K).contains(&top_k) {
            return Err(PipelineError::invalid(format!(
                "top_k must be between 1 and {}",
                MAX_TOP_K
            )));
        }
        let snapshot = self.index.snapshot();
        let results = search::search(&snapshot, self.embedder.as_ref(), query, top_k, mode).await?;
        Ok(SearchResults {
            query: query.to_string(),
            total_results: results.len(),
            results,
            search_type: mode,
        })
    }

    pub async fn chat(&self, req: &ChatRequest) -> Result<ChatReply, PipelineError> {
        inference::chat(self, req).await
    }

    pub async fn compare(&self, req: &CompareRequest) -> Result<CompareReply, PipelineError> {
        inference::compare(self, req).await
    }

    /// Compares both models over held-out QA pairs and writes a report.
    pub async fn evaluate(&self, req: &EvaluateRequest) -> Result<EvaluationReport, PipelineError> {
        evaluation::run(self, req).await
    }

    pub fn submit_collect(self: &Arc<Self>, req: CollectRequest) -> Result<TaskAck, PipelineError> {
        req.validate()?;
        let p = self.clone();
        Ok(self
            .tasks
            .submit(Stage::Collect, async move { collect::collect(&p, &req).await }))
    }

    pub fn submit_build_index(self: &Arc<Self>) -> Result<TaskAck, PipelineError> {
        let permit = self.index.try_begin_build()?;
        let p = self.clone();
        Ok(self
            .tasks
            .submit(Stage::Index, async move { index::run_build(&p, permit).await }))
    }

    pub fn submit_generate(self: &Arc<Self>, req: GenerateRequest) -> Result<TaskAck, PipelineError> {
        let permit = synth::begin(self, &req)?;
        let p = self.clone();
        Ok(self
            .tasks
            .submit(Stage::Generate, async move { synth::run(&p, &req, permit).await }))
    }

    /// Starts a job in the background. The acknowledgement carries the job id
    /// and the id of the task that trains it.
    pub fn submit_finetune(
        self: &Arc<Self>,
        hp: Hyperparameters,
    ) -> Result<(FinetuneAck, TaskAck), PipelineError> {
        let lease = finetune::claim(self, hp)?;
        let ack = finetune::ack(&lease);
        let p = self.clone();
        let task = self
            .tasks
            .submit(Stage::Train, async move { finetune::run(&p, lease).await });
        Ok((ack, task))
    }

    pub fn task(&self, task_id: &str) -> Result<TaskRecord, PipelineError> {
        self.tasks
            .get(task_id)
            .ok_or_else(|| PipelineError::NotFound(format!("no task with id {}", task_id)))
    }

    pub fn tasks(&self) -> Vec<TaskRecord> {
        self.tasks.list()
    }

    /// Closes the database pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
