//! Stage-boundary error taxonomy.
//!
//! Every pipeline operation returns [`PipelineError`]. Provider errors
//! ([`LlmError`](crate::llm::LlmError), [`SourceError`](crate::sources::SourceError))
//! and plumbing errors (`anyhow`, `sqlx`, I/O) are translated into one of
//! these kinds before they leave a stage. Each message names the unmet
//! precondition and, where one exists, the stage to run first.

use crate::state::Stage;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("paper source unavailable: {0}. Check network access and retry the collection")]
    SourceUnavailable(String),

    #[error("invalid hyperparameter: {name} = {value} (allowed range {range})")]
    InvalidHyperparameter {
        name: &'static str,
        value: String,
        range: &'static str,
    },

    #[error("fine-tuning job {job_id} is already running; wait for it to finish before starting another")]
    JobAlreadyRunning { job_id: String },

    #[error("no synthetic QA pairs found at {path}; run synthetic data generation first")]
    EmptyDataset { path: String },

    #[error("generation service unavailable: {reason}. {hint}")]
    GenerationUnavailable { reason: String, hint: String },

    #[error("index not ready: {0}")]
    IndexNotReady(String),

    #[error("{0} already in progress; wait for it to finish")]
    StageBusy(Stage),

    #[error("training backend unavailable: {0}")]
    TrainerUnavailable(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl PipelineError {
    /// Machine-readable code used in HTTP error bodies and task records.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::SourceUnavailable(_) => "source_unavailable",
            PipelineError::InvalidHyperparameter { .. } => "invalid_hyperparameter",
            PipelineError::JobAlreadyRunning { .. } => "job_already_running",
            PipelineError::EmptyDataset { .. } => "empty_dataset",
            PipelineError::GenerationUnavailable { .. } => "generation_unavailable",
            PipelineError::IndexNotReady(_) => "index_not_ready",
            PipelineError::StageBusy(_) => "stage_busy",
            PipelineError::TrainerUnavailable(_) => "trainer_unavailable",
            PipelineError::InvalidRequest(_) => "bad_request",
            PipelineError::NotFound(_) => "not_found",
            PipelineError::Internal(_) => "internal",
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        PipelineError::InvalidRequest(message.into())
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(e: sqlx::Error) -> Self {
        PipelineError::Internal(anyhow::Error::new(e).context("database error"))
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::Internal(anyhow::Error::new(e))
    }
}
