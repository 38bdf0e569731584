//! Fine-tuning job runner.
//!
//! There is one job slot. [`claim`] checks the slot and moves a fresh job to
//! `running` under a single lock, so two concurrent starts can never both
//! succeed. The returned [`JobLease`] is the only handle that can finish the
//! job; if it is dropped first (task cancelled, panic) the job is marked
//! `failed`. Nothing leaves a job `running` once its owner is gone.
//!
//! ```text
//! pending ──► running ──► succeeded
//!                  └────► failed
//! ```
//!
//! Terminal jobs stay in the slot for `finetune_status` until the next
//! start replaces them. Every transition is mirrored to `finetune_jobs`; on
//! startup, rows still marked `running` are failed as interrupted.
//!
//! A succeeded job writes `{data_dir}/adapters/latest.json`, the
//! [`AdapterManifest`] the inference gateway uses to route `finetuned`
//! requests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{info, warn};

use crate::dataset::{self, Dataset};
use crate::error::PipelineError;
use crate::pipeline::Pipeline;
use crate::state::Stage;
use crate::trainer::{TrainingOutcome, TrainingProgress, TrainingRequest};

pub const MANIFEST_FILE: &str = "latest.json";
pub const TRAIN_FILE: &str = "train.jsonl";
pub const VALIDATION_FILE: &str = "validation.jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobStage {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStage::Pending => "pending",
            JobStage::Running => "running",
            JobStage::Succeeded => "succeeded",
            JobStage::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStage::Succeeded | JobStage::Failed)
    }

    fn parse(s: &str) -> Self {
        match s {
            "pending" => JobStage::Pending,
            "running" => JobStage::Running,
            "succeeded" => JobStage::Succeeded,
            _ => JobStage::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    #[serde(default = "default_epochs")]
    pub epochs: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
}

fn default_epochs() -> u32 {
    3
}
fn default_batch_size() -> u32 {
    2
}
fn default_learning_rate() -> f64 {
    2e-4
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            batch_size: default_batch_size(),
            learning_rate: default_learning_rate(),
        }
    }
}

impl Hyperparameters {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if !(1..=10).contains(&self.epochs) {
            return Err(PipelineError::InvalidHyperparameter {
                name: "epochs",
                value: self.epochs.to_string(),
                range: "1..=10",
            });
        }
        if !(1..=64).contains(&self.batch_size) {
            return Err(PipelineError::InvalidHyperparameter {
                name: "batch_size",
                value: self.batch_size.to_string(),
                range: "1..=64",
            });
        }
        if !self.learning_rate.is_finite() || !(1e-6..=1e-2).contains(&self.learning_rate) {
            return Err(PipelineError::InvalidHyperparameter {
                name: "learning_rate",
                value: self.learning_rate.to_string(),
                range: "1e-6..=1e-2",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobProgress {
    pub step: u64,
    pub epoch: f64,
    pub loss: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FineTuneJob {
    pub job_id: String,
    pub stage: JobStage,
    pub hyperparameters: Hyperparameters,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub train_loss: Option<f64>,
    pub train_runtime: Option<f64>,
    pub output_dir: Option<String>,
    pub error: Option<String>,
    pub progress: Option<JobProgress>,
}

impl FineTuneJob {
    fn new(hyperparameters: Hyperparameters) -> Self {
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            stage: JobStage::Pending,
            hyperparameters,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            train_loss: None,
            train_runtime: None,
            output_dir: None,
            error: None,
            progress: None,
        }
    }

    fn start(&mut self) {
        if self.stage == JobStage::Pending {
            self.stage = JobStage::Running;
            self.started_at = Some(Utc::now());
        }
    }

    fn succeed(&mut self, outcome: &TrainingOutcome, output_dir: &Path) {
        if self.stage == JobStage::Running {
            self.stage = JobStage::Succeeded;
            self.finished_at = Some(Utc::now());
            self.train_loss = Some(outcome.train_loss);
            self.train_runtime = Some(outcome.train_runtime);
            self.output_dir = Some(output_dir.display().to_string());
        }
    }

    fn fail(&mut self, reason: &str) {
        if !self.stage.is_terminal() {
            self.stage = JobStage::Failed;
            self.finished_at = Some(Utc::now());
            self.error = Some(reason.to_string());
        }
    }
}

/// The single fine-tuning job slot.
#[derive(Debug, Default)]
pub struct JobSlot {
    current: Mutex<Option<FineTuneJob>>,
}

impl JobSlot {
    /// Seeds the slot with the last persisted job, if any.
    pub fn with_last(job: Option<FineTuneJob>) -> Self {
        Self {
            current: Mutex::new(job),
        }
    }

    pub fn current(&self) -> Option<FineTuneJob> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<FineTuneJob>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, job_id: &str, f: impl FnOnce(&mut FineTuneJob)) -> Option<FineTuneJob> {
        let mut slot = self.lock();
        match slot.as_mut() {
            Some(job) if job.job_id == job_id => {
                f(job);
                Some(job.clone())
            }
            _ => None,
        }
    }

    fn record_progress(&self, job_id: &str, p: TrainingProgress) {
        self.update(job_id, |job| {
            job.progress = Some(JobProgress {
                step: p.step,
                epoch: p.epoch,
                loss: p.loss,
            })
        });
    }
}

/// Exclusive handle on the running job.
pub struct JobLease {
    jobs: Arc<JobSlot>,
    job_id: String,
    finished: bool,
}

impl JobLease {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    fn snapshot(&self) -> Option<FineTuneJob> {
        self.jobs.current().filter(|j| j.job_id == self.job_id)
    }

    fn succeed(&mut self, outcome: &TrainingOutcome, output_dir: &Path) -> Option<FineTuneJob> {
        self.finished = true;
        self.jobs.update(&self.job_id, |j| j.succeed(outcome, output_dir))
    }

    fn fail(&mut self, reason: &str) -> Option<FineTuneJob> {
        self.finished = true;
        self.jobs.update(&self.job_id, |j| j.fail(reason))
    }
}

impl Drop for JobLease {
    fn drop(&mut self) {
        if !self.finished {
            warn!(job_id = %self.job_id, "fine-tuning task ended without a result");
            self.jobs
                .update(&self.job_id, |j| j.fail("interrupted before completion"));
        }
    }
}

/// Acknowledgement returned when a job is accepted.
#[derive(Debug, Clone, Serialize)]
pub struct FinetuneAck {
    pub status: String,
    pub job_id: String,
    pub message: String,
}

/// Final outcome of a succeeded job.
#[derive(Debug, Clone, Serialize)]
pub struct FinetuneReport {
    pub status: String,
    pub job_id: String,
    pub train_loss: Option<f64>,
    pub train_runtime: Option<f64>,
    pub output_dir: Option<String>,
    pub train_examples: u64,
    pub validation_examples: u64,
    pub message: String,
}

/// Validates, checks preconditions and moves a new job to `running`, all
/// while holding the slot lock.
pub fn claim(p: &Pipeline, hp: Hyperparameters) -> Result<JobLease, PipelineError> {
    hp.validate()?;

    let mut slot = p.jobs.lock();
    if let Some(job) = slot.as_ref().filter(|j| j.stage == JobStage::Running) {
        return Err(PipelineError::JobAlreadyRunning {
            job_id: job.job_id.clone(),
        });
    }
    if p.registry.qa_pairs_generated() == 0 {
        return Err(PipelineError::EmptyDataset {
            path: p.dataset.path().display().to_string(),
        });
    }
    p.trainer
        .is_available()
        .map_err(PipelineError::TrainerUnavailable)?;

    let mut job = FineTuneJob::new(hp);
    job.start();
    let job_id = job.job_id.clone();
    *slot = Some(job);
    drop(slot);

    info!(%job_id, epochs = hp.epochs, batch_size = hp.batch_size, learning_rate = hp.learning_rate, "fine-tuning job started");

    Ok(JobLease {
        jobs: p.jobs.clone(),
        job_id,
        finished: false,
    })
}

pub fn ack(lease: &JobLease) -> FinetuneAck {
    FinetuneAck {
        status: "started".to_string(),
        job_id: lease.job_id().to_string(),
        message: "Fine-tuning started; poll /finetune/status for progress".to_string(),
    }
}

/// Trains the leased job to completion.
///
/// The dataset is split first: the training share goes to
/// `{adapters}/{job_id}/train.jsonl` and the held-out share to
/// `validation.jsonl` beside it, and the trainer reads only those files.
#[tracing::instrument(skip_all, fields(job_id = %lease.job_id()))]
pub async fn run(p: &Pipeline, mut lease: JobLease) -> Result<FinetuneReport, PipelineError> {
    let _activity = p.registry.begin(Stage::Train);
    let job = lease
        .snapshot()
        .ok_or_else(|| anyhow::anyhow!("job {} vanished from the slot", lease.job_id()))?;
    persist_job(&p.pool, &job).await?;

    let output_dir = p.config.adapters_dir().join(&job.job_id);
    let files = match write_split(p, &output_dir) {
        Ok(files) => files,
        Err(e) => {
            let reason = format!("failed to prepare training data: {:#}", e);
            return Err(fail_job(p, &mut lease, &job.job_id, reason).await);
        }
    };
    info!(
        train_examples = files.train_examples,
        validation_examples = files.validation_examples,
        "dataset split for training"
    );

    let request = TrainingRequest {
        job_id: job.job_id.clone(),
        dataset_path: files.train_path,
        validation_path: files.validation_path,
        output_dir: output_dir.clone(),
        base_model: p.config.training.base_model.clone(),
        hyperparameters: job.hyperparameters,
        lora: p.config.training.lora.clone(),
    };

    let jobs = p.jobs.clone();
    let job_id = job.job_id.clone();
    let progress = move |pr: TrainingProgress| jobs.record_progress(&job_id, pr);

    let timeout = Duration::from_secs(p.config.training.timeout_secs);
    let result = tokio::time::timeout(timeout, p.trainer.train(&request, &progress)).await;

    let failure = match result {
        Ok(Ok(outcome)) => {
            let manifest = AdapterManifest {
                job_id: job.job_id.clone(),
                base_model: p.config.training.base_model.clone(),
                adapter_dir: output_dir.display().to_string(),
                served_model: p
                    .config
                    .inference
                    .finetuned_model
                    .clone()
                    .unwrap_or_else(|| job.job_id.clone()),
                train_loss: outcome.train_loss,
                train_runtime: outcome.train_runtime,
                created_at: Utc::now(),
            };

            let _gate = p.commit_lock.lock().await;
            match write_manifest(&p.config.adapters_dir(), &manifest) {
                Ok(()) => {
                    let done = lease.succeed(&outcome, &output_dir);
                    p.registry.mark_model_trained();
                    if let Some(done) = &done {
                        record_outcome(&p.pool, done).await;
                    }
                    info!(train_loss = outcome.train_loss, train_runtime = outcome.train_runtime, "fine-tuning succeeded");
                    return Ok(FinetuneReport {
                        status: JobStage::Succeeded.as_str().to_string(),
                        job_id: job.job_id,
                        train_loss: Some(outcome.train_loss),
                        train_runtime: Some(outcome.train_runtime),
                        output_dir: Some(output_dir.display().to_string()),
                        train_examples: files.train_examples,
                        validation_examples: files.validation_examples,
                        message: format!(
                            "Fine-tuning complete: loss {:.4} in {:.1}s ({} training, {} held out)",
                            outcome.train_loss,
                            outcome.train_runtime,
                            files.train_examples,
                            files.validation_examples
                        ),
                    });
                }
                Err(e) => format!("failed to write adapter manifest: {:#}", e),
            }
        }
        Ok(Err(e)) => format!("{:#}", e),
        Err(_) => format!("training timed out after {}s", timeout.as_secs()),
    };

    Err(fail_job(p, &mut lease, &job.job_id, failure).await)
}

async fn fail_job(p: &Pipeline, lease: &mut JobLease, job_id: &str, reason: String) -> PipelineError {
    warn!(reason = %reason, "fine-tuning failed");
    if let Some(failed) = lease.fail(&reason) {
        record_outcome(&p.pool, &failed).await;
    }
    anyhow::anyhow!("fine-tuning job {} failed: {}", job_id, reason).into()
}

struct SplitFiles {
    train_path: PathBuf,
    validation_path: Option<PathBuf>,
    train_examples: u64,
    validation_examples: u64,
}

fn write_split(p: &Pipeline, output_dir: &Path) -> anyhow::Result<SplitFiles> {
    let pairs = p.dataset.read_all()?;
    let split = dataset::split(pairs, p.config.training.validation_ratio);
    if split.train.is_empty() {
        anyhow::bail!("dataset {} has no readable QA pairs", p.dataset.path().display());
    }

    let train_path = output_dir.join(TRAIN_FILE);
    Dataset::new(train_path.clone()).append(&split.train)?;
    let validation_path = if split.validation.is_empty() {
        None
    } else {
        let path = output_dir.join(VALIDATION_FILE);
        Dataset::new(path.clone()).append(&split.validation)?;
        Some(path)
    };

    Ok(SplitFiles {
        train_path,
        validation_path,
        train_examples: split.train.len() as u64,
        validation_examples: split.validation.len() as u64,
    })
}

/// Written next to the adapters after a succeeded job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterManifest {
    pub job_id: String,
    pub base_model: String,
    pub adapter_dir: String,
    /// Model name to request from the inference server.
    pub served_model: String,
    pub train_loss: f64,
    pub train_runtime: f64,
    pub created_at: DateTime<Utc>,
}

fn write_manifest(adapters_dir: &Path, manifest: &AdapterManifest) -> anyhow::Result<()> {
    std::fs::create_dir_all(adapters_dir)?;
    let tmp = adapters_dir.join(format!("{}.tmp", MANIFEST_FILE));
    std::fs::write(&tmp, serde_json::to_vec_pretty(manifest)?)?;
    std::fs::rename(&tmp, adapters_dir.join(MANIFEST_FILE))?;
    Ok(())
}

/// Reads the current adapter manifest. Missing or unreadable means no
/// adapter is available.
pub fn load_manifest(adapters_dir: &Path) -> Option<AdapterManifest> {
    let path: PathBuf = adapters_dir.join(MANIFEST_FILE);
    let bytes = std::fs::read(&path).ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(m) => Some(m),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unreadable adapter manifest");
            None
        }
    }
}

/// Persists a finished job. The in-memory slot, the manifest and the
/// registry already hold the outcome, so a failed write only loses the row.
async fn record_outcome(pool: &SqlitePool, job: &FineTuneJob) {
    if let Err(e) = persist_job(pool, job).await {
        warn!(job_id = %job.job_id, stage = job.stage.as_str(), error = %e, "failed to persist fine-tuning job");
    }
}

async fn persist_job(pool: &SqlitePool, job: &FineTuneJob) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO finetune_jobs
            (job_id, stage, epochs, batch_size, learning_rate, created_at, started_at,
             finished_at, train_loss, train_runtime, output_dir, error)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(job_id) DO UPDATE SET
            stage = excluded.stage,
            started_at = excluded.started_at,
            finished_at = excluded.finished_at,
            train_loss = excluded.train_loss,
            train_runtime = excluded.train_runtime,
            output_dir = excluded.output_dir,
            error = excluded.error
        "#,
    )
    .bind(&job.job_id)
    .bind(job.stage.as_str())
    .bind(job.hyperparameters.epochs as i64)
    .bind(job.hyperparameters.batch_size as i64)
    .bind(job.hyperparameters.learning_rate)
    .bind(job.created_at.timestamp_millis())
    .bind(job.started_at.map(|t| t.timestamp_millis()))
    .bind(job.finished_at.map(|t| t.timestamp_millis()))
    .bind(job.train_loss)
    .bind(job.train_runtime)
    .bind(&job.output_dir)
    .bind(&job.error)
    .execute(pool)
    .await?;
    Ok(())
}

/// Fails jobs a previous process left `pending` or `running`.
pub async fn fail_interrupted_jobs(pool: &SqlitePool) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE finetune_jobs
        SET stage = 'failed', finished_at = ?, error = 'interrupted by process restart'
        WHERE stage IN ('pending', 'running')
        "#,
    )
    .bind(Utc::now().timestamp_millis())
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn load_last_job(pool: &SqlitePool) -> Result<Option<FineTuneJob>, sqlx::Error> {
    let row = sqlx::query("SELECT * FROM finetune_jobs ORDER BY created_at DESC LIMIT 1")
        .fetch_optional(pool)
        .await?;

    Ok(row.map(|row| {
        let ts = |col: &str| -> Option<DateTime<Utc>> {
            row.get::<Option<i64>, _>(col)
                .and_then(DateTime::from_timestamp_millis)
        };
        FineTuneJob {
            job_id: row.get("job_id"),
            stage: JobStage::parse(row.get::<String, _>("stage").as_str()),
            hyperparameters: Hyperparameters {
                epochs: row.get::<i64, _>("epochs") as u32,
                batch_size: row.get::<i64, _>("batch_size") as u32,
                learning_rate: row.get("learning_rate"),
            },
            created_at: ts("created_at").unwrap_or_else(Utc::now),
            started_at: ts("started_at"),
            finished_at: ts("finished_at"),
            train_loss: row.get("train_loss"),
            train_runtime: row.get("train_runtime"),
            output_dir: row.get("output_dir"),
            error: row.get("error"),
            progress: None,
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hyperparameter_ranges() {
        assert!(Hyperparameters::default().validate().is_ok());
        let hp = |epochs, batch_size, learning_rate| Hyperparameters {
            epochs,
            batch_size,
            learning_rate,
        };
        assert!(hp(1, 1, 1e-6).validate().is_ok());
        assert!(hp(10, 64, 1e-2).validate().is_ok());

        let err = hp(0, 2, 2e-4).validate().unwrap_err();
        assert_eq!(err.code(), "invalid_hyperparameter");
        assert!(err.to_string().contains("epochs"));
        assert!(hp(11, 2, 2e-4).validate().is_err());
        assert!(hp(3, 65, 2e-4).validate().is_err());
        assert!(hp(3, 2, 0.5).validate().is_err());
        assert!(hp(3, 2, f64::NAN).validate().is_err());
    }

    #[test]
    fn test_terminal_states_are_not_reentered() {
        let mut job = FineTuneJob::new(Hyperparameters::default());
        job.succeed(
            &TrainingOutcome {
                train_loss: 1.0,
                train_runtime: 1.0,
            },
            Path::new("/tmp/a"),
        );
        assert_eq!(job.stage, JobStage::Pending);

        job.start();
        job.fail("boom");
        assert_eq!(job.stage, JobStage::Failed);
        job.start();
        assert_eq!(job.stage, JobStage::Failed);
        job.fail("again");
        assert_eq!(job.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_dropped_lease_fails_job() {
        let jobs = Arc::new(JobSlot::default());
        let mut job = FineTuneJob::new(Hyperparameters::default());
        job.start();
        let job_id = job.job_id.clone();
        *jobs.lock() = Some(job);

        let lease = JobLease {
            jobs: jobs.clone(),
            job_id: job_id.clone(),
            finished: false,
        };
        drop(lease);

        let job = jobs.current().unwrap();
        assert_eq!(job.stage, JobStage::Failed);
        assert!(job.error.unwrap().contains("interrupted"));
    }

    #[test]
    fn test_manifest_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(load_manifest(tmp.path()).is_none());
        let manifest = AdapterManifest {
            job_id: "j".into(),
            base_model: "base".into(),
            adapter_dir: "/x".into(),
            served_model: "paper-lora".into(),
            train_loss: 0.5,
            train_runtime: 10.0,
            created_at: Utc::now(),
        };
        write_manifest(tmp.path(), &manifest).unwrap();
        assert_eq!(load_manifest(tmp.path()), Some(manifest));
    }
}
