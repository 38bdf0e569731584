//! Adapter training backends.
//!
//! The pipeline does not train models in-process. A [`Trainer`] hands the
//! dataset and hyperparameters to something that can (a LoRA script on a
//! GPU box, a managed fine-tuning service) and reports loss and runtime.
//!
//! # Command protocol
//!
//! [`CommandTrainer`] runs `training.command` with `training.args` followed
//! by:
//!
//! ```text
//! --dataset <jsonl> --output-dir <dir> --base-model <name>
//! --epochs <n> --batch-size <n> --learning-rate <f>
//! --lora-r <n> --lora-alpha <n> --lora-dropout <f>
//! [--validation-dataset <jsonl>]
//! ```
//!
//! and reads JSON lines from its stdout:
//!
//! ```text
//! {"event": "progress", "step": 10, "epoch": 0.5, "loss": 1.83}
//! {"event": "done", "train_loss": 1.21, "train_runtime": 932.4}
//! ```
//!
//! Other stdout lines are ignored. A non-zero exit, or exit without a `done`
//! event, fails the job with the tail of stderr.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::{LoraConfig, TrainingConfig};
use crate::finetune::Hyperparameters;

const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone)]
pub struct TrainingRequest {
    pub job_id: String,
    /// Training share of the dataset.
    pub dataset_path: PathBuf,
    /// Held-out share, when there is one.
    pub validation_path: Option<PathBuf>,
    pub output_dir: PathBuf,
    pub base_model: String,
    pub hyperparameters: Hyperparameters,
    pub lora: LoraConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingProgress {
    pub step: u64,
    pub epoch: f64,
    pub loss: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingOutcome {
    pub train_loss: f64,
    /// Seconds.
    pub train_runtime: f64,
}

pub type ProgressFn<'a> = &'a (dyn Fn(TrainingProgress) + Send + Sync);

#[async_trait]
pub trait Trainer: Send + Sync {
    fn name(&self) -> &str;

    /// `Err(reason)` when this backend cannot accept jobs.
    fn is_available(&self) -> Result<(), String>;

    async fn train(&self, request: &TrainingRequest, progress: ProgressFn<'_>) -> Result<TrainingOutcome>;
}

pub struct CommandTrainer {
    program: String,
    args: Vec<String>,
}

impl CommandTrainer {
    pub fn new(program: String, args: Vec<String>) -> Self {
        Self { program, args }
    }

    fn arguments(&self, request: &TrainingRequest) -> Vec<String> {
        let hp = &request.hyperparameters;
        let mut args = self.args.clone();
        args.extend([
            "--dataset".to_string(),
            request.dataset_path.display().to_string(),
            "--output-dir".to_string(),
            request.output_dir.display().to_string(),
            "--base-model".to_string(),
            request.base_model.clone(),
            "--epochs".to_string(),
            hp.epochs.to_string(),
            "--batch-size".to_string(),
            hp.batch_size.to_string(),
            "--learning-rate".to_string(),
            hp.learning_rate.to_string(),
            "--lora-r".to_string(),
            request.lora.r.to_string(),
            "--lora-alpha".to_string(),
            request.lora.alpha.to_string(),
            "--lora-dropout".to_string(),
            request.lora.dropout.to_string(),
        ]);
        if let Some(validation) = &request.validation_path {
            args.push("--validation-dataset".to_string());
            args.push(validation.display().to_string());
        }
        args
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum TrainerEvent {
    Progress {
        #[serde(default)]
        step: u64,
        #[serde(default)]
        epoch: f64,
        #[serde(default)]
        loss: Option<f64>,
    },
    Done {
        train_loss: f64,
        train_runtime: f64,
    },
}

#[async_trait]
impl Trainer for CommandTrainer {
    fn name(&self) -> &str {
        "command"
    }

    fn is_available(&self) -> Result<(), String> {
        Ok(())
    }

    async fn train(&self, request: &TrainingRequest, progress: ProgressFn<'_>) -> Result<TrainingOutcome> {
        std::fs::create_dir_all(&request.output_dir).with_context(|| {
            format!("Failed to create {}", request.output_dir.display())
        })?;

        let args = self.arguments(request);
        info!(program = %self.program, job_id = %request.job_id, "starting trainer");

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start trainer '{}'", self.program))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("trainer stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow::anyhow!("trainer stderr not captured"))?;

        let stderr_tail = tokio::spawn(async move {
            let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            tail.into_iter().collect::<Vec<_>>().join("\n")
        });

        let mut outcome = None;
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            match serde_json::from_str::<TrainerEvent>(line.trim()) {
                Ok(TrainerEvent::Progress { step, epoch, loss }) => {
                    progress(TrainingProgress { step, epoch, loss })
                }
                Ok(TrainerEvent::Done {
                    train_loss,
                    train_runtime,
                }) => {
                    outcome = Some(TrainingOutcome {
                        train_loss,
                        train_runtime,
                    })
                }
                Err(_) => debug!(line = %line, "trainer output"),
            }
        }

        let status = child.wait().await?;
        let tail = stderr_tail.await.unwrap_or_default();

        if !status.success() {
            bail!("trainer exited with {}: {}", status, tail);
        }
        match outcome {
            Some(o) => Ok(o),
            None => bail!("trainer exited without reporting a result: {}", tail),
        }
    }
}

pub struct DisabledTrainer;

#[async_trait]
impl Trainer for DisabledTrainer {
    fn name(&self) -> &str {
        "disabled"
    }

    fn is_available(&self) -> Result<(), String> {
        Err("no training backend configured; set training.provider = \"command\" and training.command".to_string())
    }

    async fn train(&self, _request: &TrainingRequest, _progress: ProgressFn<'_>) -> Result<TrainingOutcome> {
        bail!("training backend disabled")
    }
}

pub fn create_trainer(config: &TrainingConfig) -> Result<Arc<dyn Trainer>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledTrainer)),
        "command" => {
            let program = config
                .command
                .clone()
                .ok_or_else(|| anyhow::anyhow!("training.command must be set for the command trainer"))?;
            Ok(Arc::new(CommandTrainer::new(program, config.args.clone())))
        }
        other => bail!("Unknown training provider: {}", other),
    }
}
