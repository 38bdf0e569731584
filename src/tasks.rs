//! Background task registry.
//!
//! HTTP triggers for long-running stages return as soon as preconditions
//! pass; the work runs on a spawned task whose [`TaskRecord`] can be polled.
//! A panicking task is recorded as failed rather than lost.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use tracing::{error, info};

use crate::error::PipelineError;
use crate::state::Stage;

const HISTORY_LIMIT: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub stage: Stage,
    pub state: TaskState,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
}

/// Returned to the caller when a task is accepted.
#[derive(Debug, Clone, Serialize)]
pub struct TaskAck {
    pub status: String,
    pub task_id: String,
    pub stage: Stage,
}

#[derive(Debug, Default)]
pub struct TaskRegistry {
    records: Mutex<VecDeque<TaskRecord>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns `work` and returns its task id immediately.
    pub fn submit<F, T>(self: &std::sync::Arc<Self>, stage: Stage, work: F) -> TaskAck
    where
        F: Future<Output = Result<T, PipelineError>> + Send + 'static,
        T: Serialize + Send + 'static,
    {
        let task_id = uuid::Uuid::new_v4().to_string();
        self.insert(TaskRecord {
            task_id: task_id.clone(),
            stage,
            state: TaskState::Running,
            submitted_at: Utc::now(),
            finished_at: None,
            result: None,
            error: None,
        });

        let registry = self.clone();
        let id = task_id.clone();
        tokio::spawn(async move {
            let outcome = tokio::spawn(work).await;
            let (state, result, err) = match outcome {
                Ok(Ok(value)) => (
                    TaskState::Succeeded,
                    serde_json::to_value(value).ok(),
                    None,
                ),
                Ok(Err(e)) => (
                    TaskState::Failed,
                    None,
                    Some(TaskError {
                        code: e.code().to_string(),
                        message: format!("{:#}", e),
                    }),
                ),
                Err(join) => (
                    TaskState::Failed,
                    None,
                    Some(TaskError {
                        code: "internal".to_string(),
                        message: format!("task aborted: {}", join),
                    }),
                ),
            };
            match &err {
                None => info!(task_id = %id, %stage, "task finished"),
                Some(e) => error!(task_id = %id, %stage, code = %e.code, message = %e.message, "task failed"),
            }
            registry.finish(&id, state, result, err);
        });

        TaskAck {
            status: "accepted".to_string(),
            task_id,
            stage,
        }
    }

    pub fn get(&self, task_id: &str) -> Option<TaskRecord> {
        self.lock().iter().find(|r| r.task_id == task_id).cloned()
    }

    /// Most recent first.
    pub fn list(&self) -> Vec<TaskRecord> {
        self.lock().iter().rev().cloned().collect()
    }

    fn insert(&self, record: TaskRecord) {
        let mut records = self.lock();
        if records.len() == HISTORY_LIMIT {
            // Drop the oldest finished record; running tasks are kept.
            if let Some(pos) = records.iter().position(|r| r.state != TaskState::Running) {
                records.remove(pos);
            }
        }
        records.push_back(record);
    }

    fn finish(
        &self,
        task_id: &str,
        state: TaskState,
        result: Option<serde_json::Value>,
        error: Option<TaskError>,
    ) {
        let mut records = self.lock();
        if let Some(r) = records.iter_mut().find(|r| r.task_id == task_id) {
            r.state = state;
            r.finished_at = Some(Utc::now());
            r.result = result;
            r.error = error;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<TaskRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
