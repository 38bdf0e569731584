//! Pipeline status registry.
//!
//! [`StatusRegistry`] owns the process-wide [`PipelineState`]. It is the
//! only place pipeline counters live, and it is written to by exactly one
//! kind of caller per field:
//!
//! | Field | Writer |
//! |-------|--------|
//! | `papers_collected` | collection, after its papers are committed |
//! | `chunks_indexed` | index build, after its snapshot is installed |
//! | `qa_pairs_generated` | synthetic generation, after each append |
//! | `model_trained` | fine-tuning, on a succeeded job |
//!
//! Counters only ever grow. Readers get a cloned snapshot; no lock is held
//! across an `.await`, so status and health reads never wait on a stage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};

/// A long-running pipeline stage, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Collect,
    Index,
    Generate,
    Train,
}

impl Stage {
    /// Status label shown while the stage is active.
    pub fn active_label(self) -> &'static str {
        match self {
            Stage::Collect => "collecting",
            Stage::Index => "indexing",
            Stage::Generate => "generating",
            Stage::Train => "training",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Collect => "paper collection",
            Stage::Index => "index build",
            Stage::Generate => "synthetic generation",
            Stage::Train => "fine-tuning",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    pub status: String,
    pub papers_collected: u64,
    pub chunks_indexed: u64,
    pub qa_pairs_generated: u64,
    pub model_trained: bool,
    pub last_updated: DateTime<Utc>,
}

/// Durable totals used to seed the registry at startup.
#[derive(Debug, Clone, Copy, Default)]
pub struct Baseline {
    pub papers_collected: u64,
    pub chunks_indexed: u64,
    pub qa_pairs_generated: u64,
    pub model_trained: bool,
}

#[derive(Debug)]
struct Counters {
    papers_collected: u64,
    chunks_indexed: u64,
    qa_pairs_generated: u64,
    model_trained: bool,
    last_updated: DateTime<Utc>,
}

#[derive(Debug)]
pub struct StatusRegistry {
    counters: RwLock<Counters>,
    active: Mutex<HashMap<Stage, usize>>,
    initialized: AtomicBool,
}

impl Default for StatusRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(Counters {
                papers_collected: 0,
                chunks_indexed: 0,
                qa_pairs_generated: 0,
                model_trained: false,
                last_updated: Utc::now(),
            }),
            active: Mutex::new(HashMap::new()),
            initialized: AtomicBool::new(false),
        }
    }

    /// Raise counters to at least the durable totals. Never lowers a value.
    pub fn restore(&self, baseline: Baseline) {
        self.update(|c| {
            c.papers_collected = c.papers_collected.max(baseline.papers_collected);
            c.chunks_indexed = c.chunks_indexed.max(baseline.chunks_indexed);
            c.qa_pairs_generated = c.qa_pairs_generated.max(baseline.qa_pairs_generated);
            c.model_trained |= baseline.model_trained;
        });
    }

    pub fn record_papers(&self, n: u64) {
        if n > 0 {
            self.update(|c| c.papers_collected = c.papers_collected.saturating_add(n));
        }
    }

    pub fn record_chunks_indexed(&self, n: u64) {
        if n > 0 {
            self.update(|c| c.chunks_indexed = c.chunks_indexed.saturating_add(n));
        }
    }

    pub fn record_qa_pairs(&self, n: u64) {
        if n > 0 {
            self.update(|c| c.qa_pairs_generated = c.qa_pairs_generated.saturating_add(n));
        }
    }

    pub fn mark_model_trained(&self) {
        self.update(|c| c.model_trained = true);
    }

    pub fn qa_pairs_generated(&self) -> u64 {
        self.read().qa_pairs_generated
    }

    pub fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::SeqCst);
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Marks `stage` active until the returned guard is dropped.
    pub fn begin(&self, stage: Stage) -> StageActivity<'_> {
        *self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(stage)
            .or_insert(0) += 1;
        StageActivity {
            registry: self,
            stage,
        }
    }

    pub fn snapshot(&self) -> PipelineState {
        let status = self.status_label();
        let c = self.read();
        PipelineState {
            status,
            papers_collected: c.papers_collected,
            chunks_indexed: c.chunks_indexed,
            qa_pairs_generated: c.qa_pairs_generated,
            model_trained: c.model_trained,
            last_updated: c.last_updated,
        }
    }

    fn status_label(&self) -> String {
        if !self.is_initialized() {
            return "initializing".to_string();
        }
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        let mut running: Vec<Stage> = active
            .iter()
            .filter(|(_, n)| **n > 0)
            .map(|(s, _)| *s)
            .collect();
        running.sort();
        drop(active);

        match running.first() {
            Some(stage) => stage.active_label().to_string(),
            None if self.read().model_trained => "ready".to_string(),
            None => "idle".to_string(),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Counters> {
        self.counters.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, f: impl FnOnce(&mut Counters)) {
        let mut c = self.counters.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut c);
        c.last_updated = Utc::now();
    }
}

/// Guard returned by [`StatusRegistry::begin`].
pub struct StageActivity<'a> {
    registry: &'a StatusRegistry,
    stage: Stage,
}

impl Drop for StageActivity<'_> {
    fn drop(&mut self) {
        let mut active = self
            .registry
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(n) = active.get_mut(&self.stage) {
            *n = n.saturating_sub(1);
        }
    }
}
