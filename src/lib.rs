//! # Paper Harness
//!
//! A paper-to-assistant pipeline: collect academic papers, index them for
//! hybrid retrieval, synthesize instruction-tuning QA pairs, fine-tune a
//! LoRA adapter, and answer questions with the base or fine-tuned model.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌──────────────┐   ┌───────────┐
//! │ PaperSource │──▶│   Collect   │──▶│    Index     │──▶│  Search   │
//! │ arXiv / dir │   │ Clean+Chunk │   │ BM25+Vectors │   │  Hybrid   │
//! └─────────────┘   └─────────────┘   └──────┬───────┘   └─────┬─────┘
//!                                            ▼                 │
//!                                     ┌─────────────┐          ▼
//!                                     │  Synthesize │    ┌───────────┐
//!                                     │  QA pairs   │    │ Chat and  │
//!                                     └──────┬──────┘    │  Compare  │
//!                                            ▼           └───────────┘
//!                                     ┌─────────────┐          ▲
//!                                     │  Fine-tune  │──────────┘
//!                                     └─────────────┘
//! ```
//!
//! Every surface goes through [`pipeline::Pipeline`]: the `ph` CLI runs
//! stages inline, the HTTP server in [`server`] runs them as background
//! tasks.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Papers, chunks and QA pairs |
//! | [`error`] | Stage-boundary error taxonomy |
//! | [`state`] | Pipeline counters and stage activity |
//! | [`sources`] | Paper source abstraction |
//! | [`connector_arxiv`] | arXiv Atom API source |
//! | [`connector_fs`] | Local directory source |
//! | [`extract`] | PDF text extraction and cleaning |
//! | [`chunk`] | Token-window chunking |
//! | [`collect`] | Paper collection stage |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Keyword and vector index |
//! | [`search`] | Keyword, vector, and hybrid search |
//! | [`llm`] | Chat-completion clients |
//! | [`dataset`] | JSONL QA dataset |
//! | [`synth`] | Synthetic QA generation stage |
//! | [`trainer`] | Training backend abstraction |
//! | [`finetune`] | Fine-tuning jobs |
//! | [`inference`] | Chat and model comparison |
//! | [`evaluation`] | Batch base-vs-finetuned comparison on held-out pairs |
//! | [`tasks`] | Background task registry |
//! | [`pipeline`] | Orchestrator |
//! | [`server`] | HTTP server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod chunk;
pub mod collect;
pub mod config;
pub mod connector_arxiv;
pub mod connector_fs;
pub mod dataset;
pub mod db;
pub mod embedding;
pub mod error;
pub mod evaluation;
pub mod extract;
pub mod finetune;
pub mod index;
pub mod inference;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod search;
pub mod server;
pub mod sources;
pub mod state;
pub mod synth;
pub mod tasks;
pub mod trainer;
