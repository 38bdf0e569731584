//! # Paper Harness CLI (`ph`)
//!
//! The `ph` binary drives every pipeline stage from the command line and
//! starts the HTTP API. Stage commands run inline and print their result.
//!
//! ## Usage
//!
//! ```bash
//! ph --config ./config/ph.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ph init` | Create the SQLite database and run schema migrations |
//! | `ph collect <category>` | Collect papers from the configured source |
//! | `ph index` | Build the keyword and vector index over new chunks |
//! | `ph search "<query>"` | Search indexed chunks |
//! | `ph generate` | Generate synthetic QA pairs from indexed papers |
//! | `ph finetune` | Fine-tune an adapter on the QA dataset |
//! | `ph chat "<message>"` | Ask the base or fine-tuned model |
//! | `ph compare "<question>"` | Ask both models and compare |
//! | `ph evaluate` | Compare both models on held-out QA pairs |
//! | `ph status` | Print pipeline counters |
//! | `ph serve` | Start the HTTP API server |
//!
//! ## Examples
//!
//! ```bash
//! ph init
//! ph collect cs.CL --num-papers 10
//! ph index
//! ph search "attention mechanisms" --mode hybrid --top-k 5
//! ph generate --num-papers 10 --qa-per-paper 3
//! ph finetune --epochs 1
//! ph chat "What is attention?" --model finetuned
//! ph serve
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use paper_harness::collect::CollectRequest;
use paper_harness::config;
use paper_harness::finetune::Hyperparameters;
use paper_harness::evaluation::EvaluateRequest;
use paper_harness::inference::{ChatRequest, CompareRequest, ModelType};
use paper_harness::migrate;
use paper_harness::pipeline::Pipeline;
use paper_harness::search::SearchMode;
use paper_harness::server;
use paper_harness::synth::GenerateRequest;

/// Paper Harness CLI: collect academic papers, index them, synthesize QA
/// pairs, fine-tune an adapter, and serve grounded chat.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/ph.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "ph",
    about = "Paper Harness: a paper-to-assistant pipeline with hybrid retrieval and fine-tuning",
    version,
    long_about = "Paper Harness collects papers from arXiv or a local directory, chunks and \
    indexes them for keyword, vector and hybrid search, synthesizes instruction-tuning QA pairs, \
    fine-tunes a LoRA adapter through an external trainer, and answers questions with the base \
    or fine-tuned model over a CLI and an HTTP API."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ph.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. Running it
    /// more than once is safe.
    Init,

    /// Collect papers from the configured source.
    Collect {
        /// Category to collect from (e.g., `cs.CL`).
        category: String,

        /// Free-text filter applied on top of the category.
        #[arg(long)]
        query: Option<String>,

        /// Number of papers to request.
        #[arg(long, default_value_t = 10)]
        num_papers: usize,
    },

    /// Index every chunk not yet in the index.
    Index,

    /// Search indexed chunks.
    Search {
        query: String,

        /// Search mode: `keyword`, `vector`, or `hybrid`.
        #[arg(long, default_value = "hybrid")]
        mode: String,

        /// Maximum number of results (1 to 20).
        #[arg(long, default_value_t = 5)]
        top_k: usize,
    },

    /// Generate synthetic QA pairs from the least recently used papers.
    Generate {
        #[arg(long, default_value_t = 10)]
        num_papers: usize,

        #[arg(long, default_value_t = 3)]
        qa_per_paper: usize,
    },

    /// Fine-tune an adapter on the QA dataset and wait for it to finish.
    Finetune {
        #[arg(long, default_value_t = 3)]
        epochs: u32,

        #[arg(long, default_value_t = 2)]
        batch_size: u32,

        #[arg(long, default_value_t = 2e-4)]
        learning_rate: f64,
    },

    /// Ask a question.
    Chat {
        message: String,

        /// Model to ask: `base` or `finetuned`.
        #[arg(long, default_value = "finetuned")]
        model: String,

        /// Answer without retrieved context.
        #[arg(long)]
        no_rag: bool,

        #[arg(long, default_value_t = 512)]
        max_tokens: u32,

        #[arg(long, default_value_t = 0.7)]
        temperature: f32,
    },

    /// Ask the base and fine-tuned models the same question.
    Compare {
        question: String,

        /// Expected answer; enables relevance scoring.
        #[arg(long)]
        reference: Option<String>,
    },

    /// Compare both models over held-out QA pairs and write a report.
    Evaluate {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Print pipeline counters.
    Status,

    /// Start the HTTP API server on `[server].bind`.
    Serve,
}

fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    // A missing .env file is fine; credentials may come from the environment.
    let _ = dotenvy::dotenv();

    init_tracing(match cli.command {
        Commands::Serve => "info",
        _ => "warn",
    });

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            std::fs::create_dir_all(&cfg.storage.data_dir)?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        command => {
            let pipeline = Pipeline::open(cfg).await?;
            let outcome = run_command(&pipeline, command).await;
            pipeline.close().await;
            outcome?;
        }
    }

    Ok(())
}

async fn run_command(p: &Pipeline, command: Commands) -> Result<()> {
    match command {
        Commands::Collect {
            category,
            query,
            num_papers,
        } => {
            let report = p
                .collect(&CollectRequest {
                    category,
                    query,
                    num_papers,
                })
                .await?;
            println!("{}", report.message);
            println!(
                "collected: {}  fetched: {}  duplicates: {}  chunks: {}",
                report.papers_collected, report.papers_fetched, report.duplicates, report.chunks_created
            );
            for title in &report.preview {
                println!("  - {}", title);
            }
        }
        Commands::Index => {
            let report = p.build_index().await?;
            println!("{}", report.message);
            println!(
                "chunks indexed: {}  documents: {}  index version: {}",
                report.chunks_indexed, report.documents_processed, report.index_version
            );
        }
        Commands::Search { query, mode, top_k } => {
            let mode: SearchMode = mode.parse().map_err(anyhow::Error::msg)?;
            let results = p.search(&query, top_k, mode).await?;
            if results.results.is_empty() {
                println!("No results.");
            }
            for (i, hit) in results.results.iter().enumerate() {
                println!(
                    "{}. [{:.4}] {} ({})",
                    i + 1,
                    hit.score,
                    hit.metadata.title,
                    hit.doc_id
                );
                println!("    {}", snippet(&hit.text, 200));
            }
        }
        Commands::Generate {
            num_papers,
            qa_per_paper,
        } => {
            let report = p
                .generate(&GenerateRequest {
                    num_papers,
                    qa_per_paper,
                })
                .await?;
            println!("{}", report.message);
            println!(
                "pairs: {}  papers: {}  dataset: {}",
                report.qa_pairs_generated, report.papers_processed, report.filepath
            );
            for pair in &report.preview {
                println!("  Q: {}", snippet(&pair.question, 120));
            }
        }
        Commands::Finetune {
            epochs,
            batch_size,
            learning_rate,
        } => {
            let report = p
                .finetune(Hyperparameters {
                    epochs,
                    batch_size,
                    learning_rate,
                })
                .await?;
            println!("{}", report.message);
            if let Some(loss) = report.train_loss {
                println!("train loss: {:.4}", loss);
            }
            if let Some(dir) = &report.output_dir {
                println!("adapter: {}", dir);
            }
        }
        Commands::Chat {
            message,
            model,
            no_rag,
            max_tokens,
            temperature,
        } => {
            let model_type: ModelType = model.parse().map_err(anyhow::Error::msg)?;
            let mut req = ChatRequest::new(message, model_type, !no_rag);
            req.max_tokens = max_tokens;
            req.temperature = temperature;
            let reply = p.chat(&req).await?;
            if let Some(notice) = &reply.notice {
                println!("note: {}", notice);
            }
            println!("{}", reply.message);
            println!();
            println!("model: {} ({})  latency: {} ms", reply.model_used, reply.model_id, reply.latency_ms);
            for source in reply.sources.iter().flatten() {
                println!("  source: {} [{:.4}]", source.title, source.score);
            }
        }
        Commands::Compare {
            question,
            reference,
        } => {
            let reply = p.compare(&CompareRequest { question, reference }).await?;
            println!("{}", reply.comparison);
        }
        Commands::Evaluate { limit } => {
            let report = p.evaluate(&EvaluateRequest { limit }).await?;
            let stats = &report.stats;
            println!("{}", report.message);
            println!(
                "relevance: base {:.3}, fine-tuned {:.3} ({:+.1}%)",
                stats.base.avg_relevance, stats.finetuned.avg_relevance, stats.improvement_percent
            );
            println!(
                "accuracy:  base {:.1}%, fine-tuned {:.1}%",
                stats.base.accuracy * 100.0,
                stats.finetuned.accuracy * 100.0
            );
            println!("report: {}", report.report_path);
        }
        Commands::Status => {
            let state = p.status();
            println!("status:             {}", state.status);
            println!("papers collected:   {}", state.papers_collected);
            println!("chunks indexed:     {}", state.chunks_indexed);
            println!("qa pairs generated: {}", state.qa_pairs_generated);
            println!("model trained:      {}", state.model_trained);
            println!("last updated:       {}", state.last_updated.to_rfc3339());
        }
        Commands::Init | Commands::Serve => {}
    }
    Ok(())
}

fn snippet(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match flat.char_indices().nth(max_chars) {
        Some((i, _)) => format!("{}...", &flat[..i]),
        None => flat,
    }
}
