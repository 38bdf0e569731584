//! HTTP API server.
//!
//! Exposes every pipeline operation as a JSON HTTP API. Long-running stages
//! (collection, index build, QA generation, fine-tuning) are accepted with
//! `202 Accepted` and run in the background; their outcome is read from
//! `/tasks/{id}`. Search, chat, compare and evaluate answer inline.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Liveness plus initialization and index state |
//! | `GET`  | `/status` | Pipeline counters and last update time |
//! | `POST` | `/collect` | Collect papers from the configured source |
//! | `POST` | `/index/build` | Build the keyword and vector index |
//! | `POST` | `/synthetic/generate` | Generate QA pairs from indexed papers |
//! | `POST` | `/finetune` | Start a fine-tuning job |
//! | `GET`  | `/finetune/status` | Current or most recent fine-tuning job |
//! | `GET`  | `/tasks` | Background task records, newest first |
//! | `GET`  | `/tasks/{id}` | One background task record |
//! | `POST` | `/search` | Keyword, vector or hybrid search |
//! | `POST` | `/chat` | Ask the base or fine-tuned model, optionally with RAG |
//! | `POST` | `/compare` | Ask both models the same question |
//! | `POST` | `/evaluate` | Compare both models over held-out QA pairs |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "index_not_ready", "message": "index not ready: ..." } }
//! ```
//!
//! Error codes: `bad_request` and `invalid_hyperparameter` (400), `not_found`
//! (404), `job_already_running`, `stage_busy`, `empty_dataset` and
//! `index_not_ready` (409), `source_unavailable` (502),
//! `generation_unavailable` and `trainer_unavailable` (503), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so a browser frontend
//! served from another origin can call the API.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::collect::CollectRequest;
use crate::config::Config;
use crate::error::PipelineError;
use crate::evaluation::{EvaluateRequest, EvaluationReport};
use crate::extract::truncate_chars;
use crate::finetune::{FineTuneJob, FinetuneAck, Hyperparameters};
use crate::inference::{ChatReply, ChatRequest, CompareReply, CompareRequest};
use crate::pipeline::{Health, Pipeline, SearchResults};
use crate::search::SearchMode;
use crate::state::PipelineState;
use crate::synth::GenerateRequest;
use crate::tasks::{TaskAck, TaskRecord};

const SEARCH_TEXT_CHARS: usize = 500;

/// Opens the pipeline and serves the API on `[server].bind` until the
/// process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let pipeline = Arc::new(Pipeline::open(config.clone()).await?);
    let app = router(pipeline);

    info!(%bind_addr, "server starting");
    println!("Paper harness API listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Builds the router over an already opened pipeline.
pub fn router(pipeline: Arc<Pipeline>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/status", get(handle_status))
        .route("/collect", post(handle_collect))
        .route("/index/build", post(handle_build_index))
        .route("/synthetic/generate", post(handle_generate))
        .route("/finetune", post(handle_finetune))
        .route("/finetune/status", get(handle_finetune_status))
        .route("/tasks", get(handle_list_tasks))
        .route("/tasks/{id}", get(handle_get_task))
        .route("/search", post(handle_search))
        .route("/chat", post(handle_chat))
        .route("/compare", post(handle_compare))
        .route("/evaluate", post(handle_evaluate))
        .layer(cors)
        .with_state(pipeline)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    /// Machine-readable error code (e.g., `"bad_request"`, `"stage_busy"`).
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        let status = match &err {
            PipelineError::InvalidRequest(_) | PipelineError::InvalidHyperparameter { .. } => {
                StatusCode::BAD_REQUEST
            }
            PipelineError::JobAlreadyRunning { .. }
            | PipelineError::StageBusy(_)
            | PipelineError::EmptyDataset { .. }
            | PipelineError::IndexNotReady(_) => StatusCode::CONFLICT,
            PipelineError::GenerationUnavailable { .. } | PipelineError::TrainerUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            PipelineError::SourceUnavailable(_) => StatusCode::BAD_GATEWAY,
            PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
            PipelineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = format!("{:#}", err);
        if status.is_server_error() {
            error!(code = err.code(), %message, "request failed");
        }
        AppError {
            status,
            code: err.code().to_string(),
            message,
        }
    }
}

type ApiResult<T> = Result<T, AppError>;

fn accepted<T: Serialize>(body: T) -> Response {
    (StatusCode::ACCEPTED, Json(body)).into_response()
}

// ============ GET /health, GET /status ============

async fn handle_health(State(p): State<Arc<Pipeline>>) -> Json<Health> {
    Json(p.health())
}

async fn handle_status(State(p): State<Arc<Pipeline>>) -> Json<PipelineState> {
    Json(p.status())
}

// ============ Stage triggers ============

async fn handle_collect(
    State(p): State<Arc<Pipeline>>,
    Json(req): Json<CollectRequest>,
) -> ApiResult<Response> {
    Ok(accepted(p.submit_collect(req)?))
}

async fn handle_build_index(State(p): State<Arc<Pipeline>>) -> ApiResult<Response> {
    Ok(accepted(p.submit_build_index()?))
}

/// Parses an optional JSON body; an empty body means all defaults.
fn optional_body<T: DeserializeOwned + Default>(body: &Bytes) -> ApiResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| PipelineError::invalid(format!("invalid JSON body: {}", e)).into())
}

async fn handle_generate(State(p): State<Arc<Pipeline>>, body: Bytes) -> ApiResult<Response> {
    let req: GenerateRequest = optional_body(&body)?;
    Ok(accepted(p.submit_generate(req)?))
}

/// `POST /finetune` body: the job acknowledgement plus the task that trains it.
#[derive(Serialize)]
struct FinetuneStarted {
    #[serde(flatten)]
    ack: FinetuneAck,
    task_id: String,
}

async fn handle_finetune(State(p): State<Arc<Pipeline>>, body: Bytes) -> ApiResult<Response> {
    let hp: Hyperparameters = optional_body(&body)?;
    let (ack, task): (FinetuneAck, TaskAck) = p.submit_finetune(hp)?;
    Ok(accepted(FinetuneStarted {
        ack,
        task_id: task.task_id,
    }))
}

async fn handle_finetune_status(State(p): State<Arc<Pipeline>>) -> ApiResult<Json<FineTuneJob>> {
    p.finetune_status()
        .map(Json)
        .ok_or_else(|| PipelineError::NotFound("no fine-tuning job has been started".into()).into())
}

// ============ Tasks ============

#[derive(Serialize)]
struct TaskListResponse {
    tasks: Vec<TaskRecord>,
}

async fn handle_list_tasks(State(p): State<Arc<Pipeline>>) -> Json<TaskListResponse> {
    Json(TaskListResponse { tasks: p.tasks() })
}

async fn handle_get_task(
    State(p): State<Arc<Pipeline>>,
    Path(id): Path<String>,
) -> ApiResult<Json<TaskRecord>> {
    Ok(Json(p.task(&id)?))
}

// ============ POST /search ============

#[derive(Deserialize)]
struct SearchRequest {
    query: String,
    #[serde(default = "default_top_k")]
    top_k: usize,
    #[serde(default)]
    search_type: SearchMode,
}

fn default_top_k() -> usize {
    5
}

async fn handle_search(
    State(p): State<Arc<Pipeline>>,
    Json(req): Json<SearchRequest>,
) -> ApiResult<Json<SearchResults>> {
    if req.query.trim().is_empty() {
        return Err(PipelineError::invalid("query must not be empty").into());
    }
    let mut results = p.search(&req.query, req.top_k, req.search_type).await?;
    for hit in &mut results.results {
        let cut = truncate_chars(&hit.text, SEARCH_TEXT_CHARS).len();
        hit.text.truncate(cut);
    }
    Ok(Json(results))
}

// ============ POST /chat, POST /compare ============

#[derive(Serialize)]
struct ChatResponse {
    #[serde(flatten)]
    reply: ChatReply,
    response: String,
}

async fn handle_chat(
    State(p): State<Arc<Pipeline>>,
    Json(req): Json<ChatRequest>,
) -> ApiResult<Json<ChatResponse>> {
    let reply = p.chat(&req).await?;
    Ok(Json(ChatResponse {
        response: reply.message.clone(),
        reply,
    }))
}

async fn handle_compare(
    State(p): State<Arc<Pipeline>>,
    Json(req): Json<CompareRequest>,
) -> ApiResult<Json<CompareReply>> {
    Ok(Json(p.compare(&req).await?))
}

async fn handle_evaluate(
    State(p): State<Arc<Pipeline>>,
    body: Bytes,
) -> ApiResult<Json<EvaluationReport>> {
    let req: EvaluateRequest = optional_body(&body)?;
    Ok(Json(p.evaluate(&req).await?))
}
