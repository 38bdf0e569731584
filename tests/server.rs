//! HTTP API tests driving the router in-process.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use common::{Harness, MockTrainer};
use http_body_util::BodyExt;
use paper_harness::collect::CollectRequest;
use paper_harness::pipeline::Pipeline;
use paper_harness::server::router;
use paper_harness::synth::GenerateRequest;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(b) => builder
            .header("content-type", "application/json")
            .body(Body::from(b.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| json!({"raw": String::from_utf8_lossy(&bytes)}))
    };
    (status, value)
}

async fn wait_for_task(app: &Router, task_id: &str) -> Value {
    for _ in 0..500 {
        let (status, record) = call(app, "GET", &format!("/tasks/{}", task_id), None).await;
        assert_eq!(status, StatusCode::OK);
        if record["state"] != "running" {
            return record;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {} did not finish", task_id);
}

async fn indexed(h: &Harness) -> Arc<Pipeline> {
    let p = Arc::new(h.open().await);
    p.collect(&CollectRequest {
        category: "cs.CL".to_string(),
        query: None,
        num_papers: 6,
    })
    .await
    .unwrap();
    p.build_index().await.unwrap();
    p
}

#[tokio::test]
async fn test_health_and_status() {
    let h = Harness::new();
    let app = router(Arc::new(h.open().await));

    let (status, body) = call(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["initialized"], true);
    assert_eq!(body["index_loaded"], false);

    let (status, body) = call(&app, "GET", "/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["papers_collected"], 0);
    assert_eq!(body["model_trained"], false);
    assert!(body["last_updated"].is_string());
}

#[tokio::test]
async fn test_collect_is_accepted_and_runs_in_background() {
    let h = Harness::new();
    let app = router(Arc::new(h.open().await));

    let (status, ack) = call(
        &app,
        "POST",
        "/collect",
        Some(json!({"category": "cs.CL", "num_papers": 5})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(ack["status"], "accepted");

    let record = wait_for_task(&app, ack["task_id"].as_str().unwrap()).await;
    assert_eq!(record["state"], "succeeded");
    assert_eq!(record["result"]["papers_collected"], 5);

    let (_, body) = call(&app, "GET", "/status", None).await;
    assert_eq!(body["papers_collected"], 5);

    let (_, list) = call(&app, "GET", "/tasks", None).await;
    assert_eq!(list["tasks"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_collect_validation_is_bad_request() {
    let h = Harness::new();
    let app = router(Arc::new(h.open().await));

    let (status, body) = call(
        &app,
        "POST",
        "/collect",
        Some(json!({"category": "cs.CL", "num_papers": 0})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn test_search_truncates_text_and_reports_mode() {
    let h = Harness::new();
    let app = router(indexed(&h).await);

    let (status, body) = call(
        &app,
        "POST",
        "/search",
        Some(json!({"query": "attention transformers", "top_k": 3})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["search_type"], "hybrid");
    let results = body["results"].as_array().unwrap();
    assert!(!results.is_empty() && results.len() <= 3);
    assert_eq!(body["total_results"], results.len());
    for r in results {
        assert!(r["text"].as_str().unwrap().chars().count() <= 500);
        assert!(r["metadata"]["title"].is_string());
    }
}

#[tokio::test]
async fn test_search_rejects_empty_query_and_bad_top_k() {
    let h = Harness::new();
    let app = router(Arc::new(h.open().await));

    let (status, body) = call(&app, "POST", "/search", Some(json!({"query": "  "}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");

    let (status, _) = call(
        &app,
        "POST",
        "/search",
        Some(json!({"query": "attention", "top_k": 50})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_generate_before_index_is_conflict() {
    let h = Harness::new();
    let app = router(Arc::new(h.open().await));

    let (status, body) = call(
        &app,
        "POST",
        "/synthetic/generate",
        Some(json!({"num_papers": 2, "qa_per_paper": 2})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "index_not_ready");
}

#[tokio::test]
async fn test_finetune_without_dataset_is_conflict() {
    let h = Harness::new();
    let app = router(Arc::new(h.open().await));

    let (status, body) = call(&app, "POST", "/finetune", Some(json!({"epochs": 1}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "empty_dataset");
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("run synthetic data generation first"));

    let (status, body) = call(&app, "GET", "/finetune/status", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn test_finetune_invalid_hyperparameter() {
    let h = Harness::new();
    let app = router(Arc::new(h.open().await));

    let (status, body) = call(&app, "POST", "/finetune", Some(json!({"batch_size": 0}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "invalid_hyperparameter");
}

#[tokio::test]
async fn test_finetune_lifecycle_over_http() {
    let h = Harness::with_trainer(MockTrainer::gated());
    let p = indexed(&h).await;
    p.generate(&GenerateRequest {
        num_papers: 2,
        qa_per_paper: 2,
    })
    .await
    .unwrap();
    let app = router(p);

    let (status, ack) = call(&app, "POST", "/finetune", Some(json!({"epochs": 1}))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(ack["status"], "started");
    let job_id = ack["job_id"].as_str().unwrap().to_string();

    let (status, body) = call(&app, "POST", "/finetune", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "job_already_running");

    let (_, job) = call(&app, "GET", "/finetune/status", None).await;
    assert_eq!(job["job_id"], job_id.as_str());
    assert_eq!(job["stage"], "running");

    h.trainer.release.notify_one();
    let record = wait_for_task(&app, ack["task_id"].as_str().unwrap()).await;
    assert_eq!(record["state"], "succeeded");
    assert_eq!(record["result"]["train_loss"], 1.25);

    let (_, job) = call(&app, "GET", "/finetune/status", None).await;
    assert_eq!(job["stage"], "succeeded");
    let (_, status_body) = call(&app, "GET", "/status", None).await;
    assert_eq!(status_body["model_trained"], true);
}

#[tokio::test]
async fn test_chat_returns_response_alias_and_sources() {
    let h = Harness::new();
    let app = router(indexed(&h).await);

    let (status, body) = call(
        &app,
        "POST",
        "/chat",
        Some(json!({"message": "What does LoRA freeze?"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], body["response"]);
    assert_eq!(body["model_used"], "base");
    assert!(body["notice"].is_string());
    assert!(body["latency_ms"].is_u64());
    assert!(!body["sources"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_chat_rejects_bad_temperature() {
    let h = Harness::new();
    let app = router(Arc::new(h.open().await));

    let (status, body) = call(
        &app,
        "POST",
        "/chat",
        Some(json!({"message": "hi", "temperature": 3.5})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn test_compare() {
    let h = Harness::new();
    let app = router(Arc::new(h.open().await));

    let (status, body) = call(
        &app,
        "POST",
        "/compare",
        Some(json!({"question": "What is attention?"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["question"], "What is attention?");
    assert_eq!(body["finetuned_available"], false);
    assert!(body["comparison"].is_string());
    assert!(body.get("evaluation").is_none());
}

#[tokio::test]
async fn test_unknown_task_is_not_found() {
    let h = Harness::new();
    let app = router(Arc::new(h.open().await));

    let (status, body) = call(&app, "GET", "/tasks/does-not-exist", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn test_evaluate_over_http() {
    let h = Harness::new();
    let p = indexed(&h).await;
    let app = router(p.clone());

    let (status, body) = call(&app, "POST", "/evaluate", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "empty_dataset");

    p.generate(&GenerateRequest {
        num_papers: 3,
        qa_per_paper: 2,
    })
    .await
    .unwrap();

    let (status, body) = call(&app, "POST", "/evaluate", Some(json!({"limit": 4}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["finetuned_available"], false);
    let total = body["stats"]["total_questions"].as_u64().unwrap();
    assert!(total > 0 && total <= 4);
    assert!(body["report_path"].as_str().unwrap().ends_with(".md"));

    let (status, _) = call(&app, "POST", "/evaluate", Some(json!({"limit": 101}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
