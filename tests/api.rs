mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use drug_rag::api;
use drug_rag::error::PipelineError;
use drug_rag::rag::local_store::LocalVectorStore;

use common::{engine, pipeline, FakeModel, FakeSource, DIM};

fn app(source: FakeSource, model: Arc<FakeModel>) -> Router {
    let store = Arc::new(LocalVectorStore::in_memory(DIM));
    let rag = engine(source, store, model, pipeline(200, 50, 4));
    api::router(Arc::new(rag), &[], Duration::from_secs(30))
}

fn aspirin_source() -> FakeSource {
    FakeSource::default()
        .with("aspirin", "indications", "Aspirin is used for pain relief and fever.")
        .with("aspirin", "warnings", "Reye's syndrome: children should not use aspirin.")
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_ingest_then_ask() {
    let model = Arc::new(FakeModel::new("Aspirin relieves pain and fever."));
    let app = app(aspirin_source(), model.clone());

    let (status, body) = send(&app, "POST", "/api/v1/rag/ingest", Some(json!({"drug_name": " Aspirin "}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["drug_name"], "aspirin");
    assert_eq!(body["facts_fetched"], 2);
    assert_eq!(body["chunks_indexed"], 2);

    let (status, body) = send(
        &app,
        "POST",
        "/api/v1/rag/ask",
        Some(json!({"question": "What is aspirin used for?", "drug_name": "aspirin"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["answer"], "Aspirin relieves pain and fever.");
    assert_eq!(body["grounded"], true);
    let sources = body["sources"].as_array().unwrap();
    assert_eq!(sources.len(), 2);
    assert!(sources.iter().all(|s| s["drug_name"] == "aspirin"));
    assert!(sources
        .iter()
        .all(|s| !s["content_preview"].as_str().unwrap().is_empty()));

    let (status, body) = send(&app, "GET", "/api/v1/rag/drugs/Aspirin", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["records"], 2);
    assert_eq!(body["last_ingest_state"], "done");
}

#[tokio::test]
async fn test_unknown_drug_is_not_found() {
    let app = app(aspirin_source(), Arc::new(FakeModel::new("ok")));
    let (status, body) = send(&app, "POST", "/api/v1/rag/ingest", Some(json!({"drug_name": "notadrug"}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn test_validation_errors() {
    let app = app(aspirin_source(), Arc::new(FakeModel::new("ok")));

    let (status, body) = send(&app, "POST", "/api/v1/rag/ingest", Some(json!({"drug_name": " a "}))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "invalid_input");

    let (status, _) = send(&app, "POST", "/api/v1/rag/ask", Some(json!({"question": "why"}))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let long = "q".repeat(501);
    let (status, _) = send(&app, "POST", "/api/v1/rag/ask", Some(json!({"question": long}))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_ask_on_empty_store_is_not_grounded() {
    let model = Arc::new(FakeModel::new("unused"));
    let app = app(aspirin_source(), model.clone());
    let (status, body) = send(
        &app,
        "POST",
        "/api/v1/rag/ask",
        Some(json!({"question": "What is aspirin used for?"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["grounded"], false);
    assert!(body["sources"].as_array().unwrap().is_empty());
    assert_eq!(model.calls(), 0);
}

#[tokio::test]
async fn test_upstream_failures_map_to_status_codes() {
    let cases = [
        (PipelineError::UpstreamRateLimited { retry_after: None }, StatusCode::TOO_MANY_REQUESTS),
        (PipelineError::UpstreamTimeout(Duration::from_secs(10)), StatusCode::GATEWAY_TIMEOUT),
        (PipelineError::UpstreamUnavailable("503".to_string()), StatusCode::BAD_GATEWAY),
        (PipelineError::MalformedUpstreamData("not json".to_string()), StatusCode::BAD_GATEWAY),
    ];
    for (error, expected) in cases {
        let kind = error.kind();
        let app = app(FakeSource::failing(error), Arc::new(FakeModel::new("ok")));
        let (status, body) = send(&app, "POST", "/api/v1/rag/ingest", Some(json!({"drug_name": "aspirin"}))).await;
        assert_eq!(status, expected);
        assert_eq!(body["error"], kind);
        assert_eq!(body["stage"], "fetching");
        assert!(body["detail"].as_str().is_some());
    }
}

#[tokio::test]
async fn test_clear_and_health() {
    let app = app(aspirin_source(), Arc::new(FakeModel::new("ok")));
    send(&app, "POST", "/api/v1/rag/ingest", Some(json!({"drug_name": "aspirin"}))).await;

    let (status, body) = send(&app, "GET", "/api/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["records"], 2);
    assert!(body["timestamp"].as_str().is_some());

    let (status, body) = send(&app, "DELETE", "/api/v1/rag/clear", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["records_removed"], 2);

    let (_, body) = send(&app, "GET", "/api/v1/rag/drugs/aspirin", None).await;
    assert_eq!(body["records"], 0);
}
