//! REST client behaviour against a local HTTP engine.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use axum::extract::{Path, Query};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use easel_comfyui::api::{ComfyUIApi, ComfyUIApiError, DEFAULT_HEALTH_TIMEOUT};
use easel_core::job::{JobStatus, NO_IMAGES_ERROR};
use easel_core::workflow_graph::{GraphBuilder, JobGraph};
use serde_json::{json, Value};

const PNG: &[u8] = &[0x89, b'P', b'N', b'G'];

/// Serve `router` on an ephemeral port and point a client at it.
async fn serve(router: Router) -> ComfyUIApi {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
    ComfyUIApi::new(format!("http://{addr}"))
}

/// `GET /history/{id}` answering with `record` under the requested id.
fn history(record: Value) -> Router {
    Router::new().route(
        "/history/{prompt_id}",
        get(move |Path(prompt_id): Path<String>| async move {
            let mut body = serde_json::Map::new();
            body.insert(prompt_id, record);
            Json(Value::Object(body))
        }),
    )
}

/// `GET /view` serving `a.png` from `sub/`; anything else is a 404.
fn view() -> Router {
    Router::new().route(
        "/view",
        get(|Query(query): Query<HashMap<String, String>>| async move {
            let wanted = query.get("filename").map(String::as_str) == Some("a.png")
                && query.get("subfolder").map(String::as_str) == Some("sub")
                && query.get("type").map(String::as_str) == Some("output");
            if wanted {
                (StatusCode::OK, PNG.to_vec())
            } else {
                (StatusCode::NOT_FOUND, b"missing".to_vec())
            }
        }),
    )
}

fn succeeded(images: Value) -> Value {
    json!({
        "outputs": { "9": { "images": images } },
        "status": { "status_str": "success", "completed": true, "messages": [] }
    })
}

fn one_node_graph() -> JobGraph {
    let mut b = GraphBuilder::new();
    b.load_image("in.png");
    b.build()
}

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

#[tokio::test]
async fn submit_sends_graph_and_client_id() {
    let captured = Arc::new(Mutex::new(None));
    let sink = captured.clone();
    let api = serve(Router::new().route(
        "/prompt",
        post(move |Json(body): Json<Value>| async move {
            *sink.lock().unwrap() = Some(body);
            Json(json!({ "prompt_id": "p-1", "number": 3, "node_errors": {} }))
        }),
    ))
    .await;

    let submitted = api
        .submit_workflow(&one_node_graph(), Some("client-1"))
        .await
        .unwrap();

    assert_eq!(submitted.prompt_id, "p-1");
    assert_eq!(submitted.number, 3);
    let body = captured.lock().unwrap().take().unwrap();
    assert_eq!(body["client_id"], "client-1");
    assert_eq!(body["prompt"]["1"]["class_type"], "LoadImage");
}

#[tokio::test]
async fn node_errors_in_accepted_submission_are_rejected() {
    let api = serve(Router::new().route(
        "/prompt",
        post(|| async {
            Json(json!({
                "prompt_id": "p-1",
                "number": 0,
                "node_errors": { "1": { "errors": [{ "type": "value_not_in_list" }] } }
            }))
        }),
    ))
    .await;

    let err = api.submit_workflow(&one_node_graph(), None).await.unwrap_err();

    assert_matches!(err, ComfyUIApiError::NodeErrors(ref text) if text.contains("value_not_in_list"));
}

#[tokio::test]
async fn rejected_submission_carries_status_and_body() {
    let api = serve(Router::new().route(
        "/prompt",
        post(|| async { (StatusCode::BAD_REQUEST, "invalid prompt") }),
    ))
    .await;

    let err = api.submit_workflow(&one_node_graph(), None).await.unwrap_err();

    assert_matches!(
        err,
        ComfyUIApiError::ApiError { status: 400, ref body } if body == "invalid prompt"
    );
}

// ---------------------------------------------------------------------------
// History and status
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_prompt_is_still_processing() {
    let api = serve(Router::new().route(
        "/history/{prompt_id}",
        get(|| async { StatusCode::NOT_FOUND }),
    ))
    .await;

    assert!(api.get_history("p1").await.unwrap().is_none());
    let result = api.poll_status("p1").await.unwrap();
    assert_eq!(result.status, JobStatus::Processing);
    assert_eq!(result.prompt_id, "p1");
}

#[tokio::test]
async fn history_without_the_prompt_is_still_processing() {
    let api = serve(Router::new().route(
        "/history/{prompt_id}",
        get(|| async { Json(json!({ "other": succeeded(json!([])) })) }),
    ))
    .await;

    assert!(api.get_history("p1").await.unwrap().is_none());
    assert_eq!(
        api.poll_status("p1").await.unwrap().status,
        JobStatus::Processing
    );
}

#[tokio::test]
async fn incomplete_record_is_still_processing() {
    let api = serve(history(json!({
        "outputs": {},
        "status": { "status_str": "success", "completed": false, "messages": [] }
    })))
    .await;

    assert_eq!(
        api.poll_status("p1").await.unwrap().status,
        JobStatus::Processing
    );
}

#[tokio::test]
async fn successful_record_downloads_its_images() {
    let api = serve(
        history(succeeded(json!([
            { "filename": "a.png", "subfolder": "sub", "type": "output" }
        ])))
        .merge(view()),
    )
    .await;

    let result = api.poll_status("p1").await.unwrap();

    assert_eq!(result.status, JobStatus::Completed);
    assert_eq!(result.images.len(), 1);
    let image = &result.images[0];
    assert_eq!(image.filename, "a.png");
    assert_eq!(image.subfolder, "sub");
    assert_eq!(image.mime_type, "image/png");
    assert_eq!(image.data, PNG);
}

#[tokio::test]
async fn failed_download_is_skipped() {
    let api = serve(
        history(succeeded(json!([
            { "filename": "gone.png", "subfolder": "sub", "type": "output" },
            { "filename": "a.png", "subfolder": "sub", "type": "output" }
        ])))
        .merge(view()),
    )
    .await;

    let result = api.poll_status("p1").await.unwrap();

    assert_eq!(result.status, JobStatus::Completed);
    assert_eq!(result.images.len(), 1);
    assert_eq!(result.images[0].filename, "a.png");
}

#[tokio::test]
async fn success_without_images_is_a_failure() {
    let api = serve(history(succeeded(json!([])))).await;

    let result = api.poll_status("p1").await.unwrap();

    assert_eq!(result.status, JobStatus::Failed);
    assert_eq!(result.error.as_deref(), Some(NO_IMAGES_ERROR));
}

#[tokio::test]
async fn success_whose_only_image_is_missing_is_a_failure() {
    let api = serve(
        history(succeeded(json!([
            { "filename": "gone.png", "subfolder": "", "type": "output" }
        ])))
        .merge(view()),
    )
    .await;

    let result = api.poll_status("p1").await.unwrap();

    assert_eq!(result.status, JobStatus::Failed);
    assert_eq!(result.error.as_deref(), Some(NO_IMAGES_ERROR));
    assert!(result.images.is_empty());
}

#[tokio::test]
async fn engine_error_record_is_a_failed_result() {
    let api = serve(history(json!({
        "outputs": {},
        "status": {
            "status_str": "error",
            "completed": true,
            "messages": [
                ["execution_start", {}],
                ["execution_error", { "exception_type": "RuntimeError", "exception_message": "CUDA out of memory" }]
            ]
        }
    })))
    .await;

    let result = api.poll_status("p1").await.unwrap();

    assert_eq!(result.status, JobStatus::Failed);
    assert_eq!(result.error.as_deref(), Some("CUDA out of memory"));
}

#[tokio::test]
async fn slow_history_times_out() {
    let api = serve(Router::new().route(
        "/history/{prompt_id}",
        get(|| async {
            tokio::time::sleep(Duration::from_secs(3)).await;
            Json(json!({}))
        }),
    ))
    .await
    .with_timeouts(Duration::from_millis(200), DEFAULT_HEALTH_TIMEOUT);

    let err = api.get_history("p1").await.unwrap_err();

    assert_matches!(
        err,
        ComfyUIApiError::Timeout { ref endpoint, timeout_ms: 200 } if endpoint == "/history/p1"
    );
}

// ---------------------------------------------------------------------------
// Artifacts, health, introspection, upload
// ---------------------------------------------------------------------------

#[tokio::test]
async fn missing_artifact_is_an_api_error() {
    let api = serve(view()).await;

    let err = api
        .download_artifact("gone.png", "", "output")
        .await
        .unwrap_err();

    assert_matches!(err, ComfyUIApiError::ApiError { status: 404, .. });
}

#[tokio::test]
async fn health_follows_system_stats_status() {
    let healthy = serve(Router::new().route(
        "/system_stats",
        get(|| async { Json(json!({ "system": {} })) }),
    ))
    .await;
    assert!(healthy.health_check().await);

    let failing = serve(Router::new().route(
        "/system_stats",
        get(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
    ))
    .await;
    assert!(!failing.health_check().await);
}

#[tokio::test]
async fn node_class_lookup_reads_object_info() {
    let api = serve(Router::new().route(
        "/object_info/{class}",
        get(|Path(class): Path<String>| async move {
            if class == "KSampler" {
                Json(json!({ "KSampler": { "input": {} } }))
            } else {
                Json(json!({}))
            }
        }),
    ))
    .await;

    assert!(api.has_node_class("KSampler").await.unwrap());
    assert!(!api.has_node_class("VHS_VideoCombine").await.unwrap());
}

#[tokio::test]
async fn uploaded_image_name_includes_subfolder() {
    let api = serve(Router::new().route(
        "/upload/image",
        post(|| async { Json(json!({ "name": "in.png", "subfolder": "uploads", "type": "input" })) }),
    ))
    .await;

    let name = api
        .upload_image("in.png", PNG.to_vec(), true)
        .await
        .unwrap();

    assert_eq!(name, "uploads/in.png");
}
