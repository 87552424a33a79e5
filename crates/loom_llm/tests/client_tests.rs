//! Client tests against a local stand-in for the chat completions endpoint.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use loom_core::{CodeGenerationService, PhaseKind, PhaseRequest, UpstreamError};
use loom_llm::{LlmClient, LlmConfig, LlmError};
use loom_runner::{FailureContext, FailureFixer, ProjectType};
use serde_json::{json, Value};
use tempfile::TempDir;

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}/v1/chat/completions", addr)
}

fn client(url: String) -> LlmClient {
    LlmClient::new(
        LlmConfig::default()
            .with_api_key("test-key")
            .with_api_url(url),
    )
    .unwrap()
}

fn reply(content: &str) -> Value {
    json!({
        "choices": [{"message": {"content": content}, "finish_reason": "stop"}]
    })
}

#[tokio::test]
async fn test_request_shape_and_document_reply() {
    let seen: Arc<Mutex<Vec<(Option<String>, Value)>>> = Arc::new(Mutex::new(Vec::new()));
    let captured = seen.clone();
    let router = Router::new().route(
        "/v1/chat/completions",
        post(move |headers: HeaderMap, Json(body): Json<Value>| {
            let captured = captured.clone();
            async move {
                let auth = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                captured.lock().unwrap().push((auth, body));
                Json(reply(
                    r#"```json
{"summary": "to-do list", "needs_database": false, "needs_api": false}
```"#,
                ))
            }
        }),
    );
    let client = client(serve(router).await);

    let request = PhaseRequest::new(
        "s1",
        PhaseKind::RequirementsAnalysis,
        "google/gemini-2.5-pro-exp-03-25:free",
        "a to-do list with local storage",
    );
    let artifact = client.generate(&request).await.unwrap();
    assert_eq!(artifact.summary, "to-do list");
    assert_eq!(artifact.document.unwrap()["needs_api"], json!(false));

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0.as_deref(), Some("Bearer test-key"));
    assert_eq!(seen[0].1["model"], "google/gemini-2.5-pro-exp-03-25:free");
    assert_eq!(seen[0].1["messages"][0]["role"], "system");
    assert!(seen[0].1["messages"][1]["content"]
        .as_str()
        .unwrap()
        .contains("local storage"));
}

#[tokio::test]
async fn test_truncated_code_generation_is_incomplete() {
    let router = Router::new().route(
        "/v1/chat/completions",
        post(|| async {
            Json(json!({
                "choices": [{
                    "message": {"content": "--- FILE: index.html ---\n<html>\n"},
                    "finish_reason": "length"
                }]
            }))
        }),
    );
    let client = client(serve(router).await);

    let request = PhaseRequest::new("s1", PhaseKind::CodeGeneration, "m", "site");
    let artifact = client.generate(&request).await.unwrap();
    assert_eq!(artifact.files.len(), 1);
    assert!(artifact.incomplete);
}

#[tokio::test]
async fn test_rate_limit_maps_to_upstream_error() {
    let router = Router::new().route(
        "/v1/chat/completions",
        post(|| async {
            (
                StatusCode::TOO_MANY_REQUESTS,
                [("retry-after", "7")],
                "slow down",
            )
        }),
    );
    let client = client(serve(router).await);

    let request = PhaseRequest::new("s1", PhaseKind::ArchitectureDesign, "m", "site");
    let err = client.generate(&request).await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
}

#[tokio::test]
async fn test_missing_model_is_not_retried() {
    let router = Router::new().route(
        "/v1/chat/completions",
        post(|| async { (StatusCode::NOT_FOUND, "No endpoints found") }),
    );
    let client = client(serve(router).await);

    let request = PhaseRequest::new("s1", PhaseKind::ArchitectureDesign, "gone/model", "site");
    let err = client.generate(&request).await.unwrap_err();
    assert!(matches!(err, UpstreamError::ModelUnavailable(_)));
}

#[tokio::test]
async fn test_error_inside_ok_response() {
    let router = Router::new().route(
        "/v1/chat/completions",
        post(|| async {
            Json(json!({"error": {"message": "Rate limit exceeded: free-models-per-min", "code": 429}}))
        }),
    );
    let client = client(serve(router).await);

    let err = client.complete("m", "sys", "user").await.unwrap_err();
    assert!(matches!(err, LlmError::RateLimited { .. }));
}

#[tokio::test]
async fn test_prose_for_design_phase_is_invalid() {
    let router = Router::new().route(
        "/v1/chat/completions",
        post(|| async { Json(reply("Sure! I would build it with three files.")) }),
    );
    let client = client(serve(router).await);

    let request = PhaseRequest::new("s1", PhaseKind::ArchitectureDesign, "m", "site");
    let err = client.generate(&request).await.unwrap_err();
    assert!(matches!(err, UpstreamError::InvalidResponse(_)));
}

#[tokio::test]
async fn test_fixer_returns_patches() {
    let router = Router::new().route(
        "/v1/chat/completions",
        post(|Json(body): Json<Value>| async move {
            let user = body["messages"][1]["content"].as_str().unwrap_or_default();
            assert!(user.contains("Cannot find module './routes'"));
            assert!(user.contains("Current content of server.js"));
            Json(reply(
                "--- FILE: routes.js ---\nmodule.exports = {};\n",
            ))
        }),
    );
    let client = client(serve(router).await);

    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("server.js"), "require('./routes');\n").unwrap();
    let failure = FailureContext {
        project_dir: dir.path().to_path_buf(),
        project_type: ProjectType::Node,
        command: "node server.js".to_string(),
        exit_code: Some(1),
        recent_logs: vec![
            "Error: Cannot find module './routes'".to_string(),
            "    at server.js:1:1".to_string(),
        ],
        model: "openai/gpt-4o".to_string(),
    };

    let patches = client.propose_fix(&failure).await.unwrap();
    assert_eq!(patches.len(), 1);
    assert_eq!(patches[0].path, "routes.js");
    assert_eq!(patches[0].content, "module.exports = {};\n");
}
