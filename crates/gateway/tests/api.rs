//! HTTP round trips against a real worker process
#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use toolgate_common::config::WorkerConfig;
use toolgate_gateway::{build_router, AppState, ToolClient};
use toolgate_supervisor::{CommandLauncher, RestartPolicy, Supervisor, SupervisorHandle, SupervisorOptions};
use tower::ServiceExt;

const WORKER_SCRIPT: &str = r##"
echo "Test MCP Server running on stdio" >&2
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p')
  case "$line" in
    *listTools*)
      printf '{"jsonrpc":"2.0","id":"%s","result":{"tools":[{"name":"perplexity_ask","inputSchema":{"type":"object"}}]}}\n' "$id"
      ;;
    *perplexity_ask*)
      printf '{"jsonrpc":"2.0","id":"%s","result":{"content":[{"type":"text","text":"42"}]}}\n' "$id"
      ;;
    *)
      printf '{"jsonrpc":"2.0","id":"%s","error":{"code":-32601,"message":"Unknown tool"}}\n' "$id"
      ;;
  esac
done
"##;

async fn app() -> (Router, SupervisorHandle) {
    let launcher = CommandLauncher::new(WorkerConfig {
        program: "sh".to_string(),
        args: vec!["-c".to_string(), WORKER_SCRIPT.to_string()],
        passthrough_env: Vec::new(),
        ..WorkerConfig::default()
    });
    let options = SupervisorOptions {
        restart: RestartPolicy::fixed(Duration::from_millis(200)),
        ..SupervisorOptions::default()
    };
    let (handle, _task) = Supervisor::start(Arc::new(launcher), options);

    let mut state = handle.subscribe();
    tokio::time::timeout(Duration::from_secs(10), state.wait_for(|s| s.is_healthy()))
        .await
        .expect("worker did not become healthy")
        .unwrap();

    let app = build_router(AppState::new(ToolClient::new(handle.clone()), true), None);
    (app, handle)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap())
}

fn call_tool(body: Value) -> Request<Body> {
    Request::post("/api/call-tool")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_list_tools() {
    let (app, handle) = app().await;

    let (status, body) = send(&app, Request::get("/api/tools").body(Body::empty()).unwrap()).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tools"][0]["name"], "perplexity_ask");

    handle.shutdown().await;
}

#[tokio::test]
async fn test_call_tool_returns_result_object() {
    let (app, handle) = app().await;

    let request = call_tool(json!({
        "tool": "perplexity_ask",
        "arguments": {"messages": [{"role": "user", "content": "meaning of life"}]}
    }));
    let (status, body) = send(&app, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["content"][0]["text"], "42");

    handle.shutdown().await;
}

#[tokio::test]
async fn test_unknown_tool_maps_to_bad_gateway() {
    let (app, handle) = app().await;

    let (status, body) = send(&app, call_tool(json!({"tool": "nope"}))).await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"]["code"], -32601);
    assert_eq!(body["error"]["message"], "Unknown tool");

    handle.shutdown().await;
}

#[tokio::test]
async fn test_health_follows_worker() {
    let (app, handle) = app().await;

    let (status, body) = send(&app, Request::get("/health").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    handle.shutdown().await;

    let (status, body) = send(&app, Request::get("/health").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["state"], "terminated");
}
