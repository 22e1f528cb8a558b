//! HTTP front door tests.

use std::sync::Arc;

use aipm_pool::api::{AppState, create_router};
use axum::{
    body::Body,
    http::{Method, Request, Response, StatusCode, header},
};
use serde_json::{Value, json};
use tower::ServiceExt;

mod common;
use common::{FakeLauncher, Step, emit, start_pool, test_app, test_config};

fn post_execute(body: Value) -> Request<Body> {
    Request::builder()
        .uri("/execute")
        .method(Method::POST)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

async fn json_body(response: Response<Body>) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_health_reports_pool_state() {
    let (app, pool) = test_app(2).await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "*"
    );

    let json = json_body(response).await;
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
    assert_eq!(json["maxConcurrency"], 2);
    assert_eq!(json["active"], 0);
    assert_eq!(json["queued"], 0);
    assert_eq!(json["idle"], 2);
    assert!(json["uptimeSecs"].is_u64());
    assert!(json["startedAt"].is_string());

    let sessions = json["sessions"].as_array().unwrap();
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0]["id"], 0);
    assert_eq!(sessions[0]["state"], "idle");
    assert_eq!(sessions[0]["generation"], 1);
    assert_eq!(sessions[0]["restartCount"], 0);
    assert!(sessions[0]["pid"].is_u64());
    pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_status_is_an_alias_for_health() {
    let (app, pool) = test_app(1).await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/status")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["maxConcurrency"], 1);
    pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_execute_success() {
    let (app, pool) = test_app(1).await;

    let response = app
        .oneshot(post_execute(json!({ "prompt": "Draft acceptance criteria" })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["success"], true);
    assert_eq!(json["sessionId"], 0);
    assert_eq!(json["completion"], "marker");
    assert_eq!(json["possiblyIncomplete"], false);
    assert!(json["taskId"].is_string());
    assert!(json["durationMs"].is_u64());
    assert!(json["queuedMs"].is_u64());
    assert!(
        json["output"]
            .as_str()
            .unwrap()
            .contains("working on: Draft acceptance criteria")
    );
    assert!(json.get("error").is_none());
    pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_execute_passes_context() {
    let launcher = Arc::new(FakeLauncher::new(|line| {
        if line == "Estimate it" {
            vec![emit("3 points\nTASK COMPLETE\n")]
        } else {
            Vec::new()
        }
    }));
    let pool = start_pool(test_config(1), launcher.clone()).await;
    let app = create_router(AppState::new(pool.clone()));

    let response = app
        .oneshot(post_execute(json!({
            "prompt": "Estimate it",
            "context": "Story: export to CSV",
        })))
        .await
        .unwrap();

    let json = json_body(response).await;
    assert_eq!(json["success"], true);
    assert_eq!(
        launcher.inputs_for(0),
        vec!["Story: export to CSV", "", "Estimate it"]
    );
    pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_execute_timeout_is_reported_in_band() {
    let launcher = Arc::new(FakeLauncher::new(|_| vec![emit("half done\n"), Step::Hang]));
    let pool = start_pool(test_config(1), launcher).await;
    let app = create_router(AppState::new(pool.clone()));

    let response = app
        .oneshot(post_execute(json!({ "prompt": "Refactor", "timeoutMs": 2000 })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["success"], false);
    assert_eq!(json["errorKind"], "task_timeout");
    assert_eq!(json["sessionId"], 0);
    assert_eq!(json["output"], "half done\n");
    assert!(json["error"].as_str().unwrap().contains("2000ms"));
    assert!(json.get("completion").is_none());
    pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_execute_rejects_missing_prompt() {
    let (app, pool) = test_app(1).await;

    for body in [json!({}), json!({ "prompt": "   " }), json!({ "context": "only" })] {
        let response = app.clone().oneshot(post_execute(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = json_body(response).await;
        assert_eq!(json["code"], "validation_error");
        assert!(json["error"].is_string());
    }
    pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_execute_rejects_malformed_json() {
    let (app, pool) = test_app(1).await;

    let bad_requests = [
        Request::builder()
            .uri("/execute")
            .method(Method::POST)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{ not json"))
            .unwrap(),
        post_execute(json!({ "prompt": 42 })),
    ];
    for request in bad_requests {
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["code"], "validation_error");
    }
    pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_preflight_returns_no_content_with_cors_headers() {
    let (app, pool) = test_app(1).await;

    for uri in ["/execute", "/health", "/anything"] {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(uri)
                    .method(Method::OPTIONS)
                    .header(header::ORIGIN, "http://localhost:5173")
                    .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NO_CONTENT, "OPTIONS {uri}");
        let headers = response.headers();
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(
            headers[header::ACCESS_CONTROL_ALLOW_METHODS],
            "GET, POST, OPTIONS"
        );
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_HEADERS], "Content-Type");
    }
    pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_unknown_route_is_not_found() {
    let (app, pool) = test_app(1).await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/nope")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(response).await["code"], "not_found");
    pool.shutdown().await;
}
