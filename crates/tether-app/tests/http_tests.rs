mod common;

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use common::{TestFixtures, ALICE_TOKEN, BOB_TOKEN};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tower::ServiceExt;

use tether::gateway::create_router;

async fn call(
    app: &Router,
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_health_reports_backend() {
    let f = TestFixtures::new();
    let app = create_router(f.state.clone());

    let (status, body) = call(&app, Method::GET, "/api/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({"status": "ok", "backend": "fake-tmux", "degraded": false, "terminals": 0})
    );
}

#[tokio::test]
async fn test_sessions_require_bearer_token() {
    let f = TestFixtures::new();
    let app = create_router(f.state.clone());

    let (status, body) = call(&app, Method::GET, "/api/sessions", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "UNAUTHORIZED");
    assert_eq!(body["status"], 401);

    let (status, _) = call(&app, Method::GET, "/api/sessions", Some("bogus"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_session_lifecycle_over_http() {
    let f = TestFixtures::new();
    let app = create_router(f.state.clone());

    let (status, created) = call(
        &app,
        Method::POST,
        "/api/sessions",
        Some(ALICE_TOKEN),
        Some(json!({"name": "from-http"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["name"], "from-http");
    assert_eq!(created["ownerUserId"], "u-alice");
    let id = created["id"].as_str().unwrap().to_string();

    let (status, listed) = call(&app, Method::GET, "/api/sessions", Some(ALICE_TOKEN), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed["sessions"].as_array().unwrap().len(), 1);

    let (_, listed) = call(&app, Method::GET, "/api/sessions", Some(BOB_TOKEN), None).await;
    assert!(listed["sessions"].as_array().unwrap().is_empty());

    let uri = format!("/api/sessions/{}", id);
    let (status, _) = call(&app, Method::DELETE, &uri, Some(BOB_TOKEN), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = call(&app, Method::DELETE, &uri, Some(ALICE_TOKEN), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = call(&app, Method::DELETE, &uri, Some(ALICE_TOKEN), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}
