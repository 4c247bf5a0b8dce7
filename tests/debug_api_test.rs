use axum::{
    body::Body,
    http::{Request, StatusCode},
    response::Response,
    Router,
};
use relayscope::api::build_router;
use relayscope::hub::DebugHub;
use relayscope::types::LogEntry;
use relayscope::{AppState, Args};
use serde_json::Value;
use tower::util::ServiceExt;

async fn setup_app(args: Args) -> (Router, AppState) {
    let hub = DebugHub::bootstrap(args.initial_state(), args.log_store_config(), None).await;
    let state = AppState::new(hub, reqwest::Client::new(), args);
    (build_router(state.clone()), state)
}

async fn body_json(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> Response {
    app.clone().oneshot(request).await.unwrap()
}

fn request(method: &str, uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_status_reports_initial_state() {
    let (app, _) = setup_app(Args::default()).await;

    let response = send(&app, request("GET", "/api/debug/status", "")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let status = body_json(response).await;
    assert_eq!(status["isDebugMode"], false);
    assert_eq!(status["logCount"], 0);
    assert_eq!(status["targetUrl"], "https://httpbin.org");
}

#[tokio::test]
async fn test_toggle_twice_restores_state() {
    let (app, state) = setup_app(Args::default()).await;

    let first = body_json(send(&app, request("POST", "/api/debug/toggle", "")).await).await;
    assert_eq!(first["isDebugMode"], true);
    assert!(state.hub.control.is_enabled());

    let second = body_json(send(&app, request("POST", "/api/debug/toggle", "")).await).await;
    assert_eq!(second["isDebugMode"], false);
    assert!(!state.hub.control.is_enabled());
}

#[tokio::test]
async fn test_invalid_target_is_rejected() {
    let (app, _) = setup_app(Args::default()).await;

    let response = send(
        &app,
        request("POST", "/api/proxy/target", r#"{"targetUrl":"not a url"}"#),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"], "Invalid target URL");

    let status = body_json(send(&app, request("GET", "/api/debug/status", "")).await).await;
    assert_eq!(status["targetUrl"], "https://httpbin.org");
}

#[tokio::test]
async fn test_valid_target_update_is_reflected_in_status() {
    let (app, _) = setup_app(Args::default()).await;

    let response = send(
        &app,
        request(
            "POST",
            "/api/proxy/target",
            r#"{"targetUrl":"http://127.0.0.1:9000/"}"#,
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["targetUrl"], "http://127.0.0.1:9000");

    let status = body_json(send(&app, request("GET", "/api/debug/status", "")).await).await;
    assert_eq!(status["targetUrl"], "http://127.0.0.1:9000");
}

#[tokio::test]
async fn test_clear_logs_empties_store() {
    let (app, state) = setup_app(Args::default()).await;
    state
        .hub
        .logs
        .save(LogEntry::new("GET", "https://httpbin.org/a", "/a"));
    state
        .hub
        .logs
        .save(LogEntry::new("GET", "https://httpbin.org/b", "/b"));

    let logs = body_json(send(&app, request("GET", "/api/logs", "")).await).await;
    assert_eq!(logs.as_array().unwrap().len(), 2);

    let cleared = body_json(send(&app, request("DELETE", "/api/logs", "")).await).await;
    assert_eq!(cleared["success"], true);

    let logs = body_json(send(&app, request("GET", "/api/logs", "")).await).await;
    assert_eq!(logs.as_array().unwrap().len(), 0);
    let status = body_json(send(&app, request("GET", "/api/debug/status", "")).await).await;
    assert_eq!(status["logCount"], 0);
}

#[tokio::test]
async fn test_dashboard_is_served_as_html() {
    let (app, _) = setup_app(Args::default()).await;

    for path in ["/debug", "/debug/"] {
        let response = send(&app, request("GET", path, "")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(content_type.starts_with("text/html"));
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(String::from_utf8_lossy(&bytes).contains("/ws"));
    }
}

#[tokio::test]
async fn test_request_id_is_generated_and_echoed() {
    let (app, _) = setup_app(Args::default()).await;

    let response = send(&app, request("GET", "/api/debug/status", "")).await;
    let generated = response.headers().get("x-request-id").unwrap();
    assert!(!generated.is_empty());

    let tagged = Request::builder()
        .uri("/api/debug/status")
        .header("x-request-id", "abc-123")
        .body(Body::empty())
        .unwrap();
    let response = send(&app, tagged).await;
    assert_eq!(response.headers().get("x-request-id").unwrap(), "abc-123");
}

#[tokio::test]
async fn test_api_allows_cross_origin_preflight() {
    let (app, _) = setup_app(Args::default()).await;

    let preflight = Request::builder()
        .method("OPTIONS")
        .uri("/api/logs")
        .header("origin", "https://viewer.example")
        .header("access-control-request-method", "DELETE")
        .body(Body::empty())
        .unwrap();
    let response = send(&app, preflight).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .contains_key("access-control-allow-origin"));
}
