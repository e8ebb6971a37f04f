// HTTP-level tests for the API router
use crate::{
    api::ApiServer,
    config::AppConfig,
    engine::{service::RequestService, ssrf::SsrfGuard, storage::InMemoryRequestStore},
    models::RequestStatus,
};

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tower::ServiceExt;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config(vars: &[(&str, &str)]) -> AppConfig {
    let mut map: HashMap<String, String> = [
        ("CALLBACK_BACKOFF_BASE_MS", "5"),
        ("CALLBACK_TIMEOUT_SECS", "2"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    for (k, v) in vars {
        map.insert(k.to_string(), v.to_string());
    }
    AppConfig::from_source(
        ::config::Environment::default()
            .try_parsing(true)
            .source(Some(map)),
    )
    .unwrap()
}

fn server(vars: &[(&str, &str)]) -> (Router, Arc<RequestService>) {
    let config = config(vars);
    let store = Arc::new(InMemoryRequestStore::new());
    let guard = SsrfGuard::new(config.environment);
    let service = Arc::new(RequestService::build(&config, store, guard).unwrap());
    let router = ApiServer::with_service(config, service.clone()).create_router();
    (router, service)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

#[tokio::test]
async fn test_sync_returns_result() {
    let (router, _) = server(&[]);

    let (status, body) = send(
        &router,
        post_json("/sync", json!({"data": {"a": 2, "b": 3}, "complexity": 2})),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert!(Uuid::parse_str(body["request_id"].as_str().unwrap()).is_ok());
    assert_eq!(body["result"]["sum"], json!(5.0));
    assert_eq!(body["result"]["complexity_level"], json!(2));
    assert!(body["processing_time_ms"].as_f64().unwrap() >= 0.0);
}

#[tokio::test]
async fn test_sync_rejects_out_of_range_complexity() {
    let (router, _) = server(&[]);

    let (status, body) = send(
        &router,
        post_json("/sync", json!({"data": {"a": 1}, "complexity": 0})),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INVALID_INPUT");
}

#[tokio::test]
async fn test_malformed_body_is_a_json_error() {
    let (router, _) = server(&[]);
    let request = Request::builder()
        .method(Method::POST)
        .uri("/sync")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();

    let (status, body) = send(&router, request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INVALID_INPUT");
    assert_eq!(body["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn test_sync_computation_failure_is_reported() {
    let (router, service) = server(&[]);

    let (status, body) = send(
        &router,
        post_json("/sync", json!({"data": {"a": 1e300, "b": 1e300}})),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "COMPUTATION_ERROR");

    let stored = service.list(None, 10, 0).await.unwrap();
    assert_eq!(stored[0].status, RequestStatus::Failed);
}

#[tokio::test]
async fn test_async_acknowledges_then_completes() {
    let (router, service) = server(&[]);

    let (status, body) = send(&router, post_json("/async", json!({"data": {"x": 4}}))).await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "accepted");
    let id = Uuid::parse_str(body["request_id"].as_str().unwrap()).unwrap();

    service
        .wait_for_terminal(&id, Duration::from_secs(5))
        .await
        .unwrap();

    let (status, record) = send(&router, get(&format!("/requests/{id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(record["mode"], "async");
    assert_eq!(record["status"], "completed");
    assert_eq!(record["result"]["sum"], json!(4.0));
    assert_eq!(record["callback_attempts"], json!(0));
}

#[tokio::test]
async fn test_async_callback_reaches_receiver() {
    let receiver = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&receiver)
        .await;
    let (router, service) = server(&[]);

    let (status, body) = send(
        &router,
        post_json(
            "/async",
            json!({
                "data": {"a": 1, "b": 2},
                "complexity": 1,
                "callback_url": format!("{}/hook", receiver.uri()),
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let id = Uuid::parse_str(body["request_id"].as_str().unwrap()).unwrap();

    let record = service
        .wait_for_terminal(&id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(record.status, RequestStatus::CallbackSent);
    assert_eq!(record.callback_attempts, 1);

    let delivered: Value = receiver.received_requests().await.unwrap()[0]
        .body_json()
        .unwrap();
    assert_eq!(delivered["request_id"], json!(id.to_string()));
    assert_eq!(delivered["result"]["sum"], json!(3.0));
}

#[tokio::test]
async fn test_async_rejects_malformed_callback_url() {
    let (router, _) = server(&[]);

    let (status, body) = send(
        &router,
        post_json(
            "/async",
            json!({"data": {"a": 1}, "callback_url": "not a url"}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INVALID_CALLBACK_URL");
}

#[tokio::test]
async fn test_get_request_errors() {
    let (router, _) = server(&[]);

    let (status, body) = send(&router, get(&format!("/requests/{}", Uuid::new_v4()))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");

    let (status, _) = send(&router, get("/requests/not-a-uuid")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_list_filters_and_validates() {
    let (router, service) = server(&[]);
    send(&router, post_json("/sync", json!({"data": {"a": 1}}))).await;
    send(&router, post_json("/sync", json!({"data": {"a": 2}}))).await;
    let (_, ack) = send(&router, post_json("/async", json!({"data": {"a": 3}}))).await;
    let id = Uuid::parse_str(ack["request_id"].as_str().unwrap()).unwrap();
    service
        .wait_for_terminal(&id, Duration::from_secs(5))
        .await
        .unwrap();

    let (status, all) = send(&router, get("/requests")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(all.as_array().unwrap().len(), 3);

    let (_, sync_only) = send(&router, get("/requests?mode=sync&limit=1")).await;
    let sync_only = sync_only.as_array().unwrap();
    assert_eq!(sync_only.len(), 1);
    assert_eq!(sync_only[0]["mode"], "sync");

    let (_, paged) = send(&router, get("/requests?mode=sync&offset=1")).await;
    assert_eq!(paged.as_array().unwrap().len(), 1);

    let (status, _) = send(&router, get("/requests?limit=0")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = send(&router, get("/requests?limit=1001")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = send(&router, get("/requests?mode=batch")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_health_check() {
    let (router, _) = server(&[]);

    let (status, body) = send(&router, get("/healthz")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    assert!(body["uptime_seconds"].as_f64().unwrap() >= 0.0);
}

#[tokio::test]
async fn test_stats_sections() {
    let (router, _) = server(&[]);
    send(&router, post_json("/sync", json!({"data": {"a": 1}}))).await;

    let (status, body) = send(&router, get("/stats")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["requests"]["total"], json!(1));
    assert_eq!(body["requests"]["by_mode"]["sync"], json!(1));
    assert_eq!(body["callbacks"]["attempts"], json!(0));
    assert_eq!(body["circuit_breakers"]["failure_threshold"], json!(5));
    assert_eq!(body["dispatcher"]["running"], json!(true));
    assert!(body["rate_limiting"].is_null());
    assert_eq!(body["system"]["environment"], "development");
}

#[tokio::test]
async fn test_rate_limit_in_production() {
    let (router, _) = server(&[
        ("ENVIRONMENT", "production"),
        ("RATE_LIMIT_MAX_REQUESTS", "2"),
    ]);

    for _ in 0..2 {
        let (status, _) = send(&router, post_json("/sync", json!({"data": {"a": 1}}))).await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, body) = send(&router, post_json("/sync", json!({"data": {"a": 1}}))).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"]["code"], "RATE_LIMITED");
    assert_eq!(body["retry_after"], json!(60));
    assert_eq!(body["path"], "/sync");

    // read-only routes are not limited
    let (status, stats) = send(&router, get("/stats")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["rate_limiting"]["rejected_requests"], json!(1));
    assert_eq!(stats["rate_limiting"]["max_requests_per_window"], json!(2));
}

#[tokio::test]
async fn test_no_rate_limit_in_development() {
    let (router, _) = server(&[("RATE_LIMIT_MAX_REQUESTS", "1")]);

    for _ in 0..3 {
        let (status, _) = send(&router, post_json("/sync", json!({"data": {"a": 1}}))).await;
        assert_eq!(status, StatusCode::OK);
    }
}

#[tokio::test]
async fn test_callback_echo() {
    let (router, _) = server(&[]);

    let (status, body) = send(
        &router,
        post_json("/test-callback", json!({"request_id": "abc", "result": {}})),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "callback_received");
    assert_eq!(body["payload"]["request_id"], "abc");
}

#[tokio::test]
async fn test_unknown_route() {
    let (router, _) = server(&[]);

    let (status, body) = send(&router, get("/nope")).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["path"], "/nope");
}

#[tokio::test]
async fn test_cors_preflight_for_configured_origin() {
    let (router, _) = server(&[]);
    let request = Request::builder()
        .method(Method::OPTIONS)
        .uri("/sync")
        .header(header::ORIGIN, "http://localhost:3000")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
        .body(Body::empty())
        .unwrap();

    let response = router.oneshot(request).await.unwrap();

    assert_eq!(
        response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .unwrap(),
        "http://localhost:3000"
    );
    assert_eq!(
        response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_CREDENTIALS)
            .unwrap(),
        "true"
    );
}
