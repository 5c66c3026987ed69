//! Tests for the health registry and its protocol endpoints

use super::health::*;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use std::time::Duration;
use tower::ServiceExt;

fn json_request(path: &str, service: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::json!({ "service": service }).to_string(),
        ))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[test]
fn test_qualified_service_name() {
    assert_eq!(qualified_service_name("Example"), "grpc.health.v1.Example");
    assert_eq!(
        qualified_service_name("depman.DepManService"),
        "grpc.health.v1.depman.DepManService"
    );
}

#[test]
fn test_overall_service_starts_serving() {
    let registry = HealthRegistry::new();
    assert_eq!(
        registry.check(OVERALL_SERVICE),
        Ok(ServingStatus::Serving)
    );
}

#[test]
fn test_unknown_service_lenient_reports_unknown() {
    let registry = HealthRegistry::new();
    assert_eq!(registry.check("nope"), Ok(ServingStatus::Unknown));
}

#[test]
fn test_unknown_service_strict_reports_not_found() {
    let registry = HealthRegistry::with_strict(true);
    assert_eq!(
        registry.check("nope"),
        Err(HealthError::ServiceNotFound("nope".to_string()))
    );
}

#[test]
fn test_register_inserts_unknown_entry() {
    let registry = HealthRegistry::with_strict(true);
    registry.register("grpc.health.v1.Example");

    assert_eq!(
        registry.check("grpc.health.v1.Example"),
        Ok(ServingStatus::Unknown)
    );

    // Registering again keeps the current status
    registry.set_serving_status("grpc.health.v1.Example", ServingStatus::Serving);
    registry.register("grpc.health.v1.Example");
    assert_eq!(
        registry.check("grpc.health.v1.Example"),
        Ok(ServingStatus::Serving)
    );
}

#[test]
fn test_set_serving_status_transitions() {
    let registry = HealthRegistry::new();

    assert!(registry.set_serving_status("svc", ServingStatus::Serving));
    assert_eq!(registry.check("svc"), Ok(ServingStatus::Serving));

    assert!(registry.set_serving_status("svc", ServingStatus::NotServing));
    assert_eq!(registry.check("svc"), Ok(ServingStatus::NotServing));
}

#[test]
fn test_shutdown_marks_everything_not_serving() {
    let registry = HealthRegistry::new();
    registry.set_serving_status("a", ServingStatus::Serving);
    registry.set_serving_status("b", ServingStatus::Unknown);

    assert!(registry.shutdown());

    let snapshot = registry.snapshot();
    assert_eq!(snapshot.len(), 3, "Overall entry plus two services");
    assert!(snapshot
        .values()
        .all(|status| *status == ServingStatus::NotServing));
}

#[test]
fn test_shutdown_is_idempotent_and_blocks_updates() {
    let registry = HealthRegistry::new();
    registry.set_serving_status("svc", ServingStatus::Serving);

    assert!(registry.shutdown());
    assert!(!registry.shutdown(), "Second shutdown should be a no-op");
    assert!(registry.is_shut_down());

    assert!(!registry.set_serving_status("svc", ServingStatus::Serving));
    assert_eq!(registry.check("svc"), Ok(ServingStatus::NotServing));
}

#[test]
fn test_resume_restores_previous_statuses() {
    let registry = HealthRegistry::new();
    registry.register("idle");
    registry.set_serving_status("up", ServingStatus::Serving);
    registry.set_serving_status("down", ServingStatus::NotServing);
    registry.shutdown();
    registry.register("late");
    assert_eq!(registry.check("late"), Ok(ServingStatus::NotServing));

    registry.resume();

    assert!(!registry.is_shut_down());
    assert_eq!(registry.check("idle"), Ok(ServingStatus::Unknown));
    assert_eq!(registry.check("up"), Ok(ServingStatus::Serving));
    assert_eq!(registry.check("down"), Ok(ServingStatus::NotServing));
    assert_eq!(registry.check("late"), Ok(ServingStatus::Unknown));
    assert_eq!(registry.check(OVERALL_SERVICE), Ok(ServingStatus::Serving));

    assert!(registry.set_serving_status("idle", ServingStatus::Serving));
    assert_eq!(registry.check("idle"), Ok(ServingStatus::Serving));
}

#[test]
fn test_resume_without_shutdown_is_noop() {
    let registry = HealthRegistry::new();
    registry.set_serving_status("svc", ServingStatus::NotServing);

    registry.resume();

    assert_eq!(registry.check("svc"), Ok(ServingStatus::NotServing));
}

/// SERVICE_UNKNOWN is reserved for Watch placeholders
#[test]
fn test_set_service_unknown_is_rejected() {
    let registry = HealthRegistry::new();
    registry.register("svc");

    assert!(!registry.set_serving_status("svc", ServingStatus::ServiceUnknown));
    assert!(!registry.set_serving_status("other", ServingStatus::ServiceUnknown));
    assert_eq!(registry.check("svc"), Ok(ServingStatus::Unknown));
    assert!(!registry.snapshot().contains_key("other"));

    registry.shutdown();
    assert_eq!(registry.check("svc"), Ok(ServingStatus::NotServing));
}

#[test]
fn test_registry_clones_share_state() {
    let registry = HealthRegistry::new();
    let clone = registry.clone();

    clone.set_serving_status("svc", ServingStatus::Serving);
    assert_eq!(registry.check("svc"), Ok(ServingStatus::Serving));
}

#[test]
fn test_watch_does_not_register_service() {
    let registry = HealthRegistry::with_strict(true);
    let _watch = registry.watch("ghost");

    assert!(registry.check("ghost").is_err());
    assert!(!registry.snapshot().contains_key("ghost"));
}

#[test]
fn test_dropped_watches_leave_no_entries() {
    let registry = HealthRegistry::new();
    let baseline = registry.entry_count();

    for i in 0..1000 {
        drop(registry.watch(&format!("random-{}", i)));
    }

    assert_eq!(registry.entry_count(), baseline);
}

#[test]
fn test_placeholder_kept_while_any_watcher_remains() {
    let registry = HealthRegistry::new();
    let first = registry.watch("ghost");
    let second = registry.watch("ghost");
    let baseline = registry.entry_count();

    drop(first);
    assert_eq!(registry.entry_count(), baseline);

    drop(second);
    assert_eq!(registry.entry_count(), baseline - 1);
}

#[test]
fn test_dropping_watch_keeps_registered_entry() {
    let registry = HealthRegistry::new();
    registry.register("svc");

    drop(registry.watch("svc"));

    assert_eq!(registry.check("svc"), Ok(ServingStatus::Unknown));
    assert!(registry.snapshot().contains_key("svc"));
}

#[tokio::test]
async fn test_dropped_watch_stream_leaves_no_entry() {
    let registry = HealthRegistry::new();
    let baseline = registry.entry_count();

    let mut stream = Box::pin(registry.watch("ghost").into_stream());
    assert_eq!(
        futures::StreamExt::next(&mut stream).await,
        Some(ServingStatus::ServiceUnknown)
    );
    drop(stream);

    assert_eq!(registry.entry_count(), baseline);
}

#[tokio::test]
async fn test_watch_yields_current_then_changes() {
    let registry = HealthRegistry::new();
    registry.set_serving_status("svc", ServingStatus::NotServing);

    let mut watch = registry.watch("svc");
    assert_eq!(watch.next().await, Some(ServingStatus::NotServing));

    registry.set_serving_status("svc", ServingStatus::Serving);
    let next = tokio::time::timeout(Duration::from_secs(1), watch.next()).await;
    assert_eq!(next.unwrap(), Some(ServingStatus::Serving));
}

#[tokio::test]
async fn test_watch_unregistered_reports_service_unknown_until_set() {
    let registry = HealthRegistry::new();

    let mut watch = registry.watch("later");
    assert_eq!(watch.next().await, Some(ServingStatus::ServiceUnknown));

    registry.set_serving_status("later", ServingStatus::Serving);
    let next = tokio::time::timeout(Duration::from_secs(1), watch.next()).await;
    assert_eq!(next.unwrap(), Some(ServingStatus::Serving));
}

#[tokio::test]
async fn test_watch_ends_after_shutdown() {
    let registry = HealthRegistry::new();
    registry.set_serving_status("svc", ServingStatus::Serving);

    let mut watch = registry.watch("svc");
    assert_eq!(watch.next().await, Some(ServingStatus::Serving));

    registry.shutdown();

    let last = tokio::time::timeout(Duration::from_secs(1), watch.next()).await;
    assert_eq!(last.unwrap(), Some(ServingStatus::NotServing));

    let end = tokio::time::timeout(Duration::from_secs(1), watch.next()).await;
    assert_eq!(end.unwrap(), None, "Stream should end once shut down");
}

#[tokio::test]
async fn test_check_endpoint_reports_status() {
    let registry = HealthRegistry::new();
    registry.set_serving_status("grpc.health.v1.Example", ServingStatus::Serving);

    let response = health_routes(registry)
        .oneshot(json_request(CHECK_PATH, "grpc.health.v1.Example"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await,
        serde_json::json!({ "status": "SERVING" })
    );
}

#[tokio::test]
async fn test_check_endpoint_strict_unknown_is_404() {
    let registry = HealthRegistry::with_strict(true);

    let response = health_routes(registry)
        .oneshot(json_request(CHECK_PATH, "missing"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("missing"));
}

#[tokio::test]
async fn test_watch_endpoint_streams_events() {
    let registry = HealthRegistry::new();
    registry.set_serving_status("svc", ServingStatus::Serving);
    registry.shutdown();

    // Registry already shut down: the stream emits the final status and ends
    let response = health_routes(registry)
        .oneshot(json_request(WATCH_PATH, "svc"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = tokio::time::timeout(
        Duration::from_secs(1),
        axum::body::to_bytes(response.into_body(), usize::MAX),
    )
    .await
    .unwrap()
    .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();

    assert!(text.contains("event: status"), "got: {}", text);
    assert!(text.contains(r#"data: {"status":"NOT_SERVING"}"#), "got: {}", text);
}

#[tokio::test]
async fn test_healthz_returns_200() {
    let response = health_routes(HealthRegistry::new())
        .oneshot(
            Request::builder()
                .uri("/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), 200, "Liveness probe should return 200");
}

#[tokio::test]
async fn test_readyz_follows_overall_status() {
    let registry = HealthRegistry::new();
    let ready = |registry: HealthRegistry| async move {
        health_routes(registry)
            .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    };

    assert_eq!(ready(registry.clone()).await, 200);

    registry.shutdown();
    assert_eq!(
        ready(registry.clone()).await,
        503,
        "Readiness probe should return 503 while draining"
    );
}
