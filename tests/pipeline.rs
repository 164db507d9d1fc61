//! Request pipeline behaviour against a mocked shop API.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use tollgate::{Error, Pipeline, Session, SessionState};

use common::{
    EXPIRED, RecordingNavigator, error_body, header_value, mount_csrf, requests_to, signed_in,
    token_body,
};

// ============================================================================
// Outbound headers
// ============================================================================

#[tokio::test]
async fn test_get_carries_bearer_but_no_csrf() {
    let server = MockServer::start().await;
    mount_csrf(&server, "csrf-1").await;
    Mock::given(method("GET"))
        .and(path("/api/products"))
        .and(header("authorization", "Bearer tok-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "id": 1 }])))
        .expect(1)
        .mount(&server)
        .await;

    let pipeline = signed_in(&server, "tok-1").await;
    let products: serde_json::Value = pipeline.get("/products").send_json().await.unwrap();
    assert_eq!(products[0]["id"], 1);

    let seen = requests_to(&server, "/api/products").await;
    assert!(header_value(&seen[0], "x-csrf-token").is_none());
    assert!(header_value(&seen[0], "x-request-id").is_some());
    assert!(requests_to(&server, "/api/auth/csrf-token").await.is_empty());
}

#[tokio::test]
async fn test_anonymous_request_has_no_authorization() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let pipeline = common::pipeline(&server);
    pipeline.get("/health").send().await.unwrap();

    let seen = requests_to(&server, "/api/health").await;
    assert!(header_value(&seen[0], "authorization").is_none());
}

#[tokio::test]
async fn test_mutating_requests_reuse_one_csrf_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/auth/csrf-token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "csrfToken": "csrf-1" }))
                .set_delay(Duration::from_millis(100)),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/products"))
        .and(header("x-csrf-token", "csrf-1"))
        .respond_with(ResponseTemplate::new(201))
        .expect(4)
        .mount(&server)
        .await;

    let pipeline = signed_in(&server, "tok-1").await;
    let (a, b, c) = tokio::join!(
        pipeline.post("/products").json(&json!({ "name": "a" })).send(),
        pipeline.post("/products").json(&json!({ "name": "b" })).send(),
        pipeline.post("/products").json(&json!({ "name": "c" })).send(),
    );
    assert!(a.is_ok() && b.is_ok() && c.is_ok());

    // Cached now; no second fetch.
    pipeline.post("/products").send().await.unwrap();
}

#[tokio::test]
async fn test_skip_csrf_sends_no_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/auth/csrf-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "csrfToken": "csrf-1" })))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/webhooks/ping"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let pipeline = common::pipeline(&server);
    pipeline.post("/webhooks/ping").skip_csrf().send().await.unwrap();

    let seen = requests_to(&server, "/api/webhooks/ping").await;
    assert!(header_value(&seen[0], "x-csrf-token").is_none());
}

#[tokio::test]
async fn test_unavailable_csrf_token_still_sends() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/auth/csrf-token"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/api/products/7"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let pipeline = signed_in(&server, "tok-1").await;
    let response = pipeline.delete("/products/7").send().await.unwrap();
    assert_eq!(response.status().as_u16(), 204);
}

// ============================================================================
// CSRF recovery
// ============================================================================

#[tokio::test]
async fn test_csrf_rejection_retries_with_new_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/auth/csrf-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "csrfToken": "csrf-1" })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_csrf(&server, "csrf-2").await;
    Mock::given(method("PUT"))
        .and(path("/api/products/1"))
        .respond_with(error_body(403, "invalid csrf token"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/api/products/1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": 1 })))
        .mount(&server)
        .await;

    let pipeline = signed_in(&server, "tok-1").await;
    let response = pipeline
        .put("/products/1")
        .json(&json!({ "price": 10 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);

    let seen = requests_to(&server, "/api/products/1").await;
    assert_eq!(seen.len(), 2);
    assert_eq!(header_value(&seen[0], "x-csrf-token").as_deref(), Some("csrf-1"));
    assert_eq!(header_value(&seen[1], "x-csrf-token").as_deref(), Some("csrf-2"));
    assert_eq!(
        header_value(&seen[0], "x-request-id"),
        header_value(&seen[1], "x-request-id")
    );
}

#[tokio::test]
async fn test_csrf_retry_happens_once() {
    let server = MockServer::start().await;
    mount_csrf(&server, "csrf-1").await;
    Mock::given(method("POST"))
        .and(path("/api/orders"))
        .respond_with(error_body(419, "CSRF token mismatch"))
        .expect(2)
        .mount(&server)
        .await;

    let pipeline = signed_in(&server, "tok-1").await;
    let err = pipeline.post("/orders").send().await.unwrap_err();
    assert_eq!(err.status(), Some(419));
    assert!(err.is_csrf_rejection());
}

#[tokio::test]
async fn test_plain_forbidden_is_not_retried() {
    let server = MockServer::start().await;
    mount_csrf(&server, "csrf-1").await;
    Mock::given(method("POST"))
        .and(path("/api/admin/users"))
        .respond_with(error_body(403, "Forbidden resource"))
        .expect(1)
        .mount(&server)
        .await;

    let pipeline = signed_in(&server, "tok-1").await;
    let err = pipeline.post("/admin/users").send().await.unwrap_err();
    assert!(matches!(err, Error::Api { status: 403, .. }));
}

// ============================================================================
// Access-token expiry
// ============================================================================

#[tokio::test]
async fn test_expired_token_is_refreshed_and_replayed() {
    let server = MockServer::start().await;
    mount_csrf(&server, "csrf-1").await;
    Mock::given(method("GET"))
        .and(path("/api/orders"))
        .and(header("authorization", "Bearer tok-1"))
        .respond_with(error_body(401, EXPIRED))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh-token"))
        .respond_with(token_body("tok-2"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/orders"))
        .and(header("authorization", "Bearer tok-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "total": 3 })))
        .expect(1)
        .mount(&server)
        .await;

    let pipeline = signed_in(&server, "tok-1").await;
    let body: serde_json::Value = pipeline.get("/orders").send_json().await.unwrap();
    assert_eq!(body["total"], 3);
    assert_eq!(
        pipeline.credentials().access_token().await.as_deref(),
        Some("tok-2")
    );
    assert_eq!(pipeline.refresh_coordinator().refresh_count(), 1);
    assert!(!pipeline.refresh_coordinator().is_refreshing());
}

#[tokio::test]
async fn test_concurrent_expiries_share_one_refresh() {
    let server = MockServer::start().await;
    mount_csrf(&server, "csrf-1").await;
    for (route, delay) in [("/api/a", 0), ("/api/b", 30), ("/api/c", 60)] {
        Mock::given(method("GET"))
            .and(path(route))
            .and(header("authorization", "Bearer tok-1"))
            .respond_with(error_body(401, EXPIRED).set_delay(Duration::from_millis(delay)))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(route))
            .and(header("authorization", "Bearer tok-2"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
    }
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh-token"))
        .respond_with(token_body("tok-2").set_delay(Duration::from_millis(300)))
        .expect(1)
        .mount(&server)
        .await;

    let pipeline = signed_in(&server, "tok-1").await;
    let (a, b, c) = tokio::join!(
        pipeline.get("/a").send(),
        pipeline.get("/b").send(),
        pipeline.get("/c").send(),
    );
    assert!(a.is_ok() && b.is_ok() && c.is_ok());
    assert_eq!(pipeline.refresh_coordinator().refresh_count(), 1);
}

#[tokio::test]
async fn test_slow_replay_does_not_hold_back_siblings() {
    let server = MockServer::start().await;
    mount_csrf(&server, "csrf-1").await;
    for route in ["/api/slow", "/api/fast"] {
        Mock::given(method("GET"))
            .and(path(route))
            .and(header("authorization", "Bearer tok-1"))
            .respond_with(error_body(401, EXPIRED))
            .mount(&server)
            .await;
    }
    Mock::given(method("GET"))
        .and(path("/api/slow"))
        .and(header("authorization", "Bearer tok-2"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(1500)))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/fast"))
        .and(header("authorization", "Bearer tok-2"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh-token"))
        .respond_with(token_body("tok-2").set_delay(Duration::from_millis(200)))
        .expect(1)
        .mount(&server)
        .await;

    let pipeline = signed_in(&server, "tok-1").await;
    let started = Instant::now();
    let (slow, fast_elapsed) = tokio::join!(pipeline.get("/slow").send(), async {
        pipeline.get("/fast").send().await.unwrap();
        started.elapsed()
    });

    assert!(slow.is_ok());
    assert!(
        fast_elapsed < Duration::from_millis(1000),
        "fast replay waited {fast_elapsed:?}"
    );
}

#[tokio::test]
async fn test_expiry_during_replay_starts_new_refresh() {
    let server = MockServer::start().await;
    mount_csrf(&server, "csrf-1").await;
    Mock::given(method("GET"))
        .and(path("/api/slow"))
        .and(header("authorization", "Bearer tok-1"))
        .respond_with(error_body(401, EXPIRED))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/slow"))
        .and(header("authorization", "Bearer tok-2"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(1000)))
        .mount(&server)
        .await;
    // By the time /late goes out the server has already retired tok-2.
    Mock::given(method("GET"))
        .and(path("/api/late"))
        .and(header("authorization", "Bearer tok-2"))
        .respond_with(error_body(401, EXPIRED))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/late"))
        .and(header("authorization", "Bearer tok-3"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh-token"))
        .respond_with(token_body("tok-2").set_delay(Duration::from_millis(100)))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh-token"))
        .respond_with(token_body("tok-3"))
        .mount(&server)
        .await;

    let pipeline = signed_in(&server, "tok-1").await;
    let (slow, late) = tokio::join!(pipeline.get("/slow").send(), async {
        // Inside the /slow replay window.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!pipeline.refresh_coordinator().is_refreshing());
        pipeline.get("/late").send().await
    });

    assert!(slow.is_ok());
    assert_eq!(late.unwrap().status().as_u16(), 200);
    assert_eq!(pipeline.refresh_coordinator().refresh_count(), 2);
}

#[tokio::test]
async fn test_failed_refresh_rejects_queue_and_redirects_once() {
    let server = MockServer::start().await;
    mount_csrf(&server, "csrf-1").await;
    for route in ["/api/a", "/api/b"] {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(error_body(401, EXPIRED))
            .expect(1)
            .mount(&server)
            .await;
    }
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh-token"))
        .respond_with(error_body(401, "Refresh token invalid").set_delay(Duration::from_millis(200)))
        .expect(1)
        .mount(&server)
        .await;

    let navigator = RecordingNavigator::default();
    let pipeline = Pipeline::builder(common::config(&server))
        .navigator(navigator.clone())
        .build()
        .unwrap();
    pipeline.credentials().set(Session::new("tok-1", None)).await;

    let (a, b) = tokio::join!(pipeline.get("/a").send(), pipeline.get("/b").send());

    let (Err(Error::RefreshFailed(ea)), Err(Error::RefreshFailed(eb))) = (a, b) else {
        panic!("both requests should fail with the refresh error");
    };
    assert!(Arc::ptr_eq(&ea, &eb));
    assert_eq!(ea.status(), Some(401));

    assert_eq!(navigator.redirects(), vec!["/login".to_string()]);
    assert!(!pipeline.credentials().is_authenticated().await);
    assert_eq!(pipeline.credentials().state().await, SessionState::Anonymous);
}

#[tokio::test]
async fn test_replay_is_not_refreshed_twice() {
    let server = MockServer::start().await;
    mount_csrf(&server, "csrf-1").await;
    Mock::given(method("GET"))
        .and(path("/api/reports"))
        .respond_with(error_body(401, EXPIRED))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh-token"))
        .respond_with(token_body("tok-2"))
        .expect(1)
        .mount(&server)
        .await;

    let pipeline = signed_in(&server, "tok-1").await;
    let err = pipeline.get("/reports").send().await.unwrap_err();
    assert!(err.is_token_expired(EXPIRED));
}

#[tokio::test]
async fn test_other_unauthorized_is_not_refreshed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/orders"))
        .respond_with(error_body(401, "Unauthorized"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh-token"))
        .respond_with(token_body("tok-2"))
        .expect(0)
        .mount(&server)
        .await;

    let pipeline = signed_in(&server, "tok-1").await;
    let err = pipeline.get("/orders").send().await.unwrap_err();
    assert!(err.requires_reauth());
    assert!(!err.is_token_expired(EXPIRED));
}

#[tokio::test]
async fn test_superseded_token_replays_without_refresh() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/orders"))
        .and(header("authorization", "Bearer tok-1"))
        .respond_with(error_body(401, EXPIRED).set_delay(Duration::from_millis(200)))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/orders"))
        .and(header("authorization", "Bearer tok-2"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh-token"))
        .respond_with(token_body("tok-3"))
        .expect(0)
        .mount(&server)
        .await;

    let pipeline = signed_in(&server, "tok-1").await;
    let in_flight = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { pipeline.get("/orders").send().await })
    };

    // Another caller refreshed while the request was in flight.
    tokio::time::sleep(Duration::from_millis(50)).await;
    pipeline.credentials().set(Session::new("tok-2", None)).await;

    let response = in_flight.await.unwrap().unwrap();
    assert_eq!(response.status().as_u16(), 200);
}

#[tokio::test]
async fn test_csrf_retry_drops_rejected_token_when_refetch_fails() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/auth/csrf-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "csrfToken": "csrf-1" })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/auth/csrf-token"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/orders"))
        .respond_with(error_body(403, "invalid csrf token"))
        .expect(2)
        .mount(&server)
        .await;

    let pipeline = signed_in(&server, "tok-1").await;
    let err = pipeline.post("/orders").send().await.unwrap_err();
    assert!(err.is_csrf_rejection());

    let seen = requests_to(&server, "/api/orders").await;
    assert_eq!(header_value(&seen[0], "x-csrf-token").as_deref(), Some("csrf-1"));
    assert!(header_value(&seen[1], "x-csrf-token").is_none());
}

// ============================================================================
// Errors
// ============================================================================

#[tokio::test]
async fn test_server_error_surfaces_message_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/stats"))
        .respond_with(error_body(500, "Database unavailable"))
        .mount(&server)
        .await;

    let pipeline = signed_in(&server, "tok-1").await;
    match pipeline.get("/stats").send().await.unwrap_err() {
        Error::Api {
            status,
            message,
            body,
        } => {
            assert_eq!(status, 500);
            assert_eq!(message.as_deref(), Some("Database unavailable"));
            assert!(body.contains("statusCode"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_query_parameters_are_sent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/products"))
        .and(wiremock::matchers::query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;

    let pipeline = signed_in(&server, "tok-1").await;
    let response = pipeline.get("/products").query("page", 2).send().await.unwrap();
    assert_eq!(response.text(), "[]");
}
