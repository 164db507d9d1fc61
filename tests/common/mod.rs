//! Shared helpers for the wiremock-backed integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use tollgate::{Config, Pipeline, Session};

pub const EXPIRED: &str = "Token expired";

/// Config pointing at the mock server's `/api` prefix.
pub fn config(server: &MockServer) -> Config {
    let mut config = Config::with_base_url(format!("{}/api", server.uri()));
    config.csrf.cookie_settle_ms = 0;
    config
}

pub fn pipeline(server: &MockServer) -> Pipeline {
    Pipeline::builder(config(server)).build().unwrap()
}

/// Pipeline that already holds `token`.
pub async fn signed_in(server: &MockServer, token: &str) -> Pipeline {
    let pipeline = pipeline(server);
    pipeline.credentials().set(Session::new(token, None)).await;
    pipeline
}

/// CSRF endpoint answering with `token` in the body.
pub async fn mount_csrf(server: &MockServer, token: &str) {
    Mock::given(method("GET"))
        .and(path("/api/auth/csrf-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "csrfToken": token })))
        .mount(server)
        .await;
}

/// JSON error body the way the API sends it.
pub fn error_body(status: u16, message: &str) -> ResponseTemplate {
    ResponseTemplate::new(status).set_body_json(json!({ "statusCode": status, "message": message }))
}

pub fn token_body(token: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "accessToken": token }))
}

/// Requests the server saw for `path`, in arrival order.
pub async fn requests_to(server: &MockServer, path: &str) -> Vec<Request> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.url.path() == path)
        .collect()
}

pub fn header_value(request: &Request, name: &str) -> Option<String> {
    request
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Navigator that records every redirect.
#[derive(Clone, Default)]
pub struct RecordingNavigator {
    pub routes: Arc<Mutex<Vec<String>>>,
}

impl RecordingNavigator {
    pub fn redirects(&self) -> Vec<String> {
        self.routes.lock().unwrap().clone()
    }
}

impl tollgate::Navigator for RecordingNavigator {
    fn redirect_to_login(&self, route: &str) {
        self.routes.lock().unwrap().push(route.to_string());
    }
}
