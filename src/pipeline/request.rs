//! Request descriptors, typed recovery metadata and buffered responses.

use std::collections::HashSet;

use bytes::Bytes;
use reqwest::Method;
use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::error::{Error, Result};

/// A recovery the pipeline may apply to a failed response, at most once per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoveryPolicy {
    /// Force a new CSRF token and replay.
    CsrfRetry,
    /// Refresh the access token and replay.
    AuthRefresh,
}

/// Metadata that travels with a request through every replay.
#[derive(Debug, Clone)]
pub struct RequestContext {
    skip_csrf: bool,
    applied: HashSet<RecoveryPolicy>,
    attempts: u32,
    bearer: Option<String>,
    request_id: Uuid,
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            skip_csrf: false,
            applied: HashSet::new(),
            attempts: 0,
            bearer: None,
            request_id: Uuid::new_v4(),
        }
    }

    /// Whether the CSRF header is left off even for mutating verbs.
    pub fn skips_csrf(&self) -> bool {
        self.skip_csrf
    }

    pub(crate) fn set_skip_csrf(&mut self, skip: bool) {
        self.skip_csrf = skip;
    }

    pub fn has_applied(&self, policy: RecoveryPolicy) -> bool {
        self.applied.contains(&policy)
    }

    /// Record `policy` as used. Returns false if it already was.
    pub(crate) fn mark_applied(&mut self, policy: RecoveryPolicy) -> bool {
        self.applied.insert(policy)
    }

    /// Number of times the request has been sent.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Access token the latest attempt carried.
    pub fn bearer(&self) -> Option<&str> {
        self.bearer.as_deref()
    }

    pub(crate) fn record_attempt(&mut self, bearer: Option<String>) {
        self.attempts += 1;
        self.bearer = bearer;
    }

    /// Correlation id sent as `X-Request-Id` on every attempt.
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything needed to send (and re-send) one API call.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    /// Path relative to the configured base URL.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub context: RequestContext,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: None,
            context: RequestContext::new(),
        }
    }

    /// POST, PUT, PATCH and DELETE change server state and need a CSRF token.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self.method,
            Method::POST | Method::PUT | Method::PATCH | Method::DELETE
        )
    }
}

/// A fully buffered response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl ApiResponse {
    pub(crate) fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Body as (lossy) UTF-8 text.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Deserialize the JSON body.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// The error a caller sees for this response when it is not recovered.
    pub(crate) fn into_error(self) -> Error {
        Error::api(self.status.as_u16(), self.text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutating_verbs() {
        assert!(ApiRequest::new(Method::POST, "/products").is_mutating());
        assert!(ApiRequest::new(Method::PUT, "/products/1").is_mutating());
        assert!(ApiRequest::new(Method::PATCH, "/products/1").is_mutating());
        assert!(ApiRequest::new(Method::DELETE, "/products/1").is_mutating());
        assert!(!ApiRequest::new(Method::GET, "/products").is_mutating());
        assert!(!ApiRequest::new(Method::HEAD, "/products").is_mutating());
    }

    #[test]
    fn test_policies_apply_once() {
        let mut ctx = RequestContext::new();
        assert!(!ctx.has_applied(RecoveryPolicy::CsrfRetry));
        assert!(ctx.mark_applied(RecoveryPolicy::CsrfRetry));
        assert!(!ctx.mark_applied(RecoveryPolicy::CsrfRetry));
        assert!(!ctx.has_applied(RecoveryPolicy::AuthRefresh));
    }

    #[test]
    fn test_context_survives_clone() {
        let mut ctx = RequestContext::new();
        ctx.record_attempt(Some("tok-1".into()));
        ctx.mark_applied(RecoveryPolicy::AuthRefresh);

        let replay = ctx.clone();
        assert_eq!(replay.request_id(), ctx.request_id());
        assert_eq!(replay.attempts(), 1);
        assert_eq!(replay.bearer(), Some("tok-1"));
        assert!(replay.has_applied(RecoveryPolicy::AuthRefresh));
    }

    #[test]
    fn test_response_into_error_keeps_status_and_body() {
        let response = ApiResponse::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            HeaderMap::new(),
            Bytes::from_static(br#"{"message":"price must be positive"}"#),
        );
        match response.into_error() {
            Error::Api {
                status,
                message,
                body,
            } => {
                assert_eq!(status, 422);
                assert_eq!(message.as_deref(), Some("price must be positive"));
                assert!(body.contains("price must be positive"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
