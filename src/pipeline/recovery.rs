//! Classification of failed responses into recovery actions.

use serde_json::Value;

use crate::pipeline::request::{RecoveryPolicy, RequestContext};

/// What the pipeline should do with a non-success response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Hand the failure to the caller.
    Propagate,
    /// Force a new CSRF token and replay once.
    CsrfRetry,
    /// Refresh the access token (or wait for the running refresh) and replay once.
    AuthRefresh,
}

/// The `message` field of a JSON error body.
///
/// Validation errors that carry a list of messages are joined with `", "`.
pub fn body_message(body: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    match value.get("message")? {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => {
            let parts: Vec<&str> = items.iter().filter_map(Value::as_str).collect();
            (!parts.is_empty()).then(|| parts.join(", "))
        }
        _ => None,
    }
}

/// 403/419 whose message mentions the CSRF token.
pub fn is_csrf_rejection(status: u16, message: Option<&str>) -> bool {
    if status != 403 && status != 419 {
        return false;
    }
    message.is_some_and(|m| {
        let m = m.to_ascii_lowercase();
        m.contains("csrf") || m.contains("token")
    })
}

/// 401 whose message is exactly the configured expiry indicator.
pub fn is_token_expiry(status: u16, message: Option<&str>, expiry_message: &str) -> bool {
    status == 401 && message == Some(expiry_message)
}

/// Decide the recovery for a failed response given what was already tried.
pub fn classify(
    status: u16,
    message: Option<&str>,
    context: &RequestContext,
    expiry_message: &str,
) -> Recovery {
    if is_csrf_rejection(status, message) && !context.has_applied(RecoveryPolicy::CsrfRetry) {
        return Recovery::CsrfRetry;
    }
    if is_token_expiry(status, message, expiry_message)
        && !context.has_applied(RecoveryPolicy::AuthRefresh)
    {
        return Recovery::AuthRefresh;
    }
    Recovery::Propagate
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPIRED: &str = "Token expired";

    #[test]
    fn test_body_message_variants() {
        assert_eq!(
            body_message(br#"{"message":"Token expired"}"#).as_deref(),
            Some("Token expired")
        );
        assert_eq!(
            body_message(br#"{"message":["name is required","price must be positive"]}"#)
                .as_deref(),
            Some("name is required, price must be positive")
        );
        assert!(body_message(b"<html>502</html>").is_none());
        assert!(body_message(br#"{"error":"x"}"#).is_none());
    }

    #[test]
    fn test_csrf_rejection_matching() {
        assert!(is_csrf_rejection(403, Some("invalid csrf token")));
        assert!(is_csrf_rejection(419, Some("CSRF mismatch")));
        assert!(is_csrf_rejection(403, Some("Token missing")));
        assert!(!is_csrf_rejection(403, Some("Forbidden resource")));
        assert!(!is_csrf_rejection(403, None));
        assert!(!is_csrf_rejection(400, Some("csrf")));
    }

    #[test]
    fn test_expiry_requires_exact_message() {
        assert!(is_token_expiry(401, Some(EXPIRED), EXPIRED));
        assert!(!is_token_expiry(401, Some("token expired"), EXPIRED));
        assert!(!is_token_expiry(401, Some("Unauthorized"), EXPIRED));
        assert!(!is_token_expiry(403, Some(EXPIRED), EXPIRED));
    }

    #[test]
    fn test_classify_respects_applied_policies() {
        let mut ctx = RequestContext::new();
        assert_eq!(
            classify(403, Some("bad csrf"), &ctx, EXPIRED),
            Recovery::CsrfRetry
        );
        assert_eq!(
            classify(401, Some(EXPIRED), &ctx, EXPIRED),
            Recovery::AuthRefresh
        );

        ctx.mark_applied(RecoveryPolicy::CsrfRetry);
        ctx.mark_applied(RecoveryPolicy::AuthRefresh);
        assert_eq!(
            classify(403, Some("bad csrf"), &ctx, EXPIRED),
            Recovery::Propagate
        );
        assert_eq!(
            classify(401, Some(EXPIRED), &ctx, EXPIRED),
            Recovery::Propagate
        );
        assert_eq!(classify(500, None, &RequestContext::new(), EXPIRED), Recovery::Propagate);
    }
}
