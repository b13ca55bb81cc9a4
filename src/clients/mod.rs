//! Adapters that implement the external capabilities.
//!
//! - [`HttpGenerator`]: generation service over HTTP
//! - [`WebhookPublisher`]: publishing endpoint over HTTP
//! - [`HttpFeedbackSink`]: quality feedback endpoint over HTTP
//! - [`DryRunPublisher`]: logs instead of posting
//! - [`SignalFileDetector`]: reads signals produced by the vision process
//!
//! HTTP responses are classified into the shared [`CallError`] taxonomy so
//! the retry policy treats every call site the same way.

mod dry_run;
mod http;
mod signal_file;

pub use dry_run::DryRunPublisher;
pub use http::{HttpFeedbackSink, HttpGenerator, HttpSettings, WebhookPublisher};
pub use signal_file::SignalFileDetector;

use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;

use crate::error::CallError;

/// Maximum length of a response body quoted in an error message.
const ERROR_BODY_LIMIT: usize = 200;

/// Maps a non-success HTTP response to a [`CallError`].
///
/// 429 is a rate limit unless `quota_marker` appears in the body, in which
/// case it is a remote quota signal. 408 and 5xx are transient, every other
/// status is permanent.
pub fn classify_status(
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
    quota_marker: Option<&str>,
) -> CallError {
    let message = format!(
        "HTTP {}: {}",
        status.as_u16(),
        crate::utils::truncate_chars(body.trim(), ERROR_BODY_LIMIT)
    );

    if status == StatusCode::TOO_MANY_REQUESTS {
        let is_quota = quota_marker
            .map(|marker| body.to_lowercase().contains(&marker.to_lowercase()))
            .unwrap_or(false);
        if is_quota {
            return CallError::QuotaExceeded(message);
        }
        return CallError::RateLimited {
            message,
            retry_after: retry_after(headers),
        };
    }

    if status == StatusCode::REQUEST_TIMEOUT || status.is_server_error() {
        return CallError::Transient(message);
    }

    CallError::Permanent(message)
}

/// Parses a `Retry-After` header given in seconds.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Maps a transport-level failure to a [`CallError`].
fn classify_transport(error: reqwest::Error) -> CallError {
    if error.is_builder() {
        return CallError::Permanent(format!("invalid request: {}", error));
    }
    CallError::Transient(error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_server_errors_are_transient() {
        let headers = HeaderMap::new();
        for code in [500u16, 502, 503, 504, 408] {
            let status = StatusCode::from_u16(code).unwrap();
            assert!(classify_status(status, &headers, "", None).is_transient());
        }
    }

    #[test]
    fn test_client_errors_are_permanent() {
        let headers = HeaderMap::new();
        for code in [400u16, 401, 403, 404, 422] {
            let status = StatusCode::from_u16(code).unwrap();
            let err = classify_status(status, &headers, "bad prompt", None);
            assert!(matches!(err, CallError::Permanent(_)));
            assert!(err.to_string().contains("bad prompt"));
        }
    }

    #[test]
    fn test_rate_limit_honours_retry_after() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("12"));
        let err = classify_status(StatusCode::TOO_MANY_REQUESTS, &headers, "slow down", None);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(12)));
        assert!(err.is_transient());
    }

    #[test]
    fn test_quota_marker_becomes_quota_exceeded() {
        let headers = HeaderMap::new();
        let err = classify_status(
            StatusCode::TOO_MANY_REQUESTS,
            &headers,
            r#"{"detail":"Daily Quota exhausted"}"#,
            Some("quota"),
        );
        assert!(matches!(err, CallError::QuotaExceeded(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn test_unparseable_retry_after_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2026 07:28:00 GMT"));
        let err = classify_status(StatusCode::TOO_MANY_REQUESTS, &headers, "", None);
        assert_eq!(err.retry_after(), None);
    }
}
