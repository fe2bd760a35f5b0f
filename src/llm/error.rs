//! Typed errors for LLM operations
//!
//! Classifies remote failures so the retry pipeline can decide without string
//! matching whether another attempt can help:
//! - transient: `RateLimited` (429), `ServiceError` (5xx), `Network`, `Timeout`
//! - fatal: `Unauthorized` (401), `Forbidden` (403), `BadRequest` (400/404/413/422),
//!   `ContentPolicy`

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum LlmError {
    /// Credential missing, expired or invalid (HTTP 401)
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Credential valid but not allowed to use this resource (HTTP 403)
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Rate limit exceeded (HTTP 429)
    ///
    /// `retry_after` carries the server's wait hint when one was sent.
    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Malformed request; retrying the same payload cannot succeed
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// The request or its output was refused on content-policy grounds
    #[error("Content policy rejection: {0}")]
    ContentPolicy(String),

    /// Server-side error (HTTP 5xx, overloaded)
    #[error("Service error: {0}")]
    ServiceError(String),

    /// Connection refused, reset, DNS failure, ...
    #[error("Network error: {0}")]
    Network(String),

    /// The per-attempt deadline elapsed before a response arrived
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
}

impl LlmError {
    /// Check if another attempt may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimited { .. }
                | LlmError::ServiceError(_)
                | LlmError::Network(_)
                | LlmError::Timeout(_)
        )
    }

    /// Check if this error indicates a rate limit that requires waiting
    pub fn needs_rate_limit_wait(&self) -> bool {
        matches!(self, LlmError::RateLimited { .. })
    }

    /// Server-provided minimum wait before the next attempt
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            LlmError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Convert HTTP status code, error body and `retry-after` header into a typed error
    pub fn from_http_status(
        status: reqwest::StatusCode,
        error_text: String,
        retry_after: Option<Duration>,
    ) -> Self {
        match status.as_u16() {
            401 => LlmError::Unauthorized(error_text),
            403 => LlmError::Forbidden(error_text),
            429 => LlmError::RateLimited {
                message: error_text,
                retry_after,
            },
            408 | 409 | 425 => LlmError::ServiceError(format!("HTTP {}: {}", status, error_text)),
            400 if is_content_policy(&error_text) => LlmError::ContentPolicy(error_text),
            400..=499 => LlmError::BadRequest(format!("HTTP {}: {}", status, error_text)),
            _ => LlmError::ServiceError(format!("HTTP {}: {}", status, error_text)),
        }
    }

    /// Convert network/connection errors into typed LlmError
    pub fn from_network_error(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            LlmError::Network(format!("Request timeout: {}", e))
        } else if e.is_connect() {
            LlmError::Network(format!("Connection failed: {}", e))
        } else if let Some(status) = e.status() {
            Self::from_http_status(status, e.to_string(), None)
        } else if e.is_decode() {
            LlmError::ServiceError(format!("Unreadable response: {}", e))
        } else {
            LlmError::Network(e.to_string())
        }
    }
}

/// Parse a `retry-after` header value given in delta-seconds
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let secs: f64 = value.trim().parse().ok()?;
    if secs.is_finite() && secs >= 0.0 {
        Some(Duration::from_secs_f64(secs))
    } else {
        None
    }
}

fn is_content_policy(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("content policy")
        || lower.contains("content_policy")
        || lower.contains("usage policy")
        || lower.contains("safety system")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_failures_are_fatal() {
        assert!(!LlmError::Unauthorized("token expired".into()).is_retryable());
        assert!(!LlmError::Forbidden("no access".into()).is_retryable());
    }

    #[test]
    fn test_rate_limited_is_retryable() {
        let err = LlmError::RateLimited {
            message: "quota exceeded".into(),
            retry_after: Some(Duration::from_secs(3)),
        };
        assert!(err.is_retryable());
        assert!(err.needs_rate_limit_wait());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_bad_request_not_retryable() {
        let err = LlmError::BadRequest("invalid parameter".to_string());
        assert!(!err.is_retryable());
        assert_eq!(err.retry_after(), None);
    }

    #[test]
    fn test_from_http_status() {
        use reqwest::StatusCode;

        let err = LlmError::from_http_status(StatusCode::UNAUTHORIZED, "Invalid token".into(), None);
        assert!(matches!(err, LlmError::Unauthorized(_)));

        let err = LlmError::from_http_status(
            StatusCode::TOO_MANY_REQUESTS,
            "Rate limit exceeded".into(),
            Some(Duration::from_secs(2)),
        );
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));

        let err = LlmError::from_http_status(StatusCode::BAD_REQUEST, "Bad request".into(), None);
        assert!(matches!(err, LlmError::BadRequest(_)));

        let err = LlmError::from_http_status(
            StatusCode::BAD_REQUEST,
            "Output blocked by content policy".into(),
            None,
        );
        assert!(matches!(err, LlmError::ContentPolicy(_)));

        let err = LlmError::from_http_status(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Server error".into(),
            None,
        );
        assert!(matches!(err, LlmError::ServiceError(_)));

        let err = LlmError::from_http_status(
            StatusCode::from_u16(529).unwrap(),
            "Overloaded".into(),
            None,
        );
        assert!(err.is_retryable());
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after("5"), Some(Duration::from_secs(5)));
        assert_eq!(parse_retry_after(" 1.5 "), Some(Duration::from_millis(1500)));
        assert_eq!(parse_retry_after("-1"), None);
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[test]
    fn test_error_display() {
        let err = LlmError::Unauthorized("token expired".to_string());
        assert_eq!(err.to_string(), "Unauthorized: token expired");

        let err = LlmError::Timeout(Duration::from_secs(30));
        assert_eq!(err.to_string(), "Request timed out after 30s");
    }
}
