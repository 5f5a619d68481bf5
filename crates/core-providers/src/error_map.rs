use resume_core_types::{CoreError, ErrorKind};

/// §4.2: normalizes upstream errors into one of the façade's fixed set.
/// Classification is by HTTP status first, then by sniffing the body the
/// same way the rest of this codebase classifies ad-hoc upstream text.
pub fn classify_http_error(status: reqwest::StatusCode, body: &str) -> CoreError {
    let lower = body.to_lowercase();
    let kind = if status.as_u16() == 429 || lower.contains("rate limit") || lower.contains("too many requests")
    {
        ErrorKind::RateLimited
    } else if lower.contains("context_length_exceeded")
        || lower.contains("maximum context length")
        || lower.contains("context length")
    {
        ErrorKind::ContextLengthExceeded
    } else if status.as_u16() == 401 || status.as_u16() == 403 || lower.contains("invalid api key") {
        ErrorKind::Auth
    } else if status.is_server_error() {
        ErrorKind::Upstream5xx
    } else if status.as_u16() == 400 || status.as_u16() == 404 {
        ErrorKind::BadRequest
    } else {
        ErrorKind::Network
    };

    CoreError::new(kind, format!("provider request failed with status {status}"))
        .with_detail(body.to_string())
}

pub fn classify_transport_error(err: &reqwest::Error) -> CoreError {
    let kind = if err.is_timeout() {
        ErrorKind::Timeout
    } else if err.is_connect() || err.is_request() {
        ErrorKind::Network
    } else {
        ErrorKind::Network
    };
    CoreError::new(kind, "provider transport error").with_detail(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn rate_limit_status_classifies_transient() {
        let err = classify_http_error(StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert_eq!(err.kind, ErrorKind::RateLimited);
    }

    #[test]
    fn server_error_classifies_upstream_5xx() {
        let err = classify_http_error(StatusCode::BAD_GATEWAY, "{}");
        assert_eq!(err.kind, ErrorKind::Upstream5xx);
    }

    #[test]
    fn context_length_message_overrides_status() {
        let err = classify_http_error(
            StatusCode::BAD_REQUEST,
            "This model's maximum context length is 8192 tokens",
        );
        assert_eq!(err.kind, ErrorKind::ContextLengthExceeded);
    }

    #[test]
    fn unauthorized_classifies_auth() {
        let err = classify_http_error(StatusCode::UNAUTHORIZED, "invalid api key provided");
        assert_eq!(err.kind, ErrorKind::Auth);
    }
}
