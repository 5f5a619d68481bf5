use serde::{Serialize, Serializer};
use uuid::Uuid;

/// Retry policy bucket. The Orchestrator's retry decision is a pure function
/// of this value — nothing downstream inspects `ErrorKind` directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Transient,
    Recoverable,
    Permanent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    RateLimited,
    ContextLengthExceeded,
    Upstream5xx,
    Network,
    Auth,
    BadRequest,
    Timeout,
    AgentParse,
    ValidatorScoreMissing,
    QuotaExceeded,
    JobFetchFailed,
    RendererSyntax,
    SlowConsumer,
    Internal,
}

impl ErrorKind {
    pub fn category(self) -> ErrorCategory {
        use ErrorCategory::*;
        use ErrorKind::*;
        match self {
            Network | Upstream5xx | Timeout | RateLimited => Transient,
            AgentParse | ContextLengthExceeded | ValidatorScoreMissing => Recoverable,
            Auth | BadRequest | QuotaExceeded | JobFetchFailed | RendererSyntax => Permanent,
            SlowConsumer | Internal => Permanent,
        }
    }
}

/// The one error type every fallible operation in the core returns.
///
/// `Serialize` emits only the client-safe shape; the raw detail (which may
/// contain upstream response bodies) is never part of that output.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct CoreError {
    pub error_id: Uuid,
    pub kind: ErrorKind,
    pub message: String,
    pub run_id: Option<Uuid>,
    pub detail: Option<String>,
}

impl CoreError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error_id: Uuid::new_v4(),
            kind,
            message: message.into(),
            run_id: None,
            detail: None,
        }
    }

    pub fn with_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn category(&self) -> ErrorCategory {
        self.kind.category()
    }
}

impl Serialize for CoreError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("CoreError", 4)?;
        s.serialize_field("error_id", &self.error_id)?;
        s.serialize_field("category", &self.kind.category())?;
        s.serialize_field("type", &self.kind)?;
        s.serialize_field("message", &self.message)?;
        s.end()
    }
}

impl From<CoreError> for ErrorRecord {
    fn from(err: CoreError) -> Self {
        ErrorRecord {
            error_id: err.error_id,
            category: err.kind.category(),
            kind: err.kind,
            message: err.message,
            stacktrace: err.detail.unwrap_or_default(),
            run_id: err.run_id,
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::new(ErrorKind::Internal, "local storage error").with_detail(err.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::new(ErrorKind::AgentParse, "failed to parse structured output")
            .with_detail(err.to_string())
    }
}

/// Durable record of an error, kept in full (unsanitized) detail server-side;
/// never serialized to a client directly — `CoreError`'s own `Serialize`
/// impl is what crosses the wire.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub error_id: Uuid,
    pub category: ErrorCategory,
    pub kind: ErrorKind,
    pub message: String,
    pub stacktrace: String,
    pub run_id: Option<Uuid>,
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// What the Orchestrator does in response to a failed agent attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryInPlace,
    RetryWithFallbackModel,
    Fail,
}

/// Pure function of the error category: the Orchestrator never branches on
/// anything else to decide whether to retry.
pub fn retry_policy(category: ErrorCategory) -> RetryDecision {
    match category {
        ErrorCategory::Transient => RetryDecision::RetryInPlace,
        ErrorCategory::Recoverable => RetryDecision::RetryWithFallbackModel,
        ErrorCategory::Permanent => RetryDecision::Fail,
    }
}

/// Scrubs PII from a message before it is stored or emitted to a client.
/// Mirrors the taxonomy in the spec: emails, phone numbers, IP literals and
/// absolute paths carrying a username.
pub fn sanitize_message(input: &str) -> String {
    use regex::Regex;

    let email_re = Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap();
    let path_re =
        Regex::new(r"(?:/home/|/Users/|C:\\Users\\)[^\s/\\]+[/\\]?[^\s]*").unwrap();
    let ipv4_re = Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").unwrap();
    let phone_re = Regex::new(r"\+?\d[\d\-. ]{7,}\d").unwrap();

    let mut out = email_re.replace_all(input, "[redacted-email]").to_string();
    out = path_re.replace_all(&out, "[redacted-path]").to_string();
    out = ipv4_re.replace_all(&out, "[redacted-ip]").to_string();
    out = phone_re.replace_all(&out, "[redacted-phone]").to_string();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_is_transient_and_retries_in_place() {
        assert_eq!(ErrorKind::RateLimited.category(), ErrorCategory::Transient);
        assert_eq!(
            retry_policy(ErrorCategory::Transient),
            RetryDecision::RetryInPlace
        );
    }

    #[test]
    fn agent_parse_is_recoverable_with_fallback_model() {
        assert_eq!(ErrorKind::AgentParse.category(), ErrorCategory::Recoverable);
        assert_eq!(
            retry_policy(ErrorCategory::Recoverable),
            RetryDecision::RetryWithFallbackModel
        );
    }

    #[test]
    fn quota_exceeded_is_permanent_and_never_retries() {
        assert_eq!(ErrorKind::QuotaExceeded.category(), ErrorCategory::Permanent);
        assert_eq!(retry_policy(ErrorCategory::Permanent), RetryDecision::Fail);
    }

    #[test]
    fn serialize_never_leaks_detail() {
        let err = CoreError::new(ErrorKind::Auth, "invalid api key")
            .with_detail("Bearer sk-super-secret-raw-key");
        let value = serde_json::to_value(&err).unwrap();
        let rendered = value.to_string();
        assert!(!rendered.contains("sk-super-secret-raw-key"));
        assert_eq!(value["type"], "AUTH");
        assert_eq!(value["category"], "permanent");
    }

    #[test]
    fn sanitize_message_redacts_email_and_path() {
        let redacted = sanitize_message("contact jane.doe@example.com or see /home/jane/out.log");
        assert!(!redacted.contains("jane.doe@example.com"));
        assert!(!redacted.contains("/home/jane"));
    }
}
