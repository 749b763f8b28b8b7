use thiserror::Error;

/// Failures talking to the conversational backend.
///
/// These never reach the HTTP layer: the relay turns each one into a
/// user-facing apology and logs the detail.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("backend timed out")]
    Timeout,
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            BackendError::Timeout
        } else if e.is_decode() {
            BackendError::Rejected {
                status: e.status().map(|s| s.as_u16()).unwrap_or(200),
                message: format!("undecodable response: {}", e),
            }
        } else {
            BackendError::Unavailable(e.to_string())
        }
    }
}

/// Why an inbound request failed authentication.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing request timestamp header")]
    MissingTimestamp,

    #[error("missing signature header")]
    MissingSignature,

    #[error("request timestamp is not an integer")]
    InvalidTimestamp,

    #[error("request timestamp outside the allowed window ({age}s)")]
    Stale { age: i64 },

    #[error("signature header is malformed")]
    Malformed,

    #[error("signature mismatch")]
    Mismatch,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),
}
