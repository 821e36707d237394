use thiserror::Error;

/// Everything a generation call can end with, other than an image.
///
/// Transient classes (5xx, 404 while polling, network flaps, sentinel
/// payloads) never show up here unless the overall deadline runs out.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Authentication rejected: {detail}")]
    Auth { detail: String },

    #[error("Request rejected by validation: {detail}")]
    Validation { detail: String },

    #[error("Submission timed out after {attempts} attempt(s)")]
    SubmissionTimeout { attempts: u32 },

    #[error("Submission rejected after {attempts} attempt(s): {detail}")]
    SubmissionRejected { attempts: u32, detail: String },

    #[error("No terminal job status within {elapsed_secs:.1}s ({polls} poll(s))")]
    PollingDeadlineExceeded { elapsed_secs: f64, polls: u32 },

    #[error("Remote job failed: {}", summarize_detail(.detail))]
    RemoteFailed { detail: serde_json::Value },

    #[error("Image download failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Generation cancelled")]
    Cancelled,

    #[error("Network error: {0}")]
    Network(String),
}

impl GenerationError {
    /// Whether this outcome came from the caller rather than the remote.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Picks the human readable part out of an opaque failure payload.
pub(crate) fn summarize_detail(detail: &serde_json::Value) -> String {
    for key in ["detail", "message", "errors", "error", "msg"] {
        match detail.get(key) {
            Some(serde_json::Value::String(s)) => return s.clone(),
            Some(serde_json::Value::Null) | None => {}
            Some(other) => return other.to_string(),
        }
    }
    match detail {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("download timed out")]
    Timeout,

    #[error("image host answered with HTTP {status}")]
    Http { status: u16 },

    #[error("image host unreachable: {0}")]
    Network(String),

    #[error("undecodable image data: {0}")]
    Decode(#[from] image::ImageError),

    #[error("PNG re-encoding failed: {0}")]
    Encode(String),
}

/// Failures below the HTTP status line.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("transport error: {0}")]
    Other(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        // reqwest puts the URL into its Display impl; we only ever send the
        // token in headers, so the message is safe to keep.
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_connect() {
            Self::Connect(e.to_string())
        } else {
            Self::Other(e.to_string())
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum OptionsError {
    #[error("{field} must be within {min}..={max}, got {value}")]
    OutOfRange {
        field: &'static str,
        min: f64,
        max: f64,
        value: f64,
    },

    #[error("base url is not usable: {0}")]
    BaseUrl(String),
}

impl From<OptionsError> for GenerationError {
    fn from(e: OptionsError) -> Self {
        GenerationError::Validation {
            detail: e.to_string(),
        }
    }
}
