use std::fmt;

use log::warn;
use nonempty::NonEmpty;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter};
use tokio::time::Instant;

use crate::error::GenerationError;

/// An opaque bearer token. Never printed, never persisted.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl AsRef<str>) -> Result<Self, GenerationError> {
        let token = token.as_ref().trim();
        if token.is_empty() {
            return Err(GenerationError::Auth {
                detail: "no API key supplied".into(),
            });
        }
        if !token.starts_with("ms-") {
            warn!("API key does not look like a ModelScope token (expected an `ms-` prefix)");
        }
        Ok(Self(token.to_string()))
    }

    /// Value for the `Authorization` header.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// How the target size travels in the submission body.
#[derive(
    Debug,
    Clone,
    Copy,
    Display,
    clap::ValueEnum,
    Serialize,
    Deserialize,
    Hash,
    PartialEq,
    Eq,
    Default,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SizeEncoding {
    /// `"parameters": {"width": w, "height": h}`
    #[default]
    Pair,
    /// `"n": 1, "size": "WxH"`
    String,
}

impl SizeEncoding {
    pub fn other(self) -> Self {
        match self {
            Self::Pair => Self::String,
            Self::String => Self::Pair,
        }
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    Display,
    clap::ValueEnum,
    Serialize,
    Deserialize,
    Hash,
    PartialEq,
    Eq,
    EnumIter,
    Default,
)]
pub enum SizePreset {
    #[default]
    #[strum(to_string = "Square (1024x1024)")]
    Square,
    #[strum(to_string = "Landscape (1280x720)")]
    Landscape,
    #[strum(to_string = "Portrait (720x1280)")]
    Portrait,
}

impl SizePreset {
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            SizePreset::Square => (1024, 1024),
            SizePreset::Landscape => (1280, 720),
            SizePreset::Portrait => (720, 1280),
        }
    }
}

/// What to generate. Validated on construction, immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    prompt: String,
    model: String,
    width: u32,
    height: u32,
}

impl JobRequest {
    pub fn new(
        prompt: impl Into<String>,
        model: impl Into<String>,
        width: u32,
        height: u32,
    ) -> Result<Self, GenerationError> {
        let prompt = prompt.into();
        if prompt.trim().is_empty() {
            return Err(GenerationError::Validation {
                detail: "prompt must not be empty".into(),
            });
        }
        if width == 0 || height == 0 {
            return Err(GenerationError::Validation {
                detail: format!("image size must be positive, got {width}x{height}"),
            });
        }
        let model = model.into();
        if model.trim().is_empty() {
            return Err(GenerationError::Validation {
                detail: "model identifier must not be empty".into(),
            });
        }
        Ok(Self {
            prompt,
            model,
            width,
            height,
        })
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// The `"<w>x<h>"` form of the size.
    pub fn size_string(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

/// A job the remote accepted. Only meaningful to the poller that got it
/// from the matching submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub task_id: String,
    pub submitted_at: Instant,
    /// End of the post-submission grace interval; no poll goes out before it.
    pub not_before: Instant,
    /// Size encoding the remote accepted for this job.
    pub encoding: SizeEncoding,
}

#[derive(Debug, Clone, Copy, Display, PartialEq, Eq, Hash)]
pub enum TransientReason {
    /// The job index has not caught up with the submission yet.
    NotYetIndexed,
    /// 404, 408, 429 or 5xx while polling, or an unreadable 2xx body.
    ServerTransient,
    /// Timeout, reset or refused connection.
    NetworkFlap,
}

/// Terminal failure as reported by one poll.
#[derive(Debug, Clone, PartialEq)]
pub enum JobFailure {
    Auth { detail: String },
    Validation { detail: String },
    Remote { detail: serde_json::Value },
}

impl From<JobFailure> for GenerationError {
    fn from(f: JobFailure) -> Self {
        match f {
            JobFailure::Auth { detail } => GenerationError::Auth { detail },
            JobFailure::Validation { detail } => GenerationError::Validation { detail },
            JobFailure::Remote { detail } => GenerationError::RemoteFailed { detail },
        }
    }
}

/// The classified result of a single poll.
#[derive(Debug, Clone, PartialEq)]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded { image_urls: NonEmpty<String> },
    Failed(JobFailure),
    TransientUnknown { reason: TransientReason },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded { .. } | JobStatus::Failed(_))
    }

    pub fn classification(&self) -> Classification {
        match self {
            JobStatus::Pending => Classification::Pending,
            JobStatus::Running => Classification::Running,
            JobStatus::Succeeded { .. } => Classification::Succeeded,
            JobStatus::Failed(_) => Classification::Failed,
            JobStatus::TransientUnknown { reason } => Classification::Transient(*reason),
        }
    }
}

/// Payload-free summary of a [`JobStatus`], used for progress reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Classification {
    Pending,
    Running,
    Succeeded,
    Failed,
    Transient(TransientReason),
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Classification::Pending => f.write_str("Pending"),
            Classification::Running => f.write_str("Running"),
            Classification::Succeeded => f.write_str("Succeeded"),
            Classification::Failed => f.write_str("Failed"),
            Classification::Transient(reason) => write!(f, "TransientUnknown({reason})"),
        }
    }
}
