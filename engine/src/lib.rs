//! Client for text-to-image jobs on the ModelScope inference API.
//!
//! A generation call runs three stages in order: the [`submitter`] creates
//! the job, the [`poller`] waits for it to reach a terminal state while
//! absorbing the remote's eventual-consistency hiccups, and the [`fetcher`]
//! downloads the result.

pub mod api;
pub mod budget;
pub mod error;
pub mod fetcher;
pub mod generator;
pub mod model;
pub mod options;
pub mod poller;
pub mod progress;
pub mod submitter;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use error::{FetchError, GenerationError, OptionsError, TransportError};
pub use fetcher::ImageArtifact;
pub use generator::{ImageGenerator, generate};
pub use model::{Credential, JobRequest, JobStatus, SizeEncoding, SizePreset, TransientReason};
pub use options::GenerateOptions;
pub use progress::{LogSink, ProgressEvent, ProgressKind, ProgressSink};
pub use tokio_util::sync::CancellationToken;
