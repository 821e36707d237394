use std::time::Duration;

use log::{info, warn};

use crate::model::{Classification, TransientReason};

/// What happened, as far as a progress display cares.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressKind {
    SubmitAttempt,
    SubmitRetry { reason: String },
    SizeEncodingFallback,
    Submitted { task_id: String },
    CompletedSynchronously,
    Polled(Classification),
    Resubmitting { abandoned_task_id: String },
    Downloading,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub elapsed: Duration,
    /// Submission attempt or poll count, depending on the kind.
    pub attempt: u32,
    pub kind: ProgressKind,
}

/// Receives advisory progress. Must not block; nothing it does feeds back
/// into the generation.
pub trait ProgressSink: Send + Sync {
    fn report(&self, event: &ProgressEvent);
}

/// Forwards progress to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ProgressSink for LogSink {
    fn report(&self, event: &ProgressEvent) {
        let secs = event.elapsed.as_secs_f64();
        match &event.kind {
            ProgressKind::Polled(Classification::Transient(reason)) => warn!(
                "[{secs:.1}s] poll #{} absorbed transient: {}",
                event.attempt,
                describe(*reason)
            ),
            ProgressKind::Polled(c) => info!("[{secs:.1}s] poll #{}: {c}", event.attempt),
            ProgressKind::SubmitRetry { reason } => warn!(
                "[{secs:.1}s] submission attempt {} failed, retrying: {reason}",
                event.attempt
            ),
            other => info!("[{secs:.1}s] {other:?} (attempt {})", event.attempt),
        }
    }
}

fn describe(reason: TransientReason) -> &'static str {
    match reason {
        TransientReason::NotYetIndexed => "job not indexed yet",
        TransientReason::ServerTransient => "server hiccup",
        TransientReason::NetworkFlap => "network flap",
    }
}
