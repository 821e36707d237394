use log::{debug, info, warn};
use nonempty::NonEmpty;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    api::{self, SubmitBody, SubmitResponse},
    budget::{Interrupt, RetryBudget},
    error::{GenerationError, TransportError},
    model::{Credential, JobHandle, JobRequest, SizeEncoding},
    options::Settings,
    progress::{ProgressEvent, ProgressKind, ProgressSink},
    transport::{HttpRequest, HttpResponse, Transport},
};

/// Result of a successful submission.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// Accepted for asynchronous processing; poll the handle.
    Queued(JobHandle),
    /// The remote answered with finished images right away.
    Completed(NonEmpty<String>),
}

/// What went wrong with a submission attempt that is worth repeating.
#[derive(Debug)]
enum RetryableFailure {
    Http { status: u16, body: String },
    Transport(TransportError),
}

impl RetryableFailure {
    fn describe(&self) -> String {
        match self {
            RetryableFailure::Http { status, body } => format!("HTTP {status}: {body}"),
            RetryableFailure::Transport(e) => e.to_string(),
        }
    }
}

enum AttemptOutcome {
    Accepted(Submission),
    Retry(RetryableFailure),
    SwitchEncoding,
}

pub struct Submitter<'a> {
    transport: &'a dyn Transport,
    settings: &'a Settings,
    sink: &'a dyn ProgressSink,
}

impl<'a> Submitter<'a> {
    pub fn new(
        transport: &'a dyn Transport,
        settings: &'a Settings,
        sink: &'a dyn ProgressSink,
    ) -> Self {
        Self {
            transport,
            settings,
            sink,
        }
    }

    /// Creates the job, retrying 408/429/5xx and network failures up to the
    /// budget's submission count. Auth and validation rejections end it at
    /// once.
    pub async fn submit(
        &self,
        credential: &Credential,
        request: &JobRequest,
        budget: &mut RetryBudget,
        cancel: &CancellationToken,
    ) -> Result<Submission, GenerationError> {
        self.submit_as(self.settings.size_encoding, credential, request, budget, cancel)
            .await
    }

    /// Submits the same job again, starting from the size encoding the remote
    /// accepted for `previous`.
    pub async fn resubmit(
        &self,
        previous: &JobHandle,
        credential: &Credential,
        request: &JobRequest,
        budget: &mut RetryBudget,
        cancel: &CancellationToken,
    ) -> Result<Submission, GenerationError> {
        self.submit_as(previous.encoding, credential, request, budget, cancel)
            .await
    }

    async fn submit_as(
        &self,
        mut encoding: SizeEncoding,
        credential: &Credential,
        request: &JobRequest,
        budget: &mut RetryBudget,
        cancel: &CancellationToken,
    ) -> Result<Submission, GenerationError> {
        let mut fallback_used = false;
        let mut last_failure = None;

        loop {
            if !budget.take_submission_attempt() {
                return Err(exhausted(last_failure, budget.submissions_used()));
            }
            let attempt = budget.submissions_used();

            if last_failure.is_some() {
                budget
                    .sleep(cancel, self.settings.submission_backoff)
                    .await
                    .map_err(|i| interrupted(i, attempt - 1))?;
            }

            self.report(budget, attempt, ProgressKind::SubmitAttempt);
            match self
                .attempt(credential, request, encoding, fallback_used, budget, cancel)
                .await?
            {
                AttemptOutcome::Accepted(submission) => {
                    let kind = match &submission {
                        Submission::Queued(handle) => {
                            info!("Submitted job {} (attempt {attempt})", handle.task_id);
                            ProgressKind::Submitted {
                                task_id: handle.task_id.clone(),
                            }
                        }
                        Submission::Completed(_) => {
                            info!("Job completed synchronously (attempt {attempt})");
                            ProgressKind::CompletedSynchronously
                        }
                    };
                    self.report(budget, attempt, kind);
                    return Ok(submission);
                }
                AttemptOutcome::SwitchEncoding => {
                    warn!(
                        "Remote rejected the {encoding} size encoding, retrying once with {}",
                        encoding.other()
                    );
                    encoding = encoding.other();
                    fallback_used = true;
                    budget.refund_submission_attempt();
                    self.report(budget, attempt, ProgressKind::SizeEncodingFallback);
                }
                AttemptOutcome::Retry(failure) => {
                    let reason = failure.describe();
                    warn!("Submission attempt {attempt} failed: {reason}");
                    self.report(budget, attempt, ProgressKind::SubmitRetry { reason });
                    last_failure = Some(failure);
                }
            }
        }
    }

    async fn attempt(
        &self,
        credential: &Credential,
        request: &JobRequest,
        encoding: SizeEncoding,
        fallback_used: bool,
        budget: &RetryBudget,
        cancel: &CancellationToken,
    ) -> Result<AttemptOutcome, GenerationError> {
        let attempt = budget.submissions_used();
        let body = serde_json::to_vec(&SubmitBody::new(request, encoding)).map_err(|e| {
            GenerationError::Validation {
                detail: format!("could not encode request body: {e}"),
            }
        })?;
        let req = HttpRequest::post_json(
            api::generations_url(&self.settings.base_url),
            body,
            budget.attempt_timeout(),
        )
        .header("Authorization", credential.bearer())
        .header(api::ASYNC_MODE_HEADER, "true");

        let resp = match budget
            .bounded(cancel, self.transport.send(req))
            .await
            .map_err(|i| interrupted(i, attempt))?
        {
            Ok(resp) => resp,
            Err(e) => return Ok(AttemptOutcome::Retry(RetryableFailure::Transport(e))),
        };

        self.classify(resp, attempt, encoding, fallback_used)
    }

    fn classify(
        &self,
        resp: HttpResponse,
        attempt: u32,
        encoding: SizeEncoding,
        fallback_used: bool,
    ) -> Result<AttemptOutcome, GenerationError> {
        let text = resp.text();
        debug!("Submission response {}: {text}", resp.status);

        match resp.status {
            200..=299 => {
                let parsed: SubmitResponse = serde_json::from_str(&text).map_err(|e| {
                    GenerationError::SubmissionRejected {
                        attempts: attempt,
                        detail: format!("unreadable submission response ({e}): {text}"),
                    }
                })?;

                if let Some(task_id) = parsed.task_id.as_deref().filter(|id| !id.is_empty()) {
                    let submitted_at = Instant::now();
                    return Ok(AttemptOutcome::Accepted(Submission::Queued(JobHandle {
                        task_id: task_id.to_string(),
                        submitted_at,
                        not_before: submitted_at + self.settings.post_submit_grace,
                        encoding,
                    })));
                }

                match NonEmpty::from_vec(parsed.image_urls()) {
                    Some(urls) => Ok(AttemptOutcome::Accepted(Submission::Completed(urls))),
                    None => Err(GenerationError::SubmissionRejected {
                        attempts: attempt,
                        detail: format!("response carried neither a task id nor images: {text}"),
                    }),
                }
            }
            401 | 403 => Err(GenerationError::Auth { detail: text }),
            408 | 429 | 500..=599 => Ok(AttemptOutcome::Retry(RetryableFailure::Http {
                status: resp.status,
                body: text,
            })),
            400 | 422 if !fallback_used && api::is_size_shape_rejection(&text) => {
                Ok(AttemptOutcome::SwitchEncoding)
            }
            _ => Err(GenerationError::Validation { detail: text }),
        }
    }

    fn report(&self, budget: &RetryBudget, attempt: u32, kind: ProgressKind) {
        self.sink.report(&ProgressEvent {
            elapsed: budget.elapsed(),
            attempt,
            kind,
        });
    }
}

fn interrupted(interrupt: Interrupt, attempts: u32) -> GenerationError {
    match interrupt {
        Interrupt::Cancelled => GenerationError::Cancelled,
        Interrupt::DeadlineExceeded => GenerationError::SubmissionTimeout { attempts },
    }
}

fn exhausted(last_failure: Option<RetryableFailure>, attempts: u32) -> GenerationError {
    match last_failure {
        Some(RetryableFailure::Transport(TransportError::Timeout)) => {
            GenerationError::SubmissionTimeout { attempts }
        }
        Some(RetryableFailure::Transport(e)) => GenerationError::Network(e.to_string()),
        Some(failure @ RetryableFailure::Http { .. }) => GenerationError::SubmissionRejected {
            attempts,
            detail: failure.describe(),
        },
        None => GenerationError::SubmissionRejected {
            attempts,
            detail: "no submission attempts available".into(),
        },
    }
}
