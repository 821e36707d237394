use log::{debug, info, warn};
use nonempty::NonEmpty;
use tokio::time::sleep_until;
use tokio_util::sync::CancellationToken;

use crate::{
    api::{self, TaskResponse, task_status},
    budget::{Interrupt, RetryBudget},
    error::{GenerationError, TransportError},
    model::{Credential, JobFailure, JobHandle, JobRequest, JobStatus, TransientReason},
    options::Settings,
    progress::{ProgressEvent, ProgressKind, ProgressSink},
    submitter::{Submission, Submitter},
    transport::{HttpRequest, HttpResponse, Transport},
};

#[derive(Debug)]
enum PollState {
    /// Grace interval after a submission.
    Waiting,
    Querying,
    Cooldown,
    ReSubmit,
    Done(NonEmpty<String>),
    Failed(GenerationError),
}

/// Maps the outcome of one status request to exactly one [`JobStatus`].
///
/// A `task not found` complaint counts as [`TransientReason::NotYetIndexed`]
/// on a `FAILED` task and on any error status except 401/403, which are
/// always an auth failure. Pending, running and finished tasks are taken at
/// their word.
pub fn classify(
    outcome: &Result<HttpResponse, TransportError>,
    sentinel_detection: bool,
) -> JobStatus {
    let resp = match outcome {
        Ok(resp) => resp,
        Err(_) => {
            return JobStatus::TransientUnknown {
                reason: TransientReason::NetworkFlap,
            };
        }
    };
    let text = resp.text();

    match resp.status {
        401 | 403 => JobStatus::Failed(JobFailure::Auth { detail: text }),
        200..=299 => classify_task_body(&text, sentinel_detection),
        _ if sentinel_detection && api::is_task_not_found(&text) => JobStatus::TransientUnknown {
            reason: TransientReason::NotYetIndexed,
        },
        404 | 408 | 429 | 500..=599 => JobStatus::TransientUnknown {
            reason: TransientReason::ServerTransient,
        },
        400 | 422 => JobStatus::Failed(JobFailure::Validation { detail: text }),
        status => JobStatus::Failed(JobFailure::Remote {
            detail: serde_json::json!({
                "http_status": status,
                "body": api::detail_payload(&text),
            }),
        }),
    }
}

fn classify_task_body(text: &str, sentinel_detection: bool) -> JobStatus {
    let task: TaskResponse = match serde_json::from_str(text) {
        Ok(task) => task,
        Err(e) => {
            warn!("Unreadable task status body ({e}): {text}");
            return JobStatus::TransientUnknown {
                reason: TransientReason::ServerTransient,
            };
        }
    };

    let word = task.task_status.as_deref().unwrap_or_default();
    if word.eq_ignore_ascii_case(task_status::SUCCEED) {
        match NonEmpty::from_vec(task.output_images.unwrap_or_default()) {
            Some(image_urls) => JobStatus::Succeeded { image_urls },
            None => JobStatus::Failed(JobFailure::Remote {
                detail: serde_json::json!({
                    "detail": "job succeeded without output images",
                    "payload": api::detail_payload(text),
                }),
            }),
        }
    } else if word.eq_ignore_ascii_case(task_status::FAILED) {
        if sentinel_detection && api::is_task_not_found(text) {
            JobStatus::TransientUnknown {
                reason: TransientReason::NotYetIndexed,
            }
        } else {
            JobStatus::Failed(JobFailure::Remote {
                detail: api::detail_payload(text),
            })
        }
    } else if word.eq_ignore_ascii_case(task_status::RUNNING) {
        JobStatus::Running
    } else {
        if !word.eq_ignore_ascii_case(task_status::PENDING) {
            debug!("Unknown task status {word:?}, treating it as pending");
        }
        JobStatus::Pending
    }
}

pub struct Poller<'a> {
    transport: &'a dyn Transport,
    settings: &'a Settings,
    sink: &'a dyn ProgressSink,
    submitter: &'a Submitter<'a>,
}

impl<'a> Poller<'a> {
    pub fn new(
        transport: &'a dyn Transport,
        settings: &'a Settings,
        sink: &'a dyn ProgressSink,
        submitter: &'a Submitter<'a>,
    ) -> Self {
        Self {
            transport,
            settings,
            sink,
            submitter,
        }
    }

    /// Polls `handle` until the job succeeds, fails for real, or the budget's
    /// deadline runs out. Transient answers are absorbed.
    pub async fn run(
        &self,
        credential: &Credential,
        request: &JobRequest,
        handle: JobHandle,
        budget: &mut RetryBudget,
        cancel: &CancellationToken,
    ) -> Result<NonEmpty<String>, GenerationError> {
        let mut handle = handle;
        let mut state = PollState::Waiting;
        let mut polls = 0u32;
        let mut streak = 0u32;
        let mut not_indexed_streak = 0u32;
        let mut resubmits = 0u32;

        loop {
            state = match state {
                PollState::Waiting => {
                    match budget.bounded(cancel, sleep_until(handle.not_before)).await {
                        Ok(()) => PollState::Querying,
                        Err(i) => PollState::Failed(interrupted(i, budget, polls)),
                    }
                }

                PollState::Querying => {
                    polls += 1;
                    match self.query(credential, &handle, budget, cancel).await {
                        Err(i) => PollState::Failed(interrupted(i, budget, polls)),
                        Ok(outcome) => {
                            let status = classify(&outcome, self.settings.sentinel_detection);
                            self.report(budget, polls, &handle, &status);

                            match status {
                                JobStatus::Succeeded { image_urls } => PollState::Done(image_urls),
                                JobStatus::Failed(failure) => PollState::Failed(failure.into()),
                                JobStatus::TransientUnknown {
                                    reason: TransientReason::NotYetIndexed,
                                } => {
                                    streak += 1;
                                    not_indexed_streak += 1;
                                    if self.should_resubmit(not_indexed_streak, resubmits) {
                                        PollState::ReSubmit
                                    } else {
                                        PollState::Cooldown
                                    }
                                }
                                JobStatus::Pending
                                | JobStatus::Running
                                | JobStatus::TransientUnknown { .. } => {
                                    streak += 1;
                                    not_indexed_streak = 0;
                                    PollState::Cooldown
                                }
                            }
                        }
                    }
                }

                PollState::Cooldown => {
                    if budget.is_expired() {
                        PollState::Failed(deadline_exceeded(budget, polls))
                    } else {
                        match budget.sleep(cancel, budget.cooldown(streak)).await {
                            Ok(()) if budget.is_expired() => {
                                PollState::Failed(deadline_exceeded(budget, polls))
                            }
                            Ok(()) => PollState::Querying,
                            Err(i) => PollState::Failed(interrupted(i, budget, polls)),
                        }
                    }
                }

                PollState::ReSubmit => {
                    resubmits += 1;
                    not_indexed_streak = 0;
                    warn!(
                        "Job {} still not indexed after {} polls, submitting again ({resubmits}/{})",
                        handle.task_id, self.settings.stall_threshold, self.settings.max_resubmits
                    );
                    self.sink.report(&ProgressEvent {
                        elapsed: budget.elapsed(),
                        attempt: resubmits,
                        kind: ProgressKind::Resubmitting {
                            abandoned_task_id: handle.task_id.clone(),
                        },
                    });

                    budget.reset_submission_attempts();
                    match self
                        .submitter
                        .resubmit(&handle, credential, request, budget, cancel)
                        .await
                    {
                        Ok(Submission::Queued(new_handle)) => {
                            info!(
                                "Abandoned job {} (submitted {:.1}s ago) for {}",
                                handle.task_id,
                                handle.submitted_at.elapsed().as_secs_f64(),
                                new_handle.task_id
                            );
                            handle = new_handle;
                            PollState::Waiting
                        }
                        Ok(Submission::Completed(urls)) => PollState::Done(urls),
                        Err(GenerationError::SubmissionTimeout { .. }) if budget.is_expired() => {
                            PollState::Failed(deadline_exceeded(budget, polls))
                        }
                        Err(e) => PollState::Failed(e),
                    }
                }

                PollState::Done(urls) => {
                    info!("Job {} finished after {polls} poll(s)", handle.task_id);
                    return Ok(urls);
                }
                PollState::Failed(e) => return Err(e),
            };
        }
    }

    fn should_resubmit(&self, not_indexed_streak: u32, resubmits: u32) -> bool {
        self.settings.resubmit_enabled()
            && not_indexed_streak >= self.settings.stall_threshold
            && resubmits < self.settings.max_resubmits
    }

    async fn query(
        &self,
        credential: &Credential,
        handle: &JobHandle,
        budget: &RetryBudget,
        cancel: &CancellationToken,
    ) -> Result<Result<HttpResponse, TransportError>, Interrupt> {
        let req = HttpRequest::get(
            api::task_url(&self.settings.base_url, &handle.task_id),
            budget.attempt_timeout(),
        )
        .header("Authorization", credential.bearer())
        .header(api::TASK_TYPE_HEADER, api::TASK_TYPE_IMAGE_GENERATION);

        let outcome = budget.bounded(cancel, self.transport.send(req)).await?;
        if let Ok(resp) = &outcome {
            debug!("Task {} answered {}: {}", handle.task_id, resp.status, resp.text());
        }
        Ok(outcome)
    }

    fn report(&self, budget: &RetryBudget, polls: u32, handle: &JobHandle, status: &JobStatus) {
        let classification = status.classification();
        match status {
            JobStatus::TransientUnknown { .. } => warn!(
                "Poll #{polls} of job {}: {classification}, asking again",
                handle.task_id
            ),
            _ => debug!("Poll #{polls} of job {}: {classification}", handle.task_id),
        }
        self.sink.report(&ProgressEvent {
            elapsed: budget.elapsed(),
            attempt: polls,
            kind: ProgressKind::Polled(classification),
        });
    }
}

fn deadline_exceeded(budget: &RetryBudget, polls: u32) -> GenerationError {
    GenerationError::PollingDeadlineExceeded {
        elapsed_secs: budget.elapsed().as_secs_f64(),
        polls,
    }
}

fn interrupted(interrupt: Interrupt, budget: &RetryBudget, polls: u32) -> GenerationError {
    match interrupt {
        Interrupt::Cancelled => GenerationError::Cancelled,
        Interrupt::DeadlineExceeded => deadline_exceeded(budget, polls),
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use bytes::Bytes;
    use serde_json::json;
    use tokio::time::Instant;

    use super::*;
    use crate::{
        model::{Classification, SizeEncoding},
        options::GenerateOptions,
        test_support::{RecordingSink, Reply, ScriptedTransport},
    };

    fn respond(status: u16, body: &str) -> Result<HttpResponse, TransportError> {
        Ok(HttpResponse {
            status,
            body: Bytes::from(body.to_string()),
        })
    }

    fn transient(reason: TransientReason) -> JobStatus {
        JobStatus::TransientUnknown { reason }
    }

    #[test]
    fn classify_status_words() {
        assert_eq!(
            classify(&respond(200, r#"{"task_status":"RUNNING"}"#), true),
            JobStatus::Running
        );
        assert_eq!(
            classify(&respond(200, r#"{"task_status":"PENDING"}"#), true),
            JobStatus::Pending
        );
        assert_eq!(
            classify(&respond(200, r#"{"task_status":"QUEUED"}"#), true),
            JobStatus::Pending
        );
        assert_eq!(
            classify(
                &respond(
                    200,
                    r#"{"task_status":"SUCCEED","output_images":["https://cdn/x.png","https://cdn/y.png"]}"#
                ),
                true
            ),
            JobStatus::Succeeded {
                image_urls: NonEmpty::from_vec(vec![
                    "https://cdn/x.png".to_string(),
                    "https://cdn/y.png".to_string()
                ])
                .unwrap()
            }
        );
    }

    #[test]
    fn success_without_images_is_a_failure() {
        assert!(matches!(
            classify(&respond(200, r#"{"task_status":"SUCCEED","output_images":[]}"#), true),
            JobStatus::Failed(JobFailure::Remote { .. })
        ));
    }

    #[test]
    fn sentinel_overrides_failed_status() {
        let body = r#"{"task_status":"FAILED","detail":"Task Not Found"}"#;
        assert_eq!(
            classify(&respond(200, body), true),
            transient(TransientReason::NotYetIndexed)
        );
        assert!(matches!(
            classify(&respond(200, body), false),
            JobStatus::Failed(JobFailure::Remote { .. })
        ));
    }

    #[test]
    fn finished_job_echoing_the_sentinel_is_kept() {
        let body = r#"{"task_status":"SUCCEED","output_images":["https://cdn/x.png"],"inputs":{"prompt":"a sign reading TASK NOT FOUND"}}"#;
        assert_eq!(
            classify(&respond(200, body), true),
            JobStatus::Succeeded {
                image_urls: NonEmpty::new("https://cdn/x.png".to_string())
            }
        );
        let body = r#"{"task_status":"RUNNING","message":"task not found"}"#;
        assert_eq!(classify(&respond(200, body), true), JobStatus::Running);
    }

    #[test]
    fn sentinel_applies_to_error_statuses() {
        assert_eq!(
            classify(&respond(400, r#"{"message":"task not found"}"#), true),
            transient(TransientReason::NotYetIndexed)
        );
        assert_eq!(
            classify(&respond(500, "task not found"), true),
            transient(TransientReason::NotYetIndexed)
        );
    }

    #[test]
    fn auth_statuses_are_always_terminal() {
        for status in [401, 403] {
            assert!(matches!(
                classify(&respond(status, r#"{"error":"task not found"}"#), true),
                JobStatus::Failed(JobFailure::Auth { .. })
            ));
        }
    }

    #[test]
    fn http_classes() {
        for status in [404, 408, 429, 500, 502, 503] {
            assert_eq!(
                classify(&respond(status, ""), true),
                transient(TransientReason::ServerTransient),
                "status {status}"
            );
        }
        for status in [400, 422] {
            assert!(matches!(
                classify(&respond(status, r#"{"error":"bad"}"#), true),
                JobStatus::Failed(JobFailure::Validation { .. })
            ));
        }
        assert!(matches!(
            classify(&respond(409, "conflict"), true),
            JobStatus::Failed(JobFailure::Remote { .. })
        ));
        assert_eq!(
            classify(&respond(200, "<html>gateway</html>"), true),
            transient(TransientReason::ServerTransient)
        );
        assert_eq!(
            classify(&Err(TransportError::Timeout), true),
            transient(TransientReason::NetworkFlap)
        );
    }

    struct Fixture {
        transport: ScriptedTransport,
        settings: Settings,
        sink: RecordingSink,
    }

    impl Fixture {
        fn new(transport: ScriptedTransport, opts: GenerateOptions) -> Self {
            Self {
                transport,
                settings: opts.resolve().unwrap(),
                sink: RecordingSink::default(),
            }
        }

        async fn run(&self) -> Result<NonEmpty<String>, GenerationError> {
            self.run_with(&CancellationToken::new()).await
        }

        async fn run_with(
            &self,
            cancel: &CancellationToken,
        ) -> Result<NonEmpty<String>, GenerationError> {
            self.run_accepted_as(self.settings.size_encoding, cancel)
                .await
        }

        async fn run_accepted_as(
            &self,
            encoding: SizeEncoding,
            cancel: &CancellationToken,
        ) -> Result<NonEmpty<String>, GenerationError> {
            let submitter = Submitter::new(&self.transport, &self.settings, &self.sink);
            let poller = Poller::new(&self.transport, &self.settings, &self.sink, &submitter);
            let mut budget = RetryBudget::start(&self.settings);
            let now = Instant::now();
            let handle = JobHandle {
                task_id: "T1".into(),
                submitted_at: now,
                not_before: now + self.settings.post_submit_grace,
                encoding,
            };
            let request = JobRequest::new("cat", &self.settings.model, 64, 64).unwrap();
            poller
                .run(
                    &Credential::new("ms-token").unwrap(),
                    &request,
                    handle,
                    &mut budget,
                    cancel,
                )
                .await
        }
    }

    fn succeed() -> Reply {
        Reply::json(
            200,
            json!({"task_status": "SUCCEED", "output_images": ["https://cdn/x.png"]}),
        )
    }

    fn not_found() -> Reply {
        Reply::json(200, json!({"task_status": "FAILED", "detail": "task not found"}))
    }

    #[tokio::test(start_paused = true)]
    async fn poll_requests_carry_task_type_header() {
        let fx = Fixture::new(
            ScriptedTransport::new().polls([succeed()]),
            GenerateOptions::default(),
        );
        fx.run().await.unwrap();
        let req = &fx.transport.requests()[0];
        assert_eq!(
            req.url,
            "https://api-inference.modelscope.cn/v1/tasks/T1"
        );
        assert_eq!(req.header_value("Authorization"), Some("Bearer ms-token"));
        assert_eq!(
            req.header_value("X-ModelScope-Task-Type"),
            Some("image_generation")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn first_poll_waits_for_grace_interval() {
        let fx = Fixture::new(
            ScriptedTransport::new().polls([succeed()]),
            GenerateOptions {
                post_submit_grace_seconds: 4.0,
                ..Default::default()
            },
        );
        let start = Instant::now();
        fx.run().await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn sentinel_never_ends_the_loop_on_first_sight() {
        let fx = Fixture::new(
            ScriptedTransport::new().polls([not_found(), succeed()]),
            GenerateOptions::default(),
        );
        assert!(fx.run().await.is_ok());
        assert_eq!(fx.transport.poll_count(), 2);
        assert_eq!(
            fx.sink
                .polled(Classification::Transient(TransientReason::NotYetIndexed)),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transient_only_trace_hits_the_deadline() {
        let fx = Fixture::new(
            ScriptedTransport::new().polls([
                not_found(),
                Reply::json(500, json!({"error": "internal"})),
                Reply::json(404, json!({})),
                Reply::Fail(TransportError::Connect("reset".into())),
                Reply::json(503, json!({"error": "task not found"})),
                not_found(),
            ]),
            GenerateOptions {
                overall_deadline_seconds: 60,
                ..Default::default()
            },
        );
        match fx.run().await {
            Err(GenerationError::PollingDeadlineExceeded { elapsed_secs, polls }) => {
                assert!((60.0..61.0).contains(&elapsed_secs));
                assert!(polls > 10);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn auth_failure_stops_polling() {
        let fx = Fixture::new(
            ScriptedTransport::new().polls([
                Reply::json(200, json!({"task_status": "RUNNING"})),
                Reply::json(403, json!({"error": "forbidden"})),
                succeed(),
            ]),
            GenerateOptions::default(),
        );
        assert!(matches!(fx.run().await, Err(GenerationError::Auth { .. })));
        assert_eq!(fx.transport.poll_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_poll_is_cut_by_deadline() {
        let fx = Fixture::new(
            ScriptedTransport::new().polls([Reply::Hang]),
            GenerateOptions {
                overall_deadline_seconds: 60,
                ..Default::default()
            },
        );
        let start = Instant::now();
        assert!(matches!(
            fx.run().await,
            Err(GenerationError::PollingDeadlineExceeded { polls: 1, .. })
        ));
        assert!(start.elapsed() <= Duration::from_secs(61));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_mid_poll() {
        let fx = Fixture::new(
            ScriptedTransport::new().polls([Reply::Hang]),
            GenerateOptions::default(),
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            trigger.cancel();
        });
        assert!(matches!(
            fx.run_with(&cancel).await,
            Err(GenerationError::Cancelled)
        ));
        assert_eq!(fx.transport.poll_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_job_is_resubmitted_in_aggressive_mode() {
        let fx = Fixture::new(
            ScriptedTransport::new()
                .submits([Reply::json(200, json!({"task_id": "T2"}))])
                .polls([
                    not_found(),
                    not_found(),
                    not_found(),
                    not_found(),
                    not_found(),
                    succeed(),
                ]),
            GenerateOptions::default().aggressive(),
        );
        assert!(fx.run().await.is_ok());
        assert_eq!(fx.transport.submit_count(), 1);
        let last = fx.transport.requests().last().unwrap().url.clone();
        assert!(last.ends_with("/v1/tasks/T2"), "{last}");
        assert!(
            fx.sink
                .events()
                .iter()
                .any(|e| matches!(&e.kind, ProgressKind::Resubmitting { abandoned_task_id } if abandoned_task_id == "T1"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn resubmission_keeps_the_accepted_size_encoding() {
        let fx = Fixture::new(
            ScriptedTransport::new()
                .submits([Reply::json(200, json!({"task_id": "T2"}))])
                .polls([
                    not_found(),
                    not_found(),
                    not_found(),
                    not_found(),
                    not_found(),
                    succeed(),
                ]),
            GenerateOptions::default().aggressive(),
        );
        fx.run_accepted_as(SizeEncoding::String, &CancellationToken::new())
            .await
            .unwrap();

        let posts: Vec<serde_json::Value> = fx
            .transport
            .requests()
            .iter()
            .filter_map(|r| r.body.as_deref())
            .map(|b| serde_json::from_slice(b).unwrap())
            .collect();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0]["size"], "64x64");
        assert!(posts[0].get("parameters").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn resubmissions_are_capped() {
        let fx = Fixture::new(
            ScriptedTransport::new()
                .submits([Reply::json(200, json!({"task_id": "Tn"}))])
                .polls([not_found()]),
            GenerateOptions {
                overall_deadline_seconds: 300,
                max_resubmits: 2,
                ..GenerateOptions::default().aggressive()
            },
        );
        assert!(matches!(
            fx.run().await,
            Err(GenerationError::PollingDeadlineExceeded { .. })
        ));
        assert_eq!(fx.transport.submit_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn baseline_never_resubmits() {
        let fx = Fixture::new(
            ScriptedTransport::new().polls([not_found()]),
            GenerateOptions {
                overall_deadline_seconds: 60,
                ..Default::default()
            },
        );
        assert!(fx.run().await.is_err());
        assert_eq!(fx.transport.submit_count(), 0);
    }
}
