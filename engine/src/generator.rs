use std::sync::Arc;

use log::{debug, info};
use tokio_util::sync::CancellationToken;

use crate::{
    budget::RetryBudget,
    error::GenerationError,
    fetcher::{Fetcher, ImageArtifact},
    model::{Credential, JobRequest},
    options::{GenerateOptions, Settings},
    poller::Poller,
    progress::{LogSink, ProgressEvent, ProgressKind, ProgressSink},
    submitter::{Submission, Submitter},
    transport::{ReqwestTransport, Transport},
};

/// Runs text-to-image jobs: submit, poll until done, download.
///
/// Holds no per-call state; every [`generate`](Self::generate) call gets its
/// own budget and handle.
pub struct ImageGenerator {
    settings: Settings,
    transport: Arc<dyn Transport>,
    sink: Arc<dyn ProgressSink>,
}

impl ImageGenerator {
    pub fn new(options: &GenerateOptions) -> Result<Self, GenerationError> {
        let settings = options.resolve()?;
        let transport = ReqwestTransport::new(settings.per_attempt_timeout)
            .map_err(|e| GenerationError::Network(e.to_string()))?;
        Ok(Self {
            settings,
            transport: Arc::new(transport),
            sink: Arc::new(LogSink),
        })
    }

    pub fn with_transport(
        options: &GenerateOptions,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, GenerationError> {
        Ok(Self {
            settings: options.resolve()?,
            transport,
            sink: Arc::new(LogSink),
        })
    }

    pub fn progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub async fn generate(
        &self,
        credential: &Credential,
        prompt: &str,
        width: u32,
        height: u32,
        cancel: &CancellationToken,
    ) -> Result<ImageArtifact, GenerationError> {
        if cancel.is_cancelled() {
            return Err(GenerationError::Cancelled);
        }
        let request = JobRequest::new(prompt, self.settings.model.as_str(), width, height)?;
        let mut budget = RetryBudget::start(&self.settings);
        let transport = self.transport.as_ref();
        let sink = self.sink.as_ref();

        info!(
            "Generating {}x{} image with {}",
            request.width(),
            request.height(),
            request.model()
        );

        let submitter = Submitter::new(transport, &self.settings, sink);
        let image_urls = match submitter
            .submit(credential, &request, &mut budget, cancel)
            .await?
        {
            Submission::Queued(handle) => {
                Poller::new(transport, &self.settings, sink, &submitter)
                    .run(credential, &request, handle, &mut budget, cancel)
                    .await?
            }
            Submission::Completed(urls) => urls,
        };

        if image_urls.len() > 1 {
            debug!(
                "Job produced {} images, using the first",
                image_urls.len()
            );
        }
        sink.report(&ProgressEvent {
            elapsed: budget.elapsed(),
            attempt: 1,
            kind: ProgressKind::Downloading,
        });

        // A download that starts just before the deadline still gets one
        // attempt's worth of time.
        let fetch_deadline = budget.deadline + self.settings.per_attempt_timeout;
        let artifact = Fetcher::new(transport, &self.settings)
            .fetch(image_urls.first(), fetch_deadline, cancel)
            .await?;

        info!(
            "Image ready after {:.1}s: {}x{} {}",
            budget.elapsed().as_secs_f64(),
            artifact.width(),
            artifact.height(),
            artifact.mime
        );
        Ok(artifact)
    }
}

/// One-shot generation with a fresh client and no way to cancel.
pub async fn generate(
    credential: &str,
    prompt: &str,
    width: u32,
    height: u32,
    options: &GenerateOptions,
) -> Result<ImageArtifact, GenerationError> {
    let credential = Credential::new(credential)?;
    ImageGenerator::new(options)?
        .generate(&credential, prompt, width, height, &CancellationToken::new())
        .await
}
