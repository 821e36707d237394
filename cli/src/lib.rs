use std::{
    fs,
    io::{Write, stderr},
    path::{Path, PathBuf},
    sync::Arc,
};

use color_eyre::{
    Result,
    eyre::{WrapErr as _, eyre},
};
use imagegen_engine::{
    CancellationToken, Credential, GenerateOptions, ImageArtifact, ImageGenerator, ProgressEvent,
    ProgressKind, ProgressSink,
};
use log::info;
use serde::de::DeserializeOwned;

use crate::cli::Cli;

pub mod cli;

pub const CONFIG_FILE_NAME: &str = "imagegen.ron";

pub fn load_ron_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let src = fs::read_to_string(path)?;
    Ok(ron::from_str(&src)?)
}

pub fn config_path() -> Result<PathBuf> {
    Ok(dirs::config_local_dir()
        .ok_or(eyre!("Couldn't get config dir"))?
        .join(CONFIG_FILE_NAME))
}

/// Options from an explicit file, else from the default location if a file
/// exists there, else the defaults.
pub fn load_options(explicit: Option<&Path>) -> Result<GenerateOptions> {
    match explicit {
        Some(path) => {
            load_ron_file(path).with_context(|| format!("loading config {}", path.display()))
        }
        None => {
            let path = config_path()?;
            if path.exists() {
                load_ron_file(&path).with_context(|| format!("loading config {}", path.display()))
            } else {
                Ok(GenerateOptions::default())
            }
        }
    }
}

/// Command line flags win over the config file.
pub fn apply_overrides(mut opts: GenerateOptions, cli: &Cli) -> GenerateOptions {
    if let Some(model) = &cli.model {
        opts.model = model.clone();
    }
    if let Some(base_url) = &cli.base_url {
        opts.base_url = base_url.clone();
    }
    if let Some(encoding) = cli.size_encoding {
        opts.size_encoding = encoding;
    }
    if let Some(deadline) = cli.deadline {
        opts.overall_deadline_seconds = deadline;
    }
    if cli.high_latency {
        opts.high_latency_profile = true;
    }
    if cli.aggressive && opts.resubmit_on_stall_after_polls == 0 {
        opts = opts.aggressive();
    }
    opts
}

/// Progress lines on stderr, one per event.
pub struct TerminalSink;

impl ProgressSink for TerminalSink {
    fn report(&self, event: &ProgressEvent) {
        let secs = event.elapsed.as_secs_f64();
        let line = match &event.kind {
            ProgressKind::SubmitAttempt => format!("submitting (attempt {})", event.attempt),
            ProgressKind::SubmitRetry { .. } => {
                format!("submission attempt {} failed, retrying", event.attempt)
            }
            ProgressKind::SizeEncodingFallback => "retrying with the other size format".into(),
            ProgressKind::Submitted { task_id } => format!("queued as {task_id}"),
            ProgressKind::CompletedSynchronously => "finished right away".into(),
            ProgressKind::Polled(classification) => {
                format!("check #{}: {classification}", event.attempt)
            }
            ProgressKind::Resubmitting { abandoned_task_id } => {
                format!("{abandoned_task_id} seems lost, submitting again")
            }
            ProgressKind::Downloading => "downloading image".into(),
        };
        let _ = writeln!(stderr(), "[{secs:5.1}s] {line}");
    }
}

pub async fn run(cli: Cli, cancel: CancellationToken) -> Result<ImageArtifact> {
    let opts = apply_overrides(load_options(cli.config.as_deref())?, &cli);
    let credential = Credential::new(&cli.key)?;
    let (width, height) = cli.dimensions();

    let generator = ImageGenerator::new(&opts)?.progress(Arc::new(TerminalSink));
    let artifact = generator
        .generate(&credential, &cli.prompt, width, height, &cancel)
        .await?;

    fs::write(&cli.output, artifact.to_png()?)
        .with_context(|| format!("writing {}", cli.output.display()))?;
    info!("Saved image to {}", cli.output.display());
    Ok(artifact)
}
