use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{error::OptionsError, model::SizeEncoding};

pub const DEFAULT_MODEL: &str = "Tongyi-MAI/Z-Image-Turbo";
pub const DEFAULT_BASE_URL: &str = "https://api-inference.modelscope.cn";

const HIGH_LATENCY_INTER_POLL_SECS: f64 = 3.0;
const HIGH_LATENCY_GRACE_SECS: f64 = 5.0;
const DEFAULT_STALL_THRESHOLD: u32 = 5;

/// Knobs of a single generation call. Loadable from a config file; any field
/// left out takes its default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerateOptions {
    pub model: String,
    pub base_url: String,
    pub overall_deadline_seconds: u64,
    pub inter_poll_seconds: f64,
    pub post_submit_grace_seconds: f64,
    pub submission_retries: u32,
    /// Consecutive "not yet indexed" polls before the job is submitted
    /// again. 0 disables re-submission.
    pub resubmit_on_stall_after_polls: u32,
    pub max_resubmits: u32,
    pub high_latency_profile: bool,
    pub size_encoding: SizeEncoding,
    pub per_attempt_timeout_seconds: f64,
    pub fetch_timeout_seconds: f64,
    pub submission_backoff_seconds: f64,
    pub exponential_cooldown: bool,
    /// Reclassify `task not found` failures as transient. Only ever turned
    /// off in tests.
    pub sentinel_detection: bool,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.into(),
            base_url: DEFAULT_BASE_URL.into(),
            overall_deadline_seconds: 120,
            inter_poll_seconds: 2.0,
            post_submit_grace_seconds: 2.0,
            submission_retries: 3,
            resubmit_on_stall_after_polls: 0,
            max_resubmits: 3,
            high_latency_profile: false,
            size_encoding: SizeEncoding::Pair,
            per_attempt_timeout_seconds: 30.0,
            fetch_timeout_seconds: 60.0,
            submission_backoff_seconds: 2.0,
            exponential_cooldown: false,
            sentinel_detection: true,
        }
    }
}

impl GenerateOptions {
    /// Turns on re-submission after the default number of stalled polls.
    pub fn aggressive(mut self) -> Self {
        self.resubmit_on_stall_after_polls = DEFAULT_STALL_THRESHOLD;
        self
    }

    pub fn validate(&self) -> Result<(), OptionsError> {
        check_range(
            "overall_deadline_seconds",
            self.overall_deadline_seconds as f64,
            60.0,
            600.0,
        )?;
        check_range("inter_poll_seconds", self.inter_poll_seconds, 0.5, 10.0)?;
        check_range(
            "post_submit_grace_seconds",
            self.post_submit_grace_seconds,
            0.0,
            10.0,
        )?;
        check_range(
            "submission_retries",
            self.submission_retries as f64,
            1.0,
            5.0,
        )?;
        check_range(
            "per_attempt_timeout_seconds",
            self.per_attempt_timeout_seconds,
            1.0,
            300.0,
        )?;
        check_range("fetch_timeout_seconds", self.fetch_timeout_seconds, 1.0, 300.0)?;
        check_range(
            "submission_backoff_seconds",
            self.submission_backoff_seconds,
            0.0,
            30.0,
        )?;

        let base = self.base_url.trim_end_matches('/');
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(OptionsError::BaseUrl(self.base_url.clone()));
        }
        Ok(())
    }

    /// Validates and resolves the options into the durations the pipeline
    /// runs on, applying the high-latency profile.
    pub fn resolve(&self) -> Result<Settings, OptionsError> {
        self.validate()?;

        let (inter_poll, grace) = if self.high_latency_profile {
            (
                self.inter_poll_seconds.max(HIGH_LATENCY_INTER_POLL_SECS),
                self.post_submit_grace_seconds.max(HIGH_LATENCY_GRACE_SECS),
            )
        } else {
            (self.inter_poll_seconds, self.post_submit_grace_seconds)
        };

        Ok(Settings {
            model: self.model.clone(),
            base_url: self.base_url.trim_end_matches('/').to_string(),
            overall_deadline: Duration::from_secs(self.overall_deadline_seconds),
            inter_poll: Duration::from_secs_f64(inter_poll),
            post_submit_grace: Duration::from_secs_f64(grace),
            submission_attempts: self.submission_retries,
            stall_threshold: self.resubmit_on_stall_after_polls,
            max_resubmits: self.max_resubmits,
            size_encoding: self.size_encoding,
            per_attempt_timeout: Duration::from_secs_f64(self.per_attempt_timeout_seconds),
            fetch_timeout: Duration::from_secs_f64(self.fetch_timeout_seconds),
            submission_backoff: Duration::from_secs_f64(self.submission_backoff_seconds),
            exponential_cooldown: self.exponential_cooldown,
            sentinel_detection: self.sentinel_detection,
        })
    }
}

fn check_range(field: &'static str, value: f64, min: f64, max: f64) -> Result<(), OptionsError> {
    if value.is_finite() && (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(OptionsError::OutOfRange {
            field,
            min,
            max,
            value,
        })
    }
}

/// Validated options, in the units the pipeline uses.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub model: String,
    pub base_url: String,
    pub overall_deadline: Duration,
    pub inter_poll: Duration,
    pub post_submit_grace: Duration,
    pub submission_attempts: u32,
    pub stall_threshold: u32,
    pub max_resubmits: u32,
    pub size_encoding: SizeEncoding,
    pub per_attempt_timeout: Duration,
    pub fetch_timeout: Duration,
    pub submission_backoff: Duration,
    pub exponential_cooldown: bool,
    pub sentinel_detection: bool,
}

impl Settings {
    pub fn resubmit_enabled(&self) -> bool {
        self.stall_threshold > 0 && self.max_resubmits > 0
    }
}
