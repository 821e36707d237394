//! ModelScope inference API: endpoints, headers and JSON shapes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{JobRequest, SizeEncoding};

pub const GENERATIONS_PATH: &str = "/v1/images/generations";
pub const TASKS_PATH: &str = "/v1/tasks";

pub const ASYNC_MODE_HEADER: &str = "X-ModelScope-Async-Mode";
pub const TASK_TYPE_HEADER: &str = "X-ModelScope-Task-Type";
pub const TASK_TYPE_IMAGE_GENERATION: &str = "image_generation";

pub fn generations_url(base: &str) -> String {
    format!("{base}{GENERATIONS_PATH}")
}

pub fn task_url(base: &str, task_id: &str) -> String {
    format!("{base}{TASKS_PATH}/{task_id}")
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum SubmitBody {
    Pair {
        model: String,
        prompt: String,
        parameters: SizeParameters,
    },
    String {
        model: String,
        prompt: String,
        n: u32,
        size: String,
    },
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SizeParameters {
    pub width: u32,
    pub height: u32,
}

impl SubmitBody {
    pub fn new(req: &JobRequest, encoding: SizeEncoding) -> Self {
        match encoding {
            SizeEncoding::Pair => SubmitBody::Pair {
                model: req.model().into(),
                prompt: req.prompt().into(),
                parameters: SizeParameters {
                    width: req.width(),
                    height: req.height(),
                },
            },
            SizeEncoding::String => SubmitBody::String {
                model: req.model().into(),
                prompt: req.prompt().into(),
                n: 1,
                size: req.size_string(),
            },
        }
    }
}

/// 2xx answer to a submission. Async mode answers with a task id, the
/// synchronous flavour with the finished image urls.
#[derive(Debug, Deserialize, Default)]
pub struct SubmitResponse {
    pub task_id: Option<String>,
    #[serde(default)]
    pub data: Vec<ImageData>,
}

#[derive(Debug, Deserialize)]
pub struct ImageData {
    pub url: Option<String>,
}

impl SubmitResponse {
    pub fn image_urls(&self) -> Vec<String> {
        self.data.iter().filter_map(|d| d.url.clone()).collect()
    }
}

#[derive(Debug, Deserialize)]
pub struct TaskResponse {
    #[serde(default)]
    pub task_status: Option<String>,
    #[serde(default)]
    pub output_images: Option<Vec<String>>,
}

/// Task status words as the remote spells them.
pub mod task_status {
    pub const PENDING: &str = "PENDING";
    pub const RUNNING: &str = "RUNNING";
    pub const SUCCEED: &str = "SUCCEED";
    pub const FAILED: &str = "FAILED";
}

const TASK_NOT_FOUND_SENTINELS: &[&str] = &["task not found", "task_not_found"];

/// Fields the remote puts its complaint in. Everything else in an error body
/// may echo the request, prompt included.
const ERROR_FIELDS: &[&str] = &["detail", "message", "msg", "error", "errors", "error_msg"];

/// The human written part of an error body. A JSON object yields only its
/// error fields; anything that is not a JSON object is taken as is.
pub fn error_text(body: &str) -> String {
    let Ok(Value::Object(fields)) = serde_json::from_str::<Value>(body) else {
        return body.to_string();
    };
    ERROR_FIELDS
        .iter()
        .filter_map(|key| match fields.get(*key)? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// The task index behind `GET /v1/tasks/{id}` is eventually consistent: for
/// a while after submission it reports the job as `FAILED` (or answers 4xx/5xx)
/// with a "task not found" message, although the job exists and will finish.
/// Payloads matching this are not real failures.
pub fn is_task_not_found(body: &str) -> bool {
    let lower = error_text(body).to_lowercase();
    TASK_NOT_FOUND_SENTINELS.iter().any(|s| lower.contains(s))
}

const SIZE_FIELDS: &[&str] = &["parameters", "width", "height"];
/// Words that make a following `size` refer to the field, not to some limit.
const SIZE_QUALIFIERS: &[&str] = &["invalid", "unsupported", "unknown", "field", "parameter"];

/// Whether a 400/422 on submission complains about how the size was sent,
/// in which case the other encoding is worth one try.
pub fn is_size_shape_rejection(body: &str) -> bool {
    let text = error_text(body).to_lowercase();
    if ["\"size\"", "'size'", "`size`"]
        .iter()
        .any(|quoted| text.contains(quoted))
    {
        return true;
    }
    let words: Vec<&str> = text
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .collect();
    words.iter().enumerate().any(|(i, word)| {
        SIZE_FIELDS.contains(word)
            || (*word == "size" && i > 0 && SIZE_QUALIFIERS.contains(&words[i - 1]))
    })
}

/// Best effort detail for error messages: the JSON payload if there is one,
/// the raw text otherwise.
pub fn detail_payload(body: &str) -> Value {
    serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_string()))
}
