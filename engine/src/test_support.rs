//! Scripted transport and recording sink shared by the unit tests.

use std::{
    collections::VecDeque,
    io::Cursor,
    sync::Mutex,
    time::Duration,
};

use bytes::Bytes;
use image::{ImageFormat, RgbImage};
use serde_json::Value;

use crate::{
    error::TransportError,
    model::Classification,
    progress::{ProgressEvent, ProgressKind, ProgressSink},
    transport::{HttpRequest, HttpResponse, Method, Transport, TransportFuture},
};

#[derive(Debug, Clone)]
pub enum Reply {
    Respond { status: u16, body: Bytes },
    Fail(TransportError),
    /// Never answers; only the deadline or cancellation get past it.
    Hang,
}

impl Reply {
    pub fn json(status: u16, body: Value) -> Self {
        Reply::Respond {
            status,
            body: Bytes::from(body.to_string()),
        }
    }

    pub fn bytes(status: u16, body: Vec<u8>) -> Self {
        Reply::Respond {
            status,
            body: Bytes::from(body),
        }
    }
}

/// Answers submissions, polls and image downloads from three queues. The last
/// entry of a queue repeats forever.
#[derive(Default)]
pub struct ScriptedTransport {
    submits: Mutex<VecDeque<Reply>>,
    polls: Mutex<VecDeque<Reply>>,
    images: Mutex<VecDeque<Reply>>,
    latency: Duration,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submits(self, replies: impl IntoIterator<Item = Reply>) -> Self {
        self.submits.lock().unwrap().extend(replies);
        self
    }

    pub fn polls(self, replies: impl IntoIterator<Item = Reply>) -> Self {
        self.polls.lock().unwrap().extend(replies);
        self
    }

    pub fn images(self, replies: impl IntoIterator<Item = Reply>) -> Self {
        self.images.lock().unwrap().extend(replies);
        self
    }

    /// Simulated time each request takes before its reply.
    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&HttpRequest) -> bool) -> usize {
        self.requests.lock().unwrap().iter().filter(|r| pred(r)).count()
    }

    pub fn submit_count(&self) -> usize {
        self.count(|r| r.method == Method::Post)
    }

    pub fn poll_count(&self) -> usize {
        self.count(|r| r.method == Method::Get && r.url.contains("/v1/tasks/"))
    }

    pub fn image_count(&self) -> usize {
        self.count(|r| r.method == Method::Get && !r.url.contains("/v1/tasks/"))
    }

    fn next_reply(&self, req: &HttpRequest) -> Reply {
        let queue = match req.method {
            Method::Post => &self.submits,
            Method::Get if req.url.contains("/v1/tasks/") => &self.polls,
            Method::Get => &self.images,
        };
        let mut queue = queue.lock().unwrap();
        if queue.len() > 1 {
            queue.pop_front().unwrap()
        } else {
            queue
                .front()
                .cloned()
                .unwrap_or_else(|| Reply::Fail(TransportError::Other("unscripted request".into())))
        }
    }
}

impl Transport for ScriptedTransport {
    fn send(&self, req: HttpRequest) -> TransportFuture<'_> {
        let reply = self.next_reply(&req);
        self.requests.lock().unwrap().push(req);
        let latency = self.latency;
        Box::pin(async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            match reply {
                Reply::Respond { status, body } => Ok(HttpResponse { status, body }),
                Reply::Fail(e) => Err(e),
                Reply::Hang => std::future::pending().await,
            }
        })
    }
}

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn polled(&self, classification: Classification) -> usize {
        self.events()
            .iter()
            .filter(|e| e.kind == ProgressKind::Polled(classification))
            .count()
    }
}

impl ProgressSink for RecordingSink {
    fn report(&self, event: &ProgressEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| image::Rgb([x as u8, y as u8, 128]));
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}
