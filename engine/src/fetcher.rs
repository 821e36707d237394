use std::io::Cursor;

use bytes::Bytes;
use image::{DynamicImage, ImageFormat};
use log::{debug, info};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    budget::{Interrupt, race},
    error::{FetchError, GenerationError, TransportError},
    options::Settings,
    transport::{HttpRequest, Transport},
};

/// A downloaded, decoded result image.
#[derive(Debug, Clone)]
pub struct ImageArtifact {
    pub image: DynamicImage,
    /// The bytes exactly as served.
    pub bytes: Bytes,
    pub mime: &'static str,
    pub source_url: String,
}

impl ImageArtifact {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// PNG encoding of the image, for saving. PNG sources are passed through.
    pub fn to_png(&self) -> Result<Vec<u8>, FetchError> {
        if self.mime == ImageFormat::Png.to_mime_type() {
            return Ok(self.bytes.to_vec());
        }
        let mut buf = Vec::new();
        self.image
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .map_err(|e| FetchError::Encode(e.to_string()))?;
        Ok(buf)
    }
}

pub struct Fetcher<'a> {
    transport: &'a dyn Transport,
    settings: &'a Settings,
}

impl<'a> Fetcher<'a> {
    pub fn new(transport: &'a dyn Transport, settings: &'a Settings) -> Self {
        Self {
            transport,
            settings,
        }
    }

    /// Downloads and decodes `url`. The URL is pre-signed, so no credential
    /// goes with it. Gives up at `deadline` at the latest.
    pub async fn fetch(
        &self,
        url: &str,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<ImageArtifact, GenerationError> {
        let timeout = self
            .settings
            .fetch_timeout
            .min(deadline.saturating_duration_since(Instant::now()));
        if timeout.is_zero() {
            return Err(FetchError::Timeout.into());
        }

        info!("Downloading result image from {url}");
        let req = HttpRequest::get(url, timeout);
        let resp = match race(cancel, deadline, self.transport.send(req)).await {
            Err(Interrupt::Cancelled) => return Err(GenerationError::Cancelled),
            Err(Interrupt::DeadlineExceeded) | Ok(Err(TransportError::Timeout)) => {
                return Err(FetchError::Timeout.into());
            }
            Ok(Err(e)) => return Err(FetchError::Network(e.to_string()).into()),
            Ok(Ok(resp)) => resp,
        };

        if !resp.is_success() {
            return Err(FetchError::Http {
                status: resp.status,
            }
            .into());
        }

        let (image, mime) = decode(&resp.body)?;
        debug!(
            "Decoded {mime} image {}x{} ({} bytes)",
            image.width(),
            image.height(),
            resp.body.len()
        );
        Ok(ImageArtifact {
            image,
            bytes: resp.body,
            mime,
            source_url: url.to_string(),
        })
    }
}

fn decode(bytes: &[u8]) -> Result<(DynamicImage, &'static str), FetchError> {
    let format = image::guess_format(bytes)?;
    let image = image::load_from_memory_with_format(bytes, format)?;
    Ok((image, format.to_mime_type()))
}
