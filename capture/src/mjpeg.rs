use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures_util::StreamExt;
use homecam_common::frame::Frame;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::source::{next_seq, ConnectError, FrameSource, LatestFeed, ReadError};

const DEFAULT_BOUNDARY: &str = "--frame";
const HEADER_END: &[u8] = b"\r\n\r\n";
/// Drop the parse buffer if a single part grows past this without a boundary.
const MAX_PART_BYTES: usize = 8 * 1024 * 1024;

/// Parse state for the MJPEG multipart stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    /// Looking for the boundary marker.
    SeekingBoundary,
    /// Found boundary, now looking for end of part headers `\r\n\r\n`.
    SeekingHeaderEnd,
    /// Collecting JPEG bytes until the next boundary.
    CollectingJpeg,
}

/// Incremental `multipart/x-mixed-replace` splitter. Feed it HTTP body
/// chunks as they arrive; it hands back every complete JPEG part.
pub struct MultipartParser {
    boundary: Vec<u8>,
    buffer: BytesMut,
    state: ParseState,
    jpeg_start: usize,
}

impl MultipartParser {
    pub fn new(boundary: &str) -> Self {
        let marker = if boundary.starts_with("--") {
            boundary.to_string()
        } else {
            format!("--{boundary}")
        };
        Self {
            boundary: marker.into_bytes(),
            buffer: BytesMut::with_capacity(256 * 1024),
            state: ParseState::SeekingBoundary,
            jpeg_start: 0,
        }
    }

    /// Build a parser from a `Content-Type` header value, falling back to
    /// `--frame` when no boundary parameter is present.
    pub fn from_content_type(content_type: Option<&str>) -> Self {
        let boundary = content_type
            .and_then(|ct| {
                ct.split(';')
                    .map(str::trim)
                    .find_map(|param| param.strip_prefix("boundary="))
            })
            .map(|b| b.trim_matches('"'))
            .filter(|b| !b.is_empty())
            .unwrap_or(DEFAULT_BOUNDARY);
        Self::new(boundary)
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(chunk);
        let mut parts = Vec::new();
        let boundary_len = self.boundary.len();

        loop {
            match self.state {
                ParseState::SeekingBoundary => {
                    if let Some(pos) = find_subsequence(&self.buffer, &self.boundary) {
                        let _ = self.buffer.split_to(pos + boundary_len);
                        self.state = ParseState::SeekingHeaderEnd;
                    } else {
                        // Keep the tail in case the boundary spans chunks.
                        if self.buffer.len() > boundary_len {
                            let _ = self.buffer.split_to(self.buffer.len() - boundary_len);
                        }
                        break;
                    }
                }
                ParseState::SeekingHeaderEnd => {
                    if let Some(pos) = find_subsequence(&self.buffer, HEADER_END) {
                        let _ = self.buffer.split_to(pos + HEADER_END.len());
                        self.jpeg_start = 0;
                        self.state = ParseState::CollectingJpeg;
                    } else {
                        break;
                    }
                }
                ParseState::CollectingJpeg => {
                    let Some(pos) = find_subsequence(&self.buffer[self.jpeg_start..], &self.boundary)
                    else {
                        if self.buffer.len() > MAX_PART_BYTES {
                            warn!(bytes = self.buffer.len(), "MJPEG part too large, resyncing");
                            self.buffer.clear();
                            self.state = ParseState::SeekingBoundary;
                        } else {
                            self.jpeg_start = self.buffer.len().saturating_sub(boundary_len);
                        }
                        break;
                    };

                    let jpeg_end = self.jpeg_start + pos;
                    // Strip trailing \r\n before boundary
                    let end = if self.buffer[..jpeg_end].ends_with(b"\r\n") {
                        jpeg_end - 2
                    } else {
                        jpeg_end
                    };
                    let part = self.buffer.split_to(jpeg_end + boundary_len).freeze();
                    if end > 0 {
                        parts.push(part.slice(..end));
                    }
                    self.state = ParseState::SeekingHeaderEnd;
                }
            }
        }

        parts
    }
}

/// HTTP MJPEG camera (`multipart/x-mixed-replace`).
pub struct MjpegSource {
    url: String,
    client: Option<reqwest::Client>,
    connect_timeout: Duration,
    feed: Option<LatestFeed<Bytes>>,
}

impl MjpegSource {
    pub fn new(url: &str, connect_timeout: Duration) -> Self {
        Self {
            url: url.to_string(),
            client: None,
            connect_timeout,
            feed: None,
        }
    }

    fn unavailable(&self, reason: impl ToString) -> ConnectError {
        ConnectError::StreamUnavailable {
            url: self.url.clone(),
            reason: reason.to_string(),
        }
    }

    fn client(&mut self) -> Result<reqwest::Client, ConnectError> {
        if let Some(client) = &self.client {
            return Ok(client.clone());
        }
        let client = reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .build()
            .map_err(|e| self.unavailable(e))?;
        self.client = Some(client.clone());
        Ok(client)
    }
}

impl FrameSource for MjpegSource {
    async fn connect(&mut self) -> Result<(), ConnectError> {
        if self.is_connected() {
            return Ok(());
        }
        self.feed = None;

        let client = self.client()?;
        let response = tokio::time::timeout(self.connect_timeout, client.get(&self.url).send())
            .await
            .map_err(|_| self.unavailable(format!("no response within {:?}", self.connect_timeout)))?
            .map_err(|e| self.unavailable(e))?;

        if !response.status().is_success() {
            return Err(self.unavailable(format!("HTTP status {}", response.status())));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let mut parser = MultipartParser::from_content_type(content_type.as_deref());

        info!(url = self.url, status = %response.status(), "connected to MJPEG stream");

        let url = self.url.clone();
        self.feed = Some(LatestFeed::spawn(move |tx: watch::Sender<Option<Bytes>>| async move {
            let mut body = response.bytes_stream();
            while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(url, error = %e, "MJPEG stream error");
                        return;
                    }
                };
                for jpeg in parser.push(&chunk) {
                    if tx.send(Some(jpeg)).is_err() {
                        return;
                    }
                }
            }
            info!(url, "MJPEG stream ended");
        }));
        Ok(())
    }

    async fn read_frame(&mut self) -> Result<Frame, ReadError> {
        let feed = self.feed.as_mut().ok_or(ReadError::StreamClosed)?;
        let Some(jpeg) = feed.next().await else {
            self.feed = None;
            return Err(ReadError::StreamClosed);
        };

        let captured_at_ms = Utc::now().timestamp_millis();
        let seq = next_seq();
        let bytes = jpeg.len();
        let frame = tokio::task::spawn_blocking(move || decode_jpeg(&jpeg, captured_at_ms, seq))
            .await
            .map_err(|e| ReadError::DecodeError(e.to_string()))??;
        debug!(seq, bytes, "decoded MJPEG frame");
        Ok(frame)
    }

    fn disconnect(&mut self) {
        if self.feed.take().is_some() {
            info!(url = self.url, "disconnected from MJPEG stream");
        }
    }

    fn is_connected(&self) -> bool {
        self.feed.as_ref().is_some_and(LatestFeed::is_alive)
    }

    fn label(&self) -> String {
        self.url.clone()
    }
}

fn decode_jpeg(jpeg: &[u8], captured_at_ms: i64, seq: u64) -> Result<Frame, ReadError> {
    let image = image::load_from_memory_with_format(jpeg, image::ImageFormat::Jpeg)
        .map_err(|e| ReadError::DecodeError(e.to_string()))?
        .to_rgb8();
    Ok(Frame::new(image, captured_at_ms, seq))
}

/// Find the position of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
