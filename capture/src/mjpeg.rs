use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::time::Duration;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::source::{CaptureError, CaptureSource, CapturedFrame};

const BOUNDARY: &[u8] = b"--frame\r\n";
const HEADER_END: &[u8] = b"\r\n\r\n";

/// Parse state for the MJPEG multipart stream.
enum ParseState {
    /// Looking for the boundary marker `--frame\r\n`.
    SeekingBoundary,
    /// Found boundary, now looking for end of part headers `\r\n\r\n`.
    SeekingHeaderEnd,
    /// Collecting JPEG bytes until the next boundary.
    CollectingJpeg,
}

/// Incremental splitter for `multipart/x-mixed-replace` MJPEG bodies.
pub struct MjpegParser {
    buffer: BytesMut,
    state: ParseState,
    /// Offset already scanned for a boundary while collecting.
    scan_from: usize,
}

impl MjpegParser {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(256 * 1024),
            state: ParseState::SeekingBoundary,
            scan_from: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// The next complete JPEG in the buffered bytes, if one has arrived.
    pub fn next_jpeg(&mut self) -> Option<Bytes> {
        loop {
            match self.state {
                ParseState::SeekingBoundary => {
                    if let Some(pos) = find_subsequence(&self.buffer, BOUNDARY) {
                        let _ = self.buffer.split_to(pos + BOUNDARY.len());
                        self.state = ParseState::SeekingHeaderEnd;
                    } else {
                        // Keep a tail in case the boundary spans chunks.
                        if self.buffer.len() > BOUNDARY.len() {
                            let _ = self.buffer.split_to(self.buffer.len() - BOUNDARY.len());
                        }
                        return None;
                    }
                }
                ParseState::SeekingHeaderEnd => {
                    let pos = find_subsequence(&self.buffer, HEADER_END)?;
                    let _ = self.buffer.split_to(pos + HEADER_END.len());
                    self.scan_from = 0;
                    self.state = ParseState::CollectingJpeg;
                }
                ParseState::CollectingJpeg => {
                    let Some(pos) = find_subsequence(&self.buffer[self.scan_from..], BOUNDARY)
                    else {
                        self.scan_from = self.buffer.len().saturating_sub(BOUNDARY.len());
                        return None;
                    };
                    let jpeg_end = self.scan_from + pos;
                    // Strip the CRLF that precedes the boundary.
                    let end = if self.buffer[..jpeg_end].ends_with(b"\r\n") {
                        jpeg_end - 2
                    } else {
                        jpeg_end
                    };
                    let part = self.buffer.split_to(jpeg_end + BOUNDARY.len()).freeze();
                    self.state = ParseState::SeekingHeaderEnd;
                    if end > 0 {
                        return Some(part.slice(..end));
                    }
                }
            }
        }
    }
}

impl Default for MjpegParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Long-lived MJPEG HTTP stream. The connection is opened lazily and dropped
/// on any error; the next pull reconnects.
pub struct MjpegSource {
    url: String,
    client: reqwest::Client,
    stream: Option<BoxStream<'static, reqwest::Result<Bytes>>>,
    parser: MjpegParser,
}

impl MjpegSource {
    pub fn new(url: String) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            url,
            client,
            stream: None,
            parser: MjpegParser::new(),
        }
    }

    async fn connect(&mut self) -> Result<(), CaptureError> {
        info!(url = self.url, "connecting to MJPEG stream");
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| CaptureError::Connect(e.to_string()))?;
        if !response.status().is_success() {
            return Err(CaptureError::HttpStatus(response.status().as_u16()));
        }
        info!(status = %response.status(), "connected to MJPEG stream");
        self.stream = Some(response.bytes_stream().boxed());
        self.parser = MjpegParser::new();
        Ok(())
    }
}

#[async_trait]
impl CaptureSource for MjpegSource {
    async fn next_frame(&mut self) -> Result<CapturedFrame, CaptureError> {
        if self.stream.is_none() {
            self.connect().await?;
        }
        loop {
            if let Some(jpeg) = self.parser.next_jpeg() {
                debug!(bytes = jpeg.len(), "MJPEG frame parsed");
                return Ok(CapturedFrame::jpeg(jpeg));
            }
            let Some(stream) = self.stream.as_mut() else {
                return Err(CaptureError::EndOfStream);
            };
            match stream.next().await {
                Some(Ok(chunk)) => self.parser.push(&chunk),
                Some(Err(e)) => {
                    self.stream = None;
                    return Err(CaptureError::Stream(e.to_string()));
                }
                None => {
                    self.stream = None;
                    return Err(CaptureError::EndOfStream);
                }
            }
        }
    }

    fn name(&self) -> &str {
        "mjpeg"
    }
}

/// Snapshot polling fallback: fetches one JPEG per tick.
pub struct PollingSource {
    url: String,
    client: reqwest::Client,
    ticker: Interval,
}

impl PollingSource {
    pub fn new(url: String, interval: Duration) -> Self {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            url,
            client: reqwest::Client::new(),
            ticker,
        }
    }
}

#[async_trait]
impl CaptureSource for PollingSource {
    async fn next_frame(&mut self) -> Result<CapturedFrame, CaptureError> {
        self.ticker.tick().await;
        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| CaptureError::Connect(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(CaptureError::HttpStatus(resp.status().as_u16()));
        }
        let jpeg = resp
            .bytes()
            .await
            .map_err(|e| CaptureError::Stream(e.to_string()))?;
        Ok(CapturedFrame::jpeg(jpeg))
    }

    fn name(&self) -> &str {
        "polling"
    }
}

/// Find the position of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
