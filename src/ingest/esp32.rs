//! ESP32-CAM Wi-Fi source.
//!
//! The camera web server exposes either a `multipart/x-mixed-replace` MJPEG
//! stream or a single-JPEG snapshot endpoint; the response content type picks
//! the mode. MJPEG parts are located by their SOI/EOI markers rather than the
//! multipart boundary, which some firmware builds get wrong.

use anyhow::{anyhow, Context, Result};
use std::io::{ErrorKind, Read};
use std::time::{Duration, Instant};

use url::Url;

use super::SourceStats;

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct Esp32Config {
    /// Stream or snapshot URL (http or https).
    pub url: String,
    /// Target frame rate. Frames arriving faster are skipped. 0 disables decimation.
    pub target_fps: u32,
    pub read_timeout: Duration,
}

impl Default for Esp32Config {
    fn default() -> Self {
        Self {
            url: "http://192.168.4.1:81/stream".to_string(),
            target_fps: 0,
            read_timeout: Duration::from_secs(1),
        }
    }
}

pub struct Esp32Source {
    config: Esp32Config,
    agent: ureq::Agent,
    stream: Option<HttpStream>,
    last_capture: Option<Instant>,
    connected_at: Option<Instant>,
    captured: u64,
}

enum HttpStream {
    Mjpeg(MjpegStream),
    Snapshot,
}

impl Esp32Source {
    pub fn new(config: Esp32Config) -> Result<Self> {
        let url = Url::parse(&config.url).context("parse esp32 url")?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(anyhow!(
                "unsupported esp32 scheme '{}'; expected http(s)",
                url.scheme()
            ));
        }
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(5))
            .timeout_read(config.read_timeout)
            .build();
        Ok(Self {
            config,
            agent,
            stream: None,
            last_capture: None,
            connected_at: None,
            captured: 0,
        })
    }

    pub fn connect(&mut self) -> Result<()> {
        let response = self
            .agent
            .get(&self.config.url)
            .call()
            .with_context(|| format!("connect to esp32 at {}", self.config.url))?;
        let content_type = response.header("Content-Type").unwrap_or("");
        if content_type.to_ascii_lowercase().contains("multipart") {
            self.stream = Some(HttpStream::Mjpeg(MjpegStream::new(response.into_reader())));
            log::info!("Esp32Source: streaming MJPEG from {}", self.config.url);
        } else {
            self.stream = Some(HttpStream::Snapshot);
            log::info!("Esp32Source: polling snapshots from {}", self.config.url);
        }
        self.connected_at = Some(Instant::now());
        Ok(())
    }

    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| anyhow!("esp32 source not connected; call connect() first"))?;
        let jpeg = match stream {
            HttpStream::Mjpeg(stream) => stream.read_next_jpeg()?,
            HttpStream::Snapshot => Some(fetch_snapshot(&self.agent, &self.config.url)?),
        };
        let Some(jpeg) = jpeg else {
            return Ok(None);
        };

        let now = Instant::now();
        if let Some(last) = self.last_capture {
            if now.duration_since(last) < frame_interval(self.config.target_fps) {
                return Ok(None);
            }
        }
        self.captured += 1;
        self.last_capture = Some(now);
        Ok(Some(jpeg))
    }

    pub fn is_healthy(&self) -> bool {
        let Some(connected_at) = self.connected_at else {
            return false;
        };
        match self.last_capture {
            Some(at) => at.elapsed() <= Duration::from_secs(5),
            None => connected_at.elapsed() <= Duration::from_secs(5),
        }
    }

    pub fn stats(&self) -> SourceStats {
        SourceStats {
            source: self.config.url.clone(),
            frames_captured: self.captured,
            framing: None,
        }
    }
}

struct MjpegStream {
    reader: Box<dyn Read + Send + Sync>,
    buffer: Vec<u8>,
}

impl MjpegStream {
    fn new(reader: Box<dyn Read + Send + Sync>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    /// Next complete JPEG, or `None` if the read timed out first. Partial
    /// data stays buffered for the next call.
    fn read_next_jpeg(&mut self) -> Result<Option<Vec<u8>>> {
        let mut chunk = vec![0u8; 8192];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(Some(frame));
            }

            let read = match self.reader.read(&mut chunk) {
                Ok(read) => read,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if matches!(err.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                    return Ok(None)
                }
                Err(err) => return Err(anyhow::Error::new(err).context("read mjpeg chunk")),
            };
            if read == 0 {
                return Err(anyhow!("mjpeg stream ended"));
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                log::warn!(
                    "Esp32Source: no complete jpeg in {} buffered bytes, discarding",
                    self.buffer.len()
                );
                let keep = 2.min(self.buffer.len());
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

fn fetch_snapshot(agent: &ureq::Agent, url: &str) -> Result<Vec<u8>> {
    let response = agent
        .get(url)
        .call()
        .with_context(|| format!("fetch jpeg snapshot from {}", url))?;
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_JPEG_BYTES as u64 + 1)
        .read_to_end(&mut bytes)
        .context("read jpeg snapshot")?;
    if bytes.is_empty() {
        return Err(anyhow!("empty jpeg snapshot"));
    }
    if bytes.len() > MAX_JPEG_BYTES {
        return Err(anyhow!("jpeg snapshot exceeds {} bytes", MAX_JPEG_BYTES));
    }
    Ok(bytes)
}

/// Byte range of the first complete `FF D8 .. FF D9` image in `buffer`.
fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}

fn frame_interval(target_fps: u32) -> Duration {
    if target_fps == 0 {
        Duration::ZERO
    } else {
        Duration::from_millis((1000 / target_fps).max(1) as u64)
    }
}
