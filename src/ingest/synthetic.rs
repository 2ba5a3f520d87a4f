//! Synthetic source (`stub://`) for tests and demos.
//!
//! Emulates the ESP32 firmware: each frame is a freshly encoded JPEG pushed
//! through the serial wire format and read back, optionally with line noise
//! in front of the sync marker. Query parameters:
//!
//! - `frames=N`: stop after N frames (default: unbounded)
//! - `width=W`, `height=H`: frame size (default 64x48)
//! - `corrupt_every=K`: every K-th payload is garbage that will not decode
//! - `noise=B`: B junk bytes before each frame (default 0)
//! - `interval_ms=T`: sleep T ms before each frame (default 0)

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use rand::Rng;
use std::io::Cursor;
use std::time::Duration;
use url::Url;

use super::SourceStats;
use crate::framing::{write_frame, FrameReader, FrameReaderStats};

const MAX_SYNTHETIC_DIMENSION: u32 = 4096;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyntheticConfig {
    pub name: String,
    pub frames: Option<u64>,
    pub width: u32,
    pub height: u32,
    pub corrupt_every: Option<u64>,
    pub noise_bytes: usize,
    pub interval: Duration,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            name: "stub".to_string(),
            frames: None,
            width: 64,
            height: 48,
            corrupt_every: None,
            noise_bytes: 0,
            interval: Duration::ZERO,
        }
    }
}

impl SyntheticConfig {
    pub fn from_uri(uri: &str) -> Result<Self> {
        let url = Url::parse(uri).with_context(|| format!("parse stub source '{}'", uri))?;
        if url.scheme() != "stub" {
            return Err(anyhow!("expected stub:// source, got '{}'", uri));
        }
        let mut config = Self::default();
        if let Some(host) = url.host_str().filter(|h| !h.is_empty()) {
            config.name = host.to_string();
        }
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "frames" => config.frames = Some(stub_param(&key, &value)?),
                "width" => config.width = stub_param(&key, &value)?,
                "height" => config.height = stub_param(&key, &value)?,
                "corrupt_every" => {
                    let every: u64 = stub_param(&key, &value)?;
                    config.corrupt_every = (every > 0).then_some(every);
                }
                "noise" => config.noise_bytes = stub_param(&key, &value)?,
                "interval_ms" => {
                    config.interval = Duration::from_millis(stub_param(&key, &value)?)
                }
                other => log::warn!("SyntheticSource: ignoring unknown parameter '{}'", other),
            }
        }
        for (what, value) in [("width", config.width), ("height", config.height)] {
            if value == 0 || value > MAX_SYNTHETIC_DIMENSION {
                return Err(anyhow!(
                    "stub {} must be in 1..={}",
                    what,
                    MAX_SYNTHETIC_DIMENSION
                ));
            }
        }
        Ok(config)
    }
}

/// Parse one query value into its field's own type, so out-of-range numbers
/// are rejected instead of wrapping.
fn stub_param<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse::<T>()
        .with_context(|| format!("invalid stub parameter {}={}", key, value))
}

pub struct SyntheticSource {
    config: SyntheticConfig,
    frame_count: u64,
    framing: FrameReaderStats,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            frame_count: 0,
            framing: FrameReaderStats::default(),
        }
    }

    pub fn connect(&mut self) -> Result<()> {
        log::info!(
            "SyntheticSource: connected to stub://{} ({}x{})",
            self.config.name,
            self.config.width,
            self.config.height
        );
        Ok(())
    }

    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if self.is_exhausted() {
            return Ok(None);
        }
        if !self.config.interval.is_zero() {
            std::thread::sleep(self.config.interval);
        }

        let sequence = self.frame_count + 1;
        let payload = match self.config.corrupt_every {
            Some(every) if sequence % every == 0 => garbage_payload(sequence),
            _ => self.encode_jpeg(sequence)?,
        };

        let mut wire = Vec::with_capacity(self.config.noise_bytes + payload.len() + 6);
        let mut rng = rand::thread_rng();
        for _ in 0..self.config.noise_bytes {
            // Never 0xAA, so noise cannot start a false sync.
            wire.push(rng.gen_range(0x00..0xAA));
        }
        write_frame(&mut wire, &payload)?;

        let mut reader = FrameReader::new(Cursor::new(wire));
        let frame = reader.read_next_frame()?;
        let stats = reader.stats();
        self.framing.frames_read += stats.frames_read;
        self.framing.bytes_discarded += stats.bytes_discarded;

        self.frame_count = sequence;
        Ok(Some(frame))
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self.config.frames, Some(limit) if self.frame_count >= limit)
    }

    pub fn stats(&self) -> SourceStats {
        SourceStats {
            source: format!("stub://{}", self.config.name),
            frames_captured: self.frame_count,
            framing: Some(self.framing),
        }
    }

    fn encode_jpeg(&self, sequence: u64) -> Result<Vec<u8>> {
        let (width, height) = (self.config.width, self.config.height);
        let mut pixels = Vec::with_capacity((width * height * 3) as usize);
        let phase = (sequence.wrapping_mul(37) % 256) as u32;
        for y in 0..height {
            for x in 0..width {
                pixels.push(((x * 3 + phase) % 256) as u8);
                pixels.push(((y * 5 + phase * 2) % 256) as u8);
                pixels.push(((x + y + phase * 3) % 256) as u8);
            }
        }
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, 85)
            .encode(&pixels, width, height, ExtendedColorType::Rgb8)
            .context("encode synthetic jpeg")?;
        Ok(out)
    }
}

fn garbage_payload(sequence: u64) -> Vec<u8> {
    let mut payload = b"corrupt frame ".to_vec();
    payload.extend_from_slice(&sequence.to_le_bytes());
    payload
}
