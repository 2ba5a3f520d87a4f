//! USB-serial ESP32 source.
//!
//! The firmware writes one framed JPEG per capture (`AA 55 | len32le | jpeg`).
//! The port is opened with a short read timeout so the capture loop regains
//! control at least once per timeout even when the camera is silent.

use anyhow::{anyhow, Context, Result};
use std::time::{Duration, Instant};

use super::SourceStats;
use crate::framing::FrameReader;

#[derive(Clone, Debug)]
pub struct SerialConfig {
    /// Device path (e.g., "/dev/ttyUSB0" or "COM3").
    pub path: String,
    pub baud: u32,
    pub read_timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            path: "/dev/ttyUSB0".to_string(),
            baud: super::DEFAULT_BAUD_RATE,
            read_timeout: Duration::from_secs(1),
        }
    }
}

pub struct SerialSource {
    config: SerialConfig,
    reader: Option<FrameReader<Box<dyn serialport::SerialPort>>>,
    frame_count: u64,
    last_frame_at: Option<Instant>,
}

impl SerialSource {
    pub fn new(config: SerialConfig) -> Self {
        Self {
            config,
            reader: None,
            frame_count: 0,
            last_frame_at: None,
        }
    }

    pub fn connect(&mut self) -> Result<()> {
        let port = serialport::new(&self.config.path, self.config.baud)
            .timeout(self.config.read_timeout)
            .open()
            .with_context(|| {
                format!(
                    "open serial port {} at {} baud",
                    self.config.path, self.config.baud
                )
            })?;
        if let Err(err) = port.clear(serialport::ClearBuffer::Input) {
            log::warn!("SerialSource: could not flush {}: {}", self.config.path, err);
        }
        self.reader = Some(FrameReader::new(port));
        log::info!(
            "SerialSource: connected to {} at {} baud",
            self.config.path,
            self.config.baud
        );
        Ok(())
    }

    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| anyhow!("serial source not connected; call connect() first"))?;
        let frame = reader.poll_frame()?;
        if frame.is_some() {
            self.frame_count += 1;
            self.last_frame_at = Some(Instant::now());
        } else if reader.is_exhausted() {
            return Err(anyhow!("serial port {} closed", self.config.path));
        }
        Ok(frame)
    }

    pub fn is_exhausted(&self) -> bool {
        self.reader
            .as_ref()
            .map(|reader| reader.is_exhausted())
            .unwrap_or(false)
    }

    /// True when a frame arrived within the last few timeouts.
    pub fn is_healthy(&self) -> bool {
        match self.last_frame_at {
            Some(at) => at.elapsed() <= self.config.read_timeout.saturating_mul(5),
            None => self.reader.is_some(),
        }
    }

    pub fn stats(&self) -> SourceStats {
        SourceStats {
            source: format!("serial://{}?baud={}", self.config.path, self.config.baud),
            frames_captured: self.frame_count,
            framing: self.reader.as_ref().map(|reader| reader.stats()),
        }
    }
}
