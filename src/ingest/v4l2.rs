//! V4L2 webcam source.
//!
//! The device is switched to MJPG so every buffer already holds a JPEG; the
//! payload is the first `bytesused` bytes of the mapped buffer.

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;
use std::time::{Duration, Instant};

use super::SourceStats;

#[derive(Clone, Debug)]
pub struct V4l2Config {
    /// Device path (e.g., "/dev/video0")
    pub device: String,
    /// Requested frame rate. 0 keeps the driver default.
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
}

impl Default for V4l2Config {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            target_fps: 0,
            width: 640,
            height: 480,
        }
    }
}

pub struct V4l2Source {
    config: V4l2Config,
    state: Option<DeviceState>,
    captured: u64,
    last_capture: Option<Instant>,
    fault: Option<String>,
}

#[self_referencing]
struct DeviceState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Source {
    pub fn new(config: V4l2Config) -> Self {
        Self {
            config,
            state: None,
            captured: 0,
            last_capture: None,
            fault: None,
        }
    }

    pub fn connect(&mut self) -> Result<()> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let mut device = v4l::Device::with_path(&self.config.device)
            .with_context(|| format!("open v4l2 device {}", self.config.device))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = self.config.width;
        format.height = self.config.height;
        format.fourcc = v4l::FourCC::new(b"MJPG");

        let format = device
            .set_format(&format)
            .with_context(|| format!("set MJPG format on {}", self.config.device))?;
        if format.fourcc != v4l::FourCC::new(b"MJPG") {
            return Err(anyhow!(
                "{} does not support MJPG capture (driver chose {})",
                self.config.device,
                format.fourcc
            ));
        }

        if self.config.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(self.config.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!(
                    "{}: driver rejected {} fps: {}",
                    self.config.device,
                    self.config.target_fps,
                    err
                );
            }
        }

        let state = DeviceStateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()
        .map_err(|err| {
            self.fault = Some(err.to_string());
            err
        })?;
        self.state = Some(state);
        self.fault = None;

        log::info!(
            "V4l2Source: connected to {} ({}x{} MJPG)",
            self.config.device,
            format.width,
            format.height
        );
        Ok(())
    }

    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        use v4l::io::traits::CaptureStream;

        let state = self.state.as_mut().context("v4l2 device not connected")?;
        let jpeg = state
            .with_mut(|fields| {
                fields.stream.next().map(|(buf, meta)| {
                    let used = (meta.bytesused as usize).min(buf.len());
                    buf[..used].to_vec()
                })
            })
            .map_err(|err| {
                self.fault = Some(err.to_string());
                anyhow::Error::new(err).context("capture v4l2 frame")
            })?;

        if jpeg.is_empty() {
            return Ok(None);
        }
        self.captured += 1;
        self.last_capture = Some(Instant::now());
        Ok(Some(jpeg))
    }

    pub fn is_healthy(&self) -> bool {
        if self.fault.is_some() {
            return false;
        }
        match self.last_capture {
            Some(at) => at.elapsed() <= Duration::from_secs(2),
            None => self.state.is_some(),
        }
    }

    pub fn stats(&self) -> SourceStats {
        SourceStats {
            source: self.config.device.clone(),
            frames_captured: self.captured,
            framing: None,
        }
    }
}
