//! Capture sources.
//!
//! Every source yields encoded JPEG payloads; decoding happens later in
//! [`crate::classify`]. Sources are selected from a URI-ish string:
//!
//! - `serial:///dev/ttyUSB0?baud=115200` (feature: ingest-serial): ESP32 over
//!   USB serial, `AA 55 | len | payload` framing
//! - `http://host/stream` (feature: ingest-esp32): ESP32-CAM over Wi-Fi,
//!   MJPEG multipart stream or single-JPEG snapshot endpoint
//! - `/dev/videoN` (feature: ingest-v4l2): USB webcam in MJPG mode
//! - `file://capture.bin` or a bare path: replay of a recorded serial capture
//! - `stub://name?frames=N`: synthetic JPEGs
//!
//! `next_frame` returns `Ok(None)` when nothing arrived before the source's
//! read timeout, so the capture loop can re-check its stop flag. Recoverable
//! framing errors are returned as [`EngagementError`] values inside the
//! `anyhow::Error` and can be recovered with `downcast_ref`.

#[cfg(feature = "ingest-esp32")]
pub mod esp32;
pub mod replay;
#[cfg(feature = "ingest-serial")]
pub mod serial;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::framing::FrameReaderStats;

#[cfg(feature = "ingest-esp32")]
pub use esp32::{Esp32Config, Esp32Source};
pub use replay::ReplaySource;
#[cfg(feature = "ingest-serial")]
pub use serial::{SerialConfig, SerialSource};
pub use synthetic::{SyntheticConfig, SyntheticSource};
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::{V4l2Config, V4l2Source};

pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Knobs shared by all sources.
#[derive(Clone, Debug)]
pub struct SourceOptions {
    /// How long a single read may block before `next_frame` returns `Ok(None)`.
    pub read_timeout: Duration,
    /// Decimation target for camera sources. 0 disables decimation.
    pub target_fps: u32,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(1),
            target_fps: 0,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SourceStats {
    pub source: String,
    pub frames_captured: u64,
    /// Framing counters, for sources that read the serial wire format.
    pub framing: Option<FrameReaderStats>,
}

/// A configured capture source.
pub enum CaptureSource {
    #[cfg(feature = "ingest-serial")]
    Serial(SerialSource),
    #[cfg(feature = "ingest-esp32")]
    Esp32(Esp32Source),
    #[cfg(feature = "ingest-v4l2")]
    V4l2(V4l2Source),
    Replay(ReplaySource),
    Synthetic(SyntheticSource),
}

impl CaptureSource {
    /// Build a source from `uri` with default options.
    pub fn from_uri(uri: &str) -> Result<Self> {
        Self::open(uri, &SourceOptions::default())
    }

    /// Build a source from `uri`. Nothing is opened until [`connect`](Self::connect).
    pub fn open(uri: &str, options: &SourceOptions) -> Result<Self> {
        let uri = uri.trim();
        if uri.is_empty() {
            return Err(anyhow!("capture source is empty"));
        }

        match SourceKind::parse(uri)? {
            SourceKind::Synthetic => Ok(Self::Synthetic(SyntheticSource::new(
                SyntheticConfig::from_uri(uri)?,
            ))),
            SourceKind::Replay(path) => Ok(Self::Replay(ReplaySource::new(path))),
            SourceKind::Serial { path, baud } => open_serial(path, baud, options),
            SourceKind::Http => open_esp32(uri, options),
            SourceKind::V4l2(device) => open_v4l2(device, options),
        }
    }

    pub fn connect(&mut self) -> Result<()> {
        match self {
            #[cfg(feature = "ingest-serial")]
            Self::Serial(source) => source.connect(),
            #[cfg(feature = "ingest-esp32")]
            Self::Esp32(source) => source.connect(),
            #[cfg(feature = "ingest-v4l2")]
            Self::V4l2(source) => source.connect(),
            Self::Replay(source) => source.connect(),
            Self::Synthetic(source) => source.connect(),
        }
    }

    /// Next encoded frame, or `None` if none arrived within the read timeout.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        match self {
            #[cfg(feature = "ingest-serial")]
            Self::Serial(source) => source.next_frame(),
            #[cfg(feature = "ingest-esp32")]
            Self::Esp32(source) => source.next_frame(),
            #[cfg(feature = "ingest-v4l2")]
            Self::V4l2(source) => source.next_frame(),
            Self::Replay(source) => source.next_frame(),
            Self::Synthetic(source) => source.next_frame(),
        }
    }

    /// True once a finite source (replay, bounded stub) has nothing left.
    pub fn is_exhausted(&self) -> bool {
        match self {
            #[cfg(feature = "ingest-serial")]
            Self::Serial(source) => source.is_exhausted(),
            #[cfg(feature = "ingest-esp32")]
            Self::Esp32(_) => false,
            #[cfg(feature = "ingest-v4l2")]
            Self::V4l2(_) => false,
            Self::Replay(source) => source.is_exhausted(),
            Self::Synthetic(source) => source.is_exhausted(),
        }
    }

    pub fn stats(&self) -> SourceStats {
        match self {
            #[cfg(feature = "ingest-serial")]
            Self::Serial(source) => source.stats(),
            #[cfg(feature = "ingest-esp32")]
            Self::Esp32(source) => source.stats(),
            #[cfg(feature = "ingest-v4l2")]
            Self::V4l2(source) => source.stats(),
            Self::Replay(source) => source.stats(),
            Self::Synthetic(source) => source.stats(),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum SourceKind {
    Synthetic,
    Replay(PathBuf),
    Serial { path: String, baud: u32 },
    Http,
    V4l2(String),
}

impl SourceKind {
    fn parse(uri: &str) -> Result<Self> {
        if uri.starts_with("stub://") {
            return Ok(Self::Synthetic);
        }
        if uri.starts_with("/dev/video") {
            return Ok(Self::V4l2(uri.to_string()));
        }
        if is_bare_serial_device(uri) {
            return Ok(Self::Serial {
                path: uri.to_string(),
                baud: DEFAULT_BAUD_RATE,
            });
        }
        if !uri.contains("://") {
            return Ok(Self::Replay(PathBuf::from(uri)));
        }

        let url = Url::parse(uri).with_context(|| format!("parse capture source '{}'", uri))?;
        match url.scheme() {
            "http" | "https" => Ok(Self::Http),
            "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|_| anyhow!("file source '{}' is not a local path", uri))?;
                Ok(Self::Replay(path))
            }
            "serial" => {
                let mut path = String::new();
                if let Some(host) = url.host_str() {
                    path.push_str(host);
                }
                path.push_str(url.path());
                if path.is_empty() {
                    return Err(anyhow!("serial source '{}' has no device path", uri));
                }
                let baud = match url.query_pairs().find(|(key, _)| key == "baud") {
                    Some((_, value)) => value
                        .parse::<u32>()
                        .with_context(|| format!("invalid baud rate '{}'", value))?,
                    None => DEFAULT_BAUD_RATE,
                };
                if baud == 0 {
                    return Err(anyhow!("baud rate must be positive"));
                }
                Ok(Self::Serial { path, baud })
            }
            other => Err(anyhow!(
                "unsupported capture source scheme '{}'; expected serial, http(s), file, or stub",
                other
            )),
        }
    }
}

fn is_bare_serial_device(uri: &str) -> bool {
    uri.starts_with("/dev/tty")
        || uri.starts_with("/dev/cu.")
        || match (uri.get(..3), uri.get(3..)) {
            (Some(prefix), Some(number)) => {
                prefix.eq_ignore_ascii_case("com")
                    && !number.is_empty()
                    && number.chars().all(|c| c.is_ascii_digit())
            }
            _ => false,
        }
}

#[cfg(feature = "ingest-serial")]
fn open_serial(path: String, baud: u32, options: &SourceOptions) -> Result<CaptureSource> {
    Ok(CaptureSource::Serial(SerialSource::new(SerialConfig {
        path,
        baud,
        read_timeout: options.read_timeout,
    })))
}

#[cfg(not(feature = "ingest-serial"))]
fn open_serial(path: String, _baud: u32, _options: &SourceOptions) -> Result<CaptureSource> {
    Err(anyhow!(
        "serial source {} requires the ingest-serial feature",
        path
    ))
}

#[cfg(feature = "ingest-esp32")]
fn open_esp32(uri: &str, options: &SourceOptions) -> Result<CaptureSource> {
    Ok(CaptureSource::Esp32(Esp32Source::new(Esp32Config {
        url: uri.to_string(),
        target_fps: options.target_fps,
        read_timeout: options.read_timeout,
    })?))
}

#[cfg(not(feature = "ingest-esp32"))]
fn open_esp32(uri: &str, _options: &SourceOptions) -> Result<CaptureSource> {
    Err(anyhow!(
        "http source {} requires the ingest-esp32 feature",
        uri
    ))
}

#[cfg(feature = "ingest-v4l2")]
fn open_v4l2(device: String, options: &SourceOptions) -> Result<CaptureSource> {
    Ok(CaptureSource::V4l2(V4l2Source::new(V4l2Config {
        device,
        target_fps: options.target_fps,
        ..V4l2Config::default()
    })))
}

#[cfg(not(feature = "ingest-v4l2"))]
fn open_v4l2(device: String, _options: &SourceOptions) -> Result<CaptureSource> {
    Err(anyhow!(
        "webcam source {} requires the ingest-v4l2 feature",
        device
    ))
}
