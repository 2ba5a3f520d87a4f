//! Session video sinks.
//!
//! Encoding to a compressed container is left to external tools; the built-in
//! sink writes a raw MJPEG stream (concatenated JPEG images), which common
//! players and `ffmpeg -f mjpeg` read directly.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];

pub trait VideoSink: Send {
    /// Append one encoded frame.
    fn append(&mut self, jpeg: &[u8]) -> std::io::Result<()>;

    /// Flush and close. Further appends are errors.
    fn finish(&mut self) -> std::io::Result<()>;

    fn frames_written(&self) -> u64;
}

pub struct MjpegVideoSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    frames: u64,
}

impl MjpegVideoSink {
    pub fn create(path: &Path) -> std::io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Some(BufWriter::new(file)),
            frames: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl VideoSink for MjpegVideoSink {
    fn append(&mut self, jpeg: &[u8]) -> std::io::Result<()> {
        let writer = self.writer.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "video sink finished")
        })?;
        // Anything without a JPEG start marker would corrupt the stream.
        if !jpeg.starts_with(&JPEG_SOI) {
            log::debug!(
                "video sink {}: skipping non-jpeg payload ({} bytes)",
                self.path.display(),
                jpeg.len()
            );
            return Ok(());
        }
        writer.write_all(jpeg)?;
        self.frames += 1;
        Ok(())
    }

    fn finish(&mut self) -> std::io::Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
            log::info!(
                "video sink {} finished ({} frames)",
                self.path.display(),
                self.frames
            );
        }
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.frames
    }
}
