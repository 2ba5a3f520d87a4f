//! Replay of a recorded serial capture.
//!
//! A capture file is the raw byte stream from the ESP32 (as saved by
//! `frame_inspect --record`): framed JPEGs, possibly with line noise between
//! frames. Replay goes through the same [`FrameReader`] as a live port, so a
//! corrupted recording exercises the same resynchronization path.

use anyhow::{anyhow, Context, Result};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use super::SourceStats;
use crate::framing::FrameReader;

pub struct ReplaySource {
    path: PathBuf,
    reader: Option<FrameReader<BufReader<File>>>,
    frame_count: u64,
}

impl ReplaySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            reader: None,
            frame_count: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn connect(&mut self) -> Result<()> {
        let file = File::open(&self.path)
            .with_context(|| format!("open capture file {}", self.path.display()))?;
        self.reader = Some(FrameReader::new(BufReader::new(file)));
        log::info!("ReplaySource: replaying {}", self.path.display());
        Ok(())
    }

    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| anyhow!("replay source not connected; call connect() first"))?;
        let frame = reader.poll_frame()?;
        if frame.is_some() {
            self.frame_count += 1;
        }
        Ok(frame)
    }

    pub fn is_exhausted(&self) -> bool {
        self.reader
            .as_ref()
            .map(|reader| reader.is_exhausted())
            .unwrap_or(false)
    }

    pub fn stats(&self) -> SourceStats {
        SourceStats {
            source: format!("file://{}", self.path.display()),
            frames_captured: self.frame_count,
            framing: self.reader.as_ref().map(|reader| reader.stats()),
        }
    }
}
