//! Serial frame deserializer.
//!
//! Wire format (bit-exact, shared with the ESP32 firmware):
//!
//! ```text
//! byte 0        : 0xAA   sync 1
//! byte 1        : 0x55   sync 2
//! bytes 2..6    : u32 little-endian payload length N
//! bytes 6..6+N  : payload (JPEG, opaque here)
//! ```
//!
//! There is no checksum. A corrupted payload is only detected downstream when
//! the image fails to decode. A frame whose body cannot be read in full is a
//! `ShortRead`; the reader then discards what it has and resumes scanning for
//! the next sync marker. The declared length of a failed frame is never reused.

use std::io::{ErrorKind, Read, Write};

use crate::error::EngagementError;

pub const SYNC_BYTES: [u8; 2] = [0xAA, 0x55];

/// Sync marker plus length field.
pub const HEADER_LEN: usize = 6;

/// Upper bound on a declared payload length. Larger declarations are treated
/// as line noise and never allocated.
pub const MAX_FRAME_BYTES: u32 = 5 * 1024 * 1024;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameReaderStats {
    pub frames_read: u64,
    /// Bytes skipped while hunting for a sync marker.
    pub bytes_discarded: u64,
    pub short_reads: u64,
    pub oversized_frames: u64,
}

enum ByteRead {
    Byte(u8),
    Idle,
    Eof,
}

/// Extracts framed payloads from a byte stream.
///
/// Read timeouts (`TimedOut` / `WouldBlock`) while hunting for a header are
/// reported as "no frame yet" by [`FrameReader::poll_frame`], so a capture loop
/// can check for cancellation between polls. A half-seen sync marker survives
/// across polls.
pub struct FrameReader<R> {
    inner: R,
    saw_first_sync: bool,
    exhausted: bool,
    failed: bool,
    stats: FrameReaderStats,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            saw_first_sync: false,
            exhausted: false,
            failed: false,
            stats: FrameReaderStats::default(),
        }
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    pub fn stats(&self) -> FrameReaderStats {
        self.stats
    }

    /// True once the underlying stream reported end-of-file.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Try to read one frame.
    ///
    /// Returns `Ok(None)` when the transport timed out before a header arrived
    /// or the stream is exhausted. Framing failures are returned as errors and
    /// leave the reader positioned to resynchronize on the next call.
    pub fn poll_frame(&mut self) -> Result<Option<Vec<u8>>, EngagementError> {
        if !self.scan_for_sync()? {
            return Ok(None);
        }
        match self.read_body() {
            Ok(payload) => {
                self.stats.frames_read += 1;
                Ok(Some(payload))
            }
            Err(err) => {
                match &err {
                    EngagementError::ShortRead { .. } => self.stats.short_reads += 1,
                    EngagementError::FrameTooLarge(_) => self.stats.oversized_frames += 1,
                    _ => {}
                }
                Err(err)
            }
        }
    }

    /// Block until a complete frame is read.
    ///
    /// Fails with `StreamClosed` when the stream ends between frames and with
    /// `ShortRead` when it ends (or times out) inside one.
    pub fn read_next_frame(&mut self) -> Result<Vec<u8>, EngagementError> {
        loop {
            if let Some(frame) = self.poll_frame()? {
                return Ok(frame);
            }
            if self.exhausted {
                return Err(EngagementError::StreamClosed);
            }
        }
    }

    /// Lazy sequence of frames. Recoverable framing errors are yielded as
    /// `Err` items and iteration continues; the sequence ends at end-of-stream
    /// or after an I/O error.
    pub fn frames(&mut self) -> Frames<'_, R> {
        Frames { reader: self }
    }

    fn scan_for_sync(&mut self) -> Result<bool, EngagementError> {
        loop {
            let byte = match self.read_byte()? {
                ByteRead::Byte(byte) => byte,
                ByteRead::Idle => return Ok(false),
                ByteRead::Eof => {
                    self.exhausted = true;
                    if self.saw_first_sync {
                        self.saw_first_sync = false;
                        self.stats.bytes_discarded += 1;
                    }
                    return Ok(false);
                }
            };

            if self.saw_first_sync {
                if byte == SYNC_BYTES[1] {
                    self.saw_first_sync = false;
                    return Ok(true);
                }
                // Lone 0xAA: drop it and re-examine this byte as a fresh candidate.
                self.stats.bytes_discarded += 1;
                self.saw_first_sync = false;
            }

            if byte == SYNC_BYTES[0] {
                self.saw_first_sync = true;
            } else {
                self.stats.bytes_discarded += 1;
            }
        }
    }

    fn read_body(&mut self) -> Result<Vec<u8>, EngagementError> {
        let mut len_buf = [0u8; 4];
        let received = self.fill(&mut len_buf)?;
        if received < len_buf.len() {
            return Err(EngagementError::ShortRead {
                expected: len_buf.len(),
                received,
            });
        }

        let declared = u32::from_le_bytes(len_buf);
        if declared > MAX_FRAME_BYTES {
            return Err(EngagementError::FrameTooLarge(declared));
        }

        let mut payload = vec![0u8; declared as usize];
        let received = self.fill(&mut payload)?;
        if received < payload.len() {
            return Err(EngagementError::ShortRead {
                expected: payload.len(),
                received,
            });
        }
        Ok(payload)
    }

    fn read_byte(&mut self) -> Result<ByteRead, EngagementError> {
        let mut byte = [0u8; 1];
        loop {
            match self.inner.read(&mut byte) {
                Ok(0) => return Ok(ByteRead::Eof),
                Ok(_) => return Ok(ByteRead::Byte(byte[0])),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if is_timeout(&err) => return Ok(ByteRead::Idle),
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Read until `buf` is full, the stream ends, or the transport times out.
    fn fill(&mut self, buf: &mut [u8]) -> Result<usize, EngagementError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => {
                    self.exhausted = true;
                    break;
                }
                Ok(n) => filled += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if is_timeout(&err) => break,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(filled)
    }
}

/// Iterator returned by [`FrameReader::frames`].
pub struct Frames<'a, R> {
    reader: &'a mut FrameReader<R>,
}

impl<R: Read> Iterator for Frames<'_, R> {
    type Item = Result<Vec<u8>, EngagementError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.reader.failed {
            return None;
        }
        loop {
            match self.reader.poll_frame() {
                Ok(Some(frame)) => return Some(Ok(frame)),
                Ok(None) if self.reader.exhausted => return None,
                Ok(None) => continue,
                Err(err) if err.is_recoverable_framing() => return Some(Err(err)),
                Err(err) => {
                    self.reader.failed = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

/// Read exactly one frame from `stream`.
///
/// Convenience wrapper over [`FrameReader::read_next_frame`]; a sync byte seen
/// at the very end of a failed call is not remembered by the next one.
pub fn read_next_frame<R: Read>(stream: &mut R) -> Result<Vec<u8>, EngagementError> {
    FrameReader::new(stream).read_next_frame()
}

/// Encode `payload` with the sync marker and length header.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), EngagementError> {
    let len = u32::try_from(payload.len()).map_err(|_| EngagementError::FrameTooLarge(u32::MAX))?;
    if len > MAX_FRAME_BYTES {
        return Err(EngagementError::FrameTooLarge(len));
    }
    let mut header = [0u8; HEADER_LEN];
    header[..2].copy_from_slice(&SYNC_BYTES);
    header[2..].copy_from_slice(&len.to_le_bytes());
    writer.write_all(&header)?;
    writer.write_all(payload)?;
    Ok(())
}

fn is_timeout(err: &std::io::Error) -> bool {
    matches!(err.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock)
}
