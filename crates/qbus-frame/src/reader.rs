use std::io::{ErrorKind, Read};

use crate::codec::{FrameDecoder, DEFAULT_MAX_PAYLOAD};
use crate::error::{FrameError, Result};
use crate::frame::Frame;

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Reads complete frames from any `Read` stream.
///
/// Handles partial reads internally — callers always get complete frames.
/// Bytes read past a frame boundary are retained and drained on the next
/// call, so back-to-back frames in one read are never lost.
pub struct FrameReader<T> {
    inner: T,
    decoder: FrameDecoder,
    chunk: [u8; READ_CHUNK_SIZE],
    chunk_pos: usize,
    chunk_len: usize,
}

impl<T: Read> FrameReader<T> {
    /// Create a frame reader with the default payload cap.
    pub fn new(inner: T) -> Self {
        Self::with_max_payload(inner, DEFAULT_MAX_PAYLOAD)
    }

    /// Create a frame reader with an explicit payload cap.
    pub fn with_max_payload(inner: T, max_payload: usize) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::with_max_payload(max_payload),
            chunk: [0u8; READ_CHUNK_SIZE],
            chunk_pos: 0,
            chunk_len: 0,
        }
    }

    /// Read the next complete frame (blocking).
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when EOF is reached.
    pub fn read_frame(&mut self) -> Result<Frame> {
        loop {
            while self.chunk_pos < self.chunk_len {
                let result = self
                    .decoder
                    .feed(&self.chunk[self.chunk_pos..self.chunk_len])?;
                self.chunk_pos += result.consumed;
                if let Some(frame) = result.frame {
                    return Ok(frame);
                }
            }

            let read = match self.inner.read(&mut self.chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            };

            if read == 0 {
                return Err(FrameError::ConnectionClosed);
            }

            self.chunk_pos = 0;
            self.chunk_len = read;
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }
}
