use crate::telemetry;
use bytes::BytesMut;
use serde_json::Value;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

/// Longest line the reader buffers before giving up on the peer.
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;
const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("socket read failed: {0}")]
    Io(#[from] io::Error),
    #[error("frame exceeded {limit} bytes without a newline")]
    Oversized { limit: usize },
}

impl FrameError {
    /// The peer dropped the connection rather than sending something unreadable.
    pub fn is_hangup(&self) -> bool {
        matches!(
            self,
            FrameError::Io(err) if matches!(
                err.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            )
        )
    }
}

/// Splits a byte stream into newline-delimited JSON objects.
///
/// Reads are accumulated until a full line is available, so a frame split across
/// several socket reads decodes once. Blank lines are ignored. A line that is not
/// a JSON object is logged and skipped; decoding resumes at the next newline.
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
    // Bytes already searched for a newline.
    scanned: usize,
    limit: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_limit(inner, MAX_FRAME_BYTES)
    }

    pub fn with_limit(inner: R, limit: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK),
            scanned: 0,
            limit,
        }
    }

    /// Next decoded frame, or `None` once the peer has closed the stream.
    pub async fn next_frame(&mut self) -> Result<Option<Value>, FrameError> {
        loop {
            while let Some(line) = self.take_line() {
                if let Some(frame) = decode_line(&line) {
                    return Ok(Some(frame));
                }
            }

            if self.buf.len() > self.limit {
                return Err(FrameError::Oversized { limit: self.limit });
            }

            self.buf.reserve(READ_CHUNK);
            let read = self.inner.read_buf(&mut self.buf).await?;
            if read == 0 {
                if !self.buf.is_empty() {
                    debug!(
                        target: "vmpeek::dispatch",
                        bytes = self.buf.len(),
                        "discarding unterminated frame at end of stream"
                    );
                }
                return Ok(None);
            }
            telemetry::record_bytes("frame.read", read);
        }
    }

    fn take_line(&mut self) -> Option<BytesMut> {
        let offset = self.buf[self.scanned..].iter().position(|b| *b == b'\n');
        match offset {
            Some(offset) => {
                let end = self.scanned + offset;
                let mut line = self.buf.split_to(end + 1);
                line.truncate(end);
                self.scanned = 0;
                Some(line)
            }
            None => {
                self.scanned = self.buf.len();
                None
            }
        }
    }
}

fn decode_line(line: &[u8]) -> Option<Value> {
    let mut line = line;
    while line.last().is_some_and(u8::is_ascii_whitespace) {
        line = &line[..line.len() - 1];
    }
    while line.first().is_some_and(u8::is_ascii_whitespace) {
        line = &line[1..];
    }
    if line.is_empty() {
        return None;
    }
    match serde_json::from_slice::<Value>(line) {
        Ok(value) if value.is_object() => Some(value),
        Ok(_) => {
            warn!(
                target: "vmpeek::dispatch",
                bytes = line.len(),
                "skipping frame that is not a JSON object"
            );
            None
        }
        Err(err) => {
            warn!(
                target: "vmpeek::dispatch",
                error = %err,
                bytes = line.len(),
                "skipping undecodable frame"
            );
            None
        }
    }
}
