//! `Content-Length` framing for the bridge's JSON-RPC messages.
//!
//! Each frame is `Content-Length: N\r\n\r\n` followed by exactly `N` bytes of
//! JSON. The same framing runs over child-process stdio, sockets, or an
//! in-memory duplex.

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Upper bound on a single frame body (4 MiB).
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("transport I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("stream ended inside a frame")]
    UnexpectedEof,
    #[error("frame has no Content-Length header")]
    MissingContentLength,
    #[error("invalid Content-Length value {0:?}")]
    InvalidContentLength(String),
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_BYTES} byte limit")]
    FrameTooLarge(usize),
    #[error("frame body is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub struct FrameReader<R> {
    reader: BufReader<R>,
    line: String,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            line: String::new(),
        }
    }

    /// Read the next frame. `Ok(None)` means the peer closed the stream
    /// cleanly between frames.
    pub async fn read_frame(&mut self) -> Result<Option<serde_json::Value>, CodecError> {
        let Some(length) = self.read_content_length().await? else {
            return Ok(None);
        };
        if length > MAX_FRAME_BYTES {
            return Err(CodecError::FrameTooLarge(length));
        }

        let mut body = vec![0u8; length];
        self.reader
            .read_exact(&mut body)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => CodecError::UnexpectedEof,
                _ => CodecError::Io(e),
            })?;
        Ok(Some(serde_json::from_slice(&body)?))
    }

    async fn read_content_length(&mut self) -> Result<Option<usize>, CodecError> {
        let mut length = None;
        let mut started = false;

        loop {
            self.line.clear();
            if self.reader.read_line(&mut self.line).await? == 0 {
                return if started {
                    Err(CodecError::UnexpectedEof)
                } else {
                    Ok(None)
                };
            }
            started = true;

            let header = self.line.trim();
            if header.is_empty() {
                break;
            }
            let Some((name, value)) = header.split_once(':') else {
                continue;
            };
            if name.trim().eq_ignore_ascii_case("Content-Length") {
                let value = value.trim();
                length = Some(
                    value
                        .parse()
                        .map_err(|_| CodecError::InvalidContentLength(value.to_string()))?,
                );
            }
        }

        length.map(Some).ok_or(CodecError::MissingContentLength)
    }
}

pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn write_frame(&mut self, message: &serde_json::Value) -> Result<(), CodecError> {
        let body = serde_json::to_vec(message)?;
        let header = format!("Content-Length: {}\r\n\r\n", body.len());
        self.writer.write_all(header.as_bytes()).await?;
        self.writer.write_all(&body).await?;
        self.writer.flush().await?;
        Ok(())
    }
}
