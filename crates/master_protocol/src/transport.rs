//! Length-prefixed framing over any async byte stream.
//!
//! Each frame is a `u32` big-endian length followed by that many bytes.
//! The framing is generic over `AsyncRead`/`AsyncWrite`, so the same code
//! drives TCP sockets in production and `tokio::io::duplex` pipes in tests.

use crate::error::ProtocolError;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

/// Frames above this size are refused (10MB).
pub const MAX_FRAME_SIZE: usize = 10_000_000;

/// Reading half of a framed stream.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Reads the next frame. Returns `Ok(None)` on a clean end of stream.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        let mut len_bytes = [0u8; 4];
        match self.inner.read_exact(&mut len_bytes).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > MAX_FRAME_SIZE {
            warn!(len, "Refusing oversized inbound frame");
            return Err(ProtocolError::FrameTooLarge(len));
        }

        let mut data = vec![0u8; len];
        self.inner.read_exact(&mut data).await?;
        Ok(Some(data))
    }
}

/// Writing half of a framed stream.
#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write_frame(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        if data.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(data.len()));
        }
        self.inner.write_all(&(data.len() as u32).to_be_bytes()).await?;
        self.inner.write_all(data).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), ProtocolError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
