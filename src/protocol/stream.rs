//! Async frame reading and writing over a byte stream.
//!
//! [`FrameReader`] owns the read half of a socket plus a [`FrameBuffer`], so a
//! pending `read_frame` can be dropped inside `tokio::select!` without losing
//! bytes: data only moves into the buffer once a read has completed.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{Frame, FrameBuffer};
use crate::error::{GatewayError, Result};

/// Socket read size.
const READ_CHUNK: usize = 16 * 1024;

/// Reads frames from an async byte stream.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    buffer: FrameBuffer,
    chunk: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap a reader with the given frame-max.
    pub fn new(inner: R, frame_max: u32) -> Self {
        Self {
            inner,
            buffer: FrameBuffer::with_frame_max(frame_max),
            chunk: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// Apply a newly negotiated frame-max.
    pub fn set_frame_max(&mut self, frame_max: u32) {
        self.buffer.set_frame_max(frame_max);
    }

    pub fn frame_max(&self) -> u32 {
        self.buffer.frame_max()
    }

    /// Read the 8-byte protocol header that opens every connection.
    ///
    /// Must be called before any frame has been read.
    pub async fn read_protocol_header(&mut self) -> Result<[u8; 8]> {
        let mut header = [0u8; 8];
        match self.inner.read_exact(&mut header).await {
            Ok(_) => Ok(header),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(GatewayError::ConnectionClosed)
            }
            Err(e) => Err(GatewayError::Io(e)),
        }
    }

    /// Read the next complete frame.
    ///
    /// Returns `Ok(None)` when the peer closed the stream on a frame
    /// boundary, and a protocol error when it closed mid-frame.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.buffer.next_frame()? {
                return Ok(Some(frame));
            }

            self.chunk.clear();
            let n = self.inner.read_buf(&mut self.chunk).await?;
            if n == 0 {
                self.buffer.finish()?;
                return Ok(None);
            }
            self.buffer.extend(&self.chunk[..n]);
        }
    }

    /// Give back the underlying reader.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Write one frame and flush.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&frame.encode()).await?;
    writer.flush().await?;
    Ok(())
}
