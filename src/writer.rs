//! Dedicated writer task per socket.
//!
//! Every socket the gateway writes to (client side and broker side) gets one
//! writer task fed through an mpsc channel, so the read loops, heartbeat
//! timer and routing code never contend on the write half.
//!
//! ```text
//! client read loop ─┐
//! heartbeat timer  ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► socket
//! upstream relay   ─┘
//! ```
//!
//! Frames that are ready together go out in one `write_vectored` call.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::duration_ms;
use crate::error::{GatewayError, Result};
use crate::protocol::{Frame, FRAME_END, FRAME_HEADER_SIZE, FRAME_OVERHEAD};

/// Default maximum pending frames before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

static FRAME_END_SLICE: [u8; 1] = [FRAME_END];

/// A frame ready to be written.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    /// Pre-encoded header (7 bytes).
    pub header: [u8; FRAME_HEADER_SIZE],
    pub payload: Bytes,
}

impl OutboundFrame {
    #[inline]
    pub fn new(frame: &Frame) -> Self {
        Self {
            header: frame.header().encode(),
            payload: frame.payload.clone(),
        }
    }

    pub fn heartbeat() -> Self {
        Self::new(&Frame::heartbeat())
    }

    /// Total size on the wire (header + payload + end marker).
    #[inline]
    pub fn size(&self) -> usize {
        FRAME_OVERHEAD + self.payload.len()
    }
}

impl From<Frame> for OutboundFrame {
    fn from(frame: Frame) -> Self {
        Self {
            header: frame.header().encode(),
            payload: frame.payload,
        }
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Maximum pending frames before backpressure kicks in.
    pub max_pending_frames: usize,
    /// Channel capacity for frame queue.
    pub channel_capacity: usize,
    /// Timeout when waiting for backpressure to clear.
    #[serde(rename = "backpressure_timeout_ms", with = "duration_ms")]
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Handle for sending frames to the writer task.
///
/// Cheaply cloneable.
#[derive(Debug, Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    /// Pending frame count (for backpressure).
    pending: Arc<AtomicUsize>,
    max_pending: usize,
    timeout: Duration,
}

impl WriterHandle {
    fn new(
        tx: mpsc::Sender<OutboundFrame>,
        pending: Arc<AtomicUsize>,
        max_pending: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            tx,
            pending,
            max_pending,
            timeout,
        }
    }

    /// Queue a frame, waiting out backpressure up to the configured timeout.
    pub async fn send(&self, frame: impl Into<OutboundFrame>) -> Result<()> {
        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            self.wait_for_backpressure().await?;
        }

        // Increment pending count BEFORE sending
        self.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.send(frame.into()).await.map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            GatewayError::ConnectionClosed
        })
    }

    async fn wait_for_backpressure(&self) -> Result<()> {
        let start = Instant::now();
        let check_interval = Duration::from_micros(100);

        loop {
            if self.pending.load(Ordering::Acquire) < self.max_pending {
                return Ok(());
            }

            if start.elapsed() > self.timeout {
                return Err(GatewayError::BackpressureTimeout);
            }

            tokio::time::sleep(check_interval).await;
        }
    }

    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.pending.load(Ordering::Acquire) >= self.max_pending
    }

    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Queue a frame without waiting.
    ///
    /// Returns `Err(BackpressureTimeout)` immediately if at capacity.
    pub fn try_send(&self, frame: impl Into<OutboundFrame>) -> Result<()> {
        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            return Err(GatewayError::BackpressureTimeout);
        }

        self.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.try_send(frame.into()).map_err(|e| {
            self.pending.fetch_sub(1, Ordering::Release);
            match e {
                mpsc::error::TrySendError::Full(_) => GatewayError::BackpressureTimeout,
                mpsc::error::TrySendError::Closed(_) => GatewayError::ConnectionClosed,
            }
        })
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The task ends, shutting the write half down, once every handle is dropped.
pub fn spawn_writer_task<W>(
    writer: W,
    config: &WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = WriterHandle::new(
        tx,
        pending.clone(),
        config.max_pending_frames,
        config.backpressure_timeout,
    );

    let task = tokio::spawn(writer_loop(rx, writer, pending));

    (handle, task)
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let Some(first) = rx.recv().await else {
            // All handles gone: clean shutdown
            let _ = writer.shutdown().await;
            return Ok(());
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);

        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        let batch_size = batch.len();
        write_batch(&mut writer, &batch).await?;

        pending.fetch_sub(batch_size, Ordering::Release);
    }
}

/// Write a batch of frames using scatter/gather I/O.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    // header, optional payload, end marker per frame
    let mut slices: Vec<IoSlice<'_>> = Vec::with_capacity(batch.len() * 3);
    for frame in batch {
        slices.push(IoSlice::new(&frame.header));
        if !frame.payload.is_empty() {
            slices.push(IoSlice::new(&frame.payload));
        }
        slices.push(IoSlice::new(&FRAME_END_SLICE));
    }

    let total_size: usize = batch.iter().map(OutboundFrame::size).sum();

    let written = writer.write_vectored(&slices).await?;

    if written == total_size {
        writer.flush().await?;
        return Ok(());
    }

    if written == 0 {
        return Err(write_zero());
    }

    // Partial write: continue with the remainder
    let mut total_written = written;

    while total_written < total_size {
        let remaining_slices = build_remaining_slices(batch, total_written);
        if remaining_slices.is_empty() {
            break;
        }

        let written = writer.write_vectored(&remaining_slices).await?;
        if written == 0 {
            return Err(write_zero());
        }

        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

fn write_zero() -> GatewayError {
    GatewayError::Io(std::io::Error::new(
        std::io::ErrorKind::WriteZero,
        "write_vectored returned 0",
    ))
}

/// Build IoSlice array for remaining data after partial write.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 3);
    let mut offset = 0;

    for frame in batch {
        let parts: [&[u8]; 3] = [&frame.header, &frame.payload, &FRAME_END_SLICE];
        for part in parts {
            if part.is_empty() {
                continue;
            }
            let end = offset + part.len();
            if skip_bytes < end {
                let start_in_part = skip_bytes.saturating_sub(offset);
                slices.push(IoSlice::new(&part[start_in_part..]));
            }
            offset = end;
        }
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FrameBuffer, FrameType};
    use std::io::Cursor;
    use tokio::io::{duplex, AsyncReadExt};

    fn body(channel: u16, payload: &'static [u8]) -> OutboundFrame {
        OutboundFrame::new(&Frame::new(FrameType::Body, channel, Bytes::from_static(payload)))
    }

    #[test]
    fn test_outbound_frame_size() {
        let frame = body(1, b"hello");
        assert_eq!(frame.size(), FRAME_HEADER_SIZE + 5 + 1);
        assert_eq!(OutboundFrame::heartbeat().size(), FRAME_OVERHEAD);
    }

    #[test]
    fn test_writer_config_default() {
        let config = WriterConfig::default();
        assert_eq!(config.max_pending_frames, DEFAULT_MAX_PENDING_FRAMES);
        assert_eq!(config.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
        assert_eq!(config.backpressure_timeout, DEFAULT_BACKPRESSURE_TIMEOUT);
    }

    #[tokio::test]
    async fn test_writer_handle_send() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task(client, &WriterConfig::default());

        handle.send(body(1, b"hello")).await.unwrap();

        let mut buf = vec![0u8; FRAME_OVERHEAD + 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(*buf.last().unwrap(), FRAME_END);
    }

    #[tokio::test]
    async fn test_writer_batching_keeps_frames_intact() {
        let (client, mut server) = duplex(4096);
        let (handle, task) = spawn_writer_task(client, &WriterConfig::default());

        for i in 1..=10u16 {
            handle.send(body(i, b"abcd")).await.unwrap();
        }
        drop(handle);
        task.await.unwrap().unwrap();

        let mut bytes = Vec::new();
        server.read_to_end(&mut bytes).await.unwrap();

        let frames = FrameBuffer::new().push(&bytes).unwrap();
        assert_eq!(frames.len(), 10);
        assert!(frames.iter().enumerate().all(|(i, f)| f.channel == i as u16 + 1));
    }

    #[tokio::test]
    async fn test_try_send_at_capacity() {
        let (tx, _rx) = mpsc::channel::<OutboundFrame>(10);
        let pending = Arc::new(AtomicUsize::new(100));

        let handle = WriterHandle::new(tx, pending, 100, Duration::from_secs(1));

        let result = handle.try_send(OutboundFrame::heartbeat());
        assert!(matches!(result, Err(GatewayError::BackpressureTimeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_times_out_under_backpressure() {
        let (tx, _rx) = mpsc::channel::<OutboundFrame>(10);
        let pending = Arc::new(AtomicUsize::new(5));
        let handle = WriterHandle::new(tx, pending, 5, Duration::from_millis(10));

        let result = handle.send(OutboundFrame::heartbeat()).await;
        assert!(matches!(result, Err(GatewayError::BackpressureTimeout)));
    }

    #[test]
    fn test_build_remaining_slices_partial_header() {
        let batch = vec![body(1, b"hello")];

        let slices = build_remaining_slices(&batch, 5);
        assert_eq!(slices.len(), 3);
        assert_eq!(slices[0].len(), FRAME_HEADER_SIZE - 5);
        assert_eq!(slices[1].len(), 5);
        assert_eq!(slices[2].len(), 1);
    }

    #[test]
    fn test_build_remaining_slices_only_end_marker_left() {
        let batch = vec![body(1, b"hello"), OutboundFrame::heartbeat()];

        let slices = build_remaining_slices(&batch, FRAME_HEADER_SIZE + 5);
        // end marker of the first frame, then the whole heartbeat
        assert_eq!(slices.len(), 3);
        assert_eq!(&*slices[0], &[FRAME_END]);
        assert_eq!(slices[1].len(), FRAME_HEADER_SIZE);
    }

    #[tokio::test]
    async fn test_write_batch_matches_frame_encoding() {
        let mut buf = Cursor::new(Vec::new());
        let frame = Frame::new(FrameType::Method, 0, Bytes::from_static(&[0, 10, 0, 51]));

        write_batch(&mut buf, &[OutboundFrame::new(&frame), OutboundFrame::heartbeat()])
            .await
            .unwrap();

        let mut expected = frame.encode().to_vec();
        expected.extend_from_slice(&Frame::heartbeat().encode());
        assert_eq!(buf.into_inner(), expected);
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_channel_close() {
        let (client, _server) = duplex(4096);
        let (handle, task) = spawn_writer_task(client, &WriterConfig::default());

        drop(handle);

        let result = task.await.unwrap();
        assert!(result.is_ok());
    }
}
