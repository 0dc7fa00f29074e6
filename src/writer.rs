//! Dedicated writer task for sending packets over a byte stream.
//!
//! Producers hand [`SharedPacket`]s to a writer task through an mpsc channel. The
//! task batches whatever is queued, writes the wire frames with a single vectored
//! write where possible, and releases each packet once its bytes are flushed.
//!
//! # Architecture
//!
//! ```text
//! Producer 1 ─┐
//! Producer 2 ─┼─► mpsc::Sender<SharedPacket> ─► Writer Task ─► AsyncWrite
//! Producer N ─┘
//! ```
//!
//! A packet buffer already is a wire frame, so every queued packet contributes one
//! slice to the vectored write and nothing is copied.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{PacketError, Result};
use crate::packet::SharedPacket;

/// Default maximum pending packets before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum packets to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// Interval between backpressure checks.
const CHECK_INTERVAL: Duration = Duration::from_micros(100);

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum pending packets before backpressure kicks in.
    pub max_pending_frames: usize,
    /// Channel capacity for the packet queue.
    pub channel_capacity: usize,
    /// Timeout when waiting for backpressure to clear.
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

/// Handle for sending packets to the writer task.
///
/// Cheaply cloneable. Each sent packet hands one reference to the writer task,
/// which releases it after the write; on a send error the reference is released
/// here instead.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<SharedPacket>,
    /// Pending packet count (for backpressure).
    pending: Arc<AtomicUsize>,
    max_pending: usize,
    timeout: Duration,
}

impl WriterHandle {
    fn new(
        tx: mpsc::Sender<SharedPacket>,
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

    /// Send a packet to the writer task.
    ///
    /// Waits while backpressure is active, timing out after the configured duration.
    pub async fn send(&self, packet: SharedPacket) -> Result<()> {
        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            if let Err(e) = self.wait_for_backpressure().await {
                release_rejected(packet);
                return Err(e);
            }
        }

        // Count before sending so the writer never decrements below zero.
        self.pending.fetch_add(1, Ordering::AcqRel);

        match self.tx.send(packet).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(packet)) => {
                self.pending.fetch_sub(1, Ordering::Release);
                release_rejected(packet);
                Err(PacketError::ConnectionClosed)
            }
        }
    }

    async fn wait_for_backpressure(&self) -> Result<()> {
        let start = Instant::now();

        loop {
            if self.pending.load(Ordering::Acquire) < self.max_pending {
                return Ok(());
            }

            if start.elapsed() > self.timeout {
                tracing::warn!(
                    pending = self.pending.load(Ordering::Acquire),
                    "writer backpressure timeout"
                );
                return Err(PacketError::BackpressureTimeout);
            }

            tokio::time::sleep(CHECK_INTERVAL).await;
        }
    }

    /// Try to send a packet without waiting for backpressure.
    ///
    /// Returns `Err(BackpressureTimeout)` immediately if at capacity.
    pub fn try_send(&self, packet: SharedPacket) -> Result<()> {
        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            release_rejected(packet);
            return Err(PacketError::BackpressureTimeout);
        }

        self.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.try_send(packet).map_err(|e| {
            self.pending.fetch_sub(1, Ordering::Release);
            match e {
                mpsc::error::TrySendError::Full(packet) => {
                    release_rejected(packet);
                    PacketError::BackpressureTimeout
                }
                mpsc::error::TrySendError::Closed(packet) => {
                    release_rejected(packet);
                    PacketError::ConnectionClosed
                }
            }
        })
    }

    /// Check if backpressure is currently active.
    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.pending.load(Ordering::Acquire) >= self.max_pending
    }

    /// Get current pending packet count.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

fn release_rejected(packet: SharedPacket) {
    if let Err(e) = packet.release() {
        tracing::error!("Failed to release unsent packet: {}", e);
    }
}

/// Spawn the writer task and return a handle for sending packets.
///
/// The task ends with `Ok(())` once every handle is dropped and the queue is
/// drained, or with the first I/O error.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
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

/// Spawn the writer task with default configuration.
pub fn spawn_writer_task_default<W>(writer: W) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    spawn_writer_task(writer, WriterConfig::default())
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<SharedPacket>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let Some(first) = rx.recv().await else {
            tracing::debug!("writer channel closed, shutting down");
            return Ok(());
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);

        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(packet) => batch.push(packet),
                Err(_) => break,
            }
        }

        let batch_size = batch.len();
        let result = write_batch(&mut writer, &batch).await;
        release_batch(batch);
        pending.fetch_sub(batch_size, Ordering::Release);

        if let Err(e) = result {
            tracing::error!("Failed to write packet batch: {}", e);
            return Err(e);
        }
    }
}

fn release_batch(batch: Vec<SharedPacket>) {
    for packet in batch {
        if let Err(e) = packet.release() {
            tracing::error!("Failed to release written packet: {}", e);
        }
    }
}

/// Write a batch of wire frames using scatter/gather I/O, then flush.
async fn write_batch<W>(writer: &mut W, batch: &[SharedPacket]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total_size: usize = batch.iter().map(|p| p.wire_frame().len()).sum();
    if total_size == 0 {
        return Ok(());
    }

    let mut total_written = 0;
    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(PacketError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build the IoSlice array for the bytes after `skip_bytes`.
fn build_remaining_slices(batch: &[SharedPacket], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut skipped = 0;

    for packet in batch {
        let frame = packet.wire_frame();
        let start = skipped;
        let end = skipped + frame.len();

        if skip_bytes < end {
            slices.push(IoSlice::new(&frame[skip_bytes.saturating_sub(start)..]));
        }
        skipped = end;
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PacketPool;
    use crate::protocol::HEADER_SIZE;
    use std::io::Cursor;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{duplex, AsyncReadExt};

    fn shared(pool: &PacketPool, payload: &[u8]) -> SharedPacket {
        let mut packet = pool.checkout().unwrap();
        packet.append_bytes(payload).unwrap();
        packet.into_shared()
    }

    /// Accepts at most `chunk` bytes per write call.
    struct Trickle {
        out: Vec<u8>,
        chunk: usize,
    }

    impl AsyncWrite for Trickle {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            let n = buf.len().min(self.chunk);
            self.out.extend_from_slice(&buf[..n]);
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    struct Broken;

    impl AsyncWrite for Broken {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
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
        let pool = PacketPool::with_defaults();
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task_default(client);

        handle.send(shared(&pool, b"hello")).await.unwrap();

        let mut buf = vec![0u8; HEADER_SIZE + 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [5, 0, 0, 0, b'h', b'e', b'l', b'l', b'o']);
    }

    #[tokio::test]
    async fn test_written_packets_return_to_pool() {
        let pool = PacketPool::with_defaults();
        let (handle, task) = spawn_writer_task_default(Cursor::new(Vec::new()));

        for i in 0..10u32 {
            handle.send(shared(&pool, &[i as u8; 600])).await.unwrap();
        }
        drop(handle);
        task.await.unwrap().unwrap();

        let stats = pool.stats();
        assert_eq!(stats.idle_shells as u64, stats.shells_created);
        assert!(pool.buffers().idle(2048) >= 1);
    }

    #[tokio::test]
    async fn test_fan_out_to_two_writers() {
        let pool = PacketPool::with_defaults();
        let (a, task_a) = spawn_writer_task_default(Cursor::new(Vec::new()));
        let (b, task_b) = spawn_writer_task_default(Cursor::new(Vec::new()));

        let packet = shared(&pool, b"broadcast");
        b.send(packet.share().unwrap()).await.unwrap();
        a.send(packet).await.unwrap();

        drop(a);
        drop(b);
        task_a.await.unwrap().unwrap();
        task_b.await.unwrap().unwrap();

        assert_eq!(pool.stats().idle_shells, 1);
    }

    #[tokio::test]
    async fn test_writer_batching() {
        let pool = PacketPool::with_defaults();
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task_default(client);

        for i in 0..10u32 {
            handle.send(shared(&pool, &i.to_le_bytes())).await.unwrap();
        }

        let mut buf = vec![0u8; 10 * (HEADER_SIZE + 4)];
        server.read_exact(&mut buf).await.unwrap();
        for (i, frame) in buf.chunks(HEADER_SIZE + 4).enumerate() {
            assert_eq!(&frame[..HEADER_SIZE], &[4, 0, 0, 0]);
            assert_eq!(&frame[HEADER_SIZE..], &(i as u32).to_le_bytes());
        }
    }

    #[tokio::test]
    async fn test_try_send_at_capacity() {
        let pool = PacketPool::with_defaults();
        let (tx, _rx) = mpsc::channel::<SharedPacket>(10);
        let pending = Arc::new(AtomicUsize::new(100));
        let handle = WriterHandle::new(tx, pending, 100, Duration::from_secs(1));

        let result = handle.try_send(shared(&pool, b""));
        assert!(matches!(result, Err(PacketError::BackpressureTimeout)));
        // The rejected packet was released, not leaked.
        assert_eq!(pool.stats().idle_shells, 1);
    }

    #[tokio::test]
    async fn test_send_backpressure_timeout() {
        let pool = PacketPool::with_defaults();
        let (tx, _rx) = mpsc::channel::<SharedPacket>(10);
        let pending = Arc::new(AtomicUsize::new(1));
        let handle = WriterHandle::new(tx, pending, 1, Duration::from_millis(10));

        assert!(handle.is_backpressure_active());
        let result = handle.send(shared(&pool, b"x")).await;
        assert!(matches!(result, Err(PacketError::BackpressureTimeout)));
        assert_eq!(pool.stats().idle_shells, 1);
    }

    #[tokio::test]
    async fn test_send_after_writer_gone() {
        let pool = PacketPool::with_defaults();
        let (tx, rx) = mpsc::channel::<SharedPacket>(10);
        drop(rx);
        let pending = Arc::new(AtomicUsize::new(0));
        let handle = WriterHandle::new(tx, pending, 10, Duration::from_secs(1));

        let result = handle.send(shared(&pool, b"x")).await;
        assert!(matches!(result, Err(PacketError::ConnectionClosed)));
        assert_eq!(handle.pending_count(), 0);
    }

    #[test]
    fn test_build_remaining_slices() {
        let pool = PacketPool::with_defaults();
        let batch = vec![shared(&pool, b"hello"), shared(&pool, b"abc")];

        let slices = build_remaining_slices(&batch, 0);
        assert_eq!(slices.len(), 2);

        let slices = build_remaining_slices(&batch, 2);
        assert_eq!(slices[0].len(), HEADER_SIZE + 5 - 2);

        let slices = build_remaining_slices(&batch, HEADER_SIZE + 5 + 1);
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].len(), HEADER_SIZE + 3 - 1);
    }

    #[tokio::test]
    async fn test_write_batch_partial_writes() {
        let pool = PacketPool::with_defaults();
        let batch: Vec<_> = (0..5u8).map(|i| shared(&pool, &[i; 7])).collect();
        let expected: Vec<u8> = batch.iter().flat_map(|p| p.wire_frame().to_vec()).collect();

        let mut out = Trickle {
            out: Vec::new(),
            chunk: 3,
        };
        write_batch(&mut out, &batch).await.unwrap();
        assert_eq!(out.out, expected);
    }

    #[tokio::test]
    async fn test_write_error_releases_batch() {
        let pool = PacketPool::with_defaults();
        let (handle, task) = spawn_writer_task_default(Broken);

        handle.send(shared(&pool, b"lost")).await.unwrap();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(PacketError::Io(_))));
        assert_eq!(pool.stats().idle_shells, 1);
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_channel_close() {
        let (client, _server) = duplex(4096);
        let (handle, task) = spawn_writer_task_default(client);

        drop(handle);

        let result = task.await.unwrap();
        assert!(result.is_ok());
    }
}
