//! Process output channel — one OS pipe as a safely-drainable chunk source.
//!
//! The channel starts reading the underlying stream into an internal FIFO
//! queue the moment it is created, whether or not anyone ever consumes it.
//! That guarantee is the whole point: the subprocess can never block
//! writing to a full OS pipe buffer while nobody is reading.
//!
//! ```text
//!   ChildStdout ──▶ drain task ──▶ [unbounded mpsc] ──▶ bytes() / text()
//!                   ├── starts at construction, consumer or not
//!                   ├── cancel() stops it without surfacing an error
//!                   └── EOF / read error → completion signal
//! ```
//!
//! The internal queue is unbounded: a producer far faster than its consumer
//! grows memory without limit. Accepted trade-off — bounding it would
//! reintroduce the blocked-subprocess hazard this design exists to remove.
//!
//! Consumption is single-use and mutually exclusive between the raw
//! `bytes()` mode and the incrementally-decoded `text()` mode; a second
//! subscription fails with `OutputStreamError`.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::Stream;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use medley_types::{ByteChunk, ChunkMeta, OutputStreamError, TextChunk};

use crate::decode::Utf8Decoder;

/// Read buffer size for the drain task.
const READ_BUF_SIZE: usize = 8 * 1024;

/// Subscription lifecycle of a chunk source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    NotStarted,
    Started,
    Done,
}

pub(crate) fn mark_done(lifecycle: &Mutex<Lifecycle>) {
    *lifecycle.lock().unwrap_or_else(|p| p.into_inner()) = Lifecycle::Done;
}

/// The underlying OS stream failed while being drained.
///
/// Only surfaced to a `done()` waiter if the channel was not cancelled; a
/// user-initiated kill must not show up as an error.
#[derive(Debug, Clone, Error)]
#[error("output stream failed: {0}")]
pub struct DrainError(String);

/// Lightweight handle that cancels a channel's drain task.
///
/// Cloneable so an executor can keep kill authority after the channel
/// itself has been consumed by a multiplexer.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancellationToken,
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    /// Stop draining and mark the channel cancelled.
    ///
    /// Resolves the completion signal without treating it as failure.
    pub fn cancel(&self, reason: &str) {
        tracing::debug!(reason, "output channel cancelled");
        self.cancelled.store(true, Ordering::Release);
        self.token.cancel();
    }

    /// True once `cancel` has been called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// A single subprocess stream (stdout or stderr), eagerly drained.
pub struct OutputChannel {
    meta: Arc<ChunkMeta>,
    lifecycle: Arc<Mutex<Lifecycle>>,
    cancel: CancelHandle,
    error: Arc<Mutex<Option<String>>>,
    done_rx: watch::Receiver<bool>,
    rx: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl OutputChannel {
    /// Wrap a stream and immediately start draining it.
    pub fn spawn<R>(reader: R, meta: ChunkMeta) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let meta = Arc::new(meta);
        let (tx, rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = watch::channel(false);
        let cancel = CancelHandle {
            token: CancellationToken::new(),
            cancelled: Arc::new(AtomicBool::new(false)),
        };
        let error: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

        let token = cancel.token.clone();
        let err_slot = error.clone();
        tokio::spawn(async move {
            let mut reader = reader;
            let mut buf = vec![0u8; READ_BUF_SIZE];
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    read = reader.read(&mut buf) => match read {
                        Ok(0) => break,
                        Ok(n) => {
                            // Receiver dropped means nobody is listening;
                            // stop draining into the void.
                            if tx.send(buf[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            *err_slot.lock().unwrap_or_else(|p| p.into_inner()) =
                                Some(e.to_string());
                            break;
                        }
                    }
                }
            }
            let _ = done_tx.send(true);
        });

        Self {
            meta,
            lifecycle: Arc::new(Mutex::new(Lifecycle::NotStarted)),
            cancel,
            error,
            done_rx,
            rx: Some(rx),
        }
    }

    /// Source metadata shared by every chunk from this channel.
    pub fn meta(&self) -> &Arc<ChunkMeta> {
        &self.meta
    }

    /// Consume as raw byte chunks. Single-use; mutually exclusive with
    /// `text`.
    pub fn bytes(&mut self) -> Result<ByteChunks, OutputStreamError> {
        let rx = self.subscribe()?;
        Ok(ByteChunks {
            meta: self.meta.clone(),
            rx,
            lifecycle: self.lifecycle.clone(),
        })
    }

    /// Consume as incrementally-decoded text chunks. Single-use; mutually
    /// exclusive with `bytes`.
    pub fn text(&mut self) -> Result<TextChunks, OutputStreamError> {
        let rx = self.subscribe()?;
        Ok(TextChunks {
            meta: self.meta.clone(),
            rx,
            lifecycle: self.lifecycle.clone(),
            decoder: Utf8Decoder::new(),
            flushed: false,
        })
    }

    fn subscribe(&mut self) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, OutputStreamError> {
        let mut state = self.lifecycle.lock().unwrap_or_else(|p| p.into_inner());
        match *state {
            Lifecycle::Started => Err(OutputStreamError::Started),
            Lifecycle::Done => Err(OutputStreamError::Done),
            Lifecycle::NotStarted => {
                let rx = self.rx.take().ok_or(OutputStreamError::Started)?;
                *state = Lifecycle::Started;
                Ok(rx)
            }
        }
    }

    /// Stop draining and mark cancelled. Not an error: the completion
    /// signal still resolves cleanly.
    pub fn cancel(&self, reason: &str) {
        self.cancel.cancel(reason);
    }

    /// True once the channel has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Clone the cancel authority for use after the channel is consumed.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Wait for the underlying stream to end.
    ///
    /// A read error is only surfaced if the channel was not cancelled.
    pub async fn done(&self) -> Result<(), DrainError> {
        let mut rx = self.done_rx.clone();
        // The drain task always flips the flag before exiting, so a closed
        // sender here still means the stream is finished.
        let _ = rx.wait_for(|done| *done).await;
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        match &*self.error.lock().unwrap_or_else(|p| p.into_inner()) {
            Some(msg) => Err(DrainError(msg.clone())),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for OutputChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputChannel")
            .field("meta", &self.meta.key())
            .finish()
    }
}

/// Raw-byte subscription of one channel. FIFO; ends when the drain task
/// finishes and the queue is empty.
#[derive(Debug)]
pub struct ByteChunks {
    meta: Arc<ChunkMeta>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    lifecycle: Arc<Mutex<Lifecycle>>,
}

impl Stream for ByteChunks {
    type Item = ByteChunk;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(bytes)) => Poll::Ready(Some(ByteChunk {
                meta: this.meta.clone(),
                bytes,
            })),
            Poll::Ready(None) => {
                mark_done(&this.lifecycle);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Decoded-text subscription of one channel.
///
/// Chunks that only extend an incomplete multi-byte sequence are withheld;
/// at end-of-stream a still-incomplete tail is flushed as one U+FFFD.
#[derive(Debug)]
pub struct TextChunks {
    meta: Arc<ChunkMeta>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    lifecycle: Arc<Mutex<Lifecycle>>,
    decoder: Utf8Decoder,
    flushed: bool,
}

impl Stream for TextChunks {
    type Item = TextChunk;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if this.flushed {
                return Poll::Ready(None);
            }
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(bytes)) => {
                    let text = this.decoder.decode(&bytes);
                    if text.is_empty() {
                        continue;
                    }
                    return Poll::Ready(Some(TextChunk {
                        meta: this.meta.clone(),
                        text,
                    }));
                }
                Poll::Ready(None) => {
                    this.flushed = true;
                    mark_done(&this.lifecycle);
                    if let Some(tail) = this.decoder.finish() {
                        return Poll::Ready(Some(TextChunk {
                            meta: this.meta.clone(),
                            text: tail,
                        }));
                    }
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use medley_types::{ScriptTag, StreamName};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    fn meta() -> ChunkMeta {
        ChunkMeta::new(ScriptTag::new("pkg", "build"), StreamName::Stdout)
    }

    #[tokio::test]
    async fn drains_without_a_consumer() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let mut channel = OutputChannel::spawn(reader, meta());

        // Write well past the duplex buffer with nobody reading the
        // channel yet; the eager drain must keep the pipe moving.
        let payload = vec![b'x'; 4096];
        writer.write_all(&payload).await.unwrap();
        drop(writer);
        channel.done().await.unwrap();

        let chunks: Vec<_> = channel.bytes().unwrap().collect().await;
        let total: usize = chunks.iter().map(|c| c.bytes.len()).sum();
        assert_eq!(total, 4096);
    }

    #[tokio::test]
    async fn chunks_keep_production_order() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut channel = OutputChannel::spawn(reader, meta());

        for i in 0..20u8 {
            writer.write_all(&[i]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        drop(writer);

        let bytes: Vec<u8> = channel
            .bytes()
            .unwrap()
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .flat_map(|c| c.bytes)
            .collect();
        assert_eq!(bytes, (0..20u8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn second_subscription_fails_started() {
        let (_writer, reader) = tokio::io::duplex(64);
        let mut channel = OutputChannel::spawn(reader, meta());

        let _bytes = channel.bytes().unwrap();
        assert_eq!(channel.text().unwrap_err(), OutputStreamError::Started);
        assert_eq!(channel.bytes().unwrap_err(), OutputStreamError::Started);
    }

    #[tokio::test]
    async fn subscription_after_drain_fails_done() {
        let (writer, reader) = tokio::io::duplex(64);
        let mut channel = OutputChannel::spawn(reader, meta());
        drop(writer);

        // Exhaust the only subscription.
        let chunks: Vec<_> = channel.bytes().unwrap().collect().await;
        assert!(chunks.is_empty());

        assert_eq!(channel.text().unwrap_err(), OutputStreamError::Done);
    }

    #[tokio::test]
    async fn text_mode_decodes_across_chunk_boundaries() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let mut channel = OutputChannel::spawn(reader, meta());
        let mut text = channel.text().unwrap();

        writer.write_all(b"hello\xF0").await.unwrap();
        let first = text.next().await.unwrap();
        assert_eq!(first.text, "hello");

        writer.write_all(b"\x9F\x98\x80world\n").await.unwrap();
        drop(writer);
        let second = text.next().await.unwrap();
        assert_eq!(second.text, "\u{1F600}world\n");
        assert!(text.next().await.is_none());
    }

    #[tokio::test]
    async fn truncated_sequence_flushes_replacement_at_eof() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let mut channel = OutputChannel::spawn(reader, meta());
        let mut text = channel.text().unwrap();

        writer.write_all(b"hello\xF0").await.unwrap();
        assert_eq!(text.next().await.unwrap().text, "hello");
        drop(writer);
        assert_eq!(text.next().await.unwrap().text, "\u{FFFD}");
        assert!(text.next().await.is_none());
    }

    /// Reader whose every poll fails, standing in for a broken OS pipe.
    struct BrokenPipe;

    impl AsyncRead for BrokenPipe {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Err(std::io::Error::other("pipe burst")))
        }
    }

    #[tokio::test]
    async fn stream_error_surfaces_to_done_waiter() {
        let channel = OutputChannel::spawn(BrokenPipe, meta());
        let err = channel.done().await.unwrap_err();
        assert!(err.to_string().contains("pipe burst"), "got: {err}");
    }

    #[tokio::test]
    async fn cancel_suppresses_a_concurrent_stream_error() {
        let channel = OutputChannel::spawn(BrokenPipe, meta());
        // The drain task may record the read error before the cancel
        // lands; the completion signal must still resolve cleanly.
        channel.cancel("test kill");
        channel.done().await.unwrap();
        assert!(channel.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_resolves_done_without_error() {
        let (_writer, reader) = tokio::io::duplex(64);
        let channel = OutputChannel::spawn(reader, meta());

        channel.cancel("test kill");
        channel.done().await.unwrap();
        assert!(channel.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_ends_the_subscription() {
        let (_writer, reader) = tokio::io::duplex(64);
        let mut channel = OutputChannel::spawn(reader, meta());
        let mut bytes = channel.bytes().unwrap();

        channel.cancel("shutting down");
        assert!(bytes.next().await.is_none());
    }
}
