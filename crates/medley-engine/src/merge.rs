//! Fan-in multiplexer — many chunk sources as one ordered stream.
//!
//! Every attached source gets a forwarder task moving its chunks into one
//! shared queue, so chunks from a single source are never reordered (FIFO
//! per source) while chunks across sources interleave in real-time arrival
//! order. That is deliberate: the merged view is a faithful interleaving of
//! concurrent processes' output, not a source-by-source replay.
//!
//! ```text
//!   channel A ──▶ forwarder ──┐
//!   channel B ──▶ forwarder ──┼──▶ [mpsc] ──▶ bytes() / text()
//!   channel C ──▶ forwarder ──┘
//! ```
//!
//! The merge ends once every source has completed and every `MergeHandle`
//! has been dropped. The handle/receiver split lets a scheduler keep
//! attaching channels for scripts that start later, then seal the merge by
//! dropping its handle.
//!
//! The multiplexer applies the same single-subscription `bytes()`/`text()`
//! contract as a single channel. Text mode keeps one incremental decoder
//! per source, so interleaving can never corrupt a multi-byte sequence
//! split across one source's chunks.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;

use medley_types::{ByteChunk, ChunkMeta, OutputStreamError, TextChunk};

use crate::channel::{mark_done, Lifecycle, OutputChannel};
use crate::decode::Utf8Decoder;

/// Create a multiplexer pair: the attaching side and the consuming side.
pub fn merger() -> (MergeHandle, OutputMerger) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        MergeHandle { tx },
        OutputMerger {
            lifecycle: Arc::new(Mutex::new(Lifecycle::NotStarted)),
            rx: Some(rx),
        },
    )
}

/// Attaching side of a multiplexer. Cloneable; dropping the last handle
/// (once all attached sources finish) ends the merged stream.
#[derive(Clone)]
pub struct MergeHandle {
    tx: mpsc::UnboundedSender<ByteChunk>,
}

impl MergeHandle {
    /// Attach a channel, taking its single byte subscription.
    pub fn attach_channel(&self, channel: &mut OutputChannel) -> Result<(), OutputStreamError> {
        let stream = channel.bytes()?;
        self.attach(stream);
        Ok(())
    }

    /// Attach any chunk source (e.g. an executor's already-merged output).
    pub fn attach<S>(&self, stream: S)
    where
        S: Stream<Item = ByteChunk> + Send + Unpin + 'static,
    {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let mut stream = stream;
            while let Some(chunk) = stream.next().await {
                // Receiver dropped means nobody is listening.
                if tx.send(chunk).is_err() {
                    break;
                }
            }
        });
    }
}

/// Consuming side of a multiplexer.
pub struct OutputMerger {
    lifecycle: Arc<Mutex<Lifecycle>>,
    rx: Option<mpsc::UnboundedReceiver<ByteChunk>>,
}

impl OutputMerger {
    /// Merge a fixed set of channels, sealed immediately.
    pub fn from_channels<I>(channels: I) -> Result<Self, OutputStreamError>
    where
        I: IntoIterator<Item = OutputChannel>,
    {
        let (handle, merged) = merger();
        for mut channel in channels {
            handle.attach_channel(&mut channel)?;
        }
        // Handle drops here; the merge ends when the sources do.
        Ok(merged)
    }

    /// Consume the merge as raw byte chunks. Single-use; mutually
    /// exclusive with `text`.
    pub fn bytes(&mut self) -> Result<MergedBytes, OutputStreamError> {
        let rx = self.subscribe()?;
        Ok(MergedBytes {
            rx,
            lifecycle: self.lifecycle.clone(),
        })
    }

    /// Consume the merge as decoded text chunks. Single-use; mutually
    /// exclusive with `bytes`.
    pub fn text(&mut self) -> Result<MergedText, OutputStreamError> {
        let rx = self.subscribe()?;
        Ok(MergedText {
            rx,
            lifecycle: self.lifecycle.clone(),
            decoders: HashMap::new(),
            flush: Vec::new(),
            inner_done: false,
        })
    }

    fn subscribe(&mut self) -> Result<mpsc::UnboundedReceiver<ByteChunk>, OutputStreamError> {
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
}

/// Raw-byte view of a multiplexer.
#[derive(Debug)]
pub struct MergedBytes {
    rx: mpsc::UnboundedReceiver<ByteChunk>,
    lifecycle: Arc<Mutex<Lifecycle>>,
}

impl Stream for MergedBytes {
    type Item = ByteChunk;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => Poll::Ready(Some(chunk)),
            Poll::Ready(None) => {
                mark_done(&this.lifecycle);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Decoded-text view of a multiplexer, one decoder per source.
#[derive(Debug)]
pub struct MergedText {
    rx: mpsc::UnboundedReceiver<ByteChunk>,
    lifecycle: Arc<Mutex<Lifecycle>>,
    decoders: HashMap<String, (Arc<ChunkMeta>, Utf8Decoder)>,
    /// Per-source U+FFFD tails flushed after the last source ends.
    flush: Vec<TextChunk>,
    inner_done: bool,
}

impl Stream for MergedText {
    type Item = TextChunk;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if this.inner_done {
                if let Some(chunk) = this.flush.pop() {
                    return Poll::Ready(Some(chunk));
                }
                mark_done(&this.lifecycle);
                return Poll::Ready(None);
            }
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => {
                    let (meta, decoder) = this
                        .decoders
                        .entry(chunk.meta.key())
                        .or_insert_with(|| (chunk.meta.clone(), Utf8Decoder::new()));
                    let text = decoder.decode(&chunk.bytes);
                    if text.is_empty() {
                        continue;
                    }
                    return Poll::Ready(Some(TextChunk {
                        meta: meta.clone(),
                        text,
                    }));
                }
                Poll::Ready(None) => {
                    this.inner_done = true;
                    for (meta, decoder) in this.decoders.values_mut() {
                        if let Some(tail) = decoder.finish() {
                            this.flush.push(TextChunk {
                                meta: meta.clone(),
                                text: tail,
                            });
                        }
                    }
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medley_types::{ScriptTag, StreamName};
    use tokio::io::AsyncWriteExt;

    fn meta(script: &str, stream: StreamName) -> ChunkMeta {
        ChunkMeta::new(ScriptTag::new("pkg", script), stream)
    }

    #[tokio::test]
    async fn merges_two_channels_to_completion() {
        let (mut w1, r1) = tokio::io::duplex(64);
        let (mut w2, r2) = tokio::io::duplex(64);
        let c1 = OutputChannel::spawn(r1, meta("a", StreamName::Stdout));
        let c2 = OutputChannel::spawn(r2, meta("a", StreamName::Stderr));

        w1.write_all(b"out").await.unwrap();
        w2.write_all(b"err").await.unwrap();
        drop(w1);
        drop(w2);

        let mut merged = OutputMerger::from_channels([c1, c2]).unwrap();
        let chunks: Vec<_> = merged.bytes().unwrap().collect().await;
        assert_eq!(chunks.len(), 2);

        let mut seen: Vec<(String, Vec<u8>)> = chunks
            .into_iter()
            .map(|c| (c.meta.key(), c.bytes))
            .collect();
        seen.sort();
        assert_eq!(
            seen,
            vec![
                ("pkg:a:stderr".to_string(), b"err".to_vec()),
                ("pkg:a:stdout".to_string(), b"out".to_vec()),
            ]
        );
    }

    #[tokio::test]
    async fn fifo_within_one_source() {
        let (mut w, r) = tokio::io::duplex(64);
        let channel = OutputChannel::spawn(r, meta("a", StreamName::Stdout));
        let mut merged = OutputMerger::from_channels([channel]).unwrap();

        for i in 0..10u8 {
            w.write_all(&[i]).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        drop(w);

        let bytes: Vec<u8> = merged
            .bytes()
            .unwrap()
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .flat_map(|c| c.bytes)
            .collect();
        assert_eq!(bytes, (0..10u8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn single_subscription_applies_to_the_merge() {
        let (_w, r) = tokio::io::duplex(64);
        let channel = OutputChannel::spawn(r, meta("a", StreamName::Stdout));
        let mut merged = OutputMerger::from_channels([channel]).unwrap();

        let _text = merged.text().unwrap();
        assert_eq!(merged.bytes().unwrap_err(), OutputStreamError::Started);
        assert_eq!(merged.text().unwrap_err(), OutputStreamError::Started);
    }

    #[tokio::test]
    async fn late_attachment_through_a_handle() {
        let (handle, mut merged) = merger();
        let consumer = tokio::spawn(async move {
            merged.bytes().unwrap().collect::<Vec<_>>().await
        });

        let (mut w1, r1) = tokio::io::duplex(64);
        let mut c1 = OutputChannel::spawn(r1, meta("a", StreamName::Stdout));
        handle.attach_channel(&mut c1).unwrap();
        w1.write_all(b"first").await.unwrap();
        drop(w1);

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let (mut w2, r2) = tokio::io::duplex(64);
        let mut c2 = OutputChannel::spawn(r2, meta("b", StreamName::Stdout));
        handle.attach_channel(&mut c2).unwrap();
        w2.write_all(b"second").await.unwrap();
        drop(w2);

        drop(handle);
        let chunks = consumer.await.unwrap();
        let payloads: Vec<Vec<u8>> = chunks.into_iter().map(|c| c.bytes).collect();
        assert_eq!(payloads, vec![b"first".to_vec(), b"second".to_vec()]);
    }

    #[tokio::test]
    async fn text_mode_keeps_one_decoder_per_source() {
        let (mut w1, r1) = tokio::io::duplex(64);
        let (mut w2, r2) = tokio::io::duplex(64);
        let c1 = OutputChannel::spawn(r1, meta("a", StreamName::Stdout));
        let c2 = OutputChannel::spawn(r2, meta("b", StreamName::Stdout));
        let mut merged = OutputMerger::from_channels([c1, c2]).unwrap();

        // Source a: emoji split across two chunks with source b's output
        // interleaved between them.
        w1.write_all(b"\xF0\x9F").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        w2.write_all(b"plain").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        w1.write_all(b"\x98\x80").await.unwrap();
        drop(w1);
        drop(w2);

        let chunks: Vec<_> = merged.text().unwrap().collect().await;
        let a_text: String = chunks
            .iter()
            .filter(|c| c.meta.tag.script == "a")
            .map(|c| c.text.as_str())
            .collect();
        assert_eq!(a_text, "\u{1F600}");
    }
}
