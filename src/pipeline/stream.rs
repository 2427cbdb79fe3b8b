//! Encoder output fan-out.
//!
//! ```text
//!                     ┌──► VariantWriter (cache, committed after encode)
//! Encoder ─► TeeWriter┤
//!                     └──► mpsc channel ─► HTTP response body
//! ```
//!
//! One encode serves both destinations. A client that goes away only
//! detaches its half; the cache half keeps receiving bytes so the work is
//! not lost. A cache writer that fails is dropped, which discards its
//! uncommitted entry.

use std::io::{self, Write};

use bytes::Bytes;
use futures_util::Stream;
use tokio::sync::mpsc;
use tracing::warn;

use crate::cache::VariantWriter;

/// Bytes accumulated before a chunk is handed to the client.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Chunks buffered in the client channel before the encoder waits.
pub const CHANNEL_CAPACITY: usize = 16;

pub type BodyChunk = Result<Bytes, io::Error>;

/// Response body of an image request.
#[derive(Debug)]
pub enum ImageBody {
    /// Complete bytes, e.g. read from the variant cache.
    Buffered(Bytes),
    /// Chunks produced while encoding. `head` was taken off the channel
    /// ahead of the rest.
    Stream {
        head: Option<Bytes>,
        rx: mpsc::Receiver<BodyChunk>,
    },
}

impl ImageBody {
    /// Create a streaming body and the sender feeding it.
    pub fn channel() -> (mpsc::Sender<BodyChunk>, ImageBody) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        (tx, ImageBody::Stream { head: None, rx })
    }

    /// Wait for the first chunk of a streaming body.
    ///
    /// An encoder that fails before its first chunk is reported here rather
    /// than as a truncated body. Outputs smaller than [`CHUNK_SIZE`] are
    /// complete once this returns; larger ones can still fail mid-stream.
    pub async fn ready(self) -> Result<ImageBody, io::Error> {
        match self {
            ImageBody::Stream { head: None, mut rx } => match rx.recv().await {
                Some(Ok(chunk)) => Ok(ImageBody::Stream {
                    head: Some(chunk),
                    rx,
                }),
                Some(Err(e)) => Err(e),
                None => Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "encoder produced no output",
                )),
            },
            body => Ok(body),
        }
    }

    /// Read the whole body into memory.
    pub async fn collect(self) -> Result<Bytes, io::Error> {
        match self {
            ImageBody::Buffered(data) => Ok(data),
            ImageBody::Stream { head, mut rx } => {
                let mut out = head.map(Vec::from).unwrap_or_default();
                while let Some(chunk) = rx.recv().await {
                    out.extend_from_slice(&chunk?);
                }
                Ok(Bytes::from(out))
            }
        }
    }

    /// Adapt the body into a stream of chunks.
    pub fn into_stream(self) -> impl Stream<Item = BodyChunk> + Send + 'static {
        let state = match self {
            ImageBody::Buffered(data) => (Some(data), None),
            ImageBody::Stream { head, rx } => (head, Some(rx)),
        };
        futures_util::stream::unfold(state, |(head, mut rx)| async move {
            if let Some(chunk) = head {
                return Some((Ok(chunk), (None, rx)));
            }
            let chunk = rx.as_mut()?.recv().await?;
            Some((chunk, (None, rx)))
        })
    }
}

/// `Write` adapter that copies encoder output to the cache and the client.
///
/// Must be driven from a blocking thread: client sends block when the
/// channel is full.
pub struct TeeWriter {
    key: String,
    cache: Option<Box<dyn VariantWriter>>,
    client: Option<mpsc::Sender<BodyChunk>>,
    pending: Vec<u8>,
    written: u64,
}

impl TeeWriter {
    pub fn new(
        key: impl Into<String>,
        cache: Option<Box<dyn VariantWriter>>,
        client: Option<mpsc::Sender<BodyChunk>>,
    ) -> Self {
        Self {
            key: key.into(),
            cache,
            client,
            pending: Vec::with_capacity(CHUNK_SIZE),
            written: 0,
        }
    }

    pub fn has_client(&self) -> bool {
        self.client.is_some()
    }

    pub fn has_cache(&self) -> bool {
        self.cache.is_some()
    }

    /// Total bytes accepted so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    fn send_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let chunk = Bytes::from(std::mem::replace(
            &mut self.pending,
            Vec::with_capacity(CHUNK_SIZE),
        ));
        if let Some(client) = &self.client {
            if client.blocking_send(Ok(chunk)).is_err() {
                tracing::debug!(key = %self.key, "Client disconnected, continuing cache write");
                self.client = None;
            }
        }
    }

    /// Flush the client half and hand back the cache writer for commit.
    pub fn finish(mut self) -> Option<Box<dyn VariantWriter>> {
        self.send_pending();
        self.cache.take()
    }

    /// Abort both halves: the client receives `error`, the cache writer is
    /// dropped uncommitted.
    pub fn fail(mut self, error: impl ToString) {
        self.cache = None;
        self.pending.clear();
        if let Some(client) = self.client.take() {
            let _ = client.blocking_send(Err(io::Error::other(error.to_string())));
        }
    }
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(cache) = self.cache.as_mut() {
            if let Err(e) = cache.write_all(buf) {
                warn!(key = %self.key, error = %e, "Variant cache write failed, entry discarded");
                self.cache = None;
            }
        }

        if self.client.is_some() {
            self.pending.extend_from_slice(buf);
            if self.pending.len() >= CHUNK_SIZE {
                self.send_pending();
            }
        }

        if self.cache.is_none() && self.client.is_none() {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "no remaining destination for encoded bytes",
            ));
        }
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(cache) = self.cache.as_mut() {
            if let Err(e) = cache.flush() {
                warn!(key = %self.key, error = %e, "Variant cache flush failed, entry discarded");
                self.cache = None;
            }
        }
        Ok(())
    }
}
