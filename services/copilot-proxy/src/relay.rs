//! Incremental response relay
//!
//! Copies an upstream response to a destination as it arrives: status and
//! headers first, then the body in chunks of at most `CHUNK_SIZE`, each
//! followed by a flush so streamed completion events reach the client
//! without waiting for more data. A destination that cannot flush gets the
//! whole remaining body in one write instead.
//!
//! Once the head is written nothing can be retracted. A read or write error
//! stops the copy and whatever was already flushed is what the client sees.

use std::future::Future;
use std::io;
use std::pin::Pin;

use axum::body::Body;
use axum::http::{HeaderMap, StatusCode};
use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

use crate::error::StreamError;

/// Largest body piece written between flushes.
pub const CHUNK_SIZE: usize = 32 * 1024;

/// Body frames buffered between the relay task and the client connection.
const CLIENT_CHANNEL_DEPTH: usize = 16;

pub type RelayFuture<'a> = Pin<Box<dyn Future<Output = Result<(), StreamError>> + Send + 'a>>;

/// Where a relayed response is written.
pub trait RelayTarget: Send {
    fn write_head<'a>(&'a mut self, status: StatusCode, headers: &'a HeaderMap) -> RelayFuture<'a>;

    fn write(&mut self, chunk: Bytes) -> RelayFuture<'_>;

    /// Push everything written so far to the client.
    fn flush(&mut self) -> RelayFuture<'_>;

    /// Whether `flush` delivers data before the response completes.
    fn supports_flush(&self) -> bool;

    /// Complete the response after the last write.
    fn finish(&mut self) -> RelayFuture<'_>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub bytes: u64,
    pub writes: usize,
    pub flushes: usize,
}

/// Copy `status`, `headers` and `body` to `target`.
///
/// Headers are handed over verbatim, repeated names included. Empty body
/// chunks are skipped.
pub async fn relay<T, S, E>(
    target: &mut T,
    status: StatusCode,
    headers: &HeaderMap,
    body: S,
) -> Result<RelayStats, StreamError>
where
    T: RelayTarget + ?Sized,
    S: Stream<Item = Result<Bytes, E>>,
    E: std::fmt::Display,
{
    let mut stats = RelayStats::default();
    let mut body = std::pin::pin!(body);

    target.write_head(status, headers).await?;

    if !target.supports_flush() {
        let mut all = BytesMut::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| StreamError::Read(e.to_string()))?;
            all.extend_from_slice(&chunk);
        }
        if !all.is_empty() {
            stats.bytes = all.len() as u64;
            stats.writes = 1;
            target.write(all.freeze()).await?;
        }
        target.finish().await?;
        return Ok(stats);
    }

    while let Some(chunk) = body.next().await {
        let mut chunk = chunk.map_err(|e| StreamError::Read(e.to_string()))?;
        while !chunk.is_empty() {
            let piece = chunk.split_to(chunk.len().min(CHUNK_SIZE));
            stats.bytes += piece.len() as u64;
            target.write(piece).await?;
            stats.writes += 1;
            target.flush().await?;
            stats.flushes += 1;
        }
    }

    target.finish().await?;
    Ok(stats)
}

/// Relay target feeding an axum response body.
///
/// The head goes out through a oneshot so the handler can build the
/// `Response`; body frames go through a bounded channel that backs
/// `Body::from_stream`. Writes are held until `flush` in incremental mode,
/// or until `finish` in bulk mode.
pub struct ClientBody {
    head: Option<oneshot::Sender<(StatusCode, HeaderMap)>>,
    frames: mpsc::Sender<Result<Bytes, io::Error>>,
    pending: Vec<Bytes>,
    incremental: bool,
}

/// Receiving half of a `ClientBody`.
pub struct ClientResponse {
    pub head: oneshot::Receiver<(StatusCode, HeaderMap)>,
    pub body: Body,
}

impl ClientBody {
    pub fn channel(incremental: bool) -> (Self, ClientResponse) {
        let (head_tx, head_rx) = oneshot::channel();
        let (frame_tx, frame_rx) = mpsc::channel(CLIENT_CHANNEL_DEPTH);
        (
            Self {
                head: Some(head_tx),
                frames: frame_tx,
                pending: Vec::new(),
                incremental,
            },
            ClientResponse {
                head: head_rx,
                body: Body::from_stream(ReceiverStream::new(frame_rx)),
            },
        )
    }

    async fn send_pending(&mut self) -> Result<(), StreamError> {
        for frame in self.pending.drain(..) {
            self.frames
                .send(Ok(frame))
                .await
                .map_err(|_| StreamError::Write("client connection closed".into()))?;
        }
        Ok(())
    }

    /// Resolves when the client stops reading the body.
    ///
    /// Lets the owner stop waiting on an idle upstream once nobody is
    /// listening. The returned future keeps the body open until dropped.
    pub fn client_gone(&self) -> impl Future<Output = ()> + Send + 'static {
        let frames = self.frames.clone();
        async move { frames.closed().await }
    }

    /// End the response with an error so the client sees a broken body
    /// rather than a clean, truncated one.
    pub async fn abort(&mut self, error: &StreamError) {
        self.pending.clear();
        let _ = self
            .frames
            .send(Err(io::Error::other(error.to_string())))
            .await;
    }
}

impl RelayTarget for ClientBody {
    fn write_head<'a>(&'a mut self, status: StatusCode, headers: &'a HeaderMap) -> RelayFuture<'a> {
        Box::pin(async move {
            let sender = self
                .head
                .take()
                .ok_or_else(|| StreamError::Write("response head already sent".into()))?;
            sender
                .send((status, headers.clone()))
                .map_err(|_| StreamError::Write("client connection closed".into()))
        })
    }

    fn write(&mut self, chunk: Bytes) -> RelayFuture<'_> {
        self.pending.push(chunk);
        Box::pin(async { Ok(()) })
    }

    fn flush(&mut self) -> RelayFuture<'_> {
        Box::pin(self.send_pending())
    }

    fn supports_flush(&self) -> bool {
        self.incremental
    }

    fn finish(&mut self) -> RelayFuture<'_> {
        Box::pin(self.send_pending())
    }
}
