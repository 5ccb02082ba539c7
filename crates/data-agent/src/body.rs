//! Bridges between HTTP bodies and the blocking streams of the archiver.
//!
//! The archiver and extractor run on their own threads with `std::io`
//! streams. [`ChannelWriter`] feeds a response body from such a thread and
//! [`BodyReader`] drains a request body into one, both through bounded
//! channels so neither side buffers a whole transfer.

use std::io::{self, Read, Write};
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::HeaderMap;
use bytes::{Buf, Bytes, BytesMut};
use futures_util::stream;
use http_body::Frame;
use http_body_util::{BodyExt, StreamBody};
use knitfab_archive::COPY_BUFFER_SIZE;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::DropGuard;

/// Frames queued between a producer thread and the connection.
const FRAME_QUEUE: usize = 8;

pub(crate) type FrameSender = mpsc::Sender<Result<Frame<Bytes>, io::Error>>;

/// A streaming response body and the sender feeding it.
///
/// Dropping the sender ends the body. Sending an `Err` aborts it, which
/// the client sees as a truncated transfer.
pub(crate) fn channel_body() -> (FrameSender, Body) {
    let (tx, mut rx) = mpsc::channel(FRAME_QUEUE);
    let frames = stream::poll_fn(move |cx| rx.poll_recv(cx));
    (tx, Body::new(StreamBody::new(frames)))
}

/// Blocking writer that forwards bytes as data frames.
///
/// Bytes are gathered into chunks of up to [`COPY_BUFFER_SIZE`]; a chunk
/// is sent when full or on `flush`. Must not be used from an async task.
pub(crate) struct ChannelWriter {
    tx: FrameSender,
    buf: BytesMut,
}

impl ChannelWriter {
    pub(crate) fn new(tx: FrameSender) -> Self {
        Self {
            tx,
            buf: BytesMut::with_capacity(COPY_BUFFER_SIZE),
        }
    }

    fn send_buffered(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = self.buf.split().freeze();
        self.tx
            .blocking_send(Ok(Frame::data(chunk)))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "response body closed"))
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let room = COPY_BUFFER_SIZE - self.buf.len();
        let n = buf.len().min(room);
        self.buf.extend_from_slice(&buf[..n]);
        if self.buf.len() >= COPY_BUFFER_SIZE {
            self.send_buffered()?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_buffered()
    }
}

/// Blocking reader over a request body.
///
/// Data frames are pumped by an async task; the trailers, if the client
/// sent any, are delivered separately once the data is exhausted.
pub(crate) struct BodyReader {
    rx: mpsc::Receiver<io::Result<Bytes>>,
    chunk: Bytes,
}

impl BodyReader {
    /// Starts pumping `body`. Must be called within a Tokio runtime.
    pub(crate) fn spawn(body: Body) -> (Self, oneshot::Receiver<HeaderMap>) {
        let (tx, rx) = mpsc::channel(FRAME_QUEUE);
        let (trailers_tx, trailers_rx) = oneshot::channel();
        tokio::spawn(pump(body, tx, trailers_tx));
        (
            Self {
                rx,
                chunk: Bytes::new(),
            },
            trailers_rx,
        )
    }
}

async fn pump(mut body: Body, tx: mpsc::Sender<io::Result<Bytes>>, trailers_tx: oneshot::Sender<HeaderMap>) {
    let mut trailers_tx = Some(trailers_tx);
    while let Some(frame) = body.frame().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                let _ = tx.send(Err(io::Error::other(err))).await;
                return;
            }
        };
        match frame.into_data() {
            Ok(data) => {
                if tx.send(Ok(data)).await.is_err() {
                    return;
                }
            }
            Err(frame) => {
                if let (Ok(trailers), Some(sender)) = (frame.into_trailers(), trailers_tx.take()) {
                    let _ = sender.send(trailers);
                }
            }
        }
    }
}

impl Read for BodyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while !self.chunk.has_remaining() {
            match self.rx.blocking_recv() {
                Some(Ok(chunk)) => self.chunk = chunk,
                Some(Err(err)) => return Err(err),
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.chunk.len());
        self.chunk.copy_to_slice(&mut buf[..n]);
        Ok(n)
    }
}

/// Response body that holds a guard until the body is dropped.
pub(crate) struct GuardedBody {
    inner: Body,
    _guard: DropGuard,
}

impl GuardedBody {
    pub(crate) fn new(inner: Body, guard: DropGuard) -> Self {
        Self { inner, _guard: guard }
    }
}

impl http_body::Body for GuardedBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.get_mut().inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}
