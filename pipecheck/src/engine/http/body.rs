use core::{
    any::Any,
    pin::Pin,
    task::{Context, Poll},
};

use anyhow::Error;
use bytes::{Buf, Bytes};
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Empty, Full, StreamBody};
use hyper::body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Body type of every request and response passing through the client.
pub type BoxBody = UnsyncBoxBody<Bytes, Error>;

pub fn empty() -> BoxBody {
    Empty::new().map_err(|never| match never {}).boxed_unsync()
}

pub fn full<B: Into<Bytes>>(data: B) -> BoxBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed_unsync()
}

/// Creates an open-ended streaming body.
///
/// The body ends when the returned [`BodySender`] is dropped or finished, and
/// fails when it is aborted.
pub fn channel(buffer: usize) -> (BodySender, BoxBody) {
    let (tx, rx) = mpsc::channel(buffer);
    let body = StreamBody::new(ReceiverStream::new(rx)).boxed_unsync();

    (BodySender { tx }, body)
}

/// Writing half of [`channel`].
#[derive(Debug, Clone)]
pub struct BodySender {
    tx: mpsc::Sender<Result<Frame<Bytes>, Error>>,
}

impl BodySender {
    /// Sends a data frame.
    ///
    /// Fails if the body has been dropped by its consumer.
    pub async fn send(&self, data: Bytes) -> Result<(), Error> {
        self.tx
            .send(Ok(Frame::data(data)))
            .await
            .map_err(|_| anyhow::anyhow!("body receiver is gone"))
    }

    /// Terminates the body with an error.
    pub async fn abort(self, err: Error) {
        // Nothing to do if the consumer has already gone.
        let _ = self.tx.send(Err(err)).await;
    }

    /// Completes when the consumer drops the body.
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    /// Ends the body.
    #[inline]
    pub fn finish(self) {}
}

/// Reads the whole body.
pub async fn read_all(body: BoxBody) -> Result<Bytes, Error> {
    Ok(body.collect().await?.to_bytes())
}

/// Reads and discards the whole body.
pub async fn drain(mut body: BoxBody) -> Result<(), Error> {
    while let Some(frame) = body.frame().await {
        frame?;
    }

    Ok(())
}

/// Incremental reader over a [`BoxBody`].
#[derive(Debug)]
pub struct BodyReader {
    body: BoxBody,
    buf: Bytes,
}

impl BodyReader {
    pub fn new(body: BoxBody) -> Self {
        Self { body, buf: Bytes::new() }
    }

    /// Reads at most `max` bytes.
    ///
    /// Returns [`None`] at the end of the body. Never returns an empty chunk.
    pub async fn read(&mut self, max: usize) -> Result<Option<Bytes>, Error> {
        while self.buf.is_empty() {
            match self.body.frame().await {
                Some(frame) => {
                    if let Ok(data) = frame?.into_data() {
                        self.buf = data;
                    }
                }
                None => return Ok(None),
            }
        }

        let len = max.min(self.buf.len());
        Ok(Some(self.buf.split_to(len)))
    }

    /// Reads exactly `dst.len()` bytes.
    pub async fn read_exact(&mut self, dst: &mut [u8]) -> Result<(), Error> {
        let mut off = 0;
        while off < dst.len() {
            match self.read(dst.len() - off).await? {
                Some(mut chunk) => {
                    let len = chunk.remaining();
                    chunk.copy_to_slice(&mut dst[off..off + len]);
                    off += len;
                }
                None => anyhow::bail!("unexpected end of body after {off} bytes"),
            }
        }

        Ok(())
    }
}

pin_project! {
    /// Body that keeps an arbitrary value alive for as long as it exists.
    ///
    /// Used to tie connection handles to the lifetime of a response body.
    pub struct Guarded<B> {
        #[pin]
        inner: B,
        _guard: Box<dyn Any + Send>,
    }
}

impl<B> Guarded<B> {
    pub fn new<G: Any + Send>(inner: B, guard: G) -> Self {
        Self { inner, _guard: Box::new(guard) }
    }
}

impl<B> Body for Guarded<B>
where
    B: Body,
{
    type Data = B::Data;
    type Error = B::Error;

    #[inline]
    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        self.project().inner.poll_frame(cx)
    }

    #[inline]
    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    #[inline]
    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
