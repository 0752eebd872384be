//! Write instrumentation.
//!
//! Detects the moment a request has been completely written to the wire, so
//! that checks can order the sender and the receiver of a transfer.

use core::{
    pin::Pin,
    sync::atomic::{AtomicBool, Ordering},
    task::{Context, Poll},
};
use std::{io, sync::Arc};

use hyper::body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::oneshot::Oneshot;

/// Notifies a waiting check that the request has been written.
///
/// Fires at most once. If dropped without firing, for example because the
/// connection failed, the cell is closed so that nobody waits forever.
#[derive(Debug, Default)]
pub struct WriteSignal {
    cell: Option<Oneshot<()>>,
}

impl WriteSignal {
    pub fn new(cell: Option<Oneshot<()>>) -> Self {
        Self { cell }
    }

    pub fn fire(&mut self) {
        if let Some(cell) = self.cell.take() {
            if !cell.try_send(()) {
                log::trace!("wrote-request signal is already settled");
            }
        }
    }
}

impl Drop for WriteSignal {
    fn drop(&mut self) {
        if let Some(cell) = self.cell.take() {
            cell.close();
        }
    }
}

/// What "completely written" means on the particular wire.
#[derive(Debug)]
pub enum WireWatch {
    /// HTTP/1.1: everything is flushed after the request body ended.
    ///
    /// hyper flushes an idle connection before the request goes out, so a
    /// flush only counts once some of the request has been written.
    Http1 { body_done: Arc<AtomicBool>, written: bool },
    /// HTTP/2: a frame ending stream 1 has been written and flushed.
    H2(H2FrameTracker),
}

impl WireWatch {
    /// Instruments an HTTP/1.1 request body.
    ///
    /// Returns the watch for the connection I/O together with the wrapped
    /// body.
    pub fn http1<B: Body>(body: B) -> (Self, ObservedBody<B>) {
        let body_done = Arc::new(AtomicBool::new(body.is_end_stream()));
        let body = ObservedBody {
            inner: body,
            done: body_done.clone(),
        };

        (Self::Http1 { body_done, written: false }, body)
    }

    pub fn h2() -> Self {
        Self::H2(H2FrameTracker::new())
    }

    fn on_write(&mut self, buf: &[u8]) {
        match self {
            Self::Http1 { written, .. } => *written |= !buf.is_empty(),
            Self::H2(tracker) => tracker.feed(buf),
        }
    }

    fn is_complete(&self) -> bool {
        match self {
            Self::Http1 { body_done, written } => *written && body_done.load(Ordering::Acquire),
            Self::H2(tracker) => tracker.end_stream_written(),
        }
    }
}

pin_project! {
    /// I/O object that reports when the request has been flushed.
    pub struct ObservedIo<T> {
        #[pin]
        inner: T,
        watch: WireWatch,
        signal: WriteSignal,
    }
}

impl<T> ObservedIo<T> {
    pub fn new(inner: T, watch: WireWatch, signal: WriteSignal) -> Self {
        Self { inner, watch, signal }
    }
}

impl<T: AsyncRead> AsyncRead for ObservedIo<T> {
    #[inline]
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_read(cx, buf)
    }
}

impl<T: AsyncWrite> AsyncWrite for ObservedIo<T> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.project();

        let poll = this.inner.poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &poll {
            this.watch.on_write(&buf[..*n]);
        }

        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.project();

        let poll = this.inner.poll_flush(cx);
        if let Poll::Ready(Ok(())) = &poll {
            if this.watch.is_complete() {
                this.signal.fire();
            }
        }

        poll
    }

    #[inline]
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

pin_project! {
    /// Request body that records when it has been fully produced.
    pub struct ObservedBody<B> {
        #[pin]
        inner: B,
        done: Arc<AtomicBool>,
    }
}

impl<B: Body> Body for ObservedBody<B> {
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let mut this = self.project();

        let poll = this.inner.as_mut().poll_frame(cx);
        match &poll {
            Poll::Ready(None) => this.done.store(true, Ordering::Release),
            Poll::Ready(Some(Ok(..))) => {
                // The connection may stop polling once the body says it has
                // ended.
                if this.inner.is_end_stream() {
                    this.done.store(true, Ordering::Release);
                }
            }
            Poll::Ready(Some(Err(..))) | Poll::Pending => {}
        }

        poll
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

const H2_PREFACE_LEN: usize = 24;
const H2_FRAME_HEADER_LEN: usize = 9;
const H2_FRAME_DATA: u8 = 0x0;
const H2_FRAME_HEADERS: u8 = 0x1;
const H2_FLAG_END_STREAM: u8 = 0x1;

/// Incremental parser of the client side of an HTTP/2 connection.
///
/// Only frame boundaries are tracked; payloads are skipped.
#[derive(Debug)]
pub struct H2FrameTracker {
    preface_left: usize,
    header: [u8; H2_FRAME_HEADER_LEN],
    header_len: usize,
    payload_left: usize,
    payload_ends_stream: bool,
    end_stream_written: bool,
}

impl H2FrameTracker {
    pub fn new() -> Self {
        Self {
            preface_left: H2_PREFACE_LEN,
            header: [0; H2_FRAME_HEADER_LEN],
            header_len: 0,
            payload_left: 0,
            payload_ends_stream: false,
            end_stream_written: false,
        }
    }

    #[inline]
    pub fn end_stream_written(&self) -> bool {
        self.end_stream_written
    }

    pub fn feed(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            if self.preface_left > 0 {
                let n = self.preface_left.min(data.len());
                self.preface_left -= n;
                data = &data[n..];
                continue;
            }

            if self.payload_left > 0 {
                let n = self.payload_left.min(data.len());
                self.payload_left -= n;
                data = &data[n..];
                if self.payload_left == 0 && self.payload_ends_stream {
                    self.end_stream_written = true;
                }
                continue;
            }

            let n = (H2_FRAME_HEADER_LEN - self.header_len).min(data.len());
            self.header[self.header_len..self.header_len + n].copy_from_slice(&data[..n]);
            self.header_len += n;
            data = &data[n..];

            if self.header_len == H2_FRAME_HEADER_LEN {
                self.on_frame_header();
            }
        }
    }

    fn on_frame_header(&mut self) {
        let h = &self.header;
        let len = u32::from_be_bytes([0, h[0], h[1], h[2]]) as usize;
        let ty = h[3];
        let flags = h[4];
        let stream_id = u32::from_be_bytes([h[5], h[6], h[7], h[8]]) & 0x7fff_ffff;

        self.header_len = 0;
        self.payload_left = len;

        let ends_stream = stream_id != 0
            && (ty == H2_FRAME_DATA || ty == H2_FRAME_HEADERS)
            && flags & H2_FLAG_END_STREAM != 0;
        if ends_stream && len == 0 {
            self.end_stream_written = true;
        }
        self.payload_ends_stream = ends_stream;
    }
}

impl Default for H2FrameTracker {
    fn default() -> Self {
        Self::new()
    }
}
