use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use bytes::Bytes;
use futures::future::poll_fn;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use crate::quic::{Error, ReadOutcome, StreamId};
use super::shared::Inner;

const DEFAULT_CHUNK: usize = 64 * 1024;

/// One stream of a [`Connection`](super::Connection).
///
/// Bytes are read and written through tokio's `AsyncRead`/`AsyncWrite`; shutting down the
/// writer sends the FIN. A reader sees end-of-file once the peer's FIN has been reached and an
/// error of kind `ConnectionReset` if the peer reset the stream.
pub struct Stream {
    id: StreamId,
    inner: Arc<Inner>,
    read_finished: bool,
    write_finished: bool,
}

impl Stream {
    pub(crate) fn new(id: StreamId, inner: Arc<Inner>) -> Self {
        Stream { id, inner, read_finished: false, write_finished: false }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Waits for the next run of in-order bytes, at most `max` long. Returns `None` once every
    /// byte up to the peer's FIN has been delivered.
    pub async fn read_chunk(&mut self, max: usize) -> Result<Option<Bytes>, Error> {
        poll_fn(|cx| self.poll_read_chunk(cx, max)).await
    }

    /// The received bytes as a lazy sequence of chunks, ending at the FIN.
    pub fn chunks(&mut self) -> Chunks<'_> {
        Chunks { stream: self }
    }

    /// Reads everything up to the FIN.
    pub async fn read_all(&mut self) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        while let Some(chunk) = self.read_chunk(DEFAULT_CHUNK).await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    pub fn poll_read_chunk(&mut self, cx: &mut Context<'_>, max: usize) -> Poll<Result<Option<Bytes>, Error>> {
        if self.read_finished {
            return Poll::Ready(Ok(None));
        }
        let mut shared = self.inner.lock();
        match shared.conn.read(self.id, max) {
            Ok(ReadOutcome::Data(data)) => {
                drop(shared);
                // reading may have opened the flow control window
                self.inner.notify_driver();
                Poll::Ready(Ok(Some(data)))
            }
            Ok(ReadOutcome::Finished) => {
                self.read_finished = true;
                Poll::Ready(Ok(None))
            }
            Ok(ReadOutcome::Blocked) => {
                shared.set_read_waker(self.id, cx.waker());
                Poll::Pending
            }
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_write_data(&mut self, cx: &mut Context<'_>, data: &[u8]) -> Poll<Result<usize, Error>> {
        let mut shared = self.inner.lock();
        match shared.conn.write(self.id, data) {
            Ok(0) if !data.is_empty() => {
                shared.set_write_waker(self.id, cx.waker());
                Poll::Pending
            }
            Ok(n) => {
                drop(shared);
                self.inner.notify_driver();
                Poll::Ready(Ok(n))
            }
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    /// Writes all of `data`, waiting for acknowledgements to free send buffer space as needed.
    pub async fn write_all_data(&mut self, mut data: &[u8]) -> Result<(), Error> {
        while !data.is_empty() {
            let n = poll_fn(|cx| self.poll_write_data(cx, data)).await?;
            data = &data[n..];
        }
        Ok(())
    }

    /// Sends the FIN after the data already written.
    pub fn finish(&mut self) -> Result<(), Error> {
        if self.write_finished {
            return Ok(());
        }
        self.inner.lock().conn.finish(self.id)?;
        self.write_finished = true;
        self.inner.notify_driver();
        Ok(())
    }

    /// Graceful close: the same as [`finish`](Stream::finish). Data already written is still
    /// delivered and retransmitted as needed.
    pub fn close(&mut self) -> Result<(), Error> {
        self.finish()
    }

    /// Abandons the sending half; the peer's reader sees `error_code`.
    pub fn reset(&mut self, error_code: u64) -> Result<(), Error> {
        self.inner.lock().conn.reset(self.id, error_code)?;
        self.write_finished = true;
        self.inner.notify_driver();
        Ok(())
    }
}

/// Dropping a handle finishes the sending half if that has not happened yet and discards
/// anything still arriving, so the stream is eventually forgotten and no longer counts against
/// the peer's stream limit.
impl Drop for Stream {
    fn drop(&mut self) {
        let mut shared = self.inner.lock();
        if !self.write_finished {
            let _ = shared.conn.finish(self.id);
        }
        if !self.read_finished {
            let _ = shared.conn.abandon_recv(self.id);
        }
        shared.forget_stream(self.id);
        drop(shared);
        self.inner.notify_driver();
    }
}

pub struct Chunks<'a> {
    stream: &'a mut Stream,
}

impl<'a> futures::Stream for Chunks<'a> {
    type Item = Result<Bytes, Error>;
    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = Pin::into_inner(self);
        this.stream.poll_read_chunk(cx, DEFAULT_CHUNK).map(Result::transpose)
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = Pin::into_inner(self);
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        match this.poll_read_chunk(cx, buf.remaining()) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(Some(data))) => {
                buf.put_slice(&data);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Ok(None)) => Poll::Ready(Ok(())),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e.into())),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = Pin::into_inner(self);
        this.poll_write_data(cx, buf).map_err(io::Error::from)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = Pin::into_inner(self);
        Poll::Ready(this.finish().map_err(io::Error::from))
    }
}
