use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use bytes::Bytes;
use tokio::sync::mpsc;
use crate::io::DatagramSink;
use crate::quic::{self, Config, ConnectionError, ConnectionId, ConnectionStats, Direction, Error, Side};
use super::driver::{clock_now, drive};
use super::shared::Inner;
use super::stream::Stream;

/// Handle to a connection whose I/O runs on a background task. Cloning gives another handle
/// to the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Spawns the driver for a fresh core connection.
    pub(crate) fn spawn<S: DatagramSink>(
        side: Side,
        id: ConnectionId,
        sink: S,
        inbound: mpsc::Receiver<Bytes>,
        config: Config,
    ) -> Connection {
        let conn = quic::Connection::new(side, id, config, clock_now());
        let inner = Arc::new(Inner::new(conn));
        tokio::spawn(drive(inner.clone(), sink, inbound));
        Connection { inner }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.lock().conn.id()
    }

    pub fn side(&self) -> Side {
        self.inner.lock().conn.side()
    }

    /// Opens a new locally initiated stream. Nothing is sent until data or a FIN is written.
    pub fn open_stream(&self, direction: Direction) -> Result<Stream, Error> {
        let id = self.inner.lock().conn.open_stream(direction)?;
        Ok(Stream::new(id, self.inner.clone()))
    }

    /// Waits for the peer to open a stream. Returns `None` once the connection is closed.
    pub fn accept_stream(&self) -> Accept<'_> {
        Accept { conn: self }
    }

    /// Streams opened by the peer, as a lazy sequence.
    pub fn incoming(&self) -> Incoming {
        Incoming { conn: self.clone() }
    }

    fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<Option<Stream>> {
        let mut shared = self.inner.lock();
        if let Some(id) = shared.conn.accept_stream() {
            return Poll::Ready(Some(Stream::new(id, self.inner.clone())));
        }
        if shared.conn.is_closed() {
            return Poll::Ready(None);
        }
        shared.set_accept_waker(cx.waker());
        Poll::Pending
    }

    /// Closes the connection at once. The peer is told `error_code` and `reason`; every stream
    /// on both ends fails.
    pub fn close(&self, error_code: u64, reason: &[u8]) {
        self.inner.lock().conn.close(error_code, reason);
        self.inner.notify_driver();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().conn.is_closed()
    }

    pub fn error(&self) -> Option<ConnectionError> {
        self.inner.lock().conn.error().cloned()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.inner.lock().conn.stats()
    }
}

pub struct Accept<'a> {
    conn: &'a Connection,
}

impl<'a> Future for Accept<'a> {
    type Output = Option<Stream>;
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.conn.poll_accept(cx)
    }
}

pub struct Incoming {
    conn: Connection,
}

impl futures::Stream for Incoming {
    type Item = Stream;
    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Stream>> {
        self.conn.poll_accept(cx)
    }
}

/// Starts the client end of connection `id` over the given datagram channel.
pub fn connect<S: DatagramSink>(
    id: ConnectionId,
    sink: S,
    inbound: mpsc::Receiver<Bytes>,
    config: Config,
) -> Connection {
    Connection::spawn(Side::Client, id, sink, inbound, config)
}
