use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::task::{Context, Poll};
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace};
use crate::io::DatagramSink;
use crate::quic::protocol::packet::peek_connection_id;
use crate::quic::{Config, ConnectionId, Side};
use super::connection::Connection;

/// Datagrams queued per connection before the demultiplexer starts dropping them.
const CONNECTION_QUEUE_LEN: usize = 256;
const ACCEPT_QUEUE_LEN: usize = 16;

/// Server end of a datagram channel shared by many connections.
pub struct Listener {
    accepted: mpsc::Receiver<Connection>,
}

impl Listener {
    /// Next connection opened by a peer. Returns `None` once the inbound channel has closed and
    /// every connection seen so far has been handed out.
    pub async fn accept(&mut self) -> Option<Connection> {
        self.accepted.recv().await
    }
}

impl futures::Stream for Listener {
    type Item = Connection;
    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Connection>> {
        Pin::into_inner(self).accepted.poll_recv(cx)
    }
}

/// Accepts connections on a shared datagram channel, routing each datagram by the connection id
/// in its header. The first datagram carrying an unseen id creates a server-side connection.
pub fn listen<S: DatagramSink + Clone>(sink: S, inbound: mpsc::Receiver<Bytes>, config: Config) -> Listener {
    let (tx, rx) = mpsc::channel(ACCEPT_QUEUE_LEN);
    tokio::spawn(demux(sink, inbound, config, tx));
    Listener { accepted: rx }
}

async fn demux<S: DatagramSink + Clone>(
    sink: S,
    mut inbound: mpsc::Receiver<Bytes>,
    config: Config,
    accepted: mpsc::Sender<Connection>,
) {
    let mut routes: HashMap<ConnectionId, mpsc::Sender<Bytes>> = HashMap::new();
    // Ids whose connection has ended. Late datagrams for them are dropped rather than starting
    // a new connection.
    let mut finished: HashSet<ConnectionId> = HashSet::new();

    while let Some(datagram) = inbound.recv().await {
        let id = match peek_connection_id(&datagram) {
            Some(id) => id,
            None => {
                trace!(len = datagram.len(), "dropping datagram without a connection id");
                continue;
            }
        };
        if finished.contains(&id) {
            continue;
        }

        if let Some(route) = routes.get(&id) {
            match route.try_send(datagram) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => trace!(conn = %id, "connection queue full, dropping datagram"),
                Err(TrySendError::Closed(_)) => {
                    debug!(conn = %id, "connection finished");
                    routes.remove(&id);
                    finished.insert(id);
                }
            }
            continue;
        }

        if accepted.is_closed() {
            trace!(conn = %id, "listener dropped, ignoring new connection");
            continue;
        }
        debug!(conn = %id, "new connection");
        let (route, conn_inbound) = mpsc::channel(CONNECTION_QUEUE_LEN);
        let conn = Connection::spawn(Side::Server, id, sink.clone(), conn_inbound, config.clone());
        // The first datagram always fits an empty queue.
        let _ = route.try_send(datagram);
        routes.insert(id, route);
        if accepted.send(conn).await.is_err() {
            trace!(conn = %id, "listener dropped before accepting");
        }
    }
    debug!(connections = routes.len(), "listener channel closed");
}
