use std::io;
use std::sync::Arc;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{trace, warn};

/// Largest datagram read from a socket.
const RECV_BUFFER_SIZE: usize = 65536;

/// Outbound half of the datagram channel a connection runs over. Sending never blocks; a
/// datagram that cannot be queued is dropped, which the transport treats like any other loss.
pub trait DatagramSink: Send + 'static {
    fn send(&self, datagram: Bytes) -> io::Result<()>;
}

impl DatagramSink for mpsc::Sender<Bytes> {
    fn send(&self, datagram: Bytes) -> io::Result<()> {
        match self.try_send(datagram) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(datagram)) => {
                trace!(len = datagram.len(), "channel full, dropping datagram");
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(io::ErrorKind::BrokenPipe.into()),
        }
    }
}

impl DatagramSink for mpsc::UnboundedSender<Bytes> {
    fn send(&self, datagram: Bytes) -> io::Result<()> {
        mpsc::UnboundedSender::send(self, datagram).map_err(|_| io::ErrorKind::BrokenPipe.into())
    }
}

/// A connected UDP socket.
impl DatagramSink for Arc<UdpSocket> {
    fn send(&self, datagram: Bytes) -> io::Result<()> {
        match self.try_send(&datagram) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                trace!(len = datagram.len(), "socket busy, dropping datagram");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Splits a connected UDP socket into a sink and a queue of received datagrams, fed by a
/// background task that runs until the receiving side is dropped or the socket fails.
pub fn udp_channel(socket: UdpSocket, queue_len: usize) -> (Arc<UdpSocket>, mpsc::Receiver<Bytes>) {
    let socket = Arc::new(socket);
    let (tx, rx) = mpsc::channel(queue_len);
    let reader = socket.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            let n = match reader.recv(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "udp receive failed");
                    break;
                }
            };
            if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                break;
            }
        }
    });
    (socket, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn full_channel_drops_silently() {
        let (tx, mut rx) = mpsc::channel::<Bytes>(1);
        DatagramSink::send(&tx, Bytes::from_static(b"a")).unwrap();
        DatagramSink::send(&tx, Bytes::from_static(b"b")).unwrap();
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"a"));
        drop(rx);
        assert!(DatagramSink::send(&tx, Bytes::from_static(b"c")).is_err());
    }

    #[tokio::test]
    async fn udp_roundtrip() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        a.connect(b.local_addr().unwrap()).await.unwrap();
        b.connect(a.local_addr().unwrap()).await.unwrap();
        let (a_sink, _a_rx) = udp_channel(a, 8);
        let (_b_sink, mut b_rx) = udp_channel(b, 8);
        DatagramSink::send(&a_sink, Bytes::from_static(b"ping")).unwrap();
        assert_eq!(b_rx.recv().await.unwrap(), Bytes::from_static(b"ping"));
    }
}
