use std::sync::Arc;
use std::time::{Duration, Instant};
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use crate::io::DatagramSink;
use super::shared::Inner;

// Upper bound on a single sleep; the deadline is recomputed every iteration anyway.
const MAX_SLEEP: Duration = Duration::from_secs(3600);

/// Current time on tokio's clock, which stands still while a test has paused it.
pub(crate) fn clock_now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Runs one connection: feeds received datagrams and timer expiries into the core, sends
/// whatever it produces, and wakes application tasks. Returns once the connection is closed
/// and its final datagram, if any, has been sent.
pub(crate) async fn drive<S: DatagramSink>(inner: Arc<Inner>, sink: S, mut inbound: mpsc::Receiver<Bytes>) {
    let id = inner.lock().conn.id();
    debug!(conn = %id, "driver started");
    loop {
        let now = clock_now();
        let (datagrams, deadline, closed) = {
            let mut shared = inner.lock();
            let datagrams = shared.conn.send_pending(now);
            shared.wake_all();
            (datagrams, shared.conn.poll_timeout(), shared.conn.is_closed())
        };

        for datagram in datagrams {
            if let Err(e) = sink.send(datagram) {
                warn!(conn = %id, error = %e, "datagram send failed");
            }
        }
        if closed {
            break;
        }

        let deadline = deadline.unwrap_or(now + MAX_SLEEP).min(now + MAX_SLEEP);
        tokio::select! {
            received = inbound.recv() => {
                let mut shared = inner.lock();
                match received {
                    Some(datagram) => {
                        let now = clock_now();
                        if let Err(e) = shared.conn.on_packet_received(datagram, now) {
                            debug!(conn = %id, error = %e, "connection failed");
                        }
                    }
                    None => {
                        debug!(conn = %id, "datagram channel closed");
                        shared.conn.close(0, b"channel closed");
                    }
                }
            }
            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                trace!(conn = %id, "timer fired");
                inner.lock().conn.on_timeout(clock_now());
            }
            _ = inner.notify.notified() => {}
        }
    }

    inner.lock().wake_all();
    debug!(conn = %id, "driver finished");
}
