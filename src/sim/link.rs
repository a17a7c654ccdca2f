//! In-memory datagram link for running the async API under tokio, with the same loss,
//! duplication and latency knobs as the deterministic simulator.

use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tracing::trace;
use crate::io::DatagramSink;
use super::network::ChannelParameters;

const QUEUE_LEN: usize = 1024;

/// Sending half of one direction of a link. Each datagram is delayed by its own task, so
/// datagrams with different latencies can overtake each other.
#[derive(Clone)]
pub struct LinkSink {
    tx: mpsc::Sender<Bytes>,
    parameters: ChannelParameters,
    rng: Arc<Mutex<StdRng>>,
}

impl LinkSink {
    fn draw(&self) -> (usize, Vec<Duration>) {
        let p = &self.parameters;
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        let copies = if rng.gen::<f64>() < p.dup_probability { 2 } else { 1 };
        let mut delays = Vec::with_capacity(copies);
        for _ in 0..copies {
            if rng.gen::<f64>() < p.loss_probability {
                continue;
            }
            let latency = if p.latency_max > p.latency_min {
                rng.gen_range(p.latency_min..=p.latency_max)
            }
            else {
                p.latency_min
            };
            delays.push(Duration::from_millis(latency));
        }
        (copies, delays)
    }
}

impl DatagramSink for LinkSink {
    fn send(&self, datagram: Bytes) -> io::Result<()> {
        if self.tx.is_closed() {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let (copies, delays) = self.draw();
        if delays.len() < copies {
            trace!(len = datagram.len(), "link dropped datagram");
        }
        for delay in delays {
            let tx = self.tx.clone();
            let datagram = datagram.clone();
            tokio::spawn(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let _ = tx.try_send(datagram);
            });
        }
        Ok(())
    }
}

/// One end of a link: where to send, and what has arrived.
pub struct LinkEnd {
    pub sink: LinkSink,
    pub inbound: mpsc::Receiver<Bytes>,
}

/// A bidirectional link whose two directions share `parameters` and one seeded generator.
pub fn pair(parameters: &ChannelParameters, seed: u64) -> (LinkEnd, LinkEnd) {
    let rng = Arc::new(Mutex::new(StdRng::seed_from_u64(seed)));
    let (a_tx, a_rx) = mpsc::channel(QUEUE_LEN);
    let (b_tx, b_rx) = mpsc::channel(QUEUE_LEN);
    let a = LinkEnd {
        sink: LinkSink { tx: b_tx, parameters: parameters.clone(), rng: rng.clone() },
        inbound: a_rx,
    };
    let b = LinkEnd {
        sink: LinkSink { tx: a_tx, parameters: parameters.clone(), rng },
        inbound: b_rx,
    };
    (a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn datagrams_cross_the_link() {
        let (a, mut b) = pair(&ChannelParameters { latency_min: 1, latency_max: 5, ..Default::default() }, 1);
        a.sink.send(Bytes::from_static(b"one")).unwrap();
        assert_eq!(b.inbound.recv().await.unwrap(), Bytes::from_static(b"one"));
    }

    #[tokio::test]
    async fn total_loss_delivers_nothing() {
        let parameters = ChannelParameters { latency_min: 0, latency_max: 0, loss_probability: 1.0, ..Default::default() };
        let (a, mut b) = pair(&parameters, 1);
        for _ in 0..10 {
            a.sink.send(Bytes::from_static(b"x")).unwrap();
        }
        tokio::task::yield_now().await;
        assert!(b.inbound.try_recv().is_err());
    }
}
