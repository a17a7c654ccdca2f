use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use bytes::Bytes;
use super::simulation::Simulation;
use super::opt_min;

#[derive(Debug, Clone)]
pub struct ChannelParameters {
    // number of ms between a packet having been injected into the network, and it arriving at
    // its destination
    pub latency_min: u64,
    pub latency_max: u64,

    // number of ms between two packets leaving the sender; 0 for unlimited bandwidth
    pub inv_bandwidth: u64,

    // probability that a packet, once injected into the network, will be duplicated (determined
    // before loss)
    pub dup_probability: f64,

    // probability that each copy of a packet will be lost along the way
    pub loss_probability: f64,
}

impl Default for ChannelParameters {
    fn default() -> Self {
        ChannelParameters {
            latency_min: 20,
            latency_max: 20,
            inv_bandwidth: 0,
            dup_probability: 0.0,
            loss_probability: 0.0,
        }
    }
}

struct MessageInTransit<M> {
    message_no: u64,
    recv_time: u64,
    recv_priority: u64,
    message: M,
}

pub trait ChannelMessage {
    fn size(&self) -> usize;

    fn description(&self) -> String;
}

impl ChannelMessage for Bytes {
    fn size(&self) -> usize {
        self.len()
    }

    fn description(&self) -> String {
        format!("datagram of {} bytes", self.len())
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChannelStats {
    pub sent: u64,
    pub duplicated: u64,
    pub dropped: u64,
    pub delivered: u64,
}

/// One direction of a simulated link.
pub struct Channel<M : ChannelMessage + Clone> {
    sim: Simulation,
    name: String,
    messages: Vec<MessageInTransit<M>>,
    next_message_no: u64,
    next_send_time: u64,
    parameters: ChannelParameters,
    stats: ChannelStats,
}

impl<M> Channel<M> where M : ChannelMessage + Clone {
    pub fn new(name: &str, sim: &Simulation, parameters: &ChannelParameters) -> Self {
        Channel {
            name: String::from(name),
            sim: sim.clone(),
            messages: Vec::new(),
            next_message_no: 0,
            next_send_time: 0,
            parameters: parameters.clone(),
            stats: ChannelStats::default(),
        }
    }

    pub fn next_send_time(&self) -> u64 {
        self.next_send_time
    }

    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    /// Injects a message. Messages sent faster than the bandwidth allows queue up behind each
    /// other and leave the sender `inv_bandwidth` ms apart.
    pub fn send(&mut self, message: M) {
        let send_time = self.next_send_time.max(self.sim.current_time());
        self.next_send_time = send_time + self.parameters.inv_bandwidth;
        self.stats.sent += 1;

        let count =
        if self.sim.gen_random::<f64>() < self.parameters.dup_probability { 2 } else { 1 };
        if count > 1 {
            self.stats.duplicated += 1;
        }

        for _ in 0..count {
            let message_no = self.next_message_no;
            self.next_message_no += 1;

            let mut latency: u64 = self.parameters.latency_min;
            if let Some(delta) = self.parameters.latency_max.checked_sub(self.parameters.latency_min) {
                latency += (self.sim.gen_random::<f64>() * (delta as f64)) as u64;
            }
            let recv_time = send_time + latency;

            if self.sim.gen_random::<f64>() < self.parameters.loss_probability {
                self.sim.trace_channel_drop(&self.name, message_no, &message.description());
                self.stats.dropped += 1;
                continue;
            }

            let recv_priority = self.sim.gen_random::<u64>();

            self.sim.trace_channel_send(&self.name, message_no, &message.description());
            self.messages.push(MessageInTransit {
                message_no,
                recv_time,
                recv_priority,
                message: message.clone(),
            });
        }
    }

    pub fn next_recv_time(&self) -> Option<u64> {
        self.messages.iter().map(|mit| mit.recv_time).min()
    }

    /// Takes the next message that has arrived by the current simulated time. Messages arriving
    /// in the same millisecond come out in a random but seed-determined order.
    pub fn recv(&mut self) -> Option<M> {
        let now = self.sim.current_time();
        let next_recv_time = self.next_recv_time().filter(|t| *t <= now)?;

        let (index, _) = self.messages.iter()
            .enumerate()
            .filter(|(_, mit)| mit.recv_time == next_recv_time)
            .min_by_key(|(_, mit)| mit.recv_priority)?;

        let mit = self.messages.remove(index);
        self.sim.trace_channel_recv(&self.name, mit.message_no, &mit.message.description());
        self.stats.delivered += 1;
        Some(mit.message)
    }
}

fn lock<M: ChannelMessage + Clone>(channel: &Mutex<Channel<M>>) -> MutexGuard<'_, Channel<M>> {
    channel.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One end of a bidirectional link made of two channels.
pub struct Endpoint<M> where M : ChannelMessage + Clone {
    send_channel: Arc<Mutex<Channel<M>>>,
    recv_channel: Arc<Mutex<Channel<M>>>,
}

impl<M> Endpoint<M> where M : ChannelMessage + Clone {
    pub fn make_pair(
        name1: &str,
        name2: &str,
        sim: &Simulation,
        parameters: &ChannelParameters,
    ) -> (Endpoint<M>, Endpoint<M>) {
        let fst = Arc::new(Mutex::new(Channel::new(name1, sim, parameters)));
        let snd = Arc::new(Mutex::new(Channel::new(name2, sim, parameters)));

        let fs = Endpoint {
            send_channel: fst.clone(),
            recv_channel: snd.clone(),
        };

        let sf = Endpoint {
            send_channel: snd,
            recv_channel: fst,
        };

        (fs, sf)
    }

    pub fn next_send_time(&self) -> u64 {
        lock(&self.send_channel).next_send_time()
    }

    pub fn next_recv_time(&self) -> Option<u64> {
        lock(&self.recv_channel).next_recv_time()
    }

    pub fn send(&mut self, message: M) {
        lock(&self.send_channel).send(message)
    }

    pub fn recv(&mut self) -> Option<M> {
        lock(&self.recv_channel).recv()
    }

    /// Counters for the channel this endpoint sends on.
    pub fn send_stats(&self) -> ChannelStats {
        lock(&self.send_channel).stats().clone()
    }

    pub fn next_event_time(&self) -> Option<u64> {
        opt_min(&[Some(self.next_send_time()), self.next_recv_time()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(loss: f64, dup: f64) -> ChannelParameters {
        ChannelParameters {
            latency_min: 10,
            latency_max: 30,
            inv_bandwidth: 0,
            dup_probability: dup,
            loss_probability: loss,
        }
    }

    #[test]
    fn messages_arrive_after_latency() {
        let mut sim = Simulation::seeded(1);
        let (mut a, mut b) = Endpoint::<Bytes>::make_pair("a->b", "b->a", &sim, &params(0.0, 0.0));
        a.send(Bytes::from_static(b"x"));
        let arrival = b.next_recv_time().unwrap();
        assert!((10..=30).contains(&arrival));
        assert_eq!(b.recv(), None);
        sim.set_time(arrival);
        assert_eq!(b.recv(), Some(Bytes::from_static(b"x")));
        assert_eq!(b.recv(), None);
    }

    #[test]
    fn lossy_channel_drops_each_copy_independently() {
        let mut sim = Simulation::seeded(7);
        let (mut a, mut b) = Endpoint::<Bytes>::make_pair("a->b", "b->a", &sim, &params(0.5, 0.5));
        for _ in 0..1000 {
            a.send(Bytes::from_static(b"x"));
        }
        sim.set_time(100);
        let mut delivered = 0;
        while b.recv().is_some() {
            delivered += 1;
        }
        let stats = a.send_stats();
        assert_eq!(stats.sent, 1000);
        assert!(stats.duplicated > 0);
        assert!(stats.dropped > 0);
        assert_eq!(stats.delivered, delivered);
        assert_eq!(stats.sent + stats.duplicated, stats.dropped + stats.delivered);
    }

    #[test]
    fn bandwidth_spaces_out_sends() {
        let mut sim = Simulation::seeded(3);
        let parameters = ChannelParameters { inv_bandwidth: 5, ..params(0.0, 0.0) };
        let (mut a, _b) = Endpoint::<Bytes>::make_pair("a->b", "b->a", &sim, &parameters);
        a.send(Bytes::from_static(b"1"));
        a.send(Bytes::from_static(b"2"));
        assert_eq!(a.next_send_time(), 10);
        sim.set_time(100);
        a.send(Bytes::from_static(b"3"));
        assert_eq!(a.next_send_time(), 105);
    }
}
