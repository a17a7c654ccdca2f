use bytes::Bytes;
use crate::quic::{Config, Connection, ConnectionId, Side};
use super::network::{ChannelParameters, ChannelStats, Endpoint};
use super::opt_min;
use super::simulation::Simulation;

/// A client and a server core connection joined by a simulated link.
///
/// Nothing happens on its own: each call to [`step`](SimPair::step) delivers the datagrams that
/// have arrived, fires expired timers and sends everything both sides have ready at the current
/// simulated time. [`advance`](SimPair::advance) then jumps the clock to the next event.
pub struct SimPair {
    sim: Simulation,
    pub client: Connection,
    pub server: Connection,
    client_end: Endpoint<Bytes>,
    server_end: Endpoint<Bytes>,
}

impl SimPair {
    pub fn new(sim: &Simulation, parameters: &ChannelParameters, config: Config) -> Self {
        let (client_end, server_end) = Endpoint::make_pair("client", "server", sim, parameters);
        let id = ConnectionId(0x5157_4d55_5800_0001);
        let now = sim.instant();
        SimPair {
            sim: sim.clone(),
            client: Connection::new(Side::Client, id, config.clone(), now),
            server: Connection::new(Side::Server, id, config, now),
            client_end,
            server_end,
        }
    }

    pub fn sim(&self) -> &Simulation {
        &self.sim
    }

    pub fn current_time(&self) -> u64 {
        self.sim.current_time()
    }

    /// Datagram counters for the client-to-server and server-to-client channels.
    pub fn channel_stats(&self) -> (ChannelStats, ChannelStats) {
        (self.client_end.send_stats(), self.server_end.send_stats())
    }

    /// Runs both endpoints at the current simulated time until neither has anything to do.
    pub fn step(&mut self) {
        let now = self.sim.instant();
        Self::step_side(&mut self.client, &mut self.client_end, now);
        Self::step_side(&mut self.server, &mut self.server_end, now);
        // The client may have something to say about what the server just sent, if latency
        // is zero.
        Self::step_side(&mut self.client, &mut self.client_end, now);
    }

    fn step_side(conn: &mut Connection, end: &mut Endpoint<Bytes>, now: std::time::Instant) {
        while let Some(datagram) = end.recv() {
            // A fatal error closes the connection; the peer learns of it from CONNECTION_CLOSE.
            let _ = conn.on_packet_received(datagram, now);
        }
        if conn.poll_timeout().map_or(false, |t| t <= now) {
            conn.on_timeout(now);
        }
        for datagram in conn.send_pending(now) {
            end.send(datagram);
        }
    }

    /// Millisecond of the next datagram arrival or timer expiry, if any.
    pub fn next_event_time(&self) -> Option<u64> {
        let timer = |conn: &Connection| conn.poll_timeout().map(|t| self.sim.millis_at(t));
        opt_min(&[
            self.client_end.next_recv_time(),
            self.server_end.next_recv_time(),
            timer(&self.client),
            timer(&self.server),
        ])
    }

    /// Moves the clock to the next event, but never past `limit`. Returns false if there was
    /// nothing left to wait for before `limit`.
    pub fn advance(&mut self, limit: u64) -> bool {
        let now = self.sim.current_time();
        match self.next_event_time() {
            Some(t) if t <= limit => {
                self.sim.set_time(t.max(now + 1));
                true
            }
            _ => false,
        }
    }

    /// Steps the pair until `done` returns true or simulated time would pass `limit` ms.
    /// `done` runs after every step and may drive the application side of either connection.
    pub fn run_until<F>(&mut self, limit: u64, mut done: F) -> bool
    where
        F: FnMut(&mut SimPair) -> bool,
    {
        loop {
            self.step();
            if done(self) {
                return true;
            }
            // The callback may have queued data to send.
            self.step();
            if !self.advance(limit) {
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quic::{Direction, ReadOutcome};

    #[test]
    fn transfer_over_lossless_link() {
        let sim = Simulation::seeded(0);
        let mut pair = SimPair::new(&sim, &ChannelParameters::default(), Config::default());
        let id = pair.client.open_stream(Direction::Bidirectional).unwrap();
        pair.client.write(id, b"hello").unwrap();
        pair.client.finish(id).unwrap();

        let mut received = Vec::new();
        let finished = pair.run_until(10_000, |pair| {
            while let Some(peer) = pair.server.accept_stream() {
                assert_eq!(peer, id);
            }
            loop {
                match pair.server.read(id, 1024) {
                    Ok(ReadOutcome::Data(data)) => received.extend_from_slice(&data),
                    Ok(ReadOutcome::Finished) => return true,
                    _ => return false,
                }
            }
        });
        assert!(finished);
        assert_eq!(received, b"hello");
        // one-way latency of 20 ms
        assert!(pair.current_time() >= 20);
    }

    #[test]
    fn idle_pair_times_out() {
        let sim = Simulation::seeded(0);
        let mut pair = SimPair::new(&sim, &ChannelParameters::default(), Config::default());
        let closed = pair.run_until(60_000, |pair| pair.client.is_closed() && pair.server.is_closed());
        assert!(closed);
        assert_eq!(pair.current_time(), 30_000);
    }
}
