//! One endpoint of a multiplexed connection, independent of any I/O.
//!
//! The caller feeds received datagrams into [`Connection::on_packet_received`], asks
//! [`Connection::poll_transmit`] for datagrams to send, and calls [`Connection::on_timeout`] once
//! [`Connection::poll_timeout`] has passed. Every method takes the current time explicitly so
//! the same code runs under tokio and under the deterministic simulator.

mod receive;
mod transmit;

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::{Duration, Instant};
use bytes::Bytes;
use tracing::debug;
use super::config::Config;
use super::congestion::CongestionController;
use super::flow_control::{ReceiveWindow, SendCredit};
use super::protocol::{ConnectionError, ConnectionId, Direction, Error, FlowScope, Frame, Side, StreamId};
use super::ranges::RangeSet;
use super::recovery::Recovery;
use super::stream::{ReadOutcome, RecvState, SendState, StreamState, StreamStats};

/// Received packet numbers older than this many ranges are forgotten.
const MAX_ACK_RANGES: usize = 32;

fn dir_index(direction: Direction) -> usize {
    match direction {
        Direction::Bidirectional => 0,
        Direction::Unidirectional => 1,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStats {
    pub datagrams_sent: u64,
    pub datagrams_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_lost: u64,
    pub bytes_retransmitted: u64,
    pub cwnd: u64,
    pub bytes_in_flight: u64,
    pub smoothed_rtt: Duration,
    pub streams: Vec<StreamStats>,
}

#[derive(Debug, Default)]
struct Counters {
    datagrams_sent: u64,
    datagrams_received: u64,
    bytes_sent: u64,
    bytes_received: u64,
    packets_lost: u64,
    bytes_retransmitted: u64,
}

pub struct Connection {
    side: Side,
    id: ConnectionId,
    config: Config,
    error: Option<ConnectionError>,
    close_frame: Option<Frame>,

    streams: HashMap<StreamId, StreamState>,
    // Streams with something to send, in round-robin order. `scheduled` mirrors membership.
    send_queue: VecDeque<StreamId>,
    scheduled: BTreeSet<StreamId>,
    pending_accept: VecDeque<StreamId>,

    next_local_index: [u64; 2],
    peer_max_streams: [u64; 2],
    next_remote_index: [u64; 2],
    local_max_streams: [u64; 2],
    pending_max_streams: [bool; 2],

    conn_recv: ReceiveWindow,
    conn_send: SendCredit,
    pending_max_data: bool,
    pending_stream_max_data: BTreeSet<StreamId>,
    pending_resets: BTreeSet<StreamId>,

    recovery: Recovery,
    cc: CongestionController,
    next_packet_number: u64,
    received_packets: RangeSet,
    received_floor: u64,
    largest_received_time: Option<Instant>,
    ack_pending: bool,
    probes_pending: u32,
    last_activity: Instant,

    counters: Counters,
}

impl Connection {
    pub fn new(side: Side, id: ConnectionId, config: Config, now: Instant) -> Self {
        let streams_limit = config.max_concurrent_streams;
        let cc = CongestionController::new(
            config.max_datagram_size as u64,
            config.initial_window,
            config.minimum_window,
            config.maximum_window,
            config.decrease_factor,
        );
        Connection {
            side,
            id,
            error: None,
            close_frame: None,
            streams: HashMap::new(),
            send_queue: VecDeque::new(),
            scheduled: BTreeSet::new(),
            pending_accept: VecDeque::new(),
            next_local_index: [0; 2],
            peer_max_streams: [streams_limit; 2],
            next_remote_index: [0; 2],
            local_max_streams: [streams_limit; 2],
            pending_max_streams: [false; 2],
            conn_recv: ReceiveWindow::new(FlowScope::Connection, config.connection_receive_window),
            conn_send: SendCredit::new(config.connection_receive_window),
            pending_max_data: false,
            pending_stream_max_data: BTreeSet::new(),
            pending_resets: BTreeSet::new(),
            recovery: Recovery::new(config.initial_rtt, config.packet_threshold),
            cc,
            next_packet_number: 0,
            received_packets: RangeSet::new(),
            received_floor: 0,
            largest_received_time: None,
            ack_pending: false,
            probes_pending: 0,
            last_activity: now,
            counters: Counters::default(),
            config,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.error.is_some()
    }

    /// Why the connection ended, once it has.
    pub fn error(&self) -> Option<&ConnectionError> {
        self.error.as_ref()
    }

    fn check_open(&self) -> Result<(), Error> {
        match &self.error {
            Some(e) => Err(Error::Connection(e.clone())),
            None => Ok(()),
        }
    }

    /// Error for an id with no stream state: either it existed and has been closed, or it was
    /// never opened.
    fn missing_stream(&self, id: StreamId) -> Error {
        let opened = if id.is_local(self.side) {
            self.next_local_index[dir_index(id.direction())]
        }
        else {
            self.next_remote_index[dir_index(id.direction())]
        };
        if id.index() < opened {
            Error::StreamClosed(id)
        }
        else {
            Error::UnknownStream(id)
        }
    }

    fn stream_mut(&mut self, id: StreamId) -> Result<&mut StreamState, Error> {
        self.check_open()?;
        if !self.streams.contains_key(&id) {
            return Err(self.missing_stream(id));
        }
        self.streams.get_mut(&id).ok_or(Error::UnknownStream(id))
    }

    pub fn open_stream(&mut self, direction: Direction) -> Result<StreamId, Error> {
        self.check_open()?;
        let d = dir_index(direction);
        let index = self.next_local_index[d];
        if index >= self.peer_max_streams[d] {
            return Err(Error::TooManyStreams);
        }
        self.next_local_index[d] += 1;
        let id = StreamId::new(self.side, direction, index);
        self.streams.insert(id, StreamState::new(id, self.side, &self.config));
        debug!(conn = %self.id, stream = %id, "opened stream");
        Ok(id)
    }

    /// Next stream opened by the peer that has not been handed out yet.
    pub fn accept_stream(&mut self) -> Option<StreamId> {
        self.pending_accept.pop_front()
    }

    /// Buffers as much of `data` as the stream's send buffer allows and returns how much that
    /// was; zero means the buffer is full until acknowledgements arrive.
    pub fn write(&mut self, id: StreamId, data: &[u8]) -> Result<usize, Error> {
        let stream = self.stream_mut(id)?;
        let send = stream.send.as_mut().ok_or(Error::StreamClosed(id))?;
        let n = send.write(data)?;
        if n > 0 {
            self.schedule(id);
        }
        Ok(n)
    }

    pub fn write_capacity(&self, id: StreamId) -> usize {
        self.streams.get(&id)
            .and_then(|s| s.send.as_ref())
            .map_or(0, |s| s.write_capacity())
    }

    /// Ends the sending half after the data already written.
    pub fn finish(&mut self, id: StreamId) -> Result<(), Error> {
        let stream = self.stream_mut(id)?;
        let send = stream.send.as_mut().ok_or(Error::StreamClosed(id))?;
        send.fin()?;
        self.schedule(id);
        Ok(())
    }

    /// Abandons the sending half. Data not yet acknowledged is dropped and stops occupying the
    /// congestion window.
    pub fn reset(&mut self, id: StreamId, error_code: u64) -> Result<(), Error> {
        let stream = self.stream_mut(id)?;
        let send = stream.send.as_mut().ok_or(Error::StreamClosed(id))?;
        if send.reset(error_code) {
            let released = self.recovery.discard_stream(id);
            self.cc.discard(released);
            self.pending_resets.insert(id);
            self.unschedule(id);
            debug!(conn = %self.id, stream = %id, error_code, "reset stream");
        }
        Ok(())
    }

    /// Reads up to `max` bytes in order.
    pub fn read(&mut self, id: StreamId, max: usize) -> Result<ReadOutcome, Error> {
        let stream = self.stream_mut(id)?;
        let recv = stream.recv.as_mut().ok_or(Error::StreamClosed(id))?;
        let outcome = recv.read(max);
        if recv.poll_window_update().is_some() {
            self.pending_stream_max_data.insert(id);
        }
        match &outcome {
            Ok(ReadOutcome::Data(data)) => {
                self.conn_recv.on_consumed(data.len() as u64);
                if self.conn_recv.poll_update().is_some() {
                    self.pending_max_data = true;
                }
            }
            Ok(ReadOutcome::Finished) | Err(_) => self.maybe_collect(id),
            Ok(ReadOutcome::Blocked) => {}
        }
        outcome
    }

    /// Gives up on the receiving half. Unread bytes are dropped and their credit returned, and
    /// whatever the peer still sends is discarded, so the stream can be forgotten as soon as
    /// both halves are finished.
    pub fn abandon_recv(&mut self, id: StreamId) -> Result<(), Error> {
        let stream = self.stream_mut(id)?;
        let recv = stream.recv.as_mut().ok_or(Error::StreamClosed(id))?;
        let unread = recv.abandon();
        if recv.poll_window_update().is_some() {
            self.pending_stream_max_data.insert(id);
        }
        self.conn_recv.on_consumed(unread);
        if self.conn_recv.poll_update().is_some() {
            self.pending_max_data = true;
        }
        debug!(conn = %self.id, stream = %id, unread, "abandoned receiving half");
        self.maybe_collect(id);
        Ok(())
    }

    /// Whether a `read` on `id` would return something other than `Blocked`.
    pub fn is_readable(&self, id: StreamId) -> bool {
        if self.is_closed() {
            return true;
        }
        match self.streams.get(&id) {
            Some(stream) => stream.recv.as_ref().map_or(true, |r| r.is_readable()),
            None => true,
        }
    }

    pub fn send_state(&self, id: StreamId) -> Option<SendState> {
        self.streams.get(&id).and_then(|s| s.send.as_ref()).map(|s| s.state())
    }

    pub fn recv_state(&self, id: StreamId) -> Option<RecvState> {
        self.streams.get(&id).and_then(|s| s.recv.as_ref()).map(|r| r.state())
    }

    /// Closes the connection immediately. A CONNECTION_CLOSE carrying `error_code` is sent to
    /// the peer and every stream fails with `LocallyClosed`.
    pub fn close(&mut self, error_code: u64, reason: &[u8]) {
        if self.is_closed() {
            return;
        }
        debug!(conn = %self.id, error_code, "closing connection");
        self.close_frame = Some(Frame::ConnectionClose {
            error_code,
            reason: Bytes::copy_from_slice(reason),
        });
        self.terminate(ConnectionError::LocallyClosed);
    }

    /// Moves to the terminal state, discarding all stream and in-flight state.
    fn terminate(&mut self, error: ConnectionError) {
        self.error = Some(error);
        self.streams.clear();
        self.send_queue.clear();
        self.scheduled.clear();
        self.pending_accept.clear();
        self.pending_resets.clear();
        self.pending_stream_max_data.clear();
        let abandoned: u64 = self.recovery.drain().iter().map(|p| p.size).sum();
        self.cc.discard(abandoned);
        self.ack_pending = false;
        self.probes_pending = 0;
    }

    /// Earliest time at which `on_timeout` has work to do.
    pub fn poll_timeout(&self) -> Option<Instant> {
        if self.is_closed() {
            return None;
        }
        let idle = self.last_activity + self.config.idle_timeout;
        Some(match self.recovery.timeout() {
            Some(t) => t.min(idle),
            None => idle,
        })
    }

    pub fn on_timeout(&mut self, now: Instant) {
        if self.is_closed() {
            return;
        }
        if now >= self.last_activity + self.config.idle_timeout {
            debug!(conn = %self.id, "idle timeout");
            self.terminate(ConnectionError::TimedOut);
            return;
        }
        match self.recovery.on_timeout(now) {
            super::recovery::TimeoutAction::Lost(lost) => self.on_packets_lost(lost, now),
            super::recovery::TimeoutAction::Probe => {
                debug!(conn = %self.id, pto_count = self.recovery.pto_count(), "probe timeout");
                self.probes_pending = 1;
            }
            super::recovery::TimeoutAction::None => {}
        }
    }

    /// Declares lost whatever the acknowledgements received so far imply is lost.
    pub fn detect_loss(&mut self, now: Instant) {
        let lost = self.recovery.detect_lost(now);
        self.on_packets_lost(lost, now);
    }

    pub fn stats(&self) -> ConnectionStats {
        let mut streams: Vec<StreamStats> = self.streams.values().map(|s| s.stats()).collect();
        streams.sort_by_key(|s| s.id);
        ConnectionStats {
            datagrams_sent: self.counters.datagrams_sent,
            datagrams_received: self.counters.datagrams_received,
            bytes_sent: self.counters.bytes_sent,
            bytes_received: self.counters.bytes_received,
            packets_lost: self.counters.packets_lost,
            bytes_retransmitted: self.counters.bytes_retransmitted,
            cwnd: self.cc.window(),
            bytes_in_flight: self.cc.bytes_in_flight(),
            smoothed_rtt: self.recovery.rtt().smoothed(),
            streams,
        }
    }

    pub fn congestion_window(&self) -> u64 {
        self.cc.window()
    }

    pub fn bytes_in_flight(&self) -> u64 {
        self.cc.bytes_in_flight()
    }

    fn schedule(&mut self, id: StreamId) {
        if self.scheduled.insert(id) {
            self.send_queue.push_back(id);
        }
    }

    fn unschedule(&mut self, id: StreamId) {
        if self.scheduled.remove(&id) {
            self.send_queue.retain(|s| *s != id);
        }
    }

    /// Forgets a stream once both halves are finished. A peer-initiated stream going away
    /// lets the peer open one more.
    fn maybe_collect(&mut self, id: StreamId) {
        let done = self.streams.get(&id).map_or(false, |s| s.is_done());
        if !done {
            return;
        }
        self.streams.remove(&id);
        self.unschedule(id);
        self.pending_stream_max_data.remove(&id);
        if !id.is_local(self.side) {
            let d = dir_index(id.direction());
            self.local_max_streams[d] += 1;
            self.pending_max_streams[d] = true;
        }
        debug!(conn = %self.id, stream = %id, "stream finished");
    }
}
