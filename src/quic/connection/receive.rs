use std::time::Instant;
use bytes::Bytes;
use tracing::{debug, trace, warn};
use crate::quic::protocol::{
    AckFrame, ConnectionError, FlowTarget, Frame, Packet, StreamFrame, StreamId, TransportError,
};
use crate::quic::recovery::{SentFrame, SentPacket};
use crate::quic::stream::StreamState;
use super::{dir_index, Connection, MAX_ACK_RANGES};

impl Connection {
    /// Processes one datagram from the peer. A protocol violation closes the connection, queues
    /// a CONNECTION_CLOSE for the peer, and is returned.
    pub fn on_packet_received(&mut self, datagram: Bytes, now: Instant) -> Result<(), TransportError> {
        if self.is_closed() {
            return Ok(());
        }
        self.counters.datagrams_received += 1;
        self.counters.bytes_received += datagram.len() as u64;

        let packet = match Packet::decode(datagram) {
            Ok(packet) => packet,
            Err(e) => return Err(self.fail(e)),
        };
        if packet.connection_id != self.id {
            trace!(conn = %self.id, other = %packet.connection_id, "dropping packet for another connection");
            return Ok(());
        }

        let pn = packet.packet_number;
        let pn_end = match pn.checked_add(1) {
            Some(end) => end,
            None => return Err(self.fail(TransportError::MalformedFrame(
                format!("packet number {} out of range", pn)))),
        };
        if pn < self.received_floor || self.received_packets.contains(pn) {
            trace!(conn = %self.id, packet_number = pn, "dropping duplicate packet");
            return Ok(());
        }
        self.last_activity = now;

        let ack_eliciting = packet.is_ack_eliciting();
        if ack_eliciting {
            self.ack_pending = true;
        }
        if self.received_packets.max_end().map_or(true, |end| pn >= end) {
            self.largest_received_time = Some(now);
        }
        self.received_packets.insert(pn, pn_end);
        if self.received_packets.len() > MAX_ACK_RANGES {
            self.received_packets.truncate_low(MAX_ACK_RANGES);
            self.received_floor = self.received_packets.min().unwrap_or(0);
        }
        trace!(conn = %self.id, packet_number = pn, frames = packet.frames.len(), "received packet");

        for frame in packet.frames {
            if let Err(e) = self.on_frame(frame, now) {
                return Err(self.fail(e));
            }
            if self.is_closed() {
                break;
            }
        }
        Ok(())
    }

    /// Ends the connection because of a protocol violation, queueing CONNECTION_CLOSE.
    fn fail(&mut self, error: TransportError) -> TransportError {
        warn!(conn = %self.id, %error, "closing connection on protocol violation");
        self.close_frame = Some(Frame::ConnectionClose {
            error_code: error.code(),
            reason: Bytes::from(error.to_string()),
        });
        self.terminate(ConnectionError::Transport(error.clone()));
        error
    }

    fn on_frame(&mut self, frame: Frame, now: Instant) -> Result<(), TransportError> {
        match frame {
            Frame::Ping => Ok(()),
            Frame::Ack(ack) => {
                self.on_ack(&ack, now);
                Ok(())
            }
            Frame::Stream(frame) => self.on_stream_frame(frame),
            Frame::ResetStream { stream_id, error_code, final_size } => {
                if !stream_id.can_recv(self.side) {
                    return Err(TransportError::StreamStateError(stream_id));
                }
                if !self.ensure_stream(stream_id)? {
                    return Ok(());
                }
                let recv = match self.streams.get_mut(&stream_id).and_then(|s| s.recv.as_mut()) {
                    Some(recv) => recv,
                    None => return Ok(()),
                };
                let accounting = recv.on_reset(error_code, final_size)?;
                self.conn_recv.on_received_more(accounting.newly_received)?;
                self.conn_recv.on_consumed(accounting.unread);
                if self.conn_recv.poll_update().is_some() {
                    self.pending_max_data = true;
                }
                self.pending_stream_max_data.remove(&stream_id);
                debug!(conn = %self.id, stream = %stream_id, error_code, "peer reset stream");
                self.maybe_collect(stream_id);
                Ok(())
            }
            Frame::MaxData { target: FlowTarget::Connection, limit } => {
                if self.conn_send.raise(limit) {
                    let credit = self.conn_send.available();
                    let mut ready: Vec<StreamId> = self.streams.values()
                        .filter(|s| s.send.as_ref().map_or(false, |send| send.has_sendable(credit)))
                        .map(|s| s.id)
                        .collect();
                    ready.sort();
                    for id in ready {
                        self.schedule(id);
                    }
                }
                Ok(())
            }
            Frame::MaxData { target: FlowTarget::Stream(stream_id), limit } => {
                if !stream_id.can_send(self.side) {
                    return Err(TransportError::StreamStateError(stream_id));
                }
                if !self.ensure_stream(stream_id)? {
                    return Ok(());
                }
                let raised = self.streams.get_mut(&stream_id)
                    .and_then(|s| s.send.as_mut())
                    .map_or(false, |send| send.set_max_data(limit));
                if raised {
                    self.schedule(stream_id);
                }
                Ok(())
            }
            Frame::MaxStreams { direction, count } => {
                let d = dir_index(direction);
                self.peer_max_streams[d] = self.peer_max_streams[d].max(count);
                Ok(())
            }
            Frame::ConnectionClose { error_code, reason } => {
                let reason = String::from_utf8_lossy(&reason).into_owned();
                debug!(conn = %self.id, error_code, %reason, "peer closed connection");
                self.terminate(ConnectionError::PeerClosed { code: error_code, reason });
                Ok(())
            }
        }
    }

    fn on_stream_frame(&mut self, frame: StreamFrame) -> Result<(), TransportError> {
        let stream_id = frame.stream_id;
        if !stream_id.can_recv(self.side) {
            return Err(TransportError::StreamStateError(stream_id));
        }
        if !self.ensure_stream(stream_id)? {
            // Already finished and forgotten; this is a late retransmission.
            return Ok(());
        }
        let recv = match self.streams.get_mut(&stream_id).and_then(|s| s.recv.as_mut()) {
            Some(recv) => recv,
            None => return Ok(()),
        };
        let increase = recv.on_data(frame.offset, frame.data, frame.fin)?;
        let discarding = recv.is_discarding();
        let stream_update = discarding && recv.poll_window_update().is_some();
        self.conn_recv.on_received_more(increase)?;
        if discarding {
            if stream_update {
                self.pending_stream_max_data.insert(stream_id);
            }
            self.conn_recv.on_consumed(increase);
            if self.conn_recv.poll_update().is_some() {
                self.pending_max_data = true;
            }
            self.maybe_collect(stream_id);
        }
        Ok(())
    }

    /// Makes sure state exists for a stream a frame refers to. A peer-initiated stream seen for
    /// the first time is opened, along with any lower-numbered ones of the same type, and queued
    /// for `accept_stream`. Returns false for streams that have already been forgotten.
    fn ensure_stream(&mut self, id: StreamId) -> Result<bool, TransportError> {
        if self.streams.contains_key(&id) {
            return Ok(true);
        }
        let d = dir_index(id.direction());
        if id.is_local(self.side) {
            if id.index() >= self.next_local_index[d] {
                return Err(TransportError::StreamStateError(id));
            }
            return Ok(false);
        }
        if id.index() < self.next_remote_index[d] {
            return Ok(false);
        }
        if id.index() >= self.local_max_streams[d] {
            return Err(TransportError::StreamLimitError(id));
        }
        for index in self.next_remote_index[d]..=id.index() {
            let new_id = StreamId::new(self.side.peer(), id.direction(), index);
            self.streams.insert(new_id, StreamState::new(new_id, self.side, &self.config));
            self.pending_accept.push_back(new_id);
            debug!(conn = %self.id, stream = %new_id, "peer opened stream");
        }
        self.next_remote_index[d] = id.index() + 1;
        Ok(true)
    }

    fn on_ack(&mut self, ack: &AckFrame, now: Instant) {
        let acked = self.recovery.on_ack_received(ack, now);
        for packet in acked {
            self.cc.on_packet_acked(packet.size, packet.time_sent);
            for frame in packet.frames {
                self.on_frame_acked(frame);
            }
        }
        self.detect_loss(now);
    }

    fn on_frame_acked(&mut self, frame: SentFrame) {
        match frame {
            SentFrame::Stream { stream_id, offset, len, fin } => {
                if let Some(send) = self.streams.get_mut(&stream_id).and_then(|s| s.send.as_mut()) {
                    send.on_ack(offset, len, fin);
                    self.maybe_collect(stream_id);
                }
            }
            SentFrame::ResetStream { stream_id } => {
                if let Some(send) = self.streams.get_mut(&stream_id).and_then(|s| s.send.as_mut()) {
                    send.on_reset_acked();
                    self.maybe_collect(stream_id);
                }
            }
            SentFrame::MaxData
            | SentFrame::MaxStreamData { .. }
            | SentFrame::MaxStreams { .. }
            | SentFrame::Ping => {}
        }
    }

    /// Hands lost frames back to their owners. Stream data becomes sendable again; control
    /// frames are queued again with their current values.
    pub(super) fn on_packets_lost(&mut self, lost: Vec<SentPacket>, now: Instant) {
        let latest = match lost.iter().map(|p| p.time_sent).max() {
            Some(latest) => latest,
            None => return,
        };
        let bytes: u64 = lost.iter().map(|p| p.size).sum();
        self.counters.packets_lost += lost.len() as u64;
        debug!(conn = %self.id, packets = lost.len(), bytes, "packets lost");
        self.cc.on_packets_lost(bytes, latest, now);

        for packet in lost {
            for frame in packet.frames {
                match frame {
                    SentFrame::Stream { stream_id, offset, len, fin } => {
                        if let Some(send) = self.streams.get_mut(&stream_id).and_then(|s| s.send.as_mut()) {
                            send.on_loss(offset, len, fin);
                            self.schedule(stream_id);
                        }
                    }
                    SentFrame::ResetStream { stream_id } => {
                        if let Some(send) = self.streams.get_mut(&stream_id).and_then(|s| s.send.as_mut()) {
                            send.on_reset_lost();
                            self.pending_resets.insert(stream_id);
                        }
                    }
                    SentFrame::MaxData => self.pending_max_data = true,
                    SentFrame::MaxStreamData { stream_id } => {
                        self.pending_stream_max_data.insert(stream_id);
                    }
                    SentFrame::MaxStreams { direction } => {
                        self.pending_max_streams[dir_index(direction)] = true;
                    }
                    SentFrame::Ping => {}
                }
            }
        }
    }
}
