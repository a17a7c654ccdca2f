use std::time::Instant;
use bytes::Bytes;
use tracing::trace;
use crate::quic::protocol::frame::stream_header_len;
use crate::quic::protocol::{AckFrame, Direction, FlowTarget, Frame, Packet, StreamFrame};
use crate::quic::recovery::{SentFrame, SentPacket};
use super::{dir_index, Connection};

impl Connection {
    /// Builds the next datagram to send, if there is anything to send.
    ///
    /// Ack-eliciting content is limited to what the congestion window has room for; a datagram
    /// carrying only an ACK is always allowed. Control frames go first, then stream data from
    /// each stream with data in turn.
    pub fn poll_transmit(&mut self, now: Instant) -> Option<Bytes> {
        if self.is_closed() {
            let frame = self.close_frame.take()?;
            return Some(self.finish_packet(vec![frame], Vec::new(), now));
        }

        let mds = self.config.max_datagram_size;
        let packet_number = self.next_packet_number;
        let mut size = Packet::header_len(packet_number);
        let mut frames: Vec<Frame> = Vec::new();
        let mut sent_frames: Vec<SentFrame> = Vec::new();

        let ack = self.build_ack(now);
        let ack_len = ack.as_ref().map_or(0, |f| f.encoded_len());
        let limit = std::cmp::min(mds, self.cc.available_budget() as usize);
        let can_elicit = self.has_eliciting_work() && size + ack_len < limit;

        if let Some(ack) = ack {
            if self.ack_pending || can_elicit {
                size += ack_len;
                frames.push(ack);
            }
        }

        if can_elicit {
            self.collect_control_frames(limit, &mut size, &mut frames, &mut sent_frames);
            self.collect_stream_frames(limit, &mut size, &mut frames, &mut sent_frames);
        }

        if sent_frames.is_empty() && self.probes_pending > 0 {
            frames.push(Frame::Ping);
            sent_frames.push(SentFrame::Ping);
        }

        if sent_frames.is_empty() && !self.ack_pending {
            return None;
        }
        if frames.is_empty() {
            return None;
        }
        Some(self.finish_packet(frames, sent_frames, now))
    }

    /// Every datagram `poll_transmit` will currently produce.
    pub fn send_pending(&mut self, now: Instant) -> Vec<Bytes> {
        let mut out = Vec::new();
        while let Some(datagram) = self.poll_transmit(now) {
            out.push(datagram);
        }
        out
    }

    fn finish_packet(&mut self, frames: Vec<Frame>, sent_frames: Vec<SentFrame>, now: Instant) -> Bytes {
        let packet_number = self.next_packet_number;
        self.next_packet_number += 1;

        if frames.iter().any(|f| matches!(f, Frame::Ack(_))) {
            self.ack_pending = false;
        }
        let packet = Packet { connection_id: self.id, packet_number, frames };
        let datagram = packet.encode();
        let size = datagram.len() as u64;

        if !sent_frames.is_empty() {
            self.probes_pending = self.probes_pending.saturating_sub(1);
            self.cc.on_packet_sent(size);
            self.recovery.on_packet_sent(SentPacket {
                packet_number,
                time_sent: now,
                size,
                frames: sent_frames,
            });
        }

        self.counters.datagrams_sent += 1;
        self.counters.bytes_sent += size;
        trace!(conn = %self.id, packet_number, size, frames = packet.frames.len(),
               in_flight = self.cc.bytes_in_flight(), "sent packet");
        datagram
    }

    fn build_ack(&self, now: Instant) -> Option<Frame> {
        if self.received_packets.is_empty() {
            return None;
        }
        let ranges = self.received_packets.iter().rev().map(|(s, e)| s..=(e - 1)).collect();
        let ack_delay_us = self.largest_received_time
            .map_or(0, |t| now.saturating_duration_since(t).as_micros() as u64);
        AckFrame::new(ack_delay_us, ranges).map(Frame::Ack)
    }

    fn has_eliciting_work(&self) -> bool {
        !self.send_queue.is_empty()
            || !self.pending_resets.is_empty()
            || self.pending_max_data
            || !self.pending_stream_max_data.is_empty()
            || self.pending_max_streams.iter().any(|p| *p)
    }

    fn collect_control_frames(
        &mut self,
        limit: usize,
        size: &mut usize,
        frames: &mut Vec<Frame>,
        sent_frames: &mut Vec<SentFrame>,
    ) {
        let resets: Vec<_> = self.pending_resets.iter().copied().collect();
        for stream_id in resets {
            let send = self.streams.get_mut(&stream_id).and_then(|s| s.send.as_mut());
            let (error_code, final_size) = match send.as_ref().and_then(|s| s.pending_reset()) {
                Some(pending) => pending,
                None => {
                    self.pending_resets.remove(&stream_id);
                    continue;
                }
            };
            let frame = Frame::ResetStream { stream_id, error_code, final_size };
            if *size + frame.encoded_len() > limit {
                return;
            }
            if let Some(send) = send {
                send.on_reset_sent();
            }
            self.pending_resets.remove(&stream_id);
            *size += frame.encoded_len();
            frames.push(frame);
            sent_frames.push(SentFrame::ResetStream { stream_id });
        }

        if self.pending_max_data {
            let frame = Frame::MaxData { target: FlowTarget::Connection, limit: self.conn_recv.limit() };
            if *size + frame.encoded_len() > limit {
                return;
            }
            self.pending_max_data = false;
            *size += frame.encoded_len();
            frames.push(frame);
            sent_frames.push(SentFrame::MaxData);
        }

        let updates: Vec<_> = self.pending_stream_max_data.iter().copied().collect();
        for stream_id in updates {
            let current = self.streams.get(&stream_id)
                .and_then(|s| s.recv.as_ref())
                .and_then(|r| r.max_data());
            let max = match current {
                Some(max) => max,
                None => {
                    self.pending_stream_max_data.remove(&stream_id);
                    continue;
                }
            };
            let frame = Frame::MaxData { target: FlowTarget::Stream(stream_id), limit: max };
            if *size + frame.encoded_len() > limit {
                return;
            }
            self.pending_stream_max_data.remove(&stream_id);
            *size += frame.encoded_len();
            frames.push(frame);
            sent_frames.push(SentFrame::MaxStreamData { stream_id });
        }

        for direction in [Direction::Bidirectional, Direction::Unidirectional] {
            let d = dir_index(direction);
            if !self.pending_max_streams[d] {
                continue;
            }
            let frame = Frame::MaxStreams { direction, count: self.local_max_streams[d] };
            if *size + frame.encoded_len() > limit {
                return;
            }
            self.pending_max_streams[d] = false;
            *size += frame.encoded_len();
            frames.push(frame);
            sent_frames.push(SentFrame::MaxStreams { direction });
        }
    }

    /// Fills the rest of the packet with stream data. Each pass over the queue offers every
    /// waiting stream an equal share of the space left, so one stream with a lot of data
    /// cannot crowd out the others. Streams that sent something go to the back of the queue.
    fn collect_stream_frames(
        &mut self,
        limit: usize,
        size: &mut usize,
        frames: &mut Vec<Frame>,
        sent_frames: &mut Vec<SentFrame>,
    ) {
        loop {
            let active = self.send_queue.len();
            if active == 0 || *size >= limit {
                return;
            }
            let share = (limit - *size) / active;
            let mut progress = false;

            for _ in 0..active {
                let stream_id = match self.send_queue.pop_front() {
                    Some(id) => id,
                    None => break,
                };
                let remaining = limit.saturating_sub(*size);
                let credit = self.conn_send.available();

                let send = match self.streams.get_mut(&stream_id).and_then(|s| s.send.as_mut()) {
                    Some(send) => send,
                    None => {
                        self.scheduled.remove(&stream_id);
                        continue;
                    }
                };

                let header = stream_header_len(stream_id, send.written(), remaining);
                if remaining <= header {
                    self.send_queue.push_front(stream_id);
                    return;
                }
                let room = remaining - header;
                let budget = match share.saturating_sub(header) {
                    0 => room,
                    fair => fair.min(room),
                };

                let chunk = match send.collect_sendable(budget, credit) {
                    Some(chunk) => chunk,
                    None => {
                        self.scheduled.remove(&stream_id);
                        continue;
                    }
                };
                let still_sendable = send.has_sendable(credit - chunk.new_bytes);

                self.conn_send.consume(chunk.new_bytes);
                self.counters.bytes_retransmitted += chunk.data.len() as u64 - chunk.new_bytes;

                let len = chunk.data.len() as u64;
                let frame = Frame::Stream(StreamFrame {
                    stream_id,
                    offset: chunk.offset,
                    fin: chunk.fin,
                    data: chunk.data,
                });
                *size += frame.encoded_len();
                frames.push(frame);
                sent_frames.push(SentFrame::Stream { stream_id, offset: chunk.offset, len, fin: chunk.fin });
                progress = true;

                if still_sendable {
                    self.send_queue.push_back(stream_id);
                }
                else {
                    self.scheduled.remove(&stream_id);
                }
            }

            if !progress {
                return;
            }
        }
    }
}
