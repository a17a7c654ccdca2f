use bytes::{Buf, Bytes, BytesMut};
use crate::quic::protocol::{Error, StreamId};
use crate::quic::ranges::RangeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    /// Opened, nothing transmitted yet.
    Ready,
    /// At least one byte (or the FIN) has been handed to a packet.
    Sending,
    /// Every byte and the FIN have been sent at least once; retransmissions may still follow.
    DataSent,
    /// Every byte and the FIN have been acknowledged.
    DataAcked,
    /// Abandoned with RESET_STREAM.
    ResetSent,
}

impl SendState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SendState::DataAcked | SendState::ResetSent)
    }
}

/// A contiguous range of stream data selected for one STREAM frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendChunk {
    pub offset: u64,
    pub data: Bytes,
    pub fin: bool,
    /// Bytes in this chunk beyond anything previously sent, which count against the
    /// connection-level send credit.
    pub new_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingReset {
    error_code: u64,
    final_size: u64,
    needs_send: bool,
    acked: bool,
}

#[derive(Debug)]
pub struct SendStream {
    id: StreamId,
    state: SendState,
    // Unacknowledged bytes starting at offset `retired`.
    buffer: BytesMut,
    retired: u64,
    buffer_limit: usize,
    sent: RangeSet,
    acked: RangeSet,
    highest_sent: u64,
    fin_requested: bool,
    fin_in_flight: bool,
    fin_acked: bool,
    max_data: u64,
    reset: Option<PendingReset>,
    retransmitted: u64,
}

impl SendStream {
    pub fn new(id: StreamId, max_data: u64, buffer_limit: usize) -> Self {
        SendStream {
            id,
            state: SendState::Ready,
            buffer: BytesMut::new(),
            retired: 0,
            buffer_limit,
            sent: RangeSet::new(),
            acked: RangeSet::new(),
            highest_sent: 0,
            fin_requested: false,
            fin_in_flight: false,
            fin_acked: false,
            max_data,
            reset: None,
            retransmitted: 0,
        }
    }

    pub fn state(&self) -> SendState {
        self.state
    }

    /// Offset one past the last byte written by the application.
    pub fn written(&self) -> u64 {
        self.retired + self.buffer.len() as u64
    }

    pub fn highest_sent(&self) -> u64 {
        self.highest_sent
    }

    pub fn bytes_retransmitted(&self) -> u64 {
        self.retransmitted
    }

    pub fn max_data(&self) -> u64 {
        self.max_data
    }

    /// How many more bytes `write` would accept right now.
    pub fn write_capacity(&self) -> usize {
        if self.fin_requested || self.state.is_terminal() {
            0
        }
        else {
            self.buffer_limit.saturating_sub(self.buffer.len())
        }
    }

    /// Appends as much of `data` as the send buffer has room for and returns the number of
    /// bytes accepted.
    pub fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
        if self.fin_requested || self.state.is_terminal() {
            return Err(Error::StreamClosed(self.id));
        }
        let n = std::cmp::min(data.len(), self.write_capacity());
        self.buffer.extend_from_slice(&data[..n]);
        Ok(n)
    }

    /// Marks the current end of the buffer as the end of the stream.
    pub fn fin(&mut self) -> Result<(), Error> {
        if self.state.is_terminal() {
            return Err(Error::StreamClosed(self.id));
        }
        self.fin_requested = true;
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.fin_requested
    }

    /// Raises the peer-advertised limit. Limits never shrink.
    pub fn set_max_data(&mut self, limit: u64) -> bool {
        if limit > self.max_data {
            self.max_data = limit;
            true
        }
        else {
            false
        }
    }

    /// First offset that is neither in flight nor acknowledged.
    fn first_unsent(&self) -> u64 {
        let mut pos = self.retired;
        loop {
            if let Some(end) = self.acked.covering(pos) {
                pos = end;
            }
            else if let Some(end) = self.sent.covering(pos) {
                pos = end;
            }
            else {
                return pos;
            }
        }
    }

    /// Whether `collect_sendable` would produce anything given `conn_credit` bytes of
    /// connection-level credit.
    pub fn has_sendable(&self, conn_credit: u64) -> bool {
        if self.reset.is_some() || self.state.is_terminal() {
            return false;
        }
        let pos = self.first_unsent();
        if pos < self.written() && pos < self.flow_limit(conn_credit) {
            return true;
        }
        self.fin_pending() && pos == self.written()
    }

    /// True when unsent data exists but the peer's limits prevent sending any of it.
    pub fn is_flow_blocked(&self, conn_credit: u64) -> bool {
        let pos = self.first_unsent();
        self.reset.is_none() && pos < self.written() && pos >= self.flow_limit(conn_credit)
    }

    fn fin_pending(&self) -> bool {
        self.fin_requested && !self.fin_in_flight && !self.fin_acked
    }

    fn flow_limit(&self, conn_credit: u64) -> u64 {
        let new_data_limit = std::cmp::min(self.max_data, self.highest_sent.saturating_add(conn_credit));
        std::cmp::max(self.highest_sent, new_data_limit)
    }

    /// Selects the lowest range not currently in flight, at most `budget` bytes long, and marks
    /// it in flight. Lost ranges therefore go out again before new data. Bytes beyond the
    /// stream limit or beyond `conn_credit` new bytes are never selected.
    pub fn collect_sendable(&mut self, budget: usize, conn_credit: u64) -> Option<SendChunk> {
        if self.reset.is_some() || self.state.is_terminal() {
            return None;
        }

        let start = self.first_unsent();
        let written = self.written();

        let mut end = written;
        if let Some(next) = self.sent.next_start_after(start) {
            end = end.min(next);
        }
        if let Some(next) = self.acked.next_start_after(start) {
            end = end.min(next);
        }
        end = end.min(start.saturating_add(budget as u64));
        end = end.min(self.flow_limit(conn_credit));
        let end = end.max(start);

        let fin = self.fin_pending() && end == written;
        if end == start && !fin {
            return None;
        }

        let from = (start - self.retired) as usize;
        let to = (end - self.retired) as usize;
        let data = Bytes::copy_from_slice(&self.buffer[from..to]);

        self.sent.insert(start, end);
        if fin {
            self.fin_in_flight = true;
        }

        let new_bytes = end.saturating_sub(self.highest_sent);
        if start < self.highest_sent {
            self.retransmitted += std::cmp::min(end, self.highest_sent) - start;
        }
        self.highest_sent = self.highest_sent.max(end);

        if self.state == SendState::Ready {
            self.state = SendState::Sending;
        }
        if self.fin_in_flight && self.highest_sent == written {
            self.state = SendState::DataSent;
        }

        Some(SendChunk { offset: start, data, fin, new_bytes })
    }

    /// Records acknowledgement of `offset..offset + len` (and the FIN if `fin`). Returns the
    /// number of bytes released from the send buffer.
    pub fn on_ack(&mut self, offset: u64, len: u64, fin: bool) -> usize {
        if self.reset.is_some() {
            return 0;
        }

        let end = offset + len;
        self.acked.insert(offset, end);
        self.sent.remove(offset, end);
        if fin {
            self.fin_acked = true;
            self.fin_in_flight = false;
        }

        let acked_prefix = self.acked.contiguous_from(0);
        let mut released = 0;
        if acked_prefix > self.retired {
            released = (acked_prefix - self.retired) as usize;
            self.buffer.advance(released);
            self.retired = acked_prefix;
        }

        if self.fin_acked && self.fin_requested && self.retired == self.written() {
            self.state = SendState::DataAcked;
        }
        released
    }

    /// Makes `offset..offset + len` (and the FIN if `fin`) eligible to be collected again.
    pub fn on_loss(&mut self, offset: u64, len: u64, fin: bool) {
        if self.reset.is_some() || self.state.is_terminal() {
            return;
        }
        self.sent.remove(offset, offset + len);
        if fin && !self.fin_acked {
            self.fin_in_flight = false;
        }
    }

    /// Abandons the stream: unsent and unacknowledged data is discarded and a RESET_STREAM
    /// becomes pending. Returns false when the stream had already finished or been reset.
    pub fn reset(&mut self, error_code: u64) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = SendState::ResetSent;
        self.reset = Some(PendingReset {
            error_code,
            final_size: self.highest_sent,
            needs_send: true,
            acked: false,
        });
        self.buffer.clear();
        self.retired = self.highest_sent;
        self.sent = RangeSet::new();
        true
    }

    /// The RESET_STREAM frame still to be transmitted, as `(error_code, final_size)`.
    pub fn pending_reset(&self) -> Option<(u64, u64)> {
        match self.reset {
            Some(reset) if reset.needs_send => Some((reset.error_code, reset.final_size)),
            _ => None,
        }
    }

    pub fn on_reset_sent(&mut self) {
        if let Some(reset) = &mut self.reset {
            reset.needs_send = false;
        }
    }

    pub fn on_reset_acked(&mut self) {
        if let Some(reset) = &mut self.reset {
            reset.acked = true;
        }
    }

    pub fn on_reset_lost(&mut self) {
        if let Some(reset) = &mut self.reset {
            if !reset.acked {
                reset.needs_send = true;
            }
        }
    }

    /// Nothing more will ever be sent or retransmitted for this stream.
    pub fn is_done(&self) -> bool {
        match self.state {
            SendState::DataAcked => true,
            SendState::ResetSent => self.reset.map_or(false, |r| r.acked),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: u64 = 1 << 20;

    fn stream() -> SendStream {
        SendStream::new(StreamId(0), LIMIT, 1 << 16)
    }

    #[test]
    fn hello_fin_acked() {
        let mut s = stream();
        assert_eq!(s.write(b"hello").unwrap(), 5);
        s.fin().unwrap();
        assert_eq!(s.state(), SendState::Ready);

        let chunk = s.collect_sendable(100, LIMIT).unwrap();
        assert_eq!(chunk.offset, 0);
        assert_eq!(&chunk.data[..], b"hello");
        assert!(chunk.fin);
        assert_eq!(chunk.new_bytes, 5);
        assert_eq!(s.state(), SendState::DataSent);
        assert!(s.collect_sendable(100, LIMIT).is_none());

        assert_eq!(s.on_ack(0, 5, true), 5);
        assert_eq!(s.state(), SendState::DataAcked);
        assert!(s.is_done());
    }

    #[test]
    fn write_after_fin_fails() {
        let mut s = stream();
        s.fin().unwrap();
        assert_eq!(s.write(b"x"), Err(Error::StreamClosed(StreamId(0))));
    }

    #[test]
    fn budget_splits_chunks() {
        let mut s = stream();
        s.write(b"abcdefgh").unwrap();
        let a = s.collect_sendable(3, LIMIT).unwrap();
        let b = s.collect_sendable(3, LIMIT).unwrap();
        assert_eq!((a.offset, &a.data[..]), (0, &b"abc"[..]));
        assert_eq!((b.offset, &b.data[..]), (3, &b"def"[..]));
        assert_eq!(s.state(), SendState::Sending);
    }

    #[test]
    fn lost_range_is_collected_again_first() {
        let mut s = stream();
        s.write(b"helloworld").unwrap();
        s.collect_sendable(5, LIMIT).unwrap();
        s.collect_sendable(5, LIMIT).unwrap();
        s.on_ack(5, 5, false);
        assert!(s.collect_sendable(100, LIMIT).is_none());

        s.on_loss(0, 5, false);
        let again = s.collect_sendable(100, LIMIT).unwrap();
        assert_eq!(again.offset, 0);
        assert_eq!(&again.data[..], b"hello");
        assert_eq!(again.new_bytes, 0);
        assert_eq!(s.bytes_retransmitted(), 5);
    }

    #[test]
    fn retransmission_stops_at_acked_range() {
        let mut s = stream();
        s.write(b"0123456789").unwrap();
        s.collect_sendable(10, LIMIT).unwrap();
        s.on_ack(4, 2, false);
        s.on_loss(0, 10, false);
        let first = s.collect_sendable(100, LIMIT).unwrap();
        assert_eq!((first.offset, &first.data[..]), (0, &b"0123"[..]));
        let second = s.collect_sendable(100, LIMIT).unwrap();
        assert_eq!((second.offset, &second.data[..]), (6, &b"6789"[..]));
    }

    #[test]
    fn stream_limit_blocks_new_data() {
        let mut s = SendStream::new(StreamId(0), 4, 1 << 16);
        s.write(b"abcdefgh").unwrap();
        let chunk = s.collect_sendable(100, LIMIT).unwrap();
        assert_eq!(&chunk.data[..], b"abcd");
        assert!(s.collect_sendable(100, LIMIT).is_none());
        assert!(s.is_flow_blocked(LIMIT));

        assert!(s.set_max_data(8));
        let rest = s.collect_sendable(100, LIMIT).unwrap();
        assert_eq!(&rest.data[..], b"efgh");
    }

    #[test]
    fn connection_credit_limits_new_data_only() {
        let mut s = stream();
        s.write(b"abcdef").unwrap();
        s.collect_sendable(100, 3).unwrap();
        assert!(s.collect_sendable(100, 0).is_none());
        s.on_loss(0, 3, false);
        let again = s.collect_sendable(100, 0).unwrap();
        assert_eq!(&again.data[..], b"abc");
    }

    #[test]
    fn lost_fin_is_resent_alone() {
        let mut s = stream();
        s.write(b"ab").unwrap();
        s.fin().unwrap();
        s.collect_sendable(100, LIMIT).unwrap();
        s.on_ack(0, 2, false);
        s.on_loss(2, 0, true);
        let fin = s.collect_sendable(100, LIMIT).unwrap();
        assert_eq!(fin.offset, 2);
        assert!(fin.data.is_empty());
        assert!(fin.fin);
    }

    #[test]
    fn buffer_limit_and_release() {
        let mut s = SendStream::new(StreamId(0), LIMIT, 4);
        assert_eq!(s.write(b"abcdef").unwrap(), 4);
        assert_eq!(s.write_capacity(), 0);
        s.collect_sendable(100, LIMIT).unwrap();
        assert_eq!(s.on_ack(0, 4, false), 4);
        assert_eq!(s.write_capacity(), 4);
    }

    #[test]
    fn reset_discards_and_is_terminal() {
        let mut s = stream();
        s.write(b"abcdef").unwrap();
        s.collect_sendable(3, LIMIT).unwrap();
        assert!(s.reset(7));
        assert_eq!(s.state(), SendState::ResetSent);
        assert!(s.collect_sendable(100, LIMIT).is_none());
        assert_eq!(s.write(b"x"), Err(Error::StreamClosed(StreamId(0))));
        assert_eq!(s.pending_reset(), Some((7, 3)));
        s.on_reset_sent();
        assert_eq!(s.pending_reset(), None);
        assert!(!s.is_done());

        s.on_reset_lost();
        assert_eq!(s.pending_reset(), Some((7, 3)));
        s.on_reset_sent();
        s.on_reset_acked();
        assert!(s.is_done());
        assert!(!s.reset(8));
    }
}
