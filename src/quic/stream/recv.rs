use std::collections::BTreeMap;
use bytes::Bytes;
use crate::quic::flow_control::ReceiveWindow;
use crate::quic::protocol::{Error, FlowScope, StreamId, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvState {
    Receiving,
    /// The FIN has arrived, so the final size is known; some data may still be missing.
    SizeKnown,
    /// The application has read every byte up to the final size.
    DataRead,
    ResetRecvd,
}

impl RecvState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RecvState::DataRead | RecvState::ResetRecvd)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(Bytes),
    /// Nothing is available at the current read offset yet.
    Blocked,
    /// Every byte has been delivered.
    Finished,
}

/// What a RESET_STREAM did to connection-level accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResetAccounting {
    /// Growth of the highest received offset, which counts against the connection limit.
    pub newly_received: u64,
    /// Bytes the application will now never read, which return to the connection window.
    pub unread: u64,
}

/// Reassembles one direction of a stream. Chunks are stored without overlap, keyed by offset,
/// and never below `read_offset`.
#[derive(Debug)]
pub struct RecvStream {
    id: StreamId,
    state: RecvState,
    chunks: BTreeMap<u64, Bytes>,
    read_offset: u64,
    highest_received: u64,
    final_size: Option<u64>,
    flow: ReceiveWindow,
    reset_code: Option<u64>,
    reset_reported: bool,
    /// The application has gone away; arriving data is counted and dropped.
    discarding: bool,
}

impl RecvStream {
    pub fn new(id: StreamId, window: u64) -> Self {
        RecvStream {
            id,
            state: RecvState::Receiving,
            chunks: BTreeMap::new(),
            read_offset: 0,
            highest_received: 0,
            final_size: None,
            flow: ReceiveWindow::new(FlowScope::Stream(id), window),
            reset_code: None,
            reset_reported: false,
            discarding: false,
        }
    }

    pub fn state(&self) -> RecvState {
        self.state
    }

    pub fn read_offset(&self) -> u64 {
        self.read_offset
    }

    pub fn highest_received(&self) -> u64 {
        self.highest_received
    }

    pub fn final_size(&self) -> Option<u64> {
        self.final_size
    }

    /// Buffered bytes not yet read, including those beyond a gap.
    pub fn buffered(&self) -> usize {
        self.chunks.values().map(|c| c.len()).sum()
    }

    /// Stores `data` at `offset`. Returns how far the highest received offset advanced, which the
    /// caller charges to the connection-level window.
    pub fn on_data(&mut self, offset: u64, data: Bytes, fin: bool) -> Result<u64, TransportError> {
        let end = offset + data.len() as u64;
        self.flow.on_received(end)?;

        if let Some(final_size) = self.final_size {
            if end > final_size || (fin && end != final_size) {
                return Err(TransportError::FinalSizeError(self.id));
            }
        }
        if fin {
            if end < self.highest_received {
                return Err(TransportError::FinalSizeError(self.id));
            }
            self.final_size = Some(end);
            if self.state == RecvState::Receiving {
                self.state = RecvState::SizeKnown;
            }
        }

        let increase = end.saturating_sub(self.highest_received);
        self.highest_received = self.highest_received.max(end);

        if self.discarding {
            self.skip_to_highest();
            return Ok(increase);
        }
        if self.state.is_terminal() || end <= self.read_offset {
            return Ok(increase);
        }

        let (offset, data) = if offset < self.read_offset {
            let skip = (self.read_offset - offset) as usize;
            (self.read_offset, data.slice(skip..))
        }
        else {
            (offset, data)
        };
        self.insert(offset, data)?;
        Ok(increase)
    }

    fn insert(&mut self, start: u64, data: Bytes) -> Result<(), TransportError> {
        let end = start + data.len() as u64;
        let mut gaps: Vec<(u64, Bytes)> = Vec::new();
        let mut pos = start;

        let overlapping = self.chunks
            .range(..end)
            .filter(|(s, c)| **s + c.len() as u64 > start);
        for (&chunk_start, chunk) in overlapping {
            let chunk_end = chunk_start + chunk.len() as u64;
            let lo = chunk_start.max(start);
            let hi = chunk_end.min(end);
            let existing = &chunk[(lo - chunk_start) as usize..(hi - chunk_start) as usize];
            let incoming = &data[(lo - start) as usize..(hi - start) as usize];
            if existing != incoming {
                return Err(TransportError::DataInconsistent { stream_id: self.id, offset: lo });
            }
            if chunk_start > pos {
                gaps.push((pos, data.slice((pos - start) as usize..(chunk_start - start) as usize)));
            }
            pos = pos.max(chunk_end);
        }
        if pos < end {
            gaps.push((pos, data.slice((pos - start) as usize..)));
        }

        for (offset, piece) in gaps {
            self.chunks.insert(offset, piece);
        }
        Ok(())
    }

    /// Returns up to `max` bytes at the current read offset. Data past a gap is withheld until
    /// the gap fills.
    pub fn read(&mut self, max: usize) -> Result<ReadOutcome, Error> {
        if let Some(error_code) = self.reset_code {
            self.reset_reported = true;
            return Err(Error::Reset { stream_id: self.id, error_code });
        }
        if self.state == RecvState::DataRead {
            return Ok(ReadOutcome::Finished);
        }

        let first = self.chunks.first_key_value().map(|(&k, _)| k);
        match first {
            Some(offset) if offset == self.read_offset && max > 0 => {
                let mut chunk = match self.chunks.remove(&offset) {
                    Some(chunk) => chunk,
                    None => return Ok(ReadOutcome::Blocked),
                };
                let n = std::cmp::min(max, chunk.len());
                let out = chunk.split_to(n);
                self.read_offset += n as u64;
                if !chunk.is_empty() {
                    self.chunks.insert(self.read_offset, chunk);
                }
                self.flow.on_consumed(n as u64);
                Ok(ReadOutcome::Data(out))
            }
            _ if self.final_size == Some(self.read_offset) => {
                self.state = RecvState::DataRead;
                Ok(ReadOutcome::Finished)
            }
            _ => Ok(ReadOutcome::Blocked),
        }
    }

    /// Whether `read` would return something other than `Blocked`.
    pub fn is_readable(&self) -> bool {
        self.reset_code.is_some()
            || self.state == RecvState::DataRead
            || self.final_size == Some(self.read_offset)
            || self.chunks.contains_key(&self.read_offset)
    }

    /// Abandons the stream at the peer's request. Buffered data is dropped and the error code
    /// replaces any further reads.
    pub fn on_reset(&mut self, error_code: u64, final_size: u64) -> Result<ResetAccounting, TransportError> {
        self.flow.on_received(final_size)?;
        if final_size < self.highest_received || self.final_size.map_or(false, |f| f != final_size) {
            return Err(TransportError::FinalSizeError(self.id));
        }
        if self.state.is_terminal() {
            return Ok(ResetAccounting::default());
        }

        let accounting = ResetAccounting {
            newly_received: final_size - self.highest_received,
            unread: final_size - self.read_offset,
        };
        self.state = RecvState::ResetRecvd;
        self.reset_code = Some(error_code);
        self.chunks.clear();
        self.final_size = Some(final_size);
        self.highest_received = final_size;
        self.read_offset = final_size;
        Ok(accounting)
    }

    /// Stops delivering data to the application. Buffered bytes are dropped and later ones will
    /// be dropped on arrival. Returns how many received bytes were never read, which go back to
    /// the connection window.
    pub fn abandon(&mut self) -> u64 {
        if self.state == RecvState::ResetRecvd {
            self.reset_reported = true;
        }
        if self.state.is_terminal() || self.discarding {
            return 0;
        }
        self.discarding = true;
        self.chunks.clear();
        self.skip_to_highest()
    }

    pub fn is_discarding(&self) -> bool {
        self.discarding
    }

    fn skip_to_highest(&mut self) -> u64 {
        let skipped = self.highest_received - self.read_offset;
        self.read_offset = self.highest_received;
        self.flow.on_consumed(skipped);
        if self.final_size == Some(self.read_offset) {
            self.state = RecvState::DataRead;
        }
        skipped
    }

    /// New stream limit to advertise, if the application has read enough to warrant one.
    pub fn poll_window_update(&mut self) -> Option<u64> {
        if self.state != RecvState::Receiving {
            return None;
        }
        self.flow.poll_update()
    }

    /// Current advertised limit, used when a lost MAX_STREAM_DATA is sent again.
    pub fn max_data(&self) -> Option<u64> {
        if self.state == RecvState::Receiving {
            Some(self.flow.limit())
        }
        else {
            None
        }
    }

    /// The application has seen everything this stream will deliver.
    pub fn is_done(&self) -> bool {
        match self.state {
            RecvState::DataRead => true,
            RecvState::ResetRecvd => self.reset_reported || self.discarding,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> RecvStream {
        RecvStream::new(StreamId(1), 1000)
    }

    fn read_all(s: &mut RecvStream) -> (Vec<u8>, bool) {
        let mut out = Vec::new();
        loop {
            match s.read(usize::MAX).unwrap() {
                ReadOutcome::Data(b) => out.extend_from_slice(&b),
                ReadOutcome::Blocked => return (out, false),
                ReadOutcome::Finished => return (out, true),
            }
        }
    }

    #[test]
    fn out_of_order_with_fin() {
        let mut s = stream();
        s.on_data(5, Bytes::from_static(b"world"), true).unwrap();
        assert_eq!(s.state(), RecvState::SizeKnown);
        assert_eq!(s.read(100).unwrap(), ReadOutcome::Blocked);
        assert!(!s.is_readable());

        s.on_data(0, Bytes::from_static(b"hello"), false).unwrap();
        assert_eq!(read_all(&mut s), (b"helloworld".to_vec(), true));
        assert_eq!(s.state(), RecvState::DataRead);
        assert!(s.is_done());
    }

    #[test]
    fn duplicates_are_delivered_once() {
        let mut s = stream();
        s.on_data(0, Bytes::from_static(b"abc"), false).unwrap();
        s.on_data(0, Bytes::from_static(b"abc"), false).unwrap();
        s.on_data(1, Bytes::from_static(b"bcdef"), false).unwrap();
        assert_eq!(read_all(&mut s).0, b"abcdef".to_vec());

        s.on_data(2, Bytes::from_static(b"cdefg"), false).unwrap();
        assert_eq!(read_all(&mut s).0, b"g".to_vec());
    }

    #[test]
    fn fills_gaps_between_existing_chunks() {
        let mut s = stream();
        s.on_data(2, Bytes::from_static(b"c"), false).unwrap();
        s.on_data(5, Bytes::from_static(b"f"), false).unwrap();
        s.on_data(0, Bytes::from_static(b"abcdefg"), false).unwrap();
        assert_eq!(s.buffered(), 7);
        assert_eq!(read_all(&mut s).0, b"abcdefg".to_vec());
    }

    #[test]
    fn conflicting_overlap() {
        let mut s = stream();
        s.on_data(0, Bytes::from_static(b"hello"), false).unwrap();
        let err = s.on_data(3, Bytes::from_static(b"XYZ"), false).unwrap_err();
        assert_eq!(err, TransportError::DataInconsistent { stream_id: StreamId(1), offset: 3 });
    }

    #[test]
    fn partial_reads() {
        let mut s = stream();
        s.on_data(0, Bytes::from_static(b"abcdef"), true).unwrap();
        assert_eq!(s.read(4).unwrap(), ReadOutcome::Data(Bytes::from_static(b"abcd")));
        assert_eq!(s.read(4).unwrap(), ReadOutcome::Data(Bytes::from_static(b"ef")));
        assert_eq!(s.read(4).unwrap(), ReadOutcome::Finished);
        assert_eq!(s.read(4).unwrap(), ReadOutcome::Finished);
    }

    #[test]
    fn flow_limit() {
        let mut s = stream();
        let err = s.on_data(990, Bytes::from(vec![0u8; 11]), false).unwrap_err();
        assert!(matches!(err, TransportError::FlowControlViolation { offset: 1001, limit: 1000, .. }));
    }

    #[test]
    fn window_update_after_reading() {
        let mut s = stream();
        s.on_data(0, Bytes::from(vec![7u8; 600]), false).unwrap();
        assert_eq!(s.poll_window_update(), None);
        read_all(&mut s);
        assert_eq!(s.poll_window_update(), Some(1600));
        s.on_data(600, Bytes::from(vec![7u8; 1000]), false).unwrap();
    }

    #[test]
    fn final_size_changes_are_errors() {
        let mut s = stream();
        s.on_data(0, Bytes::from_static(b"abc"), true).unwrap();
        assert_eq!(s.on_data(3, Bytes::from_static(b"d"), false).unwrap_err(),
                   TransportError::FinalSizeError(StreamId(1)));
        assert_eq!(s.on_data(0, Bytes::from_static(b"ab"), true).unwrap_err(),
                   TransportError::FinalSizeError(StreamId(1)));

        let mut s = stream();
        s.on_data(0, Bytes::from_static(b"abcdef"), false).unwrap();
        assert_eq!(s.on_data(0, Bytes::from_static(b"abc"), true).unwrap_err(),
                   TransportError::FinalSizeError(StreamId(1)));
    }

    #[test]
    fn reset_surfaces_code() {
        let mut s = stream();
        s.on_data(0, Bytes::from_static(b"abc"), false).unwrap();
        s.read(1).unwrap();
        let accounting = s.on_reset(9, 10).unwrap();
        assert_eq!(accounting, ResetAccounting { newly_received: 7, unread: 9 });
        assert_eq!(s.state(), RecvState::ResetRecvd);
        assert!(!s.is_done());
        assert_eq!(s.read(10).unwrap_err(), Error::Reset { stream_id: StreamId(1), error_code: 9 });
        assert!(s.is_done());

        // data arriving after the reset is ignored
        assert_eq!(s.on_data(3, Bytes::from_static(b"def"), false).unwrap(), 0);
    }

    #[test]
    fn abandoned_stream_drops_data_and_returns_credit() {
        let mut s = stream();
        s.on_data(0, Bytes::from_static(b"abc"), false).unwrap();
        s.on_data(6, Bytes::from_static(b"ghi"), false).unwrap();
        s.read(2).unwrap();
        assert_eq!(s.abandon(), 7);
        assert_eq!(s.buffered(), 0);
        assert_eq!(s.read_offset(), 9);
        assert!(!s.is_done());

        // later data is counted and skipped until the FIN completes the stream
        assert_eq!(s.on_data(9, Bytes::from(vec![0u8; 600]), false).unwrap(), 600);
        assert_eq!(s.buffered(), 0);
        assert_eq!(s.poll_window_update(), Some(1609));
        assert_eq!(s.on_data(609, Bytes::from_static(b"z"), true).unwrap(), 1);
        assert_eq!(s.state(), RecvState::DataRead);
        assert!(s.is_done());
        assert_eq!(s.abandon(), 0);
    }

    #[test]
    fn abandoning_after_fin_or_reset_is_done() {
        let mut s = stream();
        s.on_data(0, Bytes::from_static(b"abc"), true).unwrap();
        assert_eq!(s.abandon(), 3);
        assert!(s.is_done());

        let mut s = stream();
        s.on_reset(4, 10).unwrap();
        assert!(!s.is_done());
        assert_eq!(s.abandon(), 0);
        assert!(s.is_done());
    }

    #[test]
    fn reset_below_received_is_error() {
        let mut s = stream();
        s.on_data(0, Bytes::from_static(b"abcdef"), false).unwrap();
        assert_eq!(s.on_reset(0, 3).unwrap_err(), TransportError::FinalSizeError(StreamId(1)));
    }
}
