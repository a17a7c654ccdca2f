pub mod recv;
pub mod send;

pub use recv::{ReadOutcome, RecvState, RecvStream, ResetAccounting};
pub use send::{SendChunk, SendState, SendStream};

use super::config::Config;
use super::protocol::{Side, StreamId};

/// Both halves of one stream as seen by one endpoint. A unidirectional stream has only the
/// half that applies to this side.
#[derive(Debug)]
pub struct StreamState {
    pub id: StreamId,
    pub send: Option<SendStream>,
    pub recv: Option<RecvStream>,
}

impl StreamState {
    pub fn new(id: StreamId, side: Side, config: &Config) -> Self {
        let send = if id.can_send(side) {
            Some(SendStream::new(id, config.stream_receive_window, config.send_buffer_size))
        }
        else {
            None
        };
        let recv = if id.can_recv(side) {
            Some(RecvStream::new(id, config.stream_receive_window))
        }
        else {
            None
        };
        StreamState { id, send, recv }
    }

    /// Both halves are finished and the stream can be forgotten.
    pub fn is_done(&self) -> bool {
        self.send.as_ref().map_or(true, |s| s.is_done())
            && self.recv.as_ref().map_or(true, |r| r.is_done())
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            id: self.id,
            bytes_sent: self.send.as_ref().map_or(0, |s| s.highest_sent()),
            bytes_retransmitted: self.send.as_ref().map_or(0, |s| s.bytes_retransmitted()),
            bytes_received: self.recv.as_ref().map_or(0, |r| r.highest_received()),
            bytes_read: self.recv.as_ref().map_or(0, |r| r.read_offset()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamStats {
    pub id: StreamId,
    pub bytes_sent: u64,
    pub bytes_retransmitted: u64,
    pub bytes_received: u64,
    pub bytes_read: u64,
}
