use bytes::{Bytes, BytesMut, BufMut};
use crate::binary::BinaryReader;
use crate::varint::{encode_u64, encoded_len};
use super::error::TransportError;
use super::frame::{decode_frames, encode_frames, Frame};
use super::ids::ConnectionId;

/// Fixed part of the header: the connection id.
pub const CONNECTION_ID_LEN: usize = 8;

/// One datagram's worth of frames. Packet numbers are per connection and per direction, start
/// at zero, and are never reused; retransmitted data always travels in a new packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub connection_id: ConnectionId,
    pub packet_number: u64,
    pub frames: Vec<Frame>,
}

impl Packet {
    pub fn header_len(packet_number: u64) -> usize {
        CONNECTION_ID_LEN + encoded_len(packet_number)
    }

    pub fn encode(&self) -> Bytes {
        let len = Self::header_len(self.packet_number)
            + self.frames.iter().map(|f| f.encoded_len()).sum::<usize>();
        let mut out = BytesMut::with_capacity(len);
        out.put_u64(self.connection_id.0);
        encode_u64(self.packet_number, &mut out);
        encode_frames(&self.frames, &mut out);
        out.freeze()
    }

    pub fn decode(datagram: Bytes) -> Result<Packet, TransportError> {
        let mut reader = BinaryReader::new(datagram.clone());
        let malformed = |e: crate::binary::BinaryReadError| TransportError::MalformedFrame(e.to_string());
        let connection_id = ConnectionId(reader.read_u64().map_err(malformed)?);
        let packet_number = reader.read_varint().map_err(malformed)?;
        let frames = decode_frames(datagram.slice(reader.abs_offset()..))?;
        if frames.is_empty() {
            return Err(TransportError::MalformedFrame(String::from("packet carries no frames")));
        }
        Ok(Packet { connection_id, packet_number, frames })
    }

    pub fn is_ack_eliciting(&self) -> bool {
        self.frames.iter().any(|f| f.is_ack_eliciting())
    }
}

/// Reads only the connection id, for routing a datagram before it is fully parsed.
pub fn peek_connection_id(datagram: &[u8]) -> Option<ConnectionId> {
    let bytes: [u8; CONNECTION_ID_LEN] = datagram.get(..CONNECTION_ID_LEN)?.try_into().ok()?;
    Some(ConnectionId(u64::from_be_bytes(bytes)))
}
