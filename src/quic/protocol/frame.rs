use std::ops::RangeInclusive;
use bytes::{Bytes, BufMut};
use crate::binary::{BinaryReader, BinaryReadError};
use crate::varint::{encode_u64, encoded_len};
use super::error::TransportError;
use super::ids::{Direction, StreamId};

const TAG_PING: u8 = 0x01;
const TAG_ACK: u8 = 0x02;
const TAG_RESET_STREAM: u8 = 0x04;
const TAG_STREAM: u8 = 0x08;
const TAG_STREAM_FIN: u8 = 0x09;
const TAG_MAX_DATA: u8 = 0x10;
const TAG_MAX_STREAM_DATA: u8 = 0x11;
const TAG_MAX_STREAMS_BIDI: u8 = 0x12;
const TAG_MAX_STREAMS_UNI: u8 = 0x13;
const TAG_CONNECTION_CLOSE: u8 = 0x1c;

/// Carries stream data, implicitly opening the stream at the receiver if it has not been seen
/// before.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    pub stream_id: StreamId,
    pub offset: u64,
    pub fin: bool,
    pub data: Bytes,
}

impl StreamFrame {
    pub fn end(&self) -> u64 {
        self.offset + self.data.len() as u64
    }
}

/// Acknowledges packet numbers. The ranges are inclusive and in descending order with at least
/// one unacknowledged packet between neighbours; the first range ends at the largest
/// acknowledged packet number. There is always at least one range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckFrame {
    pub ack_delay_us: u64,
    ranges: Vec<RangeInclusive<u64>>,
}

impl AckFrame {
    /// Returns `None` unless `ranges` is non-empty, descending, and free of overlapping or
    /// adjacent ranges, which are the only shapes the wire encoding can express.
    pub fn new(ack_delay_us: u64, ranges: Vec<RangeInclusive<u64>>) -> Option<Self> {
        if ranges.is_empty() || ranges.iter().any(|r| r.start() > r.end()) {
            return None;
        }
        let separated = ranges.windows(2)
            .all(|pair| pair[1].end().checked_add(1).map_or(false, |next| next < *pair[0].start()));
        if !separated {
            return None;
        }
        Some(AckFrame { ack_delay_us, ranges })
    }

    pub fn ranges(&self) -> &[RangeInclusive<u64>] {
        &self.ranges
    }

    pub fn largest(&self) -> u64 {
        self.ranges.first().map(|r| *r.end()).unwrap_or(0)
    }

    pub fn contains(&self, packet_number: u64) -> bool {
        self.ranges.iter().any(|r| r.contains(&packet_number))
    }

    /// Pairs of varints as they appear on the wire: the largest packet number and the first
    /// range's length, then a gap and length for each further range.
    fn wire_fields(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        let mut prev_start: Option<u64> = None;
        self.ranges.iter().map(move |range| {
            let first = match prev_start {
                Some(prev_start) => prev_start.saturating_sub(*range.end()).saturating_sub(2),
                None => *range.end(),
            };
            prev_start = Some(*range.start());
            (first, range.end() - range.start())
        })
    }
}

/// Target of a flow control limit update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowTarget {
    Connection,
    Stream(StreamId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Ping,
    Ack(AckFrame),
    ResetStream { stream_id: StreamId, error_code: u64, final_size: u64 },
    Stream(StreamFrame),
    MaxData { target: FlowTarget, limit: u64 },
    MaxStreams { direction: Direction, count: u64 },
    ConnectionClose { error_code: u64, reason: Bytes },
}

impl Frame {
    /// Frames that oblige the receiver to send an acknowledgement.
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(self, Frame::Ack(_) | Frame::ConnectionClose { .. })
    }

    pub fn encode<T: BufMut>(&self, out: &mut T) {
        match self {
            Frame::Ping => {
                out.put_u8(TAG_PING);
            }
            Frame::Ack(ack) => {
                out.put_u8(TAG_ACK);
                encode_u64(ack.ack_delay_us, out);
                encode_u64(ack.ranges.len().saturating_sub(1) as u64, out);
                for (first, len) in ack.wire_fields() {
                    encode_u64(first, out);
                    encode_u64(len, out);
                }
            }
            Frame::ResetStream { stream_id, error_code, final_size } => {
                out.put_u8(TAG_RESET_STREAM);
                encode_u64(stream_id.0, out);
                encode_u64(*error_code, out);
                encode_u64(*final_size, out);
            }
            Frame::Stream(frame) => {
                out.put_u8(if frame.fin { TAG_STREAM_FIN } else { TAG_STREAM });
                encode_u64(frame.stream_id.0, out);
                encode_u64(frame.offset, out);
                encode_u64(frame.data.len() as u64, out);
                out.put_slice(&frame.data);
            }
            Frame::MaxData { target: FlowTarget::Connection, limit } => {
                out.put_u8(TAG_MAX_DATA);
                encode_u64(*limit, out);
            }
            Frame::MaxData { target: FlowTarget::Stream(stream_id), limit } => {
                out.put_u8(TAG_MAX_STREAM_DATA);
                encode_u64(stream_id.0, out);
                encode_u64(*limit, out);
            }
            Frame::MaxStreams { direction, count } => {
                out.put_u8(match direction {
                    Direction::Bidirectional => TAG_MAX_STREAMS_BIDI,
                    Direction::Unidirectional => TAG_MAX_STREAMS_UNI,
                });
                encode_u64(*count, out);
            }
            Frame::ConnectionClose { error_code, reason } => {
                out.put_u8(TAG_CONNECTION_CLOSE);
                encode_u64(*error_code, out);
                encode_u64(reason.len() as u64, out);
                out.put_slice(reason);
            }
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            Frame::Ping => 1,
            Frame::Ack(ack) => {
                let header = 1 + encoded_len(ack.ack_delay_us) + encoded_len(ack.ranges.len().saturating_sub(1) as u64);
                ack.wire_fields().fold(header, |len, (first, range_len)| {
                    len + encoded_len(first) + encoded_len(range_len)
                })
            }
            Frame::ResetStream { stream_id, error_code, final_size } => {
                1 + encoded_len(stream_id.0) + encoded_len(*error_code) + encoded_len(*final_size)
            }
            Frame::Stream(frame) => {
                stream_header_len(frame.stream_id, frame.offset, frame.data.len()) + frame.data.len()
            }
            Frame::MaxData { target: FlowTarget::Connection, limit } => 1 + encoded_len(*limit),
            Frame::MaxData { target: FlowTarget::Stream(stream_id), limit } => {
                1 + encoded_len(stream_id.0) + encoded_len(*limit)
            }
            Frame::MaxStreams { count, .. } => 1 + encoded_len(*count),
            Frame::ConnectionClose { error_code, reason } => {
                1 + encoded_len(*error_code) + encoded_len(reason.len() as u64) + reason.len()
            }
        }
    }
}

/// Bytes a STREAM frame spends on everything but its payload.
pub fn stream_header_len(stream_id: StreamId, offset: u64, data_len: usize) -> usize {
    1 + encoded_len(stream_id.0) + encoded_len(offset) + encoded_len(data_len as u64)
}

pub fn encode_frames<T: BufMut>(frames: &[Frame], out: &mut T) {
    for frame in frames.iter() {
        frame.encode(out);
    }
}

/// Parses every frame in `data`. Each datagram is a complete unit, so a frame cut short by the
/// end of the buffer is an error rather than something to wait for.
pub fn decode_frames(data: Bytes) -> Result<Vec<Frame>, TransportError> {
    let mut reader = BinaryReader::new(data);
    let mut frames = Vec::new();
    while reader.remaining() > 0 {
        frames.push(decode_frame(&mut reader)?);
    }
    Ok(frames)
}

fn malformed(e: BinaryReadError) -> TransportError {
    TransportError::MalformedFrame(e.to_string())
}

fn decode_frame(reader: &mut BinaryReader) -> Result<Frame, TransportError> {
    let offset = reader.abs_offset();
    let tag = reader.read_u8().map_err(malformed)?;
    match tag {
        TAG_PING => Ok(Frame::Ping),
        TAG_ACK => decode_ack(reader),
        TAG_RESET_STREAM => {
            let stream_id = StreamId(reader.read_varint().map_err(malformed)?);
            let error_code = reader.read_varint().map_err(malformed)?;
            let final_size = reader.read_varint().map_err(malformed)?;
            Ok(Frame::ResetStream { stream_id, error_code, final_size })
        }
        TAG_STREAM | TAG_STREAM_FIN => {
            let stream_id = StreamId(reader.read_varint().map_err(malformed)?);
            let stream_offset = reader.read_varint().map_err(malformed)?;
            let len = reader.read_varint().map_err(malformed)?;
            if stream_offset.checked_add(len).is_none() {
                return Err(TransportError::MalformedFrame(
                    format!("stream frame at offset {} overflows", offset)));
            }
            let data = reader.read_bytes(len).map_err(malformed)?;
            Ok(Frame::Stream(StreamFrame {
                stream_id,
                offset: stream_offset,
                fin: tag == TAG_STREAM_FIN,
                data,
            }))
        }
        TAG_MAX_DATA => {
            let limit = reader.read_varint().map_err(malformed)?;
            Ok(Frame::MaxData { target: FlowTarget::Connection, limit })
        }
        TAG_MAX_STREAM_DATA => {
            let stream_id = StreamId(reader.read_varint().map_err(malformed)?);
            let limit = reader.read_varint().map_err(malformed)?;
            Ok(Frame::MaxData { target: FlowTarget::Stream(stream_id), limit })
        }
        TAG_MAX_STREAMS_BIDI | TAG_MAX_STREAMS_UNI => {
            let count = reader.read_varint().map_err(malformed)?;
            let direction = if tag == TAG_MAX_STREAMS_BIDI {
                Direction::Bidirectional
            }
            else {
                Direction::Unidirectional
            };
            Ok(Frame::MaxStreams { direction, count })
        }
        TAG_CONNECTION_CLOSE => {
            let error_code = reader.read_varint().map_err(malformed)?;
            let len = reader.read_varint().map_err(malformed)?;
            let reason = reader.read_bytes(len).map_err(malformed)?;
            Ok(Frame::ConnectionClose { error_code, reason })
        }
        _ => Err(TransportError::MalformedFrame(
            format!("unknown frame tag 0x{:02x} at offset {}", tag, offset))),
    }
}

fn decode_ack(reader: &mut BinaryReader) -> Result<Frame, TransportError> {
    let ack_delay_us = reader.read_varint().map_err(malformed)?;
    let extra_ranges = reader.read_varint().map_err(malformed)?;
    let largest = reader.read_varint().map_err(malformed)?;
    let first_len = reader.read_varint().map_err(malformed)?;

    let underflow = || TransportError::MalformedFrame(String::from("ack range below zero"));

    let mut start = largest.checked_sub(first_len).ok_or_else(underflow)?;
    let mut ranges = vec![start..=largest];

    // Each further range costs at least two bytes, which bounds the loop by the datagram size.
    for _ in 0..extra_ranges {
        let gap = reader.read_varint().map_err(malformed)?;
        let len = reader.read_varint().map_err(malformed)?;
        let end = start.checked_sub(gap).and_then(|v| v.checked_sub(2)).ok_or_else(underflow)?;
        start = end.checked_sub(len).ok_or_else(underflow)?;
        ranges.push(start..=end);
    }

    Ok(Frame::Ack(AckFrame { ack_delay_us, ranges }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quic::protocol::ids::{Side, Direction};

    fn roundtrip(frames: Vec<Frame>) {
        let mut out: Vec<u8> = Vec::new();
        encode_frames(&frames, &mut out);
        let expected_len: usize = frames.iter().map(|f| f.encoded_len()).sum();
        assert_eq!(out.len(), expected_len);
        assert_eq!(decode_frames(Bytes::from(out)).unwrap(), frames);
    }

    fn ack(ack_delay_us: u64, ranges: Vec<RangeInclusive<u64>>) -> AckFrame {
        AckFrame::new(ack_delay_us, ranges).unwrap()
    }

    fn stream(id: u64, offset: u64, fin: bool, data: &'static [u8]) -> Frame {
        Frame::Stream(StreamFrame { stream_id: StreamId(id), offset, fin, data: Bytes::from_static(data) })
    }

    #[test]
    fn empty_sequence() {
        roundtrip(vec![]);
    }

    #[test]
    fn mixed_frames() {
        roundtrip(vec![
            Frame::Ack(ack(250, vec![10..=12, 4..=7, 0..=1])),
            stream(0, 0, false, b"hello"),
            stream(4, 5, true, b""),
            Frame::Ping,
            Frame::ResetStream { stream_id: StreamId(8), error_code: 42, final_size: 1000 },
            Frame::MaxData { target: FlowTarget::Connection, limit: 1 << 20 },
            Frame::MaxData { target: FlowTarget::Stream(StreamId(1)), limit: 65536 },
            Frame::MaxStreams { direction: Direction::Unidirectional, count: 7 },
            Frame::ConnectionClose { error_code: 0x0a, reason: Bytes::from_static(b"bye") },
        ]);
    }

    #[test]
    fn maximum_length_fields() {
        let id = StreamId::new(Side::Server, Direction::Unidirectional, u64::MAX >> 2);
        roundtrip(vec![
            Frame::Stream(StreamFrame { stream_id: id, offset: u64::MAX, fin: true, data: Bytes::new() }),
            Frame::ResetStream { stream_id: id, error_code: u64::MAX, final_size: u64::MAX },
            Frame::MaxData { target: FlowTarget::Stream(id), limit: u64::MAX },
            Frame::Ack(ack(u64::MAX, vec![0..=u64::MAX])),
        ]);
    }

    #[test]
    fn single_packet_ack() {
        let ack = ack(0, vec![3..=3]);
        assert_eq!(ack.largest(), 3);
        assert!(ack.contains(3));
        assert!(!ack.contains(2));
        roundtrip(vec![Frame::Ack(ack)]);
    }

    #[test]
    fn ack_ranges_must_be_encodable() {
        assert_eq!(AckFrame::new(0, vec![]), None);
        assert_eq!(AckFrame::new(0, vec![5..=3]), None);
        // ascending
        assert_eq!(AckFrame::new(0, vec![0..=1, 4..=7]), None);
        // adjacent, which the encoding cannot tell apart from one range
        assert_eq!(AckFrame::new(0, vec![4..=7, 2..=3]), None);
        assert_eq!(AckFrame::new(0, vec![4..=7, 3..=5]), None);

        let ack = ack(0, vec![4..=7, 0..=2]);
        assert_eq!(ack.ranges(), &[4..=7, 0..=2]);
        roundtrip(vec![Frame::Ack(ack)]);
    }

    #[test]
    fn unknown_tag() {
        let err = decode_frames(Bytes::from_static(&[0x01, 0x3f])).unwrap_err();
        assert!(matches!(err, TransportError::MalformedFrame(_)));
    }

    #[test]
    fn length_overruns_buffer() {
        // STREAM id=0 offset=0 len=10 with only 3 payload bytes present
        let err = decode_frames(Bytes::from_static(&[0x08, 0x00, 0x00, 0x0a, b'a', b'b', b'c'])).unwrap_err();
        assert!(matches!(err, TransportError::MalformedFrame(_)));
    }

    #[test]
    fn truncated_field() {
        let err = decode_frames(Bytes::from_static(&[0x04, 0x00])).unwrap_err();
        assert!(matches!(err, TransportError::MalformedFrame(_)));
    }

    #[test]
    fn ack_range_underflow() {
        // largest=2, first range length 5
        let err = decode_frames(Bytes::from_static(&[0x02, 0x00, 0x00, 0x02, 0x05])).unwrap_err();
        assert!(matches!(err, TransportError::MalformedFrame(_)));
    }

    #[test]
    fn stream_offset_overflow() {
        let mut out: Vec<u8> = vec![0x08, 0x00];
        encode_u64(u64::MAX, &mut out);
        encode_u64(1, &mut out);
        out.push(b'x');
        let err = decode_frames(Bytes::from(out)).unwrap_err();
        assert!(matches!(err, TransportError::MalformedFrame(_)));
    }

    #[test]
    fn ack_eliciting() {
        assert!(Frame::Ping.is_ack_eliciting());
        assert!(stream(0, 0, false, b"x").is_ack_eliciting());
        assert!(!Frame::Ack(ack(0, vec![0..=0])).is_ack_eliciting());
    }
}
