use bytes::Bytes;
use thiserror::Error;
use crate::varint;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BinaryReadError {
    #[error("unexpected EOF at offset {offset}; expected {expected} bytes")]
    UnexpectedEOF { offset: usize, expected: usize },
    #[error("arithmetic overflow at offset {offset}; requested {requested} bytes")]
    SizeOverflow { offset: usize, requested: u64 },
    #[error("invalid varint at offset {offset}: {error}")]
    InvalidVarInt { offset: usize, error: varint::DecodeError },
}

/// Cursor over a received datagram. Slices handed out by `read_bytes` share the datagram's
/// allocation rather than copying.
pub struct BinaryReader {
    buf: Bytes,
    offset: usize,
}

impl BinaryReader {
    pub fn new(buf: Bytes) -> BinaryReader {
        BinaryReader {
            buf,
            offset: 0,
        }
    }

    pub fn abs_offset(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.offset)
    }

    fn check_available(&self, size: u64) -> Result<usize, BinaryReadError> {
        let size_usize = usize::try_from(size)
            .map_err(|_| BinaryReadError::SizeOverflow { offset: self.offset, requested: size })?;
        match self.offset.checked_add(size_usize) {
            Some(next) if next <= self.buf.len() => Ok(next),
            Some(_) => Err(BinaryReadError::UnexpectedEOF { offset: self.offset, expected: size_usize }),
            None => Err(BinaryReadError::SizeOverflow { offset: self.offset, requested: size }),
        }
    }

    pub fn read_u8(&mut self) -> Result<u8, BinaryReadError> {
        let next = self.check_available(1)?;
        let res = self.buf[self.offset];
        self.offset = next;
        Ok(res)
    }

    pub fn read_u64(&mut self) -> Result<u64, BinaryReadError> {
        let next = self.check_available(8)?;
        let mut bytes: [u8; 8] = Default::default();
        bytes.copy_from_slice(&self.buf[self.offset..next]);
        self.offset = next;
        Ok(u64::from_be_bytes(bytes))
    }

    pub fn read_varint(&mut self) -> Result<u64, BinaryReadError> {
        match varint::decode_u64(&self.buf[self.offset..]) {
            Ok((value, len)) => {
                self.offset += len;
                Ok(value)
            }
            Err(varint::DecodeError::MissingFinalByte) => {
                Err(BinaryReadError::UnexpectedEOF { offset: self.offset, expected: self.remaining() + 1 })
            }
            Err(error) => Err(BinaryReadError::InvalidVarInt { offset: self.offset, error }),
        }
    }

    pub fn read_bytes(&mut self, size: u64) -> Result<Bytes, BinaryReadError> {
        let end = self.check_available(size)?;
        let res = self.buf.slice(self.offset..end);
        self.offset = end;
        Ok(res)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use super::{BinaryReader, BinaryReadError};

    #[test]
    fn reads_in_sequence() {
        let mut reader = BinaryReader::new(Bytes::from_static(&[
            0x07,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x02,
            0xac, 0x02,
            b'h', b'i',
        ]));
        assert_eq!(reader.read_u8(), Ok(7));
        assert_eq!(reader.read_u64(), Ok(0x0102));
        assert_eq!(reader.read_varint(), Ok(300));
        assert_eq!(reader.read_bytes(2), Ok(Bytes::from_static(b"hi")));
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn overrun_is_reported() {
        let mut reader = BinaryReader::new(Bytes::from_static(&[1, 2, 3]));
        assert_eq!(reader.read_bytes(4), Err(BinaryReadError::UnexpectedEOF { offset: 0, expected: 4 }));
        assert_eq!(reader.abs_offset(), 0);
    }

    #[test]
    fn huge_length_is_reported() {
        let mut reader = BinaryReader::new(Bytes::from_static(&[1, 2, 3]));
        reader.read_u8().unwrap();
        assert!(reader.read_bytes(u64::MAX).is_err());
    }

    #[test]
    fn truncated_varint() {
        let mut reader = BinaryReader::new(Bytes::from_static(&[0x80, 0x80]));
        assert!(matches!(reader.read_varint(), Err(BinaryReadError::UnexpectedEOF { .. })));
    }
}
