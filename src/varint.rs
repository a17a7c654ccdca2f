use bytes::BufMut;
use thiserror::Error;

/// Longest possible encoding of a u64: ten groups of seven bits.
pub const MAX_ENCODED_LEN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("varint does not fit in 64 bits")]
    ValueTooLarge,
    #[error("varint is missing its final byte")]
    MissingFinalByte,
}

pub fn encoded_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    std::cmp::max(1, (bits + 6) / 7)
}

pub fn encode_u64<T>(mut value: u64, out: &mut T) where T : BufMut {
    loop {
        let seven = value & 0x7f;
        value >>= 7;
        if value != 0 {
            out.put_u8((seven | 0x80) as u8);
        }
        else {
            out.put_u8(seven as u8);
            break;
        }
    }
}

/// Decodes a varint from the start of `data`, returning the value and the number of bytes it
/// occupied. Trailing bytes after the final byte are left for the caller.
pub fn decode_u64(data: &[u8]) -> Result<(u64, usize), DecodeError> {
    let mut res: u64 = 0;
    let mut shift = 0;
    for (i, b) in data.iter().enumerate() {
        if shift >= 64 || (shift == 63 && *b > 1) {
            return Err(DecodeError::ValueTooLarge);
        }

        res |= ((b & 0x7f) as u64) << shift;
        shift += 7;

        if (b & 0x80) == 0 {
            return Ok((res, i + 1));
        }
    }
    Err(DecodeError::MissingFinalByte)
}
