//! CompactSize variable-length integers
//!
//! Values below 0xFD take one byte; larger values are prefixed with
//! 0xFD (u16), 0xFE (u32) or 0xFF (u64), all little-endian.

use bytes::{Buf, BufMut};

/// Append `value` as a CompactSize integer
pub fn write_varint<B: BufMut>(buf: &mut B, value: u64) {
    match value {
        0..=0xFC => buf.put_u8(value as u8),
        0xFD..=0xFFFF => {
            buf.put_u8(0xFD);
            buf.put_u16_le(value as u16);
        }
        0x1_0000..=0xFFFF_FFFF => {
            buf.put_u8(0xFE);
            buf.put_u32_le(value as u32);
        }
        _ => {
            buf.put_u8(0xFF);
            buf.put_u64_le(value);
        }
    }
}

/// Read a CompactSize integer, or `None` when the buffer is too short
pub fn read_varint<B: Buf>(buf: &mut B) -> Option<u64> {
    if !buf.has_remaining() {
        return None;
    }
    let prefix = buf.get_u8();
    let width = match prefix {
        0xFD => 2,
        0xFE => 4,
        0xFF => 8,
        small => return Some(small as u64),
    };
    if buf.remaining() < width {
        return None;
    }
    Some(match width {
        2 => buf.get_u16_le() as u64,
        4 => buf.get_u32_le() as u64,
        _ => buf.get_u64_le(),
    })
}

/// Encoded size of `value` in bytes
pub fn varint_len(value: u64) -> usize {
    match value {
        0..=0xFC => 1,
        0xFD..=0xFFFF => 3,
        0x1_0000..=0xFFFF_FFFF => 5,
        _ => 9,
    }
}
