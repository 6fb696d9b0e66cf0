//! The handful of BER encodings MCS connect PDUs use.
//!
//! Tags above 0xFF are written as two bytes. Lengths below 0x80 take
//! one byte, anything else is `0x82` followed by a big-endian `u16`.

use crate::error::{RdpError, Result};
use crate::stream::PacketBuffer;

pub const TAG_BOOLEAN: u16 = 1;
pub const TAG_INTEGER: u16 = 2;
pub const TAG_OCTET_STRING: u16 = 4;
pub const TAG_RESULT: u16 = 10;
pub const TAG_DOMAIN_PARAMS: u16 = 0x30;

/// Read a header, requiring `tag`, and return its length.
pub fn parse_header(s: &mut PacketBuffer, tag: u16) -> Result<usize> {
    let found = if tag > 0xFF {
        s.read_u16_be()?
    } else {
        s.read_u8()? as u16
    };
    if found != tag {
        return Err(RdpError::protocol(format!(
            "expected BER tag {tag:#x}, got {found:#x}"
        )));
    }
    let first = s.read_u8()?;
    if first & 0x80 == 0 {
        return Ok(first as usize);
    }
    let mut len = 0usize;
    for _ in 0..(first & 0x7F) {
        len = (len << 8) | s.read_u8()? as usize;
    }
    Ok(len)
}

pub fn write_header(s: &mut PacketBuffer, tag: u16, len: usize) -> Result<()> {
    if tag > 0xFF {
        s.write_u16_be(tag)?;
    } else {
        s.write_u8(tag as u8)?;
    }
    if len >= 0x80 {
        s.write_u8(0x82)?;
        s.write_u16_be(len as u16)
    } else {
        s.write_u8(len as u8)
    }
}

/// Encoded size of a header for `tag` and `len`.
pub fn header_len(tag: u16, len: usize) -> usize {
    let tag_len = if tag > 0xFF { 2 } else { 1 };
    let len_len = if len >= 0x80 { 3 } else { 1 };
    tag_len + len_len
}

/// Integers are always written in two bytes.
pub fn write_integer(s: &mut PacketBuffer, value: u16) -> Result<()> {
    write_header(s, TAG_INTEGER, 2)?;
    s.write_u16_be(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_tag_and_long_length() {
        let mut s = PacketBuffer::with_capacity(8);
        write_header(&mut s, 0x7F65, 0x1234).unwrap();
        s.mark_end();
        assert_eq!(s.as_slice(), &[0x7F, 0x65, 0x82, 0x12, 0x34]);
        assert_eq!(header_len(0x7F65, 0x1234), 5);

        s.set_position(0).unwrap();
        assert_eq!(parse_header(&mut s, 0x7F65).unwrap(), 0x1234);
    }

    #[test]
    fn short_header_and_tag_mismatch() {
        let mut s = PacketBuffer::from_vec(vec![0x04, 0x05]);
        assert_eq!(parse_header(&mut s, TAG_OCTET_STRING).unwrap(), 5);
        let mut s = PacketBuffer::from_vec(vec![0x02, 0x01]);
        assert!(parse_header(&mut s, TAG_OCTET_STRING).is_err());
    }

    #[test]
    fn single_byte_long_form_length_is_accepted() {
        let mut s = PacketBuffer::from_vec(vec![0x0A, 0x81, 0x90]);
        assert_eq!(parse_header(&mut s, TAG_RESULT).unwrap(), 0x90);
    }
}
