//
// Little-endian primitives over byte buffers at explicit offsets
//

use byteorder::{ByteOrder, LittleEndian};

use crate::kdb3::error::{Error, Result};

pub const STRING_TERMINATOR: u8 = 0;


// Borrow `len` bytes at `offset`, failing instead of panicking on short input
pub fn slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    offset
        .checked_add(len)
        .and_then(|end| data.get(offset..end))
        .ok_or(Error::MalformedFile("unexpected end of data"))
}

pub fn read_u8(data: &[u8], offset: usize) -> Result<u8> {
    Ok(slice(data, offset, 1)?[0])
}

pub fn read_u16(data: &[u8], offset: usize) -> Result<u16> {
    Ok(LittleEndian::read_u16(slice(data, offset, 2)?))
}

pub fn read_u32(data: &[u8], offset: usize) -> Result<u32> {
    Ok(LittleEndian::read_u32(slice(data, offset, 4)?))
}

pub fn write_u32(data: &mut [u8], offset: usize, value: u32) {
    LittleEndian::write_u32(&mut data[offset..offset + 4], value);
}

pub fn push_u16(buf: &mut Vec<u8>, value: u16) {
    let mut raw = [0u8; 2];
    LittleEndian::write_u16(&mut raw, value);
    buf.extend_from_slice(&raw);
}

pub fn push_u32(buf: &mut Vec<u8>, value: u32) {
    let mut raw = [0u8; 4];
    LittleEndian::write_u32(&mut raw, value);
    buf.extend_from_slice(&raw);
}


// Bytes of a NUL terminated string. Scanning stops at the first NUL or at
// the end of the field, whichever comes first.
pub fn read_cstr(field: &[u8]) -> &[u8] {
    match field.iter().position(|&b| b == STRING_TERMINATOR) {
        Some(end) => &field[..end],
        None => field,
    }
}

pub fn read_string(field: &[u8]) -> String {
    String::from_utf8_lossy(read_cstr(field)).into_owned()
}

// Wire form of a string: UTF-8 plus one trailing NUL
pub fn string_bytes(value: &str) -> Vec<u8> {
    cstr_bytes(value.as_bytes())
}

pub fn cstr_bytes(value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len() + 1);
    out.extend_from_slice(value);
    out.push(STRING_TERMINATOR);
    out
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_ints() {
        let data = [0x03, 0xD9, 0xA2, 0x9A, 0xFF, 0xFF];
        assert_eq!(read_u32(&data, 0).unwrap(), 0x9AA2D903);
        assert_eq!(read_u16(&data, 4).unwrap(), 0xFFFF);
        assert_eq!(read_u8(&data, 1).unwrap(), 0xD9);
    }

    #[test]
    fn test_short_read_is_malformed() {
        let data = [1, 2, 3];
        assert!(matches!(read_u32(&data, 0), Err(Error::MalformedFile(_))));
        assert!(matches!(read_u16(&data, 2), Err(Error::MalformedFile(_))));
        assert!(slice(&data, usize::MAX, 2).is_err());
    }

    #[test]
    fn test_push_and_write() {
        let mut buf = Vec::new();
        push_u16(&mut buf, 0x0102);
        push_u32(&mut buf, 0x03040506);
        assert_eq!(buf, vec![0x02, 0x01, 0x06, 0x05, 0x04, 0x03]);

        let mut header = [0u8; 8];
        write_u32(&mut header, 4, 300);
        assert_eq!(read_u32(&header, 4).unwrap(), 300);
    }

    #[test]
    fn test_strings() {
        assert_eq!(string_bytes("abc"), b"abc\0".to_vec());
        assert_eq!(string_bytes(""), vec![0]);
        assert_eq!(read_string(b"abc\0def"), "abc");
        assert_eq!(read_string(b"no-terminator"), "no-terminator");
        assert_eq!(read_string("ÖÄÜ\0".as_bytes()), "ÖÄÜ");
        assert_eq!(read_cstr(b"\0"), b"");
    }
}
