//! Little-endian wire primitives.
//!
//! SMB1 puts every multi-byte field on the wire in little-endian order.
//! Parsing primitives are free functions over a `Read` source; packing
//! primitives append to a byte buffer, with positional `set_*` helpers for
//! the offset fixups AndX chaining and transaction responses need.

#![allow(dead_code)]

use std::io::Read;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};

use crate::vfs::Error as VfsError;

/// Parsing errors raised while decoding a frame.
#[derive(Debug)]
pub enum Error {
    /// The source ran out of bytes mid-field.
    IO(std::io::Error),
    /// A counted field exceeded its maximum allowed size.
    MaxElemLimit,
    /// A string field was not valid in its declared encoding.
    IncorrectString,
    /// A wire discriminant did not match any known enum variant.
    EnumDiscMismatch,
}

/// Result of parsing operations with error type [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for VfsError {
    fn from(_: Error) -> VfsError {
        VfsError::InvalidParameter
    }
}

/// A field that fails to parse means the block's declared shape lied.
impl From<Error> for crate::status::SmbStatus {
    fn from(_: Error) -> crate::status::SmbStatus {
        crate::status::SmbStatus::SrvUnrecognizedCommand
    }
}

/// Parses a `u8` from the `Read` source.
pub fn u8(src: &mut impl Read) -> Result<u8> {
    src.read_u8().map_err(Error::IO)
}

/// Parses a `u16` from the `Read` source, little-endian.
pub fn u16(src: &mut impl Read) -> Result<u16> {
    src.read_u16::<LittleEndian>().map_err(Error::IO)
}

/// Parses a `u32` from the `Read` source, little-endian.
pub fn u32(src: &mut impl Read) -> Result<u32> {
    src.read_u32::<LittleEndian>().map_err(Error::IO)
}

/// Parses a `u64` from the `Read` source, little-endian.
pub fn u64(src: &mut impl Read) -> Result<u64> {
    src.read_u64::<LittleEndian>().map_err(Error::IO)
}

/// Parses a fixed-size byte array from the `Read` source.
pub fn array<const N: usize>(src: &mut impl Read) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    src.read_exact(&mut buf).map_err(Error::IO)?;
    Ok(buf)
}

/// Parses exactly `n` bytes from the `Read` source.
pub fn bytes(src: &mut impl Read, n: usize) -> Result<Vec<u8>> {
    let mut vec = vec![0u8; n];
    src.read_exact(vec.as_mut_slice()).map_err(Error::IO)?;
    Ok(vec)
}

/// Parses a null-terminated ASCII string with a maximum allowed size.
pub fn string_ascii(src: &mut impl Read, max_size: usize) -> Result<String> {
    let mut out = Vec::new();
    loop {
        match u8(src)? {
            0 => break,
            b => out.push(b),
        }
        if out.len() > max_size {
            return Err(Error::MaxElemLimit);
        }
    }
    String::from_utf8(out).map_err(|_| Error::IncorrectString)
}

/// Parses a null-terminated UCS-2 little-endian string with a maximum size.
pub fn string_unicode(src: &mut impl Read, max_size: usize) -> Result<String> {
    let mut units = Vec::new();
    loop {
        match u16(src)? {
            0 => break,
            u => units.push(u),
        }
        if units.len() > max_size {
            return Err(Error::MaxElemLimit);
        }
    }
    String::from_utf16(&units).map_err(|_| Error::IncorrectString)
}

/// Appends a `u8`.
pub fn put_u8(dest: &mut Vec<u8>, v: u8) {
    dest.push(v);
}

/// Appends a `u16`, little-endian.
pub fn put_u16(dest: &mut Vec<u8>, v: u16) {
    dest.extend_from_slice(&v.to_le_bytes());
}

/// Appends a `u32`, little-endian.
pub fn put_u32(dest: &mut Vec<u8>, v: u32) {
    dest.extend_from_slice(&v.to_le_bytes());
}

/// Appends a `u64`, little-endian.
pub fn put_u64(dest: &mut Vec<u8>, v: u64) {
    dest.extend_from_slice(&v.to_le_bytes());
}

/// Appends raw bytes.
pub fn put_bytes(dest: &mut Vec<u8>, bytes: &[u8]) {
    dest.extend_from_slice(bytes);
}

/// Appends `n` zero bytes.
pub fn put_zeros(dest: &mut Vec<u8>, n: usize) {
    dest.resize(dest.len() + n, 0);
}

/// Appends a null-terminated ASCII string. Non-ASCII characters are
/// replaced with `?`, matching what down-level clients would see.
pub fn put_string_ascii(dest: &mut Vec<u8>, s: &str) {
    for c in s.chars() {
        dest.push(if c.is_ascii() { c as u8 } else { b'?' });
    }
    dest.push(0);
}

/// Appends a null-terminated UCS-2 little-endian string.
pub fn put_string_unicode(dest: &mut Vec<u8>, s: &str) {
    for unit in s.encode_utf16() {
        put_u16(dest, unit);
    }
    put_u16(dest, 0);
}

/// Appends a string in the encoding the request negotiated, padding to an
/// even `base`-relative offset first when the string is Unicode.
pub fn put_string(dest: &mut Vec<u8>, s: &str, unicode: bool, base: usize) {
    if unicode {
        if (dest.len() - base) % 2 != 0 {
            dest.push(0);
        }
        put_string_unicode(dest, s);
    } else {
        put_string_ascii(dest, s);
    }
}

/// Overwrites a `u16` at an absolute buffer offset.
pub fn set_u16(dest: &mut [u8], offset: usize, v: u16) {
    LittleEndian::write_u16(&mut dest[offset..offset + 2], v);
}

/// Overwrites a `u32` at an absolute buffer offset.
pub fn set_u32(dest: &mut [u8], offset: usize, v: u32) {
    LittleEndian::write_u32(&mut dest[offset..offset + 4], v);
}

/// Overwrites a `u64` at an absolute buffer offset.
pub fn set_u64(dest: &mut [u8], offset: usize, v: u64) {
    LittleEndian::write_u64(&mut dest[offset..offset + 8], v);
}

/// Reads a `u16` at an absolute buffer offset.
pub fn get_u16(src: &[u8], offset: usize) -> u16 {
    LittleEndian::read_u16(&src[offset..offset + 2])
}

/// Reads a `u32` at an absolute buffer offset.
pub fn get_u32(src: &[u8], offset: usize) -> u32 {
    LittleEndian::read_u32(&src[offset..offset + 4])
}

/// Reads a `u64` at an absolute buffer offset.
pub fn get_u64(src: &[u8], offset: usize) -> u64 {
    LittleEndian::read_u64(&src[offset..offset + 8])
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    #[test]
    fn test_integers_little_endian() {
        let data = [0x01, 0x02, 0x03, 0x04];
        let mut src = Cursor::new(&data[..]);
        assert_eq!(super::u16(&mut src).unwrap(), 0x0201);
        assert_eq!(super::u16(&mut src).unwrap(), 0x0403);

        let mut out = Vec::new();
        super::put_u32(&mut out, 0x0403_0201);
        assert_eq!(out, data);
    }

    #[test]
    fn test_string_ascii_round_trip() {
        let mut out = Vec::new();
        super::put_string_ascii(&mut out, "IPC$");
        assert_eq!(out, b"IPC$\0");

        let mut src = Cursor::new(&out[..]);
        assert_eq!(super::string_ascii(&mut src, 255).unwrap(), "IPC$");
    }

    #[test]
    fn test_string_ascii_unterminated() {
        let mut src = Cursor::new(&b"abc"[..]);
        assert!(matches!(super::string_ascii(&mut src, 255), Err(super::Error::IO(_))));
    }

    #[test]
    fn test_string_unicode_round_trip() {
        let mut out = Vec::new();
        super::put_string_unicode(&mut out, "A.TXT");
        assert_eq!(out.len(), 12);
        assert_eq!(&out[..4], &[b'A', 0, b'.', 0]);

        let mut src = Cursor::new(&out[..]);
        assert_eq!(super::string_unicode(&mut src, 255).unwrap(), "A.TXT");
    }

    #[test]
    fn test_put_string_aligns_unicode() {
        // One byte already in the block: a Unicode string must pad first.
        let mut out = vec![0xEE];
        super::put_string(&mut out, "x", true, 0);
        assert_eq!(out, [0xEE, 0x00, b'x', 0x00, 0x00, 0x00]);

        // ASCII never pads.
        let mut out = vec![0xEE];
        super::put_string(&mut out, "x", false, 0);
        assert_eq!(out, [0xEE, b'x', 0x00]);
    }

    #[test]
    fn test_set_at_offset() {
        let mut buf = vec![0u8; 8];
        super::set_u16(&mut buf, 2, 0xBEEF);
        super::set_u32(&mut buf, 4, 0x0102_0304);
        assert_eq!(super::get_u16(&buf, 2), 0xBEEF);
        assert_eq!(super::get_u32(&buf, 4), 0x0102_0304);
    }
}
