//! Length-prefixed primitive encode/decode helpers.
//!
//! Matches the shape of the `io_simple_buffer`/`io_str_buffer`/
//! `io_simple_read`/`io_str_read` helpers referenced (but not included) in
//! the source this core was distilled from: fixed-width little-endian
//! integers, and strings as a `u32` byte length followed by UTF-8 bytes
//! with no terminator (zero length for empty).

use bytes::Bytes;

use crate::hash::{Sha256Hash, SHA256_LEN};

#[derive(Clone, Copy, Debug, derive_more::Display)]
pub enum FramingError {
    #[display("frame ended before expected data")]
    Eof,
    #[display("string is not valid UTF-8")]
    InvalidUtf8,
    #[display("unknown message tag: {}", _0)]
    UnknownTag(u32),
}

impl std::error::Error for FramingError {}

//------------ writers ---------------------------------------------------------

pub fn write_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn write_i32(buf: &mut Vec<u8>, v: i32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn write_i64(buf: &mut Vec<u8>, v: i64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn write_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn write_str(buf: &mut Vec<u8>, s: &str) {
    write_u32(buf, s.len() as u32);
    buf.extend_from_slice(s.as_bytes());
}

pub fn write_bytes(buf: &mut Vec<u8>, b: &[u8]) {
    write_u32(buf, b.len() as u32);
    buf.extend_from_slice(b);
}

pub fn write_hash(buf: &mut Vec<u8>, h: &Sha256Hash) {
    buf.extend_from_slice(h);
}

/// Wraps a message body (tag + payload, as already written by a caller)
/// with the outer `u32` length prefix that lets the multiplexer read
/// exactly one framed message off the control channel.
pub fn frame(body: Vec<u8>) -> Vec<u8> {
    let mut framed = Vec::with_capacity(body.len() + 4);
    write_u32(&mut framed, body.len() as u32);
    framed.extend_from_slice(&body);
    framed
}

//------------ reader ------------------------------------------------------------

/// A cursor over one already-length-delimited message's bytes.
pub struct FrameReader<'a> {
    buf: &'a [u8],
}

impl<'a> FrameReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        FrameReader { buf }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], FramingError> {
        if self.buf.len() < n {
            return Err(FramingError::Eof);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub fn read_u32(&mut self) -> Result<u32, FramingError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_i32(&mut self) -> Result<i32, FramingError> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_i64(&mut self) -> Result<i64, FramingError> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn read_u64(&mut self) -> Result<u64, FramingError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn read_str(&mut self) -> Result<String, FramingError> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| FramingError::InvalidUtf8)
    }

    pub fn read_bytes(&mut self) -> Result<Bytes, FramingError> {
        let len = self.read_u32()? as usize;
        Ok(Bytes::copy_from_slice(self.take(len)?))
    }

    pub fn read_hash(&mut self) -> Result<Sha256Hash, FramingError> {
        let bytes = self.take(SHA256_LEN)?;
        let mut out = [0u8; SHA256_LEN];
        out.copy_from_slice(bytes);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_primitives() {
        let mut buf = Vec::new();
        write_u32(&mut buf, 0xdead_beef);
        write_i32(&mut buf, -17);
        write_u64(&mut buf, u64::MAX);
        write_i64(&mut buf, i64::MIN);
        write_str(&mut buf, "rsync://rpki.example/repo/notification.xml");
        write_bytes(&mut buf, b"\x00\x01binary\xff");
        let hash = [7u8; SHA256_LEN];
        write_hash(&mut buf, &hash);

        let mut r = FrameReader::new(&buf);
        assert_eq!(r.read_u32().unwrap(), 0xdead_beef);
        assert_eq!(r.read_i32().unwrap(), -17);
        assert_eq!(r.read_u64().unwrap(), u64::MAX);
        assert_eq!(r.read_i64().unwrap(), i64::MIN);
        assert_eq!(r.read_str().unwrap(), "rsync://rpki.example/repo/notification.xml");
        assert_eq!(&r.read_bytes().unwrap()[..], b"\x00\x01binary\xff");
        assert_eq!(r.read_hash().unwrap(), hash);
    }

    #[test]
    fn empty_string_round_trips() {
        let mut buf = Vec::new();
        write_str(&mut buf, "");
        let mut r = FrameReader::new(&buf);
        assert_eq!(r.read_str().unwrap(), "");
    }

    #[test]
    fn frame_prefixes_body_with_its_length() {
        let body = vec![1, 2, 3, 4, 5];
        let framed = frame(body.clone());
        assert_eq!(framed.len(), 4 + body.len());
        let mut r = FrameReader::new(&framed);
        assert_eq!(r.read_u32().unwrap() as usize, body.len());
    }

    #[test]
    fn short_buffer_is_eof_not_a_panic() {
        let mut r = FrameReader::new(&[1, 2, 3]);
        assert!(matches!(r.read_u32(), Err(FramingError::Eof)));
    }

    #[test]
    fn invalid_utf8_string_is_rejected() {
        let mut buf = Vec::new();
        write_bytes(&mut buf, &[0xff, 0xfe]);
        let mut r = FrameReader::new(&buf);
        assert!(matches!(r.read_str(), Err(FramingError::InvalidUtf8)));
    }
}
