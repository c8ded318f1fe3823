//! Wire message contract and primitive codec.
//!
//! Every protocol message knows its own type id and how to write/read its
//! payload for a given [`Context`]. Frames are `[type id: u16][payload]`;
//! framing on the transport (length prefix) lives in [`crate::net`].
//!
//! Integers are big-endian. Strings are `u16` length-prefixed UTF-8, byte
//! blobs are `u32` length-prefixed. Readers never trust a declared length:
//! anything that would read past the end of the buffer is
//! [`DecodeError::Truncated`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message_type::MessageType;

/// The side that decodes a frame.
///
/// Encoders pass the side that will receive the frame, so one frame is always
/// written and read under the same context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Context {
    /// Frame travels client -> server.
    Server,
    /// Frame travels server -> client.
    Client,
}

impl Context {
    /// Side that produced a frame decoded under this context.
    pub fn sender(self) -> Context {
        match self {
            Context::Server => Context::Client,
            Context::Client => Context::Server,
        }
    }
}

/// Malformed or unexpected input. Fatal for the connection that sent it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("buffer truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("{0} trailing bytes after message payload")]
    TrailingBytes(usize),

    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    #[error("unknown core message type {0}")]
    UnknownCoreType(u16),

    #[error("extension message id {0} is not in the negotiated registry")]
    UnknownExtension(u16),

    #[error("{kind} cannot be sent to the {context:?} side")]
    WrongDirection { kind: &'static str, context: Context },

    #[error("invalid value {value} for field `{field}`")]
    InvalidValue { field: &'static str, value: i64 },

    #[error("invalid world dimensions {width}x{height}")]
    InvalidDimensions { width: i32, height: i32 },
}

/// A typed, encodable/decodable unit of protocol exchange.
pub trait WireMessage: Sized {
    /// Type id written in front of the payload.
    fn type_id(&self) -> MessageType;

    /// Appends this message's fields. Exact inverse of [`WireMessage::decode`].
    fn encode(&self, w: &mut WireWriter, ctx: Context);

    /// Reads this message's fields from the front of `r`.
    fn decode(r: &mut WireReader<'_>, ctx: Context) -> Result<Self, DecodeError>;

    /// Encodes `[type id][payload]` into a standalone frame.
    fn to_frame(&self, ctx: Context) -> Bytes {
        let mut w = WireWriter::new();
        w.write_u16(self.type_id().to_wire());
        self.encode(&mut w, ctx);
        w.into_bytes()
    }
}

/// Bounds-checked reader over a received buffer.
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, n: usize) -> Result<(), DecodeError> {
        if self.buf.remaining() < n {
            return Err(DecodeError::Truncated {
                needed: n,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn read_bool(&mut self) -> Result<bool, DecodeError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            v => Err(DecodeError::InvalidValue {
                field: "bool",
                value: v as i64,
            }),
        }
    }

    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    pub fn read_i32(&mut self) -> Result<i32, DecodeError> {
        self.need(4)?;
        Ok(self.buf.get_i32())
    }

    pub fn read_u64(&mut self) -> Result<u64, DecodeError> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    pub fn read_i64(&mut self) -> Result<i64, DecodeError> {
        self.need(8)?;
        Ok(self.buf.get_i64())
    }

    pub fn read_f32(&mut self) -> Result<f32, DecodeError> {
        self.need(4)?;
        Ok(self.buf.get_f32())
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.read_u32()? as usize;
        self.need(len)?;
        let out = self.buf[..len].to_vec();
        self.buf.advance(len);
        Ok(out)
    }

    pub fn read_str(&mut self) -> Result<String, DecodeError> {
        let len = self.read_u16()? as usize;
        self.need(len)?;
        let s = std::str::from_utf8(&self.buf[..len]).map_err(|_| DecodeError::InvalidUtf8)?;
        let out = s.to_string();
        self.buf.advance(len);
        Ok(out)
    }

    /// Fails if any bytes are left unread.
    pub fn finish(self) -> Result<(), DecodeError> {
        match self.buf.remaining() {
            0 => Ok(()),
            n => Err(DecodeError::TrailingBytes(n)),
        }
    }
}

/// Growable writer for outgoing frames.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(cap),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.put_u8(v as u8);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.put_u16(v);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.put_i32(v);
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.put_u64(v);
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.put_i64(v);
    }

    pub fn write_f32(&mut self, v: f32) {
        self.buf.put_f32(v);
    }

    pub fn write_bytes(&mut self, v: &[u8]) {
        self.buf.put_u32(v.len() as u32);
        self.buf.extend_from_slice(v);
    }

    /// Writes a length-prefixed string, clipped to `u16::MAX` bytes on a char
    /// boundary.
    pub fn write_str(&mut self, v: &str) {
        let mut end = v.len().min(u16::MAX as usize);
        while !v.is_char_boundary(end) {
            end -= 1;
        }
        self.buf.put_u16(end as u16);
        self.buf.extend_from_slice(&v.as_bytes()[..end]);
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_roundtrip() {
        let mut w = WireWriter::new();
        w.write_u8(7);
        w.write_bool(true);
        w.write_u16(0xBEEF);
        w.write_i32(-42);
        w.write_u64(u64::MAX);
        w.write_f32(1.5);
        w.write_str("héllo");
        w.write_bytes(&[1, 2, 3]);
        let bytes = w.into_bytes();

        let mut r = WireReader::new(&bytes);
        assert_eq!(r.read_u8().unwrap(), 7);
        assert!(r.read_bool().unwrap());
        assert_eq!(r.read_u16().unwrap(), 0xBEEF);
        assert_eq!(r.read_i32().unwrap(), -42);
        assert_eq!(r.read_u64().unwrap(), u64::MAX);
        assert_eq!(r.read_f32().unwrap(), 1.5);
        assert_eq!(r.read_str().unwrap(), "héllo");
        assert_eq!(r.read_bytes().unwrap(), vec![1, 2, 3]);
        r.finish().unwrap();
    }

    #[test]
    fn reading_past_end_is_truncated() {
        let mut r = WireReader::new(&[0x00, 0x01, 0x02]);
        assert_eq!(
            r.read_u32(),
            Err(DecodeError::Truncated {
                needed: 4,
                remaining: 3
            })
        );
    }

    #[test]
    fn declared_length_is_not_trusted() {
        // String claims 200 bytes but only 2 follow.
        let mut r = WireReader::new(&[0x00, 200, b'h', b'i']);
        assert!(matches!(r.read_str(), Err(DecodeError::Truncated { .. })));

        let mut r = WireReader::new(&[0xFF, 0xFF, 0xFF, 0xFF, 0x01]);
        assert!(matches!(r.read_bytes(), Err(DecodeError::Truncated { .. })));
    }

    #[test]
    fn invalid_utf8_and_bool_are_rejected() {
        let mut r = WireReader::new(&[0x00, 0x02, 0xC3, 0x28]);
        assert_eq!(r.read_str(), Err(DecodeError::InvalidUtf8));

        let mut r = WireReader::new(&[2]);
        assert!(matches!(r.read_bool(), Err(DecodeError::InvalidValue { .. })));
    }

    #[test]
    fn finish_reports_trailing_bytes() {
        let mut r = WireReader::new(&[0, 1, 2]);
        r.read_u8().unwrap();
        assert_eq!(r.finish(), Err(DecodeError::TrailingBytes(2)));
    }

    #[test]
    fn long_strings_are_clipped_on_char_boundary() {
        let s = "é".repeat(40_000); // 80_000 bytes
        let mut w = WireWriter::new();
        w.write_str(&s);
        let bytes = w.into_bytes();
        let mut r = WireReader::new(&bytes);
        let back = r.read_str().unwrap();
        assert!(back.len() <= u16::MAX as usize);
        assert!(s.starts_with(&back));
    }
}
