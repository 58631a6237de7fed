//! lib0-compatible binary primitives.
//!
//! Unsigned integers are little-endian base-128 varints (continuation bit `0x80`).
//! Strings and byte arrays are prefixed with their varint length.

use bytes::Bytes;

/// Largest integer a lib0 peer can represent (`Number.MAX_SAFE_INTEGER`).
pub const MAX_VAR_UINT: u64 = (1 << 53) - 1;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("unexpected end of message at byte {0}")]
    UnexpectedEnd(usize),
    #[error("varint exceeds 53 bits at byte {0}")]
    VarUintOverflow(usize),
    #[error("string is not valid utf-8")]
    InvalidUtf8,
    #[error("unknown message type {0}")]
    UnknownMessageType(u64),
    #[error("unknown sync message type {0}")]
    UnknownSyncType(u64),
    #[error("unknown auth message type {0}")]
    UnknownAuthType(u64),
    #[error("no handler for message type {0}")]
    Unhandled(u64),
    #[error("invalid awareness state: {0}")]
    InvalidAwarenessState(String),
}

/// Growable write buffer.
#[derive(Debug, Default, Clone)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u8(&mut self, byte: u8) {
        self.buf.push(byte);
    }

    pub fn write_var_uint(&mut self, mut value: u64) {
        while value > 0x7F {
            self.buf.push(0x80 | (value & 0x7F) as u8);
            value >>= 7;
        }
        self.buf.push(value as u8);
    }

    pub fn write_var_string(&mut self, value: &str) {
        self.write_var_bytes(value.as_bytes());
    }

    pub fn write_var_bytes(&mut self, value: &[u8]) {
        self.write_var_uint(value.len() as u64);
        self.buf.extend_from_slice(value);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    pub fn into_bytes(self) -> Bytes {
        Bytes::from(self.buf)
    }
}

/// Cursor over a borrowed message. Reads hand out slices of the original buffer.
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn has_content(&self) -> bool {
        self.pos < self.buf.len()
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        let byte = *self.buf.get(self.pos).ok_or(ProtocolError::UnexpectedEnd(self.pos))?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_var_uint(&mut self) -> Result<u64, ProtocolError> {
        let start = self.pos;
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            value |= u64::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
            if shift > 49 {
                return Err(ProtocolError::VarUintOverflow(start));
            }
        }
        if value > MAX_VAR_UINT {
            return Err(ProtocolError::VarUintOverflow(start));
        }
        Ok(value)
    }

    pub fn read_var_bytes(&mut self) -> Result<&'a [u8], ProtocolError> {
        let len = self.read_var_uint()?;
        let len = usize::try_from(len).map_err(|_| ProtocolError::UnexpectedEnd(self.pos))?;
        let end = self.pos.checked_add(len).filter(|end| *end <= self.buf.len()).ok_or(ProtocolError::UnexpectedEnd(self.buf.len()))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn read_var_string(&mut self) -> Result<&'a str, ProtocolError> {
        let raw = self.read_var_bytes()?;
        std::str::from_utf8(raw).map_err(|_| ProtocolError::InvalidUtf8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_var_uint_single_byte_boundary() {
        let mut e = Encoder::new();
        e.write_var_uint(127);
        e.write_var_uint(128);
        assert_eq!(e.as_slice(), &[0x7F, 0x80, 0x01]);
    }

    #[test]
    fn test_var_uint_matches_lib0_layout() {
        let mut e = Encoder::new();
        e.write_var_uint(300);
        assert_eq!(e.as_slice(), &[0xAC, 0x02]);

        let mut d = Decoder::new(&[0xAC, 0x02]);
        assert_eq!(d.read_var_uint().unwrap(), 300);
        assert!(!d.has_content());
    }

    #[test]
    fn test_var_uint_max_safe_integer() {
        let mut e = Encoder::new();
        e.write_var_uint(MAX_VAR_UINT);
        let bytes = e.into_vec();
        assert_eq!(bytes.len(), 8);
        assert_eq!(Decoder::new(&bytes).read_var_uint().unwrap(), MAX_VAR_UINT);
    }

    #[test]
    fn test_var_uint_overflow_rejected() {
        let mut e = Encoder::new();
        e.write_var_uint(MAX_VAR_UINT + 1);
        let bytes = e.into_vec();
        assert_eq!(Decoder::new(&bytes).read_var_uint(), Err(ProtocolError::VarUintOverflow(0)));

        let endless = [0xFF; 12];
        assert!(matches!(Decoder::new(&endless).read_var_uint(), Err(ProtocolError::VarUintOverflow(0))));
    }

    #[test]
    fn test_truncated_input() {
        assert_eq!(Decoder::new(&[0x80]).read_var_uint(), Err(ProtocolError::UnexpectedEnd(1)));
        // length prefix promises 5 bytes, only 2 present
        assert!(matches!(Decoder::new(&[5, b'a', b'b']).read_var_bytes(), Err(ProtocolError::UnexpectedEnd(_))));
    }

    #[test]
    fn test_string_and_bytes() {
        let mut e = Encoder::new();
        e.write_var_string("doc-1");
        e.write_var_bytes(&[1, 2, 3]);
        let bytes = e.into_vec();
        assert_eq!(bytes[0], 5);

        let mut d = Decoder::new(&bytes);
        assert_eq!(d.read_var_string().unwrap(), "doc-1");
        assert_eq!(d.read_var_bytes().unwrap(), &[1, 2, 3]);
        assert!(!d.has_content());
    }

    #[test]
    fn test_invalid_utf8() {
        assert_eq!(Decoder::new(&[2, 0xC3, 0x28]).read_var_string(), Err(ProtocolError::InvalidUtf8));
    }
}
