//! Cursor-addressed byte buffer.
//!
//! A [`MessageStream`] is the unit of both socket receive buffers and outgoing
//! send queues. Writes always append at the end of the buffer, reads advance a
//! cursor. Bytes in front of the cursor are considered consumed and can be
//! reclaimed with [`MessageStream::skip`] + [`MessageStream::trim`].
//!
//! The storage is a [`BytesMut`]; typed access goes through [`Buf`] and
//! [`BufMut`]. All integers are little-endian.
//!
//! A failed read never moves the cursor. Callers decoding from a socket buffer
//! must treat [`StreamError::Insufficient`] as "message not yet complete" rather
//! than as a broken connection.
use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("insufficient bytes: requested {requested}, available {available}")]
    Insufficient { requested: usize, available: usize },

    #[error("{len} bytes do not fit a {field_bits}-bit length field")]
    TooLong { len: usize, field_bits: u8 },

    #[error("string is not valid utf-8")]
    InvalidUtf8,

    #[error("seek to {pos} is past the end of the buffer ({size} bytes)")]
    OutOfBounds { pos: usize, size: usize },

    #[error("frame payload of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: u32 },
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MessageStream {
    buf: BytesMut,
    pos: usize,
}

impl MessageStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            pos: 0,
        }
    }

    /// Number of unread bytes.
    pub fn len(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total buffered bytes, consumed prefix included.
    pub fn size(&self) -> usize {
        self.buf.len()
    }

    /// Current read offset from the start of the buffer.
    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn seek(&mut self, pos: usize) -> Result<(), StreamError> {
        if pos > self.buf.len() {
            return Err(StreamError::OutOfBounds {
                pos,
                size: self.buf.len(),
            });
        }
        self.pos = pos;
        Ok(())
    }

    /// The unread bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    /// Marks up to `n` unread bytes as consumed. Returns how many were skipped.
    pub fn skip(&mut self, n: usize) -> usize {
        let n = n.min(self.len());
        self.pos += n;
        n
    }

    /// Drops the consumed prefix and resets the cursor to zero.
    pub fn trim(&mut self) {
        if self.pos == 0 {
            return;
        }
        self.buf.advance(self.pos);
        self.pos = 0;
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.pos = 0;
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    /// Appends the unread bytes of an already serialized stream.
    pub fn write_stream(&mut self, other: &MessageStream) {
        self.write_bytes(other.as_slice());
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buf.put_u16_le(value);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.put_u32_le(value);
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.put_u64_le(value);
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.put_i32_le(value);
    }

    pub fn write_f32(&mut self, value: f32) {
        self.buf.put_f32_le(value);
    }

    pub fn write_f64(&mut self, value: f64) {
        self.buf.put_f64_le(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.write_u8(u8::from(value));
    }

    /// Writes a string prefixed with a 16-bit length.
    pub fn write_pascal_string_u16(&mut self, value: &str) -> Result<(), StreamError> {
        let len = u16::try_from(value.len()).map_err(|_| StreamError::TooLong {
            len: value.len(),
            field_bits: 16,
        })?;
        self.write_u16(len);
        self.write_bytes(value.as_bytes());
        Ok(())
    }

    /// Writes a string prefixed with a 32-bit length.
    pub fn write_pascal_string_u32(&mut self, value: &str) -> Result<(), StreamError> {
        self.write_blob(value.as_bytes())
    }

    /// Writes a byte span prefixed with a 32-bit length.
    pub fn write_blob(&mut self, value: &[u8]) -> Result<(), StreamError> {
        self.write_u32(to_u32(value.len())?);
        self.write_bytes(value);
        Ok(())
    }

    /// Overwrites four bytes at an absolute buffer offset.
    ///
    /// # Panics
    /// If `offset + 4` is past the end of the buffer.
    pub(crate) fn patch_u32(&mut self, offset: usize, value: u32) {
        (&mut self.buf[offset..offset + 4]).put_u32_le(value);
    }

    /// Reads a byte `offset` bytes past the cursor without consuming anything.
    pub fn peek_u8(&self, offset: usize) -> Option<u8> {
        self.as_slice().get(offset).copied()
    }

    /// Reads a `u32` `offset` bytes past the cursor without consuming anything.
    pub fn peek_u32(&self, offset: usize) -> Option<u32> {
        let mut bytes = self.as_slice().get(offset..offset + 4)?;
        Some(bytes.get_u32_le())
    }

    // Checks the length first so that `get` never panics and a short read
    // leaves the cursor where it was.
    fn read_with<T>(
        &mut self,
        n: usize,
        get: impl FnOnce(&mut &[u8]) -> T,
    ) -> Result<T, StreamError> {
        self.ensure(n)?;
        let mut unread = self.as_slice();
        let value = get(&mut unread);
        self.pos += n;
        Ok(value)
    }

    pub fn read_u8(&mut self) -> Result<u8, StreamError> {
        self.read_with(1, |b| b.get_u8())
    }

    pub fn read_u16(&mut self) -> Result<u16, StreamError> {
        self.read_with(2, |b| b.get_u16_le())
    }

    pub fn read_u32(&mut self) -> Result<u32, StreamError> {
        self.read_with(4, |b| b.get_u32_le())
    }

    pub fn read_u64(&mut self) -> Result<u64, StreamError> {
        self.read_with(8, |b| b.get_u64_le())
    }

    pub fn read_i32(&mut self) -> Result<i32, StreamError> {
        self.read_with(4, |b| b.get_i32_le())
    }

    pub fn read_f32(&mut self) -> Result<f32, StreamError> {
        self.read_with(4, |b| b.get_f32_le())
    }

    pub fn read_f64(&mut self) -> Result<f64, StreamError> {
        self.read_with(8, |b| b.get_f64_le())
    }

    pub fn read_bool(&mut self) -> Result<bool, StreamError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>, StreamError> {
        self.read_with(n, |b| b[..n].to_vec())
    }

    pub fn read_pascal_string_u16(&mut self) -> Result<String, StreamError> {
        let len = self.peek_prefix(2)?;
        self.read_string(2, len)
    }

    pub fn read_pascal_string_u32(&mut self) -> Result<String, StreamError> {
        let len = self.peek_prefix(4)?;
        self.read_string(4, len)
    }

    /// Reads a byte span prefixed with a 32-bit length.
    pub fn read_blob(&mut self) -> Result<Vec<u8>, StreamError> {
        let len = self.peek_prefix(4)?;
        self.read_with(4 + len, |b| b[4..4 + len].to_vec())
    }

    // Length prefixes are peeked so a short string leaves the cursor in place.
    fn peek_prefix(&self, width: usize) -> Result<usize, StreamError> {
        self.ensure(width)?;
        let mut prefix = self.as_slice();
        Ok(prefix.get_uint_le(width) as usize)
    }

    fn ensure(&self, n: usize) -> Result<(), StreamError> {
        if self.len() < n {
            return Err(StreamError::Insufficient {
                requested: n,
                available: self.len(),
            });
        }
        Ok(())
    }

    fn read_string(&mut self, prefix: usize, len: usize) -> Result<String, StreamError> {
        self.ensure(prefix + len)?;
        let bytes = &self.as_slice()[prefix..prefix + len];
        let value = std::str::from_utf8(bytes)
            .map_err(|_| StreamError::InvalidUtf8)?
            .to_owned();
        self.skip(prefix + len);
        Ok(value)
    }
}

/// Converts a byte count to a 32-bit length field.
pub(crate) fn to_u32(len: usize) -> Result<u32, StreamError> {
    u32::try_from(len).map_err(|_| StreamError::TooLong {
        len,
        field_bits: 32,
    })
}

impl From<Vec<u8>> for MessageStream {
    fn from(buf: Vec<u8>) -> Self {
        Self::from(buf.as_slice())
    }
}

impl From<&[u8]> for MessageStream {
    fn from(bytes: &[u8]) -> Self {
        Self {
            buf: BytesMut::from(bytes),
            pos: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_primitives() {
        let mut stream = MessageStream::new();
        stream.write_u8(7);
        stream.write_u16(0xBEEF);
        stream.write_u32(0xDEAD_BEEF);
        stream.write_u64(u64::MAX - 1);
        stream.write_i32(-42);
        stream.write_f64(1.5);
        stream.write_bool(true);

        assert_eq!(stream.read_u8().unwrap(), 7);
        assert_eq!(stream.read_u16().unwrap(), 0xBEEF);
        assert_eq!(stream.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(stream.read_u64().unwrap(), u64::MAX - 1);
        assert_eq!(stream.read_i32().unwrap(), -42);
        assert_eq!(stream.read_f64().unwrap(), 1.5);
        assert!(stream.read_bool().unwrap());
        assert!(stream.is_empty());
    }

    #[test]
    fn little_endian_layout() {
        let mut stream = MessageStream::new();
        stream.write_u32(0x0403_0201);

        assert_eq!(stream.as_slice(), &[1, 2, 3, 4]);
    }

    #[test]
    fn short_read_leaves_cursor() {
        let mut stream = MessageStream::from(vec![1, 2, 3]);

        let err = stream.read_u32().unwrap_err();
        assert_eq!(
            err,
            StreamError::Insufficient {
                requested: 4,
                available: 3
            }
        );
        assert_eq!(stream.pos(), 0);
        assert_eq!(stream.read_u8().unwrap(), 1);
    }

    #[test]
    fn pascal_strings() {
        let mut stream = MessageStream::new();
        stream.write_pascal_string_u16("voxel").unwrap();
        stream.write_pascal_string_u32("").unwrap();

        assert_eq!(&stream.as_slice()[..2], &[5, 0]);
        assert_eq!(stream.read_pascal_string_u16().unwrap(), "voxel");
        assert_eq!(stream.read_pascal_string_u32().unwrap(), "");
    }

    #[test]
    fn truncated_pascal_string_is_incomplete() {
        let mut stream = MessageStream::new();
        stream.write_u16(10);
        stream.write_bytes(b"abc");

        assert!(matches!(
            stream.read_pascal_string_u16(),
            Err(StreamError::Insufficient { .. })
        ));
        assert_eq!(stream.pos(), 0);
    }

    #[test]
    fn oversized_string_rejected() {
        let mut stream = MessageStream::new();
        let long = "x".repeat(u16::MAX as usize + 1);

        assert!(matches!(
            stream.write_pascal_string_u16(&long),
            Err(StreamError::TooLong { field_bits: 16, .. })
        ));
        assert!(stream.is_empty());
    }

    #[test]
    fn invalid_utf8_rejected() {
        let mut stream = MessageStream::new();
        stream.write_u16(2);
        stream.write_bytes(&[0xC3, 0x28]);

        assert_eq!(
            stream.read_pascal_string_u16(),
            Err(StreamError::InvalidUtf8)
        );
    }

    #[test]
    fn skip_and_trim_preserve_following_bytes() {
        let bytes: Vec<u8> = (0..32).collect();
        let mut trimmed = MessageStream::from(bytes.clone());
        let mut untrimmed = MessageStream::from(bytes);

        trimmed.skip(10);
        trimmed.trim();
        trimmed.trim();
        untrimmed.skip(10);

        assert_eq!(trimmed.pos(), 0);
        assert_eq!(trimmed.size(), 22);
        assert_eq!(trimmed.read_u32().unwrap(), untrimmed.read_u32().unwrap());
        assert_eq!(trimmed.as_slice(), untrimmed.as_slice());
    }

    #[test]
    fn skip_is_bounded() {
        let mut stream = MessageStream::from(vec![1, 2]);

        assert_eq!(stream.skip(10), 2);
        assert!(stream.is_empty());
    }

    #[test]
    fn peek_does_not_consume() {
        let mut stream = MessageStream::new();
        stream.write_u32(9);
        stream.write_u8(3);

        assert_eq!(stream.peek_u32(0), Some(9));
        assert_eq!(stream.peek_u8(4), Some(3));
        assert_eq!(stream.peek_u8(5), None);
        assert_eq!(stream.len(), 5);
    }

    #[test]
    fn write_stream_appends_unread_part() {
        let mut source = MessageStream::from(vec![1, 2, 3, 4]);
        source.skip(1);
        let mut target = MessageStream::from(vec![9]);

        target.write_stream(&source);

        assert_eq!(target.as_slice(), &[9, 2, 3, 4]);
    }

    #[test]
    fn blob_round_trip() {
        let mut stream = MessageStream::new();
        stream.write_blob(&[5, 6, 7]).unwrap();

        assert_eq!(stream.read_blob().unwrap(), vec![5, 6, 7]);
    }

    #[test]
    fn truncated_blob_leaves_cursor() {
        let mut stream = MessageStream::new();
        stream.write_u32(8);
        stream.write_bytes(&[1, 2, 3]);

        assert!(matches!(
            stream.read_blob(),
            Err(StreamError::Insufficient { requested: 12, .. })
        ));
        assert_eq!(stream.pos(), 0);
    }

    #[test]
    fn patch_overwrites_in_place() {
        let mut stream = MessageStream::new();
        stream.write_u32(0);
        stream.write_u8(7);
        stream.patch_u32(0, 0x0A0B_0C0D);

        assert_eq!(stream.as_slice(), &[0x0D, 0x0C, 0x0B, 0x0A, 7]);
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn length_fields_are_checked() {
        assert_eq!(to_u32(16), Ok(16));
        assert_eq!(
            to_u32(u32::MAX as usize + 1),
            Err(StreamError::TooLong {
                len: u32::MAX as usize + 1,
                field_bits: 32
            })
        );
    }
}
