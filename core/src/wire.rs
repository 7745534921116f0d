//! Typed, ordered message frames.
//!
//! A frame is a `u16` message id followed by typed fields; every number is
//! little-endian. Strings are a `u16` byte length followed by UTF-8 bytes;
//! vectors are a `u16` element count followed by the elements. On the
//! transport, each frame is prefixed with its `u16` byte length.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("message truncated: needed {needed} more bytes")]
    UnexpectedEnd { needed: usize },
    #[error("string field is not valid UTF-8")]
    BadUtf8,
    #[error("frame too short to carry a message id")]
    MissingId,
    #[error("frame of {0} bytes exceeds the transport limit")]
    FrameTooLarge(usize),
}

/// Maximum size of one frame on the wire, including the message id but not
/// the transport length prefix.
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

/// Outgoing message builder.
#[derive(Clone, Debug)]
pub struct MessageOut {
    data: Vec<u8>,
}

impl MessageOut {
    pub fn new(id: u16) -> Self {
        let mut out = MessageOut {
            data: Vec::with_capacity(16),
        };
        out.data.extend_from_slice(&id.to_le_bytes());
        out
    }

    pub fn write_u8(&mut self, value: u8) {
        self.data.push(value);
    }

    pub fn write_i8(&mut self, value: i8) {
        self.data.push(value as u8);
    }

    pub fn write_i16(&mut self, value: i16) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u16(&mut self, value: u16) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i32(&mut self, value: i32) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_f64(&mut self, value: f64) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    /// Fixed-size byte field (`bytes[N]` in the message tables).
    pub fn write_bytes(&mut self, value: &[u8]) {
        self.data.extend_from_slice(value);
    }

    pub fn write_string(&mut self, value: &str) {
        let bytes = value.as_bytes();
        debug_assert!(bytes.len() <= u16::MAX as usize);
        self.write_u16(bytes.len() as u16);
        self.data.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        // The id is always present, so a message is never truly empty.
        self.data.len() <= 2
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

/// Incoming message reader with checked accessors.
#[derive(Debug)]
pub struct MessageIn<'a> {
    id: u16,
    data: &'a [u8],
    pos: usize,
}

impl<'a> MessageIn<'a> {
    pub fn from_bytes(frame: &'a [u8]) -> Result<Self, WireError> {
        if frame.len() < 2 {
            return Err(WireError::MissingId);
        }
        let id = u16::from_le_bytes([frame[0], frame[1]]);
        Ok(MessageIn {
            id,
            data: frame,
            pos: 2,
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn unread_len(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.unread_len() < n {
            return Err(WireError::UnexpectedEnd {
                needed: n - self.unread_len(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8, WireError> {
        Ok(self.take(1)?[0] as i8)
    }

    pub fn read_u16(&mut self) -> Result<u16, WireError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_i16(&mut self) -> Result<i16, WireError> {
        let b = self.take(2)?;
        Ok(i16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i32(&mut self) -> Result<i32, WireError> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i64(&mut self) -> Result<i64, WireError> {
        let b = self.take(8)?;
        Ok(i64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn read_f64(&mut self) -> Result<f64, WireError> {
        let b = self.take(8)?;
        Ok(f64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        self.take(n)
    }

    pub fn read_string(&mut self) -> Result<String, WireError> {
        let len = self.read_u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WireError::BadUtf8)
    }
}

/// Incremental frame assembler for one connection.
///
/// Bytes read off the socket are appended with [`FrameAssembler::feed`];
/// complete frames (length prefix stripped) come back out of
/// [`FrameAssembler::next_frame`] in arrival order.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buf: Vec<u8>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        FrameAssembler::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        if self.buf.len() < 2 {
            return None;
        }
        let len = u16::from_le_bytes([self.buf[0], self.buf[1]]) as usize;
        if self.buf.len() < 2 + len {
            return None;
        }
        let frame = self.buf[2..2 + len].to_vec();
        self.buf.drain(..2 + len);
        Some(frame)
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

/// Prefix a finished message with the transport length header.
pub fn to_transport_bytes(msg: &MessageOut) -> Result<Vec<u8>, WireError> {
    let body = msg.as_bytes();
    if body.len() > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(body.len()));
    }
    let mut out = Vec::with_capacity(body.len() + 2);
    out.extend_from_slice(&(body.len() as u16).to_le_bytes());
    out.extend_from_slice(body);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_primitives() {
        let mut out = MessageOut::new(0x0123);
        out.write_i8(-5);
        out.write_u8(200);
        out.write_i16(-30_000);
        out.write_u16(60_000);
        out.write_i32(-2_000_000_000);
        out.write_i64(-9_000_000_000_000_000_000);
        out.write_f64(3.25);
        out.write_string("hëllo");
        out.write_bytes(&[1, 2, 3]);

        let bytes = out.into_bytes();
        let mut msg = MessageIn::from_bytes(&bytes).unwrap();

        assert_eq!(msg.id(), 0x0123);
        assert_eq!(msg.read_i8().unwrap(), -5);
        assert_eq!(msg.read_u8().unwrap(), 200);
        assert_eq!(msg.read_i16().unwrap(), -30_000);
        assert_eq!(msg.read_u16().unwrap(), 60_000);
        assert_eq!(msg.read_i32().unwrap(), -2_000_000_000);
        assert_eq!(msg.read_i64().unwrap(), -9_000_000_000_000_000_000);
        assert_eq!(msg.read_f64().unwrap(), 3.25);
        assert_eq!(msg.read_string().unwrap(), "hëllo");
        assert_eq!(msg.read_bytes(3).unwrap(), &[1, 2, 3]);
        assert_eq!(msg.unread_len(), 0);
    }

    #[test]
    fn numbers_are_little_endian() {
        let mut out = MessageOut::new(1);
        out.write_u16(0x0201);
        out.write_i32(0x04030201);
        let bytes = out.into_bytes();
        assert_eq!(&bytes[..2], &[0x01, 0x00]); // id
        assert_eq!(&bytes[2..4], &[0x01, 0x02]);
        assert_eq!(&bytes[4..8], &[0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn reading_past_the_end_fails() {
        let mut out = MessageOut::new(7);
        out.write_u8(1);
        let bytes = out.into_bytes();

        let mut msg = MessageIn::from_bytes(&bytes).unwrap();
        assert_eq!(msg.read_u8().unwrap(), 1);
        assert_eq!(
            msg.read_u16(),
            Err(WireError::UnexpectedEnd { needed: 2 })
        );
    }

    #[test]
    fn empty_frame_is_rejected() {
        assert_eq!(MessageIn::from_bytes(&[1]).unwrap_err(), WireError::MissingId);
    }

    #[test]
    fn bad_utf8_is_rejected() {
        let mut out = MessageOut::new(7);
        out.write_u16(2);
        out.write_bytes(&[0xff, 0xfe]);
        let bytes = out.into_bytes();

        let mut msg = MessageIn::from_bytes(&bytes).unwrap();
        assert_eq!(msg.read_string(), Err(WireError::BadUtf8));
    }

    #[test]
    fn frame_assembler_handles_partial_and_coalesced_frames() {
        let mut out1 = MessageOut::new(0x0010);
        out1.write_u8(1);
        let mut out2 = MessageOut::new(0x0011);
        out2.write_u16(0xbeef);

        let t1 = to_transport_bytes(&out1).unwrap();
        let t2 = to_transport_bytes(&out2).unwrap();

        let mut stream = Vec::new();
        stream.extend_from_slice(&t1);
        stream.extend_from_slice(&t2);

        let mut asm = FrameAssembler::new();

        // Feed one byte at a time; frames must come out whole and in order.
        let mut frames = Vec::new();
        for b in stream {
            asm.feed(&[b]);
            while let Some(f) = asm.next_frame() {
                frames.push(f);
            }
        }

        assert_eq!(frames.len(), 2);
        assert_eq!(MessageIn::from_bytes(&frames[0]).unwrap().id(), 0x0010);
        let mut second = MessageIn::from_bytes(&frames[1]).unwrap();
        assert_eq!(second.id(), 0x0011);
        assert_eq!(second.read_u16().unwrap(), 0xbeef);
    }
}
