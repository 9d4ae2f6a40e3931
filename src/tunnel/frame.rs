//! Frame encoding/decoding for the tunnel protocol
//!
//! Frame format:
//! ```text
//! +--------+--------+--------+--------+
//! |   Id (u16, BE)  |  Len (u16, BE)  |
//! +--------+--------+--------+--------+
//! |           Data (Len bytes)        |
//! +--------+--------+--------+--------+
//! ```
//!
//! `Len == 0` marks end-of-stream (FIN) for the tunnel `Id`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Frame header size in bytes
pub const FRAME_HEADER_LEN: usize = 4;

/// A protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Tunnel ID, chosen by the endpoint that opened the tunnel
    pub id: u16,
    /// Payload data; empty means FIN
    pub data: Bytes,
}

impl Frame {
    /// Create a data frame. The payload must fit the u16 length field;
    /// callers with larger buffers split them first.
    pub fn new(id: u16, data: Bytes) -> Self {
        debug_assert!(data.len() <= super::MAX_FRAME_PAYLOAD);
        Self { id, data }
    }

    /// Create a FIN frame for `id`.
    pub fn fin(id: u16) -> Self {
        Self {
            id,
            data: Bytes::new(),
        }
    }

    /// Whether this frame marks end-of-stream.
    pub fn is_fin(&self) -> bool {
        self.data.is_empty()
    }

    /// Total size on the wire.
    pub fn wire_len(&self) -> usize {
        FRAME_HEADER_LEN + self.data.len()
    }

    /// Encode the frame; the length field is derived from the payload.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        buf.put_u16(self.id);
        buf.put_u16(self.data.len() as u16);
        buf.extend_from_slice(&self.data);
        buf.freeze()
    }

    /// Decode one frame from the front of `buf`, consuming its bytes.
    /// Returns `None` when the buffer does not yet hold a whole frame.
    pub fn decode(buf: &mut BytesMut) -> Option<Self> {
        if buf.len() < FRAME_HEADER_LEN {
            return None;
        }

        let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if buf.len() < FRAME_HEADER_LEN + len {
            return None;
        }

        let id = buf.get_u16();
        buf.advance(2);
        let data = buf.split_to(len).freeze();

        Some(Self { id, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let frame = Frame::new(42, Bytes::from_static(b"Hello, World!"));
        let mut buf = BytesMut::from(&frame.encode()[..]);

        let decoded = Frame::decode(&mut buf).unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_fin_encodes_to_header_only() {
        let fin = Frame::fin(7);
        let encoded = fin.encode();

        assert_eq!(encoded.len(), FRAME_HEADER_LEN);
        assert_eq!(&encoded[..], &[0x00, 0x07, 0x00, 0x00]);

        let mut buf = BytesMut::from(&encoded[..]);
        let decoded = Frame::decode(&mut buf).unwrap();
        assert!(decoded.is_fin());
        assert_eq!(decoded.id, 7);
    }

    #[test]
    fn test_decode_needs_whole_frame() {
        let frame = Frame::new(1, Bytes::from_static(b"abcdef"));
        let encoded = frame.encode();

        // Header alone is not enough.
        let mut buf = BytesMut::from(&encoded[..3]);
        assert!(Frame::decode(&mut buf).is_none());
        assert_eq!(buf.len(), 3);

        // Header plus a partial payload still is not.
        let mut buf = BytesMut::from(&encoded[..7]);
        assert!(Frame::decode(&mut buf).is_none());

        // The remainder arrives; now it decodes.
        buf.extend_from_slice(&encoded[7..]);
        assert_eq!(Frame::decode(&mut buf).unwrap(), frame);
    }

    #[test]
    fn test_decode_leaves_following_bytes() {
        let first = Frame::new(1, Bytes::from_static(b"one"));
        let second = Frame::new(2, Bytes::from_static(b"two"));

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&first.encode());
        buf.extend_from_slice(&second.encode());

        assert_eq!(Frame::decode(&mut buf).unwrap(), first);
        assert_eq!(Frame::decode(&mut buf).unwrap(), second);
        assert!(Frame::decode(&mut buf).is_none());
    }
}
