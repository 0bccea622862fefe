//! Frame encoding and incremental decoding.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{WireError, WireResult};

/// Size of the frame header: 4-byte type + 4-byte payload length.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Largest payload a frame may carry (16 MiB).
///
/// Checked before any allocation so a corrupt or hostile length prefix
/// cannot make the receiver reserve gigabytes.
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// A single `[type:4][length:4][payload]` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Raw message type from the header.
    pub kind: u32,
    /// Payload bytes (exactly `length` bytes).
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// Total encoded size of this frame.
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }

    /// Appends the encoded frame to `buf`.
    ///
    /// A payload over [`MAX_PAYLOAD_SIZE`] is refused and `buf` is left
    /// untouched; no peer would accept it.
    pub fn encode(&self, buf: &mut BytesMut) -> WireResult<()> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(WireError::FrameTooLarge {
                size: self.payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        buf.reserve(self.encoded_len());
        buf.put_u32(self.kind);
        buf.put_u32(self.payload.len() as u32);
        buf.extend_from_slice(&self.payload);
        Ok(())
    }

    /// Encodes the frame into a fresh vector.
    pub fn encode_to_vec(&self) -> WireResult<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf)?;
        Ok(buf.to_vec())
    }

    /// Attempts to decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` until a complete frame is buffered; the consumed
    /// bytes are removed from `buf` only when a frame is returned.
    pub fn decode(buf: &mut BytesMut) -> WireResult<Option<Frame>> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let kind = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let length = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
        if length > MAX_PAYLOAD_SIZE {
            return Err(WireError::FrameTooLarge {
                size: length,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        if buf.len() < FRAME_HEADER_SIZE + length {
            buf.reserve(FRAME_HEADER_SIZE + length - buf.len());
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(length).freeze();
        Ok(Some(Frame { kind, payload }))
    }

    /// Decodes a datagram that must contain exactly one frame.
    pub fn from_datagram(datagram: &[u8]) -> WireResult<Frame> {
        if datagram.len() < FRAME_HEADER_SIZE {
            return Err(WireError::Truncated(datagram.len()));
        }

        let kind = u32::from_be_bytes([datagram[0], datagram[1], datagram[2], datagram[3]]);
        let declared =
            u32::from_be_bytes([datagram[4], datagram[5], datagram[6], datagram[7]]) as usize;
        if declared > MAX_PAYLOAD_SIZE {
            return Err(WireError::FrameTooLarge {
                size: declared,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let actual = datagram.len() - FRAME_HEADER_SIZE;
        if declared != actual {
            return Err(WireError::LengthMismatch { declared, actual });
        }

        Ok(Frame {
            kind,
            payload: Bytes::copy_from_slice(&datagram[FRAME_HEADER_SIZE..]),
        })
    }
}
