//! Blocking helpers for stream sockets.

use std::io::{Read, Write};

use bytes::Bytes;

use crate::error::{WireError, WireResult};
use crate::frame::{FRAME_HEADER_SIZE, Frame, MAX_PAYLOAD_SIZE};
use crate::message::Message;

/// Reads exactly one message from a blocking stream.
///
/// An orderly close before the header yields an `UnexpectedEof` I/O error;
/// callers treat it like any other disconnect (see [`WireError::is_disconnect`]).
pub fn read_message(reader: &mut impl Read) -> WireResult<Message> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    reader.read_exact(&mut header)?;

    let kind = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let length = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if length > MAX_PAYLOAD_SIZE {
        return Err(WireError::FrameTooLarge {
            size: length,
            max: MAX_PAYLOAD_SIZE,
        });
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload)?;

    Message::from_frame(&Frame {
        kind,
        payload: Bytes::from(payload),
    })
}

/// Writes one message to a blocking stream and flushes it.
pub fn write_message(writer: &mut impl Write, message: &Message) -> WireResult<()> {
    let bytes = message.to_frame()?.encode_to_vec()?;
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}
