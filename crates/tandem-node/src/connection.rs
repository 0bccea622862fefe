//! Participant connection state on the primary.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};

use bytes::BytesMut;
use mio::net::TcpStream;
use mio::{Interest, Token};

use tandem_types::ParticipantId;
use tandem_wire::{FRAME_HEADER_SIZE, Frame, Message};

use crate::error::NodeResult;

/// Initial read/write buffer capacity.
const BUFFER_SIZE: usize = 16 * 1024;

/// State of one participant connection.
pub struct Connection {
    /// Unique token for this connection.
    pub token: Token,
    pub peer: SocketAddr,
    /// TCP stream.
    pub stream: TcpStream,
    /// Read buffer.
    pub read_buf: BytesMut,
    /// Write buffer.
    pub write_buf: BytesMut,
    /// Participant that said `Hello` on this connection.
    pub participant: Option<ParticipantId>,
    /// Interest currently registered with the poll.
    pub registered: Interest,
}

impl Connection {
    pub fn new(token: Token, stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            token,
            peer,
            stream,
            read_buf: BytesMut::with_capacity(BUFFER_SIZE),
            write_buf: BytesMut::with_capacity(BUFFER_SIZE),
            participant: None,
            registered: Interest::READABLE,
        }
    }

    /// Reads data from the socket into the read buffer.
    ///
    /// Returns `true` if the connection is still open.
    pub fn read(&mut self) -> io::Result<bool> {
        let mut temp_buf = [0u8; 4096];

        loop {
            match self.stream.read(&mut temp_buf) {
                Ok(0) => return Ok(false),
                Ok(n) => self.read_buf.extend_from_slice(&temp_buf[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(true),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Writes data from the write buffer to the socket.
    ///
    /// Returns `true` if all data was written.
    pub fn write(&mut self) -> io::Result<bool> {
        while !self.write_buf.is_empty() {
            match self.stream.write(&self.write_buf) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "failed to write to socket",
                    ));
                }
                Ok(n) => {
                    let _ = self.write_buf.split_to(n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Attempts to decode one message from the read buffer.
    pub fn try_decode_message(&mut self) -> NodeResult<Option<Message>> {
        match Frame::decode(&mut self.read_buf)? {
            Some(frame) => Ok(Some(Message::from_frame(&frame)?)),
            None => Ok(None),
        }
    }

    /// Queues a message to be sent.
    pub fn queue_message(&mut self, message: &Message) -> NodeResult<()> {
        message.encode(&mut self.write_buf)?;
        Ok(())
    }

    /// Returns the interest flags for this connection.
    pub fn interest(&self) -> Interest {
        if self.write_buf.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        }
    }

    /// Returns true if a frame header is already buffered.
    pub fn has_pending_data(&self) -> bool {
        self.read_buf.len() >= FRAME_HEADER_SIZE
    }

    /// Closes both directions so the peer sees EOF promptly.
    pub fn close(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    /// Name for logs: the participant if known, else the peer address.
    pub fn label(&self) -> String {
        match &self.participant {
            Some(participant) => participant.to_string(),
            None => self.peer.to_string(),
        }
    }
}
