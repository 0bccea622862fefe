//! Blocking view-service client.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use tandem_types::{Generation, ParticipantId};
use tandem_wire::{Message, Query, ReportFailure, ViewReply};
use tracing::{debug, warn};

use crate::error::{ViewServiceError, ViewServiceResult};

/// Resend policy for view-service requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientOptions {
    /// How long to wait for a View reply before resending.
    pub request_timeout: Duration,
    /// Total number of sends before giving up.
    pub request_attempts: u32,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(500),
            request_attempts: 6,
        }
    }
}

/// Client side of the view-service protocol for one participant.
///
/// Requests are idempotent on generation numbers, so a request whose reply
/// was lost is simply sent again.
#[derive(Debug)]
pub struct ViewServiceClient {
    socket: UdpSocket,
    service_addr: SocketAddr,
    name: ParticipantId,
    /// Address this participant listens on if it becomes primary.
    advertised: SocketAddr,
    options: ClientOptions,
}

impl ViewServiceClient {
    pub fn connect(
        service_addr: SocketAddr,
        name: ParticipantId,
        advertised: SocketAddr,
        options: ClientOptions,
    ) -> ViewServiceResult<Self> {
        let bind: SocketAddr = if service_addr.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket =
            UdpSocket::bind(bind).map_err(|source| ViewServiceError::BindFailed { addr: bind, source })?;
        socket.connect(service_addr)?;

        Ok(Self {
            socket,
            service_addr,
            name,
            advertised,
            options,
        })
    }

    pub fn name(&self) -> &ParticipantId {
        &self.name
    }

    pub fn advertised_address(&self) -> SocketAddr {
        self.advertised
    }

    pub fn service_address(&self) -> SocketAddr {
        self.service_addr
    }

    /// Registers this participant and returns the current view.
    pub fn join(&self) -> ViewServiceResult<ViewReply> {
        self.query()
    }

    /// Polls the current view. Same wire request as [`join`](Self::join).
    pub fn query(&self) -> ViewServiceResult<ViewReply> {
        self.request(
            &Message::Query(Query {
                name: self.name.clone(),
                address: self.advertised,
            }),
            Generation::ZERO,
        )
    }

    /// Reports `failed` as dead under `generation`, proposing `replacement`.
    pub fn report_failure(
        &self,
        generation: Generation,
        failed: ParticipantId,
        replacement: ParticipantId,
    ) -> ViewServiceResult<ViewReply> {
        // The service never answers a report with a view older than the
        // one reported, so anything older is a late reply to an earlier request.
        self.request(
            &Message::ReportFailure(ReportFailure {
                generation,
                failed,
                replacement,
            }),
            generation,
        )
    }

    /// Sends `message` until a View reply at or after `floor` arrives.
    fn request(&self, message: &Message, floor: Generation) -> ViewServiceResult<ViewReply> {
        let datagram = message.to_datagram()?;
        let mut buf = vec![0u8; 64 * 1024];
        self.discard_late_replies(&mut buf)?;

        for attempt in 1..=self.options.request_attempts {
            if let Err(e) = self.socket.send(&datagram) {
                debug!(attempt, error = %e, "view service send failed");
            } else if let Some(reply) = self.await_reply(&mut buf, floor)? {
                return Ok(reply);
            }
            debug!(attempt, kind = message.name(), "view service request timed out");
        }

        Err(ViewServiceError::Unavailable {
            addr: self.service_addr,
            attempts: self.options.request_attempts,
        })
    }

    /// Drops datagrams still queued from earlier resends.
    fn discard_late_replies(&self, buf: &mut [u8]) -> ViewServiceResult<()> {
        self.socket.set_nonblocking(true)?;
        let mut discarded = 0usize;
        let drained = loop {
            match self.socket.recv(buf) {
                Ok(_) => discarded += 1,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(()),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionRefused
                    ) => {}
                Err(e) => break Err(e),
            }
        };
        self.socket.set_nonblocking(false)?;
        drained?;

        if discarded > 0 {
            debug!(discarded, "dropped late view-service replies");
        }
        Ok(())
    }

    /// Waits up to `request_timeout` for a View reply at or after `floor`,
    /// skipping anything else.
    fn await_reply(&self, buf: &mut [u8], floor: Generation) -> ViewServiceResult<Option<ViewReply>> {
        let deadline = Instant::now() + self.options.request_timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            self.socket.set_read_timeout(Some(remaining))?;

            let len = match self.socket.recv(buf) {
                Ok(len) => len,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    return Ok(None);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // Nothing listening yet; treat like a lost datagram.
                Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => return Ok(None),
                Err(e) => return Err(e.into()),
            };

            match Message::from_datagram(&buf[..len]) {
                Ok(Message::ViewReply(reply)) if reply.view.generation >= floor => {
                    return Ok(Some(reply));
                }
                Ok(Message::ViewReply(reply)) => debug!(
                    generation = %reply.view.generation,
                    %floor,
                    "ignoring late view reply"
                ),
                Ok(other) => warn!(kind = other.name(), "ignoring non-view reply"),
                Err(e) => warn!(error = %e, "ignoring undecodable reply"),
            }
        }
    }
}
