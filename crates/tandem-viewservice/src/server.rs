//! Datagram server for the view service.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token, Waker};
use tandem_types::ReplicationParams;
use tandem_wire::Message;
use tracing::{debug, info, warn};

use crate::error::{ViewServiceError, ViewServiceResult};
use crate::service::ViewService;

const SOCKET_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);

/// Large enough for any datagram.
const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// Handle for stopping a running [`ViewServiceServer`] from another thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    shutdown: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    /// Signals the server to stop and wakes its poll loop.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "failed to wake view service for shutdown");
        }
    }
}

/// View service bound to a UDP socket.
///
/// Each request datagram gets exactly one View datagram back, sent to the
/// request's source address.
pub struct ViewServiceServer {
    poll: Poll,
    socket: UdpSocket,
    service: ViewService,
    shutdown: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ViewServiceServer {
    pub fn bind(addr: SocketAddr, params: ReplicationParams) -> ViewServiceResult<Self> {
        let poll = Poll::new()?;
        let mut socket = UdpSocket::bind(addr)
            .map_err(|source| ViewServiceError::BindFailed { addr, source })?;
        poll.registry()
            .register(&mut socket, SOCKET_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        info!(addr = %socket.local_addr()?, n = params.n, k = params.k, "view service bound");

        Ok(Self {
            poll,
            socket,
            service: ViewService::new(params),
            shutdown: Arc::new(AtomicBool::new(false)),
            waker,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            shutdown: Arc::clone(&self.shutdown),
            waker: Arc::clone(&self.waker),
        }
    }

    pub fn service(&self) -> &ViewService {
        &self.service
    }

    /// Serves requests until shut down.
    pub fn run(&mut self) -> ViewServiceResult<()> {
        let mut events = Events::with_capacity(64);
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];

        while !self.shutdown.load(Ordering::SeqCst) {
            match self.poll.poll(&mut events, Some(Duration::from_secs(1))) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            for event in &events {
                if event.token() == SOCKET_TOKEN {
                    self.drain(&mut buf)?;
                }
            }
        }

        info!("view service shutting down");
        Ok(())
    }

    /// Answers every datagram currently queued on the socket.
    fn drain(&mut self, buf: &mut [u8]) -> ViewServiceResult<()> {
        loop {
            let (len, peer) = match self.socket.recv_from(buf) {
                Ok(received) => received,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // ICMP unreachable from an earlier reply surfaces here on some platforms.
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => return Err(e.into()),
            };

            let request = match Message::from_datagram(&buf[..len]) {
                Ok(message) => message,
                Err(e) => {
                    warn!(%peer, error = %e, "dropping undecodable datagram");
                    continue;
                }
            };
            debug!(%peer, kind = request.name(), "view service request");

            let Some(reply) = self.service.handle(request) else {
                continue;
            };

            match reply.to_datagram() {
                Ok(datagram) => {
                    if let Err(e) = self.socket.send_to(&datagram, peer) {
                        // The client resends; a lost reply is not fatal.
                        warn!(%peer, error = %e, "failed to send view reply");
                    }
                }
                Err(e) => warn!(%peer, error = %e, "failed to encode view reply"),
            }
        }
    }
}
