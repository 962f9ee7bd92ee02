//! UDP socket layer formatting DHT messages and correlating query responses.

use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tracing::{debug, info, trace};

use crate::common::{
    ErrorSpecific, Message, MessageType, RequestSpecific, ResponseSpecific, VERSION,
};
use crate::Error;

/// Default port the DHT listens on.
pub const DEFAULT_PORT: u16 = 50881;
/// Size of the receive buffer, larger datagrams are truncated.
pub const RECV_BUFFER_SIZE: usize = 4096;
/// Default receive timeout of an outbound query.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
/// Default receive timeout of an outbound ping.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(2);
/// How long the receive loop blocks before checking for shutdown.
pub const RECV_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(thiserror::Error, Debug)]
/// Why a peer failed to answer a query.
pub enum QueryError {
    /// No response within the query's timeout.
    #[error("Timed out waiting for a response")]
    Timeout,

    #[error(transparent)]
    /// Transparent [std::io::Error]
    Io(#[from] std::io::Error),

    /// The response could not be encoded or decoded.
    #[error("Malformed response: {0}")]
    Decode(#[from] Error),

    #[error("Expected transaction {expected}, got {received}")]
    TransactionMismatch { expected: u32, received: u32 },

    /// The peer answered with an error message.
    #[error("Remote error {code}: {message}")]
    Remote { code: i32, message: String },

    /// The peer's id does not match the address it was reached at.
    #[error("Responder id does not match its address")]
    IdMismatch,
}

/// A UdpSocket wrapper that formats DHT messages.
///
/// Inbound requests arrive on the listening socket. Every outbound query
/// gets its own ephemeral socket so its response can be awaited with a
/// timeout, independently of the receive loop.
#[derive(Debug)]
pub struct DhtSocket {
    socket: UdpSocket,
    local_addr: SocketAddr,
    next_tid: AtomicU32,
}

impl DhtSocket {
    /// Bind to `address:port`, trying successive ports on failure,
    /// then falling back to an ephemeral port.
    pub(crate) fn bind(address: IpAddr, port: u16) -> Result<Self, Error> {
        let socket = (port..=u16::MAX)
            .find_map(|port| match UdpSocket::bind(SocketAddr::new(address, port)) {
                Ok(socket) => Some(socket),
                Err(error) => {
                    trace!(context = "socket_bind", port, ?error, "Port unavailable");
                    None
                }
            })
            .map(Ok)
            .unwrap_or_else(|| UdpSocket::bind(SocketAddr::new(address, 0)))
            .map_err(|_| Error::NoAvailablePort(port))?;

        socket.set_read_timeout(Some(RECV_POLL_INTERVAL))?;

        let local_addr = socket.local_addr()?;

        if local_addr.port() != port {
            info!(requested = port, bound = local_addr.port(), "Requested port unavailable");
        }

        Ok(Self {
            socket,
            local_addr,
            next_tid: AtomicU32::new(rand::random()),
        })
    }

    // === Getters ===

    /// Returns the address the node is listening to.
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    // === Public Methods ===

    /// Wait up to [RECV_POLL_INTERVAL] for a datagram on the listening socket.
    pub fn recv_from(&self, buf: &mut [u8]) -> Option<(usize, SocketAddr)> {
        match self.socket.recv_from(buf) {
            Ok((amt, from)) => {
                if from.port() == 0 {
                    trace!(context = "socket_validation", message = "Datagram from port 0");
                    return None;
                }

                Some((amt, from))
            }
            Err(ref e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => None,
            Err(e) => {
                trace!(context = "socket_error", ?e, "recv_from failed unexpectedly");
                None
            }
        }
    }

    /// Send a query from a fresh socket and wait up to `timeout` for its response.
    pub fn query(
        &self,
        address: SocketAddr,
        request: RequestSpecific,
        timeout: Duration,
    ) -> Result<ResponseSpecific, QueryError> {
        let socket = UdpSocket::bind(SocketAddr::new(unspecified(&address), 0))?;
        socket.set_read_timeout(Some(timeout))?;

        let message = self.request_message(request);
        let tid = message.transaction_id;

        trace!(context = "socket_message_sending", ?address, ?message);
        socket.send_to(&message.to_bytes()?, address)?;

        let mut buf = [0u8; RECV_BUFFER_SIZE];
        let (amt, from) = socket.recv_from(&mut buf).map_err(|e| match e.kind() {
            ErrorKind::WouldBlock | ErrorKind::TimedOut => QueryError::Timeout,
            _ => QueryError::Io(e),
        })?;

        let response = Message::from_bytes(&buf[..amt])?;
        trace!(context = "socket_message_receiving", ?response, ?from);

        if response.transaction_id != tid {
            return Err(QueryError::TransactionMismatch {
                expected: tid,
                received: response.transaction_id,
            });
        }

        match response.message_type {
            MessageType::Response(response) => Ok(response),
            MessageType::Error(ErrorSpecific { code, description }) => Err(QueryError::Remote {
                code,
                message: description,
            }),
            MessageType::Request(_) => Err(QueryError::Decode(Error::InvalidMessage(
                "request in reply to a query".to_string(),
            ))),
        }
    }

    /// Send a query from the listening socket without waiting for a response.
    pub fn notify(&self, address: SocketAddr, request: RequestSpecific) {
        let message = self.request_message(request);

        let _ = self.send(address, message).map_err(|e| {
            debug!(?e, ?address, "Error sending notification message");
        });
    }

    /// Send a response to the given address.
    pub fn response(&self, address: SocketAddr, transaction_id: u32, response: ResponseSpecific) {
        let message = response_message(MessageType::Response(response), transaction_id);

        let _ = self.send(address, message).map_err(|e| {
            debug!(?e, "Error sending response message");
        });
    }

    /// Send an error to the given address.
    pub fn error(&self, address: SocketAddr, transaction_id: u32, error: ErrorSpecific) {
        let message = response_message(MessageType::Error(error), transaction_id);

        let _ = self.send(address, message).map_err(|e| {
            debug!(?e, "Error sending error message");
        });
    }

    // === Private Methods ===

    /// Increments self.next_tid and returns the previous value.
    fn tid(&self) -> u32 {
        self.next_tid.fetch_add(1, Ordering::Relaxed)
    }

    fn request_message(&self, request: RequestSpecific) -> Message {
        Message {
            transaction_id: self.tid(),
            version: Some(VERSION.to_string()),
            message_type: MessageType::Request(request),
        }
    }

    /// Send a raw dht message
    fn send(&self, address: SocketAddr, message: Message) -> Result<(), Error> {
        self.socket.send_to(&message.to_bytes()?, address)?;
        trace!(context = "socket_message_sending", ?address, ?message);
        Ok(())
    }
}

fn response_message(message: MessageType, request_tid: u32) -> Message {
    Message {
        transaction_id: request_tid,
        version: Some(VERSION.to_string()),
        message_type: message,
    }
}

/// Unspecified address of the same family as `address`.
fn unspecified(address: &SocketAddr) -> IpAddr {
    match address {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}
