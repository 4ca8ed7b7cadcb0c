use std::{
    io::{self, ErrorKind},
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs as _, UdpSocket},
    time::Duration,
};

#[cfg(unix)]
use std::os::unix::net::UnixDatagram;

use tracing::{debug, error, trace};

use crate::config::TransportConfig;

/// Default write timeout for UDP sockets.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Outcome of writing a payload to a transport.
///
/// Writing never fails in the `Result` sense: transport errors are absorbed, and simply reported back so that they can
/// be accounted for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteResult {
    /// The payload was handed off to the operating system.
    Sent,

    /// The payload was dropped after a recoverable error persisted through a reconnect-and-retry.
    RecoverableError,

    /// The payload was dropped after a non-recoverable error.
    FatalError,
}

impl WriteResult {
    /// Returns `true` if the payload was sent.
    pub const fn is_sent(self) -> bool {
        matches!(self, WriteResult::Sent)
    }
}

/// A datagram transport.
///
/// Transports are driven by exactly one owner at a time, which is why all operations take `&mut self`.
pub trait Transport: Send {
    /// Writes a single payload as a single datagram.
    fn write(&mut self, payload: &[u8]) -> WriteResult;

    /// Closes the underlying socket, if open.
    ///
    /// Closing an already-closed transport does nothing. A later write will reopen it.
    fn close(&mut self);
}

enum Socket {
    Udp(UdpSocket),

    #[cfg(unix)]
    Unixgram(UnixDatagram),
}

impl Socket {
    fn connect(config: &TransportConfig, write_timeout: Duration) -> io::Result<Self> {
        match config {
            TransportConfig::Udp { host, port } => {
                let addrs = (host.as_str(), *port).to_socket_addrs()?.collect::<Vec<_>>();
                let local_addr = match addrs.first() {
                    Some(SocketAddr::V6(_)) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
                    Some(SocketAddr::V4(_)) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
                    None => {
                        return Err(io::Error::new(
                            ErrorKind::NotFound,
                            format!("no addresses found for '{host}:{port}'"),
                        ))
                    }
                };

                let socket = UdpSocket::bind(local_addr)?;
                socket.connect(&addrs[..])?;
                socket.set_write_timeout(Some(write_timeout))?;
                Ok(Socket::Udp(socket))
            }

            #[cfg(unix)]
            TransportConfig::Uds { socket_path } => {
                let socket = UnixDatagram::unbound()?;
                socket.connect(socket_path)?;
                socket.set_nonblocking(true)?;
                Ok(Socket::Unixgram(socket))
            }

            #[cfg(not(unix))]
            TransportConfig::Uds { .. } => Err(io::Error::new(
                ErrorKind::Unsupported,
                "Unix domain sockets are not supported on this platform",
            )),
        }
    }

    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Socket::Udp(socket) => socket.send(buf),

            #[cfg(unix)]
            Socket::Unixgram(socket) => socket.send(buf),
        }
    }
}

enum ClientState {
    // Intermediate state during send attempts.
    Inconsistent,

    // Not connected: the next send will connect first.
    Disconnected,

    // Connected and ready to send payloads.
    Ready(Socket),
}

impl ClientState {
    fn try_send(
        &mut self,
        config: &TransportConfig,
        write_timeout: Duration,
        payload: &[u8],
    ) -> io::Result<usize> {
        loop {
            let old_state = std::mem::replace(self, ClientState::Inconsistent);
            match old_state {
                ClientState::Inconsistent => unreachable!("transitioned _from_ inconsistent state"),
                ClientState::Disconnected => {
                    // Stay disconnected if connecting fails, so that the next attempt tries again.
                    *self = ClientState::Disconnected;
                    let socket = Socket::connect(config, write_timeout)?;
                    *self = ClientState::Ready(socket);
                }
                ClientState::Ready(socket) => {
                    let result = socket.send(payload);
                    *self = ClientState::Ready(socket);
                    return result;
                }
            }
        }
    }
}

/// A socket-backed [`Transport`], for either UDP or Unix domain datagram sockets.
///
/// The socket is opened lazily, on the first write. When a write fails with an error that a fresh socket might not hit,
/// such as after the server restarted, the socket is closed and reopened, and the write is retried exactly once.
pub struct Connection {
    config: TransportConfig,
    write_timeout: Duration,
    state: ClientState,
}

impl Connection {
    /// Creates a new `Connection` for the given transport.
    ///
    /// No socket is opened until the first write.
    pub fn new(config: TransportConfig, write_timeout: Duration) -> Self {
        Self { config, write_timeout, state: ClientState::Disconnected }
    }

    /// Returns `true` if a socket is currently open.
    pub fn is_connected(&self) -> bool {
        matches!(self.state, ClientState::Ready(_))
    }

    fn is_recoverable(&self, error: &io::Error) -> bool {
        match self.config {
            TransportConfig::Udp { .. } => matches!(
                error.kind(),
                ErrorKind::NotConnected | ErrorKind::ConnectionRefused | ErrorKind::BrokenPipe
            ),
            TransportConfig::Uds { .. } => matches!(
                error.kind(),
                ErrorKind::ConnectionRefused
                    | ErrorKind::ConnectionReset
                    | ErrorKind::NotFound
                    | ErrorKind::NotConnected
                    | ErrorKind::BrokenPipe
            ),
        }
    }

    fn send(&mut self, payload: &[u8]) -> io::Result<usize> {
        self.state.try_send(&self.config, self.write_timeout, payload)
    }
}

impl Transport for Connection {
    fn write(&mut self, payload: &[u8]) -> WriteResult {
        trace!(payload_len = payload.len(), transport = self.config.transport_id(), "Writing payload.");

        let error = match self.send(payload) {
            Ok(_) => return WriteResult::Sent,
            Err(e) => e,
        };

        if !self.is_recoverable(&error) {
            error!(error = %error, payload_len = payload.len(), "Failed to send payload.");
            return WriteResult::FatalError;
        }

        debug!(error = %error, "Recoverable error while sending payload. Reconnecting and retrying once.");
        self.close();
        match self.send(payload) {
            Ok(_) => WriteResult::Sent,
            Err(e) => {
                error!(error = %e, payload_len = payload.len(), "Failed to send payload after reconnecting.");
                self.close();
                WriteResult::RecoverableError
            }
        }
    }

    fn close(&mut self) {
        self.state = ClientState::Disconnected;
    }
}
