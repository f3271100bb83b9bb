//! Transport provider contract: listeners, accepted/connected stream sockets, and a TCP implementation.
//!
//! The swap protocol runs over any connection-oriented byte stream. The radio transport of a
//! device (RFCOMM-style sockets) plugs in here; `TcpTransport` is the stream-socket
//! implementation used on hosts without a radio socket and in tests.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use uuid::Uuid;

use crate::connection::Connection;

/// Human-readable service name every swap listener is registered under.
pub const SERVICE_NAME: &str = "App Swap";

/// Protocol-wide service identifier. Both sides of a radio swap must agree on it.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0xcd59_ba31_9d5e_4d8b_9e2b_3f5a_1c6e_7d42);

/// Identifier a listener is bound under (service record on radio transports).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceRecord {
    pub name: &'static str,
    pub uuid: Uuid,
}

/// The fixed record used by the swap server.
pub const SWAP_SERVICE: ServiceRecord = ServiceRecord {
    name: SERVICE_NAME,
    uuid: SERVICE_UUID,
};

/// A connected stream socket as handed out by a transport.
///
/// `try_clone_socket` must return another handle to the same underlying socket so that the
/// read half, the write half and a shutdown handle can live on different owners.
pub trait StreamSocket: Read + Write + Send + Sync {
    fn try_clone_socket(&self) -> io::Result<Box<dyn StreamSocket>>;
    /// Stop receiving: a read blocked on this socket returns end-of-stream.
    fn shutdown_read(&self) -> io::Result<()>;
    /// Shut down both directions.
    fn shutdown(&self) -> io::Result<()>;
    /// Printable remote address, for logs.
    fn peer_label(&self) -> String;
}

/// Server side of a transport. `close` unblocks a pending `accept`.
pub trait Listener: Send + Sync {
    fn accept(&self) -> io::Result<Connection>;
    fn close(&self) -> io::Result<()>;
    /// Locator a client can pass to `Transport::connect` to reach this listener.
    fn local_locator(&self) -> String;
}

/// Transport provider: bind listeners, open outbound connections.
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;
    fn listen(&self, service: &ServiceRecord) -> io::Result<Box<dyn Listener>>;
    fn connect(&self, locator: &str) -> io::Result<Connection>;
    /// False once the underlying medium was switched off from outside (e.g. radio disabled).
    fn is_enabled(&self) -> bool {
        true
    }
}

impl StreamSocket for TcpStream {
    fn try_clone_socket(&self) -> io::Result<Box<dyn StreamSocket>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn shutdown_read(&self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Read)
    }

    fn shutdown(&self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }

    fn peer_label(&self) -> String {
        self.peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    }
}

type EnabledProbe = Arc<dyn Fn() -> bool + Send + Sync>;

/// Stream-socket transport over TCP.
pub struct TcpTransport {
    bind_addr: SocketAddr,
    enabled: Option<EnabledProbe>,
}

impl TcpTransport {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            enabled: None,
        }
    }

    /// Tie `is_enabled` to an outside switch, the way a radio socket depends on its adapter.
    pub fn gated_by(mut self, probe: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.enabled = Some(Arc::new(probe));
        self
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }
}

impl Transport for TcpTransport {
    fn name(&self) -> &str {
        "tcp"
    }

    fn listen(&self, service: &ServiceRecord) -> io::Result<Box<dyn Listener>> {
        let listener = TcpListener::bind(self.bind_addr)?;
        let local = listener.local_addr()?;
        tracing::debug!(
            service = service.name,
            uuid = %service.uuid,
            addr = %local,
            "bound swap listener"
        );
        Ok(Box::new(TcpSwapListener {
            listener,
            local,
            closed: AtomicBool::new(false),
        }))
    }

    fn connect(&self, locator: &str) -> io::Result<Connection> {
        let addr = locator.strip_prefix("tcp://").unwrap_or(locator);
        let stream = TcpStream::connect(addr)?;
        let _ = stream.set_nodelay(true);
        Connection::open(Box::new(stream))
    }

    fn is_enabled(&self) -> bool {
        self.enabled.as_ref().map_or(true, |probe| probe())
    }
}

/// TCP listener whose `close` wakes a blocked `accept` with a loopback connect.
struct TcpSwapListener {
    listener: TcpListener,
    local: SocketAddr,
    closed: AtomicBool,
}

impl TcpSwapListener {
    fn closed_error() -> io::Error {
        io::Error::new(io::ErrorKind::ConnectionAborted, "listener closed")
    }
}

impl Listener for TcpSwapListener {
    fn accept(&self) -> io::Result<Connection> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Self::closed_error());
        }
        let (stream, _) = self.listener.accept()?;
        if self.closed.load(Ordering::SeqCst) {
            let _ = stream.shutdown(Shutdown::Both);
            return Err(Self::closed_error());
        }
        let _ = stream.set_nodelay(true);
        Connection::open(Box::new(stream))
    }

    fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut wake = self.local;
        if wake.ip().is_unspecified() {
            let loopback: std::net::IpAddr = if wake.is_ipv4() {
                std::net::Ipv4Addr::LOCALHOST.into()
            } else {
                std::net::Ipv6Addr::LOCALHOST.into()
            };
            wake.set_ip(loopback);
        }
        // Nobody may be blocked in accept; a refused wake-up is fine.
        let _ = TcpStream::connect(wake);
        Ok(())
    }

    fn local_locator(&self) -> String {
        self.local.to_string()
    }
}
