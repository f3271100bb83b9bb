//! Buffered duplex byte stream over one transport socket.

use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::sync::Arc;

use crate::protocol;
use crate::transport::StreamSocket;

const BUFFER_SIZE: usize = 8 * 1024;

/// One open socket with buffered input and output. Closing is idempotent and silent;
/// a closed connection refuses all further I/O with `NotConnected`.
pub struct Connection {
    input: BufReader<Box<dyn StreamSocket>>,
    output: BufWriter<Box<dyn StreamSocket>>,
    control: Arc<dyn StreamSocket>,
    peer: String,
    closed: bool,
}

impl Connection {
    /// Wrap a freshly accepted or connected socket.
    pub fn open(socket: Box<dyn StreamSocket>) -> io::Result<Self> {
        let writer = socket.try_clone_socket()?;
        let control: Arc<dyn StreamSocket> = Arc::from(socket.try_clone_socket()?);
        let peer = socket.peer_label();
        Ok(Self {
            input: BufReader::with_capacity(BUFFER_SIZE, socket),
            output: BufWriter::with_capacity(BUFFER_SIZE, writer),
            control,
            peer,
            closed: false,
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Handle another thread can use to interrupt this connection.
    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            socket: self.control.clone(),
            peer: self.peer.clone(),
        }
    }

    /// Read one `\n`-terminated line without its terminator. `None` at end of stream.
    pub fn next_line(&mut self) -> io::Result<Option<String>> {
        self.ensure_open()?;
        protocol::read_line(&mut self.input)
    }

    /// Flush pending output and shut the socket down. Errors on the way are swallowed.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.output.flush();
        if let Err(e) = self.control.shutdown() {
            tracing::trace!(peer = %self.peer, error = %e, "ignoring error while closing connection");
        }
    }

    fn ensure_open(&self) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection already closed",
            ));
        }
        Ok(())
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.ensure_open()?;
        self.input.read(buf)
    }
}

impl BufRead for Connection {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.ensure_open()?;
        self.input.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.input.consume(amt)
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ensure_open()?;
        self.output.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.ensure_open()?;
        self.output.flush()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("closed", &self.closed)
            .finish()
    }
}

/// Cross-thread handle to a connection's socket.
#[derive(Clone)]
pub struct ConnectionHandle {
    socket: Arc<dyn StreamSocket>,
    peer: String,
}

impl ConnectionHandle {
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Make the owner's next (or current) read see end-of-stream. A response being written
    /// is not affected.
    pub fn shutdown_read(&self) {
        if let Err(e) = self.socket.shutdown_read() {
            tracing::trace!(peer = %self.peer, error = %e, "ignoring error while interrupting connection");
        }
    }

    /// Tear down both directions.
    pub fn close(&self) {
        let _ = self.socket.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};

    fn pair() -> (Connection, Connection) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (
            Connection::open(Box::new(client)).unwrap(),
            Connection::open(Box::new(server)).unwrap(),
        )
    }

    #[test]
    fn lines_cross_the_connection() {
        let (mut a, mut b) = pair();
        a.write_all(b"GET /index.html\n\n").unwrap();
        a.flush().unwrap();
        assert_eq!(b.next_line().unwrap().as_deref(), Some("GET /index.html"));
        assert_eq!(b.next_line().unwrap().as_deref(), Some(""));
    }

    #[test]
    fn close_is_idempotent_and_blocks_io() {
        let (mut a, _b) = pair();
        a.close();
        a.close();
        assert!(a.is_closed());
        assert_eq!(
            a.write_all(b"x").unwrap_err().kind(),
            io::ErrorKind::NotConnected
        );
        assert_eq!(a.next_line().unwrap_err().kind(), io::ErrorKind::NotConnected);
    }

    #[test]
    fn peer_close_reads_as_end_of_stream() {
        let (mut a, mut b) = pair();
        a.close();
        assert_eq!(b.next_line().unwrap(), None);
    }

    #[test]
    fn shutdown_read_wakes_blocked_reader() {
        let (_a, mut b) = pair();
        let handle = b.handle();
        let t = std::thread::spawn(move || b.next_line().map(|l| l.is_none()));
        std::thread::sleep(std::time::Duration::from_millis(50));
        handle.shutdown_read();
        assert!(t.join().unwrap().unwrap());
    }
}
