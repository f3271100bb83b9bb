//! Swap server: accepts connections on a transport and answers httpish requests from a web root.
//!
//! One accept thread, one thread per connection. A server runs once: after `stop` it cannot be
//! started again; build a new one instead.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::connection::{Connection, ConnectionHandle};
use crate::protocol::Method;
use crate::request::Request;
use crate::serve::FileServer;
use crate::transport::{Listener, Transport, SWAP_SERVICE};

/// Pause after a failed accept so a persistent error does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("cannot bind {transport} listener: {source}")]
    Bind {
        transport: String,
        #[source]
        source: io::Error,
    },
    #[error("server is already running")]
    AlreadyRunning,
    #[error("server was stopped and cannot be restarted")]
    Stopped,
    #[error("cannot spawn server thread: {0}")]
    Spawn(#[source] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    NotStarted,
    Running,
    Stopped,
}

struct Worker {
    connection: ConnectionHandle,
    thread: JoinHandle<()>,
}

/// State shared by the accept thread, the workers and `stop`.
struct Shared {
    interrupted: AtomicBool,
    workers: Mutex<Vec<Worker>>,
}

impl Shared {
    fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }
}

pub struct SwapServer {
    transport: Arc<dyn Transport>,
    files: FileServer,
    phase: Phase,
    shared: Arc<Shared>,
    listener: Option<Arc<dyn Listener>>,
    accept_thread: Option<JoinHandle<()>>,
    locator: Option<String>,
}

impl SwapServer {
    pub fn new(transport: Arc<dyn Transport>, files: FileServer) -> Self {
        Self {
            transport,
            files,
            phase: Phase::NotStarted,
            shared: Arc::new(Shared {
                interrupted: AtomicBool::new(false),
                workers: Mutex::new(Vec::new()),
            }),
            listener: None,
            accept_thread: None,
            locator: None,
        }
    }

    /// Bind the listener and start accepting. The bind happens before this returns; a bind
    /// failure leaves the server stopped.
    pub fn start(&mut self) -> Result<(), ServerError> {
        match self.phase {
            Phase::Running => return Err(ServerError::AlreadyRunning),
            Phase::Stopped => return Err(ServerError::Stopped),
            Phase::NotStarted => {}
        }

        let listener: Arc<dyn Listener> = match self.transport.listen(&SWAP_SERVICE) {
            Ok(listener) => Arc::from(listener),
            Err(source) => {
                self.phase = Phase::Stopped;
                tracing::warn!(transport = self.transport.name(), error = %source, "swap server bind failed");
                return Err(ServerError::Bind {
                    transport: self.transport.name().to_string(),
                    source,
                });
            }
        };
        let locator = listener.local_locator();

        let accept = {
            let listener = listener.clone();
            let transport = self.transport.clone();
            let files = self.files.clone();
            let shared = self.shared.clone();
            thread::Builder::new()
                .name("swap-accept".into())
                .spawn(move || accept_loop(listener.as_ref(), transport.as_ref(), &files, &shared))
        };
        let accept = match accept {
            Ok(handle) => handle,
            Err(e) => {
                let _ = listener.close();
                self.phase = Phase::Stopped;
                return Err(ServerError::Spawn(e));
            }
        };

        tracing::info!(
            transport = self.transport.name(),
            locator = %locator,
            root = %self.files.web_root().display(),
            "swap server started"
        );
        self.listener = Some(listener);
        self.accept_thread = Some(accept);
        self.locator = Some(locator);
        self.phase = Phase::Running;
        Ok(())
    }

    /// Interrupt accepting and all connections, then release the listener. Responses already
    /// being written run to completion. Safe to call in any state.
    pub fn stop(&mut self) {
        if self.phase != Phase::Running {
            self.phase = Phase::Stopped;
            return;
        }
        self.phase = Phase::Stopped;
        self.shared.interrupted.store(true, Ordering::SeqCst);

        let workers = std::mem::take(
            &mut *self
                .shared
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for worker in &workers {
            worker.connection.shutdown_read();
        }

        if let Some(listener) = self.listener.take() {
            if let Err(e) = listener.close() {
                tracing::trace!(error = %e, "ignoring error while closing listener");
            }
        }
        if let Some(accept) = self.accept_thread.take() {
            if accept.join().is_err() {
                tracing::warn!("swap accept thread panicked");
            }
        }
        tracing::info!(
            transport = self.transport.name(),
            open_connections = workers.len(),
            "swap server stopped"
        );
    }

    /// True while started and the accept loop is still alive.
    pub fn is_running(&self) -> bool {
        self.phase == Phase::Running
            && self
                .accept_thread
                .as_ref()
                .is_some_and(|t| !t.is_finished())
    }

    /// Where clients reach this server; `None` before a successful start.
    pub fn local_locator(&self) -> Option<&str> {
        self.locator.as_deref()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }
}

impl Drop for SwapServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(listener: &dyn Listener, transport: &dyn Transport, files: &FileServer, shared: &Arc<Shared>) {
    loop {
        if shared.is_interrupted() {
            break;
        }
        if !transport.is_enabled() {
            tracing::info!(transport = transport.name(), "transport disabled, leaving accept loop");
            break;
        }
        let conn = match listener.accept() {
            Ok(conn) => conn,
            Err(e) => {
                if shared.is_interrupted() {
                    break;
                }
                tracing::warn!(error = %e, "accept failed");
                thread::sleep(ACCEPT_BACKOFF);
                continue;
            }
        };

        let mut workers = shared.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if shared.is_interrupted() {
            break;
        }
        workers.retain(|w| !w.thread.is_finished());
        let handle = conn.handle();
        let peer = conn.peer().to_string();
        let files = files.clone();
        let worker_shared = shared.clone();
        let spawned = thread::Builder::new()
            .name("swap-conn".into())
            .spawn(move || serve_connection(conn, &files, &worker_shared));
        match spawned {
            Ok(thread) => {
                tracing::debug!(peer = %peer, active = workers.len() + 1, "accepted swap connection");
                workers.push(Worker {
                    connection: handle,
                    thread,
                });
            }
            Err(e) => tracing::warn!(peer = %peer, error = %e, "cannot spawn connection thread"),
        }
    }
    tracing::debug!("swap accept loop finished");
}

fn serve_connection(mut conn: Connection, files: &FileServer, shared: &Shared) {
    let mut served = 0u64;
    while !shared.is_interrupted() {
        let request = match Request::listen(&mut conn) {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(peer = conn.peer(), error = %e, "dropping connection on bad request");
                break;
            }
        };
        let mut response = files.serve(&request.path, &request.headers);
        if request.method == Method::Head {
            response = response.into_head();
        }
        let status = response.status_code();
        match response.send(&mut conn, request.method) {
            Ok(delivery) => {
                served += 1;
                tracing::debug!(
                    peer = conn.peer(),
                    method = %request.method,
                    path = %request.path,
                    status,
                    bytes = delivery.body_bytes,
                    "served request"
                );
                if !delivery.keep_alive {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(peer = conn.peer(), error = %e, "response not delivered");
                break;
            }
        }
    }
    tracing::debug!(peer = conn.peer(), requests = served, "swap connection closed");
    conn.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TcpTransport;

    fn tcp() -> Arc<dyn Transport> {
        Arc::new(TcpTransport::new("127.0.0.1:0".parse().unwrap()))
    }

    #[test]
    fn cannot_restart_after_stop() {
        let root = tempfile::tempdir().unwrap();
        let mut server = SwapServer::new(tcp(), FileServer::new(root.path()));
        server.start().unwrap();
        assert!(server.is_running());
        assert!(matches!(server.start(), Err(ServerError::AlreadyRunning)));
        server.stop();
        assert!(!server.is_running());
        server.stop();
        assert!(matches!(server.start(), Err(ServerError::Stopped)));
    }

    #[test]
    fn stop_before_start_is_harmless() {
        let root = tempfile::tempdir().unwrap();
        let mut server = SwapServer::new(tcp(), FileServer::new(root.path()));
        server.stop();
        assert!(server.local_locator().is_none());
        assert!(matches!(server.start(), Err(ServerError::Stopped)));
    }

    #[test]
    fn bind_failure_leaves_server_stopped() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let transport: Arc<dyn Transport> = Arc::new(TcpTransport::new(taken.local_addr().unwrap()));
        let root = tempfile::tempdir().unwrap();
        let mut server = SwapServer::new(transport, FileServer::new(root.path()));
        assert!(matches!(server.start(), Err(ServerError::Bind { .. })));
        assert!(!server.is_running());
        assert!(matches!(server.start(), Err(ServerError::Stopped)));
    }
}
