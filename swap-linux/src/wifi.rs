//! Wi-Fi swap type: serves the swap repository to the LAN over HTTP and announces it via mDNS.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use swap_core::{FileServer, SwapError, SwapTransport, TransportKind};
use tokio::runtime::Runtime;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::discovery::{Announcement, Discovery};
use crate::lan_http;

pub const DEFAULT_PORT: u16 = 8888;

/// Upper bound (exclusive) of the random step taken after a failed bind.
const PORT_STEP: u16 = 1111;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

pub struct WifiSwap {
    files: Arc<FileServer>,
    bind_ip: IpAddr,
    port: u16,
    announcement: Option<Announcement>,
    runtime: Option<Runtime>,
    server: Option<JoinHandle<()>>,
    shutdown: Option<watch::Sender<bool>>,
    local_addr: Option<SocketAddr>,
    discovery: Option<Discovery>,
}

impl WifiSwap {
    pub fn new(files: FileServer, port: u16) -> Self {
        Self {
            files: Arc::new(files),
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port,
            announcement: None,
            runtime: None,
            server: None,
            shutdown: None,
            local_addr: None,
            discovery: None,
        }
    }

    pub fn bind_ip(mut self, ip: IpAddr) -> Self {
        self.bind_ip = ip;
        self
    }

    /// Announce over mDNS while up. The announced port is the one actually bound.
    pub fn announcing(mut self, announcement: Announcement) -> Self {
        self.announcement = Some(announcement);
        self
    }

    /// Port the next start binds.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// After a failed bind, move to a nearby port so the next start has a chance.
    fn step_port(&mut self) {
        let step = rand::thread_rng().gen_range(1..PORT_STEP);
        self.port = self.port.checked_add(step).unwrap_or(DEFAULT_PORT + step);
        tracing::debug!(port = self.port, "next wifi swap start will try another port");
    }

    fn announce(&mut self, port: u16) {
        let Some(announcement) = &self.announcement else {
            return;
        };
        let announcement = Announcement {
            port,
            ..announcement.clone()
        };
        let mut discovery = match Discovery::new() {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(error = %e, "mDNS unavailable, wifi swap is reachable by address only");
                return;
            }
        };
        if let Err(e) = discovery.announce(&announcement) {
            tracing::warn!(error = %e, "cannot announce wifi swap");
        }
        self.discovery = Some(discovery);
    }
}

impl SwapTransport for WifiSwap {
    fn kind(&self) -> TransportKind {
        TransportKind::Wifi
    }

    fn bring_up(&mut self) -> Result<(), SwapError> {
        if self.runtime.is_some() {
            self.tear_down();
        }
        let bring_up_error = |source: io::Error| SwapError::BringUp {
            kind: TransportKind::Wifi,
            source,
        };
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .thread_name("wifi-swap")
            .enable_all()
            .build()
            .map_err(bring_up_error)?;

        let addr = SocketAddr::new(self.bind_ip, self.port);
        let listener = match runtime.block_on(tokio::net::TcpListener::bind(addr)) {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!(addr = %addr, error = %e, "cannot bind wifi swap port");
                self.step_port();
                return Err(bring_up_error(e));
            }
        };
        let local = listener.local_addr().map_err(bring_up_error)?;

        let (tx, rx) = watch::channel(false);
        let server = runtime.spawn(lan_http::serve(listener, self.files.clone(), rx));
        tracing::info!(addr = %local, root = %self.files.web_root().display(), "wifi swap serving");

        self.runtime = Some(runtime);
        self.server = Some(server);
        self.shutdown = Some(tx);
        self.local_addr = Some(local);
        self.announce(local.port());
        Ok(())
    }

    fn tear_down(&mut self) {
        if let Some(discovery) = self.discovery.take() {
            if let Err(e) = discovery.shutdown() {
                tracing::warn!(error = %e, "mDNS shutdown failed");
            }
        }
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(true);
        }
        if let Some(runtime) = self.runtime.take() {
            if let Some(server) = self.server.take() {
                if let Err(e) = runtime.block_on(server) {
                    tracing::warn!(error = %e, "lan http task ended abnormally");
                }
            }
            runtime.shutdown_timeout(SHUTDOWN_GRACE);
        }
        self.server = None;
        self.local_addr = None;
    }

    fn announces_stopping(&self) -> bool {
        true
    }

    fn is_alive(&self) -> bool {
        self.server.as_ref().is_some_and(|h| !h.is_finished())
    }
}
