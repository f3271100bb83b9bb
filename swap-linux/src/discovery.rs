//! mDNS discovery: announce this device's Wi-Fi swap and browse for other swap repositories.
//!
//! Uses the `_appswap._tcp.local.` service type. The TXT record carries `name`, `path`,
//! `type` and, when configured, `fingerprint`.

use anyhow::{Context, Result};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo, TxtProperties};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use swap_core::peer::SERVICE_TYPE_PLAIN;
use swap_core::{Peer, PeerSet, SwapSession};

/// App Swap mDNS service type (RFC 6763: _service._proto.local.)
pub const SERVICE_TYPE: &str = "_appswap._tcp.local.";

/// Path of the repository under the web root, advertised to peers.
pub const REPO_PATH: &str = "/fdroid/repo";

const TXT_KEYS: [&str; 4] = ["name", "path", "type", "fingerprint"];

/// What gets advertised about this device.
#[derive(Debug, Clone)]
pub struct Announcement {
    pub device_name: String,
    pub port: u16,
    pub fingerprint: Option<String>,
}

/// mDNS daemon handle: register this node and browse for peers.
pub struct Discovery {
    daemon: ServiceDaemon,
    registered: Option<String>,
}

impl Discovery {
    pub fn new() -> Result<Self> {
        let daemon = ServiceDaemon::new().context("Failed to create mDNS daemon")?;
        Ok(Self {
            daemon,
            registered: None,
        })
    }

    /// Register the swap repository on the LAN. Returns the full service name.
    pub fn announce(&mut self, announcement: &Announcement) -> Result<String> {
        let instance_name = format!("{}-{}", announcement.device_name, &uuid::Uuid::new_v4().simple().to_string()[..8]);
        let ip = local_ip_address::local_ip()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "127.0.0.1".to_string());
        let host_name = format!("{}.local.", instance_name);

        let mut properties: Vec<(&str, &str)> = vec![
            ("name", announcement.device_name.as_str()),
            ("path", REPO_PATH),
            ("type", SERVICE_TYPE_PLAIN),
        ];
        if let Some(fp) = &announcement.fingerprint {
            properties.push(("fingerprint", fp.as_str()));
        }

        let service = ServiceInfo::new(
            SERVICE_TYPE,
            &instance_name,
            &host_name,
            &ip,
            announcement.port,
            &properties[..],
        )
        .context("Invalid ServiceInfo")?;
        let fullname = service.get_fullname().to_string();

        self.daemon.register(service).context("Failed to register mDNS service")?;
        tracing::info!(
            instance = %instance_name,
            addr = %format!("{}:{}", ip, announcement.port),
            "Announced swap repository via mDNS"
        );
        self.registered = Some(fullname.clone());
        Ok(fullname)
    }

    /// Withdraw the announcement, if any.
    pub fn unannounce(&mut self) {
        if let Some(fullname) = self.registered.take() {
            if let Err(e) = self.daemon.unregister(&fullname) {
                tracing::warn!(service = %fullname, error = %e, "Failed to unregister mDNS service");
            }
        }
    }

    pub fn browse(&self) -> Result<mdns_sd::Receiver<ServiceEvent>> {
        self.daemon
            .browse(SERVICE_TYPE)
            .context("Failed to browse for swap peers")
    }

    pub fn shutdown(mut self) -> Result<()> {
        self.unannounce();
        let _rx = self.daemon.shutdown().context("Failed to shutdown mDNS daemon")?;
        Ok(())
    }
}

/// The keys of a TXT record this protocol reads.
pub fn txt_map(txt: &TxtProperties) -> HashMap<String, String> {
    TXT_KEYS
        .iter()
        .filter_map(|k| txt.get_property_val_str(k).map(|v| (k.to_string(), v.to_string())))
        .collect()
}

/// Instance part of a full service name (`phone._appswap._tcp.local.` gives `phone`).
pub fn instance_name(fullname: &str) -> &str {
    fullname
        .strip_suffix(SERVICE_TYPE)
        .map(|s| s.trim_end_matches('.'))
        .unwrap_or(fullname)
}

/// Build the peer for a resolved announcement.
pub fn peer_from_announcement(fullname: &str, host: &str, port: u16, txt: &HashMap<String, String>) -> Peer {
    Peer::announced(instance_name(fullname), SERVICE_TYPE, host, port, txt)
}

/// Resolved announcements by full service name. mDNS resolves the same service repeatedly;
/// only the first resolution is a new peer.
#[derive(Default)]
struct SeenPeers {
    known: HashMap<String, Peer>,
}

impl SeenPeers {
    fn resolved(&mut self, fullname: &str, peer: Peer) -> Option<PeerChange> {
        if self.known.contains_key(fullname) {
            return None;
        }
        self.known.insert(fullname.to_string(), peer.clone());
        Some(PeerChange::Found(peer))
    }

    fn removed(&mut self, fullname: &str) -> Option<PeerChange> {
        self.known.remove(fullname).map(PeerChange::Lost)
    }
}

/// Turn browse events into peer additions and removals until `stop` is set.
fn browse_loop(
    rx: &mdns_sd::Receiver<ServiceEvent>,
    stop: &AtomicBool,
    deadline: Option<Instant>,
    mut on_peer: impl FnMut(PeerChange),
) {
    let mut seen = SeenPeers::default();
    while !stop.load(Ordering::SeqCst) && deadline.map_or(true, |d| Instant::now() < d) {
        match rx.recv_timeout(Duration::from_millis(500)) {
            Ok(ServiceEvent::ServiceResolved(resolved)) => {
                let host = resolved
                    .addresses
                    .iter()
                    .next()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| resolved.host.trim_end_matches('.').to_string());
                let txt = txt_map(&resolved.txt_properties);
                let peer = peer_from_announcement(&resolved.fullname, &host, resolved.port, &txt);
                if let Some(change) = seen.resolved(&resolved.fullname, peer) {
                    tracing::info!(peer = %resolved.fullname, "Discovered swap peer");
                    on_peer(change);
                }
            }
            Ok(ServiceEvent::ServiceRemoved(_, fullname)) => {
                if let Some(change) = seen.removed(&fullname) {
                    tracing::info!(peer = %fullname, "Swap peer left");
                    on_peer(change);
                }
            }
            Ok(_) => {}
            Err(_) => {
                // Timeout, loop again
            }
        }
    }
}

#[derive(Debug)]
enum PeerChange {
    Found(Peer),
    Lost(Peer),
}

/// Background browse feeding a session's peer set.
pub struct Browser {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Browser {
    pub fn spawn(discovery: &Discovery, session: Arc<SwapSession>) -> Result<Self> {
        let rx = discovery.browse()?;
        let stop = Arc::new(AtomicBool::new(false));
        let stop_browse = stop.clone();
        let thread = std::thread::Builder::new()
            .name("mdns-browse".into())
            .spawn(move || {
                browse_loop(&rx, &stop_browse, None, |change| match change {
                    PeerChange::Found(peer) => {
                        session.add_peer(peer);
                    }
                    PeerChange::Lost(peer) => {
                        session.remove_peer(&peer);
                    }
                })
            })
            .context("Failed to spawn mDNS browse thread")?;
        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for Browser {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Browse for `window` and return the deduplicated peers seen.
pub fn collect_peers(window: Duration) -> Result<PeerSet> {
    let discovery = Discovery::new()?;
    let rx = discovery.browse()?;
    let mut peers = PeerSet::new();
    let stop = AtomicBool::new(false);
    browse_loop(&rx, &stop, Some(Instant::now() + window), |change| match change {
        PeerChange::Found(peer) => {
            peers.insert(peer);
        }
        PeerChange::Lost(peer) => {
            peers.remove(&peer);
        }
    });
    discovery.shutdown()?;
    Ok(peers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_is_stripped_from_fullname() {
        assert_eq!(instance_name("laptop-1a2b._appswap._tcp.local."), "laptop-1a2b");
        assert_eq!(instance_name("odd.name"), "odd.name");
    }

    #[test]
    fn announcement_becomes_peer() {
        let txt: HashMap<String, String> = [
            ("name", "Laptop"),
            ("path", REPO_PATH),
            ("type", SERVICE_TYPE_PLAIN),
            ("fingerprint", "ab:cd"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let peer = peer_from_announcement("laptop-1a2b._appswap._tcp.local.", "192.168.1.9", 8888, &txt);
        assert_eq!(peer.name(), "Laptop");
        assert_eq!(peer.locator(), "http://192.168.1.9:8888/fdroid/repo");
        assert_eq!(peer.fingerprint().map(|f| f.as_str()), Some("ABCD"));
        match peer.origin() {
            swap_core::PeerOrigin::AnnouncedService { instance_name, service_type } => {
                assert_eq!(instance_name, "laptop-1a2b");
                assert_eq!(service_type, SERVICE_TYPE);
            }
            other => panic!("unexpected origin {other:?}"),
        }
    }

    #[test]
    fn same_device_seen_twice_is_one_peer() {
        let txt: HashMap<String, String> = [("fingerprint".to_string(), "AB".to_string())].into_iter().collect();
        let mut peers = PeerSet::new();
        peers.insert(peer_from_announcement("a._appswap._tcp.local.", "10.0.0.1", 8888, &txt));
        peers.insert(peer_from_announcement("a._appswap._tcp.local.", "fe80::1", 8888, &txt));
        assert_eq!(peers.len(), 1);
    }

    #[test]
    fn repeated_resolution_is_reported_once_and_removal_clears_it() {
        let fullname = "tablet-1a2b._appswap._tcp.local.";
        let mut seen = SeenPeers::default();
        let mut peers = PeerSet::new();
        for _ in 0..3 {
            let peer = peer_from_announcement(fullname, "10.0.0.9", 8888, &HashMap::new());
            if let Some(PeerChange::Found(p)) = seen.resolved(fullname, peer) {
                peers.insert(p);
            }
        }
        assert_eq!(peers.len(), 1);

        match seen.removed(fullname) {
            Some(PeerChange::Lost(p)) => assert!(peers.remove(&p)),
            other => panic!("unexpected {other:?}"),
        }
        assert!(peers.is_empty());
        assert!(seen.removed(fullname).is_none());
    }
}
