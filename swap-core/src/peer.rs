//! Peers found by the discovery mechanisms, and the identity rules that deduplicate them.
//!
//! The same device can show up through several channels at once: paired over radio, typed in
//! or scanned as a network location, and announced on the LAN. Equality decides which records
//! describe the same swap partner:
//!
//! * radio-paired peers match only radio-paired peers with the same hardware address;
//! * announced services match each other, and network locations, only on equal fingerprints;
//! * two network locations match on equal fingerprints, or on equal locators when either
//!   side has no fingerprint.
//!
//! Equality is not transitive across kinds, so `Peer` implements `PartialEq`
//! but neither `Eq` nor `Hash`. `identity_hash` gives the coarse bucket key.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Repository signing-key fingerprint: upper-case hex, no separators, never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

#[derive(Debug, thiserror::Error)]
#[error("not a hex fingerprint: {0:?}")]
pub struct InvalidFingerprint(String);

impl Fingerprint {
    /// Accepts any case and `:`, `-` or space separators.
    pub fn parse(raw: &str) -> Result<Self, InvalidFingerprint> {
        let normalized: String = raw
            .chars()
            .filter(|c| !matches!(c, ':' | '-' | ' '))
            .map(|c| c.to_ascii_uppercase())
            .collect();
        if normalized.is_empty() || !normalized.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(InvalidFingerprint(raw.to_string()));
        }
        Ok(Self(normalized))
    }

    /// SHA-256 of a DER-encoded signing certificate.
    pub fn of_certificate(der: &[u8]) -> Self {
        Self(hex::encode_upper(Sha256::digest(der)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = InvalidFingerprint;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Fingerprint::parse(&value)
    }
}

impl From<Fingerprint> for String {
    fn from(fp: Fingerprint) -> Self {
        fp.0
    }
}

/// How a peer was found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PeerOrigin {
    RadioPaired { hardware_address: String },
    NetworkLocation,
    AnnouncedService {
        instance_name: String,
        service_type: String,
    },
}

pub const RADIO_ICON: &str = "radio";
pub const WIFI_ICON: &str = "wifi";

/// Announced service type of a swap repository; the `s` variant is served over TLS.
pub const SERVICE_TYPE_PLAIN: &str = "appswap";
pub const SERVICE_TYPE_TLS: &str = "appswaps";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    name: String,
    icon: String,
    locator: String,
    fingerprint: Option<Fingerprint>,
    prompt_swap_back: bool,
    origin: PeerOrigin,
}

impl Peer {
    /// A device paired over radio. The hardware address doubles as the locator.
    pub fn radio_paired(name: impl Into<String>, hardware_address: &str) -> Self {
        let address = hardware_address.trim().to_ascii_uppercase();
        Self {
            name: name.into(),
            icon: RADIO_ICON.to_string(),
            locator: address.clone(),
            fingerprint: None,
            prompt_swap_back: false,
            origin: PeerOrigin::RadioPaired {
                hardware_address: address,
            },
        }
    }

    /// A repository address typed in or scanned, e.g.
    /// `http://192.168.1.20:8888/fdroid/repo?fingerprint=AB12..&swap=1`. The `fingerprint`
    /// query parameter pins the key; `swap` asks us to offer a swap back.
    pub fn from_locator(locator: &str) -> Self {
        let locator = locator.trim();
        let (base, query) = locator.split_once('?').unwrap_or((locator, ""));
        let params = query_params(query);
        let fingerprint = params
            .get("fingerprint")
            .and_then(|fp| Fingerprint::parse(fp).ok());
        let prompt_swap_back = params.contains_key("swap");
        let name = host_of(base).unwrap_or(base).to_string();
        Self {
            name,
            icon: WIFI_ICON.to_string(),
            locator: base.to_string(),
            fingerprint,
            prompt_swap_back,
            origin: PeerOrigin::NetworkLocation,
        }
    }

    /// A repository announced on the LAN, from its instance name, resolved address and TXT
    /// record (`name`, `path`, `fingerprint`, `type`).
    pub fn announced(
        instance_name: &str,
        service_type: &str,
        host: &str,
        port: u16,
        txt: &HashMap<String, String>,
    ) -> Self {
        let scheme = match txt.get("type").map(String::as_str) {
            Some(SERVICE_TYPE_TLS) => "https",
            _ => "http",
        };
        let path = txt.get("path").map(String::as_str).unwrap_or("/fdroid/repo");
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        let host = if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]")
        } else {
            host.to_string()
        };
        let name = txt
            .get("name")
            .filter(|n| !n.is_empty())
            .cloned()
            .unwrap_or_else(|| instance_name.to_string());
        Self {
            name,
            icon: WIFI_ICON.to_string(),
            locator: format!("{scheme}://{host}:{port}{path}"),
            fingerprint: txt
                .get("fingerprint")
                .and_then(|fp| Fingerprint::parse(fp).ok()),
            prompt_swap_back: false,
            origin: PeerOrigin::AnnouncedService {
                instance_name: instance_name.to_string(),
                service_type: service_type.to_string(),
            },
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: Fingerprint) -> Self {
        self.fingerprint = Some(fingerprint);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn icon(&self) -> &str {
        &self.icon
    }

    pub fn locator(&self) -> &str {
        &self.locator
    }

    pub fn fingerprint(&self) -> Option<&Fingerprint> {
        self.fingerprint.as_ref()
    }

    pub fn should_prompt_swap_back(&self) -> bool {
        self.prompt_swap_back
    }

    pub fn origin(&self) -> &PeerOrigin {
        &self.origin
    }

    /// Fingerprint-derived when there is one, else locator-derived. Equal peers share it only
    /// when both or neither carry a fingerprint: a bare locator equals the same locator with a
    /// fingerprint, yet the two hash differently.
    pub fn identity_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        match &self.fingerprint {
            Some(fp) => fp.hash(&mut hasher),
            None => self.locator.hash(&mut hasher),
        }
        hasher.finish()
    }
}

/// The same record seen again: same origin, same locator. Catches announced services without a
/// fingerprint, which equal nothing.
fn same_record(a: &Peer, b: &Peer) -> bool {
    a.origin == b.origin && a.locator == b.locator
}

fn same_fingerprint(a: &Peer, b: &Peer) -> bool {
    matches!((&a.fingerprint, &b.fingerprint), (Some(x), Some(y)) if x == y)
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        use PeerOrigin::*;
        match (&self.origin, &other.origin) {
            (RadioPaired { hardware_address: a }, RadioPaired { hardware_address: b }) => a == b,
            (RadioPaired { .. }, _) | (_, RadioPaired { .. }) => false,
            (NetworkLocation, NetworkLocation) => match (&self.fingerprint, &other.fingerprint) {
                (Some(a), Some(b)) => a == b,
                _ => self.locator == other.locator,
            },
            (AnnouncedService { .. }, _) | (_, AnnouncedService { .. }) => {
                same_fingerprint(self, other)
            }
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.locator)
    }
}

fn query_params(query: &str) -> HashMap<&str, &str> {
    query
        .split('&')
        .filter(|kv| !kv.is_empty())
        .map(|kv| kv.split_once('=').unwrap_or((kv, "")))
        .collect()
}

fn host_of(base: &str) -> Option<&str> {
    let rest = base.split_once("://").map_or(base, |(_, r)| r);
    let authority = rest.split('/').next()?;
    if let Some(v6) = authority.strip_prefix('[') {
        return v6.split(']').next().filter(|h| !h.is_empty());
    }
    authority.split(':').next().filter(|h| !h.is_empty())
}

/// Discovered peers, deduplicated by `Peer` equality (or by being the same record) in
/// discovery order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PeerSet {
    peers: Vec<Peer>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `peer`. An equal record already present is kept unless the new one brings a
    /// fingerprint it lacks. Returns true when the set changed.
    pub fn insert(&mut self, peer: Peer) -> bool {
        match self.peers.iter_mut().find(|known| is_same_peer(known, &peer)) {
            Some(known) => {
                if known.fingerprint.is_none() && peer.fingerprint.is_some() {
                    *known = peer;
                    true
                } else {
                    false
                }
            }
            None => {
                self.peers.push(peer);
                true
            }
        }
    }

    pub fn remove(&mut self, peer: &Peer) -> bool {
        let before = self.peers.len();
        self.peers.retain(|known| !is_same_peer(known, peer));
        self.peers.len() != before
    }

    pub fn contains(&self, peer: &Peer) -> bool {
        self.peers.iter().any(|known| is_same_peer(known, peer))
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter()
    }
}

fn is_same_peer(known: &Peer, peer: &Peer) -> bool {
    known == peer || same_record(known, peer)
}
