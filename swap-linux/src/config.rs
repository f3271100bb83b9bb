//! Load config from file and environment.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Daemon configuration. File: ~/.config/appswap/config.toml or /etc/appswap/config.toml.
/// Env overrides: APPSWAP_WEB_ROOT, APPSWAP_LAN_PORT, APPSWAP_RADIO_PORT, APPSWAP_DEVICE_NAME.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Directory served to peers (the swap repository).
    #[serde(default = "default_web_root")]
    pub web_root: PathBuf,
    /// Port of the Wi-Fi swap HTTP front (default 8888).
    #[serde(default = "default_lan_port")]
    pub lan_port: u16,
    /// Port of the TCP stand-in for the radio socket (default 8889).
    #[serde(default = "default_radio_port")]
    pub radio_port: u16,
    /// Name shown to peers; also the radio adapter name.
    #[serde(default = "default_device_name")]
    pub device_name: String,
    #[serde(default = "yes")]
    pub enable_radio: bool,
    #[serde(default = "yes")]
    pub enable_wifi: bool,
    /// Announce the Wi-Fi swap over mDNS.
    #[serde(default = "yes")]
    pub announce: bool,
    /// Repository key fingerprint advertised to peers.
    #[serde(default)]
    pub fingerprint: Option<String>,
}

fn default_web_root() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".local/share/appswap/repo"),
        None => PathBuf::from("/var/lib/appswap/repo"),
    }
}
fn default_lan_port() -> u16 {
    8888
}
fn default_radio_port() -> u16 {
    8889
}
fn default_device_name() -> String {
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "appswap".to_string())
}
fn yes() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            web_root: default_web_root(),
            lan_port: default_lan_port(),
            radio_port: default_radio_port(),
            device_name: default_device_name(),
            enable_radio: true,
            enable_wifi: true,
            announce: true,
            fingerprint: None,
        }
    }
}

/// Load config: defaults, then the first config file found, then env vars.
/// A config file that exists but does not parse is an error.
pub fn load() -> Result<Config> {
    let mut c = match config_paths().into_iter().find(|p| p.exists()) {
        Some(path) => load_file(&path)?,
        None => Config::default(),
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    Ok(c)
}

pub fn parse(s: &str) -> Result<Config> {
    toml::from_str(s).context("invalid config")
}

fn load_file(path: &Path) -> Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    let c = parse(&s).with_context(|| format!("in {}", path.display()))?;
    tracing::debug!(path = %path.display(), "loaded config");
    Ok(c)
}

/// Apply `APPSWAP_*` overrides. Unparsable port values are ignored.
pub fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("APPSWAP_WEB_ROOT") {
        c.web_root = PathBuf::from(s);
    }
    if let Some(s) = var("APPSWAP_LAN_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.lan_port = p;
        }
    }
    if let Some(s) = var("APPSWAP_RADIO_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.radio_port = p;
        }
    }
    if let Some(s) = var("APPSWAP_DEVICE_NAME") {
        if !s.trim().is_empty() {
            c.device_name = s.trim().to_string();
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/appswap/config.toml"));
    }
    out.push(PathBuf::from("/etc/appswap/config.toml"));
    out
}
