//! Radio swap type: makes the device visible over its short-range radio and serves the swap
//! repository on the radio transport.

use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use crate::lifecycle::{SwapError, SwapTransport, TransportKind};
use crate::serve::FileServer;
use crate::server::SwapServer;
use crate::transport::Transport;

/// Prefix added to the adapter name while swapping so other devices can spot swap partners.
pub const SWAP_NAME_TAG: &str = "AppSwap:";

/// The device's radio adapter.
pub trait RadioAdapter: Send + Sync {
    fn is_enabled(&self) -> bool;
    fn enable(&self) -> io::Result<()>;
    fn disable(&self) -> io::Result<()>;
    fn name(&self) -> String;
    fn set_name(&self, name: &str) -> io::Result<()>;
}

#[derive(Debug)]
struct SoftRadioState {
    enabled: bool,
    name: String,
}

/// In-process radio adapter. Clones share one adapter.
#[derive(Debug, Clone)]
pub struct SoftRadio {
    state: Arc<Mutex<SoftRadioState>>,
}

impl SoftRadio {
    pub fn new(name: impl Into<String>, enabled: bool) -> Self {
        Self {
            state: Arc::new(Mutex::new(SoftRadioState {
                enabled,
                name: name.into(),
            })),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut SoftRadioState) -> R) -> R {
        f(&mut self.state.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl RadioAdapter for SoftRadio {
    fn is_enabled(&self) -> bool {
        self.with_state(|s| s.enabled)
    }

    fn enable(&self) -> io::Result<()> {
        self.with_state(|s| s.enabled = true);
        Ok(())
    }

    fn disable(&self) -> io::Result<()> {
        self.with_state(|s| s.enabled = false);
        Ok(())
    }

    fn name(&self) -> String {
        self.with_state(|s| s.name.clone())
    }

    fn set_name(&self, name: &str) -> io::Result<()> {
        self.with_state(|s| s.name = name.to_string());
        Ok(())
    }
}

/// What the adapter looked like before the swap took it over.
#[derive(Debug, Clone)]
struct AdapterSnapshot {
    was_enabled: bool,
    name: String,
}

pub struct RadioSwap {
    adapter: Arc<dyn RadioAdapter>,
    transport: Arc<dyn Transport>,
    files: FileServer,
    server: Option<SwapServer>,
    snapshot: Option<AdapterSnapshot>,
}

impl RadioSwap {
    pub fn new(adapter: Arc<dyn RadioAdapter>, transport: Arc<dyn Transport>, files: FileServer) -> Self {
        Self {
            adapter,
            transport,
            files,
            server: None,
            snapshot: None,
        }
    }

    /// Where the running server can be reached.
    pub fn locator(&self) -> Option<String> {
        self.server
            .as_ref()
            .and_then(|s| s.local_locator().map(str::to_string))
    }

    fn adapter_error(message: String) -> SwapError {
        SwapError::Adapter {
            kind: TransportKind::Radio,
            message,
        }
    }
}

impl SwapTransport for RadioSwap {
    fn kind(&self) -> TransportKind {
        TransportKind::Radio
    }

    fn bring_up(&mut self) -> Result<(), SwapError> {
        // A server whose accept loop died (adapter switched off) is replaced, never reused.
        if let Some(mut stale) = self.server.take() {
            stale.stop();
        }

        let snapshot = self.snapshot.get_or_insert_with(|| AdapterSnapshot {
            was_enabled: self.adapter.is_enabled(),
            name: self.adapter.name(),
        });
        if !snapshot.name.starts_with(SWAP_NAME_TAG) {
            let tagged = format!("{SWAP_NAME_TAG}{}", snapshot.name);
            if let Err(e) = self.adapter.set_name(&tagged) {
                tracing::warn!(error = %e, "cannot tag radio name; peers will not recognise this device");
            }
        }

        if !self.adapter.is_enabled() {
            tracing::debug!("radio adapter is off, enabling it");
            self.adapter
                .enable()
                .map_err(|e| Self::adapter_error(format!("cannot enable: {e}")))?;
            if !self.adapter.is_enabled() {
                return Err(Self::adapter_error("adapter stayed off after enabling".into()));
            }
        }

        let mut server = SwapServer::new(self.transport.clone(), self.files.clone());
        server.start()?;
        self.server = Some(server);
        Ok(())
    }

    fn tear_down(&mut self) {
        if let Some(mut server) = self.server.take() {
            server.stop();
        }
        if let Some(snapshot) = &self.snapshot {
            if !snapshot.was_enabled && self.adapter.is_enabled() {
                tracing::debug!("radio adapter was off before the swap, disabling it again");
                if let Err(e) = self.adapter.disable() {
                    tracing::warn!(error = %e, "cannot disable radio adapter");
                }
            }
        }
    }

    fn after_stopped(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            tracing::debug!(name = %snapshot.name, "restoring radio adapter name");
            if let Err(e) = self.adapter.set_name(&snapshot.name) {
                tracing::warn!(error = %e, "cannot restore radio adapter name");
            }
        }
    }

    fn announces_stopping(&self) -> bool {
        true
    }

    fn is_serial(&self) -> bool {
        true
    }

    fn is_alive(&self) -> bool {
        self.adapter.is_enabled() && self.server.as_ref().is_some_and(SwapServer::is_running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{StatusBus, SwapState, SwapStatus, SwapType};
    use crate::transport::TcpTransport;

    fn radio_swap(radio: &SoftRadio) -> SwapType<RadioSwap> {
        let root = std::env::temp_dir();
        let probe = radio.clone();
        let transport = TcpTransport::new("127.0.0.1:0".parse().unwrap()).gated_by(move || probe.is_enabled());
        SwapType::new(
            RadioSwap::new(Arc::new(radio.clone()), Arc::new(transport), FileServer::new(root)),
            Arc::new(StatusBus::new()),
        )
    }

    #[test]
    fn swap_tags_name_and_restores_adapter() {
        let radio = SoftRadio::new("Pixel", false);
        let swap = radio_swap(&radio);
        swap.start().unwrap();
        assert!(radio.is_enabled());
        assert_eq!(radio.name(), "AppSwap:Pixel");
        assert!(swap.with_transport(|t| t.locator()).is_some());

        swap.stop();
        assert!(!radio.is_enabled());
        assert_eq!(radio.name(), "Pixel");
        assert_eq!(swap.state(), SwapState::Stopped);
    }

    #[test]
    fn adapter_left_on_when_it_was_on() {
        let radio = SoftRadio::new("Pixel", true);
        let swap = radio_swap(&radio);
        swap.start().unwrap();
        swap.stop();
        assert!(radio.is_enabled());
        assert_eq!(radio.name(), "Pixel");
    }

    #[test]
    fn already_tagged_name_is_not_tagged_twice() {
        let radio = SoftRadio::new("AppSwap:Pixel", true);
        let swap = radio_swap(&radio);
        swap.start().unwrap();
        assert_eq!(radio.name(), "AppSwap:Pixel");
        swap.stop();
    }

    #[test]
    fn radio_swap_announces_stopping() {
        let radio = SoftRadio::new("Pixel", true);
        let bus = Arc::new(StatusBus::new());
        let rx = bus.subscribe();
        let probe = radio.clone();
        let transport = TcpTransport::new("127.0.0.1:0".parse().unwrap()).gated_by(move || probe.is_enabled());
        let swap = SwapType::new(
            RadioSwap::new(Arc::new(radio.clone()), Arc::new(transport), FileServer::new(std::env::temp_dir())),
            bus,
        );
        swap.start_in_background();
        assert!(swap.is_connected());
        swap.stop();
        let seen: Vec<SwapStatus> = rx.try_iter().map(|e| e.status).collect();
        assert_eq!(
            seen,
            vec![SwapStatus::Starting, SwapStatus::Started, SwapStatus::Stopping, SwapStatus::Stopped]
        );
    }
}
