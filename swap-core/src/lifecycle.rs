//! Transport lifecycle: the start/stop state machine shared by every swap type, and the
//! status notifications it publishes.

use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use serde::{Deserialize, Serialize};

use crate::server::ServerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Radio,
    Wifi,
}

impl TransportKind {
    /// Notification channel carrying this transport's status changes.
    pub fn channel(self) -> &'static str {
        match self {
            TransportKind::Radio => "swap.radio.status",
            TransportKind::Wifi => "swap.wifi.status",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportKind::Radio => "radio",
            TransportKind::Wifi => "wifi",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapState {
    Stopped,
    Starting,
    Connected,
    Stopping,
}

/// Published on a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapStatus {
    Starting,
    Started,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusEvent {
    pub channel: &'static str,
    pub kind: TransportKind,
    pub status: SwapStatus,
}

/// Process-local fire-and-forget pub/sub for status events. Subscribers that went away are
/// dropped on the next publish.
#[derive(Debug, Default)]
pub struct StatusBus {
    subscribers: Mutex<Vec<Sender<StatusEvent>>>,
}

impl StatusBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<StatusEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        lock(&self.subscribers).push(tx);
        rx
    }

    pub fn publish(&self, kind: TransportKind, status: SwapStatus) {
        let event = StatusEvent {
            channel: kind.channel(),
            kind,
            status,
        };
        tracing::debug!(channel = event.channel, ?status, "swap status");
        lock(&self.subscribers).retain(|tx| tx.send(event).is_ok());
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SwapError {
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error("{kind} adapter: {message}")]
    Adapter { kind: TransportKind, message: String },
    #[error("{kind} transport failed to come up: {source}")]
    BringUp {
        kind: TransportKind,
        #[source]
        source: io::Error,
    },
    #[error("cannot spawn background task: {0}")]
    Spawn(#[source] io::Error),
    #[error("background task ended without reporting a result")]
    TaskLost,
}

/// Transport-specific half of a swap type. `SwapType` serializes all calls.
pub trait SwapTransport: Send + 'static {
    fn kind(&self) -> TransportKind;

    /// Bring the transport online and start serving. On error `SwapType` tears it down and
    /// runs the post-stop hook.
    fn bring_up(&mut self) -> Result<(), SwapError>;

    /// Release everything `bring_up` acquired. Must tolerate being called when nothing is up.
    fn tear_down(&mut self);

    /// Runs after every stop, once the transport is down.
    fn after_stopped(&mut self) {}

    /// Whether `Stopping` is published before tear-down.
    fn announces_stopping(&self) -> bool {
        false
    }

    /// Serial transports run start/stop on the caller's thread even when asked to run in the
    /// background.
    fn is_serial(&self) -> bool {
        false
    }

    /// Still serving; false once the medium went away underneath us.
    fn is_alive(&self) -> bool;
}

/// Completion of a start or stop that may run on another thread.
#[derive(Debug)]
pub struct BackgroundTask {
    result: Receiver<Result<(), SwapError>>,
}

impl BackgroundTask {
    fn completed(result: Result<(), SwapError>) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let _ = tx.send(result);
        Self { result: rx }
    }

    fn spawn(name: &str, job: impl FnOnce() -> Result<(), SwapError> + Send + 'static) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let spawned = thread::Builder::new().name(name.to_string()).spawn(move || {
            let _ = tx.send(job());
        });
        match spawned {
            Ok(_) => Self { result: rx },
            Err(e) => Self::completed(Err(SwapError::Spawn(e))),
        }
    }

    /// Block until the task finishes.
    pub fn wait(self) -> Result<(), SwapError> {
        self.result.recv().unwrap_or(Err(SwapError::TaskLost))
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<(), SwapError>> {
        match self.result.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(SwapError::TaskLost)),
        }
    }

    /// Result if already finished.
    pub fn try_result(&self) -> Option<Result<(), SwapError>> {
        match self.result.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(SwapError::TaskLost)),
        }
    }
}

/// Object-safe view of a swap type, for the session coordinator.
pub trait SwapControl: Send + Sync {
    fn kind(&self) -> TransportKind;
    fn state(&self) -> SwapState;
    fn is_connected(&self) -> bool;
    fn start(&self) -> Result<(), SwapError>;
    fn stop(&self);
    fn start_in_background(&self) -> BackgroundTask;
    fn stop_in_background(&self) -> BackgroundTask;
}

struct Inner<T> {
    kind: TransportKind,
    /// Held for the whole of a start or stop.
    transport: Mutex<T>,
    state: Mutex<SwapState>,
    bus: Arc<StatusBus>,
}

/// Lifecycle wrapper around one transport. Cheap to clone; clones share state.
pub struct SwapType<T: SwapTransport> {
    inner: Arc<Inner<T>>,
}

impl<T: SwapTransport> Clone for SwapType<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: SwapTransport> SwapType<T> {
    pub fn new(transport: T, bus: Arc<StatusBus>) -> Self {
        Self {
            inner: Arc::new(Inner {
                kind: transport.kind(),
                transport: Mutex::new(transport),
                state: Mutex::new(SwapState::Stopped),
                bus,
            }),
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.inner.kind
    }

    pub fn state(&self) -> SwapState {
        *lock(&self.inner.state)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SwapState::Connected
    }

    /// Run `f` with the transport locked, outside any lifecycle transition.
    pub fn with_transport<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut lock(&self.inner.transport))
    }

    /// Bring the transport up. A no-op while connected and alive.
    pub fn start(&self) -> Result<(), SwapError> {
        let inner = &self.inner;
        let mut transport = lock(&inner.transport);
        {
            let mut state = lock(&inner.state);
            if *state == SwapState::Connected && transport.is_alive() {
                return Ok(());
            }
            *state = SwapState::Starting;
        }
        tracing::info!(transport = %inner.kind, "starting swap");
        inner.bus.publish(inner.kind, SwapStatus::Starting);

        match transport.bring_up() {
            Ok(()) => {
                *lock(&inner.state) = SwapState::Connected;
                inner.bus.publish(inner.kind, SwapStatus::Started);
                tracing::info!(transport = %inner.kind, "swap started");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(transport = %inner.kind, error = %e, "swap failed to start");
                transport.tear_down();
                transport.after_stopped();
                *lock(&inner.state) = SwapState::Stopped;
                inner.bus.publish(inner.kind, SwapStatus::Stopped);
                Err(e)
            }
        }
    }

    /// Tear the transport down and run the post-stop hook, whatever state it is in.
    /// `Stopped` is published only when leaving a non-stopped state.
    pub fn stop(&self) {
        let inner = &self.inner;
        let mut transport = lock(&inner.transport);
        let was_stopped = {
            let mut state = lock(&inner.state);
            let was_stopped = *state == SwapState::Stopped;
            if !was_stopped && transport.announces_stopping() {
                *state = SwapState::Stopping;
            }
            was_stopped
        };
        if !was_stopped && transport.announces_stopping() {
            inner.bus.publish(inner.kind, SwapStatus::Stopping);
        }

        transport.tear_down();
        transport.after_stopped();

        *lock(&inner.state) = SwapState::Stopped;
        if !was_stopped {
            inner.bus.publish(inner.kind, SwapStatus::Stopped);
            tracing::info!(transport = %inner.kind, "swap stopped");
        }
    }

    pub fn start_in_background(&self) -> BackgroundTask {
        if lock(&self.inner.transport).is_serial() {
            return BackgroundTask::completed(self.start());
        }
        let this = self.clone();
        BackgroundTask::spawn("swap-start", move || this.start())
    }

    pub fn stop_in_background(&self) -> BackgroundTask {
        if lock(&self.inner.transport).is_serial() {
            self.stop();
            return BackgroundTask::completed(Ok(()));
        }
        let this = self.clone();
        BackgroundTask::spawn("swap-stop", move || {
            this.stop();
            Ok(())
        })
    }
}

impl<T: SwapTransport> SwapControl for SwapType<T> {
    fn kind(&self) -> TransportKind {
        SwapType::kind(self)
    }

    fn state(&self) -> SwapState {
        SwapType::state(self)
    }

    fn is_connected(&self) -> bool {
        SwapType::is_connected(self)
    }

    fn start(&self) -> Result<(), SwapError> {
        SwapType::start(self)
    }

    fn stop(&self) {
        SwapType::stop(self)
    }

    fn start_in_background(&self) -> BackgroundTask {
        SwapType::start_in_background(self)
    }

    fn stop_in_background(&self) -> BackgroundTask {
        SwapType::stop_in_background(self)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
