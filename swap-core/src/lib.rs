//! App Swap protocol engine.
//!
//! Two nearby devices exchange an app repository directly: one runs a `SwapServer` that answers
//! the minimal httpish protocol from a web root, the other talks to it with `SwapClient`.
//! `SwapType` drives each transport through its start/stop lifecycle and `SwapSession` ties the
//! transports, their status notifications and the discovered peers together.

pub mod client;
pub mod connection;
pub mod file_details;
pub mod lifecycle;
pub mod mime;
pub mod peer;
pub mod protocol;
pub mod radio;
pub mod request;
pub mod response;
pub mod serve;
pub mod server;
pub mod session;
pub mod transport;

pub use client::{DownloadError, DownloadOutcome, Progress, SwapClient};
pub use connection::{Connection, ConnectionHandle};
pub use file_details::FileDetails;
pub use lifecycle::{
    BackgroundTask, StatusBus, StatusEvent, SwapControl, SwapError, SwapState, SwapStatus, SwapTransport, SwapType,
    TransportKind,
};
pub use mime::{MimeRegistry, StaticMimeRegistry};
pub use peer::{Fingerprint, Peer, PeerOrigin, PeerSet};
pub use protocol::{Headers, HttpishError, Method, PROTOCOL_VERSION};
pub use radio::{RadioAdapter, RadioSwap, SoftRadio, SWAP_NAME_TAG};
pub use request::Request;
pub use response::{Delivery, Response};
pub use serve::{FileServer, ServeError};
pub use server::{ServerError, SwapServer};
pub use session::SwapSession;
pub use transport::{Listener, ServiceRecord, StreamSocket, TcpTransport, Transport, SERVICE_NAME, SERVICE_UUID};
