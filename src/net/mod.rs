//! Network replication of cell feeds.
//!
//! Peers talk to a relay over a byte stream: newline-delimited JSON
//! [`ControlMessage`]s during the handshake, then binary [`wire`] frames.

pub mod control;
pub mod remote;
pub mod transport;
pub mod wire;

pub use control::{ControlMessage, ObserverInfo, WorldParameters};
pub use remote::{ObserverStates, RemoteEditFeed, RemoteFeedFactory, RemoteHub};
pub use transport::{ConnectOptions, EventSink, TcpTransport, Transport, TransportEvent};
pub use wire::{decode_frame, encode_frame, Frame, FrameReader, MessageKind, ObserverBatch};
