//! Network transport layer: signaling connections and viewer media.
//!
//! The server uses a split transport model:
//!
//! - **TCP** ([`tcp`]): carries line-delimited signaling. One TCP
//!   connection per viewer, with a reader and a writer thread each.
//!
//! - **Peer transports** ([`PeerTransport`]): carry media to and from one
//!   viewer. The engine behind them owns negotiation and congestion
//!   estimation; the core only sends [`EncodedFrame`]s, reads the
//!   [`EstimateHandle`] it was given, and reacts to [`TransportEvent`]s.
//!   [`udp`] is the reference engine.

pub mod tcp;
pub mod udp;

use std::sync::Arc;

use crate::error::Result;
use crate::media::EncodedFrame;
use crate::session::EstimateHandle;

pub use udp::{UdpPeerTransport, UdpTransportFactory};

/// Something the transport engine reports about one viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The media path is up; the viewer becomes ready.
    Connected,
    /// The transport is unusable; the session must be torn down.
    Failed(String),
    /// A local candidate to forward to the viewer.
    LocalCandidate(String),
    /// One chunk of the viewer's upstream track (body after the type tag).
    InboundChunk(Vec<u8>),
}

/// Callback receiving a transport's events, invoked on the engine's threads.
pub type EventHandler = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// The transport engine's view of one viewer.
pub trait PeerTransport: Send + Sync {
    /// Session description to offer the viewer.
    fn create_offer(&self) -> Result<String>;

    /// Apply the viewer's answer.
    fn apply_answer(&self, answer: &str) -> Result<()>;

    /// Apply a candidate the viewer gathered.
    fn add_remote_candidate(&self, candidate: &str) -> Result<()>;

    /// Transmit one frame. Errors are fatal for the session.
    fn send(&self, frame: &EncodedFrame) -> Result<()>;

    /// Stop all I/O. Must be idempotent and must not block on the engine's
    /// own threads, since it can be called from them.
    fn close(&self);
}

/// Opens a [`PeerTransport`] for a new session.
pub trait TransportFactory: Send + Sync {
    /// `estimate` is the session's handle; the engine is its only writer.
    fn open(
        &self,
        session_id: u64,
        estimate: EstimateHandle,
        events: EventHandler,
    ) -> Result<Arc<dyn PeerTransport>>;
}
