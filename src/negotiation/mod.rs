//! Peer-connection negotiation engine
//!
//! Abstracts SDP offer/answer generation, ICE candidate handling and
//! remote stream delivery behind `NegotiationPort`, with a
//! webrtc-rs backed implementation in [`engine`].

pub mod engine;

pub use engine::WebRtcEngine;

use crate::config::MediaConfig;
use crate::session::SessionError;
use crate::signaling::IceCandidate;
use std::fmt;

/// Opaque handle to a peer connection owned by the negotiation engine.
///
/// Allocated synchronously when an offer is requested so that remote
/// candidates can be routed before the underlying connection finishes
/// its asynchronous setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerHandle(pub u64);

impl fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// ICE connection state as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceState {
    New,
    Checking,
    Connected,
    Completed,
    Failed,
    Disconnected,
    Closed,
}

/// Kind of media carried by a remote stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Audio,
    Video,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Audio => "audio",
            StreamKind::Video => "video",
        }
    }
}

/// A remote media stream announced by the negotiation engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    /// Connection the stream belongs to
    pub handle: PeerHandle,
    /// Track identifier
    pub id: String,
    /// Media kind
    pub kind: StreamKind,
}

/// Sink for media packets of an attached remote stream.
///
/// Rendering itself is outside this crate; implementations typically
/// hand the packets to a decoder or display pipeline.
pub trait StreamRenderer: Send + Sync {
    fn render_rtp(&self, packet: &[u8]);
}

/// Operations the orchestrator drives on the negotiation engine.
///
/// All methods are non-blocking; completion and failures are delivered
/// as [`NegotiationEvent`](crate::session::events::NegotiationEvent)s
/// on the session queue.
pub trait NegotiationPort: Send {
    /// Prepare the engine with the given media configuration.
    fn initialize(&mut self, config: &MediaConfig) -> Result<(), SessionError>;

    /// Create a peer connection and start generating an SDP offer.
    ///
    /// Returns the connection handle immediately; the offer arrives as
    /// an `OfferReady` event, exactly once per invocation or an error
    /// event if generation fails. The engine never retries internally.
    fn generate_offer(&mut self, stream_label: &str, publisher: bool) -> Result<PeerHandle, SessionError>;

    /// Generate an SDP answer for a remote offer on an existing connection.
    fn generate_answer(&mut self, handle: PeerHandle, remote_sdp: &str) -> Result<(), SessionError>;

    /// Apply the remote SDP answer returned by the server for our offer.
    fn process_remote_answer(&mut self, handle: PeerHandle, sdp: &str) -> Result<(), SessionError>;

    /// Apply a remote ICE candidate to the given connection.
    fn add_remote_candidate(&mut self, handle: PeerHandle, candidate: IceCandidate) -> Result<(), SessionError>;

    /// Release every peer connection held by the engine.
    fn close(&mut self);
}
