//! Session event queue types
//!
//! Both collaborators deliver their callbacks as tagged events on a
//! single queue; the orchestrator consumes them one at a time, which
//! makes the required causal ordering explicit without locking.

use crate::negotiation::{IceState, PeerHandle, RemoteStream};
use crate::signaling::{IceCandidate, Notification, ResponsePayload, ServerError};

/// Any event delivered to the orchestrator.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Event from the signaling channel
    Signaling(SignalingEvent),
    /// Event from the negotiation engine
    Negotiation(NegotiationEvent),
    /// Periodic timer tick used for request deadline expiry
    Tick,
}

/// Events emitted by the signaling channel.
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// Transport established; requests may now be sent
    Connected,
    /// Response to an outstanding request
    Response {
        request_id: u64,
        result: Result<ResponsePayload, ServerError>,
    },
    /// Unsolicited room notification
    Notification(Notification),
    /// Transport-level failure
    TransportError(String),
    /// Transport closed
    Disconnected,
}

/// Events emitted by the negotiation engine.
#[derive(Debug, Clone)]
pub enum NegotiationEvent {
    /// Local SDP offer generated for the given connection
    OfferReady { handle: PeerHandle, sdp: String },
    /// Local SDP answer generated for the given connection
    AnswerReady { handle: PeerHandle, sdp: String },
    /// Locally gathered ICE candidate
    LocalCandidate { handle: PeerHandle, candidate: IceCandidate },
    /// ICE connection state change
    ConnectionStateChanged { handle: PeerHandle, state: IceState },
    /// A remote media stream was added
    RemoteStreamAdded { stream: RemoteStream },
    /// A remote media stream was removed
    RemoteStreamRemoved { stream: RemoteStream },
    /// Engine-internal failure
    EngineError(String),
}
