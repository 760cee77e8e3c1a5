//! roomlink - WebRTC media room client core
//!
//! Client-side session orchestration for media rooms: JSON-RPC room
//! signaling over WebSocket plus webrtc-rs peer negotiation, driven by
//! a single-queue session state machine.

pub mod config;
pub mod negotiation;
pub mod session;
pub mod signaling;

// Re-exports
pub use config::{Config, MediaConfig, VideoCodec};
pub use negotiation::{NegotiationPort, PeerHandle, RemoteStream, StreamRenderer, WebRtcEngine};
pub use session::events::SessionEvent;
pub use session::{SessionError, SessionObserver, SessionOrchestrator, SessionState};
pub use signaling::{RoomChannel, SignalingPort};
