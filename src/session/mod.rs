//! Session lifecycle and orchestration
//!
//! This module owns the session state machine that coordinates the
//! signaling channel and the negotiation engine:
//! - Session state tracking and transitions
//! - Request correlation and timeouts
//! - Error taxonomy and the UI-facing observer surface

pub mod events;
pub mod orchestrator;

pub use orchestrator::SessionOrchestrator;

use crate::negotiation::RemoteStream;
use std::error::Error;
use std::fmt;

/// Session state along the establishment lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session in progress
    Idle,
    /// Signaling channel connecting
    Connecting,
    /// Join request outstanding
    Joining,
    /// Room membership confirmed
    Joined,
    /// SDP offer being generated
    Offering,
    /// Publish request outstanding
    Publishing,
    /// Media session established
    Active,
    /// Teardown in progress
    Closing,
    /// Unrecoverable failure, resources released
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Joining => "joining",
            SessionState::Joined => "joined",
            SessionState::Offering => "offering",
            SessionState::Publishing => "publishing",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse error classification surfaced to the observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connection,
    JoinRejected,
    PublishRejected,
    RequestTimeout,
    Negotiation,
    ProtocolViolation,
    AlreadyActive,
    InvalidState,
}

/// Session-level errors
#[derive(Debug)]
pub enum SessionError {
    /// Signaling channel failed to connect or dropped
    Connection(String),
    /// Server rejected the join request
    JoinRejected(String),
    /// Server rejected the publish request
    PublishRejected(String),
    /// No response within the request deadline
    RequestTimeout(String),
    /// The negotiation engine reported an internal failure
    Negotiation(String),
    /// An event arrived that is invalid for the current state or malformed
    ProtocolViolation(String),
    /// A session is already in progress
    AlreadyActive,
    /// Operation invalid for the component's current state
    InvalidState(String),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Connection(_) => ErrorKind::Connection,
            SessionError::JoinRejected(_) => ErrorKind::JoinRejected,
            SessionError::PublishRejected(_) => ErrorKind::PublishRejected,
            SessionError::RequestTimeout(_) => ErrorKind::RequestTimeout,
            SessionError::Negotiation(_) => ErrorKind::Negotiation,
            SessionError::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
            SessionError::AlreadyActive => ErrorKind::AlreadyActive,
            SessionError::InvalidState(_) => ErrorKind::InvalidState,
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Connection(msg) => write!(f, "Connection error: {}", msg),
            SessionError::JoinRejected(msg) => write!(f, "Join rejected: {}", msg),
            SessionError::PublishRejected(msg) => write!(f, "Publish rejected: {}", msg),
            SessionError::RequestTimeout(msg) => write!(f, "Request timed out: {}", msg),
            SessionError::Negotiation(msg) => write!(f, "Negotiation error: {}", msg),
            SessionError::ProtocolViolation(msg) => write!(f, "Protocol violation: {}", msg),
            SessionError::AlreadyActive => write!(f, "A session is already active"),
            SessionError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
        }
    }
}

impl Error for SessionError {}

/// UI-facing callback surface.
///
/// The orchestrator invokes these from its single event-processing
/// path; implementations must not block.
pub trait SessionObserver: Send {
    /// Session state transition.
    fn on_session_state_changed(&self, _state: SessionState) {}

    /// A remote media stream is ready; the collaborator may attach a renderer.
    fn on_remote_stream_ready(&self, _stream: &RemoteStream) {}

    /// Exactly one callback per fatal session error.
    fn on_session_error(&self, _kind: ErrorKind, _detail: &str) {}

    /// Another participant joined the room; informational.
    fn on_participant_joined(&self, _id: &str) {}

    /// A participant left the room; informational.
    fn on_participant_left(&self, _name: &str) {}
}

/// Observer that ignores every callback.
pub struct NullObserver;

impl SessionObserver for NullObserver {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_classification() {
        assert_eq!(SessionError::AlreadyActive.kind(), ErrorKind::AlreadyActive);
        assert_eq!(
            SessionError::JoinRejected("room full".to_string()).kind(),
            ErrorKind::JoinRejected
        );
        assert_eq!(
            SessionError::RequestTimeout("join".to_string()).kind(),
            ErrorKind::RequestTimeout
        );
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::Offering.to_string(), "offering");
        assert_eq!(SessionState::Idle.as_str(), "idle");
    }
}
