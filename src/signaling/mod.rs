//! Room signaling
//!
//! Wire protocol types and the WebSocket client channel used to talk
//! to the media room server.

pub mod channel;
pub mod protocol;

pub use channel::RoomChannel;
pub use protocol::{
    ClientRequest, ExistingParticipant, IceCandidate, Notification, ResponsePayload, ServerError,
    ServerMessage,
};

use crate::session::SessionError;

/// Operations the orchestrator drives on the signaling channel.
///
/// All methods are non-blocking. Connection progress, responses and
/// notifications are delivered as
/// [`SignalingEvent`](crate::session::events::SignalingEvent)s on the
/// session queue. The channel gives at-most-once delivery per
/// request/response pair and no ordering guarantee across request ids;
/// callers must correlate by id, never by arrival order.
pub trait SignalingPort: Send {
    /// Begin establishing the transport to the given server URL.
    fn connect(&mut self, server_address: &str) -> Result<(), SessionError>;

    /// Send a request carrying the given correlation id.
    fn send_request(&mut self, request_id: u64, request: ClientRequest) -> Result<(), SessionError>;

    /// Close the transport; outstanding requests are abandoned.
    fn disconnect(&mut self);
}
