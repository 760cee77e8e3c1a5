//! Room signaling protocol
//!
//! JSON-RPC 2.0 style messages exchanged with the media room server:
//! client requests (join, publish, ICE candidate), server responses
//! correlated by request id, and server notifications.

use crate::session::SessionError;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// An ICE candidate as carried on the wire.
///
/// The media-line index is numeric at this boundary; frames that carry
/// it as anything else fail to parse and are rejected as protocol
/// violations instead of propagating bad data into the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: String,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: u16,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>, sdp_mid: impl Into<String>, sdp_mline_index: u16) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: sdp_mid.into(),
            sdp_mline_index,
        }
    }

    /// Reject candidates that cannot possibly be applied.
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.candidate.trim().is_empty() {
            return Err(SessionError::ProtocolViolation(
                "ICE candidate with empty candidate string".to_string(),
            ));
        }
        Ok(())
    }
}

/// Requests sent by the client to the room server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    /// Join a room as a named participant.
    JoinRoom {
        user: String,
        room: String,
        webcam: bool,
    },
    /// Publish local media, carrying the SDP offer.
    PublishVideo {
        sdp_offer: String,
        loopback: bool,
    },
    /// Forward a locally gathered ICE candidate.
    OnIceCandidate {
        endpoint_name: String,
        candidate: IceCandidate,
    },
    /// Leave the room gracefully before disconnecting.
    LeaveRoom,
}

impl ClientRequest {
    /// Wire method name for this request.
    pub fn method(&self) -> &'static str {
        match self {
            ClientRequest::JoinRoom { .. } => "joinRoom",
            ClientRequest::PublishVideo { .. } => "publishVideo",
            ClientRequest::OnIceCandidate { .. } => "onIceCandidate",
            ClientRequest::LeaveRoom => "leaveRoom",
        }
    }

    /// Serialize as a JSON-RPC request frame with the given correlation id.
    pub fn to_json(&self, request_id: u64) -> Result<String, SessionError> {
        let params = match self {
            ClientRequest::JoinRoom { user, room, webcam } => json!({
                "user": user,
                "room": room,
                "webcamEnabled": webcam,
            }),
            ClientRequest::PublishVideo { sdp_offer, loopback } => json!({
                "sdpOffer": sdp_offer,
                "doLoopback": loopback,
            }),
            ClientRequest::OnIceCandidate { endpoint_name, candidate } => json!({
                "endpointName": endpoint_name,
                "candidate": candidate.candidate,
                "sdpMid": candidate.sdp_mid,
                "sdpMLineIndex": candidate.sdp_mline_index,
            }),
            ClientRequest::LeaveRoom => json!({}),
        };

        let frame = json!({
            "jsonrpc": "2.0",
            "id": request_id,
            "method": self.method(),
            "params": params,
        });

        serde_json::to_string(&frame)
            .map_err(|e| SessionError::ProtocolViolation(format!("Failed to serialize request: {}", e)))
    }
}

/// Error object attached to a rejected server response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    pub code: i64,
    pub message: String,
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// A participant already present in the room, reported in the join result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ExistingParticipant {
    #[serde(default)]
    pub id: String,
}

/// Successful response payload; fields depend on the request method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResponsePayload {
    /// Server-side session identifier, returned on join.
    #[serde(default)]
    pub session_id: Option<String>,
    /// SDP answer returned on publish.
    #[serde(default)]
    pub sdp_answer: Option<String>,
    /// Existing room participants, returned on join.
    #[serde(default)]
    pub value: Vec<ExistingParticipant>,
}

/// Asynchronous notifications pushed by the room server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    ParticipantJoined { id: String },
    ParticipantLeft { name: String },
    IceCandidate { endpoint_name: String, candidate: IceCandidate },
    MediaError { error: String },
}

/// Any inbound frame from the room server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// Response to an outstanding request, correlated by id.
    Response {
        request_id: u64,
        result: Result<ResponsePayload, ServerError>,
    },
    /// Unsolicited notification.
    Notification(Notification),
}

/// Raw JSON-RPC envelope used during parsing.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<serde_json::Value>,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<ServerError>,
}

impl ServerMessage {
    /// Parse an inbound signaling frame.
    pub fn from_json(text: &str) -> Result<Self, SessionError> {
        let envelope: Envelope = serde_json::from_str(text).map_err(|e| {
            SessionError::ProtocolViolation(format!("Invalid signaling frame: {}", e))
        })?;

        if let Some(request_id) = envelope.id {
            if let Some(error) = envelope.error {
                return Ok(ServerMessage::Response {
                    request_id,
                    result: Err(error),
                });
            }
            let payload = match envelope.result {
                Some(value) => serde_json::from_value(value).map_err(|e| {
                    SessionError::ProtocolViolation(format!("Invalid response payload: {}", e))
                })?,
                None => ResponsePayload::default(),
            };
            return Ok(ServerMessage::Response {
                request_id,
                result: Ok(payload),
            });
        }

        let method = envelope.method.ok_or_else(|| {
            SessionError::ProtocolViolation("Frame carries neither id nor method".to_string())
        })?;
        let params = envelope.params.unwrap_or_else(|| json!({}));
        Ok(ServerMessage::Notification(Self::parse_notification(&method, params)?))
    }

    fn parse_notification(method: &str, params: serde_json::Value) -> Result<Notification, SessionError> {
        match method {
            "participantJoined" => {
                #[derive(Deserialize)]
                struct Params {
                    id: String,
                }
                let p: Params = from_params(method, params)?;
                Ok(Notification::ParticipantJoined { id: p.id })
            }
            "participantLeft" => {
                #[derive(Deserialize)]
                struct Params {
                    name: String,
                }
                let p: Params = from_params(method, params)?;
                Ok(Notification::ParticipantLeft { name: p.name })
            }
            "iceCandidate" => {
                #[derive(Deserialize)]
                struct Params {
                    #[serde(rename = "endpointName", default)]
                    endpoint_name: String,
                    candidate: String,
                    #[serde(rename = "sdpMid")]
                    sdp_mid: String,
                    #[serde(rename = "sdpMLineIndex")]
                    sdp_mline_index: u16,
                }
                let p: Params = from_params(method, params)?;
                let candidate = IceCandidate::new(p.candidate, p.sdp_mid, p.sdp_mline_index);
                candidate.validate()?;
                Ok(Notification::IceCandidate {
                    endpoint_name: p.endpoint_name,
                    candidate,
                })
            }
            "mediaError" => {
                #[derive(Deserialize)]
                struct Params {
                    error: String,
                }
                let p: Params = from_params(method, params)?;
                Ok(Notification::MediaError { error: p.error })
            }
            other => Err(SessionError::ProtocolViolation(format!(
                "Unknown notification method: {}",
                other
            ))),
        }
    }
}

fn from_params<T: serde::de::DeserializeOwned>(
    method: &str,
    params: serde_json::Value,
) -> Result<T, SessionError> {
    serde_json::from_value(params).map_err(|e| {
        SessionError::ProtocolViolation(format!("Malformed {} params: {}", method, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_room_serialization() {
        let request = ClientRequest::JoinRoom {
            user: "alice".to_string(),
            room: "room1".to_string(),
            webcam: true,
        };
        let json = request.to_json(42).unwrap();
        assert!(json.contains("\"joinRoom\""));
        assert!(json.contains("\"id\":42"));
        assert!(json.contains("\"webcamEnabled\":true"));
    }

    #[test]
    fn test_publish_video_carries_sdp() {
        let request = ClientRequest::PublishVideo {
            sdp_offer: "v=0\r\n...".to_string(),
            loopback: false,
        };
        let json = request.to_json(7).unwrap();
        assert!(json.contains("sdpOffer"));
        assert!(json.contains("v=0"));
        assert!(json.contains("\"doLoopback\":false"));
    }

    #[test]
    fn test_parse_success_response() {
        let json = r#"{"id":42,"result":{"sessionId":"s1","value":[{"id":"bob"}]}}"#;
        let msg = ServerMessage::from_json(json).unwrap();
        match msg {
            ServerMessage::Response { request_id, result } => {
                assert_eq!(request_id, 42);
                let payload = result.unwrap();
                assert_eq!(payload.session_id.as_deref(), Some("s1"));
                assert_eq!(payload.value.len(), 1);
            }
            _ => panic!("Expected Response"),
        }
    }

    #[test]
    fn test_parse_error_response() {
        let json = r#"{"id":9,"error":{"code":104,"message":"room full"}}"#;
        let msg = ServerMessage::from_json(json).unwrap();
        match msg {
            ServerMessage::Response { request_id, result } => {
                assert_eq!(request_id, 9);
                let error = result.unwrap_err();
                assert_eq!(error.code, 104);
                assert_eq!(error.message, "room full");
            }
            _ => panic!("Expected Response"),
        }
    }

    #[test]
    fn test_parse_ice_candidate_notification() {
        let json = r#"{"method":"iceCandidate","params":{"endpointName":"bob","candidate":"candidate:1 1 UDP 1 10.0.0.1 5000 typ host","sdpMid":"0","sdpMLineIndex":0}}"#;
        let msg = ServerMessage::from_json(json).unwrap();
        match msg {
            ServerMessage::Notification(Notification::IceCandidate { endpoint_name, candidate }) => {
                assert_eq!(endpoint_name, "bob");
                assert_eq!(candidate.sdp_mline_index, 0);
            }
            _ => panic!("Expected IceCandidate notification"),
        }
    }

    #[test]
    fn test_string_mline_index_rejected() {
        // The original wire format carried the index as text; numeric is enforced here.
        let json = r#"{"method":"iceCandidate","params":{"endpointName":"bob","candidate":"c","sdpMid":"0","sdpMLineIndex":"0"}}"#;
        let err = ServerMessage::from_json(json).unwrap_err();
        assert!(matches!(err, SessionError::ProtocolViolation(_)));
    }

    #[test]
    fn test_empty_candidate_rejected() {
        let json = r#"{"method":"iceCandidate","params":{"endpointName":"bob","candidate":"  ","sdpMid":"0","sdpMLineIndex":0}}"#;
        assert!(ServerMessage::from_json(json).is_err());
    }

    #[test]
    fn test_unknown_method_rejected() {
        let json = r#"{"method":"unknownThing","params":{}}"#;
        assert!(ServerMessage::from_json(json).is_err());
    }

    #[test]
    fn test_participant_joined_notification() {
        let json = r#"{"method":"participantJoined","params":{"id":"carol"}}"#;
        let msg = ServerMessage::from_json(json).unwrap();
        assert_eq!(
            msg,
            ServerMessage::Notification(Notification::ParticipantJoined { id: "carol".to_string() })
        );
    }
}
