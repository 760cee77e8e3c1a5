//! WebSocket signaling channel
//!
//! Client-side transport to the media room server. Outbound frames go
//! through an unbounded channel drained by a writer task; inbound
//! frames are parsed and delivered as events on the session queue.

use super::protocol::{ClientRequest, ServerMessage};
use super::SignalingPort;
use crate::session::events::{SessionEvent, SignalingEvent};
use crate::session::SessionError;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_tungstenite::tungstenite::protocol::Message;

/// WebSocket connection to the room server.
pub struct RoomChannel {
    /// Handshake deadline
    connect_timeout: Duration,
    /// Session event queue
    events: mpsc::UnboundedSender<SessionEvent>,
    /// Outbound frame queue; present while a connection task runs
    outbound: Option<mpsc::UnboundedSender<Message>>,
}

impl RoomChannel {
    pub fn new(connect_timeout: Duration, events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            connect_timeout,
            events,
            outbound: None,
        }
    }
}

impl SignalingPort for RoomChannel {
    fn connect(&mut self, server_address: &str) -> Result<(), SessionError> {
        if self.outbound.is_some() {
            return Err(SessionError::InvalidState(
                "signaling channel already connected".to_string(),
            ));
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Message>();
        self.outbound = Some(outbound_tx);

        let address = server_address.to_string();
        let timeout = self.connect_timeout;
        let events = self.events.clone();
        tokio::spawn(async move {
            run_connection(address, timeout, events, outbound_rx).await;
        });
        Ok(())
    }

    fn send_request(&mut self, request_id: u64, request: ClientRequest) -> Result<(), SessionError> {
        let outbound = self.outbound.as_ref().ok_or_else(|| {
            SessionError::Connection("signaling channel is not connected".to_string())
        })?;

        let frame = request.to_json(request_id)?;
        debug!("-> {} (id {})", request.method(), request_id);
        outbound
            .send(Message::Text(frame))
            .map_err(|_| SessionError::Connection("signaling channel closed".to_string()))
    }

    fn disconnect(&mut self) {
        if let Some(outbound) = self.outbound.take() {
            // The writer forwards the close frame, then the reader sees
            // the stream end and the tasks wind down.
            let _ = outbound.send(Message::Close(None));
        }
    }
}

async fn run_connection(
    address: String,
    connect_timeout: Duration,
    events: mpsc::UnboundedSender<SessionEvent>,
    mut outbound_rx: mpsc::UnboundedReceiver<Message>,
) {
    info!("Connecting to room server at {}", address);
    let connect = tokio_tungstenite::connect_async(address.as_str());
    let ws_stream = match tokio::time::timeout(connect_timeout, connect).await {
        Ok(Ok((stream, _response))) => stream,
        Ok(Err(e)) => {
            let _ = events.send(SessionEvent::Signaling(SignalingEvent::TransportError(
                format!("WebSocket connect failed: {}", e),
            )));
            return;
        }
        Err(_) => {
            let _ = events.send(SessionEvent::Signaling(SignalingEvent::TransportError(
                format!("Connect to {} timed out", address),
            )));
            return;
        }
    };

    info!("WebSocket handshake completed for {}", address);
    let _ = events.send(SessionEvent::Signaling(SignalingEvent::Connected));

    let (write, mut read) = ws_stream.split();

    let writer_handle = tokio::spawn(async move {
        let mut write = write;
        while let Some(msg) = outbound_rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if write.send(msg).await.is_err() || closing {
                break;
            }
        }
        let _ = write.close().await;
    });

    while let Some(frame) = read.next().await {
        match frame {
            Ok(Message::Text(text)) => match ServerMessage::from_json(&text) {
                Ok(ServerMessage::Response { request_id, result }) => {
                    let _ = events.send(SessionEvent::Signaling(SignalingEvent::Response {
                        request_id,
                        result,
                    }));
                }
                Ok(ServerMessage::Notification(notification)) => {
                    let _ = events.send(SessionEvent::Signaling(SignalingEvent::Notification(
                        notification,
                    )));
                }
                Err(e) => {
                    // Malformed frames are dropped, never fatal.
                    warn!("Discarding inbound frame: {}", e);
                }
            },
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                debug!("Server closed the WebSocket");
                break;
            }
            Ok(other) => {
                warn!("Unexpected non-text frame: {:?}", other);
            }
            Err(e) => {
                let _ = events.send(SessionEvent::Signaling(SignalingEvent::TransportError(
                    format!("WebSocket read failed: {}", e),
                )));
                writer_handle.abort();
                return;
            }
        }
    }

    let _ = events.send(SessionEvent::Signaling(SignalingEvent::Disconnected));
    writer_handle.abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNREACHABLE: &str = "ws://127.0.0.1:9";

    fn channel() -> (RoomChannel, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (RoomChannel::new(Duration::from_secs(1), tx), rx)
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let (mut ch, _rx) = channel();
        let err = ch
            .send_request(1, ClientRequest::LeaveRoom)
            .unwrap_err();
        assert!(matches!(err, SessionError::Connection(_)));
    }

    #[tokio::test]
    async fn test_double_connect_rejected() {
        let (mut ch, _rx) = channel();
        ch.connect(UNREACHABLE).unwrap();
        assert!(matches!(ch.connect(UNREACHABLE), Err(SessionError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_disconnect_without_connect_is_noop() {
        let (mut ch, _rx) = channel();
        ch.disconnect();
        ch.disconnect();
    }

    #[tokio::test]
    async fn test_failed_connect_reports_transport_error() {
        let (mut ch, mut rx) = channel();
        ch.connect(UNREACHABLE).unwrap();
        match rx.recv().await {
            Some(SessionEvent::Signaling(SignalingEvent::TransportError(_))) => {}
            other => panic!("Expected TransportError, got {:?}", other),
        }
    }
}
