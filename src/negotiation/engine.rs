//! webrtc-rs backed negotiation engine
//!
//! Owns the peer connections and the API object they are built from.
//! Handles are allocated synchronously so the orchestrator can route
//! remote candidates while the connection itself is still being set up
//! asynchronously; candidates arriving in that window are queued per
//! handle and drained once the connection exists.

use super::{IceState, NegotiationPort, PeerHandle, RemoteStream, StreamKind, StreamRenderer};
use crate::config::{MediaConfig, VideoCodec};
use crate::session::events::{NegotiationEvent, SessionEvent};
use crate::session::SessionError;
use crate::signaling::IceCandidate;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_VP8, MIME_TYPE_VP9};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_remote::TrackRemote;

impl From<RTCIceConnectionState> for IceState {
    fn from(state: RTCIceConnectionState) -> Self {
        match state {
            RTCIceConnectionState::New => IceState::New,
            RTCIceConnectionState::Checking => IceState::Checking,
            RTCIceConnectionState::Connected => IceState::Connected,
            RTCIceConnectionState::Completed => IceState::Completed,
            RTCIceConnectionState::Failed => IceState::Failed,
            RTCIceConnectionState::Disconnected => IceState::Disconnected,
            RTCIceConnectionState::Closed => IceState::Closed,
            RTCIceConnectionState::Unspecified => IceState::New,
        }
    }
}

/// State held per peer connection.
struct PeerSlot {
    /// None while asynchronous setup is still running
    connection: Option<Arc<RTCPeerConnection>>,
    /// Remote candidates received before the connection existed
    queued_candidates: Vec<IceCandidate>,
    /// Remote tracks by id, for renderer attachment
    remote_tracks: HashMap<String, Arc<TrackRemote>>,
}

struct EngineInner {
    events: mpsc::UnboundedSender<SessionEvent>,
    api: Mutex<Option<Arc<API>>>,
    stun_servers: Mutex<Vec<String>>,
    peers: Mutex<HashMap<PeerHandle, PeerSlot>>,
    next_handle: AtomicU64,
}

/// Negotiation engine backed by webrtc-rs.
#[derive(Clone)]
pub struct WebRtcEngine {
    inner: Arc<EngineInner>,
}

impl WebRtcEngine {
    pub fn new(events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                events,
                api: Mutex::new(None),
                stun_servers: Mutex::new(Vec::new()),
                peers: Mutex::new(HashMap::new()),
                next_handle: AtomicU64::new(1),
            }),
        }
    }

    /// Attach a renderer to a previously announced remote stream. RTP
    /// payloads are forwarded until the track ends.
    pub fn attach_renderer(
        &self,
        handle: PeerHandle,
        stream_id: &str,
        renderer: Arc<dyn StreamRenderer>,
    ) -> Result<(), SessionError> {
        let track = {
            let peers = self.inner.peers.lock().unwrap();
            peers
                .get(&handle)
                .and_then(|slot| slot.remote_tracks.get(stream_id).cloned())
                .ok_or_else(|| {
                    SessionError::InvalidState(format!("no remote stream '{}' on {}", stream_id, handle))
                })?
        };

        let id = stream_id.to_string();
        tokio::spawn(async move {
            loop {
                match track.read_rtp().await {
                    Ok((packet, _attributes)) => renderer.render_rtp(&packet.payload),
                    Err(e) => {
                        debug!("Remote stream '{}' ended: {}", id, e);
                        break;
                    }
                }
            }
        });
        Ok(())
    }
}

impl NegotiationPort for WebRtcEngine {
    fn initialize(&mut self, config: &MediaConfig) -> Result<(), SessionError> {
        let mut media_engine = MediaEngine::default();
        register_codecs(&mut media_engine, config.video_codec)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| SessionError::Negotiation(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        *self.inner.api.lock().unwrap() = Some(Arc::new(api));
        *self.inner.stun_servers.lock().unwrap() = config.stun_servers.clone();
        info!("Negotiation engine initialized ({} codec)", config.video_codec.as_str());
        Ok(())
    }

    fn generate_offer(&mut self, stream_label: &str, publisher: bool) -> Result<PeerHandle, SessionError> {
        let api = self
            .inner
            .api
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| SessionError::InvalidState("negotiation engine not initialized".to_string()))?;

        let handle = PeerHandle(self.inner.next_handle.fetch_add(1, Ordering::SeqCst));
        self.inner.peers.lock().unwrap().insert(
            handle,
            PeerSlot {
                connection: None,
                queued_candidates: Vec::new(),
                remote_tracks: HashMap::new(),
            },
        );
        debug!("Allocated {} for stream '{}'", handle, stream_label);

        let inner = self.inner.clone();
        tokio::spawn(async move {
            if let Err(e) = setup_connection(&inner, api, handle, publisher).await {
                let _ = inner.events.send(SessionEvent::Negotiation(NegotiationEvent::EngineError(
                    format!("Offer generation on {} failed: {}", handle, e),
                )));
            }
        });
        Ok(handle)
    }

    fn generate_answer(&mut self, handle: PeerHandle, remote_sdp: &str) -> Result<(), SessionError> {
        let connection = self.connection(handle)?;
        let offer = RTCSessionDescription::offer(remote_sdp.to_string())
            .map_err(|e| SessionError::Negotiation(format!("Invalid remote offer: {}", e)))?;

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let result = async {
                connection.set_remote_description(offer).await?;
                let answer = connection.create_answer(None).await?;
                connection.set_local_description(answer.clone()).await?;
                Ok::<_, webrtc::Error>(answer)
            }
            .await;

            let event = match result {
                Ok(answer) => NegotiationEvent::AnswerReady {
                    handle,
                    sdp: answer.sdp,
                },
                Err(e) => NegotiationEvent::EngineError(format!("Answer generation on {} failed: {}", handle, e)),
            };
            let _ = inner.events.send(SessionEvent::Negotiation(event));
        });
        Ok(())
    }

    fn process_remote_answer(&mut self, handle: PeerHandle, sdp: &str) -> Result<(), SessionError> {
        let connection = self.connection(handle)?;
        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| SessionError::Negotiation(format!("Invalid remote answer: {}", e)))?;

        let inner = self.inner.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.set_remote_description(answer).await {
                let _ = inner.events.send(SessionEvent::Negotiation(NegotiationEvent::EngineError(
                    format!("Applying remote answer on {} failed: {}", handle, e),
                )));
            }
        });
        Ok(())
    }

    fn add_remote_candidate(&mut self, handle: PeerHandle, candidate: IceCandidate) -> Result<(), SessionError> {
        candidate.validate()?;

        let connection = {
            let mut peers = self.inner.peers.lock().unwrap();
            let slot = peers
                .get_mut(&handle)
                .ok_or_else(|| SessionError::InvalidState(format!("unknown connection {}", handle)))?;
            match slot.connection.clone() {
                Some(connection) => connection,
                None => {
                    debug!("Queueing remote candidate for {} during setup", handle);
                    slot.queued_candidates.push(candidate);
                    return Ok(());
                }
            }
        };

        let inner = self.inner.clone();
        tokio::spawn(async move {
            apply_candidate(&inner, &connection, handle, candidate).await;
        });
        Ok(())
    }

    fn close(&mut self) {
        let slots: Vec<PeerSlot> = self.inner.peers.lock().unwrap().drain().map(|(_, s)| s).collect();
        for slot in slots {
            if let Some(connection) = slot.connection {
                tokio::spawn(async move {
                    if let Err(e) = connection.close().await {
                        warn!("Error closing peer connection: {}", e);
                    }
                });
            }
        }
    }
}

impl WebRtcEngine {
    fn connection(&self, handle: PeerHandle) -> Result<Arc<RTCPeerConnection>, SessionError> {
        self.inner
            .peers
            .lock()
            .unwrap()
            .get(&handle)
            .and_then(|slot| slot.connection.clone())
            .ok_or_else(|| SessionError::InvalidState(format!("no established connection for {}", handle)))
    }
}

async fn setup_connection(
    inner: &Arc<EngineInner>,
    api: Arc<API>,
    handle: PeerHandle,
    publisher: bool,
) -> Result<(), SessionError> {
    let stun_servers = inner.stun_servers.lock().unwrap().clone();
    let rtc_config = RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: stun_servers,
            ..Default::default()
        }],
        ..Default::default()
    };

    let connection = Arc::new(
        api.new_peer_connection(rtc_config)
            .await
            .map_err(|e| SessionError::Negotiation(format!("Failed to create peer connection: {}", e)))?,
    );

    let events = inner.events.clone();
    connection.on_ice_candidate(Box::new(move |candidate| {
        let events = events.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    let candidate = IceCandidate::new(
                        init.candidate,
                        init.sdp_mid.unwrap_or_default(),
                        init.sdp_mline_index.unwrap_or(0),
                    );
                    let _ = events.send(SessionEvent::Negotiation(NegotiationEvent::LocalCandidate {
                        handle,
                        candidate,
                    }));
                }
                Err(e) => warn!("Failed to serialize local candidate: {}", e),
            }
        })
    }));

    let events = inner.events.clone();
    connection.on_ice_connection_state_change(Box::new(move |state| {
        let events = events.clone();
        Box::pin(async move {
            let _ = events.send(SessionEvent::Negotiation(NegotiationEvent::ConnectionStateChanged {
                handle,
                state: state.into(),
            }));
        })
    }));

    let track_inner = inner.clone();
    connection.on_track(Box::new(move |track, _receiver, _transceiver| {
        let inner = track_inner.clone();
        Box::pin(async move {
            let kind = match track.kind() {
                RTPCodecType::Audio => StreamKind::Audio,
                _ => StreamKind::Video,
            };
            let stream = RemoteStream {
                handle,
                id: track.id(),
                kind,
            };
            if let Some(slot) = inner.peers.lock().unwrap().get_mut(&handle) {
                slot.remote_tracks.insert(stream.id.clone(), track);
            }
            let _ = inner.events.send(SessionEvent::Negotiation(NegotiationEvent::RemoteStreamAdded {
                stream,
            }));
        })
    }));

    let direction = if publisher {
        RTCRtpTransceiverDirection::Sendonly
    } else {
        RTCRtpTransceiverDirection::Recvonly
    };
    for kind in [RTPCodecType::Video, RTPCodecType::Audio] {
        connection
            .add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction,
                    send_encodings: Vec::new(),
                }),
            )
            .await
            .map_err(|e| SessionError::Negotiation(format!("Failed to add transceiver: {}", e)))?;
    }

    let offer = connection
        .create_offer(None)
        .await
        .map_err(|e| SessionError::Negotiation(format!("Failed to create offer: {}", e)))?;
    connection
        .set_local_description(offer.clone())
        .await
        .map_err(|e| SessionError::Negotiation(format!("Failed to set local description: {}", e)))?;

    // Publish the connection, then drain candidates queued during setup.
    // The lock is released before any await on the connection.
    let queued = {
        let mut peers = inner.peers.lock().unwrap();
        peers.get_mut(&handle).map(|slot| {
            slot.connection = Some(connection.clone());
            std::mem::take(&mut slot.queued_candidates)
        })
    };
    let Some(queued) = queued else {
        // The session was torn down while setup ran.
        let _ = connection.close().await;
        return Ok(());
    };
    if !queued.is_empty() {
        debug!("Draining {} queued candidates on {}", queued.len(), handle);
    }
    for candidate in queued {
        apply_candidate(inner, &connection, handle, candidate).await;
    }

    let _ = inner.events.send(SessionEvent::Negotiation(NegotiationEvent::OfferReady {
        handle,
        sdp: offer.sdp,
    }));
    Ok(())
}

async fn apply_candidate(
    inner: &Arc<EngineInner>,
    connection: &Arc<RTCPeerConnection>,
    handle: PeerHandle,
    candidate: IceCandidate,
) {
    let init = RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: Some(candidate.sdp_mid),
        sdp_mline_index: Some(candidate.sdp_mline_index),
        username_fragment: None,
    };
    if let Err(e) = connection.add_ice_candidate(init).await {
        let _ = inner.events.send(SessionEvent::Negotiation(NegotiationEvent::EngineError(
            format!("Failed to apply remote candidate on {}: {}", handle, e),
        )));
    }
}

fn register_codecs(media_engine: &mut MediaEngine, codec: VideoCodec) -> Result<(), SessionError> {
    let (mime_type, payload_type, fmtp) = match codec {
        VideoCodec::H264 => (
            MIME_TYPE_H264,
            96,
            "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f",
        ),
        VideoCodec::VP8 => (MIME_TYPE_VP8, 97, ""),
        VideoCodec::VP9 => (MIME_TYPE_VP9, 98, "profile-id=0"),
    };

    media_engine
        .register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: mime_type.to_string(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line: fmtp.to_string(),
                    rtcp_feedback: vec![],
                },
                payload_type,
                ..Default::default()
            },
            RTPCodecType::Video,
        )
        .map_err(|e| SessionError::Negotiation(format!("Failed to register {}: {}", codec.as_str(), e)))?;

    media_engine
        .register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_string(),
                    clock_rate: 48000,
                    channels: 2,
                    sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                    rtcp_feedback: vec![],
                },
                payload_type: 111,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )
        .map_err(|e| SessionError::Negotiation(format!("Failed to register opus: {}", e)))?;

    Ok(())
}
