//! Session orchestration state machine
//!
//! The orchestrator owns the session lifecycle and is the sole
//! consumer of events from both the signaling channel and the
//! negotiation engine. Each inbound event is translated into zero or
//! more outbound calls on the two collaborators while enforcing the
//! ordering invariants: an offer is generated only after room
//! membership is confirmed, and remote ICE candidates are applied only
//! once the peer connection exists (buffered otherwise).

use super::events::{NegotiationEvent, SessionEvent, SignalingEvent};
use super::{SessionError, SessionObserver, SessionState};
use crate::config::MediaConfig;
use crate::negotiation::{IceState, NegotiationPort, PeerHandle};
use crate::signaling::{ClientRequest, IceCandidate, Notification, ResponsePayload, ServerError, SignalingPort};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// What kind of response an outstanding request expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Join,
    Publish,
    IceSend,
    Leave,
}

#[derive(Debug)]
struct OutstandingRequest {
    kind: RequestKind,
    deadline: Instant,
}

/// A single in-progress session. Exists from `start()` until teardown
/// completes; `None` in the orchestrator means Idle.
#[derive(Debug)]
struct Session {
    state: SessionState,
    participant: String,
    room: String,
    outstanding: HashMap<u64, OutstandingRequest>,
    peer_handle: Option<PeerHandle>,
    pending_remote_candidates: Vec<IceCandidate>,
}

impl Session {
    fn new(participant: &str, room: &str) -> Self {
        Self {
            state: SessionState::Connecting,
            participant: participant.to_string(),
            room: room.to_string(),
            outstanding: HashMap::new(),
            peer_handle: None,
            pending_remote_candidates: Vec::new(),
        }
    }
}

/// Coordinates the signaling channel and the negotiation engine into
/// one race-free session lifecycle.
pub struct SessionOrchestrator<S: SignalingPort, N: NegotiationPort> {
    signaling: S,
    negotiation: N,
    observer: Box<dyn SessionObserver>,
    media: MediaConfig,
    request_timeout: Duration,
    session: Option<Session>,
    next_request_id: u64,
}

impl<S: SignalingPort, N: NegotiationPort> SessionOrchestrator<S, N> {
    pub fn new(
        signaling: S,
        negotiation: N,
        observer: Box<dyn SessionObserver>,
        media: MediaConfig,
        request_timeout: Duration,
    ) -> Self {
        Self {
            signaling,
            negotiation,
            observer,
            media,
            request_timeout,
            session: None,
            next_request_id: 1,
        }
    }

    /// Current session state; Idle when no session exists.
    pub fn state(&self) -> SessionState {
        self.session
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(SessionState::Idle)
    }

    /// Begin a session: connect the signaling channel to the given
    /// server and drive the lifecycle from subsequent events. Fails
    /// with AlreadyActive if a session is in progress; a Failed
    /// session may be restarted, against a different server if needed.
    pub fn start(&mut self, server_address: &str, participant: &str, room: &str) -> Result<(), SessionError> {
        match self.state() {
            SessionState::Idle | SessionState::Failed => {}
            _ => return Err(SessionError::AlreadyActive),
        }
        self.session = None;

        self.negotiation.initialize(&self.media)?;

        info!(
            "Starting session for '{}' in room '{}' at {}",
            participant, room, server_address
        );
        self.session = Some(Session::new(participant, room));
        self.observer.on_session_state_changed(SessionState::Connecting);

        if let Err(e) = self.signaling.connect(server_address) {
            self.fail(e);
            return Ok(());
        }
        Ok(())
    }

    /// Tear the session down from any state. Idempotent.
    pub fn stop(&mut self) {
        if self.session.is_none() {
            debug!("stop() with no session, nothing to do");
            return;
        }

        let state = self.state();
        info!("Stopping session (state: {})", state);

        // Leave the room gracefully when membership was confirmed.
        if matches!(
            state,
            SessionState::Joined | SessionState::Offering | SessionState::Publishing | SessionState::Active
        ) {
            let _ = self.send_request(RequestKind::Leave, ClientRequest::LeaveRoom);
        }

        self.set_state(SessionState::Closing);
        self.release();
        self.session = None;
        self.observer.on_session_state_changed(SessionState::Idle);
    }

    /// Process one event from the session queue. Runs to completion
    /// without blocking; all I/O happens in the collaborators.
    pub fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Signaling(ev) => self.handle_signaling(ev),
            SessionEvent::Negotiation(ev) => self.handle_negotiation(ev),
            SessionEvent::Tick => self.expire_requests(),
        }
    }

    fn handle_signaling(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::Connected => self.on_connected(),
            SignalingEvent::Response { request_id, result } => self.on_response(request_id, result),
            SignalingEvent::Notification(n) => self.on_notification(n),
            SignalingEvent::TransportError(detail) => {
                self.fail(SessionError::Connection(detail));
            }
            SignalingEvent::Disconnected => self.on_disconnected(),
        }
    }

    fn handle_negotiation(&mut self, event: NegotiationEvent) {
        match event {
            NegotiationEvent::OfferReady { handle, sdp } => self.on_offer_ready(handle, sdp),
            NegotiationEvent::AnswerReady { handle, sdp } => {
                debug!("Answer ready for {} ({} bytes), no orchestration action", handle, sdp.len());
            }
            NegotiationEvent::LocalCandidate { handle, candidate } => {
                self.on_local_candidate(handle, candidate);
            }
            NegotiationEvent::ConnectionStateChanged { handle, state } => {
                info!("{} ICE state: {:?}", handle, state);
                if state == IceState::Failed {
                    self.fail(SessionError::Negotiation("ICE connection failed".to_string()));
                }
            }
            NegotiationEvent::RemoteStreamAdded { stream } => {
                info!("Remote {} stream {} added on {}", stream.kind.as_str(), stream.id, stream.handle);
                self.observer.on_remote_stream_ready(&stream);
            }
            NegotiationEvent::RemoteStreamRemoved { stream } => {
                debug!("Remote stream {} removed", stream.id);
            }
            NegotiationEvent::EngineError(detail) => {
                self.fail(SessionError::Negotiation(detail));
            }
        }
    }

    // --- signaling event handlers ---

    fn on_connected(&mut self) {
        if self.state() != SessionState::Connecting {
            warn!("Connected event in state {}, discarding", self.state());
            return;
        }
        self.set_state(SessionState::Joining);

        let Some(session) = self.session.as_ref() else {
            return;
        };
        let (participant, room, webcam) =
            (session.participant.clone(), session.room.clone(), self.media.webcam);
        let request = ClientRequest::JoinRoom {
            user: participant,
            room,
            webcam,
        };
        if let Err(e) = self.send_request(RequestKind::Join, request) {
            self.fail(e);
        }
    }

    fn on_response(&mut self, request_id: u64, result: Result<ResponsePayload, ServerError>) {
        let kind = match self.session.as_mut().and_then(|s| s.outstanding.remove(&request_id)) {
            Some(req) => req.kind,
            None => {
                // Late or redelivered responses are expected; never fatal.
                warn!("Response with unknown correlation id {} discarded", request_id);
                return;
            }
        };

        match kind {
            RequestKind::Join => self.on_join_response(result),
            RequestKind::Publish => self.on_publish_response(result),
            RequestKind::IceSend => {
                // Advisory only; a rejection does not affect the session.
                if let Err(e) = result {
                    warn!("ICE candidate request {} rejected: {}", request_id, e);
                }
            }
            RequestKind::Leave => {
                debug!("Leave response for request {} received", request_id);
            }
        }
    }

    fn on_join_response(&mut self, result: Result<ResponsePayload, ServerError>) {
        if self.state() != SessionState::Joining {
            warn!("Join response in state {}, discarding", self.state());
            return;
        }
        let payload = match result {
            Ok(payload) => payload,
            Err(e) => {
                self.fail(SessionError::JoinRejected(e.to_string()));
                return;
            }
        };

        if let Some(session_id) = payload.session_id.as_deref() {
            debug!("Joined room with server session {}", session_id);
        }
        for participant in &payload.value {
            self.observer.on_participant_joined(&participant.id);
        }
        self.set_state(SessionState::Joined);

        // The offer must encode confirmed room membership, so
        // generation is gated on Joined and entered immediately.
        self.enter_offering();
    }

    fn enter_offering(&mut self) {
        let Some(participant) = self.session.as_ref().map(|s| s.participant.clone()) else {
            return;
        };

        let handle = match self.negotiation.generate_offer(&participant, true) {
            Ok(handle) => handle,
            Err(e) => {
                self.fail(e);
                return;
            }
        };

        self.set_state(SessionState::Offering);
        let pending = match self.session.as_mut() {
            Some(session) => {
                session.peer_handle = Some(handle);
                std::mem::take(&mut session.pending_remote_candidates)
            }
            None => return,
        };

        // Replay candidates that arrived before the connection existed,
        // in original arrival order.
        if !pending.is_empty() {
            info!("Replaying {} buffered remote candidates to {}", pending.len(), handle);
        }
        for candidate in pending {
            if let Err(e) = self.negotiation.add_remote_candidate(handle, candidate) {
                warn!("Failed to replay buffered candidate: {}", e);
            }
        }
    }

    fn on_publish_response(&mut self, result: Result<ResponsePayload, ServerError>) {
        if self.state() != SessionState::Publishing {
            warn!("Publish response in state {}, discarding", self.state());
            return;
        }
        let payload = match result {
            Ok(payload) => payload,
            Err(e) => {
                self.fail(SessionError::PublishRejected(e.to_string()));
                return;
            }
        };

        if let Some(sdp_answer) = payload.sdp_answer.as_deref() {
            let Some(handle) = self.session.as_ref().and_then(|s| s.peer_handle) else {
                self.fail(SessionError::InvalidState(
                    "publish response with no peer connection".to_string(),
                ));
                return;
            };
            if let Err(e) = self.negotiation.process_remote_answer(handle, sdp_answer) {
                self.fail(e);
                return;
            }
        } else {
            warn!("Publish response carried no SDP answer");
        }

        self.set_state(SessionState::Active);
    }

    fn on_notification(&mut self, notification: Notification) {
        match notification {
            Notification::IceCandidate { endpoint_name, candidate } => {
                self.on_remote_candidate(endpoint_name, candidate);
            }
            Notification::ParticipantJoined { id } => {
                info!("Participant '{}' joined the room", id);
                self.observer.on_participant_joined(&id);
            }
            Notification::ParticipantLeft { name } => {
                info!("Participant '{}' left the room", name);
                self.observer.on_participant_left(&name);
            }
            Notification::MediaError { error } => {
                self.fail(SessionError::Negotiation(error));
            }
        }
    }

    fn on_remote_candidate(&mut self, endpoint_name: String, candidate: IceCandidate) {
        let session = match self.session.as_mut() {
            Some(session) => session,
            None => {
                debug!("Remote candidate from '{}' with no session, dropped", endpoint_name);
                return;
            }
        };

        match session.peer_handle {
            Some(handle) => {
                if let Err(e) = self.negotiation.add_remote_candidate(handle, candidate) {
                    warn!("Failed to apply remote candidate from '{}': {}", endpoint_name, e);
                }
            }
            None => {
                debug!(
                    "Buffering remote candidate from '{}' until the connection exists",
                    endpoint_name
                );
                session.pending_remote_candidates.push(candidate);
            }
        }
    }

    fn on_disconnected(&mut self) {
        if self.session.is_none() {
            return;
        }
        info!("Signaling channel disconnected, tearing session down");
        self.set_state(SessionState::Closing);
        self.release();
        self.session = None;
        self.observer.on_session_state_changed(SessionState::Idle);
    }

    // --- negotiation event handlers ---

    fn on_offer_ready(&mut self, handle: PeerHandle, sdp: String) {
        if self.state() != SessionState::Offering {
            warn!("Offer ready in state {}, discarding", self.state());
            return;
        }
        if self.session.as_ref().and_then(|s| s.peer_handle) != Some(handle) {
            warn!("Offer ready for stale {}, discarding", handle);
            return;
        }

        let request = ClientRequest::PublishVideo {
            sdp_offer: sdp,
            loopback: self.media.loopback,
        };
        if let Err(e) = self.send_request(RequestKind::Publish, request) {
            self.fail(e);
            return;
        }
        self.set_state(SessionState::Publishing);
    }

    fn on_local_candidate(&mut self, handle: PeerHandle, candidate: IceCandidate) {
        let session = match self.session.as_ref() {
            Some(session) if session.peer_handle == Some(handle) => session,
            _ => {
                debug!("Local candidate for stale {}, dropped", handle);
                return;
            }
        };
        let request = ClientRequest::OnIceCandidate {
            endpoint_name: session.participant.clone(),
            candidate,
        };
        // Fire-and-forget: the response is advisory and never blocks.
        if let Err(e) = self.send_request(RequestKind::IceSend, request) {
            warn!("Failed to send local candidate: {}", e);
        }
    }

    // --- internals ---

    fn send_request(&mut self, kind: RequestKind, request: ClientRequest) -> Result<u64, SessionError> {
        let request_id = self.next_request_id;
        self.next_request_id += 1;

        self.signaling.send_request(request_id, request)?;
        if let Some(session) = self.session.as_mut() {
            session.outstanding.insert(
                request_id,
                OutstandingRequest {
                    kind,
                    deadline: Instant::now() + self.request_timeout,
                },
            );
        }
        Ok(request_id)
    }

    fn expire_requests(&mut self) {
        let now = Instant::now();
        let expired: Vec<(u64, RequestKind)> = match self.session.as_ref() {
            Some(session) => session
                .outstanding
                .iter()
                .filter(|(_, req)| req.deadline <= now)
                .map(|(id, req)| (*id, req.kind))
                .collect(),
            None => return,
        };

        for (request_id, kind) in expired {
            if let Some(session) = self.session.as_mut() {
                session.outstanding.remove(&request_id);
            }
            match kind {
                RequestKind::Join | RequestKind::Publish => {
                    self.fail(SessionError::RequestTimeout(format!(
                        "request {} ({:?}) exceeded its deadline",
                        request_id, kind
                    )));
                    return;
                }
                RequestKind::IceSend | RequestKind::Leave => {
                    warn!("Request {} ({:?}) expired, abandoned", request_id, kind);
                }
            }
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if let Some(session) = self.session.as_mut() {
            if session.state != state {
                debug!("Session state change: {} -> {}", session.state, state);
                session.state = state;
                self.observer.on_session_state_changed(state);
            }
        }
    }

    fn fail(&mut self, err: SessionError) {
        if self.state() == SessionState::Failed {
            warn!("Error after failure, ignored: {}", err);
            return;
        }
        error!("Session failed: {}", err);
        self.release();
        self.set_state(SessionState::Failed);
        self.observer.on_session_error(err.kind(), &err.to_string());
    }

    fn release(&mut self) {
        self.negotiation.close();
        self.signaling.disconnect();
        if let Some(session) = self.session.as_mut() {
            session.outstanding.clear();
            session.pending_remote_candidates.clear();
            session.peer_handle = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MediaConfig;
    use crate::negotiation::{RemoteStream, StreamKind};
    use crate::session::ErrorKind;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct SignalingLog {
        sent: Vec<(u64, ClientRequest)>,
        connects: Vec<String>,
        disconnects: usize,
        fail_send: bool,
    }

    #[derive(Clone, Default)]
    struct FakeSignaling(Arc<Mutex<SignalingLog>>);

    impl SignalingPort for FakeSignaling {
        fn connect(&mut self, server_address: &str) -> Result<(), SessionError> {
            self.0.lock().unwrap().connects.push(server_address.to_string());
            Ok(())
        }

        fn send_request(&mut self, request_id: u64, request: ClientRequest) -> Result<(), SessionError> {
            let mut log = self.0.lock().unwrap();
            if log.fail_send {
                return Err(SessionError::Connection("send failed".to_string()));
            }
            log.sent.push((request_id, request));
            Ok(())
        }

        fn disconnect(&mut self) {
            self.0.lock().unwrap().disconnects += 1;
        }
    }

    #[derive(Default)]
    struct NegotiationLog {
        initialized: usize,
        offers: Vec<(String, bool)>,
        answers_processed: Vec<(PeerHandle, String)>,
        candidates: Vec<(PeerHandle, IceCandidate)>,
        closes: usize,
    }

    #[derive(Clone, Default)]
    struct FakeNegotiation(Arc<Mutex<NegotiationLog>>);

    const TEST_HANDLE: PeerHandle = PeerHandle(7);

    impl NegotiationPort for FakeNegotiation {
        fn initialize(&mut self, _config: &MediaConfig) -> Result<(), SessionError> {
            self.0.lock().unwrap().initialized += 1;
            Ok(())
        }

        fn generate_offer(&mut self, stream_label: &str, publisher: bool) -> Result<PeerHandle, SessionError> {
            self.0.lock().unwrap().offers.push((stream_label.to_string(), publisher));
            Ok(TEST_HANDLE)
        }

        fn generate_answer(&mut self, _handle: PeerHandle, _remote_sdp: &str) -> Result<(), SessionError> {
            Ok(())
        }

        fn process_remote_answer(&mut self, handle: PeerHandle, sdp: &str) -> Result<(), SessionError> {
            self.0.lock().unwrap().answers_processed.push((handle, sdp.to_string()));
            Ok(())
        }

        fn add_remote_candidate(&mut self, handle: PeerHandle, candidate: IceCandidate) -> Result<(), SessionError> {
            self.0.lock().unwrap().candidates.push((handle, candidate));
            Ok(())
        }

        fn close(&mut self) {
            self.0.lock().unwrap().closes += 1;
        }
    }

    #[derive(Default)]
    struct ObserverLog {
        states: Vec<SessionState>,
        errors: Vec<ErrorKind>,
        streams: Vec<String>,
        joined: Vec<String>,
        left: Vec<String>,
    }

    #[derive(Clone, Default)]
    struct RecordingObserver(Arc<Mutex<ObserverLog>>);

    impl SessionObserver for RecordingObserver {
        fn on_session_state_changed(&self, state: SessionState) {
            self.0.lock().unwrap().states.push(state);
        }

        fn on_remote_stream_ready(&self, stream: &RemoteStream) {
            self.0.lock().unwrap().streams.push(stream.id.clone());
        }

        fn on_session_error(&self, kind: ErrorKind, _detail: &str) {
            self.0.lock().unwrap().errors.push(kind);
        }

        fn on_participant_joined(&self, id: &str) {
            self.0.lock().unwrap().joined.push(id.to_string());
        }

        fn on_participant_left(&self, name: &str) {
            self.0.lock().unwrap().left.push(name.to_string());
        }
    }

    struct Harness {
        orchestrator: SessionOrchestrator<FakeSignaling, FakeNegotiation>,
        signaling: FakeSignaling,
        negotiation: FakeNegotiation,
        observer: RecordingObserver,
    }

    fn harness() -> Harness {
        harness_with_timeout(Duration::from_secs(10))
    }

    fn harness_with_timeout(timeout: Duration) -> Harness {
        let signaling = FakeSignaling::default();
        let negotiation = FakeNegotiation::default();
        let observer = RecordingObserver::default();
        let orchestrator = SessionOrchestrator::new(
            signaling.clone(),
            negotiation.clone(),
            Box::new(observer.clone()),
            MediaConfig::default(),
            timeout,
        );
        Harness {
            orchestrator,
            signaling,
            negotiation,
            observer,
        }
    }

    fn candidate(c: &str) -> IceCandidate {
        IceCandidate::new(c, "0", 0)
    }

    fn join_id(h: &Harness) -> u64 {
        h.signaling
            .0
            .lock()
            .unwrap()
            .sent
            .iter()
            .find(|(_, r)| matches!(r, ClientRequest::JoinRoom { .. }))
            .map(|(id, _)| *id)
            .expect("join request sent")
    }

    fn publish_id(h: &Harness) -> u64 {
        h.signaling
            .0
            .lock()
            .unwrap()
            .sent
            .iter()
            .find(|(_, r)| matches!(r, ClientRequest::PublishVideo { .. }))
            .map(|(id, _)| *id)
            .expect("publish request sent")
    }

    fn response(request_id: u64, result: Result<ResponsePayload, ServerError>) -> SessionEvent {
        SessionEvent::Signaling(SignalingEvent::Response { request_id, result })
    }

    fn drive_to_joining(h: &mut Harness) {
        h.orchestrator.start("ws://srv", "alice", "room1").unwrap();
        h.orchestrator.handle_event(SessionEvent::Signaling(SignalingEvent::Connected));
    }

    fn drive_to_offering(h: &mut Harness) {
        drive_to_joining(h);
        let id = join_id(h);
        h.orchestrator.handle_event(response(id, Ok(ResponsePayload::default())));
    }

    fn drive_to_publishing(h: &mut Harness) {
        drive_to_offering(h);
        h.orchestrator.handle_event(SessionEvent::Negotiation(NegotiationEvent::OfferReady {
            handle: TEST_HANDLE,
            sdp: "v=0\r\noffer".to_string(),
        }));
    }

    fn drive_to_active(h: &mut Harness) {
        drive_to_publishing(h);
        let id = publish_id(h);
        let payload = ResponsePayload {
            sdp_answer: Some("v=0\r\nanswer".to_string()),
            ..Default::default()
        };
        h.orchestrator.handle_event(response(id, Ok(payload)));
    }

    #[test]
    fn start_connects_and_joins_on_connected() {
        let mut h = harness();
        h.orchestrator.start("ws://srv", "alice", "room1").unwrap();
        assert_eq!(h.orchestrator.state(), SessionState::Connecting);
        assert_eq!(h.signaling.0.lock().unwrap().connects, vec!["ws://srv"]);

        h.orchestrator.handle_event(SessionEvent::Signaling(SignalingEvent::Connected));
        assert_eq!(h.orchestrator.state(), SessionState::Joining);
        let log = h.signaling.0.lock().unwrap();
        assert!(matches!(
            log.sent[0].1,
            ClientRequest::JoinRoom { ref user, ref room, .. } if user == "alice" && room == "room1"
        ));
    }

    #[test]
    fn start_while_active_is_rejected() {
        let mut h = harness();
        h.orchestrator.start("ws://srv", "alice", "room1").unwrap();
        let err = h.orchestrator.start("ws://srv", "alice", "room1").unwrap_err();
        assert!(matches!(err, SessionError::AlreadyActive));
    }

    // Join success triggers offer generation with publisher=true.
    #[test]
    fn join_success_enters_offering_as_publisher() {
        let mut h = harness();
        drive_to_offering(&mut h);

        assert_eq!(h.orchestrator.state(), SessionState::Offering);
        let log = h.negotiation.0.lock().unwrap();
        assert_eq!(log.offers, vec![("alice".to_string(), true)]);
    }

    // A local offer triggers a publish request carrying the SDP.
    #[test]
    fn offer_ready_publishes_sdp() {
        let mut h = harness();
        drive_to_publishing(&mut h);

        assert_eq!(h.orchestrator.state(), SessionState::Publishing);
        let log = h.signaling.0.lock().unwrap();
        let publish = log
            .sent
            .iter()
            .find(|(_, r)| matches!(r, ClientRequest::PublishVideo { .. }))
            .unwrap();
        assert!(matches!(
            publish.1,
            ClientRequest::PublishVideo { ref sdp_offer, .. } if sdp_offer.contains("offer")
        ));
    }

    #[test]
    fn publish_success_applies_answer_and_activates() {
        let mut h = harness();
        drive_to_active(&mut h);

        assert_eq!(h.orchestrator.state(), SessionState::Active);
        let log = h.negotiation.0.lock().unwrap();
        assert_eq!(log.answers_processed.len(), 1);
        assert_eq!(log.answers_processed[0].0, TEST_HANDLE);
        assert!(log.answers_processed[0].1.contains("answer"));
    }

    // Candidates arriving before the connection exists are
    // buffered and replayed exactly once, in arrival order.
    #[test]
    fn early_remote_candidates_buffered_and_replayed_in_order() {
        let mut h = harness();
        drive_to_joining(&mut h);

        for c in ["c1", "c2"] {
            h.orchestrator.handle_event(SessionEvent::Signaling(SignalingEvent::Notification(
                Notification::IceCandidate {
                    endpoint_name: "bob".to_string(),
                    candidate: candidate(c),
                },
            )));
        }
        assert!(h.negotiation.0.lock().unwrap().candidates.is_empty());

        let id = join_id(&h);
        h.orchestrator.handle_event(response(id, Ok(ResponsePayload::default())));

        let log = h.negotiation.0.lock().unwrap();
        let applied: Vec<&str> = log.candidates.iter().map(|(_, c)| c.candidate.as_str()).collect();
        assert_eq!(applied, vec!["c1", "c2"]);
        assert!(log.candidates.iter().all(|(handle, _)| *handle == TEST_HANDLE));
    }

    #[test]
    fn candidate_after_handle_applied_immediately() {
        let mut h = harness();
        drive_to_active(&mut h);

        h.orchestrator.handle_event(SessionEvent::Signaling(SignalingEvent::Notification(
            Notification::IceCandidate {
                endpoint_name: "bob".to_string(),
                candidate: candidate("c3"),
            },
        )));
        let log = h.negotiation.0.lock().unwrap();
        assert_eq!(log.candidates.len(), 1);
        assert_eq!(log.candidates[0].1.candidate, "c3");
    }

    // A join rejection fails the session with one error callback.
    #[test]
    fn join_rejection_fails_session() {
        let mut h = harness();
        drive_to_joining(&mut h);

        let id = join_id(&h);
        h.orchestrator.handle_event(response(
            id,
            Err(ServerError {
                code: 104,
                message: "room full".to_string(),
            }),
        ));

        assert_eq!(h.orchestrator.state(), SessionState::Failed);
        let log = h.observer.0.lock().unwrap();
        assert_eq!(log.errors, vec![ErrorKind::JoinRejected]);
        assert_eq!(h.negotiation.0.lock().unwrap().closes, 1);
        assert_eq!(h.signaling.0.lock().unwrap().disconnects, 1);
    }

    #[test]
    fn publish_rejection_fails_session() {
        let mut h = harness();
        drive_to_publishing(&mut h);

        let id = publish_id(&h);
        h.orchestrator.handle_event(response(
            id,
            Err(ServerError {
                code: 201,
                message: "media server unavailable".to_string(),
            }),
        ));

        assert_eq!(h.orchestrator.state(), SessionState::Failed);
        assert_eq!(h.observer.0.lock().unwrap().errors, vec![ErrorKind::PublishRejected]);
    }

    // Stopping mid-publish releases everything.
    #[test]
    fn stop_during_publishing_resets_to_idle() {
        let mut h = harness();
        drive_to_publishing(&mut h);

        h.orchestrator.stop();
        assert_eq!(h.orchestrator.state(), SessionState::Idle);
        assert_eq!(h.negotiation.0.lock().unwrap().closes, 1);
        assert_eq!(h.signaling.0.lock().unwrap().disconnects, 1);
    }

    #[test]
    fn stop_is_idempotent() {
        let mut h = harness();
        h.orchestrator.stop();
        assert_eq!(h.orchestrator.state(), SessionState::Idle);
        h.orchestrator.stop();
        assert_eq!(h.orchestrator.state(), SessionState::Idle);

        drive_to_active(&mut h);
        h.orchestrator.stop();
        h.orchestrator.stop();
        assert_eq!(h.orchestrator.state(), SessionState::Idle);
    }

    #[test]
    fn stop_after_join_leaves_room_first() {
        let mut h = harness();
        drive_to_active(&mut h);
        h.orchestrator.stop();

        let log = h.signaling.0.lock().unwrap();
        assert!(log.sent.iter().any(|(_, r)| matches!(r, ClientRequest::LeaveRoom)));
    }

    #[test]
    fn unknown_correlation_id_discarded() {
        let mut h = harness();
        drive_to_joining(&mut h);

        h.orchestrator.handle_event(response(9999, Ok(ResponsePayload::default())));
        assert_eq!(h.orchestrator.state(), SessionState::Joining);
        assert!(h.observer.0.lock().unwrap().errors.is_empty());
    }

    #[test]
    fn offer_ready_before_joined_discarded() {
        let mut h = harness();
        drive_to_joining(&mut h);

        h.orchestrator.handle_event(SessionEvent::Negotiation(NegotiationEvent::OfferReady {
            handle: TEST_HANDLE,
            sdp: "v=0".to_string(),
        }));
        // Offering is never entered except from Joined.
        assert_eq!(h.orchestrator.state(), SessionState::Joining);
        assert!(h.signaling.0.lock().unwrap().sent.iter().all(|(_, r)| !matches!(r, ClientRequest::PublishVideo { .. })));
    }

    #[test]
    fn connected_in_wrong_state_discarded() {
        let mut h = harness();
        drive_to_active(&mut h);
        h.orchestrator.handle_event(SessionEvent::Signaling(SignalingEvent::Connected));
        assert_eq!(h.orchestrator.state(), SessionState::Active);
    }

    #[test]
    fn local_candidate_forwarded_to_signaling() {
        let mut h = harness();
        drive_to_active(&mut h);

        h.orchestrator.handle_event(SessionEvent::Negotiation(NegotiationEvent::LocalCandidate {
            handle: TEST_HANDLE,
            candidate: candidate("local-c"),
        }));

        let log = h.signaling.0.lock().unwrap();
        assert!(log.sent.iter().any(|(_, r)| matches!(
            r,
            ClientRequest::OnIceCandidate { ref endpoint_name, ref candidate }
                if endpoint_name == "alice" && candidate.candidate == "local-c"
        )));
    }

    #[test]
    fn participant_notifications_forwarded_without_transition() {
        let mut h = harness();
        drive_to_active(&mut h);

        h.orchestrator.handle_event(SessionEvent::Signaling(SignalingEvent::Notification(
            Notification::ParticipantJoined { id: "bob".to_string() },
        )));
        h.orchestrator.handle_event(SessionEvent::Signaling(SignalingEvent::Notification(
            Notification::ParticipantLeft { name: "bob".to_string() },
        )));

        assert_eq!(h.orchestrator.state(), SessionState::Active);
        let log = h.observer.0.lock().unwrap();
        assert_eq!(log.joined, vec!["bob"]);
        assert_eq!(log.left, vec!["bob"]);
    }

    #[test]
    fn remote_stream_delegated_to_observer() {
        let mut h = harness();
        drive_to_active(&mut h);

        h.orchestrator.handle_event(SessionEvent::Negotiation(NegotiationEvent::RemoteStreamAdded {
            stream: RemoteStream {
                handle: TEST_HANDLE,
                id: "track-1".to_string(),
                kind: StreamKind::Video,
            },
        }));

        assert_eq!(h.orchestrator.state(), SessionState::Active);
        assert_eq!(h.observer.0.lock().unwrap().streams, vec!["track-1"]);
    }

    #[test]
    fn transport_error_fails_session() {
        let mut h = harness();
        drive_to_active(&mut h);

        h.orchestrator.handle_event(SessionEvent::Signaling(SignalingEvent::TransportError(
            "socket reset".to_string(),
        )));
        assert_eq!(h.orchestrator.state(), SessionState::Failed);
        assert_eq!(h.observer.0.lock().unwrap().errors, vec![ErrorKind::Connection]);
    }

    #[test]
    fn engine_error_fails_session_once() {
        let mut h = harness();
        drive_to_active(&mut h);

        h.orchestrator.handle_event(SessionEvent::Negotiation(NegotiationEvent::EngineError(
            "dtls failure".to_string(),
        )));
        h.orchestrator.handle_event(SessionEvent::Negotiation(NegotiationEvent::EngineError(
            "followup".to_string(),
        )));

        assert_eq!(h.orchestrator.state(), SessionState::Failed);
        assert_eq!(h.observer.0.lock().unwrap().errors, vec![ErrorKind::Negotiation]);
    }

    #[test]
    fn ice_failed_state_fails_session() {
        let mut h = harness();
        drive_to_active(&mut h);

        h.orchestrator.handle_event(SessionEvent::Negotiation(NegotiationEvent::ConnectionStateChanged {
            handle: TEST_HANDLE,
            state: IceState::Failed,
        }));
        assert_eq!(h.orchestrator.state(), SessionState::Failed);
    }

    #[test]
    fn disconnect_event_resets_to_idle() {
        let mut h = harness();
        drive_to_active(&mut h);

        h.orchestrator.handle_event(SessionEvent::Signaling(SignalingEvent::Disconnected));
        assert_eq!(h.orchestrator.state(), SessionState::Idle);
        assert!(h.observer.0.lock().unwrap().errors.is_empty());
    }

    #[test]
    fn join_timeout_fails_session() {
        let mut h = harness_with_timeout(Duration::ZERO);
        drive_to_joining(&mut h);

        h.orchestrator.handle_event(SessionEvent::Tick);
        assert_eq!(h.orchestrator.state(), SessionState::Failed);
        assert_eq!(h.observer.0.lock().unwrap().errors, vec![ErrorKind::RequestTimeout]);
    }

    #[test]
    fn tick_without_expiry_is_noop() {
        let mut h = harness();
        drive_to_joining(&mut h);

        h.orchestrator.handle_event(SessionEvent::Tick);
        assert_eq!(h.orchestrator.state(), SessionState::Joining);
    }

    #[test]
    fn restart_after_failure_allowed() {
        let mut h = harness();
        drive_to_joining(&mut h);
        let id = join_id(&h);
        h.orchestrator.handle_event(response(
            id,
            Err(ServerError {
                code: 104,
                message: "room full".to_string(),
            }),
        ));
        assert_eq!(h.orchestrator.state(), SessionState::Failed);

        // The restart may target a different server.
        h.orchestrator.start("ws://fallback", "alice", "room1").unwrap();
        assert_eq!(h.orchestrator.state(), SessionState::Connecting);
        assert_eq!(
            h.signaling.0.lock().unwrap().connects,
            vec!["ws://srv", "ws://fallback"]
        );
    }

    #[test]
    fn request_ids_unique_and_monotonic() {
        let mut h = harness();
        drive_to_active(&mut h);

        let log = h.signaling.0.lock().unwrap();
        let ids: Vec<u64> = log.sent.iter().map(|(id, _)| *id).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), ids.len());
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn states_progress_monotonically_on_happy_path() {
        let mut h = harness();
        drive_to_active(&mut h);

        let log = h.observer.0.lock().unwrap();
        assert_eq!(
            log.states,
            vec![
                SessionState::Connecting,
                SessionState::Joining,
                SessionState::Joined,
                SessionState::Offering,
                SessionState::Publishing,
                SessionState::Active,
            ]
        );
    }
}
