//! roomlink - Main entry point
//!
//! Joins a media room, publishes the local stream and logs remote
//! activity until interrupted.

mod args;

use args::Args;
use clap::Parser;
use log::{debug, error, info, warn};
use roomlink::config::Config;
use roomlink::negotiation::{RemoteStream, StreamRenderer, WebRtcEngine};
use roomlink::session::events::SessionEvent;
use roomlink::session::{ErrorKind, SessionObserver, SessionOrchestrator, SessionState};
use roomlink::signaling::RoomChannel;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;

/// Renderer that counts traffic instead of decoding it.
struct LogRenderer {
    stream_id: String,
    packets: AtomicU64,
}

impl StreamRenderer for LogRenderer {
    fn render_rtp(&self, packet: &[u8]) {
        let count = self.packets.fetch_add(1, Ordering::Relaxed) + 1;
        if count == 1 || count % 500 == 0 {
            debug!("Stream '{}': {} packets ({} bytes last)", self.stream_id, count, packet.len());
        }
    }
}

/// Observer that logs session progress and sinks remote streams.
struct CliObserver {
    engine: WebRtcEngine,
}

impl SessionObserver for CliObserver {
    fn on_session_state_changed(&self, state: SessionState) {
        info!("Session state: {}", state);
    }

    fn on_remote_stream_ready(&self, stream: &RemoteStream) {
        info!("Remote {} stream '{}' ready", stream.kind.as_str(), stream.id);
        let renderer = Arc::new(LogRenderer {
            stream_id: stream.id.clone(),
            packets: AtomicU64::new(0),
        });
        if let Err(e) = self.engine.attach_renderer(stream.handle, &stream.id, renderer) {
            warn!("Failed to attach renderer to '{}': {}", stream.id, e);
        }
    }

    fn on_session_error(&self, kind: ErrorKind, detail: &str) {
        error!("Session error ({:?}): {}", kind, detail);
    }

    fn on_participant_joined(&self, id: &str) {
        info!("Participant joined: {}", id);
    }

    fn on_participant_left(&self, name: &str) {
        info!("Participant left: {}", name);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging with noise filtering for third-party WebRTC crates
    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::new()
        .parse_filters(&std::env::var("ROOMLINK_LOG").unwrap_or_else(|_| log_level.to_string()))
        .filter_module("webrtc_ice", log::LevelFilter::Error)
        .filter_module("webrtc_dtls", log::LevelFilter::Error)
        .filter_module("webrtc_mdns", log::LevelFilter::Error)
        .init();

    info!("roomlink v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config = match args.load_config() {
        Ok(cfg) => {
            info!("Loaded configuration from {:?}", args.config);
            cfg
        }
        Err(e) => {
            warn!("Failed to load config: {}, using defaults", e);
            Config::default()
        }
    };

    // Apply command line overrides
    if let Some(ref server) = args.server {
        config.server.address = server.clone();
    }
    if args.loopback {
        config.media.loopback = true;
    }
    if args.no_webcam {
        config.media.webcam = false;
    }
    config.validate()?;

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<SessionEvent>();
    let channel = RoomChannel::new(config.server.connect_timeout(), event_tx.clone());
    let engine = WebRtcEngine::new(event_tx);
    let observer = CliObserver {
        engine: engine.clone(),
    };
    let mut orchestrator = SessionOrchestrator::new(
        channel,
        engine,
        Box::new(observer),
        config.media.clone(),
        config.server.request_timeout(),
    );

    orchestrator.start(&config.server.address, &args.user, &args.room)?;

    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received shutdown signal");
                orchestrator.stop();
                break;
            }
            _ = tick.tick() => {
                orchestrator.handle_event(SessionEvent::Tick);
                if orchestrator.state() == SessionState::Failed {
                    return Err("session failed".into());
                }
            }
            event = event_rx.recv() => {
                let Some(event) = event else {
                    break;
                };
                orchestrator.handle_event(event);
                match orchestrator.state() {
                    SessionState::Failed => return Err("session failed".into()),
                    // The server hung up and teardown already ran.
                    SessionState::Idle => break,
                    _ => {}
                }
            }
        }
    }

    info!("roomlink shut down");
    Ok(())
}
