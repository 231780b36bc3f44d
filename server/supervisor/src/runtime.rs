//! Wires C1-C9 into a single running session (C10), the way
//! `gateway/src/main.rs` wires `vp_media`/`vp_control` into a `Gateway`.
//! Generic over the conferencing adapter so the core pipeline can be
//! exercised without a live room (see `conferencing::ConferencingClient`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use coach_dual::{DualConnectionManager, DualEvent};
use coach_egress::EgressPump;
use coach_metrics::{EgressMetricsImpl, LabelPolicy, RouterMetricsImpl, SpeechMetricsImpl};
use coach_router::{AudioRouter, GateState};
use coach_session::{PgSessionRepo, SessionController, SessionRepo};
use coach_speech::{TranscriptionLink, VoiceAgentConfig, VoiceAgentLink};

use crate::config::Config;
use crate::conferencing::{ConferencingClient, RoomEvent};

const SAMPLE_RATE_HZ: u32 = 24_000;
const UPWARD_FANOUT_CAPACITY: usize = 256;

/// Coalesces duplicate shutdown triggers (grace timer expiry, a signal,
/// a future fatal-link path) into a single teardown run (spec §5
/// "Shutdown is idempotent: duplicate shutdown calls coalesce").
struct ShutdownGuard(AtomicBool);

impl ShutdownGuard {
    fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Returns `true` on the first call only; every later call is a no-op.
    fn should_run(&self) -> bool {
        self.0.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok()
    }
}

/// Runs one coaching session end to end until the grace timer or a
/// shutdown signal fires. Returns the process exit code (spec §6).
pub async fn run(cfg: Config, conferencing: Arc<dyn ConferencingClient>) -> anyhow::Result<i32> {
    let namespace: &'static str = "coach";
    info!(config = %cfg.redacted_summary(), "starting coaching session");

    let pool = PgPoolOptions::new().max_connections(16).connect(&cfg.database_url).await?;
    sqlx::migrate!("../session/migrations").run(&pool).await?;
    let repo = Arc::new(PgSessionRepo::new(pool));
    repo.cleanup_abandoned_sessions(Some(&cfg.room_name)).await.ok();

    let (room_events, outbound_sink, data_channel) = match conferencing.connect().await {
        Ok(handles) => handles,
        Err(e) => {
            warn!(error = %e, "conferencing connect failed, cannot start session");
            return Ok(1);
        }
    };

    let speech_metrics = Arc::new(SpeechMetricsImpl::new(namespace, LabelPolicy));
    let voice_agent_headers =
        vec![("Authorization".to_string(), format!("Bearer {}", cfg.speech_provider_api_key))];

    let voice_agent_config = VoiceAgentConfig {
        system_prompt: cfg.coaching_prompt.clone(),
        greeting: cfg.greeting.clone(),
        voice_id: cfg.voice_model.clone(),
        llm_model: cfg.llm_model.clone(),
        sample_rate_hz: SAMPLE_RATE_HZ,
    };

    let (voice_agent, voice_agent_events) = match VoiceAgentLink::connect(
        cfg.speech_provider_endpoint_a.clone(),
        voice_agent_headers.clone(),
        voice_agent_config,
        speech_metrics.clone(),
    )
    .await
    {
        Ok(pair) => pair,
        Err(e) => {
            warn!(error = %e, "voice agent link failed to open, aborting session start");
            return Ok(1);
        }
    };

    // Per spec §4.6, a transcription-link failure degrades transcripts
    // but must not prevent the session from starting.
    let transcription_pair = match &cfg.speech_provider_endpoint_b {
        Some(url) => match TranscriptionLink::connect(
            url.clone(),
            voice_agent_headers,
            speech_metrics.clone(),
        )
        .await
        {
            Ok(pair) => Some(pair),
            Err(e) => {
                warn!(error = %e, "transcription link failed to open, continuing without it");
                None
            }
        },
        None => None,
    };
    let (transcription, transcription_events) = match transcription_pair {
        Some((link, events)) => (Some(link), Some(events)),
        None => (None, None),
    };

    let (dual, upward_rx) =
        DualConnectionManager::new(voice_agent, voice_agent_events, transcription, transcription_events);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let session = Arc::new(SessionController::new(
        repo,
        cfg.room_name.clone(),
        dual.clone(),
        data_channel,
        shutdown_tx.clone(),
    ));
    session.open(None).await;

    let router_metrics = Arc::new(RouterMetricsImpl::new(namespace));
    let router = Arc::new(AudioRouter::new(
        session.clone(),
        Arc::new(dual.clone()),
        dual.transcription_sink(),
        dual.voice_agent_sink(),
        router_metrics,
    ));
    tokio::spawn(router.clone().run_drain_loop(shutdown_rx.clone()));

    let egress_metrics = Arc::new(EgressMetricsImpl::new(namespace));
    let (egress_tx, egress_rx) = mpsc::channel::<DualEvent>(UPWARD_FANOUT_CAPACITY);
    let pump = EgressPump::new(outbound_sink, Arc::new(dual.clone()), dual.clone(), egress_metrics);
    tokio::spawn(pump.run(egress_rx));
    tokio::spawn(fan_out_upward_events(upward_rx, egress_tx, session.clone()));

    tokio::spawn(drive_room_events(room_events, router.clone(), session.clone()));

    let mut shutdown_watch = shutdown_rx;
    tokio::select! {
        _ = shutdown_watch.changed() => {
            info!("shutdown signal received");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("ctrl-c received");
            let _ = shutdown_tx.send(true);
        }
    }

    let guard = ShutdownGuard::new();
    if guard.should_run() {
        dual.shutdown();
        session.close(None).await;
    }
    Ok(0)
}

/// Splits the dual-connection manager's single upward event stream: audio
/// and lifecycle events feed the egress pump, transcript events feed the
/// session controller's broadcast/persistence path (spec §4.6 event list
/// split across C7 and C8's consumers).
async fn fan_out_upward_events<R: SessionRepo + 'static>(
    mut upward_rx: mpsc::Receiver<DualEvent>,
    egress_tx: mpsc::Sender<DualEvent>,
    session: Arc<SessionController<R>>,
) {
    while let Some(event) = upward_rx.recv().await {
        match event {
            DualEvent::Transcript(entry) => session.handle_transcript(entry).await,
            DualEvent::GateEvent { participant_id, muted } => {
                info!(participant = %participant_id, muted, "gate state changed");
                if egress_tx.send(DualEvent::GateEvent { participant_id, muted }).await.is_err() {
                    return;
                }
            }
            other => {
                if egress_tx.send(other).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn drive_room_events<R: SessionRepo + 'static>(
    mut room_events: mpsc::Receiver<RoomEvent>,
    router: Arc<AudioRouter>,
    session: Arc<SessionController<R>>,
) {
    while let Some(event) = room_events.recv().await {
        match event {
            RoomEvent::ParticipantJoined { identity, name, metadata } => {
                session.on_participant_joined(&identity, &name, metadata.as_ref());
            }
            RoomEvent::ParticipantLeft { identity } => {
                session.on_participant_left(&identity);
            }
            RoomEvent::AudioTrackSubscribed { participant_id, name, stream } => {
                tokio::spawn(router.clone().run_capture_loop(participant_id, name, stream));
            }
            RoomEvent::DataReceived { bytes } => {
                session.handle_data_message(&bytes).await;
            }
        }
    }
}
