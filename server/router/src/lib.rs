//! Audio router (spec §4.3): classifies participants, applies the
//! ingress priority queue, and drains it into the two speech links with
//! mute/pause gating (spec I1, I2).
//!
//! The router is deliberately decoupled from the concrete speech-link
//! implementation: it talks to [`AudioSink`] trait objects, the way the
//! teacher's `voice_forwarder.rs` talks to `DatagramTx`/`SessionRegistry`
//! trait objects rather than concrete QUIC types.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use coach_queue::{IngressFrame, IngressQueue, Priority, DRAIN_BATCH, MAX_QUEUE};

/// Idle sleep when the drain found nothing to do.
const DRAIN_IDLE_SLEEP: Duration = Duration::from_millis(5);
/// Sleep between drains when backlog is modest.
const DRAIN_BUSY_SLEEP: Duration = Duration::from_millis(1);
/// Backlog threshold above which the next drain is scheduled immediately.
const DRAIN_IMMEDIATE_THRESHOLD: usize = 100;
/// Capture loop cooperative yield interval.
const CAPTURE_YIELD_EVERY: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Coach,
    Ai,
}

/// Classifies a participant from its identity and optional join metadata.
///
/// Prefix convention: `coach-...` -> coach, `ai-...` -> ai, else client.
/// A metadata object carrying a `role` field overrides the prefix; an
/// unrecognized metadata role value is classified as client (spec boundary
/// behavior), not re-derived from the prefix.
pub fn classify(identity: &str, metadata: Option<&Value>) -> Role {
    if let Some(role_str) = metadata.and_then(|m| m.get("role")).and_then(|v| v.as_str()) {
        return match role_str {
            "coach" => Role::Coach,
            "ai" => Role::Ai,
            _ => Role::Client,
        };
    }
    if identity.starts_with("coach-") {
        Role::Coach
    } else if identity.starts_with("ai-") {
        Role::Ai
    } else {
        Role::Client
    }
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("sink send failed: {0}")]
    SinkSendFailed(String),
}

/// Looks up a participant's classified role. Owned and updated by the
/// session controller (C8); the router only reads it.
pub trait RoleProvider: Send + Sync {
    fn role_of(&self, participant_id: &str) -> Option<Role>;
}

/// Reads the live mute set / pause flag owned by the dual-connection
/// manager (C6). Must be cheap and non-blocking: it is read on every frame.
pub trait GateState: Send + Sync {
    fn is_paused(&self) -> bool;
    fn is_muted(&self, participant_id: &str) -> bool;
}

#[async_trait]
pub trait AudioSink: Send + Sync {
    async fn send_audio(&self, bytes: Bytes) -> Result<(), RouterError>;
}

pub trait RouterMetrics: Send + Sync {
    fn inc_enqueued(&self) {}
    fn inc_evicted(&self) {}
    fn inc_forwarded_transcription(&self) {}
    fn inc_forwarded_voice_agent(&self) {}
    fn inc_gated_out(&self) {}
    fn inc_sink_error(&self) {}
}

pub struct NoopRouterMetrics;
impl RouterMetrics for NoopRouterMetrics {}

/// One incoming audio frame, as handed to the router by the conferencing
/// SDK's per-participant track subscription.
#[async_trait]
pub trait ParticipantAudioStream: Send {
    /// Returns `None` when the track/participant audio iterable ends.
    async fn next_frame(&mut self) -> Option<Bytes>;
}

pub struct AudioRouter {
    queue: Mutex<IngressQueue>,
    roles: Arc<dyn RoleProvider>,
    gate: Arc<dyn GateState>,
    transcription: Arc<dyn AudioSink>,
    voice_agent: Arc<dyn AudioSink>,
    metrics: Arc<dyn RouterMetrics>,
}

impl AudioRouter {
    pub fn new(
        roles: Arc<dyn RoleProvider>,
        gate: Arc<dyn GateState>,
        transcription: Arc<dyn AudioSink>,
        voice_agent: Arc<dyn AudioSink>,
        metrics: Arc<dyn RouterMetrics>,
    ) -> Self {
        Self {
            queue: Mutex::new(IngressQueue::new(MAX_QUEUE)),
            roles,
            gate,
            transcription,
            voice_agent,
            metrics,
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().len()
    }

    /// Classifies priority and enqueues one incoming frame. Called by the
    /// per-participant capture loop; never blocks on I/O.
    pub fn enqueue_frame(&self, participant_id: &str, name: &str, bytes: Bytes) {
        let role = self.roles.role_of(participant_id).unwrap_or(Role::Client);
        let muted = self.gate.is_muted(participant_id);
        let priority = match role {
            Role::Coach if muted => Priority::CoachMuted,
            Role::Coach => Priority::CoachUnmuted,
            Role::Client | Role::Ai => Priority::Client,
        };

        self.queue.lock().enqueue(IngressFrame {
            bytes,
            participant_id: participant_id.to_string(),
            name: name.to_string(),
            priority,
        });
        self.metrics.inc_enqueued();
    }

    /// Drains and dispatches one batch; returns the post-drain queue depth.
    async fn drain_once(&self) -> usize {
        let batch = self.queue.lock().drain(DRAIN_BATCH);
        for frame in batch {
            self.dispatch(frame).await;
        }
        self.queue.lock().len()
    }

    async fn dispatch(&self, frame: IngressFrame) {
        // I2: transcription always receives the frame, mute/pause notwithstanding.
        if let Err(e) = self.transcription.send_audio(frame.bytes.clone()).await {
            warn!(participant = %frame.participant_id, error = %e, "transcription send failed");
            self.metrics.inc_sink_error();
        } else {
            self.metrics.inc_forwarded_transcription();
        }

        // I1: the conversational link is gated by pause and mute.
        let gated = self.gate.is_paused() || self.gate.is_muted(&frame.participant_id);
        if gated {
            self.metrics.inc_gated_out();
            return;
        }

        if let Err(e) = self.voice_agent.send_audio(frame.bytes).await {
            warn!(participant = %frame.participant_id, error = %e, "voice agent send failed");
            self.metrics.inc_sink_error();
        } else {
            self.metrics.inc_forwarded_voice_agent();
        }
    }

    /// Runs the drain loop until cancelled. Cooperative yield discipline
    /// per spec §4.3/§5: yield after every batch, sleep 5 ms when idle,
    /// 1 ms when busy, immediately again when backlog exceeds 100.
    pub async fn run_drain_loop(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            let was_empty = self.queue.lock().is_empty();
            if was_empty {
                tokio::select! {
                    _ = tokio::time::sleep(DRAIN_IDLE_SLEEP) => {}
                    _ = shutdown.changed() => if *shutdown.borrow() { return },
                }
                continue;
            }

            let depth_after = self.drain_once().await;
            tokio::task::yield_now().await;

            if depth_after > DRAIN_IMMEDIATE_THRESHOLD {
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(DRAIN_BUSY_SLEEP) => {}
                _ = shutdown.changed() => if *shutdown.borrow() { return },
            }
        }
    }

    /// Drives a single participant's audio iterable into the router,
    /// yielding every [`CAPTURE_YIELD_EVERY`] frames (spec §5).
    pub async fn run_capture_loop(
        self: Arc<Self>,
        participant_id: String,
        name: String,
        mut stream: Box<dyn ParticipantAudioStream>,
    ) {
        let mut count: u32 = 0;
        while let Some(bytes) = stream.next_frame().await {
            self.enqueue_frame(&participant_id, &name, bytes);
            count += 1;
            if count % CAPTURE_YIELD_EVERY == 0 {
                tokio::task::yield_now().await;
            }
        }
        debug!(participant = %participant_id, "participant audio stream ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedRoles(std::collections::HashMap<String, Role>);
    impl RoleProvider for FixedRoles {
        fn role_of(&self, participant_id: &str) -> Option<Role> {
            self.0.get(participant_id).copied()
        }
    }

    struct TestGate {
        paused: std::sync::atomic::AtomicBool,
        muted: Mutex<HashSet<String>>,
    }
    impl GateState for TestGate {
        fn is_paused(&self) -> bool {
            self.paused.load(Ordering::SeqCst)
        }
        fn is_muted(&self, participant_id: &str) -> bool {
            self.muted.lock().contains(participant_id)
        }
    }

    struct CountingSink(AtomicUsize, Mutex<Vec<Bytes>>);
    impl CountingSink {
        fn new() -> Self {
            Self(AtomicUsize::new(0), Mutex::new(Vec::new()))
        }
    }
    #[async_trait]
    impl AudioSink for CountingSink {
        async fn send_audio(&self, bytes: Bytes) -> Result<(), RouterError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            self.1.lock().push(bytes);
            Ok(())
        }
    }

    fn setup() -> (Arc<AudioRouter>, Arc<TestGate>, Arc<CountingSink>, Arc<CountingSink>) {
        let mut roles = std::collections::HashMap::new();
        roles.insert("client-1".to_string(), Role::Client);
        roles.insert("coach-a".to_string(), Role::Coach);
        let roles = Arc::new(FixedRoles(roles));
        let gate = Arc::new(TestGate { paused: false.into(), muted: Mutex::new(HashSet::new()) });
        let transcription = Arc::new(CountingSink::new());
        let voice_agent = Arc::new(CountingSink::new());
        let router = Arc::new(AudioRouter::new(
            roles,
            gate.clone(),
            transcription.clone(),
            voice_agent.clone(),
            Arc::new(NoopRouterMetrics),
        ));
        (router, gate, transcription, voice_agent)
    }

    #[test]
    fn classify_prefix_and_metadata() {
        assert_eq!(classify("coach-a", None), Role::Coach);
        assert_eq!(classify("ai-bot", None), Role::Ai);
        assert_eq!(classify("random", None), Role::Client);
        let meta = serde_json::json!({"role": "coach"});
        assert_eq!(classify("random", Some(&meta)), Role::Coach);
        let unknown = serde_json::json!({"role": "manager"});
        assert_eq!(classify("coach-a", Some(&unknown)), Role::Client);
    }

    #[tokio::test]
    async fn muted_coach_reaches_transcription_not_voice_agent() {
        let (router, gate, transcription, voice_agent) = setup();
        gate.muted.lock().insert("coach-a".to_string());

        router.enqueue_frame("coach-a", "Coach A", Bytes::from_static(b"x"));
        let depth = router.drain_once().await;
        assert_eq!(depth, 0);

        assert_eq!(transcription.0.load(Ordering::SeqCst), 1);
        assert_eq!(voice_agent.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn paused_diverts_everyone_to_transcription_only() {
        let (router, gate, transcription, voice_agent) = setup();
        gate.paused.store(true, Ordering::SeqCst);

        router.enqueue_frame("client-1", "Client", Bytes::from_static(b"x"));
        router.drain_once().await;

        assert_eq!(transcription.0.load(Ordering::SeqCst), 1);
        assert_eq!(voice_agent.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unmuted_client_reaches_both_links() {
        let (router, _gate, transcription, voice_agent) = setup();
        router.enqueue_frame("client-1", "Client", Bytes::from_static(b"x"));
        router.drain_once().await;

        assert_eq!(transcription.0.load(Ordering::SeqCst), 1);
        assert_eq!(voice_agent.0.load(Ordering::SeqCst), 1);
    }
}
