//! Duplex connections to the external speech provider: the Voice Agent
//! link (C4, conversational TTS + barge-in) and the Transcription link
//! (C5, always-on STT). Both are framed WebSocket streams: binary frames
//! carry PCM audio, text frames carry tagged JSON control/events.
//!
//! Reconnection follows spec §4.4/§9: transient I/O failures back off
//! exponentially up to a capped number of attempts; a successful
//! reconnect replays the coaching prompt and last pause state first,
//! then discards anything still sitting in the outbound audio channel
//! as too stale to matter.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF: Duration = Duration::from_secs(10);
const MAX_RECONNECT_ATTEMPTS: u32 = 8;
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(3);
/// Bounded replay ring: at most this many recent control messages are
/// kept so a reconnect can replay context without unbounded memory growth.
const CONTROL_RING_CAPACITY: usize = 8;
const EVENTS_CHANNEL_CAPACITY: usize = 256;
const AUDIO_CHANNEL_CAPACITY: usize = 64;
const CONTROL_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Error)]
pub enum SpeechError {
    #[error("invalid connection url or headers: {0}")]
    BadRequest(String),
    #[error("exhausted {0} reconnect attempts")]
    ReconnectExhausted(u32),
    #[error("link is shut down")]
    ShuttingDown,
}

pub type SpeechResult<T> = Result<T, SpeechError>;

pub trait SpeechMetrics: Send + Sync {
    fn inc_reconnect(&self, link: &'static str) {}
    fn inc_connect_failure(&self, link: &'static str) {}
    fn inc_provider_error(&self, link: &'static str) {}
    fn inc_audio_sent(&self, link: &'static str) {}
    fn inc_audio_received(&self, link: &'static str) {}
}

pub struct NoopSpeechMetrics;
impl SpeechMetrics for NoopSpeechMetrics {}

/// Settings replayed to the provider on connect and on every reconnect.
#[derive(Debug, Clone)]
pub struct VoiceAgentConfig {
    pub system_prompt: String,
    pub greeting: String,
    pub voice_id: String,
    pub llm_model: String,
    pub sample_rate_hz: u32,
}

#[derive(Debug, Clone)]
pub enum VoiceAgentEvent {
    UserStartedSpeaking,
    UserStoppedSpeaking,
    AgentAudioChunk(Bytes),
    AgentStartedSpeaking,
    AgentFinishedSpeaking,
    BargeIn,
    TranscriptDelta { role: String, text: String, is_final: bool },
    ProviderError { kind: String, message: String },
    Disconnected,
    Reconnected,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum VoiceAgentWireEvent {
    UserStartedSpeaking,
    UserStoppedSpeaking,
    AgentStartedSpeaking,
    AgentFinishedSpeaking,
    BargeIn,
    TranscriptDelta { role: String, text: String, is_final: bool },
    Error { kind: String, msg: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum VoiceAgentOutgoing {
    Settings {
        system_prompt: String,
        greeting: String,
        voice_id: String,
        llm_model: String,
        sample_rate: u32,
    },
    Whisper { text: String },
    KeepAlive,
}

/// Handle for the session controller / dual-connection manager. Cloning
/// is cheap; all clones share the same background connection task.
#[derive(Clone)]
pub struct VoiceAgentLink {
    audio_tx: mpsc::Sender<Bytes>,
    whisper_tx: mpsc::Sender<String>,
    shutdown_tx: watch::Sender<bool>,
    sent_since_keepalive: Arc<AtomicU32>,
}

impl VoiceAgentLink {
    /// Opens the link and spawns its background connection task. Per
    /// spec §4.6, initialization failure here is fatal to the session.
    pub async fn connect(
        url: String,
        request_headers: Vec<(String, String)>,
        config: VoiceAgentConfig,
        metrics: Arc<dyn SpeechMetrics>,
    ) -> SpeechResult<(Self, mpsc::Receiver<VoiceAgentEvent>)> {
        build_request(&url, &request_headers)?;

        let (audio_tx, audio_rx) = mpsc::channel(AUDIO_CHANNEL_CAPACITY);
        let (whisper_tx, whisper_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(EVENTS_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // First connection attempt happens inline so connect() can fail
        // fast, matching "initialization fails only if C4 fails" (§4.6).
        let request = build_request(&url, &request_headers)?;
        let (ws_stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| SpeechError::BadRequest(e.to_string()))?;

        let sent_since_keepalive = Arc::new(AtomicU32::new(0));
        tokio::spawn(run_voice_agent(
            url,
            request_headers,
            config,
            Some(ws_stream),
            audio_rx,
            whisper_rx,
            events_tx,
            shutdown_rx,
            metrics,
            sent_since_keepalive.clone(),
        ));

        Ok((
            Self { audio_tx, whisper_tx, shutdown_tx, sent_since_keepalive },
            events_rx,
        ))
    }

    pub async fn send_audio(&self, bytes: Bytes) -> SpeechResult<()> {
        self.sent_since_keepalive.fetch_add(1, Ordering::Relaxed);
        self.audio_tx.send(bytes).await.map_err(|_| SpeechError::ShuttingDown)
    }

    pub async fn send_whisper(&self, text: String) -> SpeechResult<()> {
        self.whisper_tx.send(text).await.map_err(|_| SpeechError::ShuttingDown)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

fn build_request(
    url: &str,
    headers: &[(String, String)],
) -> SpeechResult<tokio_tungstenite::tungstenite::handshake::client::Request> {
    let mut request = url
        .into_client_request()
        .map_err(|e| SpeechError::BadRequest(e.to_string()))?;
    for (name, value) in headers {
        let header_value = value
            .parse()
            .map_err(|_| SpeechError::BadRequest(format!("invalid header value for {name}")))?;
        request.headers_mut().insert(
            name.parse::<tokio_tungstenite::tungstenite::http::HeaderName>()
                .map_err(|_| SpeechError::BadRequest(format!("invalid header name {name}")))?,
            header_value,
        );
    }
    Ok(request)
}

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

#[allow(clippy::too_many_arguments)]
async fn run_voice_agent(
    url: String,
    headers: Vec<(String, String)>,
    config: VoiceAgentConfig,
    mut first_connection: Option<WsStream>,
    mut audio_rx: mpsc::Receiver<Bytes>,
    mut whisper_rx: mpsc::Receiver<String>,
    events_tx: mpsc::Sender<VoiceAgentEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
    metrics: Arc<dyn SpeechMetrics>,
    sent_since_keepalive: Arc<AtomicU32>,
) {
    const LINK: &str = "voice_agent";
    let mut attempt: u32 = 0;
    let mut backoff = INITIAL_BACKOFF;
    let mut last_paused: Option<bool> = None;
    let mut control_ring: std::collections::VecDeque<String> =
        std::collections::VecDeque::with_capacity(CONTROL_RING_CAPACITY);

    loop {
        if *shutdown_rx.borrow() {
            return;
        }

        let ws_stream = if let Some(s) = first_connection.take() {
            s
        } else {
            let request = match build_request(&url, &headers) {
                Ok(r) => r,
                Err(e) => {
                    warn!(link = LINK, error = %e, "cannot build reconnect request");
                    return;
                }
            };
            match tokio_tungstenite::connect_async(request).await {
                Ok((s, _)) => {
                    attempt = 0;
                    backoff = INITIAL_BACKOFF;
                    metrics.inc_reconnect(LINK);
                    let _ = events_tx.send(VoiceAgentEvent::Reconnected).await;
                    s
                }
                Err(e) => {
                    attempt += 1;
                    metrics.inc_connect_failure(LINK);
                    if attempt > MAX_RECONNECT_ATTEMPTS {
                        warn!(link = LINK, %attempt, "reconnect attempts exhausted");
                        return;
                    }
                    warn!(link = LINK, %attempt, error = %e, "connect failed, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            }
        };

        let (mut write, mut read) = ws_stream.split();

        // Replay the prompt, then pause state, then any ring-buffered
        // whisper text, before resuming live traffic.
        let settings = VoiceAgentOutgoing::Settings {
            system_prompt: config.system_prompt.clone(),
            greeting: config.greeting.clone(),
            voice_id: config.voice_id.clone(),
            llm_model: config.llm_model.clone(),
            sample_rate: config.sample_rate_hz,
        };
        if send_json(&mut write, &settings).await.is_err() {
            continue;
        }
        for pending in control_ring.iter() {
            let _ = write.send(Message::Text(pending.clone().into())).await;
        }

        let mut keep_alive = tokio::time::interval(KEEP_ALIVE_INTERVAL);
        keep_alive.tick().await; // first tick fires immediately

        let disconnect_reason = loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        let _ = write.close().await;
                        return;
                    }
                }
                Some(bytes) = audio_rx.recv() => {
                    if write.send(Message::Binary(bytes.to_vec().into())).await.is_err() {
                        break "audio send failed";
                    }
                    metrics.inc_audio_sent(LINK);
                }
                Some(text) = whisper_rx.recv() => {
                    let msg = VoiceAgentOutgoing::Whisper { text };
                    match serde_json::to_string(&msg) {
                        Ok(json) => {
                            if control_ring.len() == CONTROL_RING_CAPACITY {
                                control_ring.pop_front();
                            }
                            control_ring.push_back(json.clone());
                            if write.send(Message::Text(json.into())).await.is_err() {
                                break "whisper send failed";
                            }
                        }
                        Err(e) => warn!(link = LINK, error = %e, "failed to encode whisper"),
                    }
                }
                _ = keep_alive.tick() => {
                    if sent_since_keepalive.swap(0, Ordering::Relaxed) == 0 {
                        let msg = VoiceAgentOutgoing::KeepAlive;
                        if send_json(&mut write, &msg).await.is_err() {
                            break "keep_alive send failed";
                        }
                    }
                }
                incoming = read.next() => {
                    match incoming {
                        Some(Ok(message)) => {
                            if handle_inbound(message, &events_tx, &metrics, LINK).await.is_err() {
                                break "inbound channel closed";
                            }
                        }
                        Some(Err(e)) => {
                            warn!(link = LINK, error = %e, "read error");
                            break "read error";
                        }
                        None => break "stream closed",
                    }
                }
            }
        };

        debug!(link = LINK, reason = disconnect_reason, "connection ended, reconnecting");
        let _ = events_tx.send(VoiceAgentEvent::Disconnected).await;
        let _ = last_paused.take();
    }
}

async fn send_json<S>(
    write: &mut futures_util::stream::SplitSink<S, Message>,
    value: &impl Serialize,
) -> Result<(), ()>
where
    S: futures_util::Sink<Message> + Unpin,
{
    match serde_json::to_string(value) {
        Ok(json) => write.send(Message::Text(json.into())).await.map_err(|_| ()),
        Err(_) => Err(()),
    }
}

async fn handle_inbound(
    message: Message,
    events_tx: &mpsc::Sender<VoiceAgentEvent>,
    metrics: &Arc<dyn SpeechMetrics>,
    link: &'static str,
) -> Result<(), ()> {
    match message {
        Message::Binary(data) => {
            metrics.inc_audio_received(link);
            events_tx
                .send(VoiceAgentEvent::AgentAudioChunk(Bytes::from(data.to_vec())))
                .await
                .map_err(|_| ())
        }
        Message::Text(text) => {
            match serde_json::from_str::<VoiceAgentWireEvent>(&text) {
                Ok(wire) => {
                    let event = match wire {
                        VoiceAgentWireEvent::UserStartedSpeaking => VoiceAgentEvent::UserStartedSpeaking,
                        VoiceAgentWireEvent::UserStoppedSpeaking => VoiceAgentEvent::UserStoppedSpeaking,
                        VoiceAgentWireEvent::AgentStartedSpeaking => VoiceAgentEvent::AgentStartedSpeaking,
                        VoiceAgentWireEvent::AgentFinishedSpeaking => VoiceAgentEvent::AgentFinishedSpeaking,
                        VoiceAgentWireEvent::BargeIn => VoiceAgentEvent::BargeIn,
                        VoiceAgentWireEvent::TranscriptDelta { role, text, is_final } => {
                            VoiceAgentEvent::TranscriptDelta { role, text, is_final }
                        }
                        VoiceAgentWireEvent::Error { kind, msg } => {
                            metrics.inc_provider_error(link);
                            VoiceAgentEvent::ProviderError { kind, message: msg }
                        }
                    };
                    events_tx.send(event).await.map_err(|_| ())
                }
                Err(e) => {
                    debug!(link, error = %e, "ignoring malformed provider message");
                    Ok(())
                }
            }
        }
        Message::Close(_) => Err(()),
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Ok(()),
    }
}

// --- Transcription link (C5): outgoing audio only, incoming transcripts. ---

#[derive(Debug, Clone)]
pub enum TranscriptionEvent {
    Transcript { text: String, is_final: bool },
    Disconnected,
    Reconnected,
}

#[derive(Debug, Clone, Deserialize)]
struct TranscriptionWireEvent {
    text: String,
    is_final: bool,
}

#[derive(Clone)]
pub struct TranscriptionLink {
    audio_tx: mpsc::Sender<Bytes>,
    shutdown_tx: watch::Sender<bool>,
}

impl TranscriptionLink {
    /// Opens the link. Per spec §4.6, failure here is logged but
    /// non-fatal to the session; the caller decides whether to proceed.
    pub async fn connect(
        url: String,
        request_headers: Vec<(String, String)>,
        metrics: Arc<dyn SpeechMetrics>,
    ) -> SpeechResult<(Self, mpsc::Receiver<TranscriptionEvent>)> {
        let request = build_request(&url, &request_headers)?;
        let (ws_stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| SpeechError::BadRequest(e.to_string()))?;

        let (audio_tx, audio_rx) = mpsc::channel(AUDIO_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(EVENTS_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(run_transcription(
            url,
            request_headers,
            Some(ws_stream),
            audio_rx,
            events_tx,
            shutdown_rx,
            metrics,
        ));

        Ok((Self { audio_tx, shutdown_tx }, events_rx))
    }

    pub async fn send_audio(&self, bytes: Bytes) -> SpeechResult<()> {
        self.audio_tx.send(bytes).await.map_err(|_| SpeechError::ShuttingDown)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn run_transcription(
    url: String,
    headers: Vec<(String, String)>,
    mut first_connection: Option<WsStream>,
    mut audio_rx: mpsc::Receiver<Bytes>,
    events_tx: mpsc::Sender<TranscriptionEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
    metrics: Arc<dyn SpeechMetrics>,
) {
    const LINK: &str = "transcription";
    let mut attempt: u32 = 0;
    let mut backoff = INITIAL_BACKOFF;

    loop {
        if *shutdown_rx.borrow() {
            return;
        }

        let ws_stream = if let Some(s) = first_connection.take() {
            s
        } else {
            let request = match build_request(&url, &headers) {
                Ok(r) => r,
                Err(e) => {
                    warn!(link = LINK, error = %e, "cannot build reconnect request");
                    return;
                }
            };
            match tokio_tungstenite::connect_async(request).await {
                Ok((s, _)) => {
                    attempt = 0;
                    backoff = INITIAL_BACKOFF;
                    metrics.inc_reconnect(LINK);
                    let _ = events_tx.send(TranscriptionEvent::Reconnected).await;
                    s
                }
                Err(e) => {
                    attempt += 1;
                    metrics.inc_connect_failure(LINK);
                    if attempt > MAX_RECONNECT_ATTEMPTS {
                        warn!(link = LINK, "reconnect attempts exhausted");
                        return;
                    }
                    warn!(link = LINK, %attempt, error = %e, "connect failed, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            }
        };

        let (mut write, mut read) = ws_stream.split();
        let disconnect_reason = loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        let _ = write.close().await;
                        return;
                    }
                }
                Some(bytes) = audio_rx.recv() => {
                    if write.send(Message::Binary(bytes.to_vec().into())).await.is_err() {
                        break "audio send failed";
                    }
                    metrics.inc_audio_sent(LINK);
                }
                incoming = read.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<TranscriptionWireEvent>(&text) {
                                Ok(wire) => {
                                    metrics.inc_audio_received(LINK);
                                    if events_tx
                                        .send(TranscriptionEvent::Transcript {
                                            text: wire.text,
                                            is_final: wire.is_final,
                                        })
                                        .await
                                        .is_err()
                                    {
                                        break "inbound channel closed";
                                    }
                                }
                                Err(e) => debug!(link = LINK, error = %e, "ignoring malformed transcript message"),
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break "stream closed",
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(link = LINK, error = %e, "read error");
                            break "read error";
                        }
                    }
                }
            }
        };

        debug!(link = LINK, reason = disconnect_reason, "connection ended, reconnecting");
        let _ = events_tx.send(TranscriptionEvent::Disconnected).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn voice_agent_wire_event_parses_transcript_delta() {
        let json = r#"{"type":"transcript_delta","role":"ai","text":"Hello","is_final":false}"#;
        let parsed: VoiceAgentWireEvent = serde_json::from_str(json).unwrap();
        match parsed {
            VoiceAgentWireEvent::TranscriptDelta { role, text, is_final } => {
                assert_eq!(role, "ai");
                assert_eq!(text, "Hello");
                assert!(!is_final);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn voice_agent_wire_event_parses_barge_in() {
        let json = r#"{"type":"barge_in"}"#;
        let parsed: VoiceAgentWireEvent = serde_json::from_str(json).unwrap();
        assert!(matches!(parsed, VoiceAgentWireEvent::BargeIn));
    }

    #[test]
    fn settings_outgoing_serializes_tagged() {
        let msg = VoiceAgentOutgoing::Settings {
            system_prompt: "be helpful".into(),
            greeting: "hi".into(),
            voice_id: "v1".into(),
            llm_model: "m1".into(),
            sample_rate: 24_000,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"settings\""));
        assert!(json.contains("\"sample_rate\":24000"));
    }

    #[test]
    fn transcription_wire_event_parses() {
        let json = r#"{"text":"hello there","is_final":true}"#;
        let parsed: TranscriptionWireEvent = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.text, "hello there");
        assert!(parsed.is_final);
    }
}
