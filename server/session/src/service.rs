use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use coach_dual::{DualConnectionManager, TranscriptEntry as DualTranscriptEntry, TranscriptSource};
use coach_router::{classify, Role, RoleProvider};

use crate::ids::SessionId;
use crate::model::{CompleteSessionOptions, Sender, StoredMessage};
use crate::repo::SessionRepo;

/// Grace period after the last human leaves before the supervisor tears
/// the session down (spec §4.8/§8 scenario 4).
pub const GRACE_PERIOD: Duration = Duration::from_secs(60);

#[async_trait]
pub trait DataChannelPublisher: Send + Sync {
    async fn publish(&self, json: String);
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum DataChannelMessage {
    CoachMute { muted: bool, #[serde(rename = "coachIdentity")] coach_identity: String },
    CoachWhisper { text: String },
    PauseAi { paused: bool },
}

/// Session controller (C8): role map, grace timer, data-channel decode,
/// transcript broadcast, and buffered persistence.
pub struct SessionController<R: SessionRepo> {
    repo: Arc<R>,
    room_id: String,
    dual: DualConnectionManager,
    publisher: Arc<dyn DataChannelPublisher>,
    session_id: RwLock<Option<SessionId>>,
    roles: RwLock<HashMap<String, Role>>,
    pending: Mutex<Vec<StoredMessage>>,
    grace_token: Mutex<Option<CancellationToken>>,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
}

impl<R: SessionRepo + 'static> SessionController<R> {
    pub fn new(
        repo: Arc<R>,
        room_id: String,
        dual: DualConnectionManager,
        publisher: Arc<dyn DataChannelPublisher>,
        shutdown_tx: tokio::sync::watch::Sender<bool>,
    ) -> Self {
        Self {
            repo,
            room_id,
            dual,
            publisher,
            session_id: RwLock::new(None),
            roles: RwLock::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
            grace_token: Mutex::new(None),
            shutdown_tx,
        }
    }

    /// Session open (spec §4.8): called once before participants
    /// register. On failure the session proceeds with no persistence.
    pub async fn open(&self, primary_user_id: Option<Uuid>) {
        match self.repo.create_session(&self.room_id, primary_user_id).await {
            Ok(id) => *self.session_id.write() = Some(id),
            Err(e) => warn!(room = %self.room_id, error = %e, "create_session failed, persistence disabled"),
        }
    }

    pub fn on_participant_joined(&self, identity: &str, _name: &str, metadata: Option<&serde_json::Value>) {
        let role = classify(identity, metadata);
        self.roles.write().insert(identity.to_string(), role);
        self.dual.register_participant(identity);
        self.cancel_grace_timer();
    }

    pub fn on_participant_left(&self, identity: &str) {
        self.roles.write().remove(identity);
        self.dual.unregister_participant(identity);
        if self.human_count() == 0 {
            self.start_grace_timer();
        }
    }

    pub fn human_count(&self) -> usize {
        self.roles.read().values().filter(|r| **r != Role::Ai).count()
    }

    fn start_grace_timer(&self) {
        let token = CancellationToken::new();
        *self.grace_token.lock() = Some(token.clone());
        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(GRACE_PERIOD) => {
                    info!("grace period elapsed with no participants, initiating shutdown");
                    let _ = shutdown_tx.send(true);
                }
                _ = token.cancelled() => {
                    debug!("grace timer cancelled, a participant rejoined");
                }
            }
        });
    }

    fn cancel_grace_timer(&self) {
        if let Some(token) = self.grace_token.lock().take() {
            token.cancel();
        }
    }

    /// Decodes one inbound data-channel message (spec §4.8 table).
    /// Malformed payloads are silently dropped (§7 DataChannelMalformed).
    pub async fn handle_data_message(&self, bytes: &[u8]) {
        let text = match std::str::from_utf8(bytes) {
            Ok(t) => t,
            Err(_) => return,
        };
        let message: DataChannelMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "ignoring malformed data-channel message");
                return;
            }
        };
        match message {
            DataChannelMessage::CoachMute { muted, coach_identity } => {
                if muted {
                    self.dual.mute_participant(&coach_identity);
                } else {
                    self.dual.unmute_participant(&coach_identity);
                }
            }
            DataChannelMessage::CoachWhisper { text } => {
                if let Err(e) = self.dual.send_coach_whisper(text).await {
                    warn!(error = %e, "failed to forward coach whisper");
                }
            }
            DataChannelMessage::PauseAi { paused } => {
                if paused {
                    self.dual.pause_ai();
                } else {
                    self.dual.resume_ai();
                }
                self.broadcast_pause_state(paused).await;
            }
        }
    }

    async fn broadcast_pause_state(&self, paused: bool) {
        let payload = json!({
            "type": "ai_pause_state",
            "paused": paused,
            "timestamp": Utc::now().to_rfc3339(),
        });
        self.publisher.publish(payload.to_string()).await;
    }

    /// Consumes one transcript event surfaced by the dual-connection
    /// manager: broadcasts it on the data channel and, when final,
    /// persists it (spec §4.8, P6).
    pub async fn handle_transcript(&self, entry: DualTranscriptEntry) {
        let role_str = entry.role.clone();
        let payload = json!({
            "type": "transcript",
            "role": role_str,
            "content": entry.content,
            "timestamp": Utc::now().to_rfc3339(),
        });
        self.publisher.publish(payload.to_string()).await;

        if !entry.is_final {
            return;
        }

        let sender = match entry.source {
            TranscriptSource::Transcription => Sender::Client,
            TranscriptSource::VoiceAgent if entry.role == "ai" => Sender::Ai,
            TranscriptSource::VoiceAgent => Sender::Client,
        };
        self.persist_or_buffer(entry.content, sender, None).await;
    }

    async fn persist_or_buffer(&self, content: String, sender: Sender, user_id: Option<Uuid>) {
        let Some(session_id) = *self.session_id.read() else { return };
        let message = StoredMessage::new(session_id, content, sender, user_id);
        if let Err(e) = self.repo.store_message(&message).await {
            warn!(error = %e, "store_message failed, buffering for retry at session close");
            self.pending.lock().push(message);
        }
    }

    /// Session close (spec §4.8): flush buffered messages best effort,
    /// then complete the session with transcript generation (spec §6
    /// "complete_session(session_id, {generate_transcript: bool, ...})").
    pub async fn close(&self, ai_summary: Option<String>) {
        let buffered: Vec<StoredMessage> = std::mem::take(&mut *self.pending.lock());
        for message in buffered {
            if let Err(e) = self.repo.store_message(&message).await {
                warn!(error = %e, "buffered message retry failed, dropping");
            }
        }

        if let Some(session_id) = *self.session_id.read() {
            let options = CompleteSessionOptions { generate_transcript: true, ai_summary };
            if let Err(e) = self.repo.complete_session(session_id, options).await {
                warn!(error = %e, "complete_session failed");
            }
        }
    }
}

impl<R: SessionRepo> RoleProvider for SessionController<R> {
    fn role_of(&self, participant_id: &str) -> Option<Role> {
        self.roles.read().get(participant_id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coach_mute_message_parses() {
        let json = r#"{"type":"coach_mute","muted":true,"coachIdentity":"coach-a"}"#;
        let parsed: DataChannelMessage = serde_json::from_str(json).unwrap();
        match parsed {
            DataChannelMessage::CoachMute { muted, coach_identity } => {
                assert!(muted);
                assert_eq!(coach_identity, "coach-a");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn pause_ai_message_parses() {
        let json = r#"{"type":"pause_ai","paused":false}"#;
        let parsed: DataChannelMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(parsed, DataChannelMessage::PauseAi { paused: false }));
    }
}
