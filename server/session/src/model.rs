use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::{MessageId, SessionId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    Client,
    Coach,
    Ai,
}

#[derive(Clone, Debug)]
pub struct CoachingSession {
    pub id: SessionId,
    pub room_id: String,
    pub primary_user_id: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub transcript_concat: Option<String>,
    pub ai_summary: Option<String>,
}

/// Options for session completion (spec §6 "complete_session(session_id,
/// {generate_transcript: bool, ai_summary?})").
#[derive(Clone, Debug, Default)]
pub struct CompleteSessionOptions {
    pub generate_transcript: bool,
    pub ai_summary: Option<String>,
}

#[derive(Clone, Debug)]
pub struct StoredMessage {
    pub id: MessageId,
    pub session_id: SessionId,
    pub content: String,
    pub sender: Sender,
    pub user_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    pub fn new(session_id: SessionId, content: String, sender: Sender, user_id: Option<Uuid>) -> Self {
        Self { id: MessageId::new(), session_id, content, sender, user_id, created_at: Utc::now() }
    }
}
