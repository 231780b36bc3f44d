//! Conferencing SDK boundary (spec §6): the SDK itself is an external
//! collaborator named by interface only. Everything downstream of the
//! room (ingress routing, the dual speech links, the jitter buffer,
//! session lifecycle) is exercised purely against these trait objects,
//! the way `gateway/src/main.rs` wires `Gateway` against `AuthProvider`
//! rather than a concrete credential store.

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

use coach_egress::OutboundAudioSink;
use coach_router::ParticipantAudioStream;
use coach_session::DataChannelPublisher;

/// One inbound room event, as the conferencing SDK would hand it to the
/// agent (spec §6 "Conferencing SDK (inbound)").
pub enum RoomEvent {
    ParticipantJoined {
        identity: String,
        name: String,
        metadata: Option<Value>,
    },
    ParticipantLeft {
        identity: String,
    },
    AudioTrackSubscribed {
        participant_id: String,
        name: String,
        stream: Box<dyn ParticipantAudioStream>,
    },
    DataReceived {
        bytes: Bytes,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ConferencingError {
    #[error("conferencing connect failed: {0}")]
    Connect(String),
}

/// The room connection itself. A concrete adapter for a real conferencing
/// SDK lives outside this specification's scope; this trait is the
/// contract such an adapter fulfils.
#[async_trait]
pub trait ConferencingClient: Send + Sync {
    /// Joins the configured room and returns the inbound event stream
    /// plus the outbound audio/data-channel handles for publishing.
    async fn connect(
        &self,
    ) -> Result<(mpsc::Receiver<RoomEvent>, Arc<dyn OutboundAudioSink>, Arc<dyn DataChannelPublisher>), ConferencingError>;
}

/// Stand-in used until a deployment links a real conferencing adapter,
/// mirroring `gateway/src/main.rs`'s `DevAuthProvider` placeholder: the
/// trait boundary is real and exercised end to end, only the concrete
/// network adapter is out of scope here.
pub struct UnlinkedConferencingClient;

#[async_trait]
impl ConferencingClient for UnlinkedConferencingClient {
    async fn connect(
        &self,
    ) -> Result<(mpsc::Receiver<RoomEvent>, Arc<dyn OutboundAudioSink>, Arc<dyn DataChannelPublisher>), ConferencingError>
    {
        Err(ConferencingError::Connect(
            "no conferencing adapter linked into this build".to_string(),
        ))
    }
}
