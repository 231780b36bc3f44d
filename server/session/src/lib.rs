//! Session controller (C8): the single authority for role classification,
//! join/leave lifecycle, data-channel decoding, transcript broadcast, and
//! buffered persistence for one coaching room.

pub mod errors;
pub mod ids;
pub mod model;
pub mod repo;
pub mod service;

pub use errors::{SessionError, SessionResult};
pub use ids::{MessageId, SessionId};
pub use model::{CompleteSessionOptions, CoachingSession, Sender, StoredMessage};
pub use repo::{PgSessionRepo, SessionRepo};
pub use service::{DataChannelPublisher, SessionController, GRACE_PERIOD};
