pub mod config;
pub mod egress;
pub mod http;
pub mod labels;
pub mod router;
pub mod session;
pub mod speech;

pub use config::MetricsConfig;
pub use egress::EgressMetricsImpl;
pub use http::MetricsServer;
pub use labels::{BoundedLabel, LabelPolicy};
pub use router::RouterMetricsImpl;
pub use session::SessionMetricsImpl;
pub use speech::SpeechMetricsImpl;
