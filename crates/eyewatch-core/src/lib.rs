//! eyewatch-core: pure domain types for the device-monitoring backend.
//! Device identifiers, telemetry namespaces, the tracking lifecycle state
//! machine and FAQ matching. No IO, no async.

pub mod error;
pub mod faq;
pub mod lifecycle;
pub mod transcript;
pub mod types;

pub use error::CoreError;
pub use faq::{FaqCorpus, FaqEntry, FaqMatch, fuzzy_score};
pub use lifecycle::{LifecycleAction, LifecycleEvent, StopOutcome, TrackingLifecycle, TrackingState};
pub use transcript::{AnswerSource, ChatMessage, Sender, Transcript};
pub use types::{DeviceId, Namespace, TelemetryCategory, TimeRange, parse_timestamp};
