//! SparkLoop Relay - keeps SparkLoop subscribers in step with Ghost.
//!
//! Ghost member webhooks and direct API calls are authenticated, normalized
//! into a [`SubscriberEvent`] and pushed to SparkLoop. Successful syncs are
//! written to an audit trail and announced in chat.
//!
//! ## Architecture
//!
//! ```text
//! Request → Router → (Rate Limiter, Verifier) → Normalizer → Synchronizer
//!                                                               │
//!                                  Response ← join(Audit Recorder, Notifier)
//! ```

pub mod audit;
pub mod config;
pub mod error;
pub mod event;
pub mod normalize;
pub mod notify;
pub mod sync;
pub mod web;

// Re-export commonly used types
pub use audit::{AuditRecorder, EventStore, InMemoryEventStore};
pub use config::Config;
pub use error::RelayError;
pub use event::{SubscriberEvent, SubscriberStatus};
pub use notify::Notifier;
pub use sync::{SparkLoopClient, SubscriberApi, Synchronizer};
pub use web::{app_router, AppState};
