//! API layer
//!
//! HTTP handlers for:
//! - ActivityPub (group actors, inboxes, collections)
//! - WebFinger discovery
//! - Metrics (Prometheus)

mod activitypub;
mod metrics;
mod wellknown;

pub use activitypub::activitypub_router;
pub use metrics::metrics_router;
pub use wellknown::wellknown_router;
