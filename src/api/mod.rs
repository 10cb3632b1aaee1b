//! API layer
//!
//! HTTP handlers for:
//! - ActivityPub (for federation)
//! - WebFinger
//! - Metrics (Prometheus)

mod activitypub;
pub mod metrics;
mod wellknown;

pub use activitypub::{PAGE_SIZE, activitypub_router};
pub use metrics::metrics_router;
pub use wellknown::wellknown_router;
