//! Asynchronous image job pipeline.
//!
//! A run subscribes to the backend's progress channel, submits a
//! [`JobRequest`](types::JobRequest), projects routed signals onto the
//! [`TaskStore`](crate::state::TaskStore) as they arrive and finally
//! reconciles against the backend's authoritative snapshot. When the job API
//! is missing the same plan is replayed through the legacy per-file command.

pub mod client;
pub mod detail;
pub mod error;
mod legacy;
pub mod request;
pub mod router;
pub mod types;

pub use client::{FileOutcome, ImageJobClient, JobReport, JobSlot, Projection};
pub use detail::{DetailJobRunner, DetailKind, Notification, NotificationOutcome, NotificationQueue};
pub use error::JobError;
pub use request::{JobPlan, JobRequestBuilder, RenderFormat, RenderSettings};
pub use router::{JobSignal, JobSubscription};
