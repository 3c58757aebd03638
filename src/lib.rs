//! Client side of an image and video compression tool.
//!
//! Files are imported into a [`TaskStore`](state::TaskStore), compressed by a
//! native backend reached over [`bridge`], and tracked through the
//! asynchronous image job pipeline in [`job`].

pub mod bridge;
pub mod classify;
pub mod config;
pub mod constants;
pub mod events;
pub mod job;
pub mod services;
pub mod state;
