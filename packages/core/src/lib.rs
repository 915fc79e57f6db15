//! Core domain types for the job worker.
//!
//! This crate contains shared types used across all packages:
//! - JobRequest, JobResult and JobStatus for work items
//! - The relay event envelope and the builders for job feedback/results
//! - Worker configuration and lifecycle state
//! - Events for in-process lifecycle updates

mod config;
mod event;
mod events;
mod job;
mod worker;

pub use config::{ConfigError, WorkerConfig};
pub use event::{
    Event, EventBuilder, EventError, EventId, EventTemplate, FeedbackStatus, Filter,
    JOB_REQUEST_KINDS, Kind, PublicKey, Tag, Timestamp,
};
pub use events::JobEvent;
pub use job::{DispatchStage, JobRequest, JobResult, JobStatus};
pub use worker::{WorkerState, WorkerStats};
