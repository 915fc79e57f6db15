//! Event types for in-process lifecycle updates.
//!
//! These are broadcast to local observers (tests, dashboards, logs); they are
//! never published to relays.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{DispatchStage, EventId, FeedbackStatus, JobStatus, Kind, WorkerState};

/// Events emitted by the worker as requests move through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    // Intake events
    /// A request was taken off a relay and queued.
    RequestReceived {
        request_id: EventId,
        kind: Kind,
        relay_url: Option<String>,
        timestamp: DateTime<Utc>,
    },
    /// A relay sent a protocol message that was not an event.
    RelayMessage {
        relay_url: String,
        message: String,
        timestamp: DateTime<Utc>,
    },

    // Dispatch events
    /// A request was skipped because it was already completed.
    JobSkipped {
        request_id: EventId,
        result_id: EventId,
        timestamp: DateTime<Utc>,
    },
    /// A feedback event was published for a request.
    StatusPublished {
        request_id: EventId,
        status: FeedbackStatus,
        event_id: EventId,
        timestamp: DateTime<Utc>,
    },
    /// Work started on a request.
    JobStarted {
        request_id: EventId,
        timestamp: DateTime<Utc>,
    },
    /// A result was published and recorded.
    JobCompleted {
        request_id: EventId,
        result_id: EventId,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    /// A job failed at the given stage.
    JobFailed {
        request_id: EventId,
        stage: DispatchStage,
        error: String,
        timestamp: DateTime<Utc>,
    },
    /// The payment hook reported the request unpaid.
    PaymentRequired {
        request_id: EventId,
        amount_msats: Option<u64>,
        timestamp: DateTime<Utc>,
    },
    /// An in-flight job was abandoned at shutdown.
    JobInterrupted {
        request_id: EventId,
        stage: DispatchStage,
        timestamp: DateTime<Utc>,
    },

    // Worker events
    /// The worker moved between lifecycle states.
    WorkerStateChanged {
        old_state: WorkerState,
        new_state: WorkerState,
        timestamp: DateTime<Utc>,
    },
}

impl JobEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            JobEvent::RequestReceived { timestamp, .. } => *timestamp,
            JobEvent::RelayMessage { timestamp, .. } => *timestamp,
            JobEvent::JobSkipped { timestamp, .. } => *timestamp,
            JobEvent::StatusPublished { timestamp, .. } => *timestamp,
            JobEvent::JobStarted { timestamp, .. } => *timestamp,
            JobEvent::JobCompleted { timestamp, .. } => *timestamp,
            JobEvent::JobFailed { timestamp, .. } => *timestamp,
            JobEvent::PaymentRequired { timestamp, .. } => *timestamp,
            JobEvent::JobInterrupted { timestamp, .. } => *timestamp,
            JobEvent::WorkerStateChanged { timestamp, .. } => *timestamp,
        }
    }

    /// Get the request id associated with this event, if any.
    pub fn request_id(&self) -> Option<&EventId> {
        match self {
            JobEvent::RequestReceived { request_id, .. }
            | JobEvent::JobSkipped { request_id, .. }
            | JobEvent::StatusPublished { request_id, .. }
            | JobEvent::JobStarted { request_id, .. }
            | JobEvent::JobCompleted { request_id, .. }
            | JobEvent::JobFailed { request_id, .. }
            | JobEvent::PaymentRequired { request_id, .. }
            | JobEvent::JobInterrupted { request_id, .. } => Some(request_id),
            JobEvent::RelayMessage { .. } | JobEvent::WorkerStateChanged { .. } => None,
        }
    }

    /// Whether this event ends the dispatch of a request.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobEvent::JobSkipped { .. }
                | JobEvent::JobCompleted { .. }
                | JobEvent::JobFailed { .. }
                | JobEvent::PaymentRequired { .. }
                | JobEvent::JobInterrupted { .. }
        )
    }

    /// Job status this event moves its request to, if any.
    pub fn job_status(&self) -> Option<JobStatus> {
        match self {
            JobEvent::RequestReceived { .. } => Some(JobStatus::Received),
            JobEvent::JobStarted { .. } => Some(JobStatus::Processing),
            JobEvent::StatusPublished { status, .. } => match status {
                FeedbackStatus::Processing | FeedbackStatus::Partial => Some(JobStatus::Processing),
                FeedbackStatus::Success => Some(JobStatus::Completed),
                FeedbackStatus::Error => Some(JobStatus::Failed),
                FeedbackStatus::PaymentRequired => None,
            },
            JobEvent::JobCompleted { .. } | JobEvent::JobSkipped { .. } => {
                Some(JobStatus::Completed)
            }
            JobEvent::JobFailed { .. }
            | JobEvent::PaymentRequired { .. }
            | JobEvent::JobInterrupted { .. } => Some(JobStatus::Failed),
            JobEvent::RelayMessage { .. } | JobEvent::WorkerStateChanged { .. } => None,
        }
    }

    /// Get a short description of this event for logging.
    pub fn description(&self) -> String {
        match self {
            JobEvent::RequestReceived {
                request_id, kind, ..
            } => format!("Request {} (kind {}) received", request_id, kind),
            JobEvent::RelayMessage { relay_url, .. } => {
                format!("Message from {}", relay_url)
            }
            JobEvent::JobSkipped {
                request_id,
                result_id,
                ..
            } => format!("Request {} skipped, already answered by {}", request_id, result_id),
            JobEvent::StatusPublished {
                request_id, status, ..
            } => format!("Request {} -> {}", request_id, status),
            JobEvent::JobStarted { request_id, .. } => format!("Job {} started", request_id),
            JobEvent::JobCompleted {
                request_id,
                duration_ms,
                ..
            } => format!("Job {} completed in {}ms", request_id, duration_ms),
            JobEvent::JobFailed {
                request_id,
                stage,
                error,
                ..
            } => format!("Job {} failed while {}: {}", request_id, stage, error),
            JobEvent::PaymentRequired {
                request_id,
                amount_msats,
                ..
            } => match amount_msats {
                Some(amount) => format!("Job {} requires payment of {} msats", request_id, amount),
                None => format!("Job {} requires payment", request_id),
            },
            JobEvent::JobInterrupted {
                request_id, stage, ..
            } => format!("Job {} interrupted while {}", request_id, stage),
            JobEvent::WorkerStateChanged { new_state, .. } => {
                format!("Worker -> {}", new_state)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> EventId {
        EventId::from_bytes([1; 32])
    }

    #[test]
    fn terminal_events_carry_their_request() {
        let completed = JobEvent::JobCompleted {
            request_id: id(),
            result_id: EventId::from_bytes([2; 32]),
            duration_ms: 12,
            timestamp: Utc::now(),
        };
        assert!(completed.is_terminal());
        assert_eq!(completed.request_id(), Some(&id()));
        assert_eq!(completed.job_status(), Some(JobStatus::Completed));

        let started = JobEvent::JobStarted {
            request_id: id(),
            timestamp: Utc::now(),
        };
        assert!(!started.is_terminal());
        assert_eq!(started.job_status(), Some(JobStatus::Processing));
    }

    #[test]
    fn failures_map_to_failed_status() {
        let failed = JobEvent::JobFailed {
            request_id: id(),
            stage: DispatchStage::Publishing,
            error: "relay rejected event".into(),
            timestamp: Utc::now(),
        };
        assert_eq!(failed.job_status(), Some(JobStatus::Failed));
        assert!(failed.description().contains("publishing"));

        let state = JobEvent::WorkerStateChanged {
            old_state: WorkerState::Running,
            new_state: WorkerState::Stopping,
            timestamp: Utc::now(),
        };
        assert_eq!(state.request_id(), None);
        assert_eq!(state.job_status(), None);
    }

    #[test]
    fn serializes_with_event_tag() {
        let event = JobEvent::JobInterrupted {
            request_id: id(),
            stage: DispatchStage::Working,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "job_interrupted");
        assert_eq!(json["stage"], "working");
    }
}
