//! Job domain types for requests taken off the relay network.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::{Event, EventId, Kind, PublicKey};

/// Status of a job as tracked in memory and announced to customers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Request was taken off the relay and queued.
    #[default]
    Received,
    /// Work has been announced and is running.
    Processing,
    /// Result was published.
    Completed,
    /// Work or publication failed.
    Failed,
}

impl JobStatus {
    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Received => "received",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a request is in the dispatch pipeline.
///
/// `Queued -> Announcing -> Working -> Publishing -> Done`, or straight to
/// `Skipped` when the request id was already completed. `AwaitingPayment`
/// ends a job whose handler reported it unpaid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStage {
    Queued,
    Announcing,
    Working,
    Publishing,
    Done,
    Skipped,
    AwaitingPayment,
}

impl DispatchStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchStage::Queued => "queued",
            DispatchStage::Announcing => "announcing",
            DispatchStage::Working => "working",
            DispatchStage::Publishing => "publishing",
            DispatchStage::Done => "done",
            DispatchStage::Skipped => "skipped",
            DispatchStage::AwaitingPayment => "awaiting_payment",
        }
    }
}

impl std::fmt::Display for DispatchStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An inbound job request. Immutable once received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    /// Id of the request event.
    pub id: EventId,
    /// Job type.
    pub kind: Kind,
    /// Request content.
    pub payload: String,
    /// When the listener took the request off the relay.
    pub received_at: DateTime<Utc>,
    /// Author of the request.
    pub customer: PublicKey,
    /// Relay the request arrived from, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay_url: Option<String>,
    /// The full request event, echoed back in results.
    pub event: Event,
}

impl JobRequest {
    /// Capture a request from an inbound event.
    pub fn from_event(event: Event, relay_url: Option<String>) -> Self {
        Self {
            id: event.id.clone(),
            kind: event.kind,
            payload: event.content.clone(),
            received_at: Utc::now(),
            customer: event.pubkey.clone(),
            relay_url,
            event,
        }
    }

    /// Input data from the request's `i` tags, in tag order.
    pub fn inputs(&self) -> impl Iterator<Item = &str> {
        self.event.tags_named("i").filter_map(|t| t.value())
    }

    /// Value of the first `["param", name, value]` tag.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.event
            .tags_named("param")
            .find(|t| t.get(1) == Some(name))
            .and_then(|t| t.get(2))
    }
}

/// Result of a completed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    /// Request this result answers.
    pub request_id: EventId,
    /// Id of the published result event.
    pub result_id: EventId,
    /// Output of the work function.
    pub content: String,
    /// Cost in millisats, zero when free.
    pub amount_msats: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventTemplate, Tag, Timestamp};

    #[test]
    fn request_reads_inputs_and_params() {
        let event = EventTemplate::new(Kind(5050), "ping")
            .with_tag(Tag::new(["i", "first", "text"]))
            .with_tag(Tag::new(["param", "model", "tiny"]))
            .with_tag(Tag::new(["i", "second", "text"]))
            .into_event(PublicKey::from_bytes([3; 32]), Timestamp::now(), String::new());

        let request = JobRequest::from_event(event.clone(), Some("wss://relay.test".into()));

        assert_eq!(request.id, event.id);
        assert_eq!(request.kind, Kind(5050));
        assert_eq!(request.payload, "ping");
        assert_eq!(request.customer, event.pubkey);
        assert_eq!(request.inputs().collect::<Vec<_>>(), ["first", "second"]);
        assert_eq!(request.param("model"), Some("tiny"));
        assert_eq!(request.param("temperature"), None);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Received.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }
}
