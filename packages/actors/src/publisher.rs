//! Status and result publication.

use std::sync::Arc;
use std::time::Duration;

use dvm_core::{EventBuilder, EventError, EventId, FeedbackStatus, JobRequest, JobResult};

use crate::transport::{EventSigner, RelayTransport, SignerError, TransportError};

/// Publication errors.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("failed to build event: {0}")]
    Build(#[from] EventError),

    #[error(transparent)]
    Sign(#[from] SignerError),

    #[error("publishing {event_id} failed after {attempts} attempt(s): {source}")]
    Transport {
        event_id: EventId,
        attempts: u32,
        source: TransportError,
    },
}

impl PublishError {
    /// Id of the signed event that could not be published, if signing succeeded.
    pub fn event_id(&self) -> Option<&EventId> {
        match self {
            PublishError::Transport { event_id, .. } => Some(event_id),
            _ => None,
        }
    }
}

/// Signs and publishes feedback and result events for job requests.
#[derive(Clone)]
pub struct Publisher {
    transport: Arc<dyn RelayTransport>,
    signer: Arc<dyn EventSigner>,
    result_attempts: u32,
    retry_delay: Duration,
}

impl Publisher {
    /// Create a publisher that tries results twice, 500ms apart.
    pub fn new(transport: Arc<dyn RelayTransport>, signer: Arc<dyn EventSigner>) -> Self {
        Self {
            transport,
            signer,
            result_attempts: 2,
            retry_delay: Duration::from_millis(500),
        }
    }

    /// Set the result retry policy. `attempts` is clamped to at least 1.
    pub fn with_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.result_attempts = attempts.max(1);
        self.retry_delay = delay;
        self
    }

    /// Publish a feedback event. Single attempt: feedback is best-effort.
    pub async fn publish_feedback(
        &self,
        request: &JobRequest,
        status: FeedbackStatus,
        extra_info: Option<&str>,
        amount_msats: Option<u64>,
    ) -> Result<EventId, PublishError> {
        let template = EventBuilder::job_feedback(&request.event, status, extra_info, amount_msats);
        let event = self.signer.sign(template)?;
        let event_id = event.id.clone();

        self.transport
            .publish(event)
            .await
            .map_err(|source| PublishError::Transport {
                event_id,
                attempts: 1,
                source,
            })
    }

    /// Publish the result event, retrying up to the configured attempts.
    ///
    /// The event is signed once, so every attempt carries the same id.
    pub async fn publish_result(
        &self,
        request: &JobRequest,
        content: String,
        amount_msats: u64,
    ) -> Result<JobResult, PublishError> {
        let template = EventBuilder::job_result(&request.event, content.clone(), amount_msats)?;
        let event = self.signer.sign(template)?;
        let event_id = event.id.clone();

        let mut attempt = 1;
        loop {
            match self.transport.publish(event.clone()).await {
                Ok(result_id) => {
                    return Ok(JobResult {
                        request_id: request.id.clone(),
                        result_id,
                        content,
                        amount_msats,
                    });
                }
                Err(source) if attempt >= self.result_attempts => {
                    return Err(PublishError::Transport {
                        event_id,
                        attempts: attempt,
                        source,
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        request_id = %request.id,
                        result_id = %event_id,
                        attempt,
                        error = %e,
                        "Result publication failed, retrying",
                    );
                    attempt += 1;
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
    }
}
