//! Intake listener: turns relay notifications into queued job requests.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use dvm_core::{JobEvent, JobRequest, WorkerConfig};
use futures_util::StreamExt;
use ractor::ActorRef;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::messages::QueueMessage;
use crate::transport::{NotificationStream, RelayNotification};

/// Listener errors. Either one ends intake for the worker.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("notification stream closed")]
    StreamClosed,

    #[error("job queue unavailable: {0}")]
    QueueUnavailable(String),
}

/// Counters shared between the listener task and its owner.
#[derive(Debug, Default)]
pub struct IntakeCounters {
    pub requests: AtomicU64,
    pub messages: AtomicU64,
}

impl IntakeCounters {
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn messages(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }
}

/// Consumes a notification stream and enqueues every event it yields.
///
/// No filtering or deduplication happens here; the dispatcher owns both.
pub struct IntakeListener {
    queue: ActorRef<QueueMessage>,
    event_tx: Option<broadcast::Sender<JobEvent>>,
    cancel: CancellationToken,
    counters: Arc<IntakeCounters>,
    config: Arc<WorkerConfig>,
}

impl IntakeListener {
    pub fn new(
        queue: ActorRef<QueueMessage>,
        config: Arc<WorkerConfig>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            queue,
            event_tx: None,
            cancel,
            counters: Arc::new(IntakeCounters::default()),
            config,
        }
    }

    /// Set the event broadcaster.
    pub fn with_event_tx(mut self, tx: broadcast::Sender<JobEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn counters(&self) -> Arc<IntakeCounters> {
        self.counters.clone()
    }

    /// Run until cancelled (`Ok`) or until intake becomes impossible.
    pub async fn run(self, mut stream: NotificationStream) -> Result<(), ListenerError> {
        tracing::debug!("Intake listener started");
        loop {
            let notification = tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::debug!("Intake listener cancelled");
                    return Ok(());
                }
                next = stream.next() => next,
            };

            match notification {
                Some(RelayNotification::Event { relay_url, event, .. }) => {
                    let request = JobRequest::from_event(*event, Some(relay_url));
                    self.counters.requests.fetch_add(1, Ordering::Relaxed);

                    match self.config.explorer_link(request.id.as_str()) {
                        Some(link) => tracing::info!(
                            request_id = %request.id,
                            kind = %request.kind,
                            relay = ?request.relay_url,
                            %link,
                            "Received job request",
                        ),
                        None => tracing::info!(
                            request_id = %request.id,
                            kind = %request.kind,
                            relay = ?request.relay_url,
                            "Received job request",
                        ),
                    }

                    self.queue
                        .send_message(QueueMessage::Enqueue {
                            request: Box::new(request),
                        })
                        .map_err(|e| ListenerError::QueueUnavailable(e.to_string()))?;
                }
                Some(RelayNotification::Message { relay_url, message }) => {
                    self.counters.messages.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(relay = %relay_url, %message, "Relay message");
                    if let Some(ref tx) = self.event_tx {
                        let _ = tx.send(JobEvent::RelayMessage {
                            relay_url,
                            message,
                            timestamp: Utc::now(),
                        });
                    }
                }
                None => return Err(ListenerError::StreamClosed),
            }
        }
    }
}
