//! Queue actor holding received job requests until the dispatcher takes them.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use dvm_core::{JobEvent, JobRequest};
use ractor::{Actor, ActorProcessingErr, ActorRef};
use tokio::sync::{Notify, broadcast};

use crate::messages::QueueMessage;

/// State for the queue actor.
pub struct QueueActorState {
    /// Pending requests, oldest first.
    pending: VecDeque<JobRequest>,
    /// Total requests ever enqueued.
    enqueued: u64,
    /// Event broadcaster.
    event_tx: Option<broadcast::Sender<JobEvent>>,
    /// Signalled on every enqueue so an idle consumer wakes immediately.
    wake: Option<Arc<Notify>>,
}

impl QueueActorState {
    /// Create an empty queue state.
    pub fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            enqueued: 0,
            event_tx: None,
            wake: None,
        }
    }

    /// Set the event broadcaster.
    pub fn with_event_tx(mut self, tx: broadcast::Sender<JobEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Set the notifier signalled when a request arrives.
    pub fn with_wake(mut self, wake: Arc<Notify>) -> Self {
        self.wake = Some(wake);
        self
    }

    fn broadcast(&self, event: JobEvent) {
        if let Some(ref tx) = self.event_tx {
            let _ = tx.send(event);
        }
    }
}

impl Default for QueueActorState {
    fn default() -> Self {
        Self::new()
    }
}

/// Unbounded FIFO of job requests.
///
/// Enqueue is fire-and-forget and never drops; arrival order is the only
/// ordering the dispatcher sees.
pub struct QueueActor;

impl Actor for QueueActor {
    type Msg = QueueMessage;
    type State = QueueActorState;
    type Arguments = QueueActorState;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::debug!("Starting queue actor");
        Ok(args)
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            QueueMessage::Enqueue { request } => {
                let request = *request;
                state.enqueued += 1;

                tracing::debug!(
                    request_id = %request.id,
                    kind = %request.kind,
                    pending = state.pending.len() + 1,
                    "Request queued",
                );

                state.broadcast(JobEvent::RequestReceived {
                    request_id: request.id.clone(),
                    kind: request.kind,
                    relay_url: request.relay_url.clone(),
                    timestamp: Utc::now(),
                });
                state.pending.push_back(request);
                if let Some(ref wake) = state.wake {
                    wake.notify_one();
                }
            }

            QueueMessage::Dequeue { reply } => {
                let _ = reply.send(state.pending.pop_front());
            }

            QueueMessage::Len { reply } => {
                let _ = reply.send(state.pending.len());
            }

            QueueMessage::Shutdown => {
                tracing::info!(
                    pending = state.pending.len(),
                    enqueued = state.enqueued,
                    "Shutting down queue",
                );
                myself.stop(None);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use dvm_core::{EventTemplate, Kind};
    use ractor::rpc::{CallResult, call};

    use super::*;
    use crate::memory::MemorySigner;
    use crate::transport::EventSigner;

    fn request(content: &str) -> JobRequest {
        let signer = MemorySigner::from_identity(Some("customer"));
        let event = signer
            .sign(EventTemplate::new(Kind(5050), content))
            .unwrap();
        JobRequest::from_event(event, None)
    }

    async fn dequeue(queue: &ActorRef<QueueMessage>) -> Option<JobRequest> {
        match call(queue, |reply| QueueMessage::Dequeue { reply }, None)
            .await
            .unwrap()
        {
            CallResult::Success(request) => request,
            _ => panic!("dequeue did not succeed"),
        }
    }

    #[tokio::test]
    async fn dequeues_in_arrival_order() {
        let (tx, mut rx) = broadcast::channel(16);
        let (queue, handle) =
            Actor::spawn(None, QueueActor, QueueActorState::new().with_event_tx(tx))
                .await
                .unwrap();

        let first = request("first");
        let second = request("second");
        for r in [first.clone(), second.clone()] {
            queue
                .send_message(QueueMessage::Enqueue {
                    request: Box::new(r),
                })
                .unwrap();
        }

        assert_eq!(dequeue(&queue).await.map(|r| r.id), Some(first.id.clone()));
        assert_eq!(dequeue(&queue).await.map(|r| r.id), Some(second.id));
        assert!(dequeue(&queue).await.is_none());

        match rx.recv().await.unwrap() {
            JobEvent::RequestReceived { request_id, .. } => assert_eq!(request_id, first.id),
            other => panic!("unexpected event: {:?}", other),
        }

        queue.send_message(QueueMessage::Shutdown).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn enqueue_wakes_the_consumer() {
        let wake = Arc::new(Notify::new());
        let (queue, handle) = Actor::spawn(
            None,
            QueueActor,
            QueueActorState::new().with_wake(wake.clone()),
        )
        .await
        .unwrap();

        let woken = tokio::spawn({
            let wake = wake.clone();
            async move { wake.notified().await }
        });
        queue
            .send_message(QueueMessage::Enqueue {
                request: Box::new(request("wake up")),
            })
            .unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(1), woken)
            .await
            .unwrap()
            .unwrap();
        match call(&queue, |reply| QueueMessage::Len { reply }, None)
            .await
            .unwrap()
        {
            CallResult::Success(len) => assert_eq!(len, 1),
            _ => panic!("len did not succeed"),
        }

        queue.send_message(QueueMessage::Shutdown).unwrap();
        handle.await.unwrap();
    }
}
