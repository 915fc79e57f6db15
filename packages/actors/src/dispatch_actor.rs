//! Dispatch actor: the single consumer of the job queue.
//!
//! Each request moves `Queued → Announcing → Working → Publishing → Done`,
//! or ends early as `Skipped` (already in the ledger) or `AwaitingPayment`
//! (the handler's payment hook reported it unpaid). Failures are contained
//! per request; the actor keeps draining the queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use dvm_core::{DispatchStage, EventId, FeedbackStatus, JobEvent, JobRequest, WorkerStats};
use ractor::rpc::CallResult;
use ractor::{Actor, ActorProcessingErr, ActorRef};
use tokio::sync::{Notify, broadcast};
use tokio_util::sync::CancellationToken;

use crate::handler::{DvmHandler, WorkError};
use crate::ledger::CompletedJobLedger;
use crate::messages::{DispatchMessage, QueueMessage};
use crate::publisher::Publisher;

/// Dispatch actor arguments.
pub struct DispatchArgs {
    pub queue: ActorRef<QueueMessage>,
    pub handler: Arc<dyn DvmHandler>,
    pub publisher: Publisher,
    pub poll_interval: Duration,
    /// Signalled by the queue whenever a request is enqueued.
    pub wake: Arc<Notify>,
    pub work_timeout: Option<Duration>,
    pub cancel: CancellationToken,
    pub event_tx: Option<broadcast::Sender<JobEvent>>,
}

/// State for the dispatch actor.
pub struct DispatchActorState {
    queue: ActorRef<QueueMessage>,
    handler: Arc<dyn DvmHandler>,
    publisher: Publisher,
    work_timeout: Option<Duration>,
    cancel: CancellationToken,
    event_tx: Option<broadcast::Sender<JobEvent>>,
    ledger: CompletedJobLedger,
    stats: WorkerStats,
    /// Set while the actor drains the queue through self-sent polls.
    draining: Arc<AtomicBool>,
}

/// How a single request left the pipeline.
enum Outcome {
    Done,
    Skipped,
    Unpaid,
    Failed,
    Interrupted,
}

impl DispatchActorState {
    fn broadcast(&self, event: JobEvent) {
        if let Some(ref tx) = self.event_tx {
            let _ = tx.send(event);
        }
    }

    /// Take the next request off the queue.
    async fn next_request(&self) -> Result<Option<JobRequest>, ActorProcessingErr> {
        match ractor::rpc::call(&self.queue, |reply| QueueMessage::Dequeue { reply }, None).await? {
            CallResult::Success(request) => Ok(request),
            CallResult::Timeout => Err("queue dequeue timed out".into()),
            CallResult::SenderError => Err("queue dropped the dequeue reply".into()),
        }
    }

    async fn process(&mut self, request: JobRequest) -> Outcome {
        self.stats.dequeued += 1;

        if let Some(result_id) = self.ledger.get(&request.id).cloned() {
            tracing::info!(
                request_id = %request.id,
                result_id = %result_id,
                "Request already processed, skipping",
            );
            self.broadcast(JobEvent::JobSkipped {
                request_id: request.id,
                result_id,
                timestamp: Utc::now(),
            });
            return Outcome::Skipped;
        }

        tracing::info!(
            request_id = %request.id,
            kind = %request.kind,
            customer = %request.customer,
            "Processing request",
        );
        self.announce(&request, FeedbackStatus::Processing, None, None)
            .await;

        if let Some(hook) = self.handler.payment_hook() {
            match hook.check_paid(&request).await {
                Ok(true) => {}
                Ok(false) => {
                    let amount = self.price(&request).await;
                    tracing::info!(
                        request_id = %request.id,
                        amount_msats = ?amount,
                        "Request not paid, awaiting payment",
                    );
                    self.announce(&request, FeedbackStatus::PaymentRequired, None, amount)
                        .await;
                    self.broadcast(JobEvent::PaymentRequired {
                        request_id: request.id,
                        amount_msats: amount,
                        timestamp: Utc::now(),
                    });
                    return Outcome::Unpaid;
                }
                Err(e) => {
                    self.fail(&request, DispatchStage::AwaitingPayment, e.to_string()).await;
                    return Outcome::Failed;
                }
            }
        }

        let started = Instant::now();
        self.broadcast(JobEvent::JobStarted {
            request_id: request.id.clone(),
            timestamp: Utc::now(),
        });

        let content = match self.run_work(&request).await {
            Some(Ok(content)) => content,
            Some(Err(e)) => {
                self.fail(&request, DispatchStage::Working, e.to_string()).await;
                return Outcome::Failed;
            }
            None => {
                self.interrupted(&request, DispatchStage::Working);
                return Outcome::Interrupted;
            }
        };

        let amount = self.price(&request).await.unwrap_or(0);
        let result_id = match self.publisher.publish_result(&request, content, amount).await {
            Ok(result) => result.result_id,
            Err(e) => {
                let Some(result_id) = e.event_id().cloned() else {
                    self.fail(&request, DispatchStage::Publishing, e.to_string()).await;
                    return Outcome::Failed;
                };
                // Work is never repeated: the unpublished result id is recorded.
                tracing::error!(
                    request_id = %request.id,
                    result_id = %result_id,
                    stage = %DispatchStage::Publishing,
                    error = %e,
                    "Result could not be published, giving up",
                );
                self.record(&request.id, result_id);
                self.broadcast(JobEvent::JobFailed {
                    request_id: request.id,
                    stage: DispatchStage::Publishing,
                    error: e.to_string(),
                    timestamp: Utc::now(),
                });
                return Outcome::Failed;
            }
        };

        self.record(&request.id, result_id.clone());
        let duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            request_id = %request.id,
            result_id = %result_id,
            amount_msats = amount,
            duration_ms,
            "Request completed",
        );
        self.broadcast(JobEvent::JobCompleted {
            request_id: request.id,
            result_id,
            duration_ms,
            timestamp: Utc::now(),
        });
        Outcome::Done
    }

    /// Run the handler's work on its own task, racing shutdown.
    ///
    /// Returns `None` when cancelled before the work finished.
    async fn run_work(&self, request: &JobRequest) -> Option<Result<String, WorkError>> {
        let work = self.handler.do_work(request);
        let timeout = self.work_timeout;
        let mut task = tokio::spawn(async move {
            match timeout {
                Some(limit) => tokio::time::timeout(limit, work)
                    .await
                    .unwrap_or(Err(WorkError::TimedOut(limit))),
                None => work.await,
            }
        });

        tokio::select! {
            joined = &mut task => Some(joined.unwrap_or_else(|e| Err(WorkError::Panicked(e.to_string())))),
            _ = self.cancel.cancelled() => {
                task.abort();
                None
            }
        }
    }

    async fn price(&self, request: &JobRequest) -> Option<u64> {
        let hook = self.handler.price_hook()?;
        match hook.calculate_price(request).await {
            Ok(amount) => Some(amount),
            Err(e) => {
                tracing::warn!(request_id = %request.id, error = %e, "Price calculation failed");
                None
            }
        }
    }

    /// Publish a feedback event. Failures are logged and otherwise ignored.
    async fn announce(
        &self,
        request: &JobRequest,
        status: FeedbackStatus,
        extra_info: Option<&str>,
        amount_msats: Option<u64>,
    ) {
        match self
            .publisher
            .publish_feedback(request, status, extra_info, amount_msats)
            .await
        {
            Ok(event_id) => {
                tracing::debug!(request_id = %request.id, %status, event_id = %event_id, "Status published");
                self.broadcast(JobEvent::StatusPublished {
                    request_id: request.id.clone(),
                    status,
                    event_id,
                    timestamp: Utc::now(),
                });
            }
            Err(e) => {
                tracing::warn!(
                    request_id = %request.id,
                    %status,
                    error = %e,
                    "Failed to publish status",
                );
            }
        }
    }

    async fn fail(&self, request: &JobRequest, stage: DispatchStage, error: String) {
        tracing::error!(
            request_id = %request.id,
            kind = %request.kind,
            %stage,
            %error,
            "Job failed",
        );
        self.announce(request, FeedbackStatus::Error, Some(failure_reason(stage)), None)
            .await;
        self.broadcast(JobEvent::JobFailed {
            request_id: request.id.clone(),
            stage,
            error,
            timestamp: Utc::now(),
        });
    }

    fn interrupted(&self, request: &JobRequest, stage: DispatchStage) {
        tracing::warn!(request_id = %request.id, %stage, "Job interrupted by shutdown");
        self.broadcast(JobEvent::JobInterrupted {
            request_id: request.id.clone(),
            stage,
            timestamp: Utc::now(),
        });
    }

    fn record(&mut self, request_id: &EventId, result_id: EventId) {
        if let Err(e) = self.ledger.record(request_id.clone(), result_id) {
            // Unreachable while this actor is the only consumer.
            tracing::warn!(error = %e, "Ledger already holds request");
        }
    }
}

/// Short reason published on error feedback; details stay in the logs.
fn failure_reason(stage: DispatchStage) -> &'static str {
    match stage {
        DispatchStage::AwaitingPayment => "payment check failed",
        DispatchStage::Publishing => "result could not be published",
        _ => "job processing failed",
    }
}

/// Dispatch actor that drains the queue one request at a time.
pub struct DispatchActor;

impl Actor for DispatchActor {
    type Msg = DispatchMessage;
    type State = DispatchActorState;
    type Arguments = DispatchArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::debug!(poll_interval = ?args.poll_interval, "Starting dispatch actor");

        // Wait for an enqueue, falling back to the poll interval
        let tick = myself.clone();
        let cancel = args.cancel.clone();
        let wake = args.wake;
        let poll_interval = args.poll_interval;
        let draining = Arc::new(AtomicBool::new(false));
        let busy = draining.clone();
        tokio::spawn(async move {
            loop {
                let woken = tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = wake.notified() => true,
                    _ = tokio::time::sleep(poll_interval) => false,
                };
                // A draining dispatcher polls itself.
                if !woken && busy.load(Ordering::Acquire) {
                    continue;
                }
                if tick.send_message(DispatchMessage::Poll).is_err() {
                    break;
                }
            }
        });

        Ok(DispatchActorState {
            queue: args.queue,
            handler: args.handler,
            publisher: args.publisher,
            work_timeout: args.work_timeout,
            cancel: args.cancel,
            event_tx: args.event_tx,
            ledger: CompletedJobLedger::new(),
            stats: WorkerStats::default(),
            draining,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            DispatchMessage::Poll => {
                if state.cancel.is_cancelled() {
                    return Ok(());
                }

                // One request per message keeps ledger and stats queries
                // answerable between jobs; the re-sent Poll continues the drain.
                let Some(request) = state.next_request().await? else {
                    state.draining.store(false, Ordering::Release);
                    return Ok(());
                };
                state.draining.store(true, Ordering::Release);
                match state.process(request).await {
                    Outcome::Done => state.stats.completed += 1,
                    Outcome::Skipped => state.stats.skipped += 1,
                    Outcome::Unpaid => state.stats.unpaid += 1,
                    Outcome::Failed => state.stats.failed += 1,
                    Outcome::Interrupted => state.stats.interrupted += 1,
                }
                myself.send_message(DispatchMessage::Poll)?;
            }

            DispatchMessage::GetLedger { reply } => {
                let _ = reply.send(state.ledger.clone());
            }

            DispatchMessage::GetStats { reply } => {
                let _ = reply.send(state.stats.clone());
            }

            DispatchMessage::Shutdown => {
                tracing::info!(
                    completed = state.stats.completed,
                    failed = state.stats.failed,
                    skipped = state.stats.skipped,
                    "Shutting down dispatcher",
                );
                myself.stop(None);
            }
        }

        Ok(())
    }
}
