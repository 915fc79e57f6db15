//! Supervisor actor owning the queue and dispatch actors.

use std::sync::Arc;
use std::time::Duration;

use dvm_core::JobEvent;
use ractor::{Actor, ActorProcessingErr, ActorRef, SupervisionEvent};
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::dispatch_actor::{DispatchActor, DispatchArgs};
use crate::handler::DvmHandler;
use crate::messages::{DispatchMessage, QueueMessage, SupervisorMessage};
use crate::publisher::Publisher;
use crate::queue_actor::{QueueActor, QueueActorState};

/// Supervisor arguments.
pub struct SupervisorArgs {
    pub handler: Arc<dyn DvmHandler>,
    pub publisher: Publisher,
    pub poll_interval: Duration,
    pub work_timeout: Option<Duration>,
    pub cancel: CancellationToken,
    pub event_tx: broadcast::Sender<JobEvent>,
}

/// State for the supervisor actor.
pub struct SupervisorState {
    queue: ActorRef<QueueMessage>,
    queue_handle: Option<JoinHandle<()>>,
    dispatch: ActorRef<DispatchMessage>,
    dispatch_handle: Option<JoinHandle<()>>,
    cancel: CancellationToken,
    shutting_down: bool,
}

/// Supervisor actor.
///
/// Losing either child outside of shutdown is unrecoverable for the worker:
/// the supervisor cancels the shared token so the lifecycle controller
/// shuts everything down.
pub struct Supervisor;

impl Actor for Supervisor {
    type Msg = SupervisorMessage;
    type State = SupervisorState;
    type Arguments = SupervisorArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting supervisor");

        let wake = Arc::new(Notify::new());
        let queue_state = QueueActorState::new()
            .with_event_tx(args.event_tx.clone())
            .with_wake(wake.clone());
        let (queue, queue_handle) =
            Actor::spawn_linked(None, QueueActor, queue_state, myself.get_cell())
                .await
                .map_err(|e| ActorProcessingErr::from(format!("Failed to spawn queue: {}", e)))?;

        let dispatch_args = DispatchArgs {
            queue: queue.clone(),
            handler: args.handler,
            publisher: args.publisher,
            poll_interval: args.poll_interval,
            wake,
            work_timeout: args.work_timeout,
            cancel: args.cancel.clone(),
            event_tx: Some(args.event_tx),
        };
        let (dispatch, dispatch_handle) =
            match Actor::spawn_linked(None, DispatchActor, dispatch_args, myself.get_cell()).await {
                Ok(spawned) => spawned,
                Err(e) => {
                    queue.stop(None);
                    return Err(format!("Failed to spawn dispatcher: {}", e).into());
                }
            };

        Ok(SupervisorState {
            queue,
            queue_handle: Some(queue_handle),
            dispatch,
            dispatch_handle: Some(dispatch_handle),
            cancel: args.cancel,
            shutting_down: false,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisorMessage::GetChildren { reply } => {
                let _ = reply.send((state.queue.clone(), state.dispatch.clone()));
            }

            SupervisorMessage::Shutdown => {
                tracing::info!("Shutting down supervisor");
                state.shutting_down = true;

                // Dispatcher first, so it never dequeues from a stopped queue.
                let _ = state.dispatch.send_message(DispatchMessage::Shutdown);
                if let Some(handle) = state.dispatch_handle.take() {
                    let _ = handle.await;
                }
                let _ = state.queue.send_message(QueueMessage::Shutdown);
                if let Some(handle) = state.queue_handle.take() {
                    let _ = handle.await;
                }

                myself.stop(None);
            }
        }

        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisionEvent::ActorTerminated(cell, _, reason) if !state.shutting_down => {
                tracing::error!(
                    actor = %cell.get_id(),
                    reason = ?reason,
                    "Child actor terminated unexpectedly",
                );
                state.cancel.cancel();
            }
            SupervisionEvent::ActorFailed(cell, err) if !state.shutting_down => {
                tracing::error!(
                    actor = %cell.get_id(),
                    error = %err,
                    "Child actor failed",
                );
                state.cancel.cancel();
            }
            _ => {}
        }
        Ok(())
    }
}
