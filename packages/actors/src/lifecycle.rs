//! Lifecycle controller.
//!
//! [`DvmWorker`] connects to the configured relays, subscribes to the job
//! kinds, and runs the intake listener alongside the supervised queue and
//! dispatch actors until it is shut down:
//!
//! `Stopped → Connecting → Subscribed → Running → Stopping → Stopped`
//!
//! Shutdown is requested explicitly, by Ctrl-C under [`DvmWorker::run`], or
//! internally when intake is lost or a supervised actor dies.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use dvm_core::{ConfigError, Filter, JobEvent, Timestamp, WorkerConfig, WorkerState, WorkerStats};
use ractor::rpc::CallResult;
use ractor::{Actor, ActorRef, Message, RpcReplyPort};
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::handler::DvmHandler;
use crate::ledger::CompletedJobLedger;
use crate::listener::{IntakeCounters, IntakeListener};
use crate::messages::{ActorError, DispatchMessage, QueueMessage, SupervisorMessage};
use crate::publisher::Publisher;
use crate::supervisor::{Supervisor, SupervisorArgs};
use crate::transport::{EventSigner, RelayTransport, TransportError};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Actor(#[from] ActorError),

    #[error("worker is already {0}")]
    AlreadyStarted(WorkerState),

    #[error("shutdown did not complete within {0:?}")]
    ShutdownTimeout(Duration),
}

/// Handles owned while the worker runs.
struct Running {
    run_id: u64,
    cancel: CancellationToken,
    supervisor: ActorRef<SupervisorMessage>,
    supervisor_handle: JoinHandle<()>,
    queue: ActorRef<QueueMessage>,
    dispatch: ActorRef<DispatchMessage>,
    listener: JoinHandle<()>,
    intake: Arc<IntakeCounters>,
}

/// Ledger and counters kept after the dispatcher stops.
#[derive(Default)]
struct Snapshot {
    ledger: CompletedJobLedger,
    stats: WorkerStats,
}

struct Inner {
    config: Arc<WorkerConfig>,
    transport: Arc<dyn RelayTransport>,
    signer: Arc<dyn EventSigner>,
    handler: Arc<dyn DvmHandler>,
    state_tx: watch::Sender<WorkerState>,
    event_tx: broadcast::Sender<JobEvent>,
    running: Mutex<Option<Running>>,
    snapshot: StdMutex<Snapshot>,
    runs: AtomicU64,
}

/// A data vending machine worker.
pub struct DvmWorker {
    inner: Arc<Inner>,
}

impl DvmWorker {
    /// Create a stopped worker.
    pub fn new(
        config: WorkerConfig,
        transport: Arc<dyn RelayTransport>,
        signer: Arc<dyn EventSigner>,
        handler: Arc<dyn DvmHandler>,
    ) -> Self {
        let (state_tx, _) = watch::channel(WorkerState::Stopped);
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config: Arc::new(config),
                transport,
                signer,
                handler,
                state_tx,
                event_tx,
                running: Mutex::new(None),
                snapshot: StdMutex::new(Snapshot::default()),
                runs: AtomicU64::new(0),
            }),
        }
    }

    /// Add a relay before starting.
    pub fn with_relay(mut self, url: impl Into<String>) -> Self {
        let url = url.into();
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => Arc::make_mut(&mut inner.config).relays.push(url),
            None => tracing::warn!(relay = %url, "Relay not added: worker already started"),
        }
        self
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.inner.config
    }

    pub fn state(&self) -> WorkerState {
        *self.inner.state_tx.borrow()
    }

    /// Receiver that observes every lifecycle state change.
    pub fn watch_state(&self) -> watch::Receiver<WorkerState> {
        self.inner.state_tx.subscribe()
    }

    /// Subscribe to pipeline events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Connect, subscribe and launch intake and dispatch.
    ///
    /// Configuration is validated before anything else; an invalid
    /// configuration never leaves `Stopped`.
    pub async fn start(&self) -> Result<(), WorkerError> {
        let inner = &self.inner;
        let mut running = inner.running.lock().await;
        if running.is_some() {
            return Err(WorkerError::AlreadyStarted(self.state()));
        }

        inner.config.validate()?;
        let config = inner.config.clone();

        inner.set_state(WorkerState::Connecting);
        if let Err(e) = inner.transport.connect(&config.relays).await {
            tracing::error!(error = %e, relays = ?config.relays, "Failed to connect to relays");
            inner.set_state(WorkerState::Stopped);
            return Err(e.into());
        }

        let filter = Filter::new()
            .kinds(config.kinds.iter().copied())
            .since(Timestamp::now());
        let stream = match inner.transport.subscribe(&filter).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(error = %e, "Failed to subscribe");
                inner.abort_start().await;
                return Err(e.into());
            }
        };
        inner.set_state(WorkerState::Subscribed);
        tracing::info!(
            worker = %config.name,
            kinds = ?config.kinds,
            relays = ?config.relays,
            pubkey = %inner.signer.public_key(),
            "Subscribed to job requests",
        );

        let cancel = CancellationToken::new();
        let publisher = Publisher::new(inner.transport.clone(), inner.signer.clone())
            .with_retry(config.result_publish_attempts, config.publish_retry_delay);
        let args = SupervisorArgs {
            handler: inner.handler.clone(),
            publisher,
            poll_interval: config.poll_interval,
            work_timeout: config.work_timeout,
            cancel: cancel.clone(),
            event_tx: inner.event_tx.clone(),
        };

        let (supervisor, supervisor_handle) = match Actor::spawn(None, Supervisor, args).await {
            Ok(spawned) => spawned,
            Err(e) => {
                inner.abort_start().await;
                return Err(ActorError::Spawn {
                    actor: "supervisor",
                    reason: e.to_string(),
                }
                .into());
            }
        };

        let children = ask(
            &supervisor,
            "supervisor",
            |reply| SupervisorMessage::GetChildren { reply },
            None,
        )
        .await;
        let (queue, dispatch) = match children {
            Ok(children) => children,
            Err(e) => {
                supervisor.stop(None);
                let _ = supervisor_handle.await;
                inner.abort_start().await;
                return Err(e.into());
            }
        };

        let listener = IntakeListener::new(queue.clone(), config.clone(), cancel.clone())
            .with_event_tx(inner.event_tx.clone());
        let intake = listener.counters();
        let intake_cancel = cancel.clone();
        let listener = tokio::spawn(async move {
            if let Err(e) = listener.run(stream).await {
                tracing::error!(error = %e, "Intake stopped, shutting down worker");
                intake_cancel.cancel();
            }
        });

        let run_id = inner.runs.fetch_add(1, Ordering::Relaxed);

        // Internal shutdown requests
        let watcher = inner.clone();
        let watched = cancel.clone();
        tokio::spawn(async move {
            watched.cancelled().await;
            if let Err(e) = watcher.shutdown(Some(run_id)).await {
                tracing::error!(error = %e, "Shutdown failed");
            }
        });

        *running = Some(Running {
            run_id,
            cancel,
            supervisor,
            supervisor_handle,
            queue,
            dispatch,
            listener,
            intake,
        });
        inner.set_state(WorkerState::Running);
        Ok(())
    }

    /// Stop intake and dispatch, then disconnect. Safe to call repeatedly.
    pub async fn shutdown(&self) -> Result<(), WorkerError> {
        self.inner.shutdown(None).await
    }

    /// Start, then block until Ctrl-C or an internal shutdown request, then
    /// shut down.
    pub async fn run(&self) -> Result<(), WorkerError> {
        self.start().await?;

        let cancel = match self.inner.running.lock().await.as_ref() {
            Some(running) => running.cancel.clone(),
            None => return Ok(()),
        };

        tokio::select! {
            signal = tokio::signal::ctrl_c() => match signal {
                Ok(()) => tracing::info!("Interrupt received, shutting down"),
                Err(e) => {
                    tracing::warn!(error = %e, "Cannot listen for Ctrl-C");
                    cancel.cancelled().await;
                }
            },
            _ = cancel.cancelled() => {}
        }

        self.shutdown().await
    }

    /// Completed requests, in completion order.
    ///
    /// After shutdown this is the ledger as it stood when the worker stopped.
    pub async fn ledger(&self) -> Result<CompletedJobLedger, WorkerError> {
        let dispatch = self.inner.dispatch().await;
        match dispatch {
            Some(dispatch) => Ok(ask(
                &dispatch,
                "dispatcher",
                |reply| DispatchMessage::GetLedger { reply },
                None,
            )
            .await?),
            None => Ok(self.inner.snapshot().ledger.clone()),
        }
    }

    /// Pipeline counters.
    pub async fn stats(&self) -> Result<WorkerStats, WorkerError> {
        let (queue, dispatch, intake) = {
            let running = self.inner.running.lock().await;
            match running.as_ref() {
                Some(r) => (r.queue.clone(), r.dispatch.clone(), r.intake.clone()),
                None => return Ok(self.inner.snapshot().stats.clone()),
            }
        };
        let mut stats = ask(
            &dispatch,
            "dispatcher",
            |reply| DispatchMessage::GetStats { reply },
            None,
        )
        .await?;
        stats.received = intake.requests();
        let pending = ask(&queue, "queue", |reply| QueueMessage::Len { reply }, None).await?;
        stats.pending = pending as u64;
        Ok(stats)
    }
}

impl Inner {
    fn set_state(&self, new_state: WorkerState) {
        let old_state = self.state_tx.send_replace(new_state);
        if old_state == new_state {
            return;
        }
        tracing::info!(worker = %self.config.name, from = %old_state, to = %new_state, "Worker state changed");
        let _ = self.event_tx.send(JobEvent::WorkerStateChanged {
            old_state,
            new_state,
            timestamp: Utc::now(),
        });
    }

    fn snapshot(&self) -> MutexGuard<'_, Snapshot> {
        self.snapshot.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn dispatch(&self) -> Option<ActorRef<DispatchMessage>> {
        self.running.lock().await.as_ref().map(|r| r.dispatch.clone())
    }

    /// Undo a partially completed start.
    async fn abort_start(&self) {
        if let Err(e) = self.transport.disconnect().await {
            tracing::warn!(error = %e, "Disconnect failed");
        }
        self.set_state(WorkerState::Stopped);
    }

    /// Shut down the running worker. With `only_run`, a later run is left alone.
    async fn shutdown(&self, only_run: Option<u64>) -> Result<(), WorkerError> {
        let mut guard = self.running.lock().await;
        if only_run.is_some() && guard.as_ref().map(|r| r.run_id) != only_run {
            return Ok(());
        }
        let Some(mut running) = guard.take() else {
            return Ok(());
        };

        self.set_state(WorkerState::Stopping);
        running.cancel.cancel();
        let timeout = self.config.shutdown_timeout;

        // Cancelled work returns promptly, so the dispatcher answers after
        // abandoning any in-flight job.
        let ledger = ask(
            &running.dispatch,
            "dispatcher",
            |reply| DispatchMessage::GetLedger { reply },
            Some(timeout),
        )
        .await;
        let stats = ask(
            &running.dispatch,
            "dispatcher",
            |reply| DispatchMessage::GetStats { reply },
            Some(timeout),
        )
        .await;
        let pending = ask(
            &running.queue,
            "queue",
            |reply| QueueMessage::Len { reply },
            Some(timeout),
        )
        .await;
        {
            let mut snapshot = self.snapshot();
            match ledger {
                Ok(ledger) => snapshot.ledger = ledger,
                Err(e) => tracing::warn!(error = %e, "Ledger snapshot unavailable"),
            }
            match stats {
                Ok(mut stats) => {
                    stats.received = running.intake.requests();
                    stats.pending = pending.map_or(0, |len| len as u64);
                    snapshot.stats = stats;
                }
                Err(e) => tracing::warn!(error = %e, "Stats snapshot unavailable"),
            }
        }

        let mut result = Ok(());
        let _ = running.supervisor.send_message(SupervisorMessage::Shutdown);
        if tokio::time::timeout(timeout, &mut running.supervisor_handle)
            .await
            .is_err()
        {
            tracing::warn!(?timeout, "Actors did not stop in time, killing");
            running.supervisor.kill();
            result = Err(WorkerError::ShutdownTimeout(timeout));
        }

        if tokio::time::timeout(timeout, &mut running.listener)
            .await
            .is_err()
        {
            tracing::warn!("Intake listener did not stop in time, aborting");
            running.listener.abort();
        }

        if let Err(e) = self.transport.disconnect().await {
            tracing::warn!(error = %e, "Disconnect failed");
        }

        tracing::info!(
            worker = %self.config.name,
            requests = running.intake.requests(),
            relay_messages = running.intake.messages(),
            "Worker stopped",
        );
        self.set_state(WorkerState::Stopped);
        result
    }
}

/// Request/reply with an actor, mapping every failure to [`ActorError`].
async fn ask<M, T, F>(
    actor: &ActorRef<M>,
    name: &'static str,
    build: F,
    timeout: Option<Duration>,
) -> Result<T, ActorError>
where
    M: Message,
    T: Send + 'static,
    F: FnOnce(RpcReplyPort<T>) -> M,
{
    match ractor::rpc::call(actor, build, timeout).await {
        Ok(CallResult::Success(value)) => Ok(value),
        Ok(_) => Err(ActorError::NoReply(name)),
        Err(e) => Err(ActorError::Unreachable {
            actor: name,
            reason: e.to_string(),
        }),
    }
}
