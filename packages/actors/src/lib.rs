//! Runtime for data vending machine workers.
//!
//! This crate provides the Ractor-based pipeline that takes job requests off
//! relays, processes each one at most once, and publishes status and result
//! events back.
//!
//! # Architecture
//!
//! - `DvmWorker` - Lifecycle controller: connect, subscribe, run, shut down
//! - `IntakeListener` - Task that enqueues every event from the subscription
//! - `Supervisor` - Actor linking the queue and dispatch actors
//! - `QueueActor` - FIFO of pending requests
//! - `DispatchActor` - Single consumer: dedup, announce, work, publish, record
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use dvm_actors::{DvmWorker, MemoryRelay, MemorySigner, WorkerConfig, dvm_handler};
//!
//! let config = WorkerConfig::new("hello").with_kinds([5050]).with_relay("wss://relay.example");
//! let handler = dvm_handler!(|request| Ok(format!("Hello {}", request.payload)));
//! let worker = DvmWorker::new(
//!     config,
//!     Arc::new(MemoryRelay::new()),
//!     Arc::new(MemorySigner::from_identity(None)),
//!     Arc::new(handler),
//! );
//! worker.run().await?;
//! ```

mod dispatch_actor;
mod handler;
mod ledger;
mod lifecycle;
mod listener;
mod memory;
mod messages;
mod publisher;
mod queue_actor;
mod supervisor;
mod transport;

pub use dispatch_actor::{DispatchActor, DispatchArgs};
pub use handler::{
    DvmHandler, FnHandler, HookFuture, PaymentHook, PriceHook, WorkError, WorkFuture, WorkResult,
};
pub use ledger::{CompletedJobLedger, LedgerError};
pub use lifecycle::{DvmWorker, WorkerError};
pub use listener::{IntakeCounters, IntakeListener, ListenerError};
pub use memory::{MemoryRelay, MemorySigner};
pub use messages::{ActorError, DispatchMessage, QueueMessage, SupervisorMessage};
pub use publisher::{PublishError, Publisher};
pub use queue_actor::{QueueActor, QueueActorState};
pub use supervisor::{Supervisor, SupervisorArgs};
pub use transport::{
    EventSigner, NotificationStream, RelayNotification, RelayTransport, SignerError,
    TransportError, TransportFuture,
};

pub use dvm_core::{
    ConfigError, DispatchStage, Event, EventBuilder, EventId, EventTemplate, FeedbackStatus,
    Filter, JobEvent, JobRequest, JobResult, JobStatus, Kind, PublicKey, Tag, Timestamp,
    WorkerConfig, WorkerState, WorkerStats,
};

/// Re-export ractor types for convenience.
pub use ractor::{Actor, ActorRef, RpcReplyPort, concurrency};
