//! Message types for actor communication.

use dvm_core::{JobRequest, WorkerStats};
use ractor::{ActorRef, RpcReplyPort};

use crate::ledger::CompletedJobLedger;

/// Messages for the QueueActor.
#[derive(Debug)]
pub enum QueueMessage {
    /// Append a request to the back of the queue.
    Enqueue { request: Box<JobRequest> },

    /// Take the request at the front of the queue, if any.
    Dequeue {
        reply: RpcReplyPort<Option<JobRequest>>,
    },

    /// Number of pending requests.
    Len { reply: RpcReplyPort<usize> },

    /// Shutdown the queue.
    Shutdown,
}

/// Messages for the DispatchActor.
#[derive(Debug)]
pub enum DispatchMessage {
    /// Drain the queue, one request at a time.
    Poll,

    /// Snapshot of the completed-job ledger.
    GetLedger {
        reply: RpcReplyPort<CompletedJobLedger>,
    },

    /// Dispatch counters.
    GetStats { reply: RpcReplyPort<WorkerStats> },

    /// Shutdown the dispatcher.
    Shutdown,
}

/// Messages for the Supervisor.
#[derive(Debug)]
pub enum SupervisorMessage {
    /// References to the supervised queue and dispatch actors.
    GetChildren {
        reply: RpcReplyPort<(ActorRef<QueueMessage>, ActorRef<DispatchMessage>)>,
    },

    /// Stop both children, then the supervisor.
    Shutdown,
}

/// Error type for actor operations.
#[derive(Debug, thiserror::Error)]
pub enum ActorError {
    #[error("failed to spawn {actor}: {reason}")]
    Spawn { actor: &'static str, reason: String },

    #[error("{actor} is not reachable: {reason}")]
    Unreachable { actor: &'static str, reason: String },

    #[error("{0} did not reply")]
    NoReply(&'static str),
}
