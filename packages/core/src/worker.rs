//! Worker lifecycle state and counters.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a worker.
///
/// `Stopped -> Connecting -> Subscribed -> Running -> Stopping -> Stopped`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    #[default]
    Stopped,
    Connecting,
    Subscribed,
    Running,
    Stopping,
}

impl WorkerState {
    /// Whether the worker holds live relay connections or tasks.
    pub fn is_active(&self) -> bool {
        !matches!(self, WorkerState::Stopped)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerState::Stopped => write!(f, "stopped"),
            WorkerState::Connecting => write!(f, "connecting"),
            WorkerState::Subscribed => write!(f, "subscribed"),
            WorkerState::Running => write!(f, "running"),
            WorkerState::Stopping => write!(f, "stopping"),
        }
    }
}

/// Counters for a running worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerStats {
    /// Requests received from relays.
    pub received: u64,
    /// Requests taken off the queue.
    pub dequeued: u64,
    /// Requests still waiting in the queue.
    pub pending: u64,
    /// Jobs whose result was published.
    pub completed: u64,
    /// Jobs whose work or result publication failed.
    pub failed: u64,
    /// Redelivered requests skipped because they were already completed.
    pub skipped: u64,
    /// Jobs ended by a payment hook reporting them unpaid.
    pub unpaid: u64,
    /// Jobs abandoned at shutdown.
    pub interrupted: u64,
}

impl WorkerStats {
    /// Total requests that reached a terminal state.
    pub fn processed(&self) -> u64 {
        self.completed + self.failed + self.skipped + self.unpaid + self.interrupted
    }

    /// Success rate of worked jobs as a percentage.
    pub fn success_rate(&self) -> Option<f64> {
        let worked = self.completed + self.failed;
        if worked == 0 {
            None
        } else {
            Some((self.completed as f64 / worked as f64) * 100.0)
        }
    }
}
