//! Progress events broadcast while a run is in flight.
//!
//! The crawl driver emits `ProgressEvent`s on a `tokio::sync::broadcast`
//! channel; the CLI subscribes to drive its progress bar. When nobody is
//! subscribed, events are dropped.

use serde::{Deserialize, Serialize};

use crate::types::FailureStage;

/// A progress event for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Label of the run this event belongs to.
    pub label: String,
    /// Monotonically increasing sequence number.
    pub seq: u64,
    pub event: ProgressEventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProgressEventKind {
    PhaseChanged {
        phase: RunPhase,
    },
    /// Enumeration finished; `total` nodes will be visited.
    NodesDiscovered {
        total: u32,
    },
    NodeStarted {
        id: String,
        title: String,
    },
    ResourceFetched {
        node_id: String,
        filename: String,
        bytes: u64,
    },
    ResourceSkipped {
        node_id: String,
        filename: String,
    },
    Failure {
        node_id: String,
        stage: FailureStage,
        cause: String,
    },
    NodeFinished {
        id: String,
    },
}

/// Crawl driver phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunPhase {
    Init,
    SessionAcquired,
    Enumerating,
    Resolving,
    Fetching,
    Finalizing,
    Done,
    Aborted,
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::SessionAcquired => write!(f, "session acquired"),
            Self::Enumerating => write!(f, "enumerating"),
            Self::Resolving => write!(f, "resolving"),
            Self::Fetching => write!(f, "fetching"),
            Self::Finalizing => write!(f, "finalizing"),
            Self::Done => write!(f, "done"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

pub type ProgressSender = tokio::sync::broadcast::Sender<ProgressEvent>;

pub type ProgressReceiver = tokio::sync::broadcast::Receiver<ProgressEvent>;

/// Create a progress channel with a bounded buffer.
pub fn channel() -> (ProgressSender, ProgressReceiver) {
    tokio::sync::broadcast::channel(256)
}

/// Emit an event, ignoring send errors from a channel without receivers.
pub fn emit(tx: &Option<ProgressSender>, label: &str, seq: &mut u64, event: ProgressEventKind) {
    if let Some(ref sender) = tx {
        *seq += 1;
        let _ = sender.send(ProgressEvent {
            label: label.to_string(),
            seq: *seq,
            event,
        });
    }
}
