//! Typed event fan-out for clients and the pool.
//!
//! [`EventHub`] is the central publish/subscribe hub, backed by a
//! `tokio::sync::broadcast` channel so that any number of subscribers
//! independently receive every published event. Because every
//! subscriber sees the full union, the catch-all ("all") semantics come
//! for free; filtered views are just a `match` at the receiving end.

use serde_json::Value;
use tokio::sync::broadcast;

use crate::messages::{
    ErrorData, ExecutedData, ExecutingData, ExecutionCachedData, ExecutionStartData,
    ExecutionSuccessData, InterruptedData, LogEntry, PreviewFormat, ProgressData,
};
use crate::pool::QueueMode;

/// Default buffer capacity for event channels.
const DEFAULT_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Client events
// ---------------------------------------------------------------------------

/// Events emitted by a single backend client.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The streaming channel opened for the first time.
    Connected,

    /// The streaming channel re-opened after a drop.
    Reconnected,

    /// The streaming channel dropped.
    Disconnected,

    /// The reconnect ladder exhausted its attempts. Emitted exactly
    /// once; the client stays usable over HTTP.
    ReconnectionFailed,

    /// The backend rejected our credentials.
    AuthError { status: u16 },

    /// A status frame (real or synthesized by the polling fallback).
    Status { queue_remaining: i32 },

    /// A prompt started executing.
    ExecutionStart(ExecutionStartData),

    /// A node is executing (or the prompt finished when `node` is `None`).
    Executing(ExecutingData),

    /// Step-level progress within a node.
    Progress(ProgressData),

    /// A node produced output.
    Executed(ExecutedData),

    /// Nodes were served from cache.
    ExecutionCached(ExecutionCachedData),

    /// The prompt finished successfully.
    ExecutionSuccess(ExecutionSuccessData),

    /// The prompt failed.
    ExecutionError(ErrorData),

    /// The prompt was interrupted.
    ExecutionInterrupted(InterruptedData),

    /// Workflow submission was rejected by the backend.
    QueueError { status: u16, body: String },

    /// An in-progress preview image arrived on the binary channel.
    Preview { format: PreviewFormat, data: Vec<u8> },

    /// A terminal log line (first entry of a `logs` frame).
    Terminal(LogEntry),

    /// A message kind this client does not model. Still fanned out so
    /// observers can handle extension traffic.
    Unknown { kind: String, data: Value },
}

// ---------------------------------------------------------------------------
// Pool events
// ---------------------------------------------------------------------------

/// Events emitted by the fleet dispatcher.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// The pool finished constructing.
    Init,

    /// A client was appended at `client_idx`.
    Added { client_idx: usize },

    /// The client at `client_idx` was removed.
    Removed { client_idx: usize },

    /// The client finished initialization and produced its first
    /// status frame.
    Ready { client_idx: usize },

    /// A job entered the weighted queue.
    AddJob { job_id: u64, weight: f64 },

    /// A backend reported a non-empty queue.
    HaveJob {
        client_idx: usize,
        queue_remaining: i32,
    },

    /// A backend's queue drained to zero.
    Idle { client_idx: usize },

    /// The selection policy changed.
    ChangeMode { mode: QueueMode },

    /// A job attempt failed. When `will_retry` is set the job has been
    /// re-enqueued against the remaining clients.
    ExecutionError {
        client_idx: usize,
        will_retry: bool,
        attempt: u32,
        max_retries: u32,
    },

    /// A per-client event, decorated with the client's index.
    Client {
        client_idx: usize,
        event: ClientEvent,
    },
}

// ---------------------------------------------------------------------------
// EventHub
// ---------------------------------------------------------------------------

/// In-process fan-out hub for one event union.
///
/// Wraps a [`broadcast::Sender`]. Publishing with zero subscribers is
/// not an error; slow subscribers observe `RecvError::Lagged` and may
/// miss intermediate events.
pub struct EventHub<E> {
    sender: broadcast::Sender<E>,
}

impl<E: Clone> EventHub<E> {
    /// Create a hub with a specific channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: E) {
        // Ignore the SendError — it only means there are zero receivers.
        let _ = self.sender.send(event);
    }

    /// Subscribe to every event published on this hub.
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<E: Clone> Default for EventHub<E> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
