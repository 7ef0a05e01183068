//! Prompt call lifecycle.
//!
//! [`PromptCall`] turns one finalized workflow into a sequence of
//! observable events: it submits the workflow, correlates the client's
//! event stream by prompt id, buffers per-node outputs, reconciles
//! cached executions, and resolves to either the declared outputs or a
//! typed failure.
//!
//! The event bookkeeping lives in a pure reducer ([`CallState`]) so
//! the out-of-order cases (missing `execution_start`, cache-only
//! completion, late interrupts) are testable without a backend.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::client::{ClientError, ComfyUIClient};
use crate::events::ClientEvent;
use crate::messages::{PreviewFormat, ProgressData};
use crate::template::PromptTemplate;

/// Default wait for `execution_interrupted` after an interrupt request.
const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Default wait for a success frame once outputs are cache-satisfied.
const DEFAULT_CACHE_GRACE: Duration = Duration::from_secs(1);

/// Terminal failures of a prompt call.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// The workflow never entered the backend queue.
    #[error("Workflow submission failed: {0}")]
    Submit(#[source] ClientError),

    /// The backend reported an execution error.
    #[error("Execution failed on node {node}: {message}")]
    Execution { node: String, message: String },

    /// The backend reported an interruption.
    #[error("Execution was interrupted")]
    Interrupted,

    /// Execution finished but declared outputs are missing, even after
    /// consulting history.
    #[error("Declared outputs missing after completion: {missing:?}")]
    Incomplete { missing: Vec<String> },

    /// An interrupt was requested but never confirmed within the grace
    /// window.
    #[error("Interrupt requested but never confirmed")]
    CancelTimeout,

    /// The per-call deadline elapsed.
    #[error("Call deadline exceeded")]
    DeadlineExceeded,

    /// The client was destroyed while the call was in flight.
    #[error("Client was destroyed mid-call")]
    Destroyed,
}

// ---------------------------------------------------------------------------
// Reducer
// ---------------------------------------------------------------------------

/// What the driver should do in response to an applied event.
#[derive(Debug, Clone, PartialEq)]
enum Transition {
    /// The call started executing (exactly once, possibly implicit).
    Start,
    /// A progress frame for this call.
    Progress(ProgressData),
    /// All declared outputs are satisfied from cache; arm the grace
    /// timer and finalize if no success frame arrives.
    CacheSatisfied,
    /// The backend declared the prompt complete.
    Success,
    /// Terminal failure.
    Failed(FailKind),
}

#[derive(Debug, Clone, PartialEq)]
enum FailKind {
    Execution { node: String, message: String },
    Interrupted,
}

/// Event bookkeeping for one prompt id.
struct CallState {
    prompt_id: String,
    started: bool,
    /// Declared outputs: name → node id.
    wanted: HashMap<String, String>,
    /// Buffered node outputs: node id → output blob.
    buffered: HashMap<String, Value>,
    /// Nodes the backend served from cache.
    cached: HashSet<String>,
    progress_frames: u64,
}

impl CallState {
    fn new(prompt_id: String, wanted: HashMap<String, String>) -> Self {
        Self {
            prompt_id,
            started: false,
            wanted,
            buffered: HashMap::new(),
            cached: HashSet::new(),
            progress_frames: 0,
        }
    }

    /// Apply one client event; returns the transitions it triggers.
    /// Events for other prompt ids fall through without effect.
    fn apply(&mut self, event: &ClientEvent) -> Vec<Transition> {
        let mut out = Vec::new();
        match event {
            ClientEvent::ExecutionStart(data) if data.prompt_id == self.prompt_id => {
                self.mark_started(&mut out);
            }
            ClientEvent::Progress(data) if data.prompt_id.as_deref() == Some(&self.prompt_id) => {
                // A progress frame before execution_start is an
                // implicit start.
                self.mark_started(&mut out);
                self.progress_frames += 1;
                out.push(Transition::Progress(data.clone()));
            }
            ClientEvent::Executed(data) if data.prompt_id == self.prompt_id => {
                self.mark_started(&mut out);
                self.buffered.insert(data.node.clone(), data.output.clone());
            }
            ClientEvent::ExecutionCached(data) if data.prompt_id == self.prompt_id => {
                self.mark_started(&mut out);
                self.cached.extend(data.nodes.iter().cloned());
                if self.cache_satisfied() {
                    out.push(Transition::CacheSatisfied);
                }
            }
            ClientEvent::Executing(data) if data.prompt_id == self.prompt_id => {
                self.mark_started(&mut out);
                // `node == None` marks completion on servers that do
                // not emit execution_success.
                if data.node.is_none() {
                    out.push(Transition::Success);
                }
            }
            ClientEvent::ExecutionSuccess(data) if data.prompt_id == self.prompt_id => {
                out.push(Transition::Success);
            }
            ClientEvent::ExecutionError(data) if data.prompt_id == self.prompt_id => {
                out.push(Transition::Failed(FailKind::Execution {
                    node: data.node_id.clone().unwrap_or_default(),
                    message: data.exception_message.clone(),
                }));
            }
            ClientEvent::ExecutionInterrupted(data) if data.prompt_id == self.prompt_id => {
                out.push(Transition::Failed(FailKind::Interrupted));
            }
            _ => {}
        }
        out
    }

    fn mark_started(&mut self, out: &mut Vec<Transition>) {
        if !self.started {
            self.started = true;
            out.push(Transition::Start);
        }
    }

    /// All declared output nodes are covered by cache or buffer.
    fn cache_satisfied(&self) -> bool {
        !self.wanted.is_empty()
            && self
                .wanted
                .values()
                .all(|node| self.cached.contains(node) || self.buffered.contains_key(node))
    }
}

// ---------------------------------------------------------------------------
// PromptCall
// ---------------------------------------------------------------------------

type PendingFn = Box<dyn Fn(&str) + Send>;
type StartFn = Box<dyn Fn(&str) + Send>;
type ProgressFn = Box<dyn Fn(&ProgressData) + Send>;
type PreviewFn = Box<dyn Fn(PreviewFormat, &[u8]) + Send>;
type FinishedFn = Box<dyn Fn(&HashMap<String, Value>) + Send>;
type FailedFn = Box<dyn Fn(&CallError) + Send>;

/// Handle for cancelling a running call from outside.
#[derive(Clone)]
pub struct CallHandle {
    cancel: CancellationToken,
}

impl CallHandle {
    /// Request cancellation: the call interrupts the backend and waits
    /// a bounded grace window for confirmation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Drives one workflow submission to a typed outcome.
pub struct PromptCall {
    client: ComfyUIClient,
    template: PromptTemplate,
    position: Option<i64>,
    on_pending: Option<PendingFn>,
    on_start: Option<StartFn>,
    on_progress: Option<ProgressFn>,
    on_preview: Option<PreviewFn>,
    on_finished: Option<FinishedFn>,
    on_failed: Option<FailedFn>,
    deadline: Option<Duration>,
    cancel_grace: Duration,
    cache_grace: Duration,
    cancel: CancellationToken,
}

impl PromptCall {
    /// Create a call for `template` against `client`.
    pub fn new(client: ComfyUIClient, template: PromptTemplate) -> Self {
        Self {
            client,
            template,
            position: None,
            on_pending: None,
            on_start: None,
            on_progress: None,
            on_preview: None,
            on_finished: None,
            on_failed: None,
            deadline: None,
            cancel_grace: DEFAULT_CANCEL_GRACE,
            cache_grace: DEFAULT_CACHE_GRACE,
            cancel: CancellationToken::new(),
        }
    }

    /// Queue position override (`Some(-1)` = front).
    pub fn with_position(mut self, position: Option<i64>) -> Self {
        self.position = position;
        self
    }

    /// Overall deadline; on expiry the call interrupts the backend.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// How long to wait for interrupt confirmation.
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    /// How long to wait for a success frame after outputs are
    /// cache-satisfied.
    pub fn with_cache_grace(mut self, grace: Duration) -> Self {
        self.cache_grace = grace;
        self
    }

    /// Called with the prompt id once the workflow is queued.
    pub fn on_pending(mut self, f: impl Fn(&str) + Send + 'static) -> Self {
        self.on_pending = Some(Box::new(f));
        self
    }

    /// Called exactly once when execution starts.
    pub fn on_start(mut self, f: impl Fn(&str) + Send + 'static) -> Self {
        self.on_start = Some(Box::new(f));
        self
    }

    /// Called for every progress frame.
    pub fn on_progress(mut self, f: impl Fn(&ProgressData) + Send + 'static) -> Self {
        self.on_progress = Some(Box::new(f));
        self
    }

    /// Called for every preview image streamed while the call runs.
    pub fn on_preview(mut self, f: impl Fn(PreviewFormat, &[u8]) + Send + 'static) -> Self {
        self.on_preview = Some(Box::new(f));
        self
    }

    /// Called with the assembled outputs on success.
    pub fn on_finished(mut self, f: impl Fn(&HashMap<String, Value>) + Send + 'static) -> Self {
        self.on_finished = Some(Box::new(f));
        self
    }

    /// Called with the terminal error on failure.
    pub fn on_failed(mut self, f: impl Fn(&CallError) + Send + 'static) -> Self {
        self.on_failed = Some(Box::new(f));
        self
    }

    /// A cancellation handle usable from another task.
    pub fn handle(&self) -> CallHandle {
        CallHandle {
            cancel: self.cancel.clone(),
        }
    }

    /// Submit the workflow and drive it to completion.
    pub async fn run(self) -> Result<HashMap<String, Value>, CallError> {
        let PromptCall {
            client,
            template,
            position,
            on_pending,
            on_start,
            on_progress,
            on_preview,
            on_finished,
            on_failed,
            deadline,
            cancel_grace,
            cache_grace,
            cancel,
        } = self;

        let fail = |e: CallError| {
            if let Some(cb) = &on_failed {
                cb(&e);
            }
            Err(e)
        };

        // Subscribe before submission so no frame can slip between the
        // POST and the first recv.
        let mut rx = client.subscribe();

        let workflow = template.finalize();
        let response = match client.queue_prompt(position, &workflow).await {
            Ok(response) => response,
            Err(e) => return fail(CallError::Submit(e)),
        };
        let prompt_id = response.prompt_id;
        tracing::debug!(client = %client.id(), prompt_id = %prompt_id, "Workflow queued");
        if let Some(cb) = &on_pending {
            cb(&prompt_id);
        }

        let mut state = CallState::new(prompt_id.clone(), template.output_nodes());

        let deadline_at = deadline.map(|d| tokio::time::Instant::now() + d);
        let mut cache_at: Option<tokio::time::Instant> = None;
        let mut cancel_at: Option<tokio::time::Instant> = None;
        let mut cancel_requested = false;
        let mut deadline_hit = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled(), if !cancel_requested => {
                    cancel_requested = true;
                    tracing::info!(prompt_id = %prompt_id, "Cancelling call");
                    let _ = client.interrupt().await;
                    cancel_at = Some(tokio::time::Instant::now() + cancel_grace);
                }
                _ = sleep_until_opt(deadline_at), if deadline_at.is_some() && !cancel_requested => {
                    cancel_requested = true;
                    deadline_hit = true;
                    tracing::warn!(prompt_id = %prompt_id, "Call deadline reached, interrupting");
                    let _ = client.interrupt().await;
                    cancel_at = Some(tokio::time::Instant::now() + cancel_grace);
                }
                _ = sleep_until_opt(cancel_at) => {
                    return fail(if deadline_hit {
                        CallError::DeadlineExceeded
                    } else {
                        CallError::CancelTimeout
                    });
                }
                _ = sleep_until_opt(cache_at) => {
                    // Outputs were cache-satisfied and no success frame
                    // arrived within the grace window.
                    tracing::debug!(prompt_id = %prompt_id, "Cache grace elapsed, finalizing");
                    return match assemble_outputs(&client, &prompt_id, &state).await {
                        Ok(outputs) => {
                            if let Some(cb) = &on_finished {
                                cb(&outputs);
                            }
                            Ok(outputs)
                        }
                        Err(e) => fail(e),
                    };
                }
                received = rx.recv() => match received {
                    Ok(ClientEvent::Preview { format, data }) => {
                        if state.started {
                            if let Some(cb) = &on_preview {
                                cb(format, &data);
                            }
                        }
                    }
                    Ok(event) => {
                        for transition in state.apply(&event) {
                            match transition {
                                Transition::Start => {
                                    if let Some(cb) = &on_start {
                                        cb(&prompt_id);
                                    }
                                }
                                Transition::Progress(data) => {
                                    if let Some(cb) = &on_progress {
                                        cb(&data);
                                    }
                                }
                                Transition::CacheSatisfied => {
                                    if cache_at.is_none() {
                                        cache_at =
                                            Some(tokio::time::Instant::now() + cache_grace);
                                    }
                                }
                                Transition::Success => {
                                    return match assemble_outputs(&client, &prompt_id, &state)
                                        .await
                                    {
                                        Ok(outputs) => {
                                            if let Some(cb) = &on_finished {
                                                cb(&outputs);
                                            }
                                            Ok(outputs)
                                        }
                                        Err(e) => fail(e),
                                    };
                                }
                                Transition::Failed(kind) => {
                                    return fail(match kind {
                                        FailKind::Interrupted if deadline_hit => {
                                            CallError::DeadlineExceeded
                                        }
                                        FailKind::Interrupted => CallError::Interrupted,
                                        FailKind::Execution { node, message } => {
                                            CallError::Execution { node, message }
                                        }
                                    });
                                }
                            }
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            prompt_id = %prompt_id,
                            skipped,
                            "Event stream lagged; outputs will be reconciled from history",
                        );
                    }
                    Err(RecvError::Closed) => {
                        return fail(CallError::Destroyed);
                    }
                }
            }
        }
    }
}

/// Sleep until `at`, or forever when unarmed.
async fn sleep_until_opt(at: Option<tokio::time::Instant>) {
    match at {
        Some(instant) => tokio::time::sleep_until(instant).await,
        None => std::future::pending::<()>().await,
    }
}

/// Assemble the declared outputs from the buffer, consulting history
/// once for anything cache-satisfied or lost to a lagged stream.
async fn assemble_outputs(
    client: &ComfyUIClient,
    prompt_id: &str,
    state: &CallState,
) -> Result<HashMap<String, Value>, CallError> {
    tracing::debug!(
        prompt_id = %prompt_id,
        progress_frames = state.progress_frames,
        "Assembling declared outputs",
    );

    let mut outputs = HashMap::new();
    let mut missing: Vec<(&String, &String)> = Vec::new();

    for (name, node) in &state.wanted {
        match state.buffered.get(node) {
            Some(value) => {
                outputs.insert(name.clone(), value.clone());
            }
            None => missing.push((name, node)),
        }
    }

    if !missing.is_empty() {
        let history = match client.get_history(prompt_id).await {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(prompt_id = %prompt_id, error = %e, "History lookup failed");
                None
            }
        };

        if let Some(entry) = history {
            for (name, node) in &missing {
                if let Some(value) = entry.get("outputs").and_then(|o| o.get(node.as_str())) {
                    outputs.insert((*name).clone(), value.clone());
                }
            }
        }

        let still_missing: Vec<String> = state
            .wanted
            .keys()
            .filter(|name| !outputs.contains_key(*name))
            .cloned()
            .collect();
        if !still_missing.is_empty() {
            return Err(CallError::Incomplete {
                missing: still_missing,
            });
        }
    }

    Ok(outputs)
}
