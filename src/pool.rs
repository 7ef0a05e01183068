//! Fleet dispatcher.
//!
//! [`ComfyUIPool`] owns a set of [`ComfyUIClient`]s and dispatches
//! jobs to them under one of three selection policies. Jobs carry a
//! weight (lower runs earlier), optional include/exclude filters, and
//! a failover policy that re-enqueues a failed job against the
//! remaining backends.
//!
//! Lock discipline: a client is locked when selected and unlocked only
//! by terminal execution events, queue errors, connection transitions,
//! or (outside [`QueueMode::PickZero`]) status frames. The scheduler
//! locks a client *before* popping the job it was chosen for, so a
//! crash between the two cannot lose the job.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{try_join_all, BoxFuture};
use tokio::sync::{broadcast, oneshot, Notify};
use tokio_util::sync::CancellationToken;

use crate::client::ComfyUIClient;
use crate::events::{ClientEvent, EventHub, PoolEvent};

/// Default bound on the dispatcher's job queue.
const DEFAULT_MAX_QUEUE_SIZE: usize = 1000;

/// Initial back-off while waiting for an eligible client.
const SELECT_BACKOFF_START: Duration = Duration::from_millis(10);

/// Cap on the selection back-off.
const SELECT_BACKOFF_MAX: Duration = Duration::from_millis(500);

/// Idle tick of the scheduler loop when the queue is empty.
const SCHEDULER_IDLE_TICK: Duration = Duration::from_secs(5);

/// Client selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueMode {
    /// Dispatch only to a backend whose own queue is empty.
    #[default]
    PickZero,
    /// Dispatch to the backend with the smallest reported queue.
    PickLowest,
    /// Round-robin over the eligible backends.
    PickRoutine,
}

/// Opaque job failure handed back by job closures.
pub type JobError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by pool operations.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The job queue is at capacity.
    #[error("Job queue is full")]
    QueueFull,

    /// No eligible client became available within the timeout.
    #[error("No eligible client within the timeout")]
    NoClient,

    /// The pool has been destroyed.
    #[error("Pool has been destroyed")]
    Destroyed,

    /// The job failed on its final attempt.
    #[error("Job failed: {0}")]
    Job(JobError),
}

/// Include/exclude filter evaluated against client ids.
///
/// A non-empty `include_ids` restricts selection to members of the
/// set; `exclude_ids` always removes clients (failover accumulates
/// into it).
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub include_ids: Vec<String>,
    pub exclude_ids: Vec<String>,
}

impl JobFilter {
    /// Restrict the job to the given client ids.
    pub fn include(ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            include_ids: ids.into_iter().map(Into::into).collect(),
            exclude_ids: Vec::new(),
        }
    }

    /// Keep the job away from the given client ids.
    pub fn exclude(ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            include_ids: Vec::new(),
            exclude_ids: ids.into_iter().map(Into::into).collect(),
        }
    }

    fn admits(&self, id: &str) -> bool {
        if !self.include_ids.is_empty() && !self.include_ids.iter().any(|i| i == id) {
            return false;
        }
        !self.exclude_ids.iter().any(|e| e == id)
    }
}

/// Failover and scheduling options for one job.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Re-enqueue the job on another backend after a failure.
    pub enable_failover: bool,
    /// Total attempt bound; defaults to the number of online clients
    /// at submission time.
    pub max_retries: Option<u32>,
    /// Pause before a failover re-enqueue.
    pub retry_delay: Duration,
    /// Bound on the wait for an eligible client; `None` waits
    /// indefinitely.
    pub selection_timeout: Option<Duration>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            enable_failover: true,
            max_retries: None,
            retry_delay: Duration::from_secs(1),
            selection_timeout: None,
        }
    }
}

/// Pool construction options.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub mode: QueueMode,
    pub max_queue_size: usize,
    /// Health-probe attempts passed to each client's `init`.
    pub init_tries: u32,
    /// Delay between health probes.
    pub init_delay: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            mode: QueueMode::default(),
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            init_tries: 10,
            init_delay: Duration::from_secs(1),
        }
    }
}

/// Snapshot of one client's dispatcher-visible state.
#[derive(Debug, Clone)]
pub struct ClientSlot {
    pub id: String,
    pub queue_depth: i32,
    pub locked: bool,
    pub online: bool,
}

// ---------------------------------------------------------------------------
// Internal job & member bookkeeping
// ---------------------------------------------------------------------------

type AttemptFn =
    Box<dyn FnMut(ComfyUIClient, usize) -> BoxFuture<'static, Result<(), JobError>> + Send>;
type AbortFn = Box<dyn FnOnce(PoolError) + Send>;

struct JobItem {
    id: u64,
    weight: f64,
    filter: JobFilter,
    /// Attempts already made.
    attempt: u32,
    enable_failover: bool,
    max_retries: u32,
    retry_delay: Duration,
    selection_timeout: Option<Duration>,
    attempt_fn: AttemptFn,
    abort: Option<AbortFn>,
}

struct Member {
    /// Stable key, immune to index shifts from removals.
    key: u64,
    client: ComfyUIClient,
    slot: ClientSlot,
    init_done: bool,
    saw_status: bool,
    ready_emitted: bool,
    forward_cancel: CancellationToken,
}

struct PoolState {
    members: Vec<Member>,
    mode: QueueMode,
    routine_idx: usize,
}

struct PoolInner {
    state: Mutex<PoolState>,
    queue: Mutex<Vec<JobItem>>,
    notify: Notify,
    hub: EventHub<PoolEvent>,
    cancel: CancellationToken,
    destroyed: AtomicBool,
    max_queue_size: usize,
    init_tries: u32,
    init_delay: Duration,
    job_seq: AtomicU64,
    member_seq: AtomicU64,
}

impl PoolInner {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn queue(&self) -> MutexGuard<'_, Vec<JobItem>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Pure scheduling helpers
// ---------------------------------------------------------------------------

/// Insert keeping the queue ascending by weight; equal weights keep
/// submission order.
fn insert_by_weight(queue: &mut Vec<JobItem>, item: JobItem) {
    let pos = queue
        .iter()
        .position(|j| j.weight > item.weight)
        .unwrap_or(queue.len());
    queue.insert(pos, item);
}

/// Pick a client index under `mode` from the online, unlocked,
/// filter-admitted candidates. Advances the round-robin cursor
/// unconditionally when `mode` is [`QueueMode::PickRoutine`].
fn select_candidate(
    slots: &[ClientSlot],
    mode: QueueMode,
    filter: &JobFilter,
    routine_idx: &mut usize,
) -> Option<usize> {
    let candidates: Vec<usize> = slots
        .iter()
        .enumerate()
        .filter(|(_, s)| s.online && !s.locked && filter.admits(&s.id))
        .map(|(i, _)| i)
        .collect();
    if candidates.is_empty() {
        return None;
    }

    match mode {
        QueueMode::PickZero => candidates
            .iter()
            .copied()
            .find(|&i| slots[i].queue_depth == 0),
        QueueMode::PickLowest => candidates
            .iter()
            .copied()
            .min_by_key(|&i| slots[i].queue_depth),
        QueueMode::PickRoutine => {
            let chosen = candidates[*routine_idx % candidates.len()];
            *routine_idx = routine_idx.wrapping_add(1);
            Some(chosen)
        }
    }
}

// ---------------------------------------------------------------------------
// ComfyUIPool
// ---------------------------------------------------------------------------

/// Weighted multi-backend job dispatcher. Cheap to clone; all clones
/// share the same queue and client set.
#[derive(Clone)]
pub struct ComfyUIPool {
    inner: Arc<PoolInner>,
}

impl ComfyUIPool {
    /// Create a pool with the given selection mode and default options.
    ///
    /// Must be called from within a Tokio runtime; the scheduler task
    /// is spawned immediately.
    pub fn new(mode: QueueMode) -> Self {
        Self::with_options(PoolOptions {
            mode,
            ..Default::default()
        })
    }

    /// Create a pool with explicit options.
    pub fn with_options(options: PoolOptions) -> Self {
        let inner = Arc::new(PoolInner {
            state: Mutex::new(PoolState {
                members: Vec::new(),
                mode: options.mode,
                routine_idx: 0,
            }),
            queue: Mutex::new(Vec::new()),
            notify: Notify::new(),
            hub: EventHub::default(),
            cancel: CancellationToken::new(),
            destroyed: AtomicBool::new(false),
            max_queue_size: options.max_queue_size,
            init_tries: options.init_tries,
            init_delay: options.init_delay,
            job_seq: AtomicU64::new(0),
            member_seq: AtomicU64::new(0),
        });

        let scheduler_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            run_scheduler(scheduler_inner).await;
        });

        inner.hub.publish(PoolEvent::Init);
        Self { inner }
    }

    /// Subscribe to pool events (including decorated per-client
    /// events).
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.hub.subscribe()
    }

    /// Current selection mode.
    pub fn mode(&self) -> QueueMode {
        self.inner.state().mode
    }

    /// Atomically swap the selection policy. Jobs in flight are
    /// unaffected.
    pub fn change_mode(&self, mode: QueueMode) {
        self.inner.state().mode = mode;
        self.inner.hub.publish(PoolEvent::ChangeMode { mode });
        self.inner.notify.notify_waiters();
    }

    /// Number of clients in the pool.
    pub fn client_count(&self) -> usize {
        self.inner.state().members.len()
    }

    /// Snapshot of per-client dispatcher state, in insertion order.
    pub fn client_states(&self) -> Vec<ClientSlot> {
        self.inner
            .state()
            .members
            .iter()
            .map(|m| m.slot.clone())
            .collect()
    }

    /// Depth of the dispatcher's own job queue.
    pub fn queued_jobs(&self) -> usize {
        self.inner.queue().len()
    }

    /// Append a client and start its initialization in the background.
    ///
    /// `added` is dispatched immediately; `ready` follows once init
    /// completes and the client produces its first status frame.
    pub fn add_client(&self, client: ComfyUIClient) {
        if self.inner.destroyed.load(Ordering::Acquire) {
            return;
        }

        let key = self.inner.member_seq.fetch_add(1, Ordering::Relaxed);
        let forward_cancel = self.inner.cancel.child_token();
        // Subscribe before init so no event can be missed.
        let events = client.subscribe();

        let client_idx = {
            let mut state = self.inner.state();
            state.members.push(Member {
                key,
                client: client.clone(),
                slot: ClientSlot {
                    id: client.id().to_string(),
                    queue_depth: 0,
                    locked: false,
                    online: false,
                },
                init_done: false,
                saw_status: false,
                ready_emitted: false,
                forward_cancel: forward_cancel.clone(),
            });
            state.members.len() - 1
        };

        self.inner.hub.publish(PoolEvent::Added { client_idx });

        let init_inner = Arc::clone(&self.inner);
        let init_client = client.clone();
        let tries = self.inner.init_tries;
        let delay = self.inner.init_delay;
        tokio::spawn(async move {
            match init_client.init(tries, delay).await {
                Ok(()) => mark_init_done(&init_inner, key),
                Err(e) => {
                    tracing::warn!(client = %init_client.id(), error = %e, "Client init failed");
                }
            }
        });

        let forward_inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            forward_client_events(forward_inner, key, events, forward_cancel).await;
        });
    }

    /// Remove a client by handle. Returns `false` when it is not in
    /// the pool.
    pub fn remove_client(&self, client: &ComfyUIClient) -> bool {
        let index = self
            .inner
            .state()
            .members
            .iter()
            .position(|m| m.client.id() == client.id());
        match index {
            Some(i) => self.remove_client_by_index(i),
            None => false,
        }
    }

    /// Remove a client by index, destroying it. An in-flight job using
    /// it fails over as if the backend died.
    pub fn remove_client_by_index(&self, index: usize) -> bool {
        let member = {
            let mut state = self.inner.state();
            if index >= state.members.len() {
                return false;
            }
            state.members.remove(index)
        };

        member.forward_cancel.cancel();
        member.client.destroy();
        self.inner
            .hub
            .publish(PoolEvent::Removed { client_idx: index });
        self.inner.notify.notify_waiters();
        true
    }

    /// Schedule one job and await its typed result.
    ///
    /// The job closure is invoked with the selected client and its
    /// index; on failure it may be retried on other clients per
    /// `options`.
    pub async fn run<T, E, F, Fut>(
        &self,
        job: F,
        weight: f64,
        filter: JobFilter,
        options: RunOptions,
    ) -> Result<T, PoolError>
    where
        F: Fn(ComfyUIClient, usize) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<JobError> + Send + 'static,
    {
        if self.inner.destroyed.load(Ordering::Acquire) {
            return Err(PoolError::Destroyed);
        }

        let max_retries = options.max_retries.unwrap_or_else(|| {
            let online = self
                .inner
                .state()
                .members
                .iter()
                .filter(|m| m.slot.online)
                .count() as u32;
            online.max(1)
        });

        let (tx, rx) = oneshot::channel::<Result<T, PoolError>>();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let job = Arc::new(job);

        let attempt_tx = Arc::clone(&tx);
        let attempt_fn: AttemptFn = Box::new(move |client, idx| {
            let job = Arc::clone(&job);
            let tx = Arc::clone(&attempt_tx);
            Box::pin(async move {
                match (*job)(client, idx).await {
                    Ok(value) => {
                        let sender = tx.lock().unwrap_or_else(PoisonError::into_inner).take();
                        if let Some(sender) = sender {
                            let _ = sender.send(Ok(value));
                        }
                        Ok(())
                    }
                    Err(e) => Err(e.into()),
                }
            })
        });

        let abort_tx = Arc::clone(&tx);
        let abort: AbortFn = Box::new(move |error| {
            let sender = abort_tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(sender) = sender {
                let _ = sender.send(Err(error));
            }
        });

        let job_id = self.inner.job_seq.fetch_add(1, Ordering::Relaxed);
        let item = JobItem {
            id: job_id,
            weight,
            filter,
            attempt: 0,
            enable_failover: options.enable_failover,
            max_retries,
            retry_delay: options.retry_delay,
            selection_timeout: options.selection_timeout,
            attempt_fn,
            abort: Some(abort),
        };

        {
            let mut queue = self.inner.queue();
            if queue.len() >= self.inner.max_queue_size {
                return Err(PoolError::QueueFull);
            }
            insert_by_weight(&mut queue, item);
        }
        self.inner.hub.publish(PoolEvent::AddJob { job_id, weight });
        self.inner.notify.notify_waiters();

        // A destroy racing the insert above would have drained the
        // queue already; sweep our own job so the await cannot hang.
        if self.inner.destroyed.load(Ordering::Acquire) {
            if let Some(mut item) = remove_job(&self.inner, job_id) {
                if let Some(abort) = item.abort.take() {
                    abort(PoolError::Destroyed);
                }
            }
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(PoolError::Destroyed),
        }
    }

    /// Schedule several jobs with the same weight and filter; resolves
    /// with every result or fails fast on the first unrecoverable
    /// error.
    pub async fn batch<T, E, F, Fut>(
        &self,
        jobs: Vec<F>,
        weight: f64,
        filter: JobFilter,
        options: RunOptions,
    ) -> Result<Vec<T>, PoolError>
    where
        F: Fn(ComfyUIClient, usize) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<JobError> + Send + 'static,
    {
        try_join_all(
            jobs.into_iter()
                .map(|job| self.run(job, weight, filter.clone(), options.clone())),
        )
        .await
    }

    /// Destroy the pool: cancel the scheduler, fail every queued job,
    /// and destroy every client. Idempotent.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        tracing::info!("Destroying pool");
        self.inner.cancel.cancel();

        let members = {
            let mut state = self.inner.state();
            std::mem::take(&mut state.members)
        };
        for member in &members {
            member.forward_cancel.cancel();
            member.client.destroy();
        }

        let jobs = {
            let mut queue = self.inner.queue();
            std::mem::take(&mut *queue)
        };
        for mut job in jobs {
            if let Some(abort) = job.abort.take() {
                abort(PoolError::Destroyed);
            }
        }

        self.inner.notify.notify_waiters();
    }
}

// ---------------------------------------------------------------------------
// Event forwarding & per-client state transitions
// ---------------------------------------------------------------------------

/// Forward one client's events into the pool, applying the lock and
/// liveness rules on the way through.
async fn forward_client_events(
    inner: Arc<PoolInner>,
    key: u64,
    mut events: broadcast::Receiver<ClientEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            received = events.recv() => match received {
                Ok(event) => apply_client_event(&inner, key, event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(member = key, skipped, "Pool lagged behind client events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    apply_client_event(&inner, key, ClientEvent::Disconnected);
                    return;
                }
            }
        }
    }
}

/// Apply one client event to the member's slot and re-emit it
/// decorated with the client index.
fn apply_client_event(inner: &Arc<PoolInner>, key: u64, event: ClientEvent) {
    let mut pending: Vec<PoolEvent> = Vec::new();

    {
        let mut state = inner.state();
        let mode = state.mode;
        let Some(idx) = state.members.iter().position(|m| m.key == key) else {
            return;
        };
        let member = &mut state.members[idx];

        // A destroyed client ignores all inbound events; its state is
        // permanently offline and unlocked.
        if member.client.is_destroyed() {
            member.slot.online = false;
            member.slot.locked = false;
            return;
        }

        match &event {
            ClientEvent::Status { queue_remaining } => {
                let previous = member.slot.queue_depth;
                member.slot.online = true;
                member.slot.queue_depth = *queue_remaining;
                member.saw_status = true;
                if mode != QueueMode::PickZero {
                    member.slot.locked = false;
                }
                if *queue_remaining > 0 {
                    pending.push(PoolEvent::HaveJob {
                        client_idx: idx,
                        queue_remaining: *queue_remaining,
                    });
                } else if previous > 0 {
                    pending.push(PoolEvent::Idle { client_idx: idx });
                }
            }
            ClientEvent::Connected => {
                // A connected channel alone says nothing about queue
                // state; the slot comes online with its first status
                // frame.
            }
            ClientEvent::Reconnected => {
                // Same as Connected: the pre-disconnect queue depth is
                // stale, so stay offline until a fresh status frame
                // confirms it.
                member.slot.locked = false;
            }
            ClientEvent::Disconnected => {
                member.slot.online = false;
                member.slot.locked = false;
            }
            ClientEvent::ReconnectionFailed => {
                member.slot.online = false;
            }
            ClientEvent::ExecutionSuccess(_)
            | ClientEvent::ExecutionError(_)
            | ClientEvent::ExecutionInterrupted(_)
            | ClientEvent::QueueError { .. } => {
                member.slot.locked = false;
            }
            _ => {}
        }

        if member.init_done && member.saw_status && !member.ready_emitted {
            member.ready_emitted = true;
            pending.push(PoolEvent::Ready { client_idx: idx });
        }

        pending.push(PoolEvent::Client {
            client_idx: idx,
            event,
        });
    }

    for pool_event in pending {
        inner.hub.publish(pool_event);
    }
    inner.notify.notify_waiters();
}

/// Record init completion for a member and emit `ready` if its first
/// status frame has already arrived.
fn mark_init_done(inner: &Arc<PoolInner>, key: u64) {
    let ready_idx = {
        let mut state = inner.state();
        let Some(idx) = state.members.iter().position(|m| m.key == key) else {
            return;
        };
        let member = &mut state.members[idx];
        member.init_done = true;
        if member.saw_status && !member.ready_emitted {
            member.ready_emitted = true;
            Some(idx)
        } else {
            None
        }
    };

    if let Some(client_idx) = ready_idx {
        inner.hub.publish(PoolEvent::Ready { client_idx });
    }
    inner.notify.notify_waiters();
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

enum SelectOutcome {
    Locked {
        client: ComfyUIClient,
        key: u64,
        idx: usize,
    },
    HeadChanged,
    Timeout,
    Destroyed,
}

/// Background scheduling loop: peek the queue head, lock a client for
/// it, then pop and dispatch.
async fn run_scheduler(inner: Arc<PoolInner>) {
    loop {
        if inner.cancel.is_cancelled() {
            return;
        }

        let head = {
            let queue = inner.queue();
            queue
                .first()
                .map(|j| (j.id, j.filter.clone(), j.selection_timeout))
        };

        let Some((job_id, filter, selection_timeout)) = head else {
            tokio::select! {
                _ = inner.cancel.cancelled() => return,
                _ = inner.notify.notified() => {}
                _ = tokio::time::sleep(SCHEDULER_IDLE_TICK) => {}
            }
            continue;
        };

        match select_and_lock(&inner, job_id, &filter, selection_timeout).await {
            SelectOutcome::Destroyed => return,
            SelectOutcome::HeadChanged => continue,
            SelectOutcome::Timeout => {
                if let Some(mut item) = remove_job(&inner, job_id) {
                    tracing::warn!(job_id, "No eligible client for job filters");
                    if let Some(abort) = item.abort.take() {
                        abort(PoolError::NoClient);
                    }
                }
                continue;
            }
            SelectOutcome::Locked { client, key, idx } => {
                // Pop only if the locked-for job is still the head; a
                // lighter job may have arrived while we waited.
                let item = {
                    let mut queue = inner.queue();
                    if queue.first().map(|j| j.id) == Some(job_id) {
                        Some(queue.remove(0))
                    } else {
                        None
                    }
                };

                match item {
                    Some(item) => spawn_attempt(Arc::clone(&inner), item, client, key, idx),
                    None => {
                        // Undo the speculative lock and re-evaluate.
                        let mut state = inner.state();
                        if let Some(member) = state.members.iter_mut().find(|m| m.key == key) {
                            member.slot.locked = false;
                        }
                    }
                }
            }
        }
    }
}

/// Wait (bounded back-off plus state-change notifications) until a
/// client can be locked for the job's filters.
async fn select_and_lock(
    inner: &Arc<PoolInner>,
    job_id: u64,
    filter: &JobFilter,
    selection_timeout: Option<Duration>,
) -> SelectOutcome {
    let deadline = selection_timeout.map(|t| tokio::time::Instant::now() + t);
    let mut backoff = SELECT_BACKOFF_START;

    loop {
        if inner.cancel.is_cancelled() {
            return SelectOutcome::Destroyed;
        }

        // A lighter job may have replaced the head while we waited;
        // restart selection with its filters.
        {
            let queue = inner.queue();
            if queue.first().map(|j| j.id) != Some(job_id) {
                return SelectOutcome::HeadChanged;
            }
        }

        {
            let mut state = inner.state();
            let mode = state.mode;
            // Destroyed clients are ineligible even when their slot
            // has not caught up yet.
            let slots: Vec<ClientSlot> = state
                .members
                .iter()
                .map(|m| {
                    let mut slot = m.slot.clone();
                    if m.client.is_destroyed() {
                        slot.online = false;
                    }
                    slot
                })
                .collect();
            if let Some(idx) = select_candidate(&slots, mode, filter, &mut state.routine_idx) {
                let member = &mut state.members[idx];
                member.slot.locked = true;
                return SelectOutcome::Locked {
                    client: member.client.clone(),
                    key: member.key,
                    idx,
                };
            }
        }

        if let Some(deadline) = deadline {
            if tokio::time::Instant::now() >= deadline {
                return SelectOutcome::Timeout;
            }
        }

        tokio::select! {
            _ = inner.cancel.cancelled() => return SelectOutcome::Destroyed,
            _ = inner.notify.notified() => {}
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(SELECT_BACKOFF_MAX);
    }
}

/// Remove a job from anywhere in the queue by id.
fn remove_job(inner: &Arc<PoolInner>, job_id: u64) -> Option<JobItem> {
    let mut queue = inner.queue();
    let pos = queue.iter().position(|j| j.id == job_id)?;
    Some(queue.remove(pos))
}

/// Run one attempt of a job on its locked client.
fn spawn_attempt(
    inner: Arc<PoolInner>,
    mut item: JobItem,
    client: ComfyUIClient,
    key: u64,
    idx: usize,
) {
    tokio::spawn(async move {
        item.attempt += 1;
        tracing::debug!(
            job_id = item.id,
            client = %client.id(),
            attempt = item.attempt,
            "Dispatching job",
        );

        let attempt_future = (item.attempt_fn)(client.clone(), idx);
        match attempt_future.await {
            Ok(()) => {
                // The result was delivered through the job's channel;
                // the lock clears on the client's terminal event.
            }
            Err(error) => handle_failure(inner, item, client, key, idx, error).await,
        }
    });
}

/// Failover policy: unlock the client, then either re-enqueue the job
/// with the failed client excluded, or surface the error.
async fn handle_failure(
    inner: Arc<PoolInner>,
    mut item: JobItem,
    client: ComfyUIClient,
    key: u64,
    selected_idx: usize,
    error: JobError,
) {
    item.filter.exclude_ids.push(client.id().to_string());

    let (client_idx, remaining) = {
        let mut state = inner.state();
        let current_idx = state.members.iter().position(|m| m.key == key);
        if let Some(i) = current_idx {
            state.members[i].slot.locked = false;
        }
        let remaining = state
            .members
            .iter()
            .filter(|m| m.slot.online && item.filter.admits(&m.slot.id))
            .count();
        (current_idx.unwrap_or(selected_idx), remaining)
    };

    let will_retry = item.enable_failover && item.attempt < item.max_retries && remaining > 0;

    inner.hub.publish(PoolEvent::ExecutionError {
        client_idx,
        will_retry,
        attempt: item.attempt,
        max_retries: item.max_retries,
    });
    inner.notify.notify_waiters();

    if !will_retry {
        tracing::error!(
            job_id = item.id,
            client = %client.id(),
            attempt = item.attempt,
            error = %error,
            "Job failed with no retry remaining",
        );
        if let Some(abort) = item.abort.take() {
            abort(PoolError::Job(error));
        }
        return;
    }

    tracing::warn!(
        job_id = item.id,
        client = %client.id(),
        attempt = item.attempt,
        max_retries = item.max_retries,
        error = %error,
        "Job attempt failed; re-enqueueing on remaining clients",
    );

    if !item.retry_delay.is_zero() {
        tokio::time::sleep(item.retry_delay).await;
    }

    if inner.destroyed.load(Ordering::Acquire) {
        if let Some(abort) = item.abort.take() {
            abort(PoolError::Destroyed);
        }
        return;
    }

    let job_id = item.id;
    insert_by_weight(&mut inner.queue(), item);
    inner.notify.notify_waiters();

    if inner.destroyed.load(Ordering::Acquire) {
        if let Some(mut item) = remove_job(&inner, job_id) {
            if let Some(abort) = item.abort.take() {
                abort(PoolError::Destroyed);
            }
        }
    }
}
