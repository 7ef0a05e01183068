//! Per-backend connection manager.
//!
//! A [`ComfyUIClient`] owns everything about one backend: the REST
//! layer, the streaming channel with its reconnect ladder, a liveness
//! watchdog, an HTTP-polling fallback for environments where the
//! channel cannot open, and the event fan-out that the call lifecycle
//! and the pool subscribe to.
//!
//! Lifecycle: `new → init → ready → (online ↔ disconnected)* →
//! destroyed`. `destroy` is terminal; a destroyed client refuses all
//! further operations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::api::{
    ActivityTracker, ApiError, ComfyUIApi, ImageRef, OsType, QueueInfo, QueuePromptResponse,
    RawLogs, SamplerInfo, SystemStats, UploadOptions, Uploaded,
};
use crate::auth::Credentials;
use crate::events::{ClientEvent, EventHub};
use crate::messages::{self, BinaryEvent, ComfyUIMessage, QueueStatus};
use crate::reconnect::{next_delay, ReconnectConfig};

/// Poll interval of the HTTP fallback when the channel cannot open.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default liveness timeout for the streaming channel.
const DEFAULT_WS_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Tunable client options.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Stable identifier; defaults to the host without its scheme.
    pub id: Option<String>,
    /// Liveness timeout; the watchdog forces a reconnect when no frame
    /// or successful HTTP response arrives within this window.
    pub ws_timeout: Duration,
    /// Subscribe to streamed terminal logs during `init`.
    pub subscribe_terminal_logs: bool,
    /// Reconnect backoff parameters.
    pub reconnect: ReconnectConfig,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            id: None,
            ws_timeout: DEFAULT_WS_TIMEOUT,
            subscribe_terminal_logs: false,
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Errors from client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// A REST call failed.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// The backend never answered the health probe.
    #[error("Backend unreachable after {tries} health probes")]
    Unreachable { tries: u32 },

    /// The backend rejected our credentials during init.
    #[error("Authentication rejected (HTTP {status})")]
    Auth { status: u16 },

    /// The client has been destroyed.
    #[error("Client has been destroyed")]
    Destroyed,
}

/// Mutable session state behind the client handle.
struct SessionState {
    /// Session client id sent to the server; rebound when the server
    /// assigns a `sid`.
    client_id: String,
    os_type: OsType,
    extensions: Vec<String>,
    /// Force-close handle for the current socket, when one is up.
    conn_cancel: Option<CancellationToken>,
    channel_up: bool,
    reconnect_exhausted: bool,
    tasks_spawned: bool,
}

struct ClientInner {
    id: String,
    host: String,
    ws_base: String,
    credentials: Credentials,
    ws_timeout: Duration,
    subscribe_logs: bool,
    reconnect: ReconnectConfig,
    api: ComfyUIApi,
    activity: Arc<ActivityTracker>,
    hub: EventHub<ClientEvent>,
    cancel: CancellationToken,
    destroyed: AtomicBool,
    ready: AtomicBool,
    state: Mutex<SessionState>,
}

impl ClientInner {
    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish unless destroyed: a destroyed client dispatches no
    /// further events.
    fn emit(&self, event: ClientEvent) {
        if !self.destroyed.load(Ordering::Acquire) {
            self.hub.publish(event);
        }
    }
}

/// Handle to one backend. Cheap to clone; all clones share the same
/// connection and state.
#[derive(Clone)]
pub struct ComfyUIClient {
    inner: Arc<ClientInner>,
}

impl ComfyUIClient {
    /// Create a client with default options.
    pub fn new(host: impl Into<String>, credentials: Credentials) -> Result<Self, ClientError> {
        Self::with_options(host, credentials, ClientOptions::default())
    }

    /// Create a client with explicit options.
    pub fn with_options(
        host: impl Into<String>,
        credentials: Credentials,
        options: ClientOptions,
    ) -> Result<Self, ClientError> {
        let host = host.into().trim_end_matches('/').to_string();
        let api = ComfyUIApi::new(&host, &credentials)?;
        let activity = api.activity();
        let id = options.id.unwrap_or_else(|| host_derived_id(&host));

        Ok(Self {
            inner: Arc::new(ClientInner {
                ws_base: ws_base_for(&host),
                host,
                id,
                credentials,
                ws_timeout: options.ws_timeout,
                subscribe_logs: options.subscribe_terminal_logs,
                reconnect: options.reconnect,
                api,
                activity,
                hub: EventHub::default(),
                cancel: CancellationToken::new(),
                destroyed: AtomicBool::new(false),
                ready: AtomicBool::new(false),
                state: Mutex::new(SessionState {
                    client_id: uuid::Uuid::new_v4().to_string(),
                    os_type: OsType::Unknown,
                    extensions: Vec::new(),
                    conn_cancel: None,
                    channel_up: false,
                    reconnect_exhausted: false,
                    tasks_spawned: false,
                }),
            }),
        })
    }

    // ---- identity & introspection ----

    /// Stable identifier (client-assigned or host-derived).
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Base HTTP URL.
    pub fn host(&self) -> &str {
        &self.inner.host
    }

    /// Current session client id (server-rebindable).
    pub fn client_id(&self) -> String {
        self.inner.state().client_id.clone()
    }

    /// OS family discovered during `init`.
    pub fn os_type(&self) -> OsType {
        self.inner.state().os_type
    }

    /// Extension scripts discovered during `init`.
    pub fn extensions(&self) -> Vec<String> {
        self.inner.state().extensions.clone()
    }

    /// Whether a named extension was present at probe time. Capability
    /// loss after init is non-fatal and not re-probed.
    pub fn supports_extension(&self, needle: &str) -> bool {
        self.inner
            .state()
            .extensions
            .iter()
            .any(|e| e.contains(needle))
    }

    /// True once `init` has fully completed.
    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::Acquire)
    }

    /// True once `destroy` has been called.
    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    /// Time since the last streamed frame or successful HTTP response.
    pub fn idle_for(&self) -> Duration {
        self.inner.activity.idle()
    }

    /// Direct access to the REST layer.
    pub fn api(&self) -> &ComfyUIApi {
        &self.inner.api
    }

    /// Subscribe to this client's event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.hub.subscribe()
    }

    // ---- lifecycle ----

    /// Initialize the client: health-probe the backend up to
    /// `max_tries` times with `delay` between probes, discover the OS
    /// family, probe extensions, open the streaming channel, and apply
    /// the terminal-log subscription.
    ///
    /// Idempotent: calling `init` on a ready client returns
    /// immediately.
    pub async fn init(&self, max_tries: u32, delay: Duration) -> Result<(), ClientError> {
        let inner = &self.inner;
        if inner.destroyed.load(Ordering::Acquire) {
            return Err(ClientError::Destroyed);
        }
        if inner.ready.load(Ordering::Acquire) {
            return Ok(());
        }

        // 1. Health probe with a bounded deadline of max_tries · delay.
        let tries = max_tries.max(1);
        let mut reachable = false;
        for attempt in 1..=tries {
            if inner.destroyed.load(Ordering::Acquire) {
                return Err(ClientError::Destroyed);
            }
            match inner.api.get_queue_status().await {
                Ok(_) => {
                    reachable = true;
                    break;
                }
                Err(ApiError::Auth { status }) => {
                    inner.emit(ClientEvent::AuthError { status });
                    return Err(ClientError::Auth { status });
                }
                Err(e) => {
                    tracing::debug!(
                        client = %inner.id,
                        attempt,
                        error = %e,
                        "Health probe failed",
                    );
                    if attempt < tries {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        if !reachable {
            return Err(ClientError::Unreachable { tries });
        }

        // 2. OS discovery.
        let stats = inner.api.get_system_stats().await?;
        let os_type = stats.os_type();

        // 3. Feature probe. Capability loss is non-fatal.
        let extensions = match inner.api.get_extensions().await {
            Ok(list) => list,
            Err(e) => {
                tracing::warn!(client = %inner.id, error = %e, "Extension probe failed");
                Vec::new()
            }
        };

        {
            let mut state = inner.state();
            state.os_type = os_type;
            state.extensions = extensions;
        }

        // 4. Streaming channel + liveness watchdog, spawned once.
        let spawn_tasks = {
            let mut state = inner.state();
            !std::mem::replace(&mut state.tasks_spawned, true)
        };
        if spawn_tasks {
            let channel_inner = Arc::clone(inner);
            tokio::spawn(async move {
                run_channel(channel_inner).await;
            });
            let watchdog_inner = Arc::clone(inner);
            tokio::spawn(async move {
                run_watchdog(watchdog_inner).await;
            });
        }

        // 5. Terminal-log subscription, when configured. Non-fatal.
        if inner.subscribe_logs {
            let client_id = self.client_id();
            if let Err(e) = inner.api.set_terminal_subscription(&client_id, true).await {
                tracing::warn!(client = %inner.id, error = %e, "Terminal log subscription failed");
            }
        }

        inner.ready.store(true, Ordering::Release);
        tracing::info!(client = %inner.id, host = %inner.host, ?os_type, "Client ready");
        Ok(())
    }

    /// Destroy the client: cancel the channel, watchdog, and polling
    /// tasks, unsubscribe terminal logs, and refuse all further
    /// operations. Idempotent and non-blocking.
    pub fn destroy(&self) {
        let inner = &self.inner;
        if inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        tracing::info!(client = %inner.id, "Destroying client");
        inner.cancel.cancel();
        if let Some(token) = inner.state().conn_cancel.take() {
            token.cancel();
        }

        if inner.subscribe_logs {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let api = inner.api.clone();
                let client_id = inner.state().client_id.clone();
                handle.spawn(async move {
                    let _ = api.set_terminal_subscription(&client_id, false).await;
                });
            }
        }
    }

    // ---- prompt operations ----

    /// Submit a workflow. `position = None` appends, `Some(-1)` jumps
    /// to the front of the backend queue.
    ///
    /// A backend rejection emits a `queue_error` event before the
    /// error is returned.
    pub async fn queue_prompt(
        &self,
        position: Option<i64>,
        workflow: &Value,
    ) -> Result<QueuePromptResponse, ClientError> {
        self.ensure_alive()?;
        let client_id = self.client_id();
        match self
            .inner
            .api
            .queue_prompt(position, workflow, &client_id)
            .await
        {
            Ok(response) => Ok(response),
            Err(ApiError::Api { status, body }) => {
                self.inner.emit(ClientEvent::QueueError {
                    status,
                    body: body.clone(),
                });
                Err(ClientError::Api(ApiError::Api { status, body }))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Best-effort cancel of the currently executing prompt.
    pub async fn interrupt(&self) -> Result<(), ClientError> {
        self.ensure_alive()?;
        Ok(self.inner.api.interrupt().await?)
    }

    /// Ask the backend to release models and/or memory.
    pub async fn free_memory(
        &self,
        unload_models: bool,
        free_memory: bool,
    ) -> Result<bool, ClientError> {
        self.ensure_alive()?;
        Ok(self.inner.api.free_memory(unload_models, free_memory).await?)
    }

    // ---- typed HTTP accessors ----

    pub async fn get_queue_status(&self) -> Result<QueueStatus, ClientError> {
        self.ensure_alive()?;
        Ok(self.inner.api.get_queue_status().await?)
    }

    pub async fn get_queue(&self) -> Result<QueueInfo, ClientError> {
        self.ensure_alive()?;
        Ok(self.inner.api.get_queue().await?)
    }

    pub async fn get_histories(&self, max_items: Option<u32>) -> Result<Value, ClientError> {
        self.ensure_alive()?;
        Ok(self.inner.api.get_histories(max_items).await?)
    }

    pub async fn get_history(&self, prompt_id: &str) -> Result<Option<Value>, ClientError> {
        self.ensure_alive()?;
        Ok(self.inner.api.get_history(prompt_id).await?)
    }

    pub async fn get_system_stats(&self) -> Result<SystemStats, ClientError> {
        self.ensure_alive()?;
        Ok(self.inner.api.get_system_stats().await?)
    }

    pub async fn get_node_defs(&self, node: Option<&str>) -> Result<Value, ClientError> {
        self.ensure_alive()?;
        Ok(self.inner.api.get_node_defs(node).await?)
    }

    pub async fn get_checkpoints(&self) -> Result<Vec<String>, ClientError> {
        self.ensure_alive()?;
        Ok(self.inner.api.get_checkpoints().await?)
    }

    pub async fn get_loras(&self) -> Result<Vec<String>, ClientError> {
        self.ensure_alive()?;
        Ok(self.inner.api.get_loras().await?)
    }

    pub async fn get_embeddings(&self) -> Result<Vec<String>, ClientError> {
        self.ensure_alive()?;
        Ok(self.inner.api.get_embeddings().await?)
    }

    pub async fn get_sampler_info(&self) -> Result<SamplerInfo, ClientError> {
        self.ensure_alive()?;
        Ok(self.inner.api.get_sampler_info().await?)
    }

    pub async fn get_terminal_logs(&self) -> Result<RawLogs, ClientError> {
        self.ensure_alive()?;
        Ok(self.inner.api.get_terminal_logs().await?)
    }

    // ---- uploads & artifacts ----

    pub async fn upload_image(
        &self,
        bytes: Vec<u8>,
        filename: &str,
        options: &UploadOptions,
    ) -> Result<Uploaded, ClientError> {
        self.ensure_alive()?;
        Ok(self.inner.api.upload_image(bytes, filename, options).await?)
    }

    pub async fn upload_mask(
        &self,
        bytes: Vec<u8>,
        filename: &str,
        original: &ImageRef,
    ) -> Result<Uploaded, ClientError> {
        self.ensure_alive()?;
        Ok(self.inner.api.upload_mask(bytes, filename, original).await?)
    }

    /// Artifact URL against this client's host. Pure construction.
    pub fn get_path_image(&self, info: &ImageRef) -> String {
        self.inner.api.view_url(info)
    }

    /// Fetch an artifact as bytes, applying credentials.
    pub async fn get_image(&self, info: &ImageRef) -> Result<Vec<u8>, ClientError> {
        self.ensure_alive()?;
        Ok(self.inner.api.get_image(info).await?)
    }

    // ---- internals ----

    fn ensure_alive(&self) -> Result<(), ClientError> {
        if self.inner.destroyed.load(Ordering::Acquire) {
            Err(ClientError::Destroyed)
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for ComfyUIClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComfyUIClient")
            .field("id", &self.inner.id)
            .field("host", &self.inner.host)
            .field("ready", &self.is_ready())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

/// Derive a stable id from the host when none is assigned.
fn host_derived_id(host: &str) -> String {
    host.trim_start_matches("https://")
        .trim_start_matches("http://")
        .to_string()
}

/// Derive the WebSocket base URL: the scheme mirrors `host`.
fn ws_base_for(host: &str) -> String {
    if let Some(rest) = host.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = host.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        format!("ws://{host}")
    }
}

// ---------------------------------------------------------------------------
// Connection task
// ---------------------------------------------------------------------------

/// Core channel loop: first open (with polling fallback) → process →
/// reconnect ladder. Runs until destroy or ladder exhaustion.
async fn run_channel(inner: Arc<ClientInner>) {
    // First open. A synchronous failure here routes through the
    // HTTP-polling fallback until the channel comes up.
    let first = match open_socket(&inner).await {
        Ok(ws) => Some(ws),
        Err(e) => {
            tracing::warn!(
                client = %inner.id,
                error = %e,
                "Streaming channel failed to open, starting polling fallback",
            );
            poll_until_open(&inner).await
        }
    };

    let Some(ws) = first else {
        return; // destroyed while polling
    };

    tracing::info!(client = %inner.id, "Streaming channel connected");
    inner.emit(ClientEvent::Connected);
    process_socket(&inner, ws).await;
    inner.emit(ClientEvent::Disconnected);

    // Reconnect ladder. Each pass through the outer loop is a fresh
    // ladder after a successful reconnect.
    'connected: loop {
        if inner.cancel.is_cancelled() {
            return;
        }

        for attempt in 1..=inner.reconnect.max_attempts {
            let delay = next_delay(attempt, &inner.reconnect);
            tracing::info!(
                client = %inner.id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting streaming channel",
            );

            tokio::select! {
                _ = inner.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            match open_socket(&inner).await {
                Ok(ws) => {
                    tracing::info!(client = %inner.id, attempt, "Streaming channel reconnected");
                    inner.emit(ClientEvent::Reconnected);
                    process_socket(&inner, ws).await;
                    inner.emit(ClientEvent::Disconnected);
                    continue 'connected;
                }
                Err(e) => {
                    tracing::warn!(
                        client = %inner.id,
                        attempt,
                        error = %e,
                        "Reconnect attempt failed",
                    );
                }
            }
        }

        // Ladder exhausted: exactly one terminal event; the client
        // stays usable over HTTP.
        inner.state().reconnect_exhausted = true;
        tracing::error!(
            client = %inner.id,
            attempts = inner.reconnect.max_attempts,
            "Streaming channel reconnection failed",
        );
        inner.emit(ClientEvent::ReconnectionFailed);
        return;
    }
}

/// HTTP-polling fallback: poll the status endpoint every
/// [`POLL_INTERVAL`], emit synthetic `status` events, and retry the
/// channel on every tick. Returns the socket once one opens, or `None`
/// when the client is destroyed first.
async fn poll_until_open(inner: &Arc<ClientInner>) -> Option<WsStream> {
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => return None,
            _ = ticker.tick() => {
                if let Ok(status) = inner.api.get_queue_status().await {
                    inner.emit(ClientEvent::Status {
                        queue_remaining: status.exec_info.queue_remaining,
                    });
                }
                match open_socket(inner).await {
                    Ok(ws) => {
                        tracing::info!(client = %inner.id, "Streaming channel opened, polling stopped");
                        return Some(ws);
                    }
                    Err(e) => {
                        tracing::debug!(client = %inner.id, error = %e, "Channel still unavailable");
                    }
                }
            }
        }
    }
}

/// Open the WebSocket, applying credentials to the handshake.
async fn open_socket(
    inner: &Arc<ClientInner>,
) -> Result<WsStream, tokio_tungstenite::tungstenite::Error> {
    let client_id = inner.state().client_id.clone();
    let url = format!("{}/ws?clientId={}", inner.ws_base, client_id);

    let mut request = url.into_client_request()?;
    for (name, value) in inner.credentials.header_pairs() {
        let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        let Ok(header_value) = HeaderValue::from_str(&value) else {
            continue;
        };
        request.headers_mut().insert(header_name, header_value);
    }

    let (ws_stream, _response) = connect_async(request).await?;
    Ok(ws_stream)
}

/// Read frames until the socket closes, errors, or is force-closed.
///
/// Dropping the stream on exit terminates the connection abortively,
/// which is what the reconnect path wants.
async fn process_socket(inner: &Arc<ClientInner>, mut ws_stream: WsStream) {
    let conn_cancel = inner.cancel.child_token();
    {
        let mut state = inner.state();
        state.conn_cancel = Some(conn_cancel.clone());
        state.channel_up = true;
    }
    inner.activity.touch();

    loop {
        tokio::select! {
            _ = conn_cancel.cancelled() => {
                tracing::debug!(client = %inner.id, "Streaming channel force-closed");
                break;
            }
            frame = ws_stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    inner.activity.touch();
                    handle_text_frame(inner, &text);
                }
                Some(Ok(Message::Binary(bytes))) => {
                    inner.activity.touch();
                    handle_binary_frame(inner, &bytes);
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                    // Handled automatically by tungstenite.
                    inner.activity.touch();
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!(client = %inner.id, ?frame, "Streaming channel closed");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::error!(client = %inner.id, error = %e, "Streaming channel receive error");
                    break;
                }
                None => {
                    tracing::info!(client = %inner.id, "Streaming channel exhausted");
                    break;
                }
            }
        }
    }

    let mut state = inner.state();
    state.channel_up = false;
    state.conn_cancel = None;
}

/// Parse a text frame, rebind the session id when the server assigns
/// one, and fan the message out.
fn handle_text_frame(inner: &Arc<ClientInner>, text: &str) {
    match messages::parse_text_frame(text) {
        Ok(frame) => {
            if let Some(sid) = frame.sid {
                let mut state = inner.state();
                if state.client_id != sid {
                    tracing::debug!(client = %inner.id, sid = %sid, "Session id rebound by server");
                    state.client_id = sid;
                }
            }

            match frame.message {
                Some(message) => {
                    if let Some(event) = client_event_for(message) {
                        inner.emit(event);
                    }
                }
                None => {
                    tracing::debug!(client = %inner.id, kind = %frame.kind, "Unmodeled message kind");
                    inner.emit(ClientEvent::Unknown {
                        kind: frame.kind,
                        data: frame.data,
                    });
                }
            }
        }
        Err(e) => {
            tracing::warn!(
                client = %inner.id,
                error = %e,
                raw_message = %text,
                "Failed to parse streamed message",
            );
        }
    }
}

/// Decode a binary frame. Unknown event types are logged and
/// discarded; they never abort the channel.
fn handle_binary_frame(inner: &Arc<ClientInner>, bytes: &[u8]) {
    match messages::parse_binary_frame(bytes) {
        Ok(BinaryEvent::Preview { format, data }) => {
            inner.emit(ClientEvent::Preview { format, data });
        }
        Ok(BinaryEvent::Unknown { event_type }) => {
            tracing::debug!(client = %inner.id, event_type, "Unknown binary event discarded");
        }
        Err(e) => {
            tracing::warn!(client = %inner.id, error = %e, "Malformed binary frame");
        }
    }
}

/// Map a parsed message onto the client event union. `logs` frames
/// carry only their first entry, per the terminal contract; an empty
/// frame maps to nothing.
fn client_event_for(message: ComfyUIMessage) -> Option<ClientEvent> {
    let event = match message {
        ComfyUIMessage::Status(data) => ClientEvent::Status {
            queue_remaining: data.status.exec_info.queue_remaining,
        },
        ComfyUIMessage::ExecutionStart(data) => ClientEvent::ExecutionStart(data),
        ComfyUIMessage::ExecutionCached(data) => ClientEvent::ExecutionCached(data),
        ComfyUIMessage::Executing(data) => ClientEvent::Executing(data),
        ComfyUIMessage::Progress(data) => ClientEvent::Progress(data),
        ComfyUIMessage::Executed(data) => ClientEvent::Executed(data),
        ComfyUIMessage::ExecutionSuccess(data) => ClientEvent::ExecutionSuccess(data),
        ComfyUIMessage::ExecutionError(data) => ClientEvent::ExecutionError(data),
        ComfyUIMessage::ExecutionInterrupted(data) => ClientEvent::ExecutionInterrupted(data),
        ComfyUIMessage::Logs(data) => {
            let entry = data.entries.into_iter().next()?;
            ClientEvent::Terminal(entry)
        }
    };
    Some(event)
}

// ---------------------------------------------------------------------------
// Liveness watchdog
// ---------------------------------------------------------------------------

/// Fires every `ws_timeout / 2`; when the backend has been silent for
/// longer than `ws_timeout`, force-close the current socket so the
/// reconnect ladder takes over.
async fn run_watchdog(inner: Arc<ClientInner>) {
    let period = (inner.ws_timeout / 2).max(Duration::from_millis(100));
    let mut ticker = tokio::time::interval(period);

    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => return,
            _ = ticker.tick() => {
                let idle = inner.activity.idle();
                if idle <= inner.ws_timeout {
                    continue;
                }

                let state = inner.state();
                if state.reconnect_exhausted || !state.channel_up {
                    continue;
                }
                if let Some(token) = &state.conn_cancel {
                    tracing::warn!(
                        client = %inner.id,
                        idle_ms = idle.as_millis() as u64,
                        "Liveness timeout, forcing reconnect",
                    );
                    token.cancel();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_base_mirrors_scheme() {
        assert_eq!(ws_base_for("http://host:8188"), "ws://host:8188");
        assert_eq!(ws_base_for("https://host"), "wss://host");
        assert_eq!(ws_base_for("host:8188"), "ws://host:8188");
    }

    #[test]
    fn id_is_host_derived_by_default() {
        let client = ComfyUIClient::new("http://gpu-1:8188", Credentials::None).unwrap();
        assert_eq!(client.id(), "gpu-1:8188");
    }

    #[test]
    fn explicit_id_wins() {
        let client = ComfyUIClient::with_options(
            "http://gpu-1:8188",
            Credentials::None,
            ClientOptions {
                id: Some("fast-box".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(client.id(), "fast-box");
    }

    #[tokio::test]
    async fn destroy_is_idempotent_and_blocks_operations() {
        let client = ComfyUIClient::new("http://gpu-1:8188", Credentials::None).unwrap();
        client.destroy();
        client.destroy();
        assert!(client.is_destroyed());
        assert!(matches!(
            client.get_queue().await,
            Err(ClientError::Destroyed)
        ));
        assert!(matches!(
            client.init(1, Duration::from_millis(1)).await,
            Err(ClientError::Destroyed)
        ));
    }

    #[test]
    fn logs_event_carries_first_entry_only() {
        let message = ComfyUIMessage::Logs(messages::LogsData {
            entries: vec![
                messages::LogEntry {
                    t: "t0".into(),
                    m: "first".into(),
                },
                messages::LogEntry {
                    t: "t1".into(),
                    m: "second".into(),
                },
            ],
        });
        match client_event_for(message) {
            Some(ClientEvent::Terminal(entry)) => assert_eq!(entry.m, "first"),
            other => panic!("Expected Terminal, got {other:?}"),
        }
    }

    #[test]
    fn empty_logs_event_maps_to_nothing() {
        let message = ComfyUIMessage::Logs(messages::LogsData { entries: vec![] });
        assert!(client_event_for(message).is_none());
    }
}
