//! REST client for the ComfyUI HTTP endpoints.
//!
//! Wraps the full ComfyUI HTTP API (workflow submission, queue and
//! history retrieval, node definitions, uploads, artifact fetch,
//! interrupt/free, user data, settings, terminal logs, experimental
//! model browsing) using [`reqwest`]. Every successful response
//! refreshes the shared [`ActivityTracker`] so the liveness watchdog
//! sees HTTP traffic as activity.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::Value;

use crate::auth::{AuthError, Credentials};
use crate::messages::{LogEntry, QueueStatus};

/// Node definition consulted for checkpoint names.
const CHECKPOINT_LOADER_NODE: &str = "CheckpointLoaderSimple";
/// Node definition consulted for LoRA names.
const LORA_LOADER_NODE: &str = "LoraLoader";
/// Node definition consulted for sampler and scheduler names.
const SAMPLER_NODE: &str = "KSampler";

// ---------------------------------------------------------------------------
// Activity tracking
// ---------------------------------------------------------------------------

/// Monotonic record of the most recent backend activity.
///
/// Refreshed on every received streaming frame and every successful
/// HTTP response. Lock-free: stores milliseconds since construction
/// and only ever moves forward.
#[derive(Debug)]
pub struct ActivityTracker {
    origin: Instant,
    last_ms: AtomicU64,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    /// Record activity now.
    pub fn touch(&self) {
        let now_ms = self.origin.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(now_ms, Ordering::Relaxed);
    }

    /// Time since the last recorded activity.
    pub fn idle(&self) -> Duration {
        let now_ms = self.origin.elapsed().as_millis() as u64;
        let last = self.last_ms.load(Ordering::Relaxed);
        Duration::from_millis(now_ms.saturating_sub(last))
    }

    /// Milliseconds of recorded activity since construction.
    /// Non-decreasing across any sequence of `touch` calls.
    pub fn last_activity_ms(&self) -> u64 {
        self.last_ms.load(Ordering::Relaxed)
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

/// Operating system family reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OsType {
    Posix,
    Nt,
    #[default]
    Unknown,
}

impl OsType {
    /// Parse the `system.os` field of `/system_stats`.
    pub fn from_os_str(os: &str) -> Self {
        match os.to_ascii_lowercase().as_str() {
            "posix" => OsType::Posix,
            "nt" => OsType::Nt,
            _ => OsType::Unknown,
        }
    }
}

/// Response returned by `POST /prompt` after successfully queuing a
/// workflow.
#[derive(Debug, Clone, Deserialize)]
pub struct QueuePromptResponse {
    /// Server-assigned identifier for the queued prompt.
    pub prompt_id: String,
    /// Position in the execution queue.
    pub number: i64,
    /// Per-node validation errors, when the server reports any.
    #[serde(default)]
    pub node_errors: Option<Value>,
}

/// Response of `GET /queue`.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueInfo {
    #[serde(default)]
    pub queue_running: Vec<Value>,
    #[serde(default)]
    pub queue_pending: Vec<Value>,
}

/// Response of `GET /system_stats`.
#[derive(Debug, Clone, Deserialize)]
pub struct SystemStats {
    pub system: SystemInfo,
    #[serde(default)]
    pub devices: Vec<Value>,
}

/// The `system` block of `/system_stats`.
#[derive(Debug, Clone, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    #[serde(default)]
    pub comfyui_version: Option<String>,
    #[serde(default)]
    pub python_version: Option<String>,
}

impl SystemStats {
    /// The backend's OS family.
    pub fn os_type(&self) -> OsType {
        OsType::from_os_str(&self.system.os)
    }
}

/// Sampler and scheduler names advertised by the KSampler node.
#[derive(Debug, Clone, Default)]
pub struct SamplerInfo {
    pub samplers: Vec<String>,
    pub schedulers: Vec<String>,
}

/// A reference to an image stored on the backend.
///
/// Produced by the upload endpoints (which call the field `name`) and
/// consumed by `/view` (which calls it `filename`).
#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct ImageRef {
    #[serde(alias = "name")]
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "default_image_kind")]
    pub kind: String,
}

fn default_image_kind() -> String {
    "input".to_string()
}

/// Result of a successful upload.
#[derive(Debug, Clone)]
pub struct Uploaded {
    pub info: ImageRef,
    pub view_url: String,
}

/// Options for image uploads.
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    pub subfolder: Option<String>,
    pub overwrite: bool,
}

/// Response of `GET /internal/logs/raw`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawLogs {
    #[serde(default)]
    pub entries: Vec<LogEntry>,
    #[serde(default)]
    pub size: Option<TerminalSize>,
}

/// Terminal dimensions reported with raw logs.
#[derive(Debug, Clone, Deserialize)]
pub struct TerminalSize {
    pub cols: u32,
    pub rows: u32,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from the REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The backend returned a non-2xx status code.
    #[error("Backend API error ({status}): {body}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// The backend rejected our credentials.
    #[error("Authentication rejected (HTTP {status})")]
    Auth { status: u16 },

    /// The configured host is not a valid URL.
    #[error("Invalid backend host: {0}")]
    InvalidHost(String),

    /// Credentials could not be rendered as HTTP headers.
    #[error(transparent)]
    InvalidCredentials(#[from] AuthError),
}

// ---------------------------------------------------------------------------
// ComfyUIApi
// ---------------------------------------------------------------------------

/// HTTP client for a single ComfyUI backend.
#[derive(Clone)]
pub struct ComfyUIApi {
    client: reqwest::Client,
    base: reqwest::Url,
    host: String,
    activity: std::sync::Arc<ActivityTracker>,
}

impl ComfyUIApi {
    /// Create a new API client.
    ///
    /// * `host`        - Base HTTP URL, e.g. `http://host:8188`.
    /// * `credentials` - Applied to every request as default headers.
    pub fn new(host: impl Into<String>, credentials: &Credentials) -> Result<Self, ApiError> {
        let host = host.into().trim_end_matches('/').to_string();
        let base =
            reqwest::Url::parse(&host).map_err(|e| ApiError::InvalidHost(format!("{host}: {e}")))?;

        let client = reqwest::Client::builder()
            .default_headers(credentials.header_map()?)
            .build()?;

        Ok(Self {
            client,
            base,
            host,
            activity: std::sync::Arc::new(ActivityTracker::new()),
        })
    }

    /// Base HTTP URL (no trailing slash).
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The shared activity tracker, for the liveness watchdog.
    pub fn activity(&self) -> std::sync::Arc<ActivityTracker> {
        std::sync::Arc::clone(&self.activity)
    }

    // ---- queue & prompts ----

    /// Liveness probe: `GET /prompt` returns the queue status.
    pub async fn get_queue_status(&self) -> Result<QueueStatus, ApiError> {
        let response = self
            .client
            .get(format!("{}/prompt", self.host))
            .send()
            .await?;
        self.parse_response(response).await
    }

    /// Submit a workflow for execution (`POST /prompt`).
    ///
    /// `position = None` appends to the queue, `Some(-1)` jumps to the
    /// front, any other non-zero value requests that numeric position.
    pub async fn queue_prompt(
        &self,
        position: Option<i64>,
        workflow: &Value,
        client_id: &str,
    ) -> Result<QueuePromptResponse, ApiError> {
        let mut body = serde_json::json!({
            "client_id": client_id,
            "prompt": workflow,
        });
        match position {
            Some(-1) => body["front"] = Value::Bool(true),
            Some(n) if n != 0 => body["number"] = serde_json::json!(n),
            _ => {}
        }

        let response = self
            .client
            .post(format!("{}/prompt", self.host))
            .json(&body)
            .send()
            .await?;
        self.parse_response(response).await
    }

    /// Current queue contents (`GET /queue`).
    pub async fn get_queue(&self) -> Result<QueueInfo, ApiError> {
        let response = self
            .client
            .get(format!("{}/queue", self.host))
            .send()
            .await?;
        self.parse_response(response).await
    }

    /// Execution history, newest first (`GET /history?max_items=N`).
    ///
    /// The result is a map keyed by prompt id.
    pub async fn get_histories(&self, max_items: Option<u32>) -> Result<Value, ApiError> {
        let mut url = format!("{}/history", self.host);
        if let Some(n) = max_items {
            url.push_str(&format!("?max_items={n}"));
        }
        let response = self.client.get(url).send().await?;
        self.parse_response(response).await
    }

    /// History entry for a specific prompt (`GET /history/{id}`).
    ///
    /// Returns `None` when the backend has no record of the prompt.
    pub async fn get_history(&self, prompt_id: &str) -> Result<Option<Value>, ApiError> {
        let response = self
            .client
            .get(format!("{}/history/{}", self.host, prompt_id))
            .send()
            .await?;
        let blob: Value = self.parse_response(response).await?;
        Ok(blob.get(prompt_id).cloned())
    }

    /// Interrupt the currently executing prompt (`POST /interrupt`).
    pub async fn interrupt(&self) -> Result<(), ApiError> {
        let response = self
            .client
            .post(format!("{}/interrupt", self.host))
            .send()
            .await?;
        self.check_status(response).await
    }

    /// Ask the backend to release resources (`POST /free`).
    ///
    /// Returns `true` when the backend accepted the request.
    pub async fn free_memory(
        &self,
        unload_models: bool,
        free_memory: bool,
    ) -> Result<bool, ApiError> {
        let body = serde_json::json!({
            "unload_models": unload_models,
            "free_memory": free_memory,
        });
        let response = self
            .client
            .post(format!("{}/free", self.host))
            .json(&body)
            .send()
            .await?;

        match self.check_status(response).await {
            Ok(()) => Ok(true),
            Err(ApiError::Api { status, .. }) => {
                tracing::warn!(status, "Backend declined free-memory request");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    // ---- node definitions & model enumeration ----

    /// System information (`GET /system_stats`).
    pub async fn get_system_stats(&self) -> Result<SystemStats, ApiError> {
        let response = self
            .client
            .get(format!("{}/system_stats", self.host))
            .send()
            .await?;
        self.parse_response(response).await
    }

    /// Node definitions (`GET /object_info[/{node}]`).
    pub async fn get_node_defs(&self, node: Option<&str>) -> Result<Value, ApiError> {
        let url = match node {
            Some(name) => format!("{}/object_info/{}", self.host, name),
            None => format!("{}/object_info", self.host),
        };
        let response = self.client.get(url).send().await?;
        self.parse_response(response).await
    }

    /// Checkpoint names known to the backend.
    ///
    /// Extracted from the checkpoint-loader node definition; an absent
    /// node yields an empty list, never an error.
    pub async fn get_checkpoints(&self) -> Result<Vec<String>, ApiError> {
        let defs = self.get_node_defs(Some(CHECKPOINT_LOADER_NODE)).await?;
        Ok(enum_slot(&defs, CHECKPOINT_LOADER_NODE, "ckpt_name"))
    }

    /// LoRA names known to the backend.
    pub async fn get_loras(&self) -> Result<Vec<String>, ApiError> {
        let defs = self.get_node_defs(Some(LORA_LOADER_NODE)).await?;
        Ok(enum_slot(&defs, LORA_LOADER_NODE, "lora_name"))
    }

    /// Sampler and scheduler names advertised by the KSampler node.
    pub async fn get_sampler_info(&self) -> Result<SamplerInfo, ApiError> {
        let defs = self.get_node_defs(Some(SAMPLER_NODE)).await?;
        Ok(SamplerInfo {
            samplers: enum_slot(&defs, SAMPLER_NODE, "sampler_name"),
            schedulers: enum_slot(&defs, SAMPLER_NODE, "scheduler"),
        })
    }

    /// Embedding names (`GET /embeddings`).
    pub async fn get_embeddings(&self) -> Result<Vec<String>, ApiError> {
        let response = self
            .client
            .get(format!("{}/embeddings", self.host))
            .send()
            .await?;
        self.parse_response(response).await
    }

    /// Installed extension script paths (`GET /extensions`).
    pub async fn get_extensions(&self) -> Result<Vec<String>, ApiError> {
        let response = self
            .client
            .get(format!("{}/extensions", self.host))
            .send()
            .await?;
        self.parse_response(response).await
    }

    // ---- uploads & artifacts ----

    /// Upload an image (`POST /upload/image`).
    pub async fn upload_image(
        &self,
        bytes: Vec<u8>,
        filename: &str,
        options: &UploadOptions,
    ) -> Result<Uploaded, ApiError> {
        let part = reqwest::multipart::Part::bytes(bytes).file_name(filename.to_string());
        let mut form = reqwest::multipart::Form::new()
            .part("image", part)
            .text("overwrite", if options.overwrite { "true" } else { "false" });
        if let Some(subfolder) = &options.subfolder {
            form = form.text("subfolder", subfolder.clone());
        }

        let response = self
            .client
            .post(format!("{}/upload/image", self.host))
            .multipart(form)
            .send()
            .await?;
        let info: ImageRef = self.parse_response(response).await?;
        let view_url = self.view_url(&info);
        Ok(Uploaded { info, view_url })
    }

    /// Upload a mask for a previously uploaded image
    /// (`POST /upload/mask`).
    pub async fn upload_mask(
        &self,
        bytes: Vec<u8>,
        filename: &str,
        original: &ImageRef,
    ) -> Result<Uploaded, ApiError> {
        let original_ref = serde_json::json!({
            "filename": original.filename,
            "subfolder": original.subfolder,
            "type": original.kind,
        });

        let part = reqwest::multipart::Part::bytes(bytes).file_name(filename.to_string());
        let form = reqwest::multipart::Form::new()
            .part("image", part)
            .text("original_ref", original_ref.to_string());

        let response = self
            .client
            .post(format!("{}/upload/mask", self.host))
            .multipart(form)
            .send()
            .await?;
        let info: ImageRef = self.parse_response(response).await?;
        let view_url = self.view_url(&info);
        Ok(Uploaded { info, view_url })
    }

    /// URL of a stored artifact (`GET /view`). Pure construction, no
    /// network traffic.
    pub fn view_url(&self, info: &ImageRef) -> String {
        let mut url = self.base.clone();
        url.set_path("/view");
        url.query_pairs_mut()
            .append_pair("filename", &info.filename)
            .append_pair("type", &info.kind)
            .append_pair("subfolder", &info.subfolder);
        url.to_string()
    }

    /// Fetch an artifact as bytes, applying credentials.
    pub async fn get_image(&self, info: &ImageRef) -> Result<Vec<u8>, ApiError> {
        let response = self.client.get(self.view_url(info)).send().await?;
        let response = self.ensure_success(response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    // ---- users, settings, user data ----

    /// User configuration (`GET /users`).
    pub async fn get_users(&self) -> Result<Value, ApiError> {
        let response = self
            .client
            .get(format!("{}/users", self.host))
            .send()
            .await?;
        self.parse_response(response).await
    }

    /// Create a user (`POST /users`).
    pub async fn create_user(&self, username: &str) -> Result<Value, ApiError> {
        let response = self
            .client
            .post(format!("{}/users", self.host))
            .json(&serde_json::json!({ "username": username }))
            .send()
            .await?;
        self.parse_response(response).await
    }

    /// All settings (`GET /settings`).
    pub async fn get_settings(&self) -> Result<Value, ApiError> {
        let response = self
            .client
            .get(format!("{}/settings", self.host))
            .send()
            .await?;
        self.parse_response(response).await
    }

    /// One setting (`GET /settings/{id}`).
    pub async fn get_setting(&self, id: &str) -> Result<Value, ApiError> {
        let response = self
            .client
            .get(format!("{}/settings/{}", self.host, id))
            .send()
            .await?;
        self.parse_response(response).await
    }

    /// Store one setting (`POST /settings/{id}`).
    pub async fn store_setting(&self, id: &str, value: &Value) -> Result<(), ApiError> {
        let response = self
            .client
            .post(format!("{}/settings/{}", self.host, id))
            .json(value)
            .send()
            .await?;
        self.check_status(response).await
    }

    /// Store several settings at once (`POST /settings`).
    pub async fn store_settings(&self, settings: &HashMap<String, Value>) -> Result<(), ApiError> {
        let response = self
            .client
            .post(format!("{}/settings", self.host))
            .json(settings)
            .send()
            .await?;
        self.check_status(response).await
    }

    /// Read a user data file (`GET /userdata/{file}`).
    ///
    /// Returns `None` when the file does not exist.
    pub async fn get_user_data(&self, file: &str) -> Result<Option<Vec<u8>>, ApiError> {
        let response = self
            .client
            .get(self.userdata_url(file, &[]))
            .send()
            .await?;
        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        let response = self.ensure_success(response).await?;
        Ok(Some(response.bytes().await?.to_vec()))
    }

    /// Write a user data file (`POST /userdata/{file}`).
    pub async fn store_user_data(
        &self,
        file: &str,
        bytes: Vec<u8>,
        overwrite: bool,
    ) -> Result<(), ApiError> {
        let overwrite = overwrite.to_string();
        let response = self
            .client
            .post(self.userdata_url(file, &[("overwrite", &overwrite)]))
            .body(bytes)
            .send()
            .await?;
        self.check_status(response).await
    }

    /// Delete a user data file (`DELETE /userdata/{file}`).
    pub async fn delete_user_data(&self, file: &str) -> Result<(), ApiError> {
        let response = self
            .client
            .delete(self.userdata_url(file, &[]))
            .send()
            .await?;
        self.check_status(response).await
    }

    /// Move or rename a user data file
    /// (`POST /userdata/{src}/move/{dest}`).
    pub async fn move_user_data(
        &self,
        source: &str,
        dest: &str,
        overwrite: bool,
    ) -> Result<(), ApiError> {
        let mut url = self.base.clone();
        url.set_path(&format!("/userdata/{source}/move/{dest}"));
        url.query_pairs_mut()
            .append_pair("overwrite", &overwrite.to_string());
        let response = self.client.post(url.to_string()).send().await?;
        self.check_status(response).await
    }

    /// List user data files (`GET /userdata?dir=…`).
    pub async fn list_user_data(
        &self,
        dir: &str,
        recurse: bool,
        split: bool,
    ) -> Result<Value, ApiError> {
        let mut url = self.base.clone();
        url.set_path("/userdata");
        url.query_pairs_mut()
            .append_pair("dir", dir)
            .append_pair("recurse", &recurse.to_string())
            .append_pair("split", &split.to_string());
        let response = self.client.get(url.to_string()).send().await?;
        self.parse_response(response).await
    }

    // ---- terminal logs ----

    /// Pull buffered terminal output (`GET /internal/logs/raw`).
    pub async fn get_terminal_logs(&self) -> Result<RawLogs, ApiError> {
        let response = self
            .client
            .get(format!("{}/internal/logs/raw", self.host))
            .send()
            .await?;
        self.parse_response(response).await
    }

    /// Toggle streamed terminal logs for this client
    /// (`PATCH /internal/logs/subscribe`).
    pub async fn set_terminal_subscription(
        &self,
        client_id: &str,
        enabled: bool,
    ) -> Result<(), ApiError> {
        let body = serde_json::json!({
            "enabled": enabled,
            "clientId": client_id,
        });
        let response = self
            .client
            .patch(format!("{}/internal/logs/subscribe", self.host))
            .json(&body)
            .send()
            .await?;
        self.check_status(response).await
    }

    // ---- experimental model browsing ----

    /// Model folder listing (`GET /experiment/models`).
    pub async fn get_model_folders(&self) -> Result<Value, ApiError> {
        let response = self
            .client
            .get(format!("{}/experiment/models", self.host))
            .send()
            .await?;
        self.parse_response(response).await
    }

    /// Files within a model folder (`GET /experiment/models/{folder}`).
    pub async fn get_model_files(&self, folder: &str) -> Result<Value, ApiError> {
        let response = self
            .client
            .get(format!("{}/experiment/models/{}", self.host, folder))
            .send()
            .await?;
        self.parse_response(response).await
    }

    /// Preview URL for a model file. Pure construction.
    pub fn model_preview_url(&self, folder: &str, path_index: u32, filename: &str) -> String {
        format!(
            "{}/experiment/models/{}/preview/{}/{}",
            self.host, folder, path_index, filename
        )
    }

    // ---- private helpers ----

    fn userdata_url(&self, file: &str, query: &[(&str, &str)]) -> String {
        let mut url = self.base.clone();
        url.set_path(&format!("/userdata/{file}"));
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in query {
                pairs.append_pair(k, v);
            }
        }
        url.to_string()
    }

    /// Ensure the response has a success status code and record the
    /// activity. 401 is surfaced as [`ApiError::Auth`] so callers can
    /// distinguish credential failures from other rejections.
    async fn ensure_success(
        &self,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if status.as_u16() == 401 {
            return Err(ApiError::Auth {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ApiError::Api {
                status: status.as_u16(),
                body,
            });
        }
        self.activity.touch();
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, ApiError> {
        let response = self.ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }

    /// Assert the response has a success status code, discarding the body.
    async fn check_status(&self, response: reqwest::Response) -> Result<(), ApiError> {
        self.ensure_success(response).await?;
        Ok(())
    }
}

/// Extract the enum slot `input.required.{field}[0]` from a node
/// definition blob. Absent nodes or fields yield an empty list.
fn enum_slot(defs: &Value, node: &str, field: &str) -> Vec<String> {
    defs.get(node)
        .and_then(|n| n.pointer(&format!("/input/required/{field}/0")))
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn api() -> ComfyUIApi {
        ComfyUIApi::new("http://localhost:8188", &Credentials::None).unwrap()
    }

    #[test]
    fn host_is_normalised_without_trailing_slash() {
        let api = ComfyUIApi::new("http://localhost:8188/", &Credentials::None).unwrap();
        assert_eq!(api.host(), "http://localhost:8188");
    }

    #[test]
    fn invalid_host_is_rejected() {
        assert!(matches!(
            ComfyUIApi::new("not a url", &Credentials::None),
            Err(ApiError::InvalidHost(_))
        ));
    }

    #[test]
    fn view_url_encodes_query_parameters() {
        let info = ImageRef {
            filename: "out put.png".into(),
            subfolder: "sub/dir".into(),
            kind: "output".into(),
        };
        let url = api().view_url(&info);
        assert!(url.starts_with("http://localhost:8188/view?"));
        assert!(url.contains("filename=out+put.png") || url.contains("filename=out%20put.png"));
        assert!(url.contains("type=output"));
    }

    #[test]
    fn model_preview_url_layout() {
        assert_eq!(
            api().model_preview_url("checkpoints", 0, "v1.safetensors"),
            "http://localhost:8188/experiment/models/checkpoints/preview/0/v1.safetensors"
        );
    }

    #[test]
    fn image_ref_accepts_upload_response_shape() {
        let info: ImageRef =
            serde_json::from_value(json!({"name": "img.png", "subfolder": "", "type": "input"}))
                .unwrap();
        assert_eq!(info.filename, "img.png");
        assert_eq!(info.kind, "input");
    }

    #[test]
    fn enum_slot_extracts_checkpoint_names() {
        let defs = json!({
            "CheckpointLoaderSimple": {
                "input": { "required": { "ckpt_name": [["a.safetensors", "b.safetensors"], {}] } }
            }
        });
        assert_eq!(
            enum_slot(&defs, "CheckpointLoaderSimple", "ckpt_name"),
            vec!["a.safetensors", "b.safetensors"]
        );
    }

    #[test]
    fn enum_slot_absent_node_yields_empty() {
        assert!(enum_slot(&json!({}), "LoraLoader", "lora_name").is_empty());
    }

    #[test]
    fn os_type_parse() {
        assert_eq!(OsType::from_os_str("posix"), OsType::Posix);
        assert_eq!(OsType::from_os_str("NT"), OsType::Nt);
        assert_eq!(OsType::from_os_str("plan9"), OsType::Unknown);
    }

    #[test]
    fn activity_tracker_is_monotonic() {
        let tracker = ActivityTracker::new();
        let mut last = 0;
        for _ in 0..100 {
            tracker.touch();
            let now = tracker.last_activity_ms();
            assert!(now >= last);
            last = now;
        }
    }
}
