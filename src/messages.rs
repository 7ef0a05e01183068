//! ComfyUI streaming-channel message types and parsers.
//!
//! ComfyUI sends JSON text frames with the shape
//! `{"type": "<kind>", "data": {...}}` plus binary frames carrying
//! preview images. This module deserializes text frames into a
//! strongly-typed [`ComfyUIMessage`] enum (unknown kinds are retained
//! as raw JSON so they can still be fanned out) and decodes the binary
//! preview framing.

use serde::Deserialize;
use serde_json::Value;

/// All known ComfyUI WebSocket message types.
///
/// Deserialized via the internally-tagged `"type"` field with
/// associated `"data"` content.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ComfyUIMessage {
    /// Server status broadcast (queue depth, session id).
    #[serde(rename = "status")]
    Status(StatusData),

    /// A prompt has started executing.
    #[serde(rename = "execution_start")]
    ExecutionStart(ExecutionStartData),

    /// Some nodes were skipped because their outputs are cached.
    #[serde(rename = "execution_cached")]
    ExecutionCached(ExecutionCachedData),

    /// A specific node is currently executing (or execution finished when `node` is `None`).
    #[serde(rename = "executing")]
    Executing(ExecutingData),

    /// Progress update from a long-running node (e.g. KSampler).
    #[serde(rename = "progress")]
    Progress(ProgressData),

    /// A node has finished and produced output.
    #[serde(rename = "executed")]
    Executed(ExecutedData),

    /// The whole prompt finished successfully.
    #[serde(rename = "execution_success")]
    ExecutionSuccess(ExecutionSuccessData),

    /// Execution failed with an error.
    #[serde(rename = "execution_error")]
    ExecutionError(ErrorData),

    /// Execution was interrupted before completion.
    #[serde(rename = "execution_interrupted")]
    ExecutionInterrupted(InterruptedData),

    /// Terminal log lines pushed by the server.
    #[serde(rename = "logs")]
    Logs(LogsData),
}

/// Queue status information.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusData {
    pub status: QueueStatus,
    /// Server-assigned session id; when present the client rebinds its
    /// own client id to this value.
    #[serde(default)]
    pub sid: Option<String>,
}

/// Current queue state.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueStatus {
    pub exec_info: ExecInfo,
}

/// Execution queue statistics.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecInfo {
    pub queue_remaining: i32,
}

/// Payload for `execution_start` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionStartData {
    pub prompt_id: String,
}

/// Payload for `execution_cached` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionCachedData {
    pub prompt_id: String,
    /// Node IDs whose outputs were served from cache.
    #[serde(default)]
    pub nodes: Vec<String>,
}

/// Payload for `executing` messages.
///
/// When `node` is `None`, execution of the prompt has completed.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutingData {
    pub node: Option<String>,
    pub prompt_id: String,
}

/// Payload for `progress` messages (step-level progress within a node).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProgressData {
    /// Current step number.
    pub value: i32,
    /// Total number of steps.
    pub max: i32,
    /// The prompt this progress belongs to.
    #[serde(default)]
    pub prompt_id: Option<String>,
    /// The node currently stepping, if reported.
    #[serde(default)]
    pub node: Option<String>,
}

/// Payload for `executed` messages (node output).
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutedData {
    /// The node that produced this output.
    pub node: String,
    /// Raw output value (images, filenames, etc.).
    pub output: Value,
    pub prompt_id: String,
}

/// Payload for `execution_success` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionSuccessData {
    pub prompt_id: String,
}

/// Payload for `execution_error` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorData {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub node_type: Option<String>,
    #[serde(default)]
    pub exception_message: String,
    #[serde(default)]
    pub exception_type: String,
}

/// Payload for `execution_interrupted` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct InterruptedData {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
    /// Nodes that had already run when the interrupt landed.
    #[serde(default)]
    pub executed: Vec<String>,
}

/// Payload for `logs` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct LogsData {
    #[serde(default)]
    pub entries: Vec<LogEntry>,
}

/// A single terminal log line.
#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct LogEntry {
    /// Timestamp string as reported by the server.
    #[serde(default)]
    pub t: String,
    /// Log line content.
    pub m: String,
}

// ---------------------------------------------------------------------------
// Text frame parsing
// ---------------------------------------------------------------------------

/// A parsed text frame.
///
/// `message` is `Some` for known message kinds. The raw `kind` and
/// `data` are always retained so that unknown message types can still
/// be dispatched to the catch-all event stream, and `sid` is extracted
/// up front for session rebinding.
#[derive(Debug, Clone)]
pub struct TextFrame {
    /// The raw `"type"` field.
    pub kind: String,
    /// Server-assigned session id (`data.sid`), if present.
    pub sid: Option<String>,
    /// Typed message when the kind is known.
    pub message: Option<ComfyUIMessage>,
    /// Raw `"data"` payload.
    pub data: Value,
}

/// Errors raised while decoding streamed frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The text frame was not a JSON object with a string `"type"` field.
    #[error("Malformed text frame: {0}")]
    MalformedText(String),

    /// The binary frame was shorter than the 8-byte header.
    #[error("Binary frame truncated at {len} bytes")]
    Truncated { len: usize },
}

/// Parse a ComfyUI WebSocket text frame.
///
/// Unknown `"type"` values are not an error; they come back with
/// `message == None` and the raw payload intact. Malformed JSON or a
/// missing `"type"` field is an error — callers should log it and keep
/// the channel alive.
pub fn parse_text_frame(text: &str) -> Result<TextFrame, FrameError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| FrameError::MalformedText(e.to_string()))?;

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| FrameError::MalformedText("missing \"type\" field".to_string()))?
        .to_string();

    let sid = value
        .pointer("/data/sid")
        .and_then(Value::as_str)
        .map(str::to_string);

    let message = serde_json::from_value::<ComfyUIMessage>(value.clone()).ok();
    let data = value.get("data").cloned().unwrap_or(Value::Null);

    Ok(TextFrame {
        kind,
        sid,
        message,
        data,
    })
}

// ---------------------------------------------------------------------------
// Binary frame parsing
// ---------------------------------------------------------------------------

/// Binary event type for preview images.
const BINARY_EVENT_PREVIEW: u32 = 1;

/// Format word value for PNG previews (anything else defaults to JPEG).
const PREVIEW_FORMAT_PNG: u32 = 2;

/// Image format of a streamed preview.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewFormat {
    Jpeg,
    Png,
}

impl PreviewFormat {
    /// MIME type string for the format.
    pub fn mime(self) -> &'static str {
        match self {
            PreviewFormat::Jpeg => "image/jpeg",
            PreviewFormat::Png => "image/png",
        }
    }
}

/// A decoded binary frame.
#[derive(Debug, Clone)]
pub enum BinaryEvent {
    /// An in-progress preview image.
    Preview {
        format: PreviewFormat,
        data: Vec<u8>,
    },

    /// An event type this client does not understand. Logged and
    /// discarded by the connection loop; never aborts the channel.
    Unknown { event_type: u32 },
}

/// Decode a binary frame.
///
/// Layout: bytes 0..4 are a big-endian event type; for preview events
/// bytes 4..8 are a big-endian format word (`1` JPEG, `2` PNG, default
/// JPEG) and bytes 8.. are the image payload.
pub fn parse_binary_frame(bytes: &[u8]) -> Result<BinaryEvent, FrameError> {
    if bytes.len() < 8 {
        return Err(FrameError::Truncated { len: bytes.len() });
    }

    let event_type = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if event_type != BINARY_EVENT_PREVIEW {
        return Ok(BinaryEvent::Unknown { event_type });
    }

    let format_word = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    let format = if format_word == PREVIEW_FORMAT_PNG {
        PreviewFormat::Png
    } else {
        PreviewFormat::Jpeg
    };

    Ok(BinaryEvent::Preview {
        format,
        data: bytes[8..].to_vec(),
    })
}
