//! Backend transport interface.
//!
//! The middleware consumes backends through the [`Backend`] trait: one
//! non-streaming operation and one streaming operation over a normalized
//! request shape. Adapters own everything wire-specific (serialization
//! dialects, SSE framing, authentication) and classify their failures
//! into the crate error taxonomy exactly once, at this boundary.
//!
//! The transport is shared and opaque: the core assumes it is safe to call
//! concurrently from multiple `stream()` invocations.

use crate::types::{ContentBlock, StopReason, SystemContent, ToolDefinition, Usage};
use crate::Result;
use async_trait::async_trait;
use futures::stream::Stream;
use serde::Serialize;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Cooperative cancellation flag, checked at every suspension point.
///
/// Clone freely; all clones observe the same flag. The tool handler is
/// handed the same token and is expected to observe it during long
/// executions.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation to every holder of this token.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Backend-facing message role. Participant names have already been mapped
/// by the prefill builder; the wire only knows these three.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Backend-facing message content: a bare string or typed items (used for
/// the synthetic image turns of split-turn injection).
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum BackendContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl BackendContent {
    pub fn text(&self) -> String {
        match self {
            BackendContent::Text(t) => t.clone(),
            BackendContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| b.as_text())
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

/// One wire-ready message.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BackendMessage {
    pub role: Role,
    pub content: BackendContent,
}

impl BackendMessage {
    pub fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: BackendContent::Text(content.into()),
        }
    }

    pub fn blocks(role: Role, blocks: Vec<ContentBlock>) -> Self {
        Self {
            role,
            content: BackendContent::Blocks(blocks),
        }
    }
}

/// The request shape every adapter receives.
#[derive(Debug, Clone, Serialize)]
pub struct BackendRequest {
    pub model: String,
    pub messages: Vec<BackendMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
    /// Native-mode tool schema. Empty in structural mode, where the tools ride
    /// in the prompt text instead.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
    /// Generation-cache hint passthrough.
    pub cache_hints: bool,
}

/// The response every adapter returns.
#[derive(Debug, Clone)]
pub struct BackendResponse {
    /// Ordered typed content. In structural mode this is usually one text
    /// item; in native mode it may carry tool-use items.
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    /// The matched stop sequence, when the backend stopped on one.
    pub stop_sequence: Option<String>,
    pub usage: Usage,
    /// Model the backend actually used.
    pub model: String,
    /// Raw round-trip object for the observability hooks.
    pub raw: serde_json::Value,
}

/// One event from a streaming round-trip.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A fragment of assistant text. Tags may cross fragment boundaries.
    Delta(String),
    /// Terminal event carrying the final response metadata. Nothing
    /// follows it.
    Completed(BackendResponse),
}

/// Boxed event stream returned by [`Backend::stream`].
pub type TransportStream = Pin<Box<dyn Stream<Item = Result<TransportEvent>> + Send>>;

/// Per-call control handed to the adapter.
#[derive(Debug, Clone, Default)]
pub struct CallControl {
    pub cancel: CancelToken,
    /// Bound on one backend round-trip. The orchestrator also enforces
    /// this outside the adapter; adapters should apply it to their own
    /// I/O when they can (e.g. HTTP client timeouts).
    pub timeout: Option<Duration>,
}

/// A backend transport.
///
/// Implementations classify their failures into the crate error taxonomy
/// here; the orchestrator never sees provider-specific error shapes.
#[async_trait]
pub trait Backend: Send + Sync {
    /// One full (non-streaming) round-trip.
    async fn complete(
        &self,
        request: &BackendRequest,
        control: &CallControl,
    ) -> Result<BackendResponse>;

    /// One streaming round-trip. The stream yields text deltas and ends
    /// with exactly one `Completed` event on success.
    async fn stream(
        &self,
        request: &BackendRequest,
        control: &CallControl,
    ) -> Result<TransportStream>;

    /// Whether the backend speaks a native tool protocol. Drives
    /// `ToolMode::Auto` resolution.
    fn supports_native_tools(&self) -> bool {
        false
    }

    /// Advertised cap on stop sequences per request, if any. The prefill
    /// builder truncates its generated set to this.
    fn max_stop_sequences(&self) -> Option<usize> {
        None
    }
}
