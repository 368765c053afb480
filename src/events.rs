//! Event fan-out to the consumer.
//!
//! Every emission of a `stream()` call reaches the consumer through the
//! callbacks registered here, exactly once each, in strict causal order:
//! `Start` for block *i* precedes every chunk of block *i*, which precede
//! its `Complete`; `on_pre_tool_content` precedes `on_tool_calls` precedes
//! the emissions of the result region it produced.
//!
//! Observation callbacks are synchronous; they watch the stream go by.
//! The one true suspension point is the tool handler, stored as an async
//! closure the same way hook handlers are.
//!
//! # Examples
//!
//! ```rust,no_run
//! use midstream::{StreamCallbacks, ToolResultBlock};
//!
//! let callbacks = StreamCallbacks::new()
//!     .on_chunk(|piece| {
//!         if piece.visible {
//!             print!("{}", piece.text);
//!         }
//!     })
//!     .on_tool_calls(|calls, _ctx| async move {
//!         Ok(calls
//!             .iter()
//!             .map(|c| ToolResultBlock::new(&c.id, "ok"))
//!             .collect())
//!     });
//! # let _ = callbacks;
//! ```

use crate::parser::{BlockEvent, ContentPiece};
use crate::transport::CancelToken;
use crate::types::{ToolResultBlock, ToolUseBlock, Usage};
use crate::{Error, Result};
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Context handed to the tool handler at each suspension.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Raw text of the tool-call region, tags included.
    pub raw_text: String,
    /// Assistant text preceding the region.
    pub preamble: String,
    /// Current iteration depth (1-based).
    pub depth: u32,
    /// Results from earlier iterations of this `stream()` call.
    pub prior_results: Vec<ToolResultBlock>,
    /// The full accumulated text at suspension time.
    pub accumulated_text: String,
    /// The call's cancellation token; long-running tools should observe it.
    pub cancel: CancelToken,
}

/// Verdict from `on_error` during the retry path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    Abort,
}

/// The async tool-execution handler.
///
/// Must echo back exactly one result per call id. Anything else is a
/// [`Error::BadHandlerReturn`].
pub type ToolHandler = Arc<
    dyn Fn(Vec<ToolUseBlock>, ToolContext) -> Pin<Box<dyn Future<Output = Result<Vec<ToolResultBlock>>> + Send>>
        + Send
        + Sync,
>;

type ChunkObserver = Arc<dyn Fn(&ContentPiece) + Send + Sync>;
type BlockObserver = Arc<dyn Fn(&BlockEvent) + Send + Sync>;
type TextObserver = Arc<dyn Fn(&str) + Send + Sync>;
type UsageObserver = Arc<dyn Fn(&Usage) + Send + Sync>;
type RawObserver = Arc<dyn Fn(&serde_json::Value) + Send + Sync>;
type ErrorObserver = Arc<dyn Fn(&Error, u32) -> RetryDecision + Send + Sync>;

/// Container for every consumer-facing callback.
#[derive(Clone, Default)]
pub struct StreamCallbacks {
    chunk: Vec<ChunkObserver>,
    block: Vec<BlockObserver>,
    pre_tool_content: Vec<TextObserver>,
    usage: Vec<UsageObserver>,
    request: Vec<RawObserver>,
    response: Vec<RawObserver>,
    error: Option<ErrorObserver>,
    tool_handler: Option<ToolHandler>,
}

impl StreamCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observe every character-level content piece. Structural tags never
    /// flow through this.
    pub fn on_chunk<F>(mut self, f: F) -> Self
    where
        F: Fn(&ContentPiece) + Send + Sync + 'static,
    {
        self.chunk.push(Arc::new(f));
        self
    }

    /// Observe every block boundary.
    pub fn on_block<F>(mut self, f: F) -> Self
    where
        F: Fn(&BlockEvent) + Send + Sync + 'static,
    {
        self.block.push(Arc::new(f));
        self
    }

    /// Observe the assistant text preceding each tool-call region.
    pub fn on_pre_tool_content<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.pre_tool_content.push(Arc::new(f));
        self
    }

    /// Observe cumulative usage after each backend round-trip.
    pub fn on_usage<F>(mut self, f: F) -> Self
    where
        F: Fn(&Usage) + Send + Sync + 'static,
    {
        self.usage.push(Arc::new(f));
        self
    }

    /// Observe the raw request of every backend round-trip.
    pub fn on_request<F>(mut self, f: F) -> Self
    where
        F: Fn(&serde_json::Value) + Send + Sync + 'static,
    {
        self.request.push(Arc::new(f));
        self
    }

    /// Observe the raw response of every backend round-trip.
    pub fn on_response<F>(mut self, f: F) -> Self
    where
        F: Fn(&serde_json::Value) + Send + Sync + 'static,
    {
        self.response.push(Arc::new(f));
        self
    }

    /// Decide whether a retryable backend failure is retried or aborted.
    /// Without this callback the retry policy alone decides.
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&Error, u32) -> RetryDecision + Send + Sync + 'static,
    {
        self.error = Some(Arc::new(f));
        self
    }

    /// Register the tool handler, the suspension point where generation
    /// pauses while tools execute out-of-band.
    pub fn on_tool_calls<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Vec<ToolUseBlock>, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<ToolResultBlock>>> + Send + 'static,
    {
        self.tool_handler = Some(Arc::new(move |calls, ctx| Box::pin(f(calls, ctx))));
        self
    }

    pub fn has_tool_handler(&self) -> bool {
        self.tool_handler.is_some()
    }

    // ------------------------------------------------------------------
    // emission (crate-internal)
    // ------------------------------------------------------------------

    pub(crate) fn emit_chunk(&self, piece: &ContentPiece) {
        for f in &self.chunk {
            f(piece);
        }
    }

    pub(crate) fn emit_block(&self, event: &BlockEvent) {
        for f in &self.block {
            f(event);
        }
    }

    pub(crate) fn emit_pre_tool_content(&self, text: &str) {
        for f in &self.pre_tool_content {
            f(text);
        }
    }

    pub(crate) fn emit_usage(&self, usage: &Usage) {
        for f in &self.usage {
            f(usage);
        }
    }

    pub(crate) fn emit_request(&self, raw: &serde_json::Value) {
        for f in &self.request {
            f(raw);
        }
    }

    pub(crate) fn emit_response(&self, raw: &serde_json::Value) {
        for f in &self.response {
            f(raw);
        }
    }

    pub(crate) fn consult_error(&self, error: &Error, attempt: u32) -> Option<RetryDecision> {
        self.error.as_ref().map(|f| f(error, attempt))
    }

    /// Run the tool handler and validate its id echo.
    pub(crate) async fn execute_tool_calls(
        &self,
        calls: Vec<ToolUseBlock>,
        context: ToolContext,
    ) -> Result<Vec<ToolResultBlock>> {
        let handler = self
            .tool_handler
            .as_ref()
            .ok_or_else(|| Error::bad_handler_return("no tool handler registered"))?;

        let expected: HashSet<String> = calls.iter().map(|c| c.id.clone()).collect();
        let results = handler(calls, context).await?;

        validate_id_echo(&expected, &results)?;
        Ok(results)
    }
}

/// Every result must echo a known call id, and every call id must be
/// answered exactly once.
fn validate_id_echo(expected: &HashSet<String>, results: &[ToolResultBlock]) -> Result<()> {
    let mut seen: HashSet<&str> = HashSet::new();
    for result in results {
        let id = result.tool_use_id.as_str();
        if !expected.contains(id) {
            return Err(Error::bad_handler_return(format!(
                "result references unknown tool_use_id {:?}",
                id
            )));
        }
        if !seen.insert(id) {
            return Err(Error::bad_handler_return(format!(
                "duplicate result for tool_use_id {:?}",
                id
            )));
        }
    }
    if seen.len() != expected.len() {
        let missing: Vec<&str> = expected
            .iter()
            .map(String::as_str)
            .filter(|id| !seen.contains(id))
            .collect();
        return Err(Error::bad_handler_return(format!(
            "handler did not answer tool_use_ids {:?}",
            missing
        )));
    }
    Ok(())
}

impl std::fmt::Debug for StreamCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamCallbacks")
            .field("chunk", &format!("{} observers", self.chunk.len()))
            .field("block", &format!("{} observers", self.block.len()))
            .field(
                "pre_tool_content",
                &format!("{} observers", self.pre_tool_content.len()),
            )
            .field("usage", &format!("{} observers", self.usage.len()))
            .field("tool_handler", &self.tool_handler.is_some())
            .finish()
    }
}

// ============================================================================
// GENERATOR-STYLE ADAPTER
// ============================================================================

/// One event in the yield-style view of a `stream()` call.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Chunk(ContentPiece),
    Block(BlockEvent),
    PreToolContent(String),
    Usage(Usage),
}

/// Receiver side of [`StreamCallbacks::with_channel`].
pub type EventStream = UnboundedReceiverStream<StreamEvent>;

impl StreamCallbacks {
    /// Layer a yield-style event stream over this callback set. Equivalent
    /// to the callback API: the returned stream observes the same events
    /// in the same order. The tool handler, if any, still runs through the
    /// callbacks.
    pub fn with_channel(self) -> (Self, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();

        let chunk_tx = tx.clone();
        let block_tx = tx.clone();
        let pre_tx = tx.clone();
        let usage_tx = tx;

        let callbacks = self
            .on_chunk(move |piece| {
                let _ = chunk_tx.send(StreamEvent::Chunk(piece.clone()));
            })
            .on_block(move |event| {
                let _ = block_tx.send(StreamEvent::Block(event.clone()));
            })
            .on_pre_tool_content(move |text| {
                let _ = pre_tx.send(StreamEvent::PreToolContent(text.to_string()));
            })
            .on_usage(move |usage| {
                let _ = usage_tx.send(StreamEvent::Usage(*usage));
            });

        (callbacks, UnboundedReceiverStream::new(rx))
    }
}
