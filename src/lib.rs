//! # midstream
//!
//! Provider-agnostic middleware for LLM inference: take a normalized
//! request (conversation history, tools, generation parameters), dispatch
//! it to a backend transport, and return a normalized response.
//!
//! ## What it actually does
//!
//! The interesting part is the middle: **multi-turn tool execution over a
//! streaming character channel**, for backends that do not speak a tool
//! protocol natively. The model is coaxed into one through **prefill**
//! (seeding the beginning of its reply) and **stop sequences** (hard
//! interrupts), and midstream does the rest:
//!
//! - parses the character stream incrementally into text / thinking /
//!   tool-call / tool-result blocks, without ever leaking wire tags to
//!   consumers;
//! - detects tool invocations mid-stream, suspends generation, executes
//!   tools out-of-band through your async handler, re-injects the results
//!   and resumes;
//! - tells true terminal stops apart from stop sequences that merely
//!   appeared inside a structural region (a chat-log tool returning
//!   `"\nUser:"`, say) and resumes through the false positives;
//! - keeps a single authoritative accumulated-text record that is always
//!   valid as the next prefill.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use midstream::{
//!     Middleware, OpenAiBackend, Request, Message, StreamOptions, StreamCallbacks,
//!     ToolDefinition, ToolResultBlock,
//! };
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = OpenAiBackend::builder()
//!         .base_url("http://localhost:1234/v1")
//!         .build()?;
//!     let middleware = Middleware::new(backend);
//!
//!     let request = Request::builder()
//!         .model("qwen2.5-32b-instruct")
//!         .system("You are a calculator with tools.")
//!         .message(Message::text("User", "What is 2 + 3?"))
//!         .tool(ToolDefinition::new(
//!             "add",
//!             "Add two numbers",
//!             json!({"type": "object", "properties": {
//!                 "a": {"type": "number"}, "b": {"type": "number"}
//!             }}),
//!         ))
//!         .build()?;
//!
//!     let callbacks = StreamCallbacks::new()
//!         .on_chunk(|piece| {
//!             if piece.visible {
//!                 print!("{}", piece.text);
//!             }
//!         })
//!         .on_tool_calls(|calls, _ctx| async move {
//!             Ok(calls
//!                 .iter()
//!                 .map(|call| {
//!                     let a = call.input["a"].as_f64().unwrap_or(0.0);
//!                     let b = call.input["b"].as_f64().unwrap_or(0.0);
//!                     ToolResultBlock::new(&call.id, format!("{}", a + b))
//!                 })
//!                 .collect())
//!         });
//!
//!     let outcome = middleware
//!         .stream(&request, StreamOptions::new().callbacks(callbacks))
//!         .await?;
//!     println!("\n--\n{}", outcome.expect_complete().text());
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **parser**: incremental structural parser; character stream in,
//!   content pieces and block events out
//! - **grammar**: the configurable tag vocabulary and escape rules
//! - **extract**: tool-call extraction and accumulated-text assembly
//! - **format**: tool-result serialization, split-turn image injection
//! - **prefill**: conversation → backend request with assistant prefill
//! - **orchestrator**: the iterative tool loop and stop disambiguation
//! - **events**: the consumer callback surface and yield-style adapter
//! - **transport**: the backend trait, plus the OpenAI-compatible adapter
//! - **types**: the normalized request/response model
//! - **error**: the error taxonomy
//! - **retry**: exponential backoff utilities
//! - **config**: provider endpoint helpers

/// Consumer API surface: `Middleware`, `StreamOptions`.
mod client;

/// Provider endpoint and model-name resolution helpers.
mod config;

/// Error taxonomy and `Result` alias.
mod error;

/// Consumer callback surface and the yield-style event stream adapter.
mod events;

/// Tool-call extraction and final content assembly from accumulated text.
mod extract;

/// Tool-result serialization back into the structural language.
mod format;

/// The structural tag vocabulary, namespace handling and entity escaping.
mod grammar;

/// OpenAI-compatible chat-completions transport adapter.
mod openai;

/// The stream orchestrator: tool loop, stop disambiguation, cancellation.
mod orchestrator;

/// Incremental structural parser.
mod parser;

/// Prefill and continuation request building.
mod prefill;

/// Backend transport trait and normalized wire-side types.
mod transport;

/// Normalized request/response model.
mod types;

/// Retry utilities with exponential backoff and jitter. Public so callers
/// can reuse the policy for their own operations.
pub mod retry;

// --- Consumer API ---

pub use client::{DEFAULT_MAX_TOOL_DEPTH, Middleware, StreamOptions};

// --- Events & callbacks ---

pub use events::{
    EventStream, RetryDecision, StreamCallbacks, StreamEvent, ToolContext, ToolHandler,
};

// --- Parser surface ---

pub use parser::{BlockEvent, ContentPiece, Emission, StructuralParser};

// --- Grammar ---

pub use grammar::{RegionKind, TagGrammar, TagGrammarBuilder, TagKind, escape, unescape};

// --- Transport ---

pub use transport::{
    Backend, BackendContent, BackendMessage, BackendRequest, BackendResponse, CallControl,
    CancelToken, Role, TransportEvent, TransportStream,
};

pub use openai::{OpenAiBackend, OpenAiBackendBuilder};

// --- Provider configuration ---

pub use config::{Provider, get_base_url, get_model};

// --- Error handling ---

pub use error::{Error, Result};

// --- Core types ---

pub use types::{
    AbortReason, AbortedResponse, BlockType, ContentBlock, DocumentBlock, FinalResponse,
    ImageBlock, Message, Request, RequestBuilder, ResultContent, StopReason, StreamOutcome,
    SystemContent, TextBlock, ThinkingBlock, ToolDefinition, ToolMode, ToolResultBlock,
    ToolUseBlock, Usage,
};

/// Convenience module containing the most commonly used types.
/// Import with `use midstream::prelude::*;`.
pub mod prelude {
    pub use crate::{
        CancelToken, ContentBlock, Error, Message, Middleware, OpenAiBackend, Request, Result,
        StopReason, StreamCallbacks, StreamOptions, StreamOutcome, ToolDefinition,
        ToolResultBlock, ToolUseBlock,
    };
}
