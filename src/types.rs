//! Core type definitions for the midstream middleware.
//!
//! This module contains the normalized request/response model shared by
//! every component. The types fall into three groups:
//!
//! # Request Side
//!
//! - [`Request`]: the normalized inference request (conversation, system
//!   prompt, generation parameters, tool definitions, tool mode)
//! - [`RequestBuilder`]: validating builder for [`Request`]
//! - [`Message`]: one conversation turn, a participant name plus content
//! - [`ToolDefinition`]: name, description and JSON Schema for one tool
//!
//! # Content Model
//!
//! - [`ContentBlock`]: the closed sum of block variants (text, thinking,
//!   tool use, tool result, image, document). Blocks are immutable once
//!   produced.
//! - [`BlockType`]: the parser's four-way structural taxonomy
//!
//! # Response Side
//!
//! - [`FinalResponse`]: the assembled result of a completed `stream()` or
//!   `complete()` call
//! - [`AbortedResponse`]: partial state handed out intact on cancellation
//! - [`StreamOutcome`]: `Complete | Aborted`; cancellation returns through
//!   the normal path, never by raising
//! - [`Usage`]: token accounting, accumulated across loop iterations
//!
//! # Example
//!
//! ```
//! use midstream::{Request, Message};
//!
//! let request = Request::builder()
//!     .model("qwen2.5-32b-instruct")
//!     .system("You are a terse assistant")
//!     .message(Message::text("User", "What's 2+2?"))
//!     .max_tokens(512)
//!     .build()
//!     .expect("valid request");
//! assert_eq!(request.messages().len(), 1);
//! ```

use crate::Error;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// CONTENT MODEL
// ============================================================================

/// Multi-modal content blocks that can appear in messages and responses.
///
/// Serializes with serde's internally tagged format using a `"type"` field:
///
/// ```json
/// {"type": "text", "text": "Hello"}
/// {"type": "thinking", "thinking": "deep"}
/// {"type": "tool_use", "id": "call_1", "name": "add", "input": {"a": 2}}
/// {"type": "tool_result", "tool_use_id": "call_1", "content": "5", "is_error": false}
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Visible assistant or user text.
    Text(TextBlock),

    /// Model reasoning emitted inside the thinking region. Never visible.
    Thinking(ThinkingBlock),

    /// A parsed tool invocation.
    ToolUse(ToolUseBlock),

    /// The result of executing a tool invocation.
    ToolResult(ToolResultBlock),

    /// Base64-encoded image content.
    Image(ImageBlock),

    /// Base64-encoded document content (e.g. a PDF).
    Document(DocumentBlock),
}

impl ContentBlock {
    /// Convenience constructor for a text block.
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text(TextBlock::new(text))
    }

    /// Convenience constructor for a thinking block.
    pub fn thinking(text: impl Into<String>) -> Self {
        ContentBlock::Thinking(ThinkingBlock::new(text))
    }

    /// The text content, when this is a text block.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentBlock::Text(t) => Some(&t.text),
            _ => None,
        }
    }
}

/// Plain text content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TextBlock {
    pub text: String,
}

impl TextBlock {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// Reasoning content from the thinking region.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThinkingBlock {
    pub thinking: String,
}

impl ThinkingBlock {
    pub fn new(thinking: impl Into<String>) -> Self {
        Self {
            thinking: thinking.into(),
        }
    }
}

/// A tool invocation parsed out of the assistant's output.
///
/// `id` correlates the eventual result back to this call. In structural
/// mode ids are generated deterministically from the invocation's ordinal
/// position in the accumulated text, so re-parsing reproduces them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolUseBlock {
    /// Unique identifier for this tool call.
    pub id: String,

    /// Name of the tool to execute. Must match a registered
    /// [`ToolDefinition`] for the handler to resolve it.
    pub name: String,

    /// JSON arguments. `{}` for no-argument tools.
    pub input: serde_json::Value,
}

impl ToolUseBlock {
    pub fn new(id: impl Into<String>, name: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            input,
        }
    }
}

/// The result of one tool execution, echoed back with the call's id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResultBlock {
    /// Must match the `id` of the [`ToolUseBlock`] this result answers.
    pub tool_use_id: String,

    /// Result payload: a bare string or a sequence of typed items
    /// (text and/or images).
    pub content: ResultContent,

    /// Marks the result as a tool failure. Error results are serialized
    /// under the grammar's error sub-tag.
    #[serde(default)]
    pub is_error: bool,
}

impl ToolResultBlock {
    pub fn new(tool_use_id: impl Into<String>, content: impl Into<ResultContent>) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error: false,
        }
    }

    /// Construct an error result.
    pub fn error(tool_use_id: impl Into<String>, content: impl Into<ResultContent>) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error: true,
        }
    }

    /// Whether any item in the result carries image data.
    pub fn has_images(&self) -> bool {
        match &self.content {
            ResultContent::Text(_) => false,
            ResultContent::Blocks(blocks) => {
                blocks.iter().any(|b| matches!(b, ContentBlock::Image(_)))
            }
        }
    }
}

/// Tool result payload: a string or an ordered sequence of typed items.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ResultContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl ResultContent {
    /// Flatten to the textual portion (text blocks joined, images skipped).
    pub fn text(&self) -> String {
        match self {
            ResultContent::Text(t) => t.clone(),
            ResultContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| b.as_text())
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

impl From<String> for ResultContent {
    fn from(s: String) -> Self {
        ResultContent::Text(s)
    }
}

impl From<&str> for ResultContent {
    fn from(s: &str) -> Self {
        ResultContent::Text(s.to_string())
    }
}

impl From<Vec<ContentBlock>> for ResultContent {
    fn from(blocks: Vec<ContentBlock>) -> Self {
        ResultContent::Blocks(blocks)
    }
}

/// Base64-encoded image content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageBlock {
    /// MIME type, e.g. `image/png`.
    pub media_type: String,

    /// Base64-encoded bytes.
    pub data: String,
}

impl ImageBlock {
    /// Creates an image block after validating the MIME type.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `media_type` does not start with
    /// `image/` or `data` is empty.
    pub fn new(media_type: impl Into<String>, data: impl Into<String>) -> crate::Result<Self> {
        let media_type = media_type.into();
        let data = data.into();

        if !media_type.starts_with("image/") {
            return Err(Error::config(
                "image media_type must start with 'image/' (e.g. 'image/png')",
            ));
        }
        if data.is_empty() {
            return Err(Error::config("image data cannot be empty"));
        }

        Ok(Self { media_type, data })
    }
}

/// Base64-encoded document content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentBlock {
    pub media_type: String,
    pub data: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

// ============================================================================
// STRUCTURAL TAXONOMY
// ============================================================================

/// The parser's four-way block taxonomy. Every consumer block and every
/// content piece carries exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    Text,
    Thinking,
    ToolCall,
    ToolResult,
}

impl BlockType {
    /// `visible` is true exactly for text blocks.
    pub fn visible(&self) -> bool {
        matches!(self, BlockType::Text)
    }
}

// ============================================================================
// MESSAGES & TOOLS
// ============================================================================

/// One conversation turn: a participant identifier plus ordered content.
///
/// Participants are free-form names; the request designates which one is
/// the assistant (see [`RequestBuilder::assistant_name`]). Message identity
/// is positional.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Who produced this turn.
    pub participant: String,

    /// Ordered content blocks.
    pub content: Vec<ContentBlock>,
}

impl Message {
    /// A message holding a single text block.
    pub fn text(participant: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            participant: participant.into(),
            content: vec![ContentBlock::text(text)],
        }
    }

    /// A message with explicit content blocks.
    pub fn with_blocks(participant: impl Into<String>, content: Vec<ContentBlock>) -> Self {
        Self {
            participant: participant.into(),
            content,
        }
    }

    /// Whether the message carries no content at all.
    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
            || self
                .content
                .iter()
                .all(|b| b.as_text().is_some_and(|t| t.is_empty()))
    }

    /// Concatenated text of all text blocks.
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| b.as_text())
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Definition of one tool the model may invoke.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,

    /// JSON Schema object describing the tool's input. A schema without a
    /// `properties` key is valid and denotes a no-argument tool.
    pub input_schema: serde_json::Value,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }

    /// Whether the schema declares no parameters.
    pub fn takes_no_arguments(&self) -> bool {
        self.input_schema
            .get("properties")
            .map_or(true, |p| p.as_object().is_none_or(|o| o.is_empty()))
    }
}

/// How tool calls travel between the middleware and the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolMode {
    /// Tool calls ride in the character stream as structural tag regions;
    /// the middleware parses, interrupts, and resumes generation itself.
    Structural,

    /// The backend speaks a native tool protocol; the parser, extractor
    /// and formatter become pass-throughs.
    Native,

    /// Resolve to `Native` when the backend advertises native tool
    /// support, `Structural` otherwise.
    #[default]
    Auto,
}

/// System prompt content: a bare string or typed items.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum SystemContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl SystemContent {
    pub fn text(&self) -> String {
        match self {
            SystemContent::Text(t) => t.clone(),
            SystemContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| b.as_text())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

impl From<String> for SystemContent {
    fn from(s: String) -> Self {
        SystemContent::Text(s)
    }
}

impl From<&str> for SystemContent {
    fn from(s: &str) -> Self {
        SystemContent::Text(s.to_string())
    }
}

// ============================================================================
// NORMALIZED REQUEST
// ============================================================================

/// The normalized inference request.
///
/// Build with [`Request::builder()`]; direct construction is not exposed so
/// that validation (non-empty model, sane temperature) always runs.
#[derive(Debug, Clone)]
pub struct Request {
    messages: Vec<Message>,
    system: Option<SystemContent>,
    model: String,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    tools: Vec<ToolDefinition>,
    tool_mode: ToolMode,
    assistant_name: String,
    prefill_thinking: bool,
    cache_hints: bool,
}

impl Request {
    pub fn builder() -> RequestBuilder {
        RequestBuilder::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn system(&self) -> Option<&SystemContent> {
        self.system.as_ref()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn max_tokens(&self) -> Option<u32> {
        self.max_tokens
    }

    pub fn temperature(&self) -> Option<f32> {
        self.temperature
    }

    pub fn tools(&self) -> &[ToolDefinition] {
        &self.tools
    }

    pub fn tool_mode(&self) -> ToolMode {
        self.tool_mode
    }

    /// The participant name mapped to the assistant role.
    pub fn assistant_name(&self) -> &str {
        &self.assistant_name
    }

    /// Whether the first-iteration prefill opens a thinking region.
    pub fn prefill_thinking(&self) -> bool {
        self.prefill_thinking
    }

    pub fn cache_hints(&self) -> bool {
        self.cache_hints
    }

    /// Resolve a tool definition by name.
    pub fn tool(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.iter().find(|t| t.name == name)
    }
}

/// Builder for [`Request`] with validation.
///
/// # Required Fields
///
/// - `model`: the model identifier
///
/// Everything else has a sensible default: no system prompt, empty
/// conversation (callers usually add at least one message), `Auto` tool
/// mode, assistant participant `"Assistant"`.
#[derive(Debug, Default)]
pub struct RequestBuilder {
    messages: Vec<Message>,
    system: Option<SystemContent>,
    model: Option<String>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    tools: Vec<ToolDefinition>,
    tool_mode: ToolMode,
    assistant_name: Option<String>,
    prefill_thinking: bool,
    cache_hints: bool,
}

impl RequestBuilder {
    /// Sets the model identifier (required).
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Sets the system prompt.
    pub fn system(mut self, system: impl Into<SystemContent>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Appends one conversation message.
    pub fn message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    /// Replaces the conversation wholesale.
    pub fn messages(mut self, messages: Vec<Message>) -> Self {
        self.messages = messages;
        self
    }

    /// Sets the generation token budget.
    pub fn max_tokens(mut self, tokens: u32) -> Self {
        self.max_tokens = Some(tokens);
        self
    }

    /// Sets the sampling temperature (0.0–2.0).
    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Registers one tool definition.
    pub fn tool(mut self, tool: ToolDefinition) -> Self {
        self.tools.push(tool);
        self
    }

    /// Registers several tool definitions.
    pub fn tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools.extend(tools);
        self
    }

    /// Selects how tool calls travel (default: [`ToolMode::Auto`]).
    pub fn tool_mode(mut self, mode: ToolMode) -> Self {
        self.tool_mode = mode;
        self
    }

    /// Designates which participant name maps to the assistant role
    /// (default: `"Assistant"`).
    pub fn assistant_name(mut self, name: impl Into<String>) -> Self {
        self.assistant_name = Some(name.into());
        self
    }

    /// Opens a thinking region in the first-iteration prefill.
    pub fn prefill_thinking(mut self, enabled: bool) -> Self {
        self.prefill_thinking = enabled;
        self
    }

    /// Enables generation-cache hints on backend requests.
    pub fn cache_hints(mut self, enabled: bool) -> Self {
        self.cache_hints = enabled;
        self
    }

    /// Validates and builds the final [`Request`].
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the model is missing/blank, the
    /// temperature is out of range, or `max_tokens` is zero.
    pub fn build(self) -> crate::Result<Request> {
        let model = self.model.ok_or_else(|| Error::config("model is required"))?;
        if model.trim().is_empty() {
            return Err(Error::config("model cannot be empty or whitespace"));
        }

        if let Some(temp) = self.temperature {
            if !(0.0..=2.0).contains(&temp) {
                return Err(Error::config("temperature must be between 0.0 and 2.0"));
            }
        }

        if let Some(0) = self.max_tokens {
            return Err(Error::config("max_tokens must be greater than 0"));
        }

        let assistant_name = self.assistant_name.unwrap_or_else(|| "Assistant".to_string());
        if assistant_name.trim().is_empty() {
            return Err(Error::config("assistant_name cannot be empty"));
        }

        Ok(Request {
            messages: self.messages,
            system: self.system,
            model,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            tools: self.tools,
            tool_mode: self.tool_mode,
            assistant_name,
            prefill_thinking: self.prefill_thinking,
            cache_hints: self.cache_hints,
        })
    }
}

// ============================================================================
// RESPONSE SIDE
// ============================================================================

/// Why the backend stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Natural completion.
    EndTurn,
    /// Token budget exhausted.
    MaxTokens,
    /// A stop sequence matched (ours or the backend's).
    StopSequence,
    /// Native-mode tool invocation.
    ToolUse,
}

/// Token accounting for one or more backend round-trips.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_read_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_write_tokens: Option<u64>,
}

impl Usage {
    /// Fold another round-trip's usage into this cumulative total.
    pub fn accumulate(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        if let Some(read) = other.cache_read_tokens {
            *self.cache_read_tokens.get_or_insert(0) += read;
        }
        if let Some(write) = other.cache_write_tokens {
            *self.cache_write_tokens.get_or_insert(0) += write;
        }
    }
}

/// The assembled result of a completed call.
#[derive(Debug, Clone)]
pub struct FinalResponse {
    /// Canonical ordered blocks, parsed once from the accumulated text.
    pub content: Vec<ContentBlock>,

    /// Stop reason of the final iteration.
    pub stop_reason: StopReason,

    /// The matched stop sequence, when `stop_reason` is `StopSequence`.
    pub stop_sequence: Option<String>,

    /// Cumulative usage across all iterations.
    pub usage: Usage,

    /// Model the backend actually used.
    pub model: String,

    /// Number of backend round-trips.
    pub iterations: u32,

    /// Wall time from start to terminal state.
    pub elapsed: Duration,

    /// Every tool call executed during the loop.
    pub tool_calls: Vec<ToolUseBlock>,

    /// Every tool result returned by the handler.
    pub tool_results: Vec<ToolResultBlock>,

    /// The accumulated assistant text, valid as a later prefill.
    pub raw_assistant_text: String,
}

impl FinalResponse {
    /// Concatenated visible text.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| b.as_text())
            .collect::<Vec<_>>()
            .join("")
    }

    /// Concatenated thinking content.
    pub fn thinking(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Thinking(t) => Some(t.thinking.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Why a `stream()` call was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// The cancellation token fired.
    User,
    /// The per-iteration timeout elapsed and the caller configured
    /// timeout-as-abort.
    Timeout,
    /// An error path elected to hand back partial state.
    Error,
}

/// Partial state handed out intact on cancellation.
///
/// `raw_assistant_text` is the accumulated text at the moment of
/// cancellation and is valid as the prefill of a later `stream()` call.
#[derive(Debug, Clone)]
pub struct AbortedResponse {
    pub content: Vec<ContentBlock>,
    pub usage: Usage,
    pub tool_calls: Vec<ToolUseBlock>,
    pub tool_results: Vec<ToolResultBlock>,
    pub reason: AbortReason,
    pub raw_assistant_text: String,
}

/// The normal return of `stream()`: completion or cancellation. Errors
/// (`Err`) are reserved for genuine failures per the error taxonomy.
#[derive(Debug, Clone)]
pub enum StreamOutcome {
    Complete(FinalResponse),
    Aborted(AbortedResponse),
}

impl StreamOutcome {
    pub fn is_aborted(&self) -> bool {
        matches!(self, StreamOutcome::Aborted(_))
    }

    /// Unwraps the completed response, panicking on an aborted one.
    /// Intended for tests and examples.
    pub fn expect_complete(self) -> FinalResponse {
        match self {
            StreamOutcome::Complete(r) => r,
            StreamOutcome::Aborted(a) => {
                panic!("stream was aborted ({:?}) with partial text {:?}", a.reason, a.raw_assistant_text)
            }
        }
    }

    /// Unwraps the aborted response, panicking on a completed one.
    /// Intended for tests and examples.
    pub fn expect_aborted(self) -> AbortedResponse {
        match self {
            StreamOutcome::Aborted(a) => a,
            StreamOutcome::Complete(_) => panic!("stream completed, expected abort"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_builder_requires_model() {
        let result = Request::builder().build();
        assert!(result.is_err());
    }

    #[test]
    fn test_request_builder_validates_temperature() {
        let result = Request::builder().model("m").temperature(3.0).build();
        assert!(result.is_err());

        let result = Request::builder().model("m").temperature(0.7).build();
        assert!(result.is_ok());
    }

    #[test]
    fn test_request_builder_defaults() {
        let request = Request::builder().model("m").build().unwrap();
        assert_eq!(request.assistant_name(), "Assistant");
        assert_eq!(request.tool_mode(), ToolMode::Auto);
        assert!(!request.prefill_thinking());
        assert!(request.tools().is_empty());
    }

    #[test]
    fn test_content_block_serde_tagging() {
        let block = ContentBlock::ToolUse(ToolUseBlock::new("call_1", "add", json!({"a": 2})));
        let value = serde_json::to_value(&block).unwrap();
        assert_eq!(value["type"], "tool_use");
        assert_eq!(value["name"], "add");

        let back: ContentBlock = serde_json::from_value(value).unwrap();
        assert_eq!(back, block);
    }

    #[test]
    fn test_tool_result_content_forms() {
        let text_result = ToolResultBlock::new("call_1", "5");
        assert_eq!(text_result.content.text(), "5");
        assert!(!text_result.has_images());

        let rich = ToolResultBlock::new(
            "call_2",
            vec![
                ContentBlock::text("see chart"),
                ContentBlock::Image(ImageBlock::new("image/png", "aGk=").unwrap()),
            ],
        );
        assert!(rich.has_images());
        assert_eq!(rich.content.text(), "see chart");
    }

    #[test]
    fn test_no_argument_tool_detection() {
        let no_args = ToolDefinition::new("ping", "ping", json!({"type": "object"}));
        assert!(no_args.takes_no_arguments());

        let with_args = ToolDefinition::new(
            "add",
            "add numbers",
            json!({"type": "object", "properties": {"a": {"type": "number"}}}),
        );
        assert!(!with_args.takes_no_arguments());
    }

    #[test]
    fn test_usage_accumulation() {
        let mut total = Usage::default();
        total.accumulate(&Usage {
            input_tokens: 10,
            output_tokens: 20,
            cache_read_tokens: Some(5),
            cache_write_tokens: None,
        });
        total.accumulate(&Usage {
            input_tokens: 30,
            output_tokens: 40,
            cache_read_tokens: Some(5),
            cache_write_tokens: Some(2),
        });

        assert_eq!(total.input_tokens, 40);
        assert_eq!(total.output_tokens, 60);
        assert_eq!(total.cache_read_tokens, Some(10));
        assert_eq!(total.cache_write_tokens, Some(2));
    }

    #[test]
    fn test_image_block_validation() {
        assert!(ImageBlock::new("image/png", "aGk=").is_ok());
        assert!(ImageBlock::new("text/plain", "aGk=").is_err());
        assert!(ImageBlock::new("image/png", "").is_err());
    }

    #[test]
    fn test_message_empty_detection() {
        assert!(Message::text("User", "").is_empty());
        assert!(!Message::text("User", "hi").is_empty());
        assert!(Message::with_blocks("User", vec![]).is_empty());
    }

    #[test]
    fn test_block_type_visibility() {
        assert!(BlockType::Text.visible());
        assert!(!BlockType::Thinking.visible());
        assert!(!BlockType::ToolCall.visible());
        assert!(!BlockType::ToolResult.visible());
    }
}
