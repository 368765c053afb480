//! Reference transport adapter: OpenAI-compatible chat completions.
//!
//! Speaks the `/chat/completions` dialect served by LM Studio, Ollama,
//! llama.cpp, vLLM and most cloud gateways. Everything wire-specific lives
//! here: request serialization, SSE framing, tool-call delta aggregation,
//! and the one-time classification of HTTP failures into the crate error
//! taxonomy.
//!
//! # Stop-sequence echo
//!
//! The orchestrator needs to know *which* stop sequence terminated a
//! round-trip. The OpenAI dialect only reports `finish_reason: "stop"`,
//! but several servers echo the matched string in extension fields
//! (vLLM's `stop_reason`, llama.cpp's `stopping_word`), and this adapter
//! surfaces those when present. Backends that echo nothing still work:
//! servers that do not consume stop sequences stream the text through,
//! where the orchestrator's own phase-1 scan catches it.

use crate::transport::{
    Backend, BackendContent, BackendMessage, BackendRequest, BackendResponse, CallControl, Role,
    TransportEvent, TransportStream,
};
use crate::types::{ContentBlock, StopReason, SystemContent, ToolDefinition, Usage};
use crate::{Error, Result};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, trace};

/// OpenAI-compatible backend over HTTP + SSE.
///
/// # Examples
///
/// ```rust,no_run
/// use midstream::OpenAiBackend;
///
/// let backend = OpenAiBackend::builder()
///     .base_url("http://localhost:1234/v1")
///     .build()
///     .unwrap();
/// # let _ = backend;
/// ```
pub struct OpenAiBackend {
    base_url: String,
    api_key: String,
    http: reqwest::Client,
    native_tools: bool,
}

/// Builder for [`OpenAiBackend`].
#[derive(Default)]
pub struct OpenAiBackendBuilder {
    base_url: Option<String>,
    api_key: Option<String>,
    timeout: Option<Duration>,
    native_tools: bool,
}

impl OpenAiBackendBuilder {
    /// API endpoint, e.g. `http://localhost:1234/v1` (required).
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Bearer token. Local servers usually accept anything; defaults to
    /// `"not-needed"`.
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// HTTP client timeout (connection-level; the per-iteration timeout is
    /// enforced by the orchestrator).
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Advertise native tool support, switching `ToolMode::Auto` requests
    /// to the wire tool protocol instead of structural parsing.
    pub fn native_tools(mut self, enabled: bool) -> Self {
        self.native_tools = enabled;
        self
    }

    pub fn build(self) -> Result<OpenAiBackend> {
        let base_url = self
            .base_url
            .ok_or_else(|| Error::config("base_url is required"))?;
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(Error::config("base_url must start with http:// or https://"));
        }

        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = self.timeout {
            builder = builder.connect_timeout(timeout);
        }
        let http = builder
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {}", e)))?;

        Ok(OpenAiBackend {
            base_url,
            api_key: self.api_key.unwrap_or_else(|| "not-needed".to_string()),
            http,
            native_tools: self.native_tools,
        })
    }
}

impl OpenAiBackend {
    pub fn builder() -> OpenAiBackendBuilder {
        OpenAiBackendBuilder::default()
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    async fn post(
        &self,
        request: &BackendRequest,
        control: &CallControl,
        stream: bool,
    ) -> Result<reqwest::Response> {
        let body = wire_request(request, stream);
        trace!(url = %self.url(), stream, "posting chat completion");

        let mut builder = self
            .http
            .post(self.url())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(timeout) = control.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(classify_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(classify_status(status.as_u16(), &body, retry_after));
        }

        Ok(response)
    }
}

#[async_trait]
impl Backend for OpenAiBackend {
    async fn complete(
        &self,
        request: &BackendRequest,
        control: &CallControl,
    ) -> Result<BackendResponse> {
        let response = self.post(request, control, false).await?;
        let raw: serde_json::Value = response.json().await.map_err(classify_reqwest)?;
        let parsed: ChatCompletion =
            serde_json::from_value(raw.clone()).map_err(Error::Json)?;
        Ok(completion_to_response(parsed, raw))
    }

    async fn stream(
        &self,
        request: &BackendRequest,
        control: &CallControl,
    ) -> Result<TransportStream> {
        let response = self.post(request, control, true).await?;
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<TransportEvent>>(16);

        tokio::spawn(async move {
            let mut events = response.bytes_stream().eventsource();
            let mut state = StreamState::default();

            while let Some(event) = events.next().await {
                let event = match event {
                    Ok(event) => event,
                    Err(e) => {
                        let _ = tx
                            .send(Err(Error::network(format!("SSE stream error: {}", e))))
                            .await;
                        return;
                    }
                };
                // End-of-stream sentinel; not JSON.
                if event.data.trim() == "[DONE]" {
                    break;
                }

                let chunk: ChatChunk = match serde_json::from_str(&event.data) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx
                            .send(Err(Error::network(format!(
                                "failed to parse stream chunk: {}",
                                e
                            ))))
                            .await;
                        return;
                    }
                };

                state.raw_chunks.push(event.data.clone());
                if let Some(model) = chunk.model {
                    state.model = model;
                }
                if let Some(usage) = chunk.usage {
                    state.usage = usage.into();
                }

                for choice in chunk.choices {
                    if let Some(word) = choice.stop_extension() {
                        state.stop_sequence = Some(word);
                    }
                    if let Some(content) = choice.delta.content {
                        if !content.is_empty() {
                            state.text.push_str(&content);
                            if tx.send(Ok(TransportEvent::Delta(content))).await.is_err() {
                                // Receiver dropped: the orchestrator is done
                                // with this iteration.
                                return;
                            }
                        }
                    }
                    if let Some(tool_calls) = choice.delta.tool_calls {
                        state.aggregate_tool_deltas(tool_calls);
                    }
                    if let Some(reason) = choice.finish_reason {
                        state.finish_reason = Some(reason);
                    }
                }
            }

            let _ = match state.into_response() {
                Ok(response) => tx.send(Ok(TransportEvent::Completed(response))).await,
                Err(e) => tx.send(Err(e)).await,
            };
        });

        Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx)))
    }

    fn supports_native_tools(&self) -> bool {
        self.native_tools
    }

    fn max_stop_sequences(&self) -> Option<usize> {
        // The chat completions `stop` parameter accepts at most four
        // sequences.
        Some(4)
    }
}

// ============================================================================
// WIRE TYPES
// ============================================================================

fn wire_request(request: &BackendRequest, stream: bool) -> serde_json::Value {
    let mut messages = Vec::new();

    if let Some(system) = &request.system {
        messages.push(json!({"role": "system", "content": system_text(system)}));
    }
    for message in &request.messages {
        wire_messages(message, &mut messages);
    }

    let mut body = json!({
        "model": request.model,
        "messages": messages,
        "stream": stream,
    });
    if stream {
        body["stream_options"] = json!({"include_usage": true});
    }
    if let Some(max_tokens) = request.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    if let Some(temperature) = request.temperature {
        body["temperature"] = json!(temperature);
    }
    if !request.stop_sequences.is_empty() {
        body["stop"] = json!(request.stop_sequences);
    }
    if !request.tools.is_empty() {
        body["tools"] = json!(request.tools.iter().map(wire_tool).collect::<Vec<_>>());
    }
    body
}

fn system_text(system: &SystemContent) -> String {
    system.text()
}

fn wire_tool(tool: &ToolDefinition) -> serde_json::Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.input_schema,
        }
    })
}

/// Translate one backend message into wire messages. Native tool traffic
/// needs the dialect's special shapes: assistant `tool_calls` arrays and
/// `role: "tool"` result messages.
fn wire_messages(message: &BackendMessage, out: &mut Vec<serde_json::Value>) {
    let role = match message.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    };

    match &message.content {
        BackendContent::Text(text) => {
            out.push(json!({"role": role, "content": text}));
        }
        BackendContent::Blocks(blocks) => {
            let tool_results: Vec<_> = blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolResult(r) => Some(r),
                    _ => None,
                })
                .collect();
            if !tool_results.is_empty() {
                for result in tool_results {
                    out.push(json!({
                        "role": "tool",
                        "tool_call_id": result.tool_use_id,
                        "content": result.content.text(),
                    }));
                }
                return;
            }

            let tool_calls: Vec<_> = blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolUse(c) => Some(json!({
                        "id": c.id,
                        "type": "function",
                        "function": {
                            "name": c.name,
                            "arguments": c.input.to_string(),
                        }
                    })),
                    _ => None,
                })
                .collect();
            if message.role == Role::Assistant && !tool_calls.is_empty() {
                let text: String = blocks.iter().filter_map(|b| b.as_text()).collect();
                out.push(json!({
                    "role": "assistant",
                    "content": text,
                    "tool_calls": tool_calls,
                }));
                return;
            }

            // Multi-modal content parts (text + images).
            let parts: Vec<_> = blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text(t) => Some(json!({"type": "text", "text": t.text})),
                    ContentBlock::Image(img) => Some(json!({
                        "type": "image_url",
                        "image_url": {
                            "url": format!("data:{};base64,{}", img.media_type, img.data)
                        }
                    })),
                    _ => None,
                })
                .collect();
            out.push(json!({"role": role, "content": parts}));
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
    /// vLLM extension: the matched stop string.
    #[serde(default)]
    stop_reason: Option<serde_json::Value>,
    /// llama.cpp extension: the matched stop word.
    #[serde(default)]
    stopping_word: Option<String>,
}

impl ChunkChoice {
    fn stop_extension(&self) -> Option<String> {
        if let Some(serde_json::Value::String(s)) = &self.stop_reason {
            return Some(s.clone());
        }
        self.stopping_word.clone().filter(|w| !w.is_empty())
    }
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
    #[serde(default)]
    finish_reason: Option<String>,
    #[serde(default)]
    stop_reason: Option<serde_json::Value>,
    #[serde(default)]
    stopping_word: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<CompletionToolCall>>,
}

#[derive(Debug, Deserialize)]
struct CompletionToolCall {
    id: String,
    function: CompletionFunction,
}

#[derive(Debug, Deserialize)]
struct CompletionFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl From<WireUsage> for Usage {
    fn from(w: WireUsage) -> Self {
        Usage {
            input_tokens: w.prompt_tokens,
            output_tokens: w.completion_tokens,
            cache_read_tokens: None,
            cache_write_tokens: None,
        }
    }
}

/// An in-progress native tool call assembled from deltas. Arguments arrive
/// as JSON fragments split at arbitrary byte positions; they are only
/// parsed once the stream finishes.
#[derive(Debug, Default)]
struct PartialToolCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

#[derive(Debug, Default)]
struct StreamState {
    text: String,
    tool_calls: HashMap<u32, PartialToolCall>,
    finish_reason: Option<String>,
    stop_sequence: Option<String>,
    usage: Usage,
    model: String,
    raw_chunks: Vec<String>,
}

impl StreamState {
    fn aggregate_tool_deltas(&mut self, deltas: Vec<ToolCallDelta>) {
        for delta in deltas {
            let entry = self.tool_calls.entry(delta.index).or_default();
            if let Some(id) = delta.id {
                entry.id = Some(id);
            }
            if let Some(function) = delta.function {
                if let Some(name) = function.name {
                    entry.name = Some(name);
                }
                if let Some(args) = function.arguments {
                    entry.arguments.push_str(&args);
                }
            }
        }
    }

    fn into_response(self) -> Result<BackendResponse> {
        let mut content = Vec::new();
        if !self.text.is_empty() {
            content.push(ContentBlock::text(self.text.clone()));
        }

        let mut indices: Vec<u32> = self.tool_calls.keys().copied().collect();
        indices.sort_unstable();
        for index in indices {
            let partial = &self.tool_calls[&index];
            let (Some(id), Some(name)) = (&partial.id, &partial.name) else {
                // Incomplete deltas; nothing usable.
                continue;
            };
            let input = if partial.arguments.is_empty() {
                json!({})
            } else {
                serde_json::from_str(&partial.arguments).map_err(|e| {
                    Error::network(format!("failed to parse tool arguments: {}", e))
                })?
            };
            content.push(ContentBlock::ToolUse(crate::types::ToolUseBlock::new(
                id, name, input,
            )));
        }

        let stop_reason = map_finish_reason(
            self.finish_reason.as_deref(),
            self.stop_sequence.is_some(),
        );
        debug!(?stop_reason, chunks = self.raw_chunks.len(), "stream finished");

        Ok(BackendResponse {
            content,
            stop_reason,
            stop_sequence: self.stop_sequence,
            usage: self.usage,
            model: self.model,
            raw: json!({"chunks": self.raw_chunks}),
        })
    }
}

fn completion_to_response(parsed: ChatCompletion, raw: serde_json::Value) -> BackendResponse {
    let mut content = Vec::new();
    let mut stop_reason = StopReason::EndTurn;
    let mut stop_sequence = None;

    if let Some(choice) = parsed.choices.into_iter().next() {
        if let Some(text) = choice.message.content {
            if !text.is_empty() {
                content.push(ContentBlock::text(text));
            }
        }
        if let Some(calls) = choice.message.tool_calls {
            for call in calls {
                let input = if call.function.arguments.is_empty() {
                    json!({})
                } else {
                    serde_json::from_str(&call.function.arguments).unwrap_or(json!({}))
                };
                content.push(ContentBlock::ToolUse(crate::types::ToolUseBlock::new(
                    call.id,
                    call.function.name,
                    input,
                )));
            }
        }
        stop_sequence = match (&choice.stop_reason, &choice.stopping_word) {
            (Some(serde_json::Value::String(s)), _) => Some(s.clone()),
            (_, Some(w)) if !w.is_empty() => Some(w.clone()),
            _ => None,
        };
        stop_reason = map_finish_reason(choice.finish_reason.as_deref(), stop_sequence.is_some());
    }

    BackendResponse {
        content,
        stop_reason,
        stop_sequence,
        usage: parsed.usage.map(Into::into).unwrap_or_default(),
        model: parsed.model.unwrap_or_default(),
        raw,
    }
}

fn map_finish_reason(reason: Option<&str>, matched_stop: bool) -> StopReason {
    match reason {
        Some("length") => StopReason::MaxTokens,
        Some("tool_calls") => StopReason::ToolUse,
        Some("stop") if matched_stop => StopReason::StopSequence,
        Some("stop") | None | Some(_) => StopReason::EndTurn,
    }
}

// ============================================================================
// ERROR CLASSIFICATION (the taxonomy boundary)
// ============================================================================

fn classify_reqwest(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::timeout(Duration::from_secs(0))
    } else if err.is_connect() {
        Error::network(format!("connection failed: {}", err))
    } else {
        Error::network(err.to_string())
    }
}

fn classify_status(status: u16, body: &str, retry_after: Option<Duration>) -> Error {
    match status {
        401 | 403 => Error::auth(format!("HTTP {}: {}", status, body)),
        429 => Error::rate_limit(format!("HTTP 429: {}", body), retry_after),
        400 | 413 => {
            let lowered = body.to_lowercase();
            if lowered.contains("context length")
                || lowered.contains("context window")
                || lowered.contains("maximum context")
                || lowered.contains("too many tokens")
            {
                Error::context_length(body.to_string())
            } else {
                Error::unknown(format!("HTTP {}: {}", status, body))
            }
        }
        500..=599 => Error::server(format!("HTTP {}: {}", status, body)),
        other => Error::unknown(format!("HTTP {}: {}", other, body)),
    }
}
