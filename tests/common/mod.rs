//! Shared test support: a scripted mock backend.
//!
//! Each `ScriptedIteration` is one backend round-trip: the deltas the
//! backend will stream and how it terminates. The mock records every
//! request it receives so tests can assert on prefills and stop-sequence
//! sets.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::stream;
use midstream::{
    Backend, BackendRequest, BackendResponse, CallControl, ContentBlock, Result, StopReason,
    TransportEvent, TransportStream, Usage,
};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct ScriptedIteration {
    pub deltas: Vec<String>,
    pub stop_reason: StopReason,
    pub stop_sequence: Option<String>,
    pub content: Vec<ContentBlock>,
    pub usage: Usage,
}

impl ScriptedIteration {
    fn base(deltas: &[&str]) -> Self {
        Self {
            deltas: deltas.iter().map(|s| s.to_string()).collect(),
            stop_reason: StopReason::EndTurn,
            stop_sequence: None,
            content: Vec::new(),
            usage: Usage {
                input_tokens: 10,
                output_tokens: 5,
                cache_read_tokens: None,
                cache_write_tokens: None,
            },
        }
    }

    /// Stream deltas, then terminate naturally.
    pub fn text(deltas: &[&str]) -> Self {
        Self::base(deltas)
    }

    /// Stream deltas, then terminate on a stop sequence the backend
    /// consumed (the stop string is NOT in the deltas).
    pub fn stopped(deltas: &[&str], stop: &str) -> Self {
        let mut it = Self::base(deltas);
        it.stop_reason = StopReason::StopSequence;
        it.stop_sequence = Some(stop.to_string());
        it
    }

    /// Stream deltas, then hit the token budget.
    pub fn truncated(deltas: &[&str]) -> Self {
        let mut it = Self::base(deltas);
        it.stop_reason = StopReason::MaxTokens;
        it
    }

    /// Native-mode round-trip ending in tool use.
    pub fn native_tool_use(deltas: &[&str], content: Vec<ContentBlock>) -> Self {
        let mut it = Self::base(deltas);
        it.stop_reason = StopReason::ToolUse;
        it.content = content;
        it
    }

    /// Native-mode round-trip ending naturally with typed content.
    pub fn native_text(deltas: &[&str], content: Vec<ContentBlock>) -> Self {
        let mut it = Self::base(deltas);
        it.content = content;
        it
    }
}

pub struct MockBackend {
    script: Mutex<VecDeque<ScriptedIteration>>,
    pub requests: Mutex<Vec<BackendRequest>>,
    native_tools: bool,
    max_stops: Option<usize>,
}

impl MockBackend {
    pub fn new(script: Vec<ScriptedIteration>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
            native_tools: false,
            max_stops: Some(4),
        }
    }

    pub fn with_native_tools(mut self) -> Self {
        self.native_tools = true;
        self
    }

    pub fn with_max_stops(mut self, cap: Option<usize>) -> Self {
        self.max_stops = cap;
        self
    }

    /// Requests seen so far (clone of the record).
    pub fn recorded(&self) -> Vec<BackendRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn next_iteration(&self) -> ScriptedIteration {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .expect("mock backend script exhausted")
    }

    fn response_for(&self, it: &ScriptedIteration) -> BackendResponse {
        let mut content = it.content.clone();
        if content.is_empty() {
            let text: String = it.deltas.concat();
            if !text.is_empty() {
                content.push(ContentBlock::text(text));
            }
        }
        BackendResponse {
            content,
            stop_reason: it.stop_reason,
            stop_sequence: it.stop_sequence.clone(),
            usage: it.usage,
            model: "mock-model".to_string(),
            raw: json!({"mock": true}),
        }
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn complete(
        &self,
        request: &BackendRequest,
        _control: &CallControl,
    ) -> Result<BackendResponse> {
        self.requests.lock().unwrap().push(request.clone());
        let it = self.next_iteration();
        Ok(self.response_for(&it))
    }

    async fn stream(
        &self,
        request: &BackendRequest,
        _control: &CallControl,
    ) -> Result<TransportStream> {
        self.requests.lock().unwrap().push(request.clone());
        let it = self.next_iteration();
        let response = self.response_for(&it);

        let mut events: Vec<Result<TransportEvent>> = it
            .deltas
            .iter()
            .map(|d| Ok(TransportEvent::Delta(d.clone())))
            .collect();
        events.push(Ok(TransportEvent::Completed(response)));

        Ok(Box::pin(stream::iter(events)))
    }

    fn supports_native_tools(&self) -> bool {
        self.native_tools
    }

    fn max_stop_sequences(&self) -> Option<usize> {
        self.max_stops
    }
}

/// Opt-in tracing output while debugging a test run:
/// `MIDSTREAM_TEST_LOG=1 cargo test -- --nocapture`
pub fn init_tracing() {
    if std::env::var("MIDSTREAM_TEST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .try_init();
    }
}

/// An ordered log of everything the callbacks observed, for ordering
/// assertions.
#[derive(Default)]
pub struct EventLog {
    entries: Mutex<Vec<String>>,
}

impl EventLog {
    pub fn push(&self, entry: impl Into<String>) {
        self.entries.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }
}
