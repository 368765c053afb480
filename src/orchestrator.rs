//! Stream orchestration: the iterative tool loop.
//!
//! Drives one `stream()` call through its state machine:
//!
//! ```text
//! initial ─→ streaming ─┬─→ executing_tools ──→ streaming
//!                       ├─→ resuming_false_stop ─→ streaming
//!                       ├─→ complete
//!                       └─→ aborted
//! ```
//!
//! Each pass of the outer loop is one backend round-trip. Between
//! round-trips the orchestrator decides, from the effective stop reason
//! and the parser's depth state, whether to execute tools, resume a
//! false-positive stop, or terminate. All consumer-visible emissions flow
//! through [`StreamCallbacks`] in causal order.
//!
//! # Stop-sequence disambiguation
//!
//! Two detection phases run concurrently. Phase 1 scans arriving text for
//! every active stop sequence before the parser sees it; to survive stops
//! split across chunk boundaries without ever retracting an emitted
//! character, the longest trailing fragment that could still grow into a
//! stop is withheld (the *holdback*) until the next chunk disambiguates
//! it. Phase 2 simply accepts the backend's own termination. A match
//! inside an open structural region that is not the tool-call close tag is
//! a false positive: the consumed text is re-appended and generation
//! resumes from the reconstructed position.

use crate::error::{Error, Result};
use crate::events::{RetryDecision, StreamCallbacks, ToolContext};
use crate::extract;
use crate::format::{self, ResultSegment};
use crate::grammar::TagGrammar;
use crate::parser::{BlockEvent, Emission, StructuralParser};
use crate::prefill::{self, TurnSplit};
use crate::retry::{Backoff, RetryConfig};
use crate::transport::{
    Backend, BackendMessage, BackendRequest, BackendResponse, CallControl, CancelToken, Role,
    TransportEvent,
};
use crate::types::{
    AbortReason, AbortedResponse, BlockType, ContentBlock, FinalResponse, Request, StopReason,
    StreamOutcome, ToolMode, ToolResultBlock, ToolUseBlock, Usage,
};
use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// How often suspension points poll the cancellation flag.
const CANCEL_POLL: Duration = Duration::from_millis(25);

/// Everything one `stream()` invocation needs, threaded from the client.
pub(crate) struct RunConfig {
    pub backend: Arc<dyn Backend>,
    pub grammar: Arc<TagGrammar>,
    pub callbacks: StreamCallbacks,
    pub cancel: CancelToken,
    pub iteration_timeout: Option<Duration>,
    pub max_tool_depth: u32,
    pub retry: RetryConfig,
}

/// Outcome of a cancellable, deadline-bounded await.
enum Waited<T> {
    Done(T),
    Cancelled,
    TimedOut,
}

/// Await a future while polling the cancellation flag and honoring an
/// optional deadline. This is what makes every suspension point obey the
/// token even when the awaited side stalls.
async fn wait_on<F>(fut: F, cancel: &CancelToken, deadline: Option<Instant>) -> Waited<F::Output>
where
    F: Future,
{
    tokio::pin!(fut);
    loop {
        if cancel.is_cancelled() {
            return Waited::Cancelled;
        }
        if let Some(d) = deadline {
            if Instant::now() >= d {
                return Waited::TimedOut;
            }
        }
        tokio::select! {
            out = &mut fut => return Waited::Done(out),
            _ = tokio::time::sleep(CANCEL_POLL) => {}
        }
    }
}

/// Earliest stop-sequence hit in `window`; longest match wins ties.
fn find_earliest_stop<'a>(window: &str, stops: &'a [String]) -> Option<(usize, &'a str)> {
    let mut best: Option<(usize, &'a str)> = None;
    for stop in stops {
        if stop.is_empty() {
            continue;
        }
        if let Some(idx) = window.find(stop.as_str()) {
            best = match best {
                None => Some((idx, stop)),
                Some((bidx, bstop)) => {
                    if idx < bidx || (idx == bidx && stop.len() > bstop.len()) {
                        Some((idx, stop))
                    } else {
                        Some((bidx, bstop))
                    }
                }
            };
        }
    }
    best
}

/// Length in bytes of the longest suffix of `window` that is a proper
/// prefix of any stop sequence: the holdback that must not reach the
/// parser yet.
fn holdback_len(window: &str, stops: &[String]) -> usize {
    let mut longest = 0;
    for stop in stops {
        // Proper prefixes only: a full match would have been a hit.
        for (end, _) in stop.char_indices().skip(1) {
            let prefix = &stop[..end];
            if prefix.len() > longest && window.ends_with(prefix) {
                longest = prefix.len();
            }
        }
    }
    longest
}

struct StreamRun<'a> {
    request: &'a Request,
    cfg: &'a RunConfig,

    parser: StructuralParser,
    accumulated: String,
    splits: Vec<TurnSplit>,
    holdback: String,
    active_stops: Vec<String>,

    executed_calls: Vec<ToolUseBlock>,
    executed_results: Vec<ToolResultBlock>,
    usage: Usage,
    iterations: u32,
    guarded_transitions: u32,
    model_used: String,
    started: Instant,

    native: bool,
    native_content: Vec<ContentBlock>,
    native_extra: Vec<BackendMessage>,
}

/// Run the full streaming tool loop.
pub(crate) async fn run_stream(request: &Request, cfg: &RunConfig) -> Result<StreamOutcome> {
    let native = match request.tool_mode() {
        ToolMode::Native => true,
        ToolMode::Structural => false,
        ToolMode::Auto => cfg.backend.supports_native_tools() && !request.tools().is_empty(),
    };

    let parser = if native {
        StructuralParser::pass_through(cfg.grammar.clone())
    } else {
        StructuralParser::new(cfg.grammar.clone())
    };

    let mut run = StreamRun {
        request,
        cfg,
        parser,
        accumulated: String::new(),
        splits: Vec::new(),
        holdback: String::new(),
        active_stops: Vec::new(),
        executed_calls: Vec::new(),
        executed_results: Vec::new(),
        usage: Usage::default(),
        iterations: 0,
        guarded_transitions: 0,
        model_used: request.model().to_string(),
        started: Instant::now(),
        native,
        native_content: Vec::new(),
        native_extra: Vec::new(),
    };

    run.drive().await
}

/// Run a single round-trip with no tool loop.
pub(crate) async fn run_complete(request: &Request, cfg: &RunConfig) -> Result<FinalResponse> {
    let started = Instant::now();
    let backend_request =
        prefill::build_backend_request(request, &cfg.grammar, "", &[], false, cfg.backend.max_stop_sequences());

    cfg.callbacks
        .emit_request(&serde_json::to_value(&backend_request)?);

    let control = CallControl {
        cancel: cfg.cancel.clone(),
        timeout: cfg.iteration_timeout,
    };
    let response = complete_with_retry(cfg, &backend_request, &control).await?;
    cfg.callbacks.emit_response(&response.raw);
    cfg.callbacks.emit_usage(&response.usage);

    let text: String = response
        .content
        .iter()
        .filter_map(|b| b.as_text())
        .collect();
    let content = extract::content_blocks_from_text(&text, &cfg.grammar);

    Ok(FinalResponse {
        content,
        stop_reason: response.stop_reason,
        stop_sequence: response.stop_sequence,
        usage: response.usage,
        model: response.model,
        iterations: 1,
        elapsed: started.elapsed(),
        tool_calls: Vec::new(),
        tool_results: Vec::new(),
        raw_assistant_text: text,
    })
}

async fn complete_with_retry(
    cfg: &RunConfig,
    request: &BackendRequest,
    control: &CallControl,
) -> Result<BackendResponse> {
    let mut backoff = cfg.retry.start();
    loop {
        match cfg.backend.complete(request, control).await {
            Ok(response) => return Ok(response),
            Err(err) => {
                let Some(delay) = consult_and_pace(cfg, &mut backoff, &err) else {
                    return Err(err);
                };
                debug!(failures = backoff.failures(), ?delay, error = %err, "retrying backend call");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// One failure: the backoff policy decides the pace, the consumer's
/// `on_error` callback gets a veto.
fn consult_and_pace(
    cfg: &RunConfig,
    backoff: &mut Backoff<'_>,
    err: &Error,
) -> Option<Duration> {
    let delay = backoff.next_delay(err)?;
    match cfg.callbacks.consult_error(err, backoff.failures()) {
        Some(RetryDecision::Abort) => None,
        Some(RetryDecision::Retry) | None => Some(delay),
    }
}

/// What one consumed round-trip amounted to.
struct IterationEnd {
    response: BackendResponse,
    /// Stop detected by the phase-1 software scan, if any.
    software_stop: Option<String>,
}

impl<'a> StreamRun<'a> {
    fn structural_tools_active(&self) -> bool {
        !self.native
            && !self.request.tools().is_empty()
            && self.cfg.callbacks.has_tool_handler()
    }

    async fn drive(&mut self) -> Result<StreamOutcome> {
        loop {
            if self.cfg.cancel.is_cancelled() {
                return Ok(self.abort(AbortReason::User));
            }

            let iteration = self.run_iteration().await?;
            let end = match iteration {
                Ok(end) => end,
                // Iteration-level abort (cancel / timeout mid-stream).
                Err(outcome) => return Ok(outcome),
            };

            self.iterations += 1;
            self.usage.accumulate(&end.response.usage);
            self.model_used = end.response.model.clone();
            self.cfg.callbacks.emit_response(&end.response.raw);
            self.cfg.callbacks.emit_usage(&self.usage);

            let (stop_reason, stop_sequence) = match &end.software_stop {
                Some(matched) => (StopReason::StopSequence, Some(matched.clone())),
                None => (end.response.stop_reason, end.response.stop_sequence.clone()),
            };
            debug!(
                iteration = self.iterations,
                ?stop_reason,
                stop_sequence = stop_sequence.as_deref().unwrap_or(""),
                "iteration finished"
            );

            if self.native {
                match stop_reason {
                    StopReason::ToolUse if self.cfg.callbacks.has_tool_handler() => {
                        match self.native_tool_round(&end.response).await? {
                            Some(outcome) => return Ok(outcome),
                            None => continue,
                        }
                    }
                    _ => {
                        self.native_content.extend(end.response.content.clone());
                        return self.complete(stop_reason, stop_sequence);
                    }
                }
            }

            match stop_reason {
                StopReason::EndTurn | StopReason::MaxTokens | StopReason::ToolUse => {
                    return self.complete(stop_reason, stop_sequence);
                }
                StopReason::StopSequence => {
                    let matched = stop_sequence.clone().unwrap_or_default();
                    if matched.is_empty() {
                        // Backend reported a stop without naming it;
                        // nothing to reconstruct, treat as terminal.
                        return self.complete(stop_reason, stop_sequence);
                    }
                    if matched == self.cfg.grammar.tool_call_close() {
                        // Always a real stop: the backend consumed the
                        // close tag, so synthesize it for the parser.
                        self.ingest_structural(&self.cfg.grammar.tool_call_close());
                        match self.tool_round().await? {
                            Some(outcome) => return Ok(outcome),
                            None => continue,
                        }
                    } else if self.parser.inside_any_block() {
                        // False positive inside a structural region.
                        if self.depth_exhausted() {
                            return self.complete(stop_reason, stop_sequence);
                        }
                        self.guarded_transitions += 1;
                        trace!(matched = %matched.escape_debug(), "resuming false-positive stop");
                        self.ingest_structural(&matched);
                        continue;
                    } else {
                        return self.complete(stop_reason, stop_sequence);
                    }
                }
            }
        }
    }

    /// One backend round-trip: open the stream, consume it, scan for
    /// stops, feed the parser. `Err(outcome)` in the inner result is an
    /// abort that must propagate immediately.
    async fn run_iteration(
        &mut self,
    ) -> Result<std::result::Result<IterationEnd, StreamOutcome>> {
        self.parser.reset_for_iteration();
        self.holdback.clear();

        let cap = self.cfg.backend.max_stop_sequences();
        let backend_request = if self.native {
            self.native_request()
        } else {
            // On the very first iteration, the thinking-open tag of the
            // preface must reach the parser so depth tracking is truthful.
            if self.iterations == 0 && self.accumulated.is_empty() {
                if let Some(tag) =
                    prefill::preface_structural_suffix(self.request, &self.cfg.grammar)
                {
                    self.ingest_structural(&tag);
                }
            }
            prefill::build_backend_request(
                self.request,
                &self.cfg.grammar,
                &self.accumulated,
                &self.splits,
                self.structural_tools_active(),
                cap,
            )
        };
        self.active_stops = backend_request.stop_sequences.clone();

        self.cfg
            .callbacks
            .emit_request(&serde_json::to_value(&backend_request)?);

        let control = CallControl {
            cancel: self.cfg.cancel.clone(),
            timeout: self.cfg.iteration_timeout,
        };
        let deadline = self
            .cfg
            .iteration_timeout
            .map(|t| Instant::now() + t);

        let opened = self.open_stream(&backend_request, &control, deadline).await?;
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(outcome) => return Ok(Err(outcome)),
        };

        let mut software_stop: Option<String> = None;
        let mut response: Option<BackendResponse> = None;

        loop {
            let waited = wait_on(stream.next(), &self.cfg.cancel, deadline).await;
            let item = match waited {
                Waited::Done(item) => item,
                Waited::Cancelled => return Ok(Err(self.abort(AbortReason::User))),
                Waited::TimedOut => return Ok(Err(self.abort(AbortReason::Timeout))),
            };
            let Some(item) = item else {
                break;
            };

            match item? {
                TransportEvent::Delta(text) => {
                    if software_stop.is_none() {
                        software_stop = self.ingest_delta(&text);
                    }
                    // After a phase-1 hit, later chunks of this iteration
                    // are dropped; we only keep draining for the terminal
                    // event's usage and raw payload.
                }
                TransportEvent::Completed(r) => {
                    response = Some(r);
                    break;
                }
            }
        }

        // Whatever the holdback held was real content after all.
        if software_stop.is_none() && !self.holdback.is_empty() {
            let tail = std::mem::take(&mut self.holdback);
            self.ingest_structural(&tail);
        }
        self.holdback.clear();

        let response = response
            .ok_or_else(|| Error::network("backend stream ended without a terminal event"))?;

        Ok(Ok(IterationEnd {
            response,
            software_stop,
        }))
    }

    async fn open_stream(
        &mut self,
        request: &BackendRequest,
        control: &CallControl,
        deadline: Option<Instant>,
    ) -> Result<std::result::Result<crate::transport::TransportStream, StreamOutcome>> {
        let cfg = self.cfg;
        let mut backoff = cfg.retry.start();
        loop {
            let waited = wait_on(
                cfg.backend.stream(request, control),
                &cfg.cancel,
                deadline,
            )
            .await;
            let opened = match waited {
                Waited::Done(result) => result,
                Waited::Cancelled => return Ok(Err(self.abort(AbortReason::User))),
                Waited::TimedOut => return Ok(Err(self.abort(AbortReason::Timeout))),
            };

            match opened {
                Ok(stream) => return Ok(Ok(stream)),
                Err(err) => {
                    let Some(delay) = consult_and_pace(cfg, &mut backoff, &err) else {
                        return Err(err);
                    };
                    debug!(failures = backoff.failures(), ?delay, error = %err, "retrying stream open");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Phase-1 scan + parser feed for one delta. Returns the matched stop
    /// sequence on a hit.
    fn ingest_delta(&mut self, text: &str) -> Option<String> {
        let mut window = std::mem::take(&mut self.holdback);
        window.push_str(text);

        if let Some((idx, stop)) = find_earliest_stop(&window, &self.active_stops) {
            let keep = window[..idx].to_string();
            let matched = stop.to_string();
            if !keep.is_empty() {
                self.ingest_structural(&keep);
            }
            trace!(matched = %matched.escape_debug(), "phase-1 stop hit");
            return Some(matched);
        }

        let hold = holdback_len(&window, &self.active_stops);
        let feed_end = window.len() - hold;
        if feed_end > 0 {
            let feed_now = window[..feed_end].to_string();
            self.ingest_structural(&feed_now);
        }
        self.holdback = window[feed_end..].to_string();
        None
    }

    /// Append text to accumulated state, feed the parser, route emissions.
    fn ingest_structural(&mut self, text: &str) {
        self.accumulated.push_str(text);
        let emissions = self.parser.feed(text);
        self.route(emissions);
    }

    fn route(&mut self, emissions: Vec<Emission>) {
        for emission in emissions {
            match emission {
                Emission::Piece(piece) => self.cfg.callbacks.emit_chunk(&piece),
                Emission::Event(event) => {
                    let event = self.enrich(event);
                    self.cfg.callbacks.emit_block(&event);
                }
            }
        }
    }

    /// Fill tool metadata on tool-call block completions from the region
    /// that just closed.
    fn enrich(&self, event: BlockEvent) -> BlockEvent {
        match event {
            BlockEvent::Complete {
                index,
                block_type: BlockType::ToolCall,
                content,
                ..
            } => {
                let calls = extract::last_region_calls(&self.accumulated, &self.cfg.grammar);
                let first = calls.first();
                BlockEvent::Complete {
                    index,
                    block_type: BlockType::ToolCall,
                    content,
                    tool_name: first.map(|c| c.name.clone()),
                    tool_id: first.map(|c| c.id.clone()),
                    input: first.map(|c| c.input.clone()),
                }
            }
            other => other,
        }
    }

    fn depth_exhausted(&self) -> bool {
        self.guarded_transitions >= self.cfg.max_tool_depth
    }

    /// Structural-mode tool execution. `None` means: loop again.
    async fn tool_round(&mut self) -> Result<Option<StreamOutcome>> {
        if !self.structural_tools_active() {
            return Ok(Some(self.complete(
                StopReason::StopSequence,
                Some(self.cfg.grammar.tool_call_close()),
            )?));
        }

        let Some(pending) = extract::extract_pending(&self.accumulated, &self.cfg.grammar) else {
            return Ok(Some(self.complete(
                StopReason::StopSequence,
                Some(self.cfg.grammar.tool_call_close()),
            )?));
        };
        if pending.calls.is_empty() {
            // Empty region: block events already fired; nothing to run.
            return Ok(Some(self.complete(
                StopReason::StopSequence,
                Some(self.cfg.grammar.tool_call_close()),
            )?));
        }

        if self.depth_exhausted() {
            debug!(max = self.cfg.max_tool_depth, "tool depth exhausted");
            return Ok(Some(self.complete(
                StopReason::StopSequence,
                Some(self.cfg.grammar.tool_call_close()),
            )?));
        }
        self.guarded_transitions += 1;

        self.cfg.callbacks.emit_pre_tool_content(&pending.preamble);
        self.executed_calls.extend(pending.calls.clone());

        if self.cfg.cancel.is_cancelled() {
            return Ok(Some(self.abort(AbortReason::User)));
        }

        let context = ToolContext {
            raw_text: pending.raw.clone(),
            preamble: pending.preamble.clone(),
            depth: self.guarded_transitions,
            prior_results: self.executed_results.clone(),
            accumulated_text: self.accumulated.clone(),
            cancel: self.cfg.cancel.clone(),
        };

        let waited = wait_on(
            self.cfg
                .callbacks
                .execute_tool_calls(pending.calls.clone(), context),
            &self.cfg.cancel,
            None,
        )
        .await;
        let results = match waited {
            Waited::Done(result) => result?,
            Waited::Cancelled | Waited::TimedOut => {
                return Ok(Some(self.abort(AbortReason::User)));
            }
        };
        if self.cfg.cancel.is_cancelled() {
            return Ok(Some(self.abort(AbortReason::User)));
        }

        self.executed_results.extend(results.clone());

        let formatted = format::format_results(&results, &self.cfg.grammar);
        for segment in formatted.segments {
            match segment {
                ResultSegment::Text(text) => self.ingest_structural(&text),
                ResultSegment::ImageBreak(images) => {
                    self.splits.push(TurnSplit {
                        offset: self.accumulated.len(),
                        images,
                    });
                }
            }
        }

        Ok(None)
    }

    /// Native-mode tool execution. `None` means: loop again.
    async fn native_tool_round(
        &mut self,
        response: &BackendResponse,
    ) -> Result<Option<StreamOutcome>> {
        let calls: Vec<ToolUseBlock> = response
            .content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse(call) => Some(call.clone()),
                _ => None,
            })
            .collect();

        self.native_content.extend(response.content.clone());

        if calls.is_empty() || self.depth_exhausted() {
            return Ok(Some(self.complete(
                response.stop_reason,
                response.stop_sequence.clone(),
            )?));
        }
        self.guarded_transitions += 1;

        let preamble: String = response
            .content
            .iter()
            .filter_map(|b| b.as_text())
            .collect();
        self.cfg.callbacks.emit_pre_tool_content(&preamble);
        self.executed_calls.extend(calls.clone());

        let context = ToolContext {
            raw_text: String::new(),
            preamble,
            depth: self.guarded_transitions,
            prior_results: self.executed_results.clone(),
            accumulated_text: self.accumulated.clone(),
            cancel: self.cfg.cancel.clone(),
        };

        let waited = wait_on(
            self.cfg.callbacks.execute_tool_calls(calls, context),
            &self.cfg.cancel,
            None,
        )
        .await;
        let results = match waited {
            Waited::Done(result) => result?,
            Waited::Cancelled | Waited::TimedOut => {
                return Ok(Some(self.abort(AbortReason::User)));
            }
        };
        if self.cfg.cancel.is_cancelled() {
            return Ok(Some(self.abort(AbortReason::User)));
        }

        self.executed_results.extend(results.clone());

        self.native_extra.push(BackendMessage::blocks(
            Role::Assistant,
            response.content.clone(),
        ));
        self.native_extra.push(BackendMessage::blocks(
            Role::User,
            results.into_iter().map(ContentBlock::ToolResult).collect(),
        ));

        Ok(None)
    }

    fn native_request(&self) -> BackendRequest {
        let mut request = prefill::build_backend_request(
            self.request,
            &self.cfg.grammar,
            "",
            &[],
            false,
            self.cfg.backend.max_stop_sequences(),
        );
        request.messages.extend(self.native_extra.iter().cloned());
        request.tools = self.request.tools().to_vec();
        request
    }

    fn complete(
        &mut self,
        stop_reason: StopReason,
        stop_sequence: Option<String>,
    ) -> Result<StreamOutcome> {
        let final_emissions = self.parser.finalize();
        self.route(final_emissions);

        let content = if self.native {
            self.native_content.clone()
        } else {
            extract::content_blocks_from_text(&self.accumulated, &self.cfg.grammar)
        };

        // The block list is canonical; the orchestrator's own executed
        // lists back it up when parsing yields nothing (e.g. native mode).
        let mut tool_calls: Vec<ToolUseBlock> = content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse(c) => Some(c.clone()),
                _ => None,
            })
            .collect();
        let mut tool_results: Vec<ToolResultBlock> = content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolResult(r) => Some(r.clone()),
                _ => None,
            })
            .collect();
        if tool_calls.is_empty() {
            tool_calls = self.executed_calls.clone();
        }
        if tool_results.is_empty() {
            tool_results = self.executed_results.clone();
        }

        Ok(StreamOutcome::Complete(FinalResponse {
            content,
            stop_reason,
            stop_sequence,
            usage: self.usage,
            model: self.model_used.clone(),
            iterations: self.iterations,
            elapsed: self.started.elapsed(),
            tool_calls,
            tool_results,
            raw_assistant_text: self.accumulated.clone(),
        }))
    }

    fn abort(&mut self, reason: AbortReason) -> StreamOutcome {
        debug!(?reason, "stream aborted");
        let content = if self.native {
            self.native_content.clone()
        } else {
            extract::content_blocks_from_text(&self.accumulated, &self.cfg.grammar)
        };
        StreamOutcome::Aborted(AbortedResponse {
            content,
            usage: self.usage,
            tool_calls: self.executed_calls.clone(),
            tool_results: self.executed_results.clone(),
            reason,
            raw_assistant_text: self.accumulated.clone(),
        })
    }
}
