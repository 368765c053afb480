//! Consumer API surface: the process-wide middleware handle.
//!
//! A [`Middleware`] wraps one backend transport and is created once per
//! process; every [`stream`](Middleware::stream) or
//! [`complete`](Middleware::complete) call owns its own parser,
//! accumulated-text buffer and orchestrator state, so concurrent calls on
//! the same handle are independent.

use crate::events::StreamCallbacks;
use crate::grammar::TagGrammar;
use crate::orchestrator::{self, RunConfig};
use crate::retry::RetryConfig;
use crate::transport::{Backend, CancelToken};
use crate::types::{FinalResponse, Request, StreamOutcome};
use crate::Result;
use std::sync::Arc;
use std::time::Duration;

/// Default bound on combined tool-execution and false-stop-resume
/// transitions per `stream()` call.
pub const DEFAULT_MAX_TOOL_DEPTH: u32 = 10;

/// Per-call options: callbacks, cancellation, timeout and loop bounds.
///
/// # Examples
///
/// ```rust,no_run
/// use midstream::{StreamOptions, StreamCallbacks, CancelToken};
/// use std::time::Duration;
///
/// let cancel = CancelToken::new();
/// let options = StreamOptions::new()
///     .callbacks(StreamCallbacks::new().on_chunk(|p| print!("{}", p.text)))
///     .cancel(cancel.clone())
///     .iteration_timeout(Duration::from_secs(120))
///     .max_tool_depth(5);
/// # let _ = options;
/// ```
#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub callbacks: StreamCallbacks,
    pub cancel: CancelToken,
    /// Bound on one backend round-trip. Total `stream()` wall time is
    /// unbounded by design: tools may legitimately take long.
    pub iteration_timeout: Option<Duration>,
    pub max_tool_depth: u32,
    pub retry: RetryConfig,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            callbacks: StreamCallbacks::new(),
            cancel: CancelToken::new(),
            iteration_timeout: None,
            max_tool_depth: DEFAULT_MAX_TOOL_DEPTH,
            retry: RetryConfig::default(),
        }
    }
}

impl StreamOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callbacks(mut self, callbacks: StreamCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn iteration_timeout(mut self, timeout: Duration) -> Self {
        self.iteration_timeout = Some(timeout);
        self
    }

    pub fn max_tool_depth(mut self, depth: u32) -> Self {
        self.max_tool_depth = depth;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

/// The middleware handle.
///
/// # Examples
///
/// ```rust,no_run
/// use midstream::{Middleware, OpenAiBackend, Request, Message, StreamOptions};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = OpenAiBackend::builder()
///     .base_url("http://localhost:1234/v1")
///     .build()?;
/// let middleware = Middleware::new(backend);
///
/// let request = Request::builder()
///     .model("qwen2.5-32b-instruct")
///     .message(Message::text("User", "hello"))
///     .build()?;
///
/// let outcome = middleware.stream(&request, StreamOptions::new()).await?;
/// println!("{}", outcome.expect_complete().text());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Middleware {
    backend: Arc<dyn Backend>,
    grammar: Arc<TagGrammar>,
}

impl Middleware {
    /// Wrap a backend with the default structural grammar.
    pub fn new(backend: impl Backend + 'static) -> Self {
        Self {
            backend: Arc::new(backend),
            grammar: TagGrammar::default().into_shared(),
        }
    }

    /// Wrap an already-shared backend.
    pub fn from_arc(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            grammar: TagGrammar::default().into_shared(),
        }
    }

    /// Replace the structural grammar (tag names, namespace prefix).
    pub fn with_grammar(mut self, grammar: TagGrammar) -> Self {
        self.grammar = grammar.into_shared();
        self
    }

    pub fn grammar(&self) -> &TagGrammar {
        &self.grammar
    }

    /// One round-trip, no tool loop. Structural regions in the response
    /// are still parsed into typed blocks.
    pub async fn complete(
        &self,
        request: &Request,
        options: StreamOptions,
    ) -> Result<FinalResponse> {
        let cfg = self.run_config(options);
        orchestrator::run_complete(request, &cfg).await
    }

    /// The full streaming tool loop. Cancellation returns
    /// [`StreamOutcome::Aborted`] through the normal path; `Err` is
    /// reserved for genuine failures.
    pub async fn stream(&self, request: &Request, options: StreamOptions) -> Result<StreamOutcome> {
        let cfg = self.run_config(options);
        orchestrator::run_stream(request, &cfg).await
    }

    fn run_config(&self, options: StreamOptions) -> RunConfig {
        RunConfig {
            backend: self.backend.clone(),
            grammar: self.grammar.clone(),
            callbacks: options.callbacks,
            cancel: options.cancel,
            iteration_timeout: options.iteration_timeout,
            max_tool_depth: options.max_tool_depth,
            retry: options.retry,
        }
    }
}

impl std::fmt::Debug for Middleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Middleware")
            .field("grammar", &self.grammar)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_defaults() {
        let options = StreamOptions::default();
        assert_eq!(options.max_tool_depth, DEFAULT_MAX_TOOL_DEPTH);
        assert!(options.iteration_timeout.is_none());
        assert!(!options.cancel.is_cancelled());
    }

    #[test]
    fn options_builder_chains() {
        let options = StreamOptions::new()
            .iteration_timeout(Duration::from_secs(30))
            .max_tool_depth(3);
        assert_eq!(options.iteration_timeout, Some(Duration::from_secs(30)));
        assert_eq!(options.max_tool_depth, 3);
    }
}
