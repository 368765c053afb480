//! Incremental structural parser.
//!
//! Consumes arbitrary UTF-8 chunks of the assistant's character stream and
//! produces, in causal order, **content pieces** (text with metadata) and
//! **block boundary events**. Structural tags never surface as content.
//!
//! # The two challenges
//!
//! 1. **Tags cross chunk boundaries.** A chunk may end in the middle of
//!    `<thinking>`. The parser buffers from `<` until it can decide whether
//!    the buffered characters are a recognized structural tag (process as a
//!    boundary, emit nothing) or ordinary text (flush as content under the
//!    current block).
//!
//! 2. **Nesting must not multiply blocks.** The consumer sees at most one
//!    open block at a time. Outer region tags (`thinking`,
//!    `function_calls`, `function_results`) open and close consumer
//!    blocks; nested sub-tags (`invoke`, `parameter`, `result`, `error`)
//!    and same-tag re-entry only move depth counters.
//!
//! # Ordering guarantee
//!
//! Concatenating the `text` of every emitted piece reproduces exactly the
//! non-tag characters of the input, in order. Block events interleave with
//! pieces consistently with tag positions: a `Start` precedes every piece
//! of its block, which precede its `Complete`.
//!
//! Malformed input (unmatched closes, unknown `<…>` constructs, tags left
//! open at end of stream) degrades to content emission or a final
//! [`finalize`](StructuralParser::finalize) close. The parser never fails.

use crate::grammar::{RegionKind, TagGrammar, TagKind};
use crate::types::BlockType;
use std::collections::VecDeque;
use std::sync::Arc;

/// One content piece with consumer metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentPiece {
    /// The literal characters, tag-free.
    pub text: String,
    /// Innermost active region type (`Text` outside all regions).
    pub block_type: BlockType,
    /// True exactly when `block_type` is `Text`.
    pub visible: bool,
    /// Index of the consumer block this piece belongs to.
    pub block_index: usize,
    /// `max(tool_call_depth, tool_result_depth)` at emission time.
    pub depth: u32,
    /// Name of the enclosing `parameter` sub-tag, when inside one.
    pub tool_call_part: Option<String>,
}

/// A consumer block boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockEvent {
    Start {
        index: usize,
        block_type: BlockType,
    },
    Complete {
        index: usize,
        block_type: BlockType,
        /// Concatenation of every piece emitted into this block.
        content: String,
        /// First invocation's tool name, filled by the orchestrator for
        /// tool-call blocks.
        tool_name: Option<String>,
        /// First invocation's id, filled by the orchestrator.
        tool_id: Option<String>,
        /// First invocation's input, filled by the orchestrator.
        input: Option<serde_json::Value>,
    },
}

impl BlockEvent {
    pub fn index(&self) -> usize {
        match self {
            BlockEvent::Start { index, .. } | BlockEvent::Complete { index, .. } => *index,
        }
    }
}

/// One parser output in causal order.
#[derive(Debug, Clone, PartialEq)]
pub enum Emission {
    Piece(ContentPiece),
    Event(BlockEvent),
}

impl From<RegionKind> for BlockType {
    fn from(kind: RegionKind) -> Self {
        match kind {
            RegionKind::Thinking => BlockType::Thinking,
            RegionKind::ToolCall => BlockType::ToolCall,
            RegionKind::ToolResult => BlockType::ToolResult,
        }
    }
}

#[derive(Debug)]
struct OpenBlock {
    index: usize,
    block_type: BlockType,
    content: String,
}

/// The incremental parser. One instance per `stream()` invocation.
pub struct StructuralParser {
    grammar: Arc<TagGrammar>,

    // Partial-tag buffer. Non-empty iff we are mid-tag; always starts '<'.
    // Once the name is recognized, `in_attrs` is set and `attr_quote`
    // tracks quoting so '>' inside attribute values does not end the tag.
    tag_buffer: String,
    in_attrs: bool,
    attr_quote: Option<char>,

    // Independent region depth counters, clamped at zero.
    thinking_depth: u32,
    tool_call_depth: u32,
    tool_result_depth: u32,

    // Region type context: pushed on 0→1 crossings, popped on 1→0.
    type_stack: Vec<BlockType>,

    // At most one open consumer block.
    current: Option<OpenBlock>,
    next_index: usize,

    // Innermost open parameter sub-tag names, for piece metadata.
    param_stack: Vec<String>,

    finalized: bool,

    // Pass-through mode (native tools): every character is plain text.
    pass_through: bool,
}

impl StructuralParser {
    pub fn new(grammar: Arc<TagGrammar>) -> Self {
        Self {
            grammar,
            tag_buffer: String::new(),
            in_attrs: false,
            attr_quote: None,
            thinking_depth: 0,
            tool_call_depth: 0,
            tool_result_depth: 0,
            type_stack: Vec::new(),
            current: None,
            next_index: 0,
            param_stack: Vec::new(),
            finalized: false,
            pass_through: false,
        }
    }

    /// A parser that treats every character as visible text (native tool
    /// mode, where the backend speaks the tool protocol itself).
    pub fn pass_through(grammar: Arc<TagGrammar>) -> Self {
        let mut parser = Self::new(grammar);
        parser.pass_through = true;
        parser
    }

    /// True while any region depth counter is above zero.
    pub fn inside_any_block(&self) -> bool {
        self.thinking_depth > 0 || self.tool_call_depth > 0 || self.tool_result_depth > 0
    }

    /// Clears the partial-tag buffer for a continuation iteration.
    /// Depth counters, the type context and the block index survive: the
    /// accumulated text legitimately carries unclosed regions mid-loop.
    pub fn reset_for_iteration(&mut self) {
        self.tag_buffer.clear();
        self.in_attrs = false;
        self.attr_quote = None;
    }

    /// Feed one chunk; returns pieces and events in causal order.
    pub fn feed(&mut self, chunk: &str) -> Vec<Emission> {
        let mut out = Vec::new();
        let mut run = String::new();

        if self.pass_through {
            if !chunk.is_empty() {
                self.emit_content(chunk, &mut out, &mut run);
                self.flush_run(&mut out, &mut run);
            }
            return out;
        }

        let mut queue: VecDeque<char> = chunk.chars().collect();
        while let Some(ch) = queue.pop_front() {
            self.step(ch, &mut queue, &mut out, &mut run);
        }
        self.flush_run(&mut out, &mut run);
        out
    }

    /// Flush any half-buffered tag as content and close the open block.
    /// Safe to call once; later calls return nothing.
    pub fn finalize(&mut self) -> Vec<Emission> {
        if self.finalized {
            return Vec::new();
        }
        self.finalized = true;

        let mut out = Vec::new();
        let mut run = String::new();

        if !self.tag_buffer.is_empty() {
            let buffered = std::mem::take(&mut self.tag_buffer);
            self.in_attrs = false;
            self.attr_quote = None;
            self.emit_content(&buffered, &mut out, &mut run);
        }
        self.flush_run(&mut out, &mut run);

        if let Some(block) = self.current.take() {
            out.push(Emission::Event(complete_event(block)));
        }
        out
    }

    // ------------------------------------------------------------------
    // character machine
    // ------------------------------------------------------------------

    fn step(
        &mut self,
        ch: char,
        queue: &mut VecDeque<char>,
        out: &mut Vec<Emission>,
        run: &mut String,
    ) {
        if self.tag_buffer.is_empty() {
            if ch == '<' {
                self.flush_run(out, run);
                self.tag_buffer.push('<');
            } else {
                self.emit_char(ch, out, run);
            }
            return;
        }

        // Mid-tag.
        self.tag_buffer.push(ch);

        if self.in_attrs {
            match self.attr_quote {
                Some(q) => {
                    if ch == q {
                        self.attr_quote = None;
                    }
                }
                None => {
                    if ch == '"' || ch == '\'' {
                        self.attr_quote = Some(ch);
                    } else if ch == '>' {
                        self.in_attrs = false;
                        let (closing, kind) = {
                            let (closing, name) = split_tag(&self.tag_buffer);
                            (closing, self.grammar.classify(name))
                        };
                        // Classification already succeeded when the name
                        // completed; re-derive the kind from the raw text.
                        match kind {
                            Some(kind) => {
                                let raw = std::mem::take(&mut self.tag_buffer);
                                self.boundary(kind, closing, &raw, out, run);
                            }
                            None => self.reject_buffer(queue, out, run),
                        }
                    }
                }
            }
            return;
        }

        if ch == '>' {
            // Name terminated by '>': `<name>` or `</name>`.
            let (closing, kind) = {
                let (closing, name) = split_tag(&self.tag_buffer);
                (closing, self.grammar.classify(name))
            };
            match kind {
                Some(kind) => {
                    let raw = std::mem::take(&mut self.tag_buffer);
                    self.boundary(kind, closing, &raw, out, run);
                }
                None => self.reject_buffer(queue, out, run),
            }
        } else if ch.is_whitespace() {
            // Name complete; attributes follow.
            let known = {
                let (_, name) = split_tag_unterminated(&self.tag_buffer);
                self.grammar.classify(name).is_some()
            };
            if known {
                self.in_attrs = true;
                self.attr_quote = None;
            } else {
                self.reject_buffer(queue, out, run);
            }
        } else if ch == '<' {
            // A fresh '<' invalidates the buffer; rescan from it.
            self.reject_buffer(queue, out, run);
        } else {
            let viable = {
                let (_, name) = split_tag_unterminated(&self.tag_buffer);
                self.grammar.is_name_prefix(name)
            };
            if !viable {
                self.reject_buffer(queue, out, run);
            }
        }
    }

    /// The buffer cannot be a structural tag: emit its leading `<` as
    /// content and rescan the rest, so constructs like `<<thinking>` still
    /// recognize the inner tag.
    fn reject_buffer(
        &mut self,
        queue: &mut VecDeque<char>,
        out: &mut Vec<Emission>,
        run: &mut String,
    ) {
        let buffered = std::mem::take(&mut self.tag_buffer);
        self.in_attrs = false;
        self.attr_quote = None;

        let mut chars = buffered.chars();
        if let Some(first) = chars.next() {
            self.emit_char(first, out, run);
        }
        // Requeue the remainder ahead of the unread input.
        for ch in chars.rev() {
            queue.push_front(ch);
        }
    }

    // ------------------------------------------------------------------
    // boundaries
    // ------------------------------------------------------------------

    fn boundary(
        &mut self,
        kind: TagKind,
        closing: bool,
        raw: &str,
        out: &mut Vec<Emission>,
        run: &mut String,
    ) {
        self.flush_run(out, run);
        let region = kind.region();

        match (kind, closing) {
            (TagKind::Region(_), false) => {
                let depth = self.depth_mut(region);
                *depth += 1;
                if *depth == 1 {
                    // 0→1 crossing opens a consumer block.
                    if let Some(block) = self.current.take() {
                        out.push(Emission::Event(complete_event(block)));
                    }
                    let block_type: BlockType = region.into();
                    self.type_stack.push(block_type);
                    self.open_block(block_type, out);
                }
            }
            (TagKind::Region(_), true) => {
                let depth = self.depth_mut(region);
                if *depth == 0 {
                    // Unmatched close: clamp and degrade to content.
                    self.emit_content(raw, out, run);
                    self.flush_run(out, run);
                    return;
                }
                *depth -= 1;
                if *depth == 0 {
                    if let Some(block) = self.current.take() {
                        out.push(Emission::Event(complete_event(block)));
                    }
                    let block_type: BlockType = region.into();
                    if let Some(pos) = self.type_stack.iter().rposition(|t| *t == block_type) {
                        self.type_stack.remove(pos);
                    }
                    if region == RegionKind::ToolCall {
                        // Unclosed parameter sub-tags die with their region.
                        self.param_stack.clear();
                    }
                }
            }
            (TagKind::Sub(_), false) => {
                *self.depth_mut(region) += 1;
                if region == RegionKind::ToolCall {
                    if let Some(name) = attr_value(raw, "name") {
                        if tag_name_is(raw, self.grammar.parameter_name(), self.grammar.prefix()) {
                            self.param_stack.push(name);
                        }
                    }
                }
            }
            (TagKind::Sub(_), true) => {
                let depth = self.depth_mut(region);
                if *depth == 0 {
                    self.emit_content(raw, out, run);
                    self.flush_run(out, run);
                    return;
                }
                *depth -= 1;
                if region == RegionKind::ToolCall
                    && tag_name_is(raw, self.grammar.parameter_name(), self.grammar.prefix())
                {
                    self.param_stack.pop();
                }
            }
        }
    }

    fn depth_mut(&mut self, region: RegionKind) -> &mut u32 {
        match region {
            RegionKind::Thinking => &mut self.thinking_depth,
            RegionKind::ToolCall => &mut self.tool_call_depth,
            RegionKind::ToolResult => &mut self.tool_result_depth,
        }
    }

    // ------------------------------------------------------------------
    // content emission
    // ------------------------------------------------------------------

    fn current_type(&self) -> BlockType {
        self.type_stack.last().copied().unwrap_or(BlockType::Text)
    }

    fn open_block(&mut self, block_type: BlockType, out: &mut Vec<Emission>) {
        let index = self.next_index;
        self.next_index += 1;
        out.push(Emission::Event(BlockEvent::Start { index, block_type }));
        self.current = Some(OpenBlock {
            index,
            block_type,
            content: String::new(),
        });
    }

    fn emit_char(&mut self, ch: char, out: &mut Vec<Emission>, run: &mut String) {
        self.ensure_block(out);
        run.push(ch);
    }

    fn emit_content(&mut self, text: &str, out: &mut Vec<Emission>, run: &mut String) {
        if text.is_empty() {
            return;
        }
        self.ensure_block(out);
        run.push_str(text);
    }

    /// First content character implicitly opens a block of the current type.
    fn ensure_block(&mut self, out: &mut Vec<Emission>) {
        if self.current.is_none() {
            self.open_block(self.current_type(), out);
        }
    }

    fn flush_run(&mut self, out: &mut Vec<Emission>, run: &mut String) {
        if run.is_empty() {
            return;
        }
        let text = std::mem::take(run);
        let block = self
            .current
            .as_mut()
            .expect("content run always has an open block");
        block.content.push_str(&text);

        let block_type = block.block_type;
        let block_index = block.index;
        out.push(Emission::Piece(ContentPiece {
            text,
            block_type,
            visible: block_type.visible(),
            block_index,
            depth: self.tool_call_depth.max(self.tool_result_depth),
            tool_call_part: self.param_stack.last().cloned(),
        }));
    }
}

fn complete_event(block: OpenBlock) -> BlockEvent {
    BlockEvent::Complete {
        index: block.index,
        block_type: block.block_type,
        content: block.content,
        tool_name: None,
        tool_id: None,
        input: None,
    }
}

/// Split a complete `<…>` buffer into (closing?, name).
fn split_tag(buffer: &str) -> (bool, &str) {
    let inner = buffer
        .strip_prefix('<')
        .and_then(|s| s.strip_suffix('>'))
        .unwrap_or(buffer);
    split_inner(inner)
}

/// Same for a buffer still missing its trailing `>`.
fn split_tag_unterminated(buffer: &str) -> (bool, &str) {
    let inner = buffer.strip_prefix('<').unwrap_or(buffer);
    split_inner(inner)
}

fn split_inner(inner: &str) -> (bool, &str) {
    let (closing, rest) = match inner.strip_prefix('/') {
        Some(rest) => (true, rest),
        None => (false, inner),
    };
    let name = rest
        .split(|c: char| c.is_whitespace())
        .next()
        .unwrap_or(rest);
    (closing, name)
}

/// Whether a raw tag's name equals `expected` (optionally prefixed).
fn tag_name_is(raw: &str, expected: &str, prefix: Option<&str>) -> bool {
    let (_, name) = split_tag(raw);
    if name == expected {
        return true;
    }
    prefix.is_some_and(|p| {
        name.strip_prefix(p)
            .and_then(|rest| rest.strip_prefix(':'))
            == Some(expected)
    })
}

/// Extract a double- or single-quoted attribute value from a raw tag.
pub(crate) fn attr_value(raw: &str, attr: &str) -> Option<String> {
    let needle = format!("{}=", attr);
    let start = raw.find(&needle)? + needle.len();
    let rest = &raw[start..];
    let quote = rest.chars().next()?;
    if quote != '"' && quote != '\'' {
        return None;
    }
    let body = &rest[1..];
    let end = body.find(quote)?;
    Some(body[..end].to_string())
}
