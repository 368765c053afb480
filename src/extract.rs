//! Tool-call extraction and accumulated-text assembly.
//!
//! The extractor operates on raw accumulated text (which, unlike parser
//! output, still carries the structural tags). It answers two questions:
//!
//! 1. Which tool-call region, if any, still needs executing? The **last**
//!    region not already followed by a results region. Already-satisfied
//!    regions are never re-executed.
//! 2. What does the whole accumulated text mean as ordered content blocks?
//!    The canonical final-assembly parse used to build responses.
//!
//! Tool-use ids are derived from the invocation's ordinal position across
//! the whole text (`call_1`, `call_2`, …), so re-parsing the same text
//! reproduces the same ids.

use crate::grammar::{self, RegionKind, TagGrammar, TagKind};
use crate::parser::attr_value;
use crate::types::{ContentBlock, ResultContent, ThinkingBlock, ToolResultBlock, ToolUseBlock};

/// How much whitespace may separate a tool-call close tag from the results
/// region that satisfies it.
const RESULT_LOOKAHEAD_BYTES: usize = 64;

/// A tool-call region awaiting execution.
#[derive(Debug, Clone)]
pub struct PendingInvocation {
    /// Parsed calls, in order. May be empty for an empty region.
    pub calls: Vec<ToolUseBlock>,
    /// Raw text preceding the region (since the previous region boundary).
    pub preamble: String,
    /// The raw region text, tags included.
    pub raw: String,
    /// Byte offset of the region's opening tag in the scanned text.
    pub open_idx: usize,
    /// Byte offset one past the region's closing tag.
    pub close_end: usize,
}

/// A raw tag located in text.
#[derive(Debug, Clone)]
struct RawTag {
    start: usize,
    end: usize,
    closing: bool,
    kind: TagKind,
    raw: String,
}

/// Scan for the next recognized structural tag at or after `from`.
fn next_tag(text: &str, from: usize, grammar: &TagGrammar) -> Option<RawTag> {
    let mut search = from;
    while let Some(rel) = text[search..].find('<') {
        let start = search + rel;
        if let Some(tag) = tag_at(text, start, grammar) {
            return Some(tag);
        }
        search = start + 1;
    }
    None
}

/// Try to read a recognized tag starting exactly at `start`.
fn tag_at(text: &str, start: usize, grammar: &TagGrammar) -> Option<RawTag> {
    let bytes = text.as_bytes();
    debug_assert_eq!(bytes[start], b'<');

    let mut i = start + 1;
    let closing = bytes.get(i) == Some(&b'/');
    if closing {
        i += 1;
    }

    let name_start = i;
    while i < bytes.len() {
        let b = bytes[i];
        if b == b'>' || b.is_ascii_whitespace() {
            break;
        }
        i += 1;
    }
    let name = &text[name_start..i];
    let kind = grammar.classify(name)?;

    // Consume attributes, honoring quotes, until the closing '>'.
    let mut in_quote: Option<u8> = None;
    while i < bytes.len() {
        let b = bytes[i];
        match in_quote {
            Some(q) => {
                if b == q {
                    in_quote = None;
                }
            }
            None => {
                if b == b'"' || b == b'\'' {
                    in_quote = Some(b);
                } else if b == b'>' {
                    return Some(RawTag {
                        start,
                        end: i + 1,
                        closing,
                        kind,
                        raw: text[start..i + 1].to_string(),
                    });
                }
            }
        }
        i += 1;
    }
    None
}

/// Find the matching close for a region opened at `open`, tolerating
/// same-name nesting. Returns `(close_start, close_end)`.
fn matching_close(
    text: &str,
    open: &RawTag,
    grammar: &TagGrammar,
) -> Option<(usize, usize)> {
    let region = open.kind.region();
    let mut depth = 1u32;
    let mut from = open.end;
    while let Some(tag) = next_tag(text, from, grammar) {
        from = tag.end;
        if tag.kind != TagKind::Region(region) {
            continue;
        }
        if tag.closing {
            depth -= 1;
            if depth == 0 {
                return Some((tag.start, tag.end));
            }
        } else {
            depth += 1;
        }
    }
    None
}

/// Whether a results region follows `close_end` within the whitespace
/// lookahead window.
fn followed_by_results(text: &str, close_end: usize, grammar: &TagGrammar) -> bool {
    let mut candidate = close_end;
    for ch in text[close_end..].chars() {
        if !ch.is_whitespace() || candidate - close_end >= RESULT_LOOKAHEAD_BYTES {
            break;
        }
        candidate += ch.len_utf8();
    }
    if candidate >= text.len() || text.as_bytes()[candidate] != b'<' {
        return false;
    }
    matches!(
        tag_at(text, candidate, grammar),
        Some(RawTag {
            closing: false,
            kind: TagKind::Region(RegionKind::ToolResult),
            ..
        })
    )
}

/// Find the last complete tool-call region lacking a following results
/// region, and parse its invocations.
pub fn extract_pending(text: &str, grammar: &TagGrammar) -> Option<PendingInvocation> {
    let mut from = 0;
    let mut pending: Option<(RawTag, usize, usize, usize)> = None; // (open, close_start, close_end, prev_boundary)
    let mut prev_boundary = 0;

    while let Some(tag) = next_tag(text, from, grammar) {
        if tag.closing || !matches!(tag.kind, TagKind::Region(_)) {
            from = tag.end;
            continue;
        }
        let Some((close_start, close_end)) = matching_close(text, &tag, grammar) else {
            // Unterminated region; nothing complete to execute past here.
            break;
        };
        let boundary_before = prev_boundary;
        prev_boundary = close_end;
        from = close_end;

        if tag.kind == TagKind::Region(RegionKind::ToolCall)
            && !followed_by_results(text, close_end, grammar)
        {
            pending = Some((tag, close_start, close_end, boundary_before));
        }
    }

    let (open, close_start, close_end, boundary_before) = pending?;
    let body = &text[open.end..close_start];
    let mut ordinal = count_invokes(&text[..open.start], grammar);
    let calls = parse_invocations(body, grammar, &mut ordinal);

    Some(PendingInvocation {
        calls,
        preamble: text[boundary_before..open.start].to_string(),
        raw: text[open.start..close_end].to_string(),
        open_idx: open.start,
        close_end,
    })
}

/// Parse the calls of the **last complete** tool-call region, satisfied or
/// not. Used to enrich the block-complete event that fires when a region's
/// close tag is consumed.
pub fn last_region_calls(text: &str, grammar: &TagGrammar) -> Vec<ToolUseBlock> {
    let mut from = 0;
    let mut last: Option<(RawTag, usize)> = None;
    while let Some(tag) = next_tag(text, from, grammar) {
        if !tag.closing && tag.kind == TagKind::Region(RegionKind::ToolCall) {
            if let Some((close_start, close_end)) = matching_close(text, &tag, grammar) {
                from = close_end;
                last = Some((tag, close_start));
                continue;
            }
        }
        from = tag.end;
    }

    let Some((open, close_start)) = last else {
        return Vec::new();
    };
    let mut ordinal = count_invokes(&text[..open.start], grammar);
    parse_invocations(&text[open.end..close_start], grammar, &mut ordinal)
}

/// Count invoke opens before a point, for deterministic id assignment.
fn count_invokes(text: &str, grammar: &TagGrammar) -> usize {
    let mut count = 0;
    let mut from = 0;
    while let Some(tag) = next_tag(text, from, grammar) {
        from = tag.end;
        if !tag.closing
            && tag.kind == TagKind::Sub(RegionKind::ToolCall)
            && is_invoke(&tag, grammar)
        {
            count += 1;
        }
    }
    count
}

fn is_invoke(tag: &RawTag, grammar: &TagGrammar) -> bool {
    tag_bare_name(&tag.raw, grammar) == grammar.invoke_name()
}

fn is_parameter(tag: &RawTag, grammar: &TagGrammar) -> bool {
    tag_bare_name(&tag.raw, grammar) == grammar.parameter_name()
}

/// Bare tag name with any namespace prefix stripped.
fn tag_bare_name<'a>(raw: &'a str, grammar: &TagGrammar) -> &'a str {
    let inner = raw.trim_start_matches('<').trim_start_matches('/');
    let name_end = inner
        .find(|c: char| c.is_whitespace() || c == '>')
        .unwrap_or(inner.len());
    let name = &inner[..name_end];
    match grammar.prefix() {
        Some(p) => name
            .strip_prefix(p)
            .and_then(|rest| rest.strip_prefix(':'))
            .unwrap_or(name),
        None => name,
    }
}

/// Parse the invocations inside a tool-call region body.
///
/// `ordinal` is the running invoke count across the whole text; ids come
/// out as `call_{ordinal}` (1-based).
pub fn parse_invocations(
    body: &str,
    grammar: &TagGrammar,
    ordinal: &mut usize,
) -> Vec<ToolUseBlock> {
    let mut calls = Vec::new();
    let mut from = 0;

    while let Some(tag) = next_tag(body, from, grammar) {
        from = tag.end;
        if tag.closing || tag.kind != TagKind::Sub(RegionKind::ToolCall) || !is_invoke(&tag, grammar)
        {
            continue;
        }

        let name = attr_value(&tag.raw, "name").unwrap_or_default();
        let close = find_sub_close(body, tag.end, grammar, grammar.invoke_name());
        let inner_end = close.map(|(s, _)| s).unwrap_or(body.len());
        let inner = &body[tag.end..inner_end];

        let mut input = serde_json::Map::new();
        let mut param_from = 0;
        while let Some(ptag) = next_tag(inner, param_from, grammar) {
            param_from = ptag.end;
            if ptag.closing || !is_parameter(&ptag, grammar) {
                continue;
            }
            let pname = attr_value(&ptag.raw, "name").unwrap_or_default();
            let pclose = find_sub_close(inner, ptag.end, grammar, grammar.parameter_name());
            let pvalue_end = pclose.map(|(s, _)| s).unwrap_or(inner.len());
            let raw_value = &inner[ptag.end..pvalue_end];
            input.insert(pname, coerce_parameter(raw_value));
            if let Some((_, e)) = pclose {
                param_from = e;
            }
        }

        *ordinal += 1;
        calls.push(ToolUseBlock::new(
            format!("call_{}", ordinal),
            name,
            serde_json::Value::Object(input),
        ));

        if let Some((_, e)) = close {
            from = e;
        }
    }

    calls
}

/// Find the close tag of a specific sub-tag name, no nesting assumed.
fn find_sub_close(
    text: &str,
    from: usize,
    grammar: &TagGrammar,
    name: &str,
) -> Option<(usize, usize)> {
    let mut search = from;
    while let Some(tag) = next_tag(text, search, grammar) {
        search = tag.end;
        if tag.closing && tag_bare_name(&tag.raw, grammar) == name {
            return Some((tag.start, tag.end));
        }
    }
    None
}

/// Parameter values that lex as JSON scalars or containers become typed
/// values; everything else is an entity-unescaped string.
fn coerce_parameter(raw: &str) -> serde_json::Value {
    let trimmed = raw.trim();
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if !matches!(value, serde_json::Value::String(_)) {
            return value;
        }
    }
    serde_json::Value::String(grammar::unescape(trimmed))
}

/// Parse a results region body into tool-result blocks.
pub fn parse_results_region(body: &str, grammar: &TagGrammar) -> Vec<ToolResultBlock> {
    let mut results = Vec::new();
    let mut from = 0;

    while let Some(tag) = next_tag(body, from, grammar) {
        from = tag.end;
        if tag.closing || tag.kind != TagKind::Sub(RegionKind::ToolResult) {
            continue;
        }
        let bare = tag_bare_name(&tag.raw, grammar);
        let is_error = bare == grammar.error_name();
        let id = attr_value(&tag.raw, "tool_use_id").unwrap_or_default();
        let close = find_sub_close(body, tag.end, grammar, bare);
        let inner_end = close.map(|(s, _)| s).unwrap_or(body.len());
        let content = grammar::unescape(body[tag.end..inner_end].trim());

        let mut block = ToolResultBlock::new(id, ResultContent::Text(content));
        block.is_error = is_error;
        results.push(block);

        if let Some((_, e)) = close {
            from = e;
        }
    }

    results
}

/// The canonical accumulated-text → ordered blocks parse.
///
/// Text between regions becomes text blocks; thinking regions become
/// thinking blocks; tool-call regions expand to one tool-use block per
/// invocation; results regions expand to tool-result blocks. An
/// unterminated region at the end of text is parsed as if closed there.
pub fn content_blocks_from_text(text: &str, grammar: &TagGrammar) -> Vec<ContentBlock> {
    let mut blocks = Vec::new();
    let mut idx = 0;
    let mut ordinal = 0;

    loop {
        // Advance to the next region open, treating everything else
        // (including stray sub-tags and unmatched closes) as text.
        let mut open = None;
        let mut search = idx;
        while let Some(tag) = next_tag(text, search, grammar) {
            if !tag.closing && matches!(tag.kind, TagKind::Region(_)) {
                open = Some(tag);
                break;
            }
            search = tag.end;
        }

        let Some(open) = open else {
            push_text(&mut blocks, &text[idx..]);
            break;
        };

        push_text(&mut blocks, &text[idx..open.start]);

        let (body, next_idx) = match matching_close(text, &open, grammar) {
            Some((close_start, close_end)) => (&text[open.end..close_start], close_end),
            None => (&text[open.end..], text.len()),
        };

        match open.kind.region() {
            RegionKind::Thinking => {
                blocks.push(ContentBlock::Thinking(ThinkingBlock::new(body)));
            }
            RegionKind::ToolCall => {
                let calls = parse_invocations(body, grammar, &mut ordinal);
                blocks.extend(calls.into_iter().map(ContentBlock::ToolUse));
            }
            RegionKind::ToolResult => {
                let results = parse_results_region(body, grammar);
                blocks.extend(results.into_iter().map(ContentBlock::ToolResult));
            }
        }

        idx = next_idx;
        if idx >= text.len() {
            break;
        }
    }

    blocks
}

/// Whitespace-only runs between regions are formatting, not content.
fn push_text(blocks: &mut Vec<ContentBlock>, text: &str) {
    if !text.trim().is_empty() {
        blocks.push(ContentBlock::text(text));
    }
}
