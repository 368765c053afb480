//! Prefill and continuation request building.
//!
//! Produces a backend-ready request whose final assistant turn is exactly
//! the prefill string, so the backend continues generating from that
//! position. On the first iteration the prefill is the assistant-turn
//! preface (participant label in multi-party conversations, plus the
//! thinking-open tag when thinking prefill is enabled); on continuation
//! iterations it is the preface plus the entire accumulated text.
//!
//! When split-turn image injection is active, the assistant turn is broken
//! at each recorded split point: assistant text up to the split, a
//! synthetic user turn carrying only the images, then the next assistant
//! segment, with the preface appearing only on the first segment.

use crate::grammar::TagGrammar;
use crate::transport::{BackendContent, BackendMessage, BackendRequest, Role};
use crate::types::{ContentBlock, ImageBlock, Request};

/// A split point inside accumulated text: everything before `offset`
/// belongs to the previous assistant segment; the images ride in a
/// synthetic user turn at that position.
#[derive(Debug, Clone)]
pub struct TurnSplit {
    pub offset: usize,
    pub images: Vec<ImageBlock>,
}

/// The assistant-turn preface for this request.
///
/// Multi-party conversations (more than one distinct non-assistant
/// participant) label the assistant turn with its name, mirroring the
/// `{name}: ` prefixes on the other participants' text. The preface never
/// carries structural tags: when thinking prefill is enabled, the
/// orchestrator injects the thinking-open tag into accumulated text
/// instead (see [`preface_structural_suffix`]), so the parser's depth
/// tracking and the prefill stay in agreement by construction.
pub fn assistant_preface(request: &Request) -> String {
    let mut preface = String::new();
    if is_multi_party(request) {
        preface.push_str(request.assistant_name());
        preface.push_str(": ");
    }
    preface
}

/// The structural text seeding the first iteration's accumulated text:
/// the thinking-open tag, when thinking prefill is enabled.
pub fn preface_structural_suffix(request: &Request, grammar: &TagGrammar) -> Option<String> {
    request
        .prefill_thinking()
        .then(|| grammar.thinking_open())
}

fn is_multi_party(request: &Request) -> bool {
    let mut first: Option<&str> = None;
    for message in request.messages() {
        let name = message.participant.as_str();
        if name == request.assistant_name() {
            continue;
        }
        match first {
            None => first = Some(name),
            Some(seen) if seen != name => return true,
            Some(_) => {}
        }
    }
    false
}

/// Stop sequences for one backend round-trip: one `\n{name}:` per
/// non-assistant participant (in order of first appearance) plus the
/// structural tool-call close tag when structural tool parsing is active.
/// Truncated to the backend's advertised cap; the close tag always
/// survives truncation.
pub fn stop_sequences(
    request: &Request,
    grammar: &TagGrammar,
    structural_tools: bool,
    cap: Option<usize>,
) -> Vec<String> {
    let mut stops = Vec::new();
    if structural_tools {
        stops.push(grammar.tool_call_close());
    }

    let mut seen: Vec<&str> = Vec::new();
    for message in request.messages() {
        let name = message.participant.as_str();
        if name == request.assistant_name() || seen.contains(&name) {
            continue;
        }
        seen.push(name);
        stops.push(format!("\n{}:", name));
    }

    if let Some(cap) = cap {
        stops.truncate(cap);
    }
    stops
}

/// Build the continuation request for one structural-mode iteration.
///
/// `accumulated` is the full accumulated text so far (empty on the first
/// iteration); `splits` are the recorded image turn breaks, ordered by
/// offset.
pub fn build_backend_request(
    request: &Request,
    grammar: &TagGrammar,
    accumulated: &str,
    splits: &[TurnSplit],
    structural_tools: bool,
    stop_cap: Option<usize>,
) -> BackendRequest {
    let multi_party = is_multi_party(request);
    let mut messages: Vec<BackendMessage> = Vec::new();

    for message in request.messages() {
        if message.is_empty() {
            continue;
        }
        let role = if message.participant == request.assistant_name() {
            Role::Assistant
        } else {
            Role::User
        };

        let content = participant_content(message_content(message), role, &message.participant, multi_party);
        push_merged(&mut messages, BackendMessage { role, content });
    }

    // The prefill: assistant segments interleaved with synthetic image
    // turns at each split point.
    let preface = assistant_preface(request);
    let mut cursor = 0usize;
    let mut first_segment = true;
    for split in splits {
        let segment = &accumulated[cursor..split.offset];
        let text = if first_segment {
            format!("{}{}", preface, segment)
        } else {
            segment.to_string()
        };
        first_segment = false;
        push_merged(&mut messages, BackendMessage::text(Role::Assistant, text));

        let image_blocks = split
            .images
            .iter()
            .cloned()
            .map(ContentBlock::Image)
            .collect();
        messages.push(BackendMessage::blocks(Role::User, image_blocks));
        cursor = split.offset;
    }

    let tail = &accumulated[cursor..];
    let tail_text = if first_segment {
        format!("{}{}", preface, tail)
    } else {
        tail.to_string()
    };
    // Backend quirk: trailing whitespace on the final assistant prefill is
    // rejected.
    let tail_text = tail_text.trim_end().to_string();
    if !tail_text.is_empty() || !first_segment {
        push_merged(&mut messages, BackendMessage::text(Role::Assistant, tail_text));
    }

    BackendRequest {
        model: request.model().to_string(),
        messages,
        system: request.system().cloned(),
        max_tokens: request.max_tokens(),
        temperature: request.temperature(),
        stop_sequences: stop_sequences(request, grammar, structural_tools, stop_cap),
        tools: Vec::new(),
        cache_hints: request.cache_hints(),
    }
}

fn message_content(message: &crate::types::Message) -> BackendContent {
    let has_non_text = message
        .content
        .iter()
        .any(|b| b.as_text().is_none());
    if has_non_text {
        BackendContent::Blocks(message.content.clone())
    } else {
        BackendContent::Text(message.text_content())
    }
}

/// Prefix non-assistant text with `{name}: ` in multi-party conversations.
fn participant_content(
    content: BackendContent,
    role: Role,
    participant: &str,
    multi_party: bool,
) -> BackendContent {
    if !multi_party || role == Role::Assistant {
        return content;
    }
    match content {
        BackendContent::Text(text) => {
            BackendContent::Text(format!("{}: {}", participant, text))
        }
        BackendContent::Blocks(mut blocks) => {
            // Prefix the first text block; media blocks pass through.
            for block in blocks.iter_mut() {
                if let ContentBlock::Text(t) = block {
                    t.text = format!("{}: {}", participant, t.text);
                    break;
                }
            }
            BackendContent::Blocks(blocks)
        }
    }
}

/// Append a message, merging consecutive same-role turns.
fn push_merged(messages: &mut Vec<BackendMessage>, message: BackendMessage) {
    if let Some(last) = messages.last_mut() {
        if last.role == message.role {
            match (&mut last.content, message.content) {
                (BackendContent::Text(a), BackendContent::Text(b)) => {
                    if a.is_empty() {
                        *a = b;
                    } else if !b.is_empty() {
                        a.push_str("\n\n");
                        a.push_str(&b);
                    }
                    return;
                }
                (BackendContent::Blocks(a), BackendContent::Blocks(b)) => {
                    a.extend(b);
                    return;
                }
                (BackendContent::Blocks(a), BackendContent::Text(b)) => {
                    a.push(ContentBlock::text(b));
                    return;
                }
                (BackendContent::Text(a), BackendContent::Blocks(b)) => {
                    let mut blocks = vec![ContentBlock::text(std::mem::take(a))];
                    blocks.extend(b);
                    last.content = BackendContent::Blocks(blocks);
                    return;
                }
            }
        }
    }
    messages.push(message);
}
