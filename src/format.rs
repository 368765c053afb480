//! Tool-result serialization back into the structural wire language.
//!
//! Handler results become a `function_results` region the parser (and the
//! backend, which sees it as prefill text) understands. Text content is
//! entity-escaped; error results use the grammar's error sub-tag.
//!
//! # Split-turn image injection
//!
//! Backends reject image content inside assistant turns, but structural
//! tool results live in the assistant's own text. When a result carries
//! images, the region is therefore split mid-result: the text portion ends
//! the assistant turn inside an unclosed result tag, a synthetic user turn
//! carries the images, and a following assistant turn prefills the closing
//! tags. [`format_results`] expresses this as an ordered segment list; the
//! orchestrator appends text segments to accumulated text and records a
//! split point at each image break.

use crate::grammar::{self, TagGrammar};
use crate::types::{ContentBlock, ImageBlock, ResultContent, ToolResultBlock};

/// One piece of the serialized results region.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultSegment {
    /// Structural text, appended to accumulated text and fed to the parser.
    Text(String),
    /// A turn break carrying images for the synthetic user message.
    ImageBreak(Vec<ImageBlock>),
}

/// Serialized results, in wire order.
#[derive(Debug, Clone)]
pub struct FormattedResults {
    pub segments: Vec<ResultSegment>,
}

impl FormattedResults {
    /// Whether any segment breaks the assistant turn for images.
    pub fn has_image_break(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, ResultSegment::ImageBreak(_)))
    }

    /// The full structural text, ignoring image breaks. Useful in tests
    /// and for the no-image fast path.
    pub fn structural_text(&self) -> String {
        self.segments
            .iter()
            .filter_map(|s| match s {
                ResultSegment::Text(t) => Some(t.as_str()),
                ResultSegment::ImageBreak(_) => None,
            })
            .collect()
    }
}

/// Serialize handler results into a results region.
///
/// The output never ends in whitespace so that the trailing-whitespace
/// strip on prefills cannot desynchronize accumulated text from the
/// backend's view of it.
pub fn format_results(results: &[ToolResultBlock], grammar: &TagGrammar) -> FormattedResults {
    let mut segments = Vec::new();
    let mut text = String::new();

    text.push('\n');
    text.push_str(&grammar.tool_result_open());

    for result in results {
        text.push('\n');
        text.push_str(&grammar.result_open(&result.tool_use_id, result.is_error));

        match &result.content {
            ResultContent::Text(t) => {
                text.push_str(&grammar::escape(t));
            }
            ResultContent::Blocks(blocks) => {
                let mut pending_images: Vec<ImageBlock> = Vec::new();
                for block in blocks {
                    match block {
                        ContentBlock::Text(t) => {
                            text.push_str(&grammar::escape(&t.text));
                        }
                        ContentBlock::Image(image) => {
                            pending_images.push(image.clone());
                        }
                        // Other block kinds are flattened to their text
                        // form; tools returning structured content should
                        // use text or image items.
                        other => {
                            if let Some(t) = other.as_text() {
                                text.push_str(&grammar::escape(t));
                            }
                        }
                    }
                }
                if !pending_images.is_empty() {
                    // Break the turn inside the unclosed result tag.
                    segments.push(ResultSegment::Text(std::mem::take(&mut text)));
                    segments.push(ResultSegment::ImageBreak(pending_images));
                    text.push('\n');
                }
            }
        }

        text.push_str(&grammar.result_close(result.is_error));
    }

    text.push('\n');
    text.push_str(&grammar.tool_result_close());
    segments.push(ResultSegment::Text(text));

    FormattedResults { segments }
}
