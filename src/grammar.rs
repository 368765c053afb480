//! Structural wire grammar: the tag language the parser recognizes.
//!
//! The middleware does not hardcode a tool protocol; it is parameterized by
//! a small, fixed set of opening/closing tag pairs described here. Three
//! regions exist:
//!
//! - a **thinking** region (`<thinking>…</thinking>`),
//! - a **tool-call** region (`<function_calls>…</function_calls>`) whose
//!   nested `invoke`/`parameter` sub-tags are structural but never open
//!   consumer-visible blocks,
//! - a **tool-result** region (`<function_results>…</function_results>`)
//!   with `result`/`error` sub-tags under the same rule.
//!
//! Tag names may optionally carry a namespace prefix (e.g. `<ns:thinking>`);
//! when a prefix is configured, both prefixed and unprefixed forms are
//! accepted on input. Output always uses the unprefixed canonical form.
//!
//! Result text travels entity-escaped: the five XML entities
//! (`&amp; &lt; &gt; &quot; &#39;`).

use std::sync::Arc;

/// The three structural region families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionKind {
    Thinking,
    ToolCall,
    ToolResult,
}

/// Classification of a recognized tag name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKind {
    /// Outer region tag: opens/closes a consumer-visible block.
    Region(RegionKind),
    /// Nested structural sub-tag: moves its region's depth counter only.
    Sub(RegionKind),
}

impl TagKind {
    pub fn region(&self) -> RegionKind {
        match self {
            TagKind::Region(r) | TagKind::Sub(r) => *r,
        }
    }
}

/// Configurable tag vocabulary.
///
/// Construct with [`TagGrammar::default()`] for the standard grammar, or
/// through [`TagGrammar::builder()`] to rename tags or attach a namespace
/// prefix. Cloning is cheap once wrapped in the `Arc` the parser holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagGrammar {
    prefix: Option<String>,
    thinking: String,
    tool_call: String,
    invoke: String,
    parameter: String,
    tool_result: String,
    result: String,
    error: String,
}

impl Default for TagGrammar {
    fn default() -> Self {
        Self {
            prefix: None,
            thinking: "thinking".to_string(),
            tool_call: "function_calls".to_string(),
            invoke: "invoke".to_string(),
            parameter: "parameter".to_string(),
            tool_result: "function_results".to_string(),
            result: "result".to_string(),
            error: "error".to_string(),
        }
    }
}

impl TagGrammar {
    /// Creates a builder seeded with the default vocabulary.
    pub fn builder() -> TagGrammarBuilder {
        TagGrammarBuilder {
            grammar: TagGrammar::default(),
        }
    }

    /// The configured namespace prefix, if any.
    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    /// Canonical opening tag for the thinking region.
    pub fn thinking_open(&self) -> String {
        format!("<{}>", self.thinking)
    }

    /// Canonical closing tag for the thinking region.
    pub fn thinking_close(&self) -> String {
        format!("</{}>", self.thinking)
    }

    /// Canonical opening tag for the tool-call region.
    pub fn tool_call_open(&self) -> String {
        format!("<{}>", self.tool_call)
    }

    /// Canonical closing tag for the tool-call region. This string doubles
    /// as the stop sequence that interrupts generation for tool execution.
    pub fn tool_call_close(&self) -> String {
        format!("</{}>", self.tool_call)
    }

    /// Canonical opening tag for the tool-result region.
    pub fn tool_result_open(&self) -> String {
        format!("<{}>", self.tool_result)
    }

    /// Canonical closing tag for the tool-result region.
    pub fn tool_result_close(&self) -> String {
        format!("</{}>", self.tool_result)
    }

    /// Opening tag for one invocation, e.g. `<invoke name="add">`.
    pub fn invoke_open(&self, tool_name: &str) -> String {
        format!("<{} name=\"{}\">", self.invoke, escape(tool_name))
    }

    pub fn invoke_close(&self) -> String {
        format!("</{}>", self.invoke)
    }

    /// Opening tag for one parameter, e.g. `<parameter name="a">`.
    pub fn parameter_open(&self, param_name: &str) -> String {
        format!("<{} name=\"{}\">", self.parameter, escape(param_name))
    }

    pub fn parameter_close(&self) -> String {
        format!("</{}>", self.parameter)
    }

    /// Opening tag for one result, e.g. `<result tool_use_id="call_1">`.
    /// `is_error` selects the error sub-tag instead.
    pub fn result_open(&self, tool_use_id: &str, is_error: bool) -> String {
        let name = if is_error { &self.error } else { &self.result };
        format!("<{} tool_use_id=\"{}\">", name, escape(tool_use_id))
    }

    pub fn result_close(&self, is_error: bool) -> String {
        let name = if is_error { &self.error } else { &self.result };
        format!("</{}>", name)
    }

    /// Bare name of the invoke sub-tag (used by the extractor's scans).
    pub fn invoke_name(&self) -> &str {
        &self.invoke
    }

    pub fn parameter_name(&self) -> &str {
        &self.parameter
    }

    pub fn result_name(&self) -> &str {
        &self.result
    }

    pub fn error_name(&self) -> &str {
        &self.error
    }

    /// Classify a bare tag name (no angle brackets, no attributes, no
    /// leading slash). Accepts the prefixed form when a prefix is set.
    pub fn classify(&self, name: &str) -> Option<TagKind> {
        let bare = match &self.prefix {
            Some(p) => name
                .strip_prefix(p.as_str())
                .and_then(|rest| rest.strip_prefix(':'))
                .unwrap_or(name),
            None => name,
        };

        if bare == self.thinking {
            Some(TagKind::Region(RegionKind::Thinking))
        } else if bare == self.tool_call {
            Some(TagKind::Region(RegionKind::ToolCall))
        } else if bare == self.tool_result {
            Some(TagKind::Region(RegionKind::ToolResult))
        } else if bare == self.invoke || bare == self.parameter {
            Some(TagKind::Sub(RegionKind::ToolCall))
        } else if bare == self.result || bare == self.error {
            Some(TagKind::Sub(RegionKind::ToolResult))
        } else {
            None
        }
    }

    /// Whether `partial` could still grow into a recognized tag name.
    /// Drives the parser's buffering decision: once this returns false the
    /// buffered characters flush as ordinary content.
    pub fn is_name_prefix(&self, partial: &str) -> bool {
        self.candidate_names()
            .any(|candidate| candidate.starts_with(partial))
    }

    /// Every acceptable tag-name spelling (prefixed and unprefixed).
    fn candidate_names(&self) -> impl Iterator<Item = String> + '_ {
        let bare = [
            &self.thinking,
            &self.tool_call,
            &self.invoke,
            &self.parameter,
            &self.tool_result,
            &self.result,
            &self.error,
        ];
        bare.into_iter().flat_map(move |name| {
            let prefixed = self
                .prefix
                .as_ref()
                .map(|p| format!("{}:{}", p, name));
            std::iter::once(name.clone()).chain(prefixed)
        })
    }

    /// All opening-tag and closing-tag literals this grammar can produce,
    /// in both spellings. Used by leakage tests, not by the hot path.
    pub fn tag_literals(&self) -> Vec<String> {
        let mut out = Vec::new();
        for name in self.candidate_names() {
            out.push(format!("<{}>", name));
            out.push(format!("</{}>", name));
        }
        out
    }

    /// Shared handle for the parser and extractor.
    pub fn into_shared(self) -> Arc<TagGrammar> {
        Arc::new(self)
    }
}

/// Builder for a customized [`TagGrammar`].
pub struct TagGrammarBuilder {
    grammar: TagGrammar,
}

impl TagGrammarBuilder {
    /// Attach a namespace prefix; both `<name>` and `<prefix:name>` will
    /// then be accepted on input.
    pub fn namespace(mut self, prefix: impl Into<String>) -> Self {
        self.grammar.prefix = Some(prefix.into());
        self
    }

    pub fn thinking(mut self, name: impl Into<String>) -> Self {
        self.grammar.thinking = name.into();
        self
    }

    pub fn tool_call(mut self, name: impl Into<String>) -> Self {
        self.grammar.tool_call = name.into();
        self
    }

    pub fn tool_result(mut self, name: impl Into<String>) -> Self {
        self.grammar.tool_result = name.into();
        self
    }

    pub fn build(self) -> TagGrammar {
        self.grammar
    }
}

/// Escape the five XML entities in result/attribute text.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

/// Reverse [`escape`]. Unrecognized entity-like sequences pass through
/// untouched.
pub fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let replaced = [
            ("&amp;", '&'),
            ("&lt;", '<'),
            ("&gt;", '>'),
            ("&quot;", '"'),
            ("&#39;", '\''),
            ("&apos;", '\''),
        ]
        .iter()
        .find_map(|(entity, ch)| tail.strip_prefix(entity).map(|r| (*ch, r)));

        match replaced {
            Some((ch, remaining)) => {
                out.push(ch);
                rest = remaining;
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tag_rendering() {
        let g = TagGrammar::default();
        assert_eq!(g.thinking_open(), "<thinking>");
        assert_eq!(g.tool_call_close(), "</function_calls>");
        assert_eq!(g.invoke_open("add"), "<invoke name=\"add\">");
        assert_eq!(
            g.result_open("call_1", false),
            "<result tool_use_id=\"call_1\">"
        );
        assert_eq!(g.result_open("call_1", true), "<error tool_use_id=\"call_1\">");
    }

    #[test]
    fn test_classify_regions_and_subs() {
        let g = TagGrammar::default();
        assert_eq!(
            g.classify("thinking"),
            Some(TagKind::Region(RegionKind::Thinking))
        );
        assert_eq!(
            g.classify("function_calls"),
            Some(TagKind::Region(RegionKind::ToolCall))
        );
        assert_eq!(g.classify("invoke"), Some(TagKind::Sub(RegionKind::ToolCall)));
        assert_eq!(
            g.classify("result"),
            Some(TagKind::Sub(RegionKind::ToolResult))
        );
        assert_eq!(g.classify("b"), None);
        assert_eq!(g.classify("think"), None);
    }

    #[test]
    fn test_classify_accepts_prefixed_and_unprefixed() {
        let g = TagGrammar::builder().namespace("ns").build();
        assert_eq!(
            g.classify("ns:thinking"),
            Some(TagKind::Region(RegionKind::Thinking))
        );
        assert_eq!(
            g.classify("thinking"),
            Some(TagKind::Region(RegionKind::Thinking))
        );
        assert_eq!(g.classify("other:thinking"), None);
    }

    #[test]
    fn test_name_prefix_matching() {
        let g = TagGrammar::default();
        assert!(g.is_name_prefix("thi"));
        assert!(g.is_name_prefix("function_"));
        assert!(g.is_name_prefix(""));
        assert!(!g.is_name_prefix("b"));
        assert!(!g.is_name_prefix("thinkingx"));
    }

    #[test]
    fn test_name_prefix_with_namespace() {
        let g = TagGrammar::builder().namespace("ns").build();
        assert!(g.is_name_prefix("ns"));
        assert!(g.is_name_prefix("ns:fun"));
        assert!(!g.is_name_prefix("nx"));
    }

    #[test]
    fn test_escape_roundtrip() {
        let raw = r#"a < b && c > "d" with 'quotes'"#;
        let escaped = escape(raw);
        assert!(!escaped.contains('<'));
        assert!(!escaped.contains('>'));
        assert_eq!(unescape(&escaped), raw);
    }

    #[test]
    fn test_unescape_passes_unknown_entities() {
        assert_eq!(unescape("&nbsp; &amp; x"), "&nbsp; & x");
        assert_eq!(unescape("&apos;tis"), "'tis");
        assert_eq!(unescape("trailing &"), "trailing &");
    }
}
