//! Model output sanitization.
//!
//! Local models leak two kinds of noise into their output: chain-of-thought
//! wrapped in `<think>...</think>` tags, and chat-template control tokens of
//! the form `<|...|>` (e.g. `<|eot_id|>`). Both are stripped before text
//! reaches clients. The streaming filter works incrementally so a tag split
//! across token boundaries is still caught.

use regex::Regex;
use std::sync::OnceLock;

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";
const CONTROL_OPEN: &str = "<|";
const CONTROL_CLOSE: &str = "|>";

/// A `<|` run longer than this cannot be a control token; emit it verbatim.
const MAX_CONTROL_LEN: usize = 64;

/// Incremental filter over a token stream.
#[derive(Debug, Default)]
pub struct TokenSanitizer {
    buf: String,
    in_think: bool,
}

impl TokenSanitizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one raw chunk; returns the part that may be shown now. Text that
    /// could be the start of a tag is held back until it resolves.
    pub fn feed(&mut self, chunk: &str) -> String {
        self.buf.push_str(chunk);
        let mut out = String::new();

        loop {
            if self.in_think {
                if let Some(idx) = self.buf.find(THINK_CLOSE) {
                    self.buf.drain(..idx + THINK_CLOSE.len());
                    self.in_think = false;
                    continue;
                }
                // Drop consumed reasoning, keep only a tail that might be
                // the beginning of the closing tag.
                let keep = longest_suffix_prefix(&self.buf, THINK_CLOSE);
                let cut = self.buf.len() - keep;
                self.buf.drain(..cut);
                return out;
            }

            let Some(idx) = self.buf.find('<') else {
                out.push_str(&self.buf);
                self.buf.clear();
                return out;
            };
            out.push_str(&self.buf[..idx]);
            self.buf.drain(..idx);

            if self.buf.starts_with(THINK_OPEN) {
                self.buf.drain(..THINK_OPEN.len());
                self.in_think = true;
                continue;
            }
            if THINK_OPEN.starts_with(self.buf.as_str()) {
                // Partial opening tag at the end of input; wait for more.
                return out;
            }
            if self.buf.starts_with(CONTROL_OPEN) {
                if let Some(end) = self.buf.find(CONTROL_CLOSE) {
                    self.buf.drain(..end + CONTROL_CLOSE.len());
                    continue;
                }
                if self.buf.len() < MAX_CONTROL_LEN {
                    return out;
                }
                // Too long for a control token; fall through as literal text.
            }

            out.push('<');
            self.buf.drain(..1);
        }
    }

    /// Flush at end of stream. An unclosed think block is dropped; a held
    /// partial tag turns out to be literal text and is returned.
    pub fn finish(&mut self) -> String {
        if self.in_think {
            self.buf.clear();
            self.in_think = false;
            return String::new();
        }
        std::mem::take(&mut self.buf)
    }
}

/// How many trailing bytes of `haystack` form a prefix of `needle`.
fn longest_suffix_prefix(haystack: &str, needle: &str) -> usize {
    let max = needle.len().saturating_sub(1).min(haystack.len());
    for len in (1..=max).rev() {
        if !haystack.is_char_boundary(haystack.len() - len) {
            continue;
        }
        if needle.starts_with(&haystack[haystack.len() - len..]) {
            return len;
        }
    }
    0
}

/// Compiled once; the pattern is static.
fn control_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<\|[^|>]*\|>").expect("control token pattern"))
}

/// One-shot sanitization of a complete reply.
pub fn sanitize_text(text: &str) -> String {
    let mut sanitizer = TokenSanitizer::new();
    let mut out = sanitizer.feed(text);
    out.push_str(&sanitizer.finish());

    let out = control_token_re().replace_all(&out, "").into_owned();
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(chunks: &[&str]) -> String {
        let mut sanitizer = TokenSanitizer::new();
        let mut out = String::new();
        for chunk in chunks {
            out.push_str(&sanitizer.feed(chunk));
        }
        out.push_str(&sanitizer.finish());
        out
    }

    #[test]
    fn test_passthrough() {
        assert_eq!(feed_all(&["hello ", "world"]), "hello world");
    }

    #[test]
    fn test_strips_think_block() {
        assert_eq!(feed_all(&["a<think>hidden</think>b"]), "ab");
    }

    #[test]
    fn test_strips_think_block_split_across_chunks() {
        assert_eq!(
            feed_all(&["a<thi", "nk>hid", "den</th", "ink>b"]),
            "ab"
        );
    }

    #[test]
    fn test_unclosed_think_dropped_at_finish() {
        assert_eq!(feed_all(&["visible<think>never closed"]), "visible");
    }

    #[test]
    fn test_literal_angle_bracket_preserved() {
        assert_eq!(feed_all(&["2 < 3 and <b>bold</b>"]), "2 < 3 and <b>bold</b>");
    }

    #[test]
    fn test_partial_tag_at_end_is_literal() {
        assert_eq!(feed_all(&["x<th"]), "x<th");
    }

    #[test]
    fn test_strips_control_tokens() {
        assert_eq!(feed_all(&["hi<|eot_id|>"]), "hi");
        assert_eq!(feed_all(&["a<|start_header_id|>b"]), "ab");
    }

    #[test]
    fn test_control_token_split_across_chunks() {
        assert_eq!(feed_all(&["hi<|eot", "_id|> there"]), "hi there");
    }

    #[test]
    fn test_sanitize_text_full_pass() {
        let raw = "<think>let me plan</think>The answer is 4.<|eot_id|>";
        assert_eq!(sanitize_text(raw), "The answer is 4.");
    }

    #[test]
    fn test_sanitize_text_trims() {
        assert_eq!(sanitize_text("  spaced out  "), "spaced out");
    }
}
