// src/tools/extractor.rs
//! Streaming fragment extractor for tag-wrapped JSON tool calls:
//!
//! ```text
//! <tool_call>
//! {"name": "get_weather", "arguments": {"city": "Berlin"}}
//! </tool_call>
//! ```

use super::stream::{ExtractContext, FragmentExtractor};
use super::{generate_tool_call_id, DeltaMessage, DeltaToolCall};
use crate::error::Result;
use crate::utils::config::ToolStreamConfig;
use once_cell::sync::Lazy;
use regex::Regex;

static NAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""name"\s*:\s*"((?:[^"\\]|\\.)*)""#).expect("valid name regex"));
static ARGUMENTS_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""arguments"\s*:\s*"#).expect("valid arguments regex"));

#[derive(Debug, Clone, Default)]
struct BlockProgress {
    name_sent: bool,
    streamed_args: usize,
}

/// Body of one `<start>...<end>` region; runs to the end of text while open.
struct Block<'a> {
    body: &'a str,
}

#[derive(Debug, Clone)]
pub struct TaggedJsonExtractor {
    start_tag: String,
    end_tag: String,
    blocks: Vec<BlockProgress>,
    content_sent: usize,
}

impl Default for TaggedJsonExtractor {
    fn default() -> Self {
        let config = ToolStreamConfig::default();
        Self {
            start_tag: config.start_tag,
            end_tag: config.end_tag,
            blocks: Vec::new(),
            content_sent: 0,
        }
    }
}

impl TaggedJsonExtractor {
    /// Fails on an empty start or end tag.
    pub fn new(start_tag: impl Into<String>, end_tag: impl Into<String>) -> Result<Self> {
        Self::from_config(&ToolStreamConfig {
            start_tag: start_tag.into(),
            end_tag: end_tag.into(),
            ..Default::default()
        })
    }

    pub fn from_config(config: &ToolStreamConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            start_tag: config.start_tag.clone(),
            end_tag: config.end_tag.clone(),
            blocks: Vec::new(),
            content_sent: 0,
        })
    }

    /// Split `text` into tool blocks and the content around them. A trailing
    /// partial start tag is withheld from content.
    fn split<'a>(&self, text: &'a str) -> (Vec<Block<'a>>, String) {
        let mut blocks = Vec::new();
        let mut content = String::new();
        let mut cursor = 0;
        while let Some(start_rel) = text[cursor..].find(&self.start_tag) {
            content.push_str(&text[cursor..cursor + start_rel]);
            let body_start = cursor + start_rel + self.start_tag.len();
            match text[body_start..].find(&self.end_tag) {
                Some(end_rel) => {
                    blocks.push(Block {
                        body: &text[body_start..body_start + end_rel],
                    });
                    cursor = body_start + end_rel + self.end_tag.len();
                }
                None => {
                    blocks.push(Block {
                        body: &text[body_start..],
                    });
                    return (blocks, content);
                }
            }
        }
        let tail = &text[cursor..];
        let held = partial_suffix_len(tail, &self.start_tag);
        content.push_str(&tail[..tail.len() - held]);
        (blocks, content)
    }

    fn block_fragment(&mut self, index: usize, block: &Block<'_>) -> Option<DeltaToolCall> {
        if self.blocks.len() <= index {
            self.blocks.resize_with(index + 1, BlockProgress::default);
        }
        let progress = &mut self.blocks[index];
        let mut fragment = DeltaToolCall::new(index);
        let mut touched = false;

        let args = ARGUMENTS_REGEX.find(block.body).map(|m| {
            let value = &block.body[m.end()..];
            (m.start(), m.end(), object_extent(value))
        });

        if !progress.name_sent {
            let name_region = match args {
                Some((key_start, value_start, Some(extent))) if extent.closed => {
                    // name may precede or follow the arguments object
                    find_name(&block.body[..key_start])
                        .or_else(|| find_name(&block.body[value_start + extent.len..]))
                }
                Some((key_start, _, _)) => find_name(&block.body[..key_start]),
                None => find_name(block.body),
            };
            if let Some(name) = name_region {
                progress.name_sent = true;
                fragment = fragment
                    .id(generate_tool_call_id())
                    .tool_type("function")
                    .name(name);
                touched = true;
            }
        }

        if let Some((_, value_start, Some(extent))) = args {
            let value = &block.body[value_start..];
            if extent.len > progress.streamed_args {
                fragment = fragment.arguments(&value[progress.streamed_args..extent.len]);
                progress.streamed_args = extent.len;
                touched = true;
            }
        }

        touched.then_some(fragment)
    }
}

impl FragmentExtractor for TaggedJsonExtractor {
    fn extract(&mut self, ctx: &ExtractContext<'_>) -> Result<Option<DeltaMessage>> {
        let (blocks, content) = self.split(ctx.current_text);

        let mut message = DeltaMessage::default();
        if content.len() > self.content_sent {
            if let Some(new_content) = content.get(self.content_sent..) {
                message.content = Some(new_content.to_string());
                self.content_sent = content.len();
            }
        }

        for (index, block) in blocks.iter().enumerate() {
            if let Some(fragment) = self.block_fragment(index, block) {
                message.tool_calls.push(fragment);
            }
        }

        if message.content.is_none() && message.tool_calls.is_empty() {
            Ok(None)
        } else {
            Ok(Some(message))
        }
    }

    fn reset(&mut self) {
        self.blocks.clear();
        self.content_sent = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ObjectExtent {
    /// Bytes of the object visible so far.
    len: usize,
    closed: bool,
}

/// Visible extent of a JSON object at the start of `value` (after leading
/// whitespace), stopping after the brace that closes it. None when the value
/// is not an object or nothing is visible yet.
fn object_extent(value: &str) -> Option<ObjectExtent> {
    let offset = value.len() - value.trim_start().len();
    let trimmed = &value[offset..];
    if !trimmed.starts_with('{') {
        return None;
    }
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in trimmed.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(ObjectExtent {
                        len: offset + i + 1,
                        closed: true,
                    });
                }
            }
            _ => {}
        }
    }
    Some(ObjectExtent {
        len: value.len(),
        closed: false,
    })
}

fn find_name(region: &str) -> Option<String> {
    let raw = NAME_REGEX.captures(region)?.get(1)?.as_str();
    Some(
        serde_json::from_str::<String>(&format!("\"{raw}\""))
            .unwrap_or_else(|_| raw.to_string()),
    )
}

/// Length of the longest suffix of `text` that is a proper prefix of `tag`.
fn partial_suffix_len(text: &str, tag: &str) -> usize {
    (1..tag.len().min(text.len() + 1))
        .rev()
        .find(|&n| {
            text.is_char_boundary(text.len() - n) && tag.starts_with(&text[text.len() - n..])
        })
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HookError;
    use crate::tools::accumulator::ToolCallAccumulator;

    /// Feed `chunks` as successive deltas, returning each step's message.
    fn run(extractor: &mut TaggedJsonExtractor, chunks: &[&str]) -> Vec<Option<DeltaMessage>> {
        let mut text = String::new();
        let mut out = Vec::new();
        for chunk in chunks {
            let previous = text.clone();
            text.push_str(chunk);
            let ctx = ExtractContext {
                previous_text: &previous,
                current_text: &text,
                delta_text: chunk,
                previous_token_ids: &[],
                current_token_ids: &[],
                delta_token_ids: &[],
            };
            out.push(extractor.extract(&ctx).unwrap());
        }
        out
    }

    fn args_of(message: &Option<DeltaMessage>) -> String {
        message
            .as_ref()
            .map(|m| {
                m.tool_calls
                    .iter()
                    .filter_map(|c| c.function.as_ref()?.arguments.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    #[test]
    fn test_object_extent() {
        assert_eq!(object_extent(""), None);
        assert_eq!(object_extent("\"str\""), None);
        assert_eq!(
            object_extent(r#"{"a": "}"} tail"#),
            Some(ObjectExtent {
                len: 10,
                closed: true
            })
        );
        assert_eq!(
            object_extent(r#" {"a": {"#),
            Some(ObjectExtent {
                len: 8,
                closed: false
            })
        );
    }

    #[test]
    fn test_partial_suffix_len() {
        assert_eq!(partial_suffix_len("hello <tool", "<tool_call>"), 5);
        assert_eq!(partial_suffix_len("hello", "<tool_call>"), 0);
        assert_eq!(partial_suffix_len("x<", "<tool_call>"), 1);
        assert_eq!(partial_suffix_len("é", "<tool_call>"), 0);
    }

    #[test]
    fn test_streams_name_then_arguments() {
        let mut extractor = TaggedJsonExtractor::default();
        let out = run(
            &mut extractor,
            &[
                "<tool_call>\n",
                r#"{"name": "get_"#,
                r#"weather", "arguments": {"ci"#,
                r#"ty": "Berlin"}"#,
                "}\n</tool_call>",
            ],
        );
        assert!(out[0].is_none());
        assert!(out[1].is_none());

        let step = out[2].as_ref().unwrap();
        let first = &step.tool_calls[0];
        assert_eq!(first.index, 0);
        assert!(first.id.as_ref().unwrap().starts_with("call_"));
        assert_eq!(first.tool_type.as_deref(), Some("function"));
        assert_eq!(first.function.as_ref().unwrap().name.as_deref(), Some("get_weather"));

        let streamed: String = out.iter().map(args_of).collect();
        assert_eq!(streamed, r#"{"city": "Berlin"}"#);
        // the outer `}` and end tag produce nothing
        assert!(out[4].is_none());
    }

    #[test]
    fn test_content_outside_blocks() {
        let mut extractor = TaggedJsonExtractor::default();
        let out = run(&mut extractor, &["Let me check. <tool", "_call>{\"name\""]);
        assert_eq!(
            out[0].as_ref().unwrap().content.as_deref(),
            Some("Let me check. ")
        );
        assert!(out[1].is_none());
    }

    #[test]
    fn test_multiple_blocks_get_distinct_indices() {
        let mut extractor = TaggedJsonExtractor::default();
        let text = concat!(
            r#"<tool_call>{"name": "a", "arguments": {"x": 1}}</tool_call>"#,
            r#"<tool_call>{"arguments": {"y": {"z": 2}}, "name": "b"}</tool_call>"#
        );
        let out = run(&mut extractor, &[text]);
        let calls = &out[0].as_ref().unwrap().tool_calls;
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].index, 0);
        assert_eq!(calls[1].index, 1);
        assert_eq!(calls[1].function.as_ref().unwrap().name.as_deref(), Some("b"));
        assert_eq!(
            calls[1].function.as_ref().unwrap().arguments.as_deref(),
            Some(r#"{"y": {"z": 2}}"#)
        );
    }

    #[test]
    fn test_name_inside_arguments_is_not_the_tool_name() {
        let mut extractor = TaggedJsonExtractor::default();
        let out = run(
            &mut extractor,
            &[r#"<tool_call>{"arguments": {"name": "inner"#],
        );
        let calls = &out[0].as_ref().unwrap().tool_calls;
        assert!(calls[0].function.as_ref().unwrap().name.is_none());
    }

    #[test]
    fn test_non_object_arguments_are_not_streamed() {
        let mut extractor = TaggedJsonExtractor::default();
        let out = run(
            &mut extractor,
            &[r#"<tool_call>{"name": "f", "arguments": "raw"}</tool_call>"#],
        );
        let call = &out[0].as_ref().unwrap().tool_calls[0];
        assert!(call.function.as_ref().unwrap().arguments.is_none());
    }

    #[test]
    fn test_feeds_accumulator_to_completion() {
        let mut extractor = TaggedJsonExtractor::default();
        let mut acc = ToolCallAccumulator::new();
        let chunks = [
            "<tool_call>",
            r#"{"name": "search", "#,
            r#""arguments": {"q": "rust", "#,
            r#""filters": {"lang": "en"}}"#,
            "}</tool_call>",
        ];
        let mut completed = Vec::new();
        for message in run(&mut extractor, &chunks).into_iter().flatten() {
            if let Some(done) = acc.ingest("r", &message) {
                completed.extend(done);
            }
        }
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].function.name, "search");
        let args: serde_json::Value =
            serde_json::from_str(&completed[0].function.arguments).unwrap();
        assert_eq!(args, serde_json::json!({"q": "rust", "filters": {"lang": "en"}}));
    }

    #[test]
    fn test_reset_restarts_progress() {
        let mut extractor = TaggedJsonExtractor::default();
        let text = r#"<tool_call>{"name": "a", "arguments": {}}</tool_call>"#;
        assert!(run(&mut extractor, &[text])[0].is_some());
        assert!(run(&mut extractor, &[text])[0].is_none());
        extractor.reset();
        assert!(run(&mut extractor, &[text])[0].is_some());
    }

    #[test]
    fn test_rejects_empty_or_equal_tags() {
        assert!(matches!(
            TaggedJsonExtractor::new("", ""),
            Err(HookError::Config(_))
        ));
        assert!(matches!(
            TaggedJsonExtractor::new("<tool_call>", ""),
            Err(HookError::Config(_))
        ));
        assert!(TaggedJsonExtractor::new("<x>", "<x>").is_err());
        let config = ToolStreamConfig {
            start_tag: String::new(),
            ..Default::default()
        };
        assert!(TaggedJsonExtractor::from_config(&config).is_err());
    }

    #[test]
    fn test_custom_tags() {
        let mut extractor = TaggedJsonExtractor::new("[TOOL]", "[/TOOL]").unwrap();
        let out = run(
            &mut extractor,
            &[r#"hi [TOOL]{"name": "f", "arguments": {"a": 1}}[/TOOL]"#],
        );
        let message = out[0].as_ref().unwrap();
        assert_eq!(message.content.as_deref(), Some("hi "));
        assert_eq!(
            message.tool_calls[0].function.as_ref().unwrap().arguments.as_deref(),
            Some(r#"{"a": 1}"#)
        );
    }
}
