// src/tools/stream.rs
//! Token-delta driven tool call streaming.
//!
//! Each step, new token ids for a request are decoded with full context, the
//! fragment extractor sees previous/current/delta views of the text, and the
//! fragments it returns are routed into the accumulator table.

use super::accumulator::ToolCallAccumulator;
use super::{DeltaMessage, ToolCall};
use crate::error::{HookError, Result};
use crate::utils::config::AddressingMode;
use std::collections::HashMap;
use std::sync::Arc;
use tokenizers::Tokenizer;

/// Request id used for every call when the parser is in single-request mode.
pub const SINGLE_REQUEST_ID: &str = "__single__";

/// Decodes a contiguous run of token ids to text.
pub trait TokenDecoder: Send + Sync {
    fn decode(&self, token_ids: &[u32]) -> Result<String>;
}

/// `TokenDecoder` backed by a HuggingFace tokenizer.
pub struct TokenizerDecoder {
    tokenizer: Tokenizer,
    skip_special_tokens: bool,
}

impl TokenizerDecoder {
    pub fn new(tokenizer: Tokenizer, skip_special_tokens: bool) -> Self {
        Self {
            tokenizer,
            skip_special_tokens,
        }
    }
}

impl TokenDecoder for TokenizerDecoder {
    fn decode(&self, token_ids: &[u32]) -> Result<String> {
        self.tokenizer
            .decode(token_ids, self.skip_special_tokens)
            .map_err(|e| HookError::Decode(e.to_string()))
    }
}

/// Everything a fragment extractor may look at for one step.
#[derive(Debug, Clone, Copy)]
pub struct ExtractContext<'a> {
    pub previous_text: &'a str,
    pub current_text: &'a str,
    pub delta_text: &'a str,
    pub previous_token_ids: &'a [u32],
    pub current_token_ids: &'a [u32],
    pub delta_token_ids: &'a [u32],
}

/// Turns streamed model text into tool call fragments.
///
/// Returning `Err(HookError::Incompatible(_))` means the extractor cannot
/// handle this call shape; the parser treats it as "no fragments".
pub trait FragmentExtractor: Send {
    fn extract(&mut self, ctx: &ExtractContext<'_>) -> Result<Option<DeltaMessage>>;

    /// Forget any per-response progress.
    fn reset(&mut self) {}
}

pub type ExtractorFactory = Box<dyn Fn() -> Box<dyn FragmentExtractor> + Send + Sync>;

/// Append-only decoded text and token ids of one request.
///
/// Decoding keeps a prefix/read window like `tokenizers::DecodeStream`: text
/// is only released once the window decodes to more than its prefix and does
/// not end in a partial character.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodeState {
    text: String,
    token_ids: Vec<u32>,
    prefix_offset: usize,
    read_offset: usize,
}

impl DecodeState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn token_ids(&self) -> &[u32] {
        &self.token_ids
    }

    /// Append `new_ids`, returning the newly released text. On decoder
    /// failure the state is left untouched.
    fn advance(&mut self, decoder: &dyn TokenDecoder, new_ids: &[u32]) -> Result<String> {
        let prev_len = self.token_ids.len();
        self.token_ids.extend_from_slice(new_ids);

        let window = match self.decode_window(decoder) {
            Ok(window) => window,
            Err(e) => {
                self.token_ids.truncate(prev_len);
                return Err(e);
            }
        };

        let delta = match window {
            Some((prefix_text, new_text)) => {
                let released = new_text
                    .get(prefix_text.len()..)
                    .filter(|_| new_text.starts_with(prefix_text.as_str()))
                    .map(str::to_string);
                match released {
                    Some(text) => text,
                    // the window re-decoded its prefix differently; fall back to
                    // everything not yet released
                    None => match decoder.decode(&self.token_ids[self.read_offset..]) {
                        Ok(text) => text,
                        Err(e) => {
                            self.token_ids.truncate(prev_len);
                            return Err(e);
                        }
                    },
                }
            }
            None => String::new(),
        };

        if !delta.is_empty() {
            self.prefix_offset = self.read_offset;
            self.read_offset = self.token_ids.len();
            self.text.push_str(&delta);
        }
        Ok(delta)
    }

    fn decode_window(&self, decoder: &dyn TokenDecoder) -> Result<Option<(String, String)>> {
        let prefix_text = decoder.decode(&self.token_ids[self.prefix_offset..self.read_offset])?;
        let new_text = decoder.decode(&self.token_ids[self.prefix_offset..])?;
        if new_text.len() > prefix_text.len() && !new_text.ends_with('\u{FFFD}') {
            Ok(Some((prefix_text, new_text)))
        } else {
            Ok(None)
        }
    }
}

struct RequestState {
    decode: DecodeState,
    extractor: Box<dyn FragmentExtractor>,
}

impl RequestState {
    fn new(extractor: Box<dyn FragmentExtractor>) -> Self {
        Self {
            decode: DecodeState::new(),
            extractor,
        }
    }
}

enum Requests {
    /// One request; every request id maps onto it.
    Single(RequestState),
    /// One lazily created state per request id.
    Multi {
        states: HashMap<String, RequestState>,
        factory: ExtractorFactory,
    },
}

/// Streaming tool call parser over one or many requests.
pub struct StreamingToolParser {
    decoder: Arc<dyn TokenDecoder>,
    requests: Requests,
    accumulator: ToolCallAccumulator,
}

impl StreamingToolParser {
    /// Single addressing takes its one extractor from `extractor_factory`.
    pub fn new(
        addressing: AddressingMode,
        decoder: Arc<dyn TokenDecoder>,
        extractor_factory: ExtractorFactory,
    ) -> Self {
        match addressing {
            AddressingMode::Single => Self::single(decoder, extractor_factory()),
            AddressingMode::Multi => Self::multi(decoder, extractor_factory),
        }
    }

    /// Parser keyed by request id, then tool index.
    pub fn multi(decoder: Arc<dyn TokenDecoder>, extractor_factory: ExtractorFactory) -> Self {
        Self {
            decoder,
            requests: Requests::Multi {
                states: HashMap::new(),
                factory: extractor_factory,
            },
            accumulator: ToolCallAccumulator::new(),
        }
    }

    /// Parser for a single request; request ids passed to it are ignored.
    pub fn single(decoder: Arc<dyn TokenDecoder>, extractor: Box<dyn FragmentExtractor>) -> Self {
        Self {
            decoder,
            requests: Requests::Single(RequestState::new(extractor)),
            accumulator: ToolCallAccumulator::new(),
        }
    }

    pub fn addressing(&self) -> AddressingMode {
        match self.requests {
            Requests::Single(_) => AddressingMode::Single,
            Requests::Multi { .. } => AddressingMode::Multi,
        }
    }

    fn scope<'a>(&self, request_id: &'a str) -> &'a str {
        match self.requests {
            Requests::Single(_) => SINGLE_REQUEST_ID,
            Requests::Multi { .. } => request_id,
        }
    }

    fn request(&self, request_id: &str) -> Option<&RequestState> {
        match &self.requests {
            Requests::Single(state) => Some(state),
            Requests::Multi { states, .. } => states.get(request_id),
        }
    }

    /// Decode `new_token_ids` for a request and run the fragment extractor.
    pub fn decode_step(&mut self, request_id: &str, new_token_ids: &[u32]) -> Option<DeltaMessage> {
        if new_token_ids.is_empty() {
            return None;
        }
        let state = match &mut self.requests {
            Requests::Single(state) => state,
            Requests::Multi { states, factory } => states
                .entry(request_id.to_string())
                .or_insert_with(|| RequestState::new(factory())),
        };

        let previous_text_len = state.decode.text.len();
        let previous_ids_len = state.decode.token_ids.len();
        let delta_text = match state.decode.advance(self.decoder.as_ref(), new_token_ids) {
            Ok(text) => text,
            Err(e) => {
                crate::log_warn!("Unable to decode tokens for request {}: {}", request_id, e);
                return None;
            }
        };

        let decode = &state.decode;
        let ctx = ExtractContext {
            previous_text: &decode.text[..previous_text_len],
            current_text: &decode.text,
            delta_text: &delta_text,
            previous_token_ids: &decode.token_ids[..previous_ids_len],
            current_token_ids: &decode.token_ids,
            delta_token_ids: new_token_ids,
        };
        match state.extractor.extract(&ctx) {
            Ok(delta) => delta,
            Err(HookError::Incompatible(reason)) => {
                crate::log_warn!(
                    "Fragment extractor incompatible for request {}: {}",
                    request_id,
                    reason
                );
                None
            }
            Err(e) => {
                crate::log_warn!("Fragment extraction failed for request {}: {}", request_id, e);
                None
            }
        }
    }

    /// Route a fragment batch into the accumulator table.
    pub fn ingest_fragments(
        &mut self,
        request_id: &str,
        fragments: &DeltaMessage,
    ) -> Option<Vec<ToolCall>> {
        let key = self.scope(request_id);
        self.accumulator.ingest(key, fragments)
    }

    /// `decode_step` followed by `ingest_fragments`.
    pub fn process(&mut self, request_id: &str, new_token_ids: &[u32]) -> Option<Vec<ToolCall>> {
        let fragments = self.decode_step(request_id, new_token_ids)?;
        self.ingest_fragments(request_id, &fragments)
    }

    /// Discard all state for a request. Safe for unknown ids.
    pub fn reset(&mut self, request_id: &str) {
        let key = self.scope(request_id);
        self.accumulator.clear(key);
        match &mut self.requests {
            Requests::Single(state) => {
                state.decode = DecodeState::new();
                state.extractor.reset();
            }
            Requests::Multi { states, .. } => {
                states.remove(request_id);
            }
        }
    }

    pub fn decode_state(&self, request_id: &str) -> Option<&DecodeState> {
        self.request(request_id).map(|state| &state.decode)
    }

    pub fn accumulator(&self) -> &ToolCallAccumulator {
        &self.accumulator
    }

    pub fn is_tracking(&self, request_id: &str) -> bool {
        self.request(request_id)
            .is_some_and(|state| !state.decode.token_ids.is_empty())
            || self.accumulator.num_tracked(self.scope(request_id)) > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::DeltaToolCall;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Token id `i` decodes to `VOCAB[i]`.
    struct VocabDecoder(Vec<&'static str>);

    impl TokenDecoder for VocabDecoder {
        fn decode(&self, token_ids: &[u32]) -> Result<String> {
            token_ids
                .iter()
                .map(|&id| {
                    self.0
                        .get(id as usize)
                        .copied()
                        .ok_or_else(|| HookError::Decode(format!("unknown id {id}")))
                })
                .collect()
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Seen {
        previous_text: String,
        current_text: String,
        delta_text: String,
        previous_token_ids: Vec<u32>,
        current_token_ids: Vec<u32>,
        delta_token_ids: Vec<u32>,
    }

    /// Records every context and replays scripted fragment batches.
    struct ScriptedExtractor {
        seen: Arc<Mutex<Vec<Seen>>>,
        script: Vec<Result<Option<DeltaMessage>>>,
    }

    impl FragmentExtractor for ScriptedExtractor {
        fn extract(&mut self, ctx: &ExtractContext<'_>) -> Result<Option<DeltaMessage>> {
            self.seen.lock().unwrap().push(Seen {
                previous_text: ctx.previous_text.to_string(),
                current_text: ctx.current_text.to_string(),
                delta_text: ctx.delta_text.to_string(),
                previous_token_ids: ctx.previous_token_ids.to_vec(),
                current_token_ids: ctx.current_token_ids.to_vec(),
                delta_token_ids: ctx.delta_token_ids.to_vec(),
            });
            if self.script.is_empty() {
                Ok(None)
            } else {
                self.script.remove(0)
            }
        }
    }

    fn decoder() -> Arc<dyn TokenDecoder> {
        Arc::new(VocabDecoder(vec!["a", "b", "c", "d"]))
    }

    fn scripted(
        script: Vec<Result<Option<DeltaMessage>>>,
    ) -> (Box<dyn FragmentExtractor>, Arc<Mutex<Vec<Seen>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        (
            Box::new(ScriptedExtractor {
                seen: seen.clone(),
                script,
            }),
            seen,
        )
    }

    #[test]
    fn test_empty_tokens_is_noop() {
        let (extractor, seen) = scripted(vec![]);
        let mut parser = StreamingToolParser::single(decoder(), extractor);
        assert!(parser.decode_step("r", &[]).is_none());
        assert!(parser.process("r", &[]).is_none());
        assert!(seen.lock().unwrap().is_empty());
        assert!(parser.decode_state("r").unwrap().token_ids().is_empty());
        assert!(!parser.is_tracking("r"));
    }

    #[test]
    fn test_extractor_sees_full_context() {
        let (extractor, seen) = scripted(vec![]);
        let mut parser = StreamingToolParser::single(decoder(), extractor);
        parser.decode_step("r", &[0, 1]);
        parser.decode_step("r", &[2]);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(
            seen[1],
            Seen {
                previous_text: "ab".to_string(),
                current_text: "abc".to_string(),
                delta_text: "c".to_string(),
                previous_token_ids: vec![0, 1],
                current_token_ids: vec![0, 1, 2],
                delta_token_ids: vec![2],
            }
        );
        assert_eq!(parser.decode_state("r").unwrap().text(), "abc");
    }

    #[test]
    fn test_incompatible_extractor_is_no_fragments() {
        let (extractor, _seen) = scripted(vec![Err(HookError::Incompatible(
            "request context required".to_string(),
        ))]);
        let mut parser = StreamingToolParser::single(decoder(), extractor);
        assert!(parser.decode_step("r", &[0]).is_none());
        // decoding still progressed
        assert_eq!(parser.decode_state("r").unwrap().text(), "a");
    }

    #[test]
    fn test_decode_failure_leaves_state_untouched() {
        let (extractor, seen) = scripted(vec![]);
        let mut parser = StreamingToolParser::single(decoder(), extractor);
        parser.decode_step("r", &[0]);
        assert!(parser.decode_step("r", &[99]).is_none());
        assert_eq!(parser.decode_state("r").unwrap().token_ids(), &[0]);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_process_routes_fragments() {
        let (extractor, _seen) = scripted(vec![
            Ok(Some(DeltaMessage::tool_calls(vec![DeltaToolCall::new(0)
                .id("x")
                .tool_type("function")
                .name("get_weather")
                .arguments(r#"{"city": "Ber"#)]))),
            Ok(None),
            Ok(Some(DeltaMessage::tool_calls(vec![
                DeltaToolCall::new(0).arguments(r#"lin"}"#)
            ]))),
        ]);
        let mut parser = StreamingToolParser::single(decoder(), extractor);
        assert!(parser.process("r", &[0]).is_none());
        assert!(parser.process("r", &[1]).is_none());
        let done = parser.process("r", &[2]).unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].function.arguments, r#"{"city": "Berlin"}"#);
    }

    #[test]
    fn test_single_mode_ignores_request_id() {
        let (extractor, _seen) = scripted(vec![]);
        let mut parser = StreamingToolParser::single(decoder(), extractor);
        parser.decode_step("first", &[0]);
        parser.decode_step("second", &[1]);
        assert_eq!(parser.decode_state("anything").unwrap().text(), "ab");

        parser.reset("whatever");
        assert!(parser.decode_state("first").unwrap().text().is_empty());
        assert!(!parser.is_tracking("first"));
    }

    #[test]
    fn test_multi_mode_scopes_by_request() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let factory_seen = seen.clone();
        let mut parser = StreamingToolParser::multi(
            decoder(),
            Box::new(move || -> Box<dyn FragmentExtractor> {
                Box::new(ScriptedExtractor {
                    seen: factory_seen.clone(),
                    script: vec![],
                })
            }),
        );
        parser.decode_step("a", &[0]);
        parser.decode_step("b", &[3]);
        parser.decode_step("a", &[1]);

        assert_eq!(parser.decode_state("a").unwrap().text(), "ab");
        assert_eq!(parser.decode_state("b").unwrap().text(), "d");
        assert_eq!(seen.lock().unwrap()[2].previous_text, "a");

        parser.reset("a");
        assert!(parser.decode_state("a").is_none());
        assert!(parser.is_tracking("b"));
        parser.reset("never-added");
        parser.reset("a");
    }

    #[test]
    fn test_reset_clears_accumulators() {
        let mut parser = StreamingToolParser::multi(
            decoder(),
            Box::new(|| -> Box<dyn FragmentExtractor> { scripted(vec![]).0 }),
        );
        let open = DeltaMessage::tool_calls(vec![DeltaToolCall::new(0)
            .id("x")
            .tool_type("function")
            .name("f")
            .arguments("{")]);
        assert!(parser.ingest_fragments("r", &open).is_none());
        assert!(parser.is_tracking("r"));

        parser.reset("r");
        assert!(parser.accumulator().state("r", 0).is_none());

        // a fresh accumulator for the same index emits again after reset
        let full = DeltaMessage::tool_calls(vec![DeltaToolCall::new(0)
            .id("y")
            .tool_type("function")
            .name("f")
            .arguments("{}")]);
        assert_eq!(parser.ingest_fragments("r", &full).unwrap()[0].id, "y");
    }

    /// Decodes byte tokens, producing U+FFFD for incomplete UTF-8.
    struct ByteDecoder;

    impl TokenDecoder for ByteDecoder {
        fn decode(&self, token_ids: &[u32]) -> Result<String> {
            let bytes: Vec<u8> = token_ids.iter().map(|&id| id as u8).collect();
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }
    }

    #[test]
    fn test_partial_multibyte_is_held_back() {
        let (extractor, seen) = scripted(vec![]);
        let mut parser = StreamingToolParser::single(Arc::new(ByteDecoder), extractor);
        // "é" is 0xC3 0xA9
        parser.decode_step("r", &[b'x' as u32]);
        parser.decode_step("r", &[0xC3]);
        assert_eq!(parser.decode_state("r").unwrap().text(), "x");
        parser.decode_step("r", &[0xA9]);
        assert_eq!(parser.decode_state("r").unwrap().text(), "xé");

        let seen = seen.lock().unwrap();
        assert_eq!(seen[1].delta_text, "");
        assert_eq!(seen[2].delta_text, "é");
        assert_eq!(seen[2].previous_token_ids, vec![b'x' as u32, 0xC3]);
    }

    /// Decodes from a fixed table of id runs; the run `[1, 2, 3]` re-decodes
    /// its prefix `[1]` differently.
    struct RewritingDecoder;

    impl TokenDecoder for RewritingDecoder {
        fn decode(&self, token_ids: &[u32]) -> Result<String> {
            let text = match token_ids {
                [] => "",
                [1] => "a",
                [2] => "\u{FFFD}",
                [3] => "y",
                [1, 2] => "a\u{FFFD}",
                [2, 3] => "xy",
                [1, 2, 3] => "Bxy",
                _ => return Err(HookError::Decode(format!("no entry for {token_ids:?}"))),
            };
            Ok(text.to_string())
        }
    }

    #[test]
    fn test_prefix_mismatch_keeps_held_back_text() {
        let (extractor, seen) = scripted(vec![]);
        let mut parser = StreamingToolParser::single(Arc::new(RewritingDecoder), extractor);
        parser.decode_step("r", &[1]);
        parser.decode_step("r", &[2]);
        assert_eq!(parser.decode_state("r").unwrap().text(), "a");
        parser.decode_step("r", &[3]);
        assert_eq!(parser.decode_state("r").unwrap().text(), "axy");
        assert_eq!(seen.lock().unwrap()[2].delta_text, "xy");
    }

    #[test]
    fn test_new_single_uses_one_extractor_for_every_id() {
        let created = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (factory_created, factory_seen) = (created.clone(), seen.clone());
        let mut parser = StreamingToolParser::new(
            AddressingMode::Single,
            decoder(),
            Box::new(move || -> Box<dyn FragmentExtractor> {
                factory_created.fetch_add(1, Ordering::SeqCst);
                Box::new(ScriptedExtractor {
                    seen: factory_seen.clone(),
                    script: vec![],
                })
            }),
        );
        assert_eq!(parser.addressing(), AddressingMode::Single);
        parser.decode_step("a", &[0]);
        parser.decode_step("b", &[1]);
        parser.reset("a");
        parser.decode_step("c", &[2]);

        assert_eq!(created.load(Ordering::SeqCst), 1);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[1].current_text, "ab");
        assert_eq!(seen[2].current_text, "c");
    }
}
