// src/tools/accumulator.rs
//! Per (request, tool index) accumulation of tool call fragments.
//!
//! Argument completeness is judged by brace balance only: `{` and `}` inside
//! JSON string literals are counted like structural ones.

use super::{new_tool_call, DeltaMessage, DeltaToolCall, ToolCall};
use std::collections::HashMap;

/// Composite address of one in-progress tool call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ToolKey {
    pub request_id: String,
    pub index: usize,
}

impl ToolKey {
    pub fn new(request_id: impl Into<String>, index: usize) -> Self {
        Self {
            request_id: request_id.into(),
            index,
        }
    }
}

/// Accumulated fields of one tool call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccumulatorState {
    id: Option<String>,
    tool_type: Option<String>,
    function_name: Option<String>,
    arguments: String,
    brace_depth: i64,
    seen_open_brace: bool,
    went_negative: bool,
    emitted: bool,
}

impl AccumulatorState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn tool_type(&self) -> Option<&str> {
        self.tool_type.as_deref()
    }

    pub fn function_name(&self) -> Option<&str> {
        self.function_name.as_deref()
    }

    pub fn arguments(&self) -> &str {
        &self.arguments
    }

    /// Running count of `{` minus `}` over all argument text seen so far.
    pub fn brace_depth(&self) -> i64 {
        self.brace_depth
    }

    pub fn emitted(&self) -> bool {
        self.emitted
    }

    /// Apply one fragment: present fields overwrite, argument text appends.
    pub fn apply(&mut self, fragment: &DeltaToolCall) {
        if let Some(id) = &fragment.id {
            self.id = Some(id.clone());
        }
        if let Some(tool_type) = &fragment.tool_type {
            self.tool_type = Some(tool_type.clone());
        }
        let Some(function) = &fragment.function else {
            return;
        };
        if let Some(name) = &function.name {
            self.function_name = Some(name.clone());
        }
        if let Some(arguments) = &function.arguments {
            self.append_arguments(arguments);
        }
    }

    fn append_arguments(&mut self, text: &str) {
        // only the new text is scanned
        for c in text.chars() {
            match c {
                '{' => {
                    self.brace_depth += 1;
                    self.seen_open_brace = true;
                }
                '}' => self.brace_depth -= 1,
                _ => {}
            }
        }
        self.arguments.push_str(text);
        if self.brace_depth < 0 && !self.went_negative {
            self.went_negative = true;
            crate::log_warn!(
                "Tool call arguments closed more braces than opened (depth {}): {}",
                self.brace_depth,
                self.arguments
            );
        }
    }

    /// Argument text is non-empty, contains `{`, and is balanced.
    pub fn arguments_complete(&self) -> bool {
        self.brace_depth == 0 && !self.arguments.is_empty() && self.seen_open_brace
    }

    /// Emission predicate.
    pub fn is_ready(&self) -> bool {
        !self.emitted
            && self.id.is_some()
            && self.tool_type.is_some()
            && self.function_name.is_some()
            && self.arguments_complete()
    }

    /// Marks the state emitted and builds its ToolCall, once.
    fn try_emit(&mut self) -> Option<ToolCall> {
        if !self.is_ready() {
            return None;
        }
        self.emitted = true;
        Some(new_tool_call(
            self.id.clone().unwrap_or_default(),
            self.tool_type.clone().unwrap_or_default(),
            self.function_name.clone().unwrap_or_default(),
            self.arguments.clone(),
        ))
    }
}

/// Keyed table of accumulator states, one per (request, tool index).
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    states: HashMap<ToolKey, AccumulatorState>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a fragment batch for `request_id` and return the tool calls it
    /// completed, in first-touch order within the batch.
    pub fn ingest(&mut self, request_id: &str, delta: &DeltaMessage) -> Option<Vec<ToolCall>> {
        if !delta.has_tool_calls() {
            return None;
        }

        let mut touched: Vec<usize> = Vec::new();
        for fragment in &delta.tool_calls {
            self.states
                .entry(ToolKey::new(request_id, fragment.index))
                .or_default()
                .apply(fragment);
            if !touched.contains(&fragment.index) {
                touched.push(fragment.index);
            }
        }

        let mut tool_calls = Vec::new();
        for index in touched {
            let key = ToolKey::new(request_id, index);
            if let Some(call) = self.states.get_mut(&key).and_then(|s| s.try_emit()) {
                crate::log_info!(
                    "Tool call {} ({}) complete for request {} (index {})",
                    call.function.name,
                    call.id,
                    request_id,
                    index
                );
                tool_calls.push(call);
            }
        }

        if tool_calls.is_empty() {
            None
        } else {
            Some(tool_calls)
        }
    }

    pub fn state(&self, request_id: &str, index: usize) -> Option<&AccumulatorState> {
        self.states.get(&ToolKey::new(request_id, index))
    }

    /// Drop every state belonging to `request_id`.
    pub fn clear(&mut self, request_id: &str) {
        self.states.retain(|key, _| key.request_id != request_id);
    }

    pub fn num_tracked(&self, request_id: &str) -> usize {
        self.states
            .keys()
            .filter(|key| key.request_id == request_id)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
