// src/tools/mod.rs
//! Streaming tool call reconstruction.
//!
//! Model output arrives token by token. A fragment extractor turns the decoded
//! text into partial tool call deltas, and the accumulator stitches those deltas
//! back into complete, emit-once tool calls.

pub mod accumulator;
pub mod extractor;
pub mod stream;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use accumulator::{AccumulatorState, ToolCallAccumulator, ToolKey};
pub use extractor::TaggedJsonExtractor;
pub use stream::{
    DecodeState, ExtractContext, FragmentExtractor, StreamingToolParser, TokenDecoder,
};

/// A complete function call: name plus JSON argument text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

/// A complete tool call, surfaced once all of its fields are present.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionCall,
}

/// Partial function call update. `arguments` is an increment to append.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeltaFunctionCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

/// Partial update to the tool call at `index` within one response.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeltaToolCall {
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub tool_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<DeltaFunctionCall>,
}

impl DeltaToolCall {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            ..Default::default()
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn tool_type(mut self, tool_type: impl Into<String>) -> Self {
        self.tool_type = Some(tool_type.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.function.get_or_insert_with(Default::default).name = Some(name.into());
        self
    }

    pub fn arguments(mut self, arguments: impl Into<String>) -> Self {
        self.function.get_or_insert_with(Default::default).arguments = Some(arguments.into());
        self
    }
}

/// One batch of fragments produced by the extractor for a single step.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeltaMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<DeltaToolCall>,
}

impl DeltaMessage {
    pub fn tool_calls(tool_calls: Vec<DeltaToolCall>) -> Self {
        Self {
            content: None,
            tool_calls,
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Build a ToolCall from name/arguments with a provided ID.
pub fn new_tool_call(
    id: impl Into<String>,
    tool_type: impl Into<String>,
    name: impl Into<String>,
    arguments: impl Into<String>,
) -> ToolCall {
    ToolCall {
        id: id.into(),
        tool_type: tool_type.into(),
        function: FunctionCall {
            name: name.into(),
            arguments: arguments.into(),
        },
    }
}

/// Generate a compact tool call ID with required `call_` prefix.
/// Uses 16 hex chars (64 bits) from UUIDv4.
pub fn generate_tool_call_id() -> String {
    let raw = Uuid::new_v4().simple().to_string();
    format!("call_{}", &raw[..16])
}
