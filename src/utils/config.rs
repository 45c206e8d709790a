// src/utils/config.rs
use crate::error::{HookError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Reserved control tokens recognised by the sequence hook.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpecialTokens {
    #[serde(default)]
    pub sync_token_id: Option<u32>,
    #[serde(default)]
    pub promise_token_id: Option<u32>,
}

impl SpecialTokens {
    pub fn new(sync_token_id: Option<u32>, promise_token_id: Option<u32>) -> Self {
        Self {
            sync_token_id,
            promise_token_id,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sync_token_id.is_none() && self.promise_token_id.is_none()
    }

    pub fn is_sync(&self, token: u32) -> bool {
        self.sync_token_id == Some(token)
    }

    pub fn is_promise(&self, token: u32) -> bool {
        self.promise_token_id == Some(token)
    }

    pub fn validate(&self) -> Result<()> {
        if self.is_empty() {
            return Err(HookError::Config(
                "at least one of sync_token_id / promise_token_id must be set".to_string(),
            ));
        }
        if let (Some(sync), Some(promise)) = (self.sync_token_id, self.promise_token_id) {
            if sync == promise {
                return Err(HookError::Config(format!(
                    "sync and promise tokens must differ (both {sync})"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Non-zero enables multi-step (lookahead) output processing.
    #[serde(default)]
    pub num_lookahead_slots: usize,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default)]
    pub eos_token_ids: Vec<u32>,
}

fn default_max_tokens() -> usize {
    16384
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_lookahead_slots: 0,
            max_tokens: default_max_tokens(),
            eos_token_ids: Vec::new(),
        }
    }
}

impl SchedulerConfig {
    pub fn is_multi_step(&self) -> bool {
        self.num_lookahead_slots > 0
    }
}

/// How tool-call state is addressed inside a `StreamingToolParser`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AddressingMode {
    /// One request per parser; request ids passed by the caller are ignored.
    Single,
    /// State is scoped by request id, then by tool index.
    #[default]
    Multi,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ToolStreamConfig {
    #[serde(default)]
    pub addressing: AddressingMode,
    #[serde(default = "default_skip_special_tokens")]
    pub skip_special_tokens: bool,
    #[serde(default = "default_start_tag")]
    pub start_tag: String,
    #[serde(default = "default_end_tag")]
    pub end_tag: String,
}

fn default_skip_special_tokens() -> bool {
    true
}

fn default_start_tag() -> String {
    "<tool_call>".to_string()
}

fn default_end_tag() -> String {
    "</tool_call>".to_string()
}

impl Default for ToolStreamConfig {
    fn default() -> Self {
        Self {
            addressing: AddressingMode::default(),
            skip_special_tokens: default_skip_special_tokens(),
            start_tag: default_start_tag(),
            end_tag: default_end_tag(),
        }
    }
}

impl ToolStreamConfig {
    pub fn validate(&self) -> Result<()> {
        if self.start_tag.is_empty() || self.end_tag.is_empty() {
            return Err(HookError::Config(
                "tool call start/end tags must not be empty".to_string(),
            ));
        }
        if self.start_tag == self.end_tag {
            return Err(HookError::Config(format!(
                "tool call start and end tags must differ ({})",
                self.start_tag
            )));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct HookConfig {
    #[serde(default)]
    pub special_tokens: Option<SpecialTokens>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub tool_stream: ToolStreamConfig,
}

impl HookConfig {
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: HookConfig = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(tokens) = &self.special_tokens {
            tokens.validate()?;
        }
        self.tool_stream.validate()
    }
}
