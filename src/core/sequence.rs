// src/core/sequence.rs
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequenceStatus {
    Waiting,
    Running,
    /// Paused by a control token until its children finish.
    Blocked,
    Finished,
}

#[derive(Debug, Clone)]
pub struct Sequence {
    pub id: usize,
    pub status: SequenceStatus,
    pub parent_id: Option<usize>,
    pub token_ids: Vec<u32>,
    pub num_prompt_tokens: usize,
    pub output_text: String,
    /// Text appended to the prompt after creation, pending a prefill pass.
    pub appended_prompt: Vec<String>,
}

impl Sequence {
    pub fn new(id: usize, prompt_token_ids: Vec<u32>) -> Self {
        Self {
            id,
            status: SequenceStatus::Waiting,
            parent_id: None,
            num_prompt_tokens: prompt_token_ids.len(),
            token_ids: prompt_token_ids,
            output_text: String::new(),
            appended_prompt: Vec::new(),
        }
    }

    pub fn with_status(mut self, status: SequenceStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_parent(mut self, parent_id: usize) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn len(&self) -> usize {
        self.token_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.token_ids.is_empty()
    }

    pub fn output_len(&self) -> usize {
        self.token_ids.len() - self.num_prompt_tokens
    }

    pub fn output_ids(&self) -> &[u32] {
        &self.token_ids[self.num_prompt_tokens..]
    }

    pub fn append_token(&mut self, token: u32) {
        self.token_ids.push(token);
    }

    pub fn append_prompt_text(&mut self, text: &str) {
        self.appended_prompt.push(text.to_string());
    }

    pub fn is_finished(&self) -> bool {
        self.status == SequenceStatus::Finished
    }

    pub fn is_blocked(&self) -> bool {
        self.status == SequenceStatus::Blocked
    }

    pub fn is_running(&self) -> bool {
        self.status == SequenceStatus::Running
    }
}

/// One sampled token for the sequence at the same position in the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleOutput {
    pub parent_seq_id: usize,
    pub output_token: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutput {
    Completion(Vec<SampleOutput>),
    /// Embedding/pooling output; carries no sampled tokens.
    Pooling(Vec<f32>),
}

impl StepOutput {
    pub fn samples(&self) -> Option<&[SampleOutput]> {
        match self {
            StepOutput::Completion(samples) => Some(samples),
            StepOutput::Pooling(_) => None,
        }
    }
}

/// What the sequence hook needs from a group of sequences.
pub trait SequenceGroupOps {
    fn seqs(&self) -> &[Sequence];

    fn seqs_mut(&mut self) -> &mut [Sequence];

    /// Create a WAITING child of the sequence at `parent_idx` with id
    /// `child_id`. Returns the child's index, or None if the parent is absent.
    fn spawn_child(&mut self, parent_idx: usize, child_id: usize) -> Option<usize>;
}

#[derive(Debug, Clone)]
pub struct SequenceGroup {
    pub request_id: String,
    pub seqs: Vec<Sequence>,
}

impl SequenceGroup {
    pub fn new(request_id: impl Into<String>, seqs: Vec<Sequence>) -> Self {
        Self {
            request_id: request_id.into(),
            seqs,
        }
    }

    pub fn get(&self, seq_id: usize) -> Option<&Sequence> {
        self.seqs.iter().find(|s| s.id == seq_id)
    }

    pub fn max_seq_id(&self) -> Option<usize> {
        self.seqs.iter().map(|s| s.id).max()
    }
}

impl SequenceGroupOps for SequenceGroup {
    fn seqs(&self) -> &[Sequence] {
        &self.seqs
    }

    fn seqs_mut(&mut self) -> &mut [Sequence] {
        &mut self.seqs
    }

    fn spawn_child(&mut self, parent_idx: usize, child_id: usize) -> Option<usize> {
        let parent = self.seqs.get(parent_idx)?;
        // the child continues from everything the parent has seen so far
        let child = Sequence::new(child_id, parent.token_ids.clone()).with_parent(parent.id);
        self.seqs.push(child);
        Some(self.seqs.len() - 1)
    }
}
