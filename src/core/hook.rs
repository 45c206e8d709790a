// src/core/hook.rs
//! Sequence hook: in-band control tokens that pause sequences and spawn
//! dependent children.
//!
//! * sync: the sampling sequence goes RUNNING -> BLOCKED.
//! * promise: the sampling sequence spawns a WAITING child and goes BLOCKED.
//! * once every child of a BLOCKED parent is FINISHED, the parent goes back to
//!   WAITING with the children's output appended to its prompt.

use super::output_processor::{OutputProcessor, ProcessorKind, SingleStepProcessor};
use super::sequence::{
    SampleOutput, Sequence, SequenceGroup, SequenceGroupOps, SequenceStatus, StepOutput,
};
use crate::utils::config::{SchedulerConfig, SpecialTokens};

pub struct SequenceHookProcessor {
    special_tokens: SpecialTokens,
    next_seq_id: usize,
    default: SingleStepProcessor,
}

impl SequenceHookProcessor {
    pub fn new(special_tokens: SpecialTokens, scheduler_config: SchedulerConfig) -> Self {
        Self {
            special_tokens,
            next_seq_id: 0,
            default: SingleStepProcessor::new(scheduler_config),
        }
    }

    /// Run sync detection, promise detection and the unblock scan, in that
    /// order. Only the first step output is inspected.
    pub fn on_step_outputs<G: SequenceGroupOps>(&mut self, group: &mut G, outputs: &[StepOutput]) {
        let Some(samples) = outputs.first().and_then(StepOutput::samples) else {
            return;
        };
        self.handle_sync(group, samples);
        self.handle_promise(group, samples);
        self.handle_unblock(group);
    }

    fn handle_sync<G: SequenceGroupOps>(&self, group: &mut G, samples: &[SampleOutput]) {
        let group_len = group.seqs().len();
        for (idx, sample) in samples.iter().enumerate() {
            if !self.special_tokens.is_sync(sample.output_token) {
                continue;
            }
            match group.seqs_mut().get_mut(idx) {
                Some(seq) if seq.is_running() => {
                    seq.status = SequenceStatus::Blocked;
                    crate::log_info!("Sync token: blocked sequence [seq_id {}]", seq.id);
                }
                Some(seq) => {
                    crate::log_warn!(
                        "Sync token ignored for sequence [seq_id {}] in status {:?}",
                        seq.id,
                        seq.status
                    );
                }
                None => {
                    crate::log_warn!(
                        "Sync token for sample {} has no sequence (group of {})",
                        idx,
                        group_len
                    );
                }
            }
        }
    }

    fn handle_promise<G: SequenceGroupOps>(&mut self, group: &mut G, samples: &[SampleOutput]) {
        for (idx, sample) in samples.iter().enumerate() {
            if !self.special_tokens.is_promise(sample.output_token) {
                continue;
            }
            let Some(parent) = group.seqs().get(idx) else {
                crate::log_warn!(
                    "Promise token for sample {} has no sequence (group of {})",
                    idx,
                    group.seqs().len()
                );
                continue;
            };
            if !parent.is_running() {
                continue;
            }
            let parent_id = parent.id;
            let child_id = self.allocate_seq_id(group.seqs());
            match group.spawn_child(idx, child_id) {
                Some(_) => {
                    group.seqs_mut()[idx].status = SequenceStatus::Blocked;
                    crate::log_info!(
                        "Promise token: spawned child [seq_id {}] from parent [seq_id {}]",
                        child_id,
                        parent_id
                    );
                }
                None => {
                    crate::log_warn!(
                        "Unable to spawn child for sequence [seq_id {}], leaving it running",
                        parent_id
                    );
                }
            }
        }
    }

    fn allocate_seq_id(&mut self, seqs: &[Sequence]) -> usize {
        let floor = seqs.iter().map(|s| s.id + 1).max().unwrap_or(0);
        self.next_seq_id = self.next_seq_id.max(floor);
        let id = self.next_seq_id;
        self.next_seq_id += 1;
        id
    }

    /// Children are found by direct parent-link match on every call, so a
    /// parent/child cycle leaves its members blocked instead of looping.
    fn handle_unblock<G: SequenceGroupOps>(&self, group: &mut G) {
        let seqs = group.seqs();
        let ready: Vec<usize> = seqs
            .iter()
            .enumerate()
            .filter(|(_, seq)| seq.is_blocked())
            .filter(|(_, seq)| {
                let mut children = seqs
                    .iter()
                    .filter(|child| child.parent_id == Some(seq.id))
                    .peekable();
                children.peek().is_some() && children.all(Sequence::is_finished)
            })
            .map(|(idx, _)| idx)
            .collect();

        for idx in ready {
            let seq = &mut group.seqs_mut()[idx];
            seq.status = SequenceStatus::Waiting;
            crate::log_info!(
                "Unblocked parent sequence [seq_id {}], all children finished",
                seq.id
            );
            Self::merge_child_results(group, idx);
        }
    }

    /// Append the finished children's output to the parent's prompt.
    fn merge_child_results<G: SequenceGroupOps>(group: &mut G, parent_idx: usize) {
        let parent_id = group.seqs()[parent_idx].id;
        let children: Vec<&Sequence> = group
            .seqs()
            .iter()
            .filter(|s| s.parent_id == Some(parent_id) && s.is_finished())
            .collect();
        let num_children = children.len();
        let merged = Self::compute_merged_output(&children);
        if merged.is_empty() {
            return;
        }
        group.seqs_mut()[parent_idx].append_prompt_text(&merged);
        crate::log_info!(
            "Merged {} child results into parent [seq_id {}]",
            num_children,
            parent_id
        );
    }

    /// Newline-joined output of the given children; empty outputs are skipped.
    pub fn compute_merged_output(children: &[&Sequence]) -> String {
        children
            .iter()
            .map(|child| child.output_text.as_str())
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl OutputProcessor for SequenceHookProcessor {
    fn process_outputs(&mut self, group: &mut SequenceGroup, outputs: &[StepOutput]) {
        self.on_step_outputs(group, outputs);
        self.default.process_outputs(group, outputs);
    }

    fn kind(&self) -> ProcessorKind {
        ProcessorKind::SequenceHook
    }
}
