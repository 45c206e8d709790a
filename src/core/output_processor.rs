// src/core/output_processor.rs
use super::hook::SequenceHookProcessor;
use super::sequence::{SampleOutput, Sequence, SequenceGroup, SequenceStatus, StepOutput};
use crate::utils::config::{SchedulerConfig, SpecialTokens};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorKind {
    SingleStep,
    MultiStep,
    SequenceHook,
}

/// Applies one scheduling step's sampled outputs to a sequence group.
pub trait OutputProcessor: Send {
    fn process_outputs(&mut self, group: &mut SequenceGroup, outputs: &[StepOutput]);

    fn kind(&self) -> ProcessorKind;
}

/// Append sampled tokens to their sequences and finish those that hit a stop
/// condition. Sample `i` belongs to `seqs[i]`.
pub(crate) fn apply_samples(
    config: &SchedulerConfig,
    seqs: &mut [Sequence],
    samples: &[SampleOutput],
) {
    for (idx, sample) in samples.iter().enumerate() {
        let Some(seq) = seqs.get_mut(idx) else {
            continue;
        };
        match seq.status {
            SequenceStatus::Running => {
                seq.append_token(sample.output_token);
                if config.eos_token_ids.contains(&sample.output_token)
                    || seq.output_len() >= config.max_tokens
                {
                    seq.status = SequenceStatus::Finished;
                    crate::log_info!(
                        "Sequence [seq_id {}] finished ({} output tokens)",
                        seq.id,
                        seq.output_len()
                    );
                }
            }
            // control token stays in the blocked sequence's context
            SequenceStatus::Blocked => seq.append_token(sample.output_token),
            SequenceStatus::Waiting | SequenceStatus::Finished => {}
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SingleStepProcessor {
    config: SchedulerConfig,
}

impl SingleStepProcessor {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }
}

impl OutputProcessor for SingleStepProcessor {
    fn process_outputs(&mut self, group: &mut SequenceGroup, outputs: &[StepOutput]) {
        if let Some(samples) = outputs.first().and_then(StepOutput::samples) {
            apply_samples(&self.config, &mut group.seqs, samples);
        }
    }

    fn kind(&self) -> ProcessorKind {
        ProcessorKind::SingleStep
    }
}

/// Lookahead scheduling: every step output is applied in order.
#[derive(Debug, Clone, Default)]
pub struct MultiStepProcessor {
    config: SchedulerConfig,
}

impl MultiStepProcessor {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }
}

impl OutputProcessor for MultiStepProcessor {
    fn process_outputs(&mut self, group: &mut SequenceGroup, outputs: &[StepOutput]) {
        for samples in outputs.iter().filter_map(StepOutput::samples) {
            apply_samples(&self.config, &mut group.seqs, samples);
        }
    }

    fn kind(&self) -> ProcessorKind {
        ProcessorKind::MultiStep
    }
}

/// Multi-step scheduling takes precedence; otherwise control tokens select the
/// sequence hook.
pub fn create_output_processor(
    scheduler_config: &SchedulerConfig,
    special_tokens: Option<SpecialTokens>,
) -> Box<dyn OutputProcessor> {
    if scheduler_config.is_multi_step() {
        if special_tokens.is_some() {
            crate::log_warn!(
                "Sequence hook tokens ignored: multi-step scheduling enabled ({} lookahead slots)",
                scheduler_config.num_lookahead_slots
            );
        }
        return Box::new(MultiStepProcessor::new(scheduler_config.clone()));
    }
    match special_tokens.filter(|tokens| !tokens.is_empty()) {
        Some(tokens) => Box::new(SequenceHookProcessor::new(tokens, scheduler_config.clone())),
        None => Box::new(SingleStepProcessor::new(scheduler_config.clone())),
    }
}
