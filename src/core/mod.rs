pub mod hook;
pub mod output_processor;
pub mod sequence;
