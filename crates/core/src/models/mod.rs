//! Model implementations.

pub mod xtts_gpt;

pub use xtts_gpt::{
    start_token_indices, DecodeHead, DecodePhase, HiddenStateCollector, SamplingContext,
    StageInput, TokenInputs, XttsGpt,
};
