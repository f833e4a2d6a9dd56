//! Conditioning input channel for the audio decoder.
//!
//! Conditioning embeddings (voice latents + text embeddings) are computed
//! outside this crate. This module validates how they arrive, rewrites prompts
//! so their length matches the decoder's packed layout, and exposes those
//! hooks through an explicit [`ModalityRegistry`].

mod inputs;
mod processor;
mod registry;

pub use inputs::{as_rows, Conditioning, ConditioningInputs, LogitsOnlyFlag, MultiModalValue};
pub use processor::{
    dummy_data, map_conditioning_input, max_conditioning_tokens, process_prompt, DummyData,
};
pub use registry::{
    DummyDataFn, InputMapperFn, InputProcessorFn, MaxTokensFn, ModalityRegistration,
    ModalityRegistry, AUDIO_MODALITY,
};
