//! Explicit modality table handed to the host at startup.

use std::collections::HashMap;

use candle_core::{DType, Device};

use super::inputs::{ConditioningInputs, MultiModalValue};
use super::processor::{
    dummy_data, map_conditioning_input, max_conditioning_tokens, process_prompt, DummyData,
};
use crate::config::XttsGptConfig;
use crate::error::{ModelError, Result};

pub type InputMapperFn = fn(&MultiModalValue) -> Result<ConditioningInputs>;
pub type MaxTokensFn = fn(&XttsGptConfig) -> usize;
pub type DummyDataFn = fn(&XttsGptConfig, usize, usize, DType, &Device) -> Result<DummyData>;
pub type InputProcessorFn = fn(&XttsGptConfig, &ConditioningInputs, &[u32]) -> Result<Vec<u32>>;

/// Hooks the host calls for one modality.
#[derive(Debug, Clone, Copy)]
pub struct ModalityRegistration {
    pub modality: &'static str,
    pub input_mapper: InputMapperFn,
    pub max_tokens: MaxTokensFn,
    pub dummy_data: DummyDataFn,
    pub input_processor: InputProcessorFn,
}

/// Voice/text conditioning for the audio decoder.
pub const AUDIO_MODALITY: ModalityRegistration = ModalityRegistration {
    modality: "audio",
    input_mapper: map_conditioning_input,
    max_tokens: max_conditioning_tokens,
    dummy_data,
    input_processor: process_prompt,
};

#[derive(Debug, Default)]
pub struct ModalityRegistry {
    entries: HashMap<&'static str, ModalityRegistration>,
}

impl ModalityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the audio modality registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.entries.insert(AUDIO_MODALITY.modality, AUDIO_MODALITY);
        registry
    }

    /// Add a modality. Registering the same name twice is an error.
    pub fn register(&mut self, registration: ModalityRegistration) -> Result<()> {
        if self.entries.contains_key(registration.modality) {
            return Err(ModelError::InvalidInput(format!(
                "modality '{}' is already registered",
                registration.modality
            )));
        }
        tracing::debug!(modality = registration.modality, "registered modality");
        self.entries.insert(registration.modality, registration);
        Ok(())
    }

    pub fn get(&self, modality: &str) -> Option<&ModalityRegistration> {
        self.entries.get(modality)
    }

    pub fn modalities(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.entries.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Total conditioning-token budget for the requested item counts.
    pub fn max_tokens_for(&self, cfg: &XttsGptConfig, counts: &HashMap<String, usize>) -> usize {
        counts
            .iter()
            .filter_map(|(name, count)| self.get(name).map(|r| (r.max_tokens)(cfg) * count))
            .sum()
    }
}
