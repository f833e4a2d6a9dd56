//! Request-side hooks for the audio conditioning modality: mapping raw
//! payloads, shaping prompts and producing profiling data.

use candle_core::{DType, Device, Tensor};

use super::inputs::{Conditioning, ConditioningInputs, LogitsOnlyFlag, MultiModalValue};
use crate::config::XttsGptConfig;
use crate::error::{ModelError, Result};

/// Turn a `{embeds, is_logits_only_mode}` payload into typed conditioning.
///
/// `embeds` may be one tensor or a list of tensors. Any other shape is
/// rejected with the offending type's name.
pub fn map_conditioning_input(data: &MultiModalValue) -> Result<ConditioningInputs> {
    let MultiModalValue::Map(map) = data else {
        return Err(unsupported(data));
    };

    let embeds = match map.get("embeds") {
        Some(MultiModalValue::Tensor(t)) => Conditioning::Single(t.clone()),
        Some(MultiModalValue::List(items)) => {
            let tensors = items
                .iter()
                .map(|item| match item {
                    MultiModalValue::Tensor(t) => Ok(t.clone()),
                    other => Err(unsupported(other)),
                })
                .collect::<Result<Vec<_>>>()?;
            Conditioning::PerRequest(tensors)
        }
        Some(other) => return Err(unsupported(other)),
        None => {
            return Err(ModelError::InvalidInput(
                "conditioning payload has no 'embeds' entry".to_string(),
            ))
        }
    };

    let is_logits_only_mode = match map.get("is_logits_only_mode") {
        None => LogitsOnlyFlag::Bool(false),
        Some(MultiModalValue::Bool(b)) => LogitsOnlyFlag::Bool(*b),
        Some(MultiModalValue::Int(i)) => LogitsOnlyFlag::Bool(*i != 0),
        Some(MultiModalValue::Tensor(t)) => LogitsOnlyFlag::Tensor(t.clone()),
        Some(other) => return Err(unsupported(other)),
    };

    Ok(ConditioningInputs {
        embeds,
        is_logits_only_mode,
    })
}

fn unsupported(value: &MultiModalValue) -> ModelError {
    ModelError::UnsupportedConditioning {
        type_name: value.type_name().to_string(),
    }
}

/// Upper bound on multimodal tokens per conditioning item (perceiver output).
pub fn max_conditioning_tokens(cfg: &XttsGptConfig) -> usize {
    cfg.conditioning_tokens
}

/// Prompt and conditioning used while profiling memory capacity.
#[derive(Debug, Clone)]
pub struct DummyData {
    pub token_ids: Vec<u32>,
    pub conditioning: ConditioningInputs,
}

/// Worst-case input for `count` conditioning items in a `seq_len` window.
///
/// Each item occupies `conditioning_tokens` filler ids plus a separator; the
/// rest of the window is filler. Conditioning tensors are zeros of
/// `[seq_len, hidden_size]`.
pub fn dummy_data(
    cfg: &XttsGptConfig,
    seq_len: usize,
    count: usize,
    dtype: DType,
    device: &Device,
) -> Result<DummyData> {
    let filler = cfg.pad_filler_token;
    let per_item = max_conditioning_tokens(cfg) + 1;
    let mut token_ids = vec![filler; per_item * count];
    token_ids.resize(token_ids.len().max(seq_len), filler);

    let tensors = (0..count)
        .map(|_| Tensor::zeros((seq_len, cfg.hidden_size), dtype, device))
        .collect::<candle_core::Result<Vec<_>>>()?;

    Ok(DummyData {
        token_ids,
        conditioning: ConditioningInputs::new(Conditioning::PerRequest(tensors)),
    })
}

/// Rewrite a request's prompt so its length matches what the decoder will
/// actually hold: one filler id per conditioning row, then either the
/// start-of-audio token or, for a logits-only pass, the generated audio
/// tokens.
pub fn process_prompt(
    cfg: &XttsGptConfig,
    conditioning: &ConditioningInputs,
    prompt_token_ids: &[u32],
) -> Result<Vec<u32>> {
    let rows = conditioning.embeds.row_counts()?;
    let [cond_rows] = rows.as_slice() else {
        return Err(ModelError::ConditioningCount {
            conditioning: rows.len(),
            sequences: 1,
        });
    };

    let mut ids = vec![cfg.pad_filler_token; *cond_rows];
    if conditioning.is_logits_only_mode.is_set()? {
        ids.extend_from_slice(prompt_token_ids);
    } else {
        ids.push(cfg.start_audio_token);
    }
    Ok(ids)
}
