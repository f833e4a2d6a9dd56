use std::fmt;
use std::sync::Arc;

use candle_core::{Module, Tensor};
use candle_nn::{LayerNorm, Linear};

use crate::error::{ModelError, Result};
use crate::layers::AttentionMetadata;

/// Receives the normalized hidden states of a request before projection,
/// for example to hand them to an external vocoder.
pub trait HiddenStateCollector: Send + Sync {
    fn collect(&self, hidden_states: &Tensor) -> Result<()>;
}

impl<F> HiddenStateCollector for F
where
    F: Fn(&Tensor) -> Result<()> + Send + Sync,
{
    fn collect(&self, hidden_states: &Tensor) -> Result<()> {
        self(hidden_states)
    }
}

/// Per-call options of the decode head.
#[derive(Clone, Default)]
pub struct SamplingContext {
    /// Export hook bound to the current request.
    pub collector: Option<Arc<dyn HiddenStateCollector>>,
    /// Rows to project after collection; all rows when `None`.
    pub selected_rows: Option<Vec<u32>>,
}

impl fmt::Debug for SamplingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SamplingContext")
            .field("collector", &self.collector.is_some())
            .field("selected_rows", &self.selected_rows)
            .finish()
    }
}

impl SamplingContext {
    pub fn with_collector(mut self, collector: Arc<dyn HiddenStateCollector>) -> Self {
        self.collector = Some(collector);
        self
    }

    pub fn with_selected_rows(mut self, rows: Vec<u32>) -> Self {
        self.selected_rows = Some(rows);
        self
    }

    /// Keep only the last row of every request, the one that predicts its
    /// next token.
    pub fn last_token_rows(metadata: &AttentionMetadata) -> Self {
        let rows = metadata
            .query_ranges()
            .into_iter()
            .map(|r| (r.end - 1) as u32)
            .collect();
        Self::default().with_selected_rows(rows)
    }
}

/// Hidden states that have been through `final_norm` exactly once. Only the
/// head can produce one.
#[derive(Debug, Clone)]
pub struct NormalizedHidden(Tensor);

impl NormalizedHidden {
    pub fn tensor(&self) -> &Tensor {
        &self.0
    }
}

/// `final_norm` followed by the audio-token projection.
#[derive(Debug, Clone)]
pub struct DecodeHead {
    final_norm: LayerNorm,
    mel_head: Linear,
    logit_scale: f64,
}

impl DecodeHead {
    pub fn new(final_norm: LayerNorm, mel_head: Linear, logit_scale: f64) -> Self {
        Self {
            final_norm,
            mel_head,
            logit_scale,
        }
    }

    pub fn normalize(&self, hidden_states: &Tensor) -> Result<NormalizedHidden> {
        Ok(NormalizedHidden(self.final_norm.forward(hidden_states)?))
    }

    /// Logits `[rows, num_audio_tokens]` for already normalized states.
    pub fn project(&self, hidden: &NormalizedHidden, ctx: &SamplingContext) -> Result<Tensor> {
        let hidden = match &ctx.selected_rows {
            Some(rows) => {
                let available = hidden.0.dim(0)?;
                if let Some(&bad) = rows.iter().find(|&&r| r as usize >= available) {
                    return Err(ModelError::InvalidInput(format!(
                        "selected row {bad} is outside {available} hidden rows"
                    )));
                }
                let idx = Tensor::new(rows.as_slice(), hidden.0.device())?;
                hidden.0.index_select(&idx, 0)?
            }
            None => hidden.0.clone(),
        };
        let logits = self.mel_head.forward(&hidden)?;
        if self.logit_scale != 1.0 {
            Ok((logits * self.logit_scale)?)
        } else {
            Ok(logits)
        }
    }

    /// Normalize, offer the states to the collector, then project.
    pub fn compute_logits(&self, hidden_states: &Tensor, ctx: &SamplingContext) -> Result<Tensor> {
        let normalized = self.normalize(hidden_states)?;
        if let Some(collector) = &ctx.collector {
            collector.collect(normalized.tensor())?;
        }
        self.project(&normalized, ctx)
    }
}
