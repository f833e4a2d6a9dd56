//! Builds the stack's input rows for each decode phase.

use candle_core::{DType, Module, Tensor};
use candle_nn::Embedding;

use super::alignment::{align, Alignment};
use super::phase::DecodePhase;
use crate::error::{ModelError, Result};
use crate::layers::{AttentionMetadata, PositionEmbedding};
use crate::multimodal::Conditioning;

/// Token and position tables of the first pipeline stage.
#[derive(Debug, Clone)]
pub struct HiddenStateAssembler {
    wte: Embedding,
    wpe: PositionEmbedding,
    hidden_size: usize,
}

impl HiddenStateAssembler {
    pub fn new(wte: Embedding, wpe: PositionEmbedding, hidden_size: usize) -> Self {
        Self {
            wte,
            wpe,
            hidden_size,
        }
    }

    pub fn positions(&self) -> &PositionEmbedding {
        &self.wpe
    }

    /// Input rows `[rows, hidden]` for the transformer stack.
    ///
    /// * priming: conditioning followed by the start token, whose position is
    ///   a fresh counter at 0 rather than the host's position.
    /// * incremental: token plus host position, no conditioning.
    /// * logits-only: per request, conditioning followed by its audio tokens
    ///   at host positions.
    pub fn assemble(
        &self,
        phase: DecodePhase,
        token_ids: &Tensor,
        position_ids: &Tensor,
        conditioning: Option<&Conditioning>,
        metadata: &AttentionMetadata,
    ) -> Result<Tensor> {
        let token_ids = token_ids.flatten_all()?.to_dtype(DType::U32)?;
        let position_ids = position_ids.flatten_all()?.to_dtype(DType::U32)?;
        let num_tokens = token_ids.dim(0)?;
        if position_ids.dim(0)? != num_tokens {
            return Err(ModelError::ShapeMismatch {
                context: "position ids",
                expected: num_tokens,
                actual: position_ids.dim(0)?,
            });
        }

        let hidden_states = match phase {
            DecodePhase::Incremental => self.embed(&token_ids, &position_ids)?,
            DecodePhase::Priming => {
                let conditioning = required(conditioning, phase)?;
                self.assemble_priming(&token_ids, conditioning, metadata)?
            }
            DecodePhase::LogitsOnly => {
                let conditioning = required(conditioning, phase)?;
                self.assemble_logits_only(&token_ids, &position_ids, conditioning, metadata)?
            }
        };

        let rows = hidden_states.elem_count() / self.hidden_size;
        tracing::debug!(%phase, tokens = num_tokens, rows, "assembled hidden states");
        Ok(hidden_states.reshape((rows, self.hidden_size))?)
    }

    /// Token embedding plus learned position for each id. `[n, hidden]`.
    fn embed(&self, token_ids: &Tensor, position_ids: &Tensor) -> Result<Tensor> {
        let tokens = self.wte.forward(token_ids)?;
        let positions = self.wpe.lookup_single_step(position_ids)?;
        Ok(tokens.broadcast_add(&positions)?)
    }

    fn assemble_priming(
        &self,
        token_ids: &Tensor,
        conditioning: &Conditioning,
        metadata: &AttentionMetadata,
    ) -> Result<Tensor> {
        let num_tokens = token_ids.dim(0)?;
        if num_tokens == 0 {
            return Err(ModelError::InvalidInput(
                "priming call without a start token".to_string(),
            ));
        }
        let last = token_ids.narrow(0, num_tokens - 1, 1)?;
        let start = self.wte.forward(&last)?;
        let start = start.broadcast_add(&self.wpe.lookup_sequential(start.dim(0)?)?)?;

        let conds = self.prepare_conditioning(conditioning, metadata, start.dtype())?;
        let mut parts = Vec::with_capacity(conds.len() * 2);
        for cond in conds {
            if cond.dim(0)? > 0 {
                parts.push(cond);
            }
            parts.push(start.clone());
        }
        Ok(Tensor::cat(&parts, 0)?)
    }

    fn assemble_logits_only(
        &self,
        token_ids: &Tensor,
        position_ids: &Tensor,
        conditioning: &Conditioning,
        metadata: &AttentionMetadata,
    ) -> Result<Tensor> {
        let num_tokens = token_ids.dim(0)?;
        let alignment = align(conditioning, &metadata.seq_lens, num_tokens)?;
        let spans = match &alignment {
            Alignment::Single { offset } => vec![*offset..num_tokens],
            Alignment::PerRequest(table) => table.entries().iter().map(|e| e.range()).collect(),
        };

        let dtype = self.wte.embeddings().dtype();
        let conds = self.prepare_conditioning(conditioning, metadata, dtype)?;
        let mut parts = Vec::with_capacity(spans.len() * 2);
        for (cond, span) in conds.into_iter().zip(spans) {
            if cond.dim(0)? > 0 {
                parts.push(cond);
            }
            if !span.is_empty() {
                let ids = token_ids.narrow(0, span.start, span.len())?;
                let pos = position_ids.narrow(0, span.start, span.len())?;
                parts.push(self.embed(&ids, &pos)?);
            }
        }
        if parts.is_empty() {
            return Err(ModelError::InvalidInput(
                "logits-only call with no rows to rebuild".to_string(),
            ));
        }
        Ok(Tensor::cat(&parts, 0)?)
    }

    /// Conditioning as `[rows, hidden]` tensors in the model dtype.
    ///
    /// A batch of one (a single tensor or a list holding one) takes the same
    /// path. When that tensor has exactly as many rows as the reported
    /// prefill tokens it comes from capacity profiling: its last row stands
    /// in for the start token and is dropped.
    fn prepare_conditioning(
        &self,
        conditioning: &Conditioning,
        metadata: &AttentionMetadata,
        dtype: DType,
    ) -> Result<Vec<Tensor>> {
        let mut tensors = conditioning.flattened()?;
        for t in &tensors {
            let width = t.dim(1)?;
            if width != self.hidden_size {
                return Err(ModelError::ShapeMismatch {
                    context: "conditioning width",
                    expected: self.hidden_size,
                    actual: width,
                });
            }
        }

        if let [t] = tensors.as_mut_slice() {
            let rows = t.dim(0)?;
            if rows > 0 && rows == metadata.num_prefill_tokens {
                tracing::warn!(
                    rows,
                    num_prefill_tokens = metadata.num_prefill_tokens,
                    "conditioning fills the whole prefill, dropping its last row"
                );
                *t = t.narrow(0, 0, rows - 1)?;
            }
        }

        tensors
            .into_iter()
            .map(|t| Ok(t.to_dtype(dtype)?))
            .collect()
    }
}

fn required(conditioning: Option<&Conditioning>, phase: DecodePhase) -> Result<&Conditioning> {
    conditioning.ok_or_else(|| {
        ModelError::InvalidInput(format!("{phase} call without conditioning embeddings"))
    })
}
