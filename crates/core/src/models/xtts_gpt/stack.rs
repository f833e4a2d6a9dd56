use candle_core::{Module, Tensor};
use candle_nn::LayerNorm;

use crate::distributed::{IntermediateActivation, PipelineRole, StageOutput};
use crate::error::{ModelError, Result};
use crate::kv_cache::KVCacheManager;
use crate::layers::{AttentionMetadata, DecoderBlock};

/// The transformer layers owned by this stage, plus `ln_f` on the last stage.
pub struct TransformerStack {
    blocks: Vec<Box<dyn DecoderBlock>>,
    ln_f: Option<LayerNorm>,
    role: PipelineRole,
}

impl TransformerStack {
    /// `ln_f` must be present exactly when `role.is_last`.
    pub fn new(
        blocks: Vec<Box<dyn DecoderBlock>>,
        ln_f: Option<LayerNorm>,
        role: PipelineRole,
    ) -> Result<Self> {
        if blocks.len() != role.num_layers() {
            return Err(ModelError::ShapeMismatch {
                context: "stage layers",
                expected: role.num_layers(),
                actual: blocks.len(),
            });
        }
        if ln_f.is_some() != role.is_last {
            return Err(ModelError::UnsupportedConfig(
                "final layer norm belongs to the last pipeline stage only".to_string(),
            ));
        }
        Ok(Self { blocks, ln_f, role })
    }

    pub fn role(&self) -> &PipelineRole {
        &self.role
    }

    pub fn num_layers(&self) -> usize {
        self.blocks.len()
    }

    /// Run the owned layers over `[rows, hidden]` input.
    ///
    /// Non-last stages return the raw activation for hand-off; the last stage
    /// returns `ln_f`-normalized hidden states.
    pub fn run(
        &self,
        hidden_states: Tensor,
        kv_caches: &mut KVCacheManager,
        metadata: &AttentionMetadata,
    ) -> Result<StageOutput> {
        let rows = hidden_states.dim(0)?;
        let expected = metadata.total_query_tokens();
        if rows != expected {
            return Err(ModelError::ShapeMismatch {
                context: "stack input rows",
                expected,
                actual: rows,
            });
        }
        if kv_caches.num_layers() != self.blocks.len() {
            return Err(ModelError::ShapeMismatch {
                context: "kv cache layers",
                expected: self.blocks.len(),
                actual: kv_caches.num_layers(),
            });
        }

        // Reject the call before any layer appends, so a bad request cannot
        // leave the other requests' slots half grown.
        kv_caches.check_batch(&metadata.cache_appends())?;

        let mut hidden_states = hidden_states;
        for (local, block) in self.blocks.iter().enumerate() {
            hidden_states = block.forward(&hidden_states, kv_caches.engine_mut(local)?, metadata)?;
        }

        match &self.ln_f {
            Some(ln_f) => Ok(StageOutput::Final(ln_f.forward(&hidden_states)?)),
            None => Ok(StageOutput::HandOff(IntermediateActivation::from_hidden_states(
                hidden_states,
            ))),
        }
    }
}
