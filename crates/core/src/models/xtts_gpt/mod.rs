//! XTTS-v2 GPT audio-token decoder.
//!
//! Every forward call is classified into a [`DecodePhase`]; the first
//! pipeline stage assembles its input rows accordingly, later stages resume
//! from the received activation, and the last stage feeds the decode head.

mod alignment;
mod assembler;
mod head;
mod phase;
mod stack;

pub use alignment::{align, Alignment, OffsetTable, RequestOffsets};
pub use assembler::HiddenStateAssembler;
pub use head::{DecodeHead, HiddenStateCollector, NormalizedHidden, SamplingContext};
pub use phase::{classify_ids, DecodePhase, PhaseClassifier};
pub use stack::TransformerStack;

use candle_core::{DType, Device, Tensor};
use candle_nn::{embedding, layer_norm, linear};

use crate::config::XttsGptConfig;
use crate::distributed::{IntermediateActivation, PipelineRole, StageOutput, HIDDEN_STATES};
use crate::error::{ModelError, Result};
use crate::kv_cache::{CacheConfig, KVCacheManager};
use crate::layers::{
    AttentionMetadata, DecoderBlock, Gpt2Block, LearnedPositions, PositionEmbedding,
};
use crate::loader::{bind_weights, parameter_specs, BoundWeights};
use crate::multimodal::{Conditioning, ConditioningInputs, LogitsOnlyFlag};

/// Packed request data for the first stage.
#[derive(Debug, Clone)]
pub struct TokenInputs {
    /// `[num_tokens]` audio-token ids, all requests back to back.
    pub token_ids: Tensor,
    /// `[num_tokens]` host positions, parallel to `token_ids`.
    pub position_ids: Tensor,
    pub conditioning: Option<ConditioningInputs>,
}

/// What a stage consumes on one call.
#[derive(Debug)]
pub enum StageInput {
    Tokens(TokenInputs),
    Received(IntermediateActivation),
}

impl From<TokenInputs> for StageInput {
    fn from(inputs: TokenInputs) -> Self {
        StageInput::Tokens(inputs)
    }
}

impl From<IntermediateActivation> for StageInput {
    fn from(activation: IntermediateActivation) -> Self {
        StageInput::Received(activation)
    }
}

pub struct XttsGpt {
    cfg: XttsGptConfig,
    role: PipelineRole,
    classifier: PhaseClassifier,
    assembler: Option<HiddenStateAssembler>,
    stack: TransformerStack,
    head: Option<DecodeHead>,
    dtype: DType,
    device: Device,
}

impl XttsGpt {
    /// Validate `cfg`, bind `weights` and build the parts `role` owns.
    pub fn load<I>(
        cfg: XttsGptConfig,
        role: PipelineRole,
        weights: I,
        dtype: DType,
        device: &Device,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = (String, Tensor)>,
    {
        cfg.validate()?;
        if role.stage_layers.end > cfg.num_hidden_layers || role.stage_layers.is_empty() {
            return Err(ModelError::UnsupportedConfig(format!(
                "stage layers {:?} do not fit a {}-layer model",
                role.stage_layers, cfg.num_hidden_layers
            )));
        }
        let bound = bind_weights(&parameter_specs(&cfg, &role), weights)?;
        Self::from_bound(cfg, role, &bound, dtype, device)
    }

    /// Build from weights already bound against this `cfg` and `role`.
    pub fn from_bound(
        cfg: XttsGptConfig,
        role: PipelineRole,
        weights: &BoundWeights,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let vb = weights.var_builder(dtype, device);
        let h = cfg.hidden_size;
        let eps = cfg.layer_norm_epsilon;

        let assembler = if role.is_first {
            let wte = embedding(cfg.num_audio_tokens, h, vb.pp("gpt.wte"))?;
            let wpe = match cfg.position_table_rows() {
                Some(rows) => PositionEmbedding::Learned(
                    LearnedPositions::new(rows, cfg.decoder_input_dim(), vb.pp("gpt.wpe"))?
                        .with_relative(cfg.relative_position_embeddings),
                ),
                None => PositionEmbedding::null(cfg.decoder_input_dim(), dtype, device),
            };
            Some(HiddenStateAssembler::new(wte, wpe, h))
        } else {
            None
        };

        let blocks = role
            .stage_layers
            .clone()
            .map(|i| {
                let block = Gpt2Block::new(&cfg, vb.pp(format!("gpt.h.{i}")))?;
                Ok(Box::new(block) as Box<dyn DecoderBlock>)
            })
            .collect::<Result<Vec<_>>>()?;

        let (ln_f, head) = if role.is_last {
            let ln_f = layer_norm(h, eps, vb.pp("gpt.ln_f"))?;
            let head = DecodeHead::new(
                layer_norm(h, eps, vb.pp("final_norm"))?,
                linear(h, cfg.num_audio_tokens, vb.pp("mel_head"))?,
                cfg.logit_scale,
            );
            (Some(ln_f), Some(head))
        } else {
            (None, None)
        };

        let stack = TransformerStack::new(blocks, ln_f, role.clone())?;
        tracing::info!(
            first = role.is_first,
            last = role.is_last,
            layers = ?role.stage_layers,
            hidden_size = h,
            ?dtype,
            "xtts gpt stage ready"
        );

        Ok(Self {
            classifier: PhaseClassifier::new(&cfg),
            cfg,
            role,
            assembler,
            stack,
            head,
            dtype,
            device: device.clone(),
        })
    }

    pub fn config(&self) -> &XttsGptConfig {
        &self.cfg
    }

    pub fn role(&self) -> &PipelineRole {
        &self.role
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Cache shape matching the layers this stage owns.
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig::for_stage(&self.cfg, &self.role, self.dtype, self.device.clone())
    }

    /// Phase of a first-stage call.
    pub fn classify(&self, inputs: &TokenInputs) -> Result<DecodePhase> {
        let default_flag = LogitsOnlyFlag::default();
        let flag = inputs
            .conditioning
            .as_ref()
            .map_or(&default_flag, |c| &c.is_logits_only_mode);
        self.classifier.classify(&inputs.token_ids, flag)
    }

    /// One forward call of this stage.
    ///
    /// The first stage classifies and assembles from tokens; other stages
    /// take the received `hidden_states` unchanged. Returns the final
    /// normalized hidden states on the last stage, an activation to forward
    /// otherwise.
    pub fn forward(
        &self,
        input: StageInput,
        kv_caches: &mut KVCacheManager,
        metadata: &AttentionMetadata,
    ) -> Result<StageOutput> {
        let hidden_states = match (input, &self.assembler) {
            (StageInput::Tokens(inputs), Some(assembler)) => {
                let phase = self.classify(&inputs)?;
                tracing::debug!(
                    %phase,
                    seqs = metadata.num_seqs(),
                    prefill_tokens = metadata.num_prefill_tokens,
                    "forward"
                );
                assembler.assemble(
                    phase,
                    &inputs.token_ids,
                    &inputs.position_ids,
                    inputs.conditioning.as_ref().map(|c| &c.embeds),
                    metadata,
                )?
            }
            (StageInput::Received(mut activation), None) => activation
                .take(HIDDEN_STATES)
                .ok_or_else(|| ModelError::MissingActivation(HIDDEN_STATES.to_string()))?,
            (StageInput::Tokens(_), None) => {
                return Err(ModelError::InvalidInput(
                    "only the first pipeline stage accepts token inputs".to_string(),
                ))
            }
            (StageInput::Received(_), Some(_)) => {
                return Err(ModelError::InvalidInput(
                    "the first pipeline stage does not receive activations".to_string(),
                ))
            }
        };

        self.stack.run(hidden_states.to_dtype(self.dtype)?, kv_caches, metadata)
    }

    /// Logits over the audio vocabulary for final hidden states.
    pub fn compute_logits(&self, hidden_states: &Tensor, ctx: &SamplingContext) -> Result<Tensor> {
        let head = self.head.as_ref().ok_or_else(|| {
            ModelError::InvalidInput("only the last pipeline stage computes logits".to_string())
        })?;
        head.compute_logits(hidden_states, ctx)
    }
}

/// Index at which each request's start-of-audio token lands when the
/// conditioning tensors are primed back to back, each followed by its start
/// token.
pub fn start_token_indices(conditioning: &Conditioning) -> Result<Vec<usize>> {
    let mut indices = Vec::with_capacity(conditioning.len());
    let mut current = 0;
    for rows in conditioning.row_counts()? {
        current += rows;
        indices.push(current);
        current += 1;
    }
    Ok(indices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{full_weight_set, tiny_config, tiny_model};

    #[test]
    fn start_token_indices_follow_each_segment() {
        let dev = Device::Cpu;
        let cond = Conditioning::PerRequest(vec![
            Tensor::zeros((3, 4), DType::F32, &dev).unwrap(),
            Tensor::zeros((2, 4), DType::F32, &dev).unwrap(),
            Tensor::zeros((0, 4), DType::F32, &dev).unwrap(),
        ]);
        assert_eq!(start_token_indices(&cond).unwrap(), vec![3, 7, 8]);
    }

    #[test]
    fn stage_parts_follow_role() {
        let first = tiny_model(PipelineRole::for_stage(0, 2, 2).unwrap(), 1);
        assert!(first.assembler.is_some());
        assert!(first.head.is_none());
        assert_eq!(first.cache_config().num_layers, 1);

        let last = tiny_model(PipelineRole::for_stage(1, 2, 2).unwrap(), 1);
        assert!(last.assembler.is_none());
        assert!(last.head.is_some());
    }

    #[test]
    fn relative_positions_follow_config() {
        let is_relative = |model: &XttsGpt| match model.assembler.as_ref().map(|a| a.positions()) {
            Some(PositionEmbedding::Learned(l)) => l.is_relative(),
            _ => panic!("first stage without a learned position table"),
        };
        assert!(!is_relative(&tiny_model(PipelineRole::single(2), 0)));

        let mut cfg = tiny_config();
        cfg.relative_position_embeddings = true;
        let role = PipelineRole::single(2);
        let weights = full_weight_set(&cfg, &role, 0);
        let model = XttsGpt::load(cfg, role, weights, DType::F32, &Device::Cpu).unwrap();
        assert!(is_relative(&model));
    }

    #[test]
    fn load_rejects_stage_outside_model() {
        let cfg = tiny_config();
        let role = PipelineRole {
            is_first: true,
            is_last: true,
            stage_layers: 0..3,
        };
        let weights = full_weight_set(&cfg, &PipelineRole::single(2), 0);
        assert!(matches!(
            XttsGpt::load(cfg, role, weights, DType::F32, &Device::Cpu),
            Err(ModelError::UnsupportedConfig(_))
        ));
    }

    #[test]
    fn load_rejects_unsupported_attention() {
        let mut cfg = tiny_config();
        cfg.add_cross_attention = true;
        let role = PipelineRole::single(2);
        let weights = full_weight_set(&tiny_config(), &role, 0);
        assert!(matches!(
            XttsGpt::load(cfg, role, weights, DType::F32, &Device::Cpu),
            Err(ModelError::UnsupportedConfig(_))
        ));
    }

    #[test]
    fn wrong_input_kind_for_stage() {
        let model = tiny_model(PipelineRole::single(2), 0);
        let mut caches = KVCacheManager::new(&model.cache_config());
        let md = AttentionMetadata::decode(vec![1]).unwrap();
        let act = IntermediateActivation::new();
        assert!(matches!(
            model.forward(StageInput::Received(act), &mut caches, &md),
            Err(ModelError::InvalidInput(_))
        ));

        let last = tiny_model(PipelineRole::for_stage(1, 2, 2).unwrap(), 0);
        let mut caches = KVCacheManager::new(&last.cache_config());
        assert!(matches!(
            last.forward(StageInput::Received(IntermediateActivation::new()), &mut caches, &md),
            Err(ModelError::MissingActivation(_))
        ));
    }
}
