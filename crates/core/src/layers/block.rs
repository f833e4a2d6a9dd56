use candle_core::{Module, Tensor};
use candle_nn::{layer_norm, linear, LayerNorm, Linear, VarBuilder};

use super::attention::{packed_attention, AttentionMetadata};
use super::mlp::GptMlp;
use crate::config::XttsGptConfig;
use crate::error::Result;
use crate::kv_cache::CacheEngine;

/// One transformer layer as seen by the stack driver.
///
/// Input and output are packed `[rows, hidden]`; the layer appends to its own
/// cache and must not touch any slot other than those in `metadata`.
pub trait DecoderBlock: Send + Sync {
    fn forward(
        &self,
        hidden_states: &Tensor,
        cache: &mut CacheEngine,
        metadata: &AttentionMetadata,
    ) -> Result<Tensor>;
}

struct GptAttention {
    c_attn: Linear,
    c_proj: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl GptAttention {
    fn new(cfg: &XttsGptConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let hidden = cfg.hidden_size;
        Ok(Self {
            c_attn: linear(hidden, 3 * hidden, vb.pp("c_attn"))?,
            c_proj: linear(hidden, hidden, vb.pp("c_proj"))?,
            num_heads: cfg.num_attention_heads,
            head_dim: cfg.head_dim(),
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        cache: &mut CacheEngine,
        metadata: &AttentionMetadata,
    ) -> Result<Tensor> {
        let qkv = self.c_attn.forward(xs)?;
        let width = self.num_heads * self.head_dim;
        let q = qkv.narrow(1, 0, width)?;
        let k = qkv.narrow(1, width, width)?;
        let v = qkv.narrow(1, 2 * width, width)?;
        let out = packed_attention(
            &q,
            &k,
            &v,
            metadata,
            cache,
            self.num_heads,
            self.head_dim,
        )?;
        Ok(self.c_proj.forward(&out)?)
    }
}

/// Pre-norm GPT-2 block: `x + attn(ln_1(x))`, then `x + mlp(ln_2(x))`.
pub struct Gpt2Block {
    ln_1: LayerNorm,
    attn: GptAttention,
    ln_2: LayerNorm,
    mlp: GptMlp,
}

impl Gpt2Block {
    pub fn new(cfg: &XttsGptConfig, vb: VarBuilder) -> Result<Self> {
        let eps = cfg.layer_norm_epsilon;
        Ok(Self {
            ln_1: layer_norm(cfg.hidden_size, eps, vb.pp("ln_1"))?,
            attn: GptAttention::new(cfg, vb.pp("attn"))?,
            ln_2: layer_norm(cfg.hidden_size, eps, vb.pp("ln_2"))?,
            mlp: GptMlp::new(cfg.hidden_size, cfg.n_inner(), cfg.activation()?, vb.pp("mlp"))?,
        })
    }
}

impl DecoderBlock for Gpt2Block {
    fn forward(
        &self,
        hidden_states: &Tensor,
        cache: &mut CacheEngine,
        metadata: &AttentionMetadata,
    ) -> Result<Tensor> {
        let residual = hidden_states;
        let xs = self.ln_1.forward(hidden_states)?;
        let xs = (self.attn.forward(&xs, cache, metadata)? + residual)?;
        let residual = &xs;
        let out = self.ln_2.forward(&xs)?.apply(&self.mlp)?;
        Ok((out + residual)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::tiny_config;
    use candle_core::{DType, Device};

    #[test]
    fn zero_weights_are_identity() {
        // Zero projections make both sublayers add nothing to the residual.
        let cfg = tiny_config();
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let block = Gpt2Block::new(&cfg, vb).unwrap();
        let md = AttentionMetadata::prefill(vec![3, 2]).unwrap();
        let mut cache = CacheEngine::new(None);
        let x = Tensor::randn(0f32, 1.0, (5, cfg.hidden_size), &Device::Cpu).unwrap();
        let y = block.forward(&x, &mut cache, &md).unwrap();
        let diff: f32 = (y - &x)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert_eq!(diff, 0.0);
        assert_eq!(cache.cached_len(0), 3);
        assert_eq!(cache.cached_len(1), 2);
    }
}
