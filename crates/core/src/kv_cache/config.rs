use candle_core::{DType, Device};

use crate::config::XttsGptConfig;
use crate::distributed::PipelineRole;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Layers owned by this stage; one cache engine each.
    pub num_layers: usize,
    pub num_heads: usize,
    pub head_dim: usize,
    /// Upper bound on cached tokens per slot, `None` for unbounded.
    pub max_tokens_per_slot: Option<usize>,
    pub dtype: DType,
    pub device: Device,
}

impl CacheConfig {
    /// Cache shape for the layers a pipeline stage owns.
    pub fn for_stage(cfg: &XttsGptConfig, role: &PipelineRole, dtype: DType, device: Device) -> Self {
        Self {
            num_layers: role.num_layers(),
            num_heads: cfg.num_attention_heads,
            head_dim: cfg.head_dim(),
            max_tokens_per_slot: None,
            dtype,
            device,
        }
    }

    pub fn with_max_tokens_per_slot(mut self, max_tokens: usize) -> Self {
        self.max_tokens_per_slot = Some(max_tokens);
        self
    }

    /// Bytes held by one cached token across every owned layer (K and V).
    pub fn bytes_per_token(&self) -> usize {
        2 * self.num_layers * self.num_heads * self.head_dim * self.dtype.size_in_bytes()
    }
}
