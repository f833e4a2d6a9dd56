use serde::Deserialize;

use crate::error::ModelError;

fn default_layer_norm_epsilon() -> f64 {
    1e-5
}

fn default_activation() -> String {
    "gelu_new".to_string()
}

fn default_start_audio_token() -> u32 {
    1024
}

fn default_pad_filler_token() -> u32 {
    1
}

fn default_logit_scale() -> f64 {
    1.0
}

fn default_conditioning_tokens() -> usize {
    32
}

/// Configuration of the XTTS-v2 GPT decoder, as found in the checkpoint's
/// `config.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct XttsGptConfig {
    pub hidden_size: usize,
    pub num_attention_heads: usize,
    pub num_hidden_layers: usize,
    #[serde(default)]
    pub n_inner: Option<usize>,
    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f64,
    #[serde(default = "default_activation")]
    pub activation_function: String,

    /// Audio-token vocabulary size (embedding rows and head width).
    pub num_audio_tokens: usize,
    /// Learned position table holds `max_audio_tokens + 3` rows; `-1` disables it.
    pub max_audio_tokens: i64,
    #[serde(default)]
    pub decoder_input_dim: Option<usize>,

    #[serde(default = "default_start_audio_token")]
    pub start_audio_token: u32,
    #[serde(default = "default_pad_filler_token")]
    pub pad_filler_token: u32,
    #[serde(default = "default_logit_scale")]
    pub logit_scale: f64,
    #[serde(default = "default_conditioning_tokens")]
    pub conditioning_tokens: usize,
    /// Start fresh position windows at a random offset instead of 0.
    #[serde(default)]
    pub relative_position_embeddings: bool,

    #[serde(default)]
    pub add_cross_attention: bool,
    #[serde(default)]
    pub scale_attn_by_inverse_layer_idx: bool,
    #[serde(default)]
    pub reorder_and_upcast_attn: bool,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl XttsGptConfig {
    /// Parse a `config.json` payload.
    pub fn from_json(json: &str) -> Result<Self, ModelError> {
        serde_json::from_str(json).map_err(|e| ModelError::UnsupportedConfig(e.to_string()))
    }

    pub fn n_inner(&self) -> usize {
        self.n_inner.unwrap_or(4 * self.hidden_size)
    }

    pub fn decoder_input_dim(&self) -> usize {
        self.decoder_input_dim.unwrap_or(self.hidden_size)
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Rows of the learned position table, `None` when positions are disabled.
    pub fn position_table_rows(&self) -> Option<usize> {
        if self.max_audio_tokens == -1 {
            None
        } else {
            Some(self.max_audio_tokens as usize + 3)
        }
    }

    pub fn activation(&self) -> Result<candle_nn::Activation, ModelError> {
        match self.activation_function.as_str() {
            "gelu_new" => Ok(candle_nn::Activation::NewGelu),
            "gelu" => Ok(candle_nn::Activation::Gelu),
            "relu" => Ok(candle_nn::Activation::Relu),
            "silu" | "swish" => Ok(candle_nn::Activation::Silu),
            other => Err(ModelError::UnsupportedConfig(format!(
                "unknown activation function '{other}'"
            ))),
        }
    }

    /// Reject attention shapes and sizes the decoder cannot run.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.add_cross_attention {
            return Err(ModelError::UnsupportedConfig(
                "cross-attention is not supported".into(),
            ));
        }
        if self.scale_attn_by_inverse_layer_idx {
            return Err(ModelError::UnsupportedConfig(
                "attention scaling by inverse layer index is not supported".into(),
            ));
        }
        if self.reorder_and_upcast_attn {
            return Err(ModelError::UnsupportedConfig(
                "attention reorder-and-upcast is not supported".into(),
            ));
        }
        if self.num_hidden_layers == 0 {
            return Err(ModelError::UnsupportedConfig(
                "num_hidden_layers must be > 0".into(),
            ));
        }
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            return Err(ModelError::UnsupportedConfig(format!(
                "hidden_size ({}) must be divisible by num_attention_heads ({})",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if self.max_audio_tokens < -1 {
            return Err(ModelError::UnsupportedConfig(format!(
                "max_audio_tokens must be >= -1, got {}",
                self.max_audio_tokens
            )));
        }
        if self.position_table_rows().is_some() && self.decoder_input_dim() != self.hidden_size {
            return Err(ModelError::UnsupportedConfig(format!(
                "decoder_input_dim ({}) must equal hidden_size ({})",
                self.decoder_input_dim(),
                self.hidden_size
            )));
        }
        self.activation()?;
        Ok(())
    }
}
