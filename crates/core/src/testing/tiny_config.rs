use crate::config::XttsGptConfig;

/// Create a tiny XTTS-like decoder config (2 layers, 16 hidden, 4 heads).
///
/// Keeps the real audio vocabulary so the default start token (1024) and
/// filler (1) are valid ids.
pub fn tiny_config() -> XttsGptConfig {
    XttsGptConfig {
        hidden_size: 16,
        num_attention_heads: 4,
        num_hidden_layers: 2,
        n_inner: Some(32),
        layer_norm_epsilon: 1e-5,
        activation_function: "gelu_new".to_string(),
        num_audio_tokens: 1026,
        max_audio_tokens: 61,
        decoder_input_dim: None,
        start_audio_token: 1024,
        pad_filler_token: 1,
        logit_scale: 1.0,
        conditioning_tokens: 32,
        relative_position_embeddings: false,
        add_cross_attention: false,
        scale_attn_by_inverse_layer_idx: false,
        reorder_and_upcast_attn: false,
        extra: serde_json::Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiny_config_is_valid() {
        let cfg = tiny_config();
        cfg.validate().unwrap();
        assert_eq!(cfg.head_dim(), 4);
        assert_eq!(cfg.position_table_rows(), Some(64));
    }
}
