use std::fmt;

use candle_core::{DType, Tensor};

use crate::config::XttsGptConfig;
use crate::error::Result;
use crate::multimodal::LogitsOnlyFlag;

/// What a forward call is doing, derived fresh from its inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodePhase {
    /// First call of a request: conditioning plus the start-of-audio token.
    Priming,
    /// One new audio token per request on top of the cache.
    Incremental,
    /// Rebuild hidden states over conditioning and every generated token.
    LogitsOnly,
}

impl fmt::Display for DecodePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DecodePhase::Priming => "priming",
            DecodePhase::Incremental => "incremental",
            DecodePhase::LogitsOnly => "logits_only",
        };
        f.write_str(name)
    }
}

/// Phase of a call over `token_ids`.
///
/// The explicit flag wins. Otherwise a multi-token call made only of the
/// filler and start-of-audio ids is priming; anything else is incremental.
pub fn classify_ids(token_ids: &[u32], logits_only: bool, sentinels: [u32; 2]) -> DecodePhase {
    if logits_only {
        DecodePhase::LogitsOnly
    } else if token_ids.len() > 1 && token_ids.iter().all(|t| sentinels.contains(t)) {
        DecodePhase::Priming
    } else {
        DecodePhase::Incremental
    }
}

/// Classifier bound to a checkpoint's sentinel ids.
#[derive(Debug, Clone, Copy)]
pub struct PhaseClassifier {
    sentinels: [u32; 2],
}

impl PhaseClassifier {
    pub fn new(cfg: &XttsGptConfig) -> Self {
        Self {
            sentinels: [cfg.pad_filler_token, cfg.start_audio_token],
        }
    }

    pub fn classify(&self, token_ids: &Tensor, flag: &LogitsOnlyFlag) -> Result<DecodePhase> {
        let logits_only = flag.is_set()?;
        if logits_only {
            return Ok(DecodePhase::LogitsOnly);
        }
        let ids = token_ids.flatten_all()?.to_dtype(DType::U32)?.to_vec1::<u32>()?;
        Ok(classify_ids(&ids, false, self.sentinels))
    }
}
