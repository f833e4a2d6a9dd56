use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    /// The cached history of a slot does not match the context the host reported.
    #[error("slot {slot} holds {cached} cached tokens, expected {expected}")]
    ContextMismatch {
        slot: usize,
        cached: usize,
        expected: usize,
    },

    #[error("slot {slot} would hold {requested} tokens, capacity is {capacity}")]
    CapacityExceeded {
        slot: usize,
        requested: usize,
        capacity: usize,
    },

    #[error("slot {slot} appears more than once in one call")]
    DuplicateSlot { slot: usize },

    #[error("layer {layer} is not owned by this cache (owns {num_layers} layers)")]
    LayerOutOfRange { layer: usize, num_layers: usize },

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_context_mismatch() {
        let e = CacheError::ContextMismatch {
            slot: 3,
            cached: 10,
            expected: 12,
        };
        assert_eq!(e.to_string(), "slot 3 holds 10 cached tokens, expected 12");
    }

    #[test]
    fn error_display_capacity() {
        let e = CacheError::CapacityExceeded {
            slot: 0,
            requested: 700,
            capacity: 608,
        };
        assert_eq!(
            e.to_string(),
            "slot 0 would hold 700 tokens, capacity is 608"
        );
    }
}
