//! Error types for pipeline-stage hand-off.

use thiserror::Error;

/// Errors raised while splitting layers across stages or moving activations
/// between them.
#[derive(Error, Debug)]
pub enum DistributedError {
    /// Stage index is out of range for the pipeline.
    #[error("invalid stage {stage_id}: must be < num_stages {num_stages}")]
    InvalidStage { stage_id: usize, num_stages: usize },

    /// Fewer layers than stages; some stage would own nothing.
    #[error("cannot split {num_layers} layers across {num_stages} stages")]
    TooFewLayers { num_layers: usize, num_stages: usize },

    /// The peer end of a stage channel was dropped.
    #[error("stage channel closed while trying to {op}")]
    ChannelClosed { op: &'static str },

    /// Operation is not valid for this stage's position in the pipeline.
    #[error("stage {stage_id} cannot {op}")]
    WrongStage { stage_id: usize, op: &'static str },

    /// Tensor shape mismatch between stages.
    #[error("tensor shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Underlying tensor operation failed.
    #[error("tensor error: {0}")]
    TensorError(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, DistributedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(
            DistributedError::TooFewLayers {
                num_layers: 2,
                num_stages: 3
            }
            .to_string(),
            "cannot split 2 layers across 3 stages"
        );
        assert_eq!(
            DistributedError::ChannelClosed { op: "recv" }.to_string(),
            "stage channel closed while trying to recv"
        );
    }
}
