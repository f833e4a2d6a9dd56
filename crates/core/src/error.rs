//! Error type shared by the decoder components.

use thiserror::Error;

use crate::distributed::DistributedError;
use crate::kv_cache::CacheError;

#[derive(Error, Debug)]
pub enum ModelError {
    /// Configuration the decoder cannot run; aborts startup.
    #[error("unsupported configuration: {0}")]
    UnsupportedConfig(String),

    /// Declared parameters left unbound after consuming every supplied weight.
    #[error(
        "missing weights: {}; this probably means the checkpoint does not match the model",
        names.join(", ")
    )]
    MissingWeights { names: Vec<String> },

    #[error("weight {name} has shape {actual:?}, expected {expected:?}")]
    WeightShape {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("unsupported conditioning data type: {type_name}")]
    UnsupportedConditioning { type_name: String },

    /// Per-request offsets disagree with the scheduler's sequence lengths.
    #[error(
        "conditioning offsets cover {covered} rows but the packed batch holds {expected} rows"
    )]
    OffsetMismatch { covered: usize, expected: usize },

    #[error("{conditioning} conditioning tensors supplied for {sequences} sequences")]
    ConditioningCount {
        conditioning: usize,
        sequences: usize,
    },

    #[error("shape mismatch in {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{0}")]
    InvalidInput(String),

    #[error("intermediate activation is missing tensor '{0}'")]
    MissingActivation(String),

    #[error("distributed error: {0}")]
    Distributed(#[from] DistributedError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, ModelError>;
