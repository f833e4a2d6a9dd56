//! Execution around the model: per-stage stepping for pipelined deployments.

mod pipeline;

pub use pipeline::{StageForward, StageRunner};
