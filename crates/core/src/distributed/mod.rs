//! Pipeline-parallel execution across processes or threads.
//!
//! A process learns its [`PipelineRole`] once at startup. Non-first stages
//! receive an [`IntermediateActivation`] through a [`StageTransport`],
//! non-last stages hand one on.

mod error;
mod pipeline;
mod transport;

pub use error::{DistributedError, Result};
pub use pipeline::{IntermediateActivation, PipelineRole, StageOutput, HIDDEN_STATES};
pub use transport::{ChannelTransport, StageTransport};
