//! Pipeline parallelism: which layers this process owns and what it hands on.
//!
//! ```text
//! Stage 0              Stage 1              Stage 2
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │ embed        │     │              │     │              │
//! │ layers 0-9   │ --> │ layers 10-19 │ --> │ layers 20-29 │
//! │              │     │              │     │ ln_f         │
//! └──────────────┘     └──────────────┘     └──────────────┘
//!   hand-off             hand-off             final hidden
//! ```
//!
//! Only the first stage assembles input embeddings; every later stage resumes
//! from the `hidden_states` activation of its predecessor.

use std::collections::HashMap;
use std::ops::Range;

use candle_core::Tensor;

use super::error::{DistributedError, Result};

/// Name under which hidden states travel between stages.
pub const HIDDEN_STATES: &str = "hidden_states";

/// Position of this process in the pipeline, fixed at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineRole {
    /// Assembles embeddings from tokens and conditioning.
    pub is_first: bool,
    /// Applies the final norm and feeds the decode head.
    pub is_last: bool,
    /// Global indices of the transformer layers this stage runs.
    pub stage_layers: Range<usize>,
}

impl PipelineRole {
    /// Role of a process that runs the whole stack.
    pub fn single(num_layers: usize) -> Self {
        Self {
            is_first: true,
            is_last: true,
            stage_layers: 0..num_layers,
        }
    }

    /// Role of `stage_id` when `num_layers` are split evenly over `num_stages`.
    ///
    /// Earlier stages take one extra layer when the split is uneven.
    pub fn for_stage(stage_id: usize, num_stages: usize, num_layers: usize) -> Result<Self> {
        if stage_id >= num_stages {
            return Err(DistributedError::InvalidStage {
                stage_id,
                num_stages,
            });
        }
        if num_layers < num_stages {
            return Err(DistributedError::TooFewLayers {
                num_layers,
                num_stages,
            });
        }

        let base = num_layers / num_stages;
        let extra = num_layers % num_stages;
        let count = if stage_id < extra { base + 1 } else { base };
        let first = if stage_id < extra {
            stage_id * (base + 1)
        } else {
            extra * (base + 1) + (stage_id - extra) * base
        };

        Ok(Self {
            is_first: stage_id == 0,
            is_last: stage_id == num_stages - 1,
            stage_layers: first..first + count,
        })
    }

    pub fn num_layers(&self) -> usize {
        self.stage_layers.len()
    }

    pub fn owns_layer(&self, layer: usize) -> bool {
        self.stage_layers.contains(&layer)
    }
}

/// Named tensors exchanged between stages. Sending moves the bundle; the
/// sender keeps nothing.
#[derive(Debug, Clone, Default)]
pub struct IntermediateActivation {
    tensors: HashMap<String, Tensor>,
}

impl IntermediateActivation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_hidden_states(hidden_states: Tensor) -> Self {
        let mut tensors = HashMap::with_capacity(1);
        tensors.insert(HIDDEN_STATES.to_string(), hidden_states);
        Self { tensors }
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn take(&mut self, name: &str) -> Option<Tensor> {
        self.tensors.remove(name)
    }

    pub fn hidden_states(&self) -> Option<&Tensor> {
        self.get(HIDDEN_STATES)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

/// Result of running one stage.
#[derive(Debug)]
pub enum StageOutput {
    /// Normalized hidden states from the last stage, `[rows, hidden]`.
    Final(Tensor),
    /// Activation the caller must deliver to the next stage.
    HandOff(IntermediateActivation),
}

impl StageOutput {
    pub fn is_final(&self) -> bool {
        matches!(self, StageOutput::Final(_))
    }

    pub fn into_final(self) -> Option<Tensor> {
        match self {
            StageOutput::Final(t) => Some(t),
            StageOutput::HandOff(_) => None,
        }
    }

    pub fn into_hand_off(self) -> Option<IntermediateActivation> {
        match self {
            StageOutput::HandOff(a) => Some(a),
            StageOutput::Final(_) => None,
        }
    }
}
