//! Learned absolute positions for the audio-token stream.

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Embedding, VarBuilder};
use rand::Rng;

use crate::error::{ModelError, Result};

/// Position table, or the null provider when the checkpoint has none.
#[derive(Debug, Clone)]
pub enum PositionEmbedding {
    Learned(LearnedPositions),
    /// Every lookup yields zero rows of width `dim`.
    Null {
        dim: usize,
        dtype: DType,
        device: Device,
    },
}

#[derive(Debug, Clone)]
pub struct LearnedPositions {
    emb: Embedding,
    num_positions: usize,
    dim: usize,
    relative: bool,
}

impl LearnedPositions {
    pub fn new(num_positions: usize, dim: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        let emb = candle_nn::embedding(num_positions, dim, vb.pp("emb"))?;
        Ok(Self {
            emb,
            num_positions,
            dim,
            relative: false,
        })
    }

    /// Sample a random window start for sequential lookups.
    pub fn with_relative(mut self, relative: bool) -> Self {
        self.relative = relative;
        self
    }

    pub fn num_positions(&self) -> usize {
        self.num_positions
    }

    pub fn is_relative(&self) -> bool {
        self.relative
    }
}

impl PositionEmbedding {
    pub fn null(dim: usize, dtype: DType, device: &Device) -> Self {
        PositionEmbedding::Null {
            dim,
            dtype,
            device: device.clone(),
        }
    }

    pub fn dim(&self) -> usize {
        match self {
            PositionEmbedding::Learned(l) => l.dim,
            PositionEmbedding::Null { dim, .. } => *dim,
        }
    }

    /// One row per index of the 1-D `positions`, in order. `[n, dim]`.
    pub fn lookup_batch(&self, positions: &Tensor) -> Result<Tensor> {
        let positions = positions.flatten_all()?;
        match self {
            PositionEmbedding::Learned(l) => {
                check_range(&positions, l.num_positions)?;
                Ok(l.emb.forward(&positions)?)
            }
            PositionEmbedding::Null { .. } => self.zeros(positions.dim(0)?),
        }
    }

    /// Fresh sequential positions for a window of `len` rows.
    ///
    /// Starts at 0, or at a random offset in relative mode.
    pub fn lookup_sequential(&self, len: usize) -> Result<Tensor> {
        self.lookup_sequential_with_rng(len, &mut rand::thread_rng())
    }

    pub fn lookup_sequential_with_rng<R: Rng + ?Sized>(
        &self,
        len: usize,
        rng: &mut R,
    ) -> Result<Tensor> {
        match self {
            PositionEmbedding::Learned(l) => {
                if len > l.num_positions {
                    return Err(ModelError::InvalidInput(format!(
                        "{len} positions requested from a table of {}",
                        l.num_positions
                    )));
                }
                let start = if l.relative {
                    rng.gen_range(len..=l.num_positions) - len
                } else {
                    0
                };
                let device = l.emb.embeddings().device();
                let positions = Tensor::arange(start as u32, (start + len) as u32, device)?;
                self.lookup_batch(&positions)
            }
            PositionEmbedding::Null { .. } => self.zeros(len),
        }
    }

    /// Externally supplied positions: a scalar yields one row, a 1-D tensor
    /// one row per request (indices may differ per request). `[n, dim]`.
    pub fn lookup_single_step(&self, positions: &Tensor) -> Result<Tensor> {
        match positions.rank() {
            0 => self.lookup_batch(&positions.reshape(1)?),
            1 => self.lookup_batch(positions),
            rank => Err(ModelError::InvalidInput(format!(
                "position ids must be a scalar or 1-D, got rank {rank}"
            ))),
        }
    }

    fn zeros(&self, rows: usize) -> Result<Tensor> {
        match self {
            PositionEmbedding::Null { dim, dtype, device } => {
                Ok(Tensor::zeros((rows, *dim), *dtype, device)?)
            }
            PositionEmbedding::Learned(l) => {
                let table = l.emb.embeddings();
                Ok(Tensor::zeros((rows, l.dim), table.dtype(), table.device())?)
            }
        }
    }
}

fn check_range(positions: &Tensor, num_positions: usize) -> Result<()> {
    if positions.elem_count() == 0 {
        return Ok(());
    }
    let max = positions
        .to_dtype(DType::U32)?
        .max(0)?
        .to_scalar::<u32>()? as usize;
    if max >= num_positions {
        return Err(ModelError::InvalidInput(format!(
            "position {max} is outside the table of {num_positions} positions"
        )));
    }
    Ok(())
}
