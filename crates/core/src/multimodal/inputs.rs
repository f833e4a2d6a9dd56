//! Conditioning data carried alongside audio-token requests.

use std::collections::BTreeMap;

use candle_core::Tensor;

use crate::error::{ModelError, Result};

/// Externally computed conditioning (voice + text embeddings).
///
/// `Single` serves a homogeneous batch, usually one request. `PerRequest`
/// holds one tensor per request in batch order, each with its own length.
#[derive(Debug, Clone)]
pub enum Conditioning {
    Single(Tensor),
    PerRequest(Vec<Tensor>),
}

impl Conditioning {
    /// Number of conditioning tensors.
    pub fn len(&self) -> usize {
        match self {
            Conditioning::Single(_) => 1,
            Conditioning::PerRequest(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tensors(&self) -> &[Tensor] {
        match self {
            Conditioning::Single(t) => std::slice::from_ref(t),
            Conditioning::PerRequest(v) => v,
        }
    }

    /// Every tensor viewed as `[rows, hidden]`.
    pub fn flattened(&self) -> Result<Vec<Tensor>> {
        self.tensors().iter().map(as_rows).collect()
    }

    /// Rows each tensor contributes once viewed as `[rows, hidden]`.
    pub fn row_counts(&self) -> Result<Vec<usize>> {
        self.tensors().iter().map(rows_of).collect()
    }
}

/// View any conditioning tensor as `[rows, last_dim]`.
pub fn as_rows(t: &Tensor) -> Result<Tensor> {
    let rows = rows_of(t)?;
    let width = t.dims().last().copied().unwrap_or(1);
    Ok(t.reshape((rows, width))?)
}

fn rows_of(t: &Tensor) -> Result<usize> {
    match t.dims() {
        [] => Err(ModelError::UnsupportedConditioning {
            type_name: "scalar tensor".to_string(),
        }),
        [.., 0] => Ok(0),
        [.., width] => Ok(t.elem_count() / width),
    }
}

/// The `is_logits_only_mode` flag as the host may send it.
#[derive(Debug, Clone)]
pub enum LogitsOnlyFlag {
    Bool(bool),
    /// Scalar or per-request truth values; non-zero means set.
    Tensor(Tensor),
}

impl Default for LogitsOnlyFlag {
    fn default() -> Self {
        LogitsOnlyFlag::Bool(false)
    }
}

impl From<bool> for LogitsOnlyFlag {
    fn from(value: bool) -> Self {
        LogitsOnlyFlag::Bool(value)
    }
}

impl LogitsOnlyFlag {
    /// A scalar reads as its value; a batch is set when any element is.
    pub fn is_set(&self) -> Result<bool> {
        match self {
            LogitsOnlyFlag::Bool(b) => Ok(*b),
            LogitsOnlyFlag::Tensor(t) => {
                if t.elem_count() == 0 {
                    return Ok(false);
                }
                let any = t
                    .flatten_all()?
                    .to_dtype(candle_core::DType::F32)?
                    .ne(0f32)?
                    .max(0)?
                    .to_scalar::<u8>()?;
                Ok(any != 0)
            }
        }
    }
}

/// Conditioning as delivered to one forward call.
#[derive(Debug, Clone)]
pub struct ConditioningInputs {
    pub embeds: Conditioning,
    pub is_logits_only_mode: LogitsOnlyFlag,
}

impl ConditioningInputs {
    pub fn new(embeds: Conditioning) -> Self {
        Self {
            embeds,
            is_logits_only_mode: LogitsOnlyFlag::default(),
        }
    }

    pub fn logits_only(mut self, flag: impl Into<LogitsOnlyFlag>) -> Self {
        self.is_logits_only_mode = flag.into();
        self
    }
}

/// Loosely typed multimodal payload as received from the request layer.
#[derive(Debug, Clone)]
pub enum MultiModalValue {
    Tensor(Tensor),
    List(Vec<MultiModalValue>),
    Map(BTreeMap<String, MultiModalValue>),
    Bool(bool),
    Int(i64),
    Text(String),
}

impl MultiModalValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            MultiModalValue::Tensor(_) => "tensor",
            MultiModalValue::List(_) => "list",
            MultiModalValue::Map(_) => "map",
            MultiModalValue::Bool(_) => "bool",
            MultiModalValue::Int(_) => "int",
            MultiModalValue::Text(_) => "text",
        }
    }

    /// Convenience constructor for the `{embeds, is_logits_only_mode}` payload.
    pub fn conditioning(embeds: MultiModalValue, is_logits_only_mode: bool) -> Self {
        let mut map = BTreeMap::new();
        map.insert("embeds".to_string(), embeds);
        map.insert(
            "is_logits_only_mode".to_string(),
            MultiModalValue::Bool(is_logits_only_mode),
        );
        MultiModalValue::Map(map)
    }
}
