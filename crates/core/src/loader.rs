//! Checkpoint weight binding.
//!
//! Every parameter the model builds is declared up front by exact checkpoint
//! name and shape. Supplied tensors are matched against that table; anything
//! undeclared is skipped and anything declared but never supplied is fatal.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;

use crate::config::XttsGptConfig;
use crate::distributed::PipelineRole;
use crate::error::{ModelError, Result};

/// A parameter the model expects, with its shape after any transpose.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSpec {
    pub name: String,
    pub shape: Vec<usize>,
}

impl ParamSpec {
    fn new(name: impl Into<String>, shape: &[usize]) -> Self {
        Self {
            name: name.into(),
            shape: shape.to_vec(),
        }
    }
}

/// Checkpoint stores these projections as `[in, out]`; the model wants
/// `[out, in]`.
pub fn needs_transpose(name: &str) -> bool {
    (name.contains("c_attn") || name.contains("c_proj") || name.contains("c_fc"))
        && name.ends_with(".weight")
}

/// Parameters a stage with `role` owns.
///
/// Token and position tables are always declared (the checkpoint carries them
/// on every stage); transformer layers only for the stage's range.
pub fn parameter_specs(cfg: &XttsGptConfig, role: &PipelineRole) -> Vec<ParamSpec> {
    let h = cfg.hidden_size;
    let inner = cfg.n_inner();
    let mut specs = vec![ParamSpec::new("gpt.wte.weight", &[cfg.num_audio_tokens, h])];
    if let Some(rows) = cfg.position_table_rows() {
        specs.push(ParamSpec::new(
            "gpt.wpe.emb.weight",
            &[rows, cfg.decoder_input_dim()],
        ));
    }

    for i in role.stage_layers.clone() {
        let p = format!("gpt.h.{i}");
        specs.extend([
            ParamSpec::new(format!("{p}.ln_1.weight"), &[h]),
            ParamSpec::new(format!("{p}.ln_1.bias"), &[h]),
            ParamSpec::new(format!("{p}.attn.c_attn.weight"), &[3 * h, h]),
            ParamSpec::new(format!("{p}.attn.c_attn.bias"), &[3 * h]),
            ParamSpec::new(format!("{p}.attn.c_proj.weight"), &[h, h]),
            ParamSpec::new(format!("{p}.attn.c_proj.bias"), &[h]),
            ParamSpec::new(format!("{p}.ln_2.weight"), &[h]),
            ParamSpec::new(format!("{p}.ln_2.bias"), &[h]),
            ParamSpec::new(format!("{p}.mlp.c_fc.weight"), &[inner, h]),
            ParamSpec::new(format!("{p}.mlp.c_fc.bias"), &[inner]),
            ParamSpec::new(format!("{p}.mlp.c_proj.weight"), &[h, inner]),
            ParamSpec::new(format!("{p}.mlp.c_proj.bias"), &[h]),
        ]);
    }

    specs.extend([
        ParamSpec::new("gpt.ln_f.weight", &[h]),
        ParamSpec::new("gpt.ln_f.bias", &[h]),
        ParamSpec::new("final_norm.weight", &[h]),
        ParamSpec::new("final_norm.bias", &[h]),
        ParamSpec::new("mel_head.weight", &[cfg.num_audio_tokens, h]),
        ParamSpec::new("mel_head.bias", &[cfg.num_audio_tokens]),
    ]);
    specs
}

/// Tensors bound to every declared parameter, ready for model construction.
#[derive(Debug, Clone)]
pub struct BoundWeights {
    tensors: HashMap<String, Tensor>,
    skipped: Vec<String>,
}

impl BoundWeights {
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    /// Checkpoint names that matched no declared parameter.
    pub fn skipped(&self) -> &[String] {
        &self.skipped
    }

    pub fn var_builder(&self, dtype: DType, device: &Device) -> VarBuilder<'static> {
        VarBuilder::from_tensors(self.tensors.clone(), dtype, device)
    }
}

/// Bind supplied `(name, tensor)` pairs to `specs`.
pub fn bind_weights<I>(specs: &[ParamSpec], weights: I) -> Result<BoundWeights>
where
    I: IntoIterator<Item = (String, Tensor)>,
{
    let declared: HashMap<&str, &[usize]> = specs
        .iter()
        .map(|s| (s.name.as_str(), s.shape.as_slice()))
        .collect();
    let mut tensors = HashMap::with_capacity(specs.len());
    let mut skipped = Vec::new();

    for (name, tensor) in weights {
        let Some(&expected) = declared.get(name.as_str()) else {
            tracing::debug!(name = %name, "skipping undeclared checkpoint tensor");
            skipped.push(name);
            continue;
        };
        let tensor = if needs_transpose(&name) {
            tensor.t()?.contiguous()?
        } else {
            tensor
        };
        if tensor.dims() != expected {
            return Err(ModelError::WeightShape {
                name,
                expected: expected.to_vec(),
                actual: tensor.dims().to_vec(),
            });
        }
        tensors.insert(name, tensor);
    }

    let missing: BTreeSet<&str> = specs
        .iter()
        .map(|s| s.name.as_str())
        .filter(|n| !tensors.contains_key(*n))
        .collect();
    if !missing.is_empty() {
        return Err(ModelError::MissingWeights {
            names: missing.into_iter().map(String::from).collect(),
        });
    }

    tracing::info!(
        bound = tensors.len(),
        skipped = skipped.len(),
        "bound checkpoint weights"
    );
    Ok(BoundWeights { tensors, skipped })
}

/// Read every tensor out of the given safetensors files, in file order.
pub fn load_safetensors(paths: &[PathBuf], device: &Device) -> Result<Vec<(String, Tensor)>> {
    let mut weights = Vec::new();
    for path in paths {
        let tensors = candle_core::safetensors::load(path, device)?;
        tracing::debug!(path = %path.display(), count = tensors.len(), "read checkpoint file");
        let mut tensors: Vec<_> = tensors.into_iter().collect();
        tensors.sort_by(|a, b| a.0.cmp(&b.0));
        weights.extend(tensors);
    }
    Ok(weights)
}

/// Locate the checkpoint files of a local model directory: `model.safetensors`
/// or the shards listed by `model.safetensors.index.json`.
pub fn safetensor_paths(dir: &Path) -> Result<Vec<PathBuf>> {
    let single = dir.join("model.safetensors");
    if single.is_file() {
        return Ok(vec![single]);
    }

    let index_path = dir.join("model.safetensors.index.json");
    let index = std::fs::read_to_string(&index_path).map_err(|e| {
        ModelError::InvalidInput(format!("cannot read {}: {e}", index_path.display()))
    })?;
    let index: serde_json::Value = serde_json::from_str(&index)
        .map_err(|e| ModelError::InvalidInput(format!("bad {}: {e}", index_path.display())))?;
    let weight_map = index["weight_map"].as_object().ok_or_else(|| {
        ModelError::InvalidInput(format!("missing weight_map in {}", index_path.display()))
    })?;

    let mut filenames: Vec<&str> = weight_map.values().filter_map(|v| v.as_str()).collect();
    filenames.sort_by_key(|f| shard_sort_key(f));
    filenames.dedup();
    Ok(filenames.into_iter().map(|f| dir.join(f)).collect())
}

/// Sort key that orders embedded numbers numerically, so "shard-2" sorts
/// before "shard-10".
fn shard_sort_key(name: &str) -> Vec<std::result::Result<u64, String>> {
    let mut parts = Vec::new();
    let mut rest = name;
    while let Some(c) = rest.chars().next() {
        let is_digit = c.is_ascii_digit();
        let end = rest
            .find(|ch: char| ch.is_ascii_digit() != is_digit)
            .unwrap_or(rest.len());
        let (segment, tail) = rest.split_at(end);
        parts.push(if is_digit {
            Ok(segment.parse().unwrap_or(u64::MAX))
        } else {
            Err(segment.to_string())
        });
        rest = tail;
    }
    parts
}
