use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::XttsGptConfig;
use crate::distributed::PipelineRole;
use crate::loader::{needs_transpose, parameter_specs};
use crate::models::XttsGpt;

/// Every parameter `role` needs, in checkpoint layout (projections stored
/// `[in, out]`), filled from a seeded RNG.
///
/// Norm weights sit near 1 and everything else is small, so the tiny model
/// produces finite, input-dependent outputs.
pub fn full_weight_set(cfg: &XttsGptConfig, role: &PipelineRole, seed: u64) -> Vec<(String, Tensor)> {
    let mut rng = StdRng::seed_from_u64(seed);
    parameter_specs(cfg, role)
        .into_iter()
        .map(|spec| {
            let mut shape = spec.shape.clone();
            if needs_transpose(&spec.name) {
                shape.reverse();
            }
            let n: usize = shape.iter().product();
            let is_norm_weight = spec.name.ends_with(".weight")
                && (spec.name.contains("ln_") || spec.name.contains("final_norm"));
            let data: Vec<f32> = (0..n)
                .map(|_| {
                    let x: f32 = rng.gen_range(-0.1..0.1);
                    if is_norm_weight {
                        1.0 + x
                    } else {
                        x
                    }
                })
                .collect();
            let tensor = Tensor::from_vec(data, shape, &Device::Cpu)
                .unwrap_or_else(|e| panic!("building {}: {e}", spec.name));
            (spec.name, tensor)
        })
        .collect()
}

/// Tiny model for `role` with weights from [`full_weight_set`].
pub fn tiny_model(role: PipelineRole, seed: u64) -> XttsGpt {
    let cfg = super::tiny_config();
    let weights = full_weight_set(&cfg, &role, seed);
    XttsGpt::load(cfg, role, weights, DType::F32, &Device::Cpu)
        .unwrap_or_else(|e| panic!("loading tiny model: {e}"))
}
