//! A model split across pipeline stages must compute what the single-stage
//! model computes.

use std::sync::{Arc, Mutex};
use std::thread;

use candle_core::{DType, Device, Tensor};
use xtts_core::{
    distributed::{ChannelTransport, PipelineRole},
    engine::StageRunner,
    kv_cache::KVCacheManager,
    layers::AttentionMetadata,
    models::{SamplingContext, TokenInputs, XttsGpt},
    multimodal::{Conditioning, ConditioningInputs},
    testing::{full_weight_set, tiny_config},
};

const SEED: u64 = 11;

fn stage(stage_id: usize, num_stages: usize) -> XttsGpt {
    let cfg = tiny_config();
    let role = PipelineRole::for_stage(stage_id, num_stages, cfg.num_hidden_layers).unwrap();
    // Every stage reads the same full checkpoint and keeps only its share.
    let weights = full_weight_set(&cfg, &PipelineRole::single(cfg.num_hidden_layers), SEED);
    XttsGpt::load(cfg, role, weights, DType::F32, &Device::Cpu).unwrap()
}

fn priming() -> (TokenInputs, AttentionMetadata) {
    let cond: Vec<f32> = (0..3 * 16).map(|i| (i as f32 * 0.1).cos() * 0.3).collect();
    let cond = Tensor::from_vec(cond, (3, 16), &Device::Cpu).unwrap();
    let inputs = TokenInputs {
        token_ids: Tensor::new(&[1u32, 1, 1, 1024], &Device::Cpu).unwrap(),
        position_ids: Tensor::new(&[0u32, 1, 2, 3], &Device::Cpu).unwrap(),
        conditioning: Some(ConditioningInputs::new(Conditioning::Single(cond))),
    };
    (inputs, AttentionMetadata::prefill(vec![4]).unwrap())
}

fn decode(token: u32, seq_len: usize) -> (TokenInputs, AttentionMetadata) {
    let inputs = TokenInputs {
        token_ids: Tensor::new(&[token], &Device::Cpu).unwrap(),
        position_ids: Tensor::new(&[(seq_len - 4) as u32], &Device::Cpu).unwrap(),
        conditioning: None,
    };
    (inputs, AttentionMetadata::decode(vec![seq_len]).unwrap())
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .max(0)
        .unwrap()
        .to_scalar::<f32>()
        .unwrap()
}

#[test]
fn two_stages_match_single_stage() {
    let single = stage(0, 1);
    let mut single_kv = KVCacheManager::new(&single.cache_config());

    let first = stage(0, 2);
    let last = stage(1, 2);
    assert_eq!(first.role().stage_layers, 0..1);
    assert_eq!(last.role().stage_layers, 1..2);

    let mut links = ChannelTransport::chain(2, 1);
    let t1 = links.pop().unwrap();
    let t0 = links.pop().unwrap();
    let first_kv = KVCacheManager::new(&first.cache_config());
    let last_kv = KVCacheManager::new(&last.cache_config());
    let mut first = StageRunner::new(first, t0, first_kv);
    let mut last = StageRunner::new(last, t1, last_kv);

    let calls = [priming(), decode(17, 5), decode(230, 6)];
    for (inputs, md) in calls {
        let expected = single
            .forward(inputs.clone().into(), &mut single_kv, &md)
            .unwrap()
            .into_final()
            .unwrap();

        assert!(first.step(Some(inputs), &md).unwrap().is_none());
        let hidden = last.step(None, &md).unwrap().unwrap();
        assert_eq!(hidden.dims(), expected.dims());
        assert!(max_abs_diff(&hidden, &expected) < 1e-5);

        let ctx = SamplingContext::last_token_rows(&md);
        let logits = last.model().compute_logits(&hidden, &ctx).unwrap();
        let expected_logits = single.compute_logits(&expected, &ctx).unwrap();
        assert!(max_abs_diff(&logits, &expected_logits) < 1e-4);
    }
}

#[test]
fn worker_thread_serves_a_schedule() {
    let mut links = ChannelTransport::chain(2, 1);
    let t1 = links.pop().unwrap();
    let t0 = links.pop().unwrap();

    let (prime, prime_md) = priming();
    let (step, step_md) = decode(3, 5);
    let schedule = vec![prime_md.clone(), step_md.clone()];

    let finals = Arc::new(Mutex::new(Vec::new()));
    let worker = {
        let finals = Arc::clone(&finals);
        thread::spawn(move || {
            let model = stage(1, 2);
            let kv = KVCacheManager::new(&model.cache_config());
            let mut runner = StageRunner::new(model, t1, kv);
            for md in schedule {
                let hidden = runner.step(None, &md).unwrap();
                finals.lock().unwrap().push(hidden.map(|h| h.dims().to_vec()));
            }
        })
    };

    let model = stage(0, 2);
    let kv = KVCacheManager::new(&model.cache_config());
    let mut runner = StageRunner::new(model, t0, kv);
    assert!(runner.step(Some(prime), &prime_md).unwrap().is_none());
    assert!(runner.step(Some(step), &step_md).unwrap().is_none());

    worker.join().unwrap();
    let finals = finals.lock().unwrap();
    assert_eq!(*finals, vec![Some(vec![4, 16]), Some(vec![1, 16])]);
}

#[test]
fn only_the_last_stage_computes_logits() {
    let first = stage(0, 2);
    let hidden = Tensor::zeros((1, 16), DType::F32, &Device::Cpu).unwrap();
    assert!(first
        .compute_logits(&hidden, &SamplingContext::default())
        .is_err());
}
