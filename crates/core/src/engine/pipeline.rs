//! Driving one pipeline stage: receive, forward, hand off.
//!
//! ```text
//! stage 0:    tokens -> assemble -> layers -> send
//! stage 1..:  recv -> layers -> send            (middle)
//!             recv -> layers -> ln_f -> output  (last)
//! ```

use candle_core::Tensor;

use crate::distributed::{PipelineRole, StageOutput, StageTransport};
use crate::error::{ModelError, Result};
use crate::kv_cache::KVCacheManager;
use crate::layers::AttentionMetadata;
use crate::models::{StageInput, TokenInputs, XttsGpt};

/// A model that can run the layers of one pipeline stage.
pub trait StageForward: Send {
    fn role(&self) -> &PipelineRole;

    fn forward_stage(
        &self,
        input: StageInput,
        kv_caches: &mut KVCacheManager,
        metadata: &AttentionMetadata,
    ) -> Result<StageOutput>;
}

impl StageForward for XttsGpt {
    fn role(&self) -> &PipelineRole {
        XttsGpt::role(self)
    }

    fn forward_stage(
        &self,
        input: StageInput,
        kv_caches: &mut KVCacheManager,
        metadata: &AttentionMetadata,
    ) -> Result<StageOutput> {
        self.forward(input, kv_caches, metadata)
    }
}

/// Owns a stage's model, its cache and its link to the neighbouring stages.
pub struct StageRunner<M, T> {
    model: M,
    transport: T,
    kv_caches: KVCacheManager,
}

impl<M: StageForward, T: StageTransport> StageRunner<M, T> {
    pub fn new(model: M, transport: T, kv_caches: KVCacheManager) -> Self {
        Self {
            model,
            transport,
            kv_caches,
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Run one forward call of this stage.
    ///
    /// The first stage needs `tokens`; later stages ignore it and block on
    /// the previous stage. Returns the final hidden states on the last stage
    /// and `None` once the activation has been handed on.
    pub fn step(
        &mut self,
        tokens: Option<TokenInputs>,
        metadata: &AttentionMetadata,
    ) -> Result<Option<Tensor>> {
        let input = if self.model.role().is_first {
            let tokens = tokens.ok_or_else(|| {
                ModelError::InvalidInput("first pipeline stage stepped without tokens".to_string())
            })?;
            StageInput::Tokens(tokens)
        } else {
            StageInput::Received(self.transport.recv()?)
        };

        match self
            .model
            .forward_stage(input, &mut self.kv_caches, metadata)?
        {
            StageOutput::Final(hidden) => Ok(Some(hidden)),
            StageOutput::HandOff(activation) => {
                self.transport.send(activation)?;
                Ok(None)
            }
        }
    }

    /// Serve a non-first stage for every batch layout in `schedule`, in
    /// order. Stops at the first failure; returns the number of completed
    /// steps.
    pub fn run_worker<I>(&mut self, schedule: I) -> Result<usize>
    where
        I: IntoIterator<Item = AttentionMetadata>,
    {
        let role = self.model.role().clone();
        tracing::info!(layers = ?role.stage_layers, is_last = role.is_last, "pipeline worker starting");
        let mut steps = 0;
        for metadata in schedule {
            if let Err(e) = self.step(None, &metadata) {
                tracing::error!(error = %e, step = steps, "pipeline worker step failed");
                return Err(e);
            }
            steps += 1;
        }
        tracing::info!(steps, "pipeline worker finished");
        Ok(steps)
    }

    /// Release a finished request's cache slot.
    pub fn free_slot(&mut self, slot: usize) {
        self.kv_caches.free_slot(slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::{ChannelTransport, IntermediateActivation};
    use candle_core::{DType, Device};

    /// Adds one to the activation; the last stage reports it as final.
    struct PlusOne(PipelineRole);

    impl StageForward for PlusOne {
        fn role(&self) -> &PipelineRole {
            &self.0
        }

        fn forward_stage(
            &self,
            input: StageInput,
            _kv_caches: &mut KVCacheManager,
            _metadata: &AttentionMetadata,
        ) -> Result<StageOutput> {
            let x = match input {
                StageInput::Tokens(t) => t.token_ids.to_dtype(DType::F32)?,
                StageInput::Received(mut a) => a
                    .take(crate::distributed::HIDDEN_STATES)
                    .ok_or_else(|| ModelError::MissingActivation("hidden_states".into()))?,
            };
            let y = (x + 1.0)?;
            if self.0.is_last {
                Ok(StageOutput::Final(y))
            } else {
                Ok(StageOutput::HandOff(IntermediateActivation::from_hidden_states(y)))
            }
        }
    }

    fn empty_caches() -> KVCacheManager {
        KVCacheManager::new(&crate::kv_cache::CacheConfig {
            num_layers: 0,
            num_heads: 1,
            head_dim: 1,
            max_tokens_per_slot: None,
            dtype: DType::F32,
            device: Device::Cpu,
        })
    }

    #[test]
    fn three_stage_chain() {
        let mut links = ChannelTransport::chain(3, 2);
        let t2 = links.pop().unwrap();
        let t1 = links.pop().unwrap();
        let t0 = links.pop().unwrap();
        let roles: Vec<_> = (0..3).map(|s| PipelineRole::for_stage(s, 3, 3).unwrap()).collect();

        let mut first = StageRunner::new(PlusOne(roles[0].clone()), t0, empty_caches());
        let mut middle = StageRunner::new(PlusOne(roles[1].clone()), t1, empty_caches());
        let mut last = StageRunner::new(PlusOne(roles[2].clone()), t2, empty_caches());

        let md = AttentionMetadata::decode(vec![1, 1]).unwrap();
        let tokens = TokenInputs {
            token_ids: Tensor::new(&[10u32, 20], &Device::Cpu).unwrap(),
            position_ids: Tensor::new(&[0u32, 0], &Device::Cpu).unwrap(),
            conditioning: None,
        };

        assert!(first.step(Some(tokens), &md).unwrap().is_none());
        assert!(middle.step(None, &md).unwrap().is_none());
        let out = last.step(None, &md).unwrap().unwrap();
        assert_eq!(out.to_vec1::<f32>().unwrap(), vec![13.0, 23.0]);
    }

    #[test]
    fn first_stage_requires_tokens() {
        let mut links = ChannelTransport::chain(1, 1);
        let mut runner = StageRunner::new(
            PlusOne(PipelineRole::single(1)),
            links.pop().unwrap(),
            empty_caches(),
        );
        let md = AttentionMetadata::decode(vec![1]).unwrap();
        assert!(matches!(runner.step(None, &md), Err(ModelError::InvalidInput(_))));
    }

    #[test]
    fn worker_stops_when_upstream_disappears() {
        let mut links = ChannelTransport::chain(2, 1);
        let t1 = links.pop().unwrap();
        drop(links);
        let role = PipelineRole::for_stage(1, 2, 2).unwrap();
        let mut worker = StageRunner::new(PlusOne(role), t1, empty_caches());
        let md = AttentionMetadata::decode(vec![1]).unwrap();
        assert!(matches!(
            worker.run_worker(vec![md]),
            Err(ModelError::Distributed(_))
        ));
    }
}
