//! Key/value cache handed to the transformer blocks.
//!
//! The cache lifecycle belongs to the host: it assigns slots, reports how many
//! tokens each slot already holds through the attention metadata, and frees
//! slots when requests finish. Blocks only append to and read from it.

use std::collections::HashSet;

mod cache_engine;
pub mod config;
mod error;

pub use cache_engine::CacheEngine;
pub use config::CacheConfig;
pub use error::CacheError;

/// One [`CacheEngine`] per layer owned by this pipeline stage.
#[derive(Debug)]
pub struct KVCacheManager {
    engines: Vec<CacheEngine>,
}

impl KVCacheManager {
    pub fn new(config: &CacheConfig) -> Self {
        let engines = (0..config.num_layers)
            .map(|_| CacheEngine::new(config.max_tokens_per_slot))
            .collect();
        Self { engines }
    }

    /// Number of layers this manager holds caches for.
    pub fn num_layers(&self) -> usize {
        self.engines.len()
    }

    /// Cache of the `local_idx`-th owned layer (0 = first layer of the stage).
    pub fn engine_mut(&mut self, local_idx: usize) -> Result<&mut CacheEngine, CacheError> {
        let num_layers = self.engines.len();
        self.engines
            .get_mut(local_idx)
            .ok_or(CacheError::LayerOutOfRange {
                layer: local_idx,
                num_layers,
            })
    }

    pub fn engine(&self, local_idx: usize) -> Option<&CacheEngine> {
        self.engines.get(local_idx)
    }

    /// Check a whole call's appends against every owned layer before any of
    /// them happens. `requests` holds `(slot, context_len, new_tokens)` per
    /// request. On error no cache has been modified.
    pub fn check_batch(&self, requests: &[(usize, usize, usize)]) -> Result<(), CacheError> {
        let mut seen = HashSet::with_capacity(requests.len());
        for &(slot, _, _) in requests {
            if !seen.insert(slot) {
                return Err(CacheError::DuplicateSlot { slot });
            }
        }
        for engine in &self.engines {
            for &(slot, context_len, new_tokens) in requests {
                engine.check_append(slot, context_len, new_tokens)?;
            }
        }
        Ok(())
    }

    /// Release a finished request's history in every layer.
    pub fn free_slot(&mut self, slot: usize) {
        let released: usize = self.engines.iter_mut().map(|e| e.free(slot)).sum();
        tracing::debug!(slot, released, "freed kv cache slot");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};

    fn config(num_layers: usize) -> CacheConfig {
        CacheConfig {
            num_layers,
            num_heads: 2,
            head_dim: 4,
            max_tokens_per_slot: None,
            dtype: DType::F32,
            device: Device::Cpu,
        }
    }

    #[test]
    fn one_engine_per_owned_layer() {
        let mgr = KVCacheManager::new(&config(3));
        assert_eq!(mgr.num_layers(), 3);
        assert!(mgr.engine(2).is_some());
        assert!(mgr.engine(3).is_none());
    }

    #[test]
    fn engine_mut_out_of_range() {
        let mut mgr = KVCacheManager::new(&config(2));
        assert!(matches!(
            mgr.engine_mut(2),
            Err(CacheError::LayerOutOfRange {
                layer: 2,
                num_layers: 2
            })
        ));
    }

    #[test]
    fn check_batch_rejects_before_any_append() {
        let mut mgr = KVCacheManager::new(&config(2));
        let k = Tensor::zeros((1, 2, 3, 4), DType::F32, &Device::Cpu).unwrap();
        for layer in 0..2 {
            mgr.engine_mut(layer).unwrap().append(0, 0, &k, &k).unwrap();
        }

        mgr.check_batch(&[(0, 3, 1)]).unwrap();
        // Slot 1 claims history it does not have.
        assert!(matches!(
            mgr.check_batch(&[(0, 3, 1), (1, 3, 1)]),
            Err(CacheError::ContextMismatch { slot: 1, cached: 0, expected: 3 })
        ));
        assert!(matches!(
            mgr.check_batch(&[(0, 3, 1), (0, 3, 1)]),
            Err(CacheError::DuplicateSlot { slot: 0 })
        ));
        for layer in 0..2 {
            assert_eq!(mgr.engine(layer).unwrap().cached_len(0), 3);
        }
    }

    #[test]
    fn check_batch_sees_capacity() {
        let mut cfg = config(1);
        cfg.max_tokens_per_slot = Some(4);
        let mgr = KVCacheManager::new(&cfg);
        mgr.check_batch(&[(2, 0, 4)]).unwrap();
        assert!(matches!(
            mgr.check_batch(&[(2, 0, 5)]),
            Err(CacheError::CapacityExceeded { requested: 5, .. })
        ));
    }

    #[test]
    fn free_slot_clears_all_layers() {
        let mut mgr = KVCacheManager::new(&config(2));
        let k = Tensor::zeros((1, 2, 3, 4), DType::F32, &Device::Cpu).unwrap();
        for layer in 0..2 {
            mgr.engine_mut(layer).unwrap().append(5, 0, &k, &k).unwrap();
        }
        mgr.free_slot(5);
        for layer in 0..2 {
            assert_eq!(mgr.engine(layer).unwrap().cached_len(5), 0);
        }
    }
}
