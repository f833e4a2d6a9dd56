use std::collections::HashMap;

use candle_core::Tensor;

use super::error::CacheError;

/// Key/value history of one request in one layer.
/// Both tensors are `[1, num_heads, cached_len, head_dim]`.
#[derive(Debug, Clone)]
struct SlotEntry {
    k: Tensor,
    v: Tensor,
    len: usize,
}

/// Per-layer cache: one contiguous K/V history per slot.
///
/// Slots are handed out by the host scheduler, which also guarantees that at
/// most one forward call touches a slot at a time.
#[derive(Debug, Default)]
pub struct CacheEngine {
    slots: HashMap<usize, SlotEntry>,
    max_tokens_per_slot: Option<usize>,
}

impl CacheEngine {
    pub fn new(max_tokens_per_slot: Option<usize>) -> Self {
        Self {
            slots: HashMap::new(),
            max_tokens_per_slot,
        }
    }

    /// Tokens currently cached for `slot`.
    pub fn cached_len(&self, slot: usize) -> usize {
        self.slots.get(&slot).map_or(0, |e| e.len)
    }

    /// Whether `new_tokens` can be appended to `slot` on top of
    /// `context_len` cached ones, without touching the cache.
    pub fn check_append(
        &self,
        slot: usize,
        context_len: usize,
        new_tokens: usize,
    ) -> Result<(), CacheError> {
        let cached = self.cached_len(slot);
        if cached != context_len {
            return Err(CacheError::ContextMismatch {
                slot,
                cached,
                expected: context_len,
            });
        }
        let requested = cached + new_tokens;
        if let Some(capacity) = self.max_tokens_per_slot {
            if requested > capacity {
                return Err(CacheError::CapacityExceeded {
                    slot,
                    requested,
                    capacity,
                });
            }
        }
        Ok(())
    }

    /// Append new keys/values for `slot` and return the full history.
    ///
    /// `context_len` is the number of tokens the host says are already cached;
    /// it must match what this engine holds. `k`/`v` are
    /// `[1, num_heads, new_tokens, head_dim]`.
    pub fn append(
        &mut self,
        slot: usize,
        context_len: usize,
        k: &Tensor,
        v: &Tensor,
    ) -> Result<(Tensor, Tensor), CacheError> {
        let new_tokens = k.dim(2)?;
        self.check_append(slot, context_len, new_tokens)?;
        let requested = context_len + new_tokens;

        let entry = match self.slots.get(&slot) {
            Some(prev) => SlotEntry {
                k: Tensor::cat(&[&prev.k, k], 2)?,
                v: Tensor::cat(&[&prev.v, v], 2)?,
                len: requested,
            },
            None => SlotEntry {
                k: k.contiguous()?,
                v: v.contiguous()?,
                len: requested,
            },
        };
        let out = (entry.k.clone(), entry.v.clone());
        self.slots.insert(slot, entry);
        Ok(out)
    }

    /// Drop the history of `slot`. Returns the number of tokens released.
    pub fn free(&mut self, slot: usize) -> usize {
        self.slots.remove(&slot).map_or(0, |e| e.len)
    }

    pub fn num_active_slots(&self) -> usize {
        self.slots.len()
    }
}
