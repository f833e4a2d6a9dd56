use std::ops::Range;

use candle_core::Tensor;

use super::mask::causal_mask;
use crate::error::{ModelError, Result};
use crate::kv_cache::CacheEngine;

/// Per-call batch layout supplied by the host scheduler.
///
/// Requests are packed back to back with prefills first. A prefill
/// contributes `seq_len` query rows, a decode contributes one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttentionMetadata {
    /// Total length (cached + new) of every request, in packed order.
    pub seq_lens: Vec<usize>,
    /// Leading requests that are prefills.
    pub num_prefills: usize,
    /// Prompt tokens across all prefills in this call.
    pub num_prefill_tokens: usize,
    /// Cache slot of every request.
    pub slots: Vec<usize>,
}

impl AttentionMetadata {
    pub fn new(seq_lens: Vec<usize>, num_prefills: usize, slots: Vec<usize>) -> Result<Self> {
        if slots.len() != seq_lens.len() {
            return Err(ModelError::ShapeMismatch {
                context: "attention metadata slots",
                expected: seq_lens.len(),
                actual: slots.len(),
            });
        }
        if num_prefills > seq_lens.len() {
            return Err(ModelError::InvalidInput(format!(
                "{num_prefills} prefills declared for {} sequences",
                seq_lens.len()
            )));
        }
        if let Some(i) = seq_lens.iter().position(|&l| l == 0) {
            return Err(ModelError::InvalidInput(format!(
                "sequence {i} has zero length"
            )));
        }
        let num_prefill_tokens = seq_lens[..num_prefills].iter().sum();
        Ok(Self {
            seq_lens,
            num_prefills,
            num_prefill_tokens,
            slots,
        })
    }

    /// Every request is a prefill; slots are `0..n`.
    pub fn prefill(seq_lens: Vec<usize>) -> Result<Self> {
        let n = seq_lens.len();
        Self::new(seq_lens, n, (0..n).collect())
    }

    /// Every request decodes one token; slots are `0..n`.
    pub fn decode(seq_lens: Vec<usize>) -> Result<Self> {
        let n = seq_lens.len();
        Self::new(seq_lens, 0, (0..n).collect())
    }

    pub fn num_seqs(&self) -> usize {
        self.seq_lens.len()
    }

    pub fn is_prefill(&self, seq: usize) -> bool {
        seq < self.num_prefills
    }

    pub fn query_len(&self, seq: usize) -> usize {
        if self.is_prefill(seq) {
            self.seq_lens[seq]
        } else {
            1
        }
    }

    /// Tokens already cached before this call.
    pub fn context_len(&self, seq: usize) -> usize {
        self.seq_lens[seq] - self.query_len(seq)
    }

    /// Rows the packed hidden states must have.
    pub fn total_query_tokens(&self) -> usize {
        (0..self.num_seqs()).map(|i| self.query_len(i)).sum()
    }

    /// `(slot, context_len, new_tokens)` of every request, the cache
    /// appends this call makes in each layer.
    pub fn cache_appends(&self) -> Vec<(usize, usize, usize)> {
        (0..self.num_seqs())
            .map(|i| (self.slots[i], self.context_len(i), self.query_len(i)))
            .collect()
    }

    /// Row range of every request inside the packed hidden states.
    pub fn query_ranges(&self) -> Vec<Range<usize>> {
        let mut start = 0;
        (0..self.num_seqs())
            .map(|i| {
                let len = self.query_len(i);
                let range = start..start + len;
                start += len;
                range
            })
            .collect()
    }
}

/// Multi-head self-attention over packed rows, one request at a time.
///
/// `q`, `k`, `v` are `[rows, num_heads * head_dim]`. New keys and values are
/// appended to each request's cache slot; queries attend to the full history,
/// causally within the new rows. Returns `[rows, num_heads * head_dim]`.
pub fn packed_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    metadata: &AttentionMetadata,
    cache: &mut CacheEngine,
    num_heads: usize,
    head_dim: usize,
) -> Result<Tensor> {
    let rows = q.dim(0)?;
    let expected = metadata.total_query_tokens();
    if rows != expected {
        return Err(ModelError::ShapeMismatch {
            context: "attention query rows",
            expected,
            actual: rows,
        });
    }

    let scale = 1.0 / (head_dim as f64).sqrt();
    let mut outputs = Vec::with_capacity(metadata.num_seqs());
    for (seq, range) in metadata.query_ranges().into_iter().enumerate() {
        let q_len = range.len();
        let split = |t: &Tensor| -> candle_core::Result<Tensor> {
            t.narrow(0, range.start, q_len)?
                .reshape((q_len, num_heads, head_dim))?
                .transpose(0, 1)?
                .unsqueeze(0)?
                .contiguous()
        };
        let (q_i, k_i, v_i) = (split(q)?, split(k)?, split(v)?);

        let context_len = metadata.context_len(seq);
        let (k_full, v_full) = cache.append(metadata.slots[seq], context_len, &k_i, &v_i)?;

        let weights = (q_i.matmul(&k_full.transpose(2, 3)?.contiguous()?)? * scale)?;
        let weights = if q_len > 1 {
            let mask = causal_mask(q_len, context_len, weights.dtype(), weights.device())?;
            weights.broadcast_add(&mask)?
        } else {
            weights
        };
        let weights = candle_nn::ops::softmax_last_dim(&weights)?;
        let out = weights
            .matmul(&v_full)?
            .squeeze(0)?
            .transpose(0, 1)?
            .reshape((q_len, num_heads * head_dim))?;
        outputs.push(out);
    }
    Ok(Tensor::cat(&outputs, 0)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn metadata_layout() {
        let md = AttentionMetadata::new(vec![5, 4, 9, 3], 2, vec![10, 11, 12, 13]).unwrap();
        assert_eq!(md.num_prefill_tokens, 9);
        assert_eq!(md.query_len(0), 5);
        assert_eq!(md.query_len(2), 1);
        assert_eq!(md.context_len(2), 8);
        assert_eq!(md.context_len(1), 0);
        assert_eq!(md.total_query_tokens(), 11);
        assert_eq!(md.query_ranges(), vec![0..5, 5..9, 9..10, 10..11]);
        assert_eq!(
            md.cache_appends(),
            vec![(10, 0, 5), (11, 0, 4), (12, 8, 1), (13, 2, 1)]
        );
    }

    #[test]
    fn metadata_rejects_bad_layouts() {
        assert!(AttentionMetadata::new(vec![3], 2, vec![0]).is_err());
        assert!(AttentionMetadata::new(vec![3, 2], 1, vec![0]).is_err());
        assert!(AttentionMetadata::prefill(vec![3, 0]).is_err());
    }

    #[test]
    fn single_query_attends_uniformly_to_equal_keys() {
        // With identical keys the softmax is uniform, so the output is the mean
        // of the cached values.
        let dev = Device::Cpu;
        let mut cache = CacheEngine::new(None);

        let prefill = AttentionMetadata::prefill(vec![2]).unwrap();
        let ones = Tensor::ones((2, 4), DType::F32, &dev).unwrap();
        let v = Tensor::new(&[[0f32, 0., 0., 0.], [2., 2., 2., 2.]], &dev).unwrap();
        let out = packed_attention(&ones, &ones, &v, &prefill, &mut cache, 2, 2).unwrap();
        assert_eq!(out.dims(), &[2, 4]);
        // First row only sees itself.
        let first: Vec<f32> = out.get(0).unwrap().to_vec1().unwrap();
        assert_eq!(first, vec![0.0; 4]);

        let decode = AttentionMetadata::decode(vec![3]).unwrap();
        let q = Tensor::ones((1, 4), DType::F32, &dev).unwrap();
        let v_new = (Tensor::ones((1, 4), DType::F32, &dev).unwrap() * 4.0).unwrap();
        let out = packed_attention(&q, &q, &v_new, &decode, &mut cache, 2, 2).unwrap();
        let row: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        for x in row {
            assert!((x - 2.0).abs() < 1e-5, "{x}");
        }
        assert_eq!(cache.cached_len(0), 3);
    }

    #[test]
    fn rejects_row_count_mismatch() {
        let dev = Device::Cpu;
        let mut cache = CacheEngine::new(None);
        let md = AttentionMetadata::prefill(vec![3]).unwrap();
        let x = Tensor::zeros((2, 4), DType::F32, &dev).unwrap();
        assert!(matches!(
            packed_attention(&x, &x, &x, &md, &mut cache, 2, 2),
            Err(ModelError::ShapeMismatch { expected: 3, actual: 2, .. })
        ));
    }

    #[test]
    fn stale_context_is_a_cache_error() {
        let dev = Device::Cpu;
        let mut cache = CacheEngine::new(None);
        // Decode claims 4 cached tokens but the slot is empty.
        let md = AttentionMetadata::decode(vec![5]).unwrap();
        let x = Tensor::zeros((1, 4), DType::F32, &dev).unwrap();
        assert!(matches!(
            packed_attention(&x, &x, &x, &md, &mut cache, 2, 2),
            Err(ModelError::Cache(_))
        ));
    }
}
