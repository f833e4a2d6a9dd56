use candle_core::{DType, Device, Result, Tensor};

/// Additive causal mask for `query_len` new rows following `context_len`
/// cached ones. Shape `[1, 1, query_len, context_len + query_len]`; row `i`
/// may see keys `0..=context_len + i`.
pub fn causal_mask(
    query_len: usize,
    context_len: usize,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let total_len = context_len + query_len;
    let rows = Tensor::arange(context_len as u32, total_len as u32, device)?.unsqueeze(1)?;
    let cols = Tensor::arange(0u32, total_len as u32, device)?.unsqueeze(0)?;
    let hidden = cols.broadcast_gt(&rows)?;
    let zeros = Tensor::zeros((query_len, total_len), DType::F32, device)?;
    let neg_inf = Tensor::full(f32::NEG_INFINITY, (query_len, total_len), device)?;
    hidden
        .where_cond(&neg_inf, &zeros)?
        .reshape((1, 1, query_len, total_len))?
        .to_dtype(dtype)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_without_context() {
        let m = causal_mask(3, 0, DType::F32, &Device::Cpu).unwrap();
        assert_eq!(m.dims(), &[1, 1, 3, 3]);
        let rows: Vec<Vec<f32>> = m.squeeze(0).unwrap().squeeze(0).unwrap().to_vec2().unwrap();
        assert_eq!(rows[0][0], 0.0);
        assert!(rows[0][1].is_infinite());
        assert_eq!(rows[2], vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn mask_with_context() {
        let m = causal_mask(2, 3, DType::F32, &Device::Cpu).unwrap();
        assert_eq!(m.dims(), &[1, 1, 2, 5]);
        let rows: Vec<Vec<f32>> = m.squeeze(0).unwrap().squeeze(0).unwrap().to_vec2().unwrap();
        assert_eq!(&rows[0][..4], &[0.0; 4]);
        assert!(rows[0][4].is_infinite());
        assert_eq!(rows[1], vec![0.0; 5]);
    }
}
