use candle_core::{Module, Result, Tensor};
use candle_nn::{linear, Activation, Linear, VarBuilder};

/// GPT-2 feed-forward: `c_fc -> activation -> c_proj`, both with bias.
#[derive(Debug, Clone)]
pub struct GptMlp {
    c_fc: Linear,
    c_proj: Linear,
    activation: Activation,
}

impl GptMlp {
    pub fn new(
        hidden_size: usize,
        n_inner: usize,
        activation: Activation,
        vb: VarBuilder,
    ) -> Result<Self> {
        let c_fc = linear(hidden_size, n_inner, vb.pp("c_fc"))?;
        let c_proj = linear(n_inner, hidden_size, vb.pp("c_proj"))?;
        Ok(Self {
            c_fc,
            c_proj,
            activation,
        })
    }
}

impl Module for GptMlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.apply(&self.c_fc)?
            .apply(&self.activation)?
            .apply(&self.c_proj)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn zero_weights_give_zero_output() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let mlp = GptMlp::new(8, 32, Activation::NewGelu, vb).unwrap();
        let x = Tensor::ones((3, 8), DType::F32, &Device::Cpu).unwrap();
        let y = mlp.forward(&x).unwrap();
        assert_eq!(y.dims(), &[3, 8]);
        let sum: f32 = y.abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(sum, 0.0);
    }
}
