use crate::candle_aux_layers::{stack_leaky_relu_linear, StackLayers};
use crate::candle_model_traits::DecoderModuleT;
use candle_core::{Result, Tensor};
use candle_nn::{Linear, Module, ModuleT, VarBuilder};

///////////////////////////////
// Feed-forward mean decoder //
///////////////////////////////

pub struct FeedForwardDecoder {
    n_features: usize,
    n_latent: usize,
    fc: StackLayers<Linear>,
    out: Linear,
}

impl FeedForwardDecoder {
    /// Will create a new decoder with the following parameters:
    /// * `fc.{}.weight`, `bn.{}.weight` for the hidden blocks
    /// * `out.weight` for the final linear read-out
    pub fn new(
        n_features: usize,
        n_latent: usize,
        layers: &[usize],
        batch_norm: bool,
        dropout: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        let fc = stack_leaky_relu_linear(n_latent, layers, batch_norm, dropout, vb.clone())?;
        let last_dim = layers.last().copied().unwrap_or(n_latent);
        let out = candle_nn::linear(last_dim, n_features, vb.pp("out"))?;
        Ok(Self {
            n_features,
            n_latent,
            fc,
            out,
        })
    }
}

impl DecoderModuleT for FeedForwardDecoder {
    fn forward_t(&self, z_nk: &Tensor, train: bool) -> Result<Tensor> {
        let h_nl = self.fc.forward_t(z_nk, train)?;
        self.out.forward(&h_nl)
    }

    fn dim_obs(&self) -> usize {
        self.n_features
    }

    fn dim_latent(&self) -> usize {
        self.n_latent
    }
}
