use crate::candle_aux_layers::{stack_leaky_relu_linear, StackLayers};
use crate::candle_model_traits::FeatureTrunkT;
use candle_core::{Result, Tensor};
use candle_nn::{Linear, ModuleT, VarBuilder};

/// Encoder trunk: data -> bottleneck
pub struct FeedForwardTrunk {
    n_features: usize,
    n_bottleneck: usize,
    fc: StackLayers<Linear>,
}

impl FeatureTrunkT for FeedForwardTrunk {
    fn forward_t(&self, x_nd: &Tensor, train: bool) -> Result<Tensor> {
        self.fc.forward_t(x_nd, train)
    }

    fn dim_obs(&self) -> usize {
        self.n_features
    }

    fn dim_bottleneck(&self) -> usize {
        self.n_bottleneck
    }
}

impl FeedForwardTrunk {
    /// Will create a new encoder trunk with these variables:
    ///
    /// * `fc.{}.weight` where {} is the layer index
    /// * `bn.{}.weight` if `batch_norm`
    ///
    /// The last entry of `layers` is the bottleneck width.
    pub fn new(
        n_features: usize,
        layers: &[usize],
        batch_norm: bool,
        dropout: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        debug_assert!(!layers.is_empty());
        let n_bottleneck = *layers.last().unwrap_or(&n_features);
        let fc = stack_leaky_relu_linear(n_features, layers, batch_norm, dropout, vb)?;
        Ok(Self {
            n_features,
            n_bottleneck,
            fc,
        })
    }
}
