use candle_core::{Result, Tensor};
use candle_nn::{Activation, BatchNorm, Dropout, Linear, Module, ModuleT, VarBuilder};

/// slope of the leaky ReLU used between hidden layers
pub const LEAKY_RELU_SLOPE: f64 = 0.1;

/// build a stack of `M -> A -> [BatchNorm] -> [Dropout]` blocks
pub struct StackLayers<M>
where
    M: Module,
{
    module_layers: Vec<M>,
    activation_layers: Vec<Option<Activation>>,
    norm_layers: Vec<Option<BatchNorm>>,
    dropout: Option<Dropout>,
}

impl<M> ModuleT for StackLayers<M>
where
    M: Module,
{
    fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor> {
        let mut x = input.clone();
        let layers = self
            .module_layers
            .iter()
            .zip(self.activation_layers.iter())
            .zip(self.norm_layers.iter());

        for ((module, activation), norm) in layers {
            x = module.forward(&x)?;
            if let Some(activation) = activation {
                x = activation.forward(&x)?;
            }
            if let Some(norm) = norm {
                x = norm.forward_t(&x, train)?;
            }
            if let Some(dropout) = &self.dropout {
                x = dropout.forward_t(&x, train)?;
            }
        }
        Ok(x)
    }
}

impl<M> StackLayers<M>
where
    M: Module,
{
    pub fn new() -> Self {
        Self {
            module_layers: Vec::new(),
            activation_layers: Vec::new(),
            norm_layers: Vec::new(),
            dropout: None,
        }
    }

    /// Dropout applied after every block; `p = 0` disables it.
    pub fn with_dropout(mut self, p: f32) -> Self {
        self.dropout = if p > 0. { Some(Dropout::new(p)) } else { None };
        self
    }

    /// Appends a layer after all the current layers.
    pub fn push_with_act(&mut self, layer: M, activation: Activation, norm: Option<BatchNorm>) {
        self.module_layers.push(layer);
        self.activation_layers.push(Some(activation));
        self.norm_layers.push(norm);
    }

    pub fn push(&mut self, layer: M) {
        self.module_layers.push(layer);
        self.activation_layers.push(None);
        self.norm_layers.push(None);
    }

    pub fn num_layers(&self) -> usize {
        self.module_layers.len()
    }
}

impl<M> Default for StackLayers<M>
where
    M: Module,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Feed-forward stack
/// `Linear -> LeakyReLU(0.1) -> [BatchNorm] -> [Dropout]` per width
/// with these variables:
///
/// * `fc.{}.weight` where {} is the layer index
/// * `bn.{}.weight` when `batch_norm` is set
///
/// # Arguments
/// * `in_dim` - input dimension
/// * `layers` - output width of each block
/// * `batch_norm` - whether to normalize after each activation
/// * `dropout` - dropout probability in `[0, 1)`
/// * `vb` - variable builder
pub fn stack_leaky_relu_linear(
    in_dim: usize,
    layers: &[usize],
    batch_norm: bool,
    dropout: f32,
    vb: VarBuilder,
) -> Result<StackLayers<Linear>> {
    let bn_config = candle_nn::BatchNormConfig {
        eps: 1e-5,
        remove_mean: true,
        affine: true,
        momentum: 0.1,
    };

    let mut fc = StackLayers::<Linear>::new().with_dropout(dropout);
    let mut prev_dim = in_dim;
    for (j, &next_dim) in layers.iter().enumerate() {
        let norm = if batch_norm {
            Some(candle_nn::batch_norm(
                next_dim,
                bn_config,
                vb.pp(format!("bn.{}", j)),
            )?)
        } else {
            None
        };
        fc.push_with_act(
            candle_nn::linear(prev_dim, next_dim, vb.pp(format!("fc.{}", j)))?,
            Activation::LeakyRelu(LEAKY_RELU_SLOPE),
            norm,
        );
        prev_dim = next_dim;
    }
    Ok(fc)
}
