use crate::candle_flow_chain::FlowType;
use crate::candle_flow_error::FlowVaeError;
use crate::candle_model_traits::FlowParams;
use crate::candle_numerics::{ensure_positive, softplus};
use candle_core::{Result, Tensor};
use candle_nn::{Linear, Module, VarBuilder};

enum AmortizedHead {
    Identity,
    Planar {
        amor_u: Linear,
        amor_w: Linear,
        amor_b: Linear,
    },
    Iaf {
        h_context: Linear,
    },
}

/// Maps the bottleneck to the diagonal Gaussian `(mu, var)` and to the
/// amortized flow parameters of the selected chain.
pub struct PosteriorHead {
    n_bottleneck: usize,
    n_latent: usize,
    num_flows: usize,
    z_mean: Linear,
    z_var: Linear,
    amortized: AmortizedHead,
}

impl PosteriorHead {
    /// Will create the heads with these variables:
    ///
    /// * `z.mean.weight`, `z.var.weight`
    /// * `amor.u.weight`, `amor.w.weight`, `amor.b.weight` (planar)
    /// * `h.context.weight` (iaf)
    ///
    /// # Arguments
    /// * `n_bottleneck` - width of the encoder trunk output
    /// * `n_latent` - latent dimension `z`
    /// * `num_flows` - number of flow steps `K`
    /// * `flow` - chain family
    /// * `h_size` - IAF context width
    /// * `vb` - variable builder
    pub fn new(
        n_bottleneck: usize,
        n_latent: usize,
        num_flows: usize,
        flow: FlowType,
        h_size: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let z_mean = candle_nn::linear(n_bottleneck, n_latent, vb.pp("z.mean"))?;
        let z_var = candle_nn::linear(n_bottleneck, n_latent, vb.pp("z.var"))?;

        let amortized = match flow {
            FlowType::Identity => AmortizedHead::Identity,
            FlowType::Planar => AmortizedHead::Planar {
                amor_u: candle_nn::linear(n_bottleneck, num_flows * n_latent, vb.pp("amor.u"))?,
                amor_w: candle_nn::linear(n_bottleneck, num_flows * n_latent, vb.pp("amor.w"))?,
                amor_b: candle_nn::linear(n_bottleneck, num_flows, vb.pp("amor.b"))?,
            },
            FlowType::Iaf => AmortizedHead::Iaf {
                h_context: candle_nn::linear(n_bottleneck, h_size, vb.pp("h.context"))?,
            },
        };

        Ok(Self {
            n_bottleneck,
            n_latent,
            num_flows,
            z_mean,
            z_var,
            amortized,
        })
    }

    ///
    /// Evaluate latent Gaussian parameters and flow parameters
    ///
    /// * `bottleneck_nl` - trunk output (n x l)
    ///
    /// # Returns `(z_mean_nk, z_var_nk, params)`
    /// * `z_var_nk` = softplus(raw) is checked to be strictly positive
    pub fn encode(&self, bottleneck_nl: &Tensor) -> Result<(Tensor, Tensor, FlowParams)> {
        let (n, l) = bottleneck_nl.dims2()?;
        if l != self.n_bottleneck {
            return Err(FlowVaeError::ShapeMismatch {
                what: "bottleneck",
                expected: vec![n, self.n_bottleneck],
                actual: vec![n, l],
            }
            .into());
        }

        let z_mean_nk = self.z_mean.forward(bottleneck_nl)?;
        let z_var_nk = softplus(&self.z_var.forward(bottleneck_nl)?)?;
        ensure_positive(&z_var_nk, "posterior variance")?;

        let params = match &self.amortized {
            AmortizedHead::Identity => FlowParams::Identity,
            AmortizedHead::Planar {
                amor_u,
                amor_w,
                amor_b,
            } => {
                let (k, z) = (self.num_flows, self.n_latent);
                FlowParams::Planar {
                    u_nkz: reshape_amortized(amor_u.forward(bottleneck_nl)?, &[n, k, z], "amor u")?,
                    w_nkz: reshape_amortized(amor_w.forward(bottleneck_nl)?, &[n, k, z], "amor w")?,
                    b_nk: reshape_amortized(amor_b.forward(bottleneck_nl)?, &[n, k], "amor b")?,
                }
            }
            AmortizedHead::Iaf { h_context } => FlowParams::Iaf {
                h_nh: h_context.forward(bottleneck_nl)?,
            },
        };

        Ok((z_mean_nk, z_var_nk, params))
    }

    pub fn dim_latent(&self) -> usize {
        self.n_latent
    }
}

fn reshape_amortized(x: Tensor, shape: &[usize], what: &'static str) -> Result<Tensor> {
    if x.elem_count() != shape.iter().product::<usize>() {
        return Err(FlowVaeError::ShapeMismatch {
            what,
            expected: shape.to_vec(),
            actual: x.dims().to_vec(),
        }
        .into());
    }
    x.reshape(shape)
}
