use crate::candle_flow_iaf::IafChain;
use crate::candle_flow_planar::PlanarChain;
use crate::candle_model_traits::{FlowParams, PosteriorFlowT};
use candle_core::{Result, Tensor};
use clap::ValueEnum;

/// Flow family, fixed at construction
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum FlowType {
    /// plain Gaussian posterior
    Identity,
    /// rank-one planar steps with amortized (u, w, b)
    #[default]
    Planar,
    /// inverse autoregressive steps with a shared context
    Iaf,
}

/// The posterior transform selected at construction
pub enum FlowChain {
    Identity { n_latent: usize },
    Planar(PlanarChain),
    Iaf(IafChain),
}

impl FlowChain {
    pub fn flow_type(&self) -> FlowType {
        match self {
            Self::Identity { .. } => FlowType::Identity,
            Self::Planar(_) => FlowType::Planar,
            Self::Iaf(_) => FlowType::Iaf,
        }
    }

    /// Run the chain keeping `z_0, ..., z_K` (length `K + 1`)
    pub fn apply_with_trajectory(
        &self,
        z0_nk: &Tensor,
        params: &FlowParams,
    ) -> Result<(Vec<Tensor>, Tensor)> {
        match (self, params) {
            (Self::Identity { .. }, _) => {
                let n = z0_nk.dim(0)?;
                let log_det_n = Tensor::zeros(n, z0_nk.dtype(), z0_nk.device())?;
                Ok((vec![z0_nk.clone()], log_det_n))
            }
            (Self::Planar(chain), FlowParams::Planar { u_nkz, w_nkz, b_nk }) => {
                chain.apply_with_trajectory(z0_nk, u_nkz, w_nkz, b_nk)
            }
            (Self::Iaf(chain), FlowParams::Iaf { h_nh }) => chain.apply_with_trajectory(z0_nk, h_nh),
            (chain, _) => candle_core::bail!(
                "{:?} chain received parameters of another flow family",
                chain.flow_type()
            ),
        }
    }
}

impl PosteriorFlowT for FlowChain {
    fn apply(&self, z0_nk: &Tensor, params: &FlowParams) -> Result<(Tensor, Tensor)> {
        match self {
            Self::Identity { .. } => {
                let (mut zz, log_det_n) = self.apply_with_trajectory(z0_nk, params)?;
                Ok((zz.remove(0), log_det_n))
            }
            Self::Planar(chain) => chain.apply(z0_nk, params),
            Self::Iaf(chain) => chain.apply(z0_nk, params),
        }
    }

    fn num_flows(&self) -> usize {
        match self {
            Self::Identity { .. } => 0,
            Self::Planar(chain) => chain.num_flows(),
            Self::Iaf(chain) => chain.num_flows(),
        }
    }

    fn dim_latent(&self) -> usize {
        match self {
            Self::Identity { n_latent } => *n_latent,
            Self::Planar(chain) => chain.dim_latent(),
            Self::Iaf(chain) => chain.dim_latent(),
        }
    }
}
