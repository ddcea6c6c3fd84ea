use candle_core::{Result, Tensor};

/// Amortized flow parameters emitted by the posterior head, one
/// variant per flow family.
#[derive(Clone, Debug)]
pub enum FlowParams {
    /// nothing to amortize
    Identity,
    /// `u_nkz`, `w_nkz`: n x K x z, `b_nk`: n x K
    Planar {
        u_nkz: Tensor,
        w_nkz: Tensor,
        b_nk: Tensor,
    },
    /// context vector shared by every step: n x h
    Iaf { h_nh: Tensor },
}

pub trait PosteriorFlowT {
    /// Push base samples through the whole chain
    ///
    /// # Arguments
    /// * `z0_nk` - base samples (n x k)
    /// * `params` - amortized parameters from the posterior head
    ///
    /// # Returns `(zk_nk, log_det_n)`
    /// * `zk_nk` - final samples (n x k)
    /// * `log_det_n` - Σ_k log |det ∂z_k/∂z_{k-1}| per sample (n)
    fn apply(&self, z0_nk: &Tensor, params: &FlowParams) -> Result<(Tensor, Tensor)>;

    /// number of transformation steps
    fn num_flows(&self) -> usize;

    fn dim_latent(&self) -> usize;
}

pub trait FeatureTrunkT {
    /// Map observations to the bottleneck representation
    /// * `x_nd` - input data (n x d)
    /// * `train` - whether to use dropout/batchnorm or not
    fn forward_t(&self, x_nd: &Tensor, train: bool) -> Result<Tensor>;

    fn dim_obs(&self) -> usize;

    fn dim_bottleneck(&self) -> usize;
}

pub trait DecoderModuleT {
    /// A decoder that spits out reconstruction mean (n x d)
    fn forward_t(&self, z_nk: &Tensor, train: bool) -> Result<Tensor>;

    fn dim_obs(&self) -> usize;

    fn dim_latent(&self) -> usize;
}
