use crate::candle_flow_chain::{FlowChain, FlowType};
use crate::candle_flow_error::{config_error, FlowVaeError};
use crate::candle_flow_iaf::IafChain;
use crate::candle_flow_planar::PlanarChain;
use crate::candle_masked_linear::compatible_widths;
use crate::candle_model_decoder::FeedForwardDecoder;
use crate::candle_model_encoder::FeedForwardTrunk;
use crate::candle_model_traits::*;
use crate::candle_numerics::ensure_finite;
use crate::candle_posterior_head::PosteriorHead;
use crate::candle_reparameterize::{reparameterize, NoiseSource};
use candle_core::{Device, Result, Tensor};
use candle_nn::VarBuilder;
use log::debug;

pub struct FlowVaeArgs<'a> {
    pub input_size: usize,
    pub encoder_sizes: &'a [usize],
    pub decoder_sizes: &'a [usize],
    pub z_size: usize,
    pub batch_norm: bool,
    pub dropout: f32,
    pub num_flows: usize,
    pub made_h_size: usize,
    pub made_num_hidden: usize,
    pub flow: FlowType,
}

impl FlowVaeArgs<'_> {
    /// Reject sizes and probabilities the model cannot be built with
    pub fn validate(&self) -> Result<()> {
        if self.input_size == 0 {
            return config_error("input_size must be positive");
        }
        if self.z_size == 0 {
            return config_error("z_size must be positive");
        }
        if self.encoder_sizes.is_empty() {
            return config_error("encoder_sizes needs at least the bottleneck width");
        }
        if self.encoder_sizes.contains(&0) {
            return config_error(format!("encoder_sizes {:?} has a zero width", self.encoder_sizes));
        }
        if self.decoder_sizes.contains(&0) {
            return config_error(format!("decoder_sizes {:?} has a zero width", self.decoder_sizes));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return config_error(format!("dropout {} is outside [0, 1)", self.dropout));
        }
        if self.effective_flow() == FlowType::Iaf {
            if self.made_h_size == 0 {
                return config_error("made_h_size must be positive");
            }
            if !compatible_widths(self.z_size, self.made_h_size) {
                return config_error(format!(
                    "made_h_size {} and z_size {} must divide one another",
                    self.made_h_size, self.z_size
                ));
            }
        }
        Ok(())
    }

    /// zero flow steps always mean the identity chain
    pub fn effective_flow(&self) -> FlowType {
        if self.num_flows == 0 {
            FlowType::Identity
        } else {
            self.flow
        }
    }
}

/// Everything a training loop needs from one forward call
pub struct FlowVaeOutput {
    /// reconstruction mean (n x d)
    pub x_mean: Tensor,
    /// base Gaussian mean (n x k)
    pub mu: Tensor,
    /// base Gaussian variance (n x k), strictly positive
    pub var: Tensor,
    /// Σ log |det ∂z_k/∂z_{k-1}| per sample (n)
    pub log_det: Tensor,
    /// base sample (n x k)
    pub z0: Tensor,
    /// flowed sample fed to the decoder (n x k)
    pub zk: Tensor,
}

impl FlowVaeOutput {
    /// `(x_mean, mu, var, log_det, z0, zk)`
    pub fn into_tuple(self) -> (Tensor, Tensor, Tensor, Tensor, Tensor, Tensor) {
        (
            self.x_mean,
            self.mu,
            self.var,
            self.log_det,
            self.z0,
            self.zk,
        )
    }
}

/// Variational autoencoder with a flow-augmented posterior
///
/// encoder trunk -> posterior head -> reparameterized sample -> flow
/// chain -> decoder
pub struct FlowVae<Trunk = FeedForwardTrunk, Dec = FeedForwardDecoder>
where
    Trunk: FeatureTrunkT,
    Dec: DecoderModuleT,
{
    n_features: usize,
    n_latent: usize,
    device: Device,
    trunk: Trunk,
    head: PosteriorHead,
    chain: FlowChain,
    decoder: Dec,
}

impl FlowVae<FeedForwardTrunk, FeedForwardDecoder> {
    /// Will create the model with these variables:
    ///
    /// * `nn.enc.fc.{}.weight`, `nn.enc.bn.{}.weight`
    /// * `nn.enc.z.mean.weight`, `nn.enc.z.var.weight`
    /// * `nn.enc.amor.{u,w,b}.weight` (planar)
    /// * `nn.enc.h.context.weight` (iaf)
    /// * `flow.iaf.{k}.{in,hidden.{j},mean,gate}.weight` (iaf)
    /// * `nn.dec.fc.{}.weight`, `nn.dec.bn.{}.weight`, `nn.dec.out.weight`
    ///
    /// # Arguments
    /// * `args` - model arguments
    /// * `vb` - variable builder; its device is the model's device
    pub fn new(args: FlowVaeArgs, vb: VarBuilder) -> Result<Self> {
        args.validate()?;

        let trunk = FeedForwardTrunk::new(
            args.input_size,
            args.encoder_sizes,
            args.batch_norm,
            args.dropout,
            vb.pp("nn.enc"),
        )?;

        let decoder = FeedForwardDecoder::new(
            args.input_size,
            args.z_size,
            args.decoder_sizes,
            args.batch_norm,
            args.dropout,
            vb.pp("nn.dec"),
        )?;

        Self::with_modules(args, trunk, decoder, vb)
    }
}

impl<Trunk, Dec> FlowVae<Trunk, Dec>
where
    Trunk: FeatureTrunkT,
    Dec: DecoderModuleT,
{
    /// Build the posterior head and flow chain around a custom trunk
    /// and decoder.
    pub fn with_modules(args: FlowVaeArgs, trunk: Trunk, decoder: Dec, vb: VarBuilder) -> Result<Self> {
        args.validate()?;

        if trunk.dim_obs() != args.input_size || decoder.dim_obs() != args.input_size {
            return config_error(format!(
                "trunk sees {} and decoder emits {} features, expected {}",
                trunk.dim_obs(),
                decoder.dim_obs(),
                args.input_size
            ));
        }
        if decoder.dim_latent() != args.z_size {
            return config_error(format!(
                "decoder expects {} latent dims, z_size is {}",
                decoder.dim_latent(),
                args.z_size
            ));
        }

        let flow = args.effective_flow();

        let head = PosteriorHead::new(
            trunk.dim_bottleneck(),
            args.z_size,
            args.num_flows,
            flow,
            args.made_h_size,
            vb.pp("nn.enc"),
        )?;

        let chain = match flow {
            FlowType::Identity => FlowChain::Identity {
                n_latent: args.z_size,
            },
            FlowType::Planar => FlowChain::Planar(PlanarChain::new(args.z_size, args.num_flows)),
            FlowType::Iaf => FlowChain::Iaf(IafChain::new(
                args.z_size,
                args.made_h_size,
                args.num_flows,
                args.made_num_hidden,
                vb.pp("flow.iaf"),
            )?),
        };

        debug!(
            "flow vae: {} -> {:?} -> z{} with {} {:?} step(s)",
            args.input_size,
            args.encoder_sizes,
            args.z_size,
            chain.num_flows(),
            flow
        );

        Ok(Self {
            n_features: args.input_size,
            n_latent: args.z_size,
            device: vb.device().clone(),
            trunk,
            head,
            chain,
            decoder,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn chain(&self) -> &FlowChain {
        &self.chain
    }

    pub fn dim_obs(&self) -> usize {
        self.n_features
    }

    pub fn dim_latent(&self) -> usize {
        self.n_latent
    }

    fn check_input(&self, x_nd: &Tensor) -> Result<()> {
        if !x_nd.device().same_device(&self.device) {
            return Err(FlowVaeError::DeviceMismatch(format!(
                "input on {:?}, model on {:?}",
                x_nd.device().location(),
                self.device.location()
            ))
            .into());
        }
        match x_nd.dims() {
            [_, d] if *d == self.n_features => Ok(()),
            dims => Err(FlowVaeError::ShapeMismatch {
                what: "input",
                expected: vec![dims.first().copied().unwrap_or(0), self.n_features],
                actual: dims.to_vec(),
            }
            .into()),
        }
    }

    ///
    /// Evaluate the base Gaussian, its reparameterized sample, and the
    /// amortized flow parameters
    ///
    /// # Returns `(mu, var, z0, params)`
    pub fn encode_t<N>(
        &self,
        x_nd: &Tensor,
        noise: &mut N,
        train: bool,
    ) -> Result<(Tensor, Tensor, Tensor, FlowParams)>
    where
        N: NoiseSource + ?Sized,
    {
        self.check_input(x_nd)?;
        let bottleneck_nl = self.trunk.forward_t(x_nd, train)?;
        let (mu_nk, var_nk, params) = self.head.encode(&bottleneck_nl)?;
        let z0_nk = reparameterize(&mu_nk, &var_nk, noise)?;
        Ok((mu_nk, var_nk, z0_nk, params))
    }

    /// Full forward pass
    ///
    /// # Arguments
    /// * `x_nd` - input data (n x d)
    /// * `noise` - standard normal source for the base sample
    /// * `train` - whether to use dropout/batchnorm or not
    pub fn forward_t<N>(&self, x_nd: &Tensor, noise: &mut N, train: bool) -> Result<FlowVaeOutput>
    where
        N: NoiseSource + ?Sized,
    {
        let (mu, var, z0, params) = self.encode_t(x_nd, noise, train)?;
        let (zk, log_det) = self.chain.apply(&z0, &params)?;
        ensure_finite(&zk, "flowed latent")?;
        ensure_finite(&log_det, "log-det-jacobian")?;
        let x_mean = self.decoder.forward_t(&zk, train)?;

        Ok(FlowVaeOutput {
            x_mean,
            mu,
            var,
            log_det,
            z0,
            zk,
        })
    }

    /// Evaluation-mode forward pass (no dropout, running batch-norm stats)
    pub fn forward<N>(&self, x_nd: &Tensor, noise: &mut N) -> Result<FlowVaeOutput>
    where
        N: NoiseSource + ?Sized,
    {
        self.forward_t(x_nd, noise, false)
    }

    /// Like [`FlowVae::forward_t`] but also returns every intermediate
    /// latent `z_0, ..., z_K`
    pub fn forward_with_trajectory<N>(
        &self,
        x_nd: &Tensor,
        noise: &mut N,
        train: bool,
    ) -> Result<(FlowVaeOutput, Vec<Tensor>)>
    where
        N: NoiseSource + ?Sized,
    {
        let (mu, var, z0, params) = self.encode_t(x_nd, noise, train)?;
        let (trajectory, log_det) = self.chain.apply_with_trajectory(&z0, &params)?;
        let zk = trajectory.last().cloned().unwrap_or_else(|| z0.clone());
        ensure_finite(&zk, "flowed latent")?;
        ensure_finite(&log_det, "log-det-jacobian")?;
        let x_mean = self.decoder.forward_t(&zk, train)?;

        let out = FlowVaeOutput {
            x_mean,
            mu,
            var,
            log_det,
            z0,
            zk,
        };
        Ok((out, trajectory))
    }

    /// Decode latent samples into reconstruction means
    pub fn decode_t(&self, z_nk: &Tensor, train: bool) -> Result<Tensor> {
        self.decoder.forward_t(z_nk, train)
    }
}
