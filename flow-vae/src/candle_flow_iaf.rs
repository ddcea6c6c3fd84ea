use crate::candle_flow_error::FlowVaeError;
use crate::candle_masked_linear::{compatible_widths, masked_linear, MaskedLinear};
use crate::candle_model_traits::{FlowParams, PosteriorFlowT};
use crate::candle_numerics::log_sigmoid;
use candle_core::{Result, Tensor, D};
use candle_nn::{ops, Activation, Module, VarBuilder};

/// initial gate bias; keeps early steps close to the identity
pub const IAF_FORGET_BIAS: f64 = 1.0;

/// One inverse autoregressive step with its own masked network
///
/// ```text
/// hidden = elu(masked_in(z) + h)
/// hidden = elu(masked_hidden_j(hidden))   for each hidden layer
/// s      = sigmoid(masked_gate(hidden) + forget_bias)
/// m      = (1 - s) * masked_mean(hidden)
/// z'     = s * z + m
/// ```
///
/// `s_i` and `m_i` depend on `z_<i` and `h` only, so the Jacobian is
/// triangular with diagonal `s`.
pub struct IafStep {
    reverse: bool,
    z_in: MaskedLinear,
    hidden: Vec<MaskedLinear>,
    mean: MaskedLinear,
    gate: MaskedLinear,
    activation: Activation,
}

impl IafStep {
    /// Will create a new step with these variables:
    ///
    /// * `in.weight`: z -> h
    /// * `hidden.{}.weight`: h -> h
    /// * `mean.weight`, `gate.weight`: h -> z (strictly masked)
    pub fn new(
        n_latent: usize,
        h_size: usize,
        num_hidden: usize,
        reverse: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let z_in = masked_linear(n_latent, h_size, false, vb.pp("in"))?;
        let hidden = (0..num_hidden)
            .map(|j| masked_linear(h_size, h_size, false, vb.pp(format!("hidden.{}", j))))
            .collect::<Result<Vec<_>>>()?;
        let mean = masked_linear(h_size, n_latent, true, vb.pp("mean"))?;
        let gate = masked_linear(h_size, n_latent, true, vb.pp("gate"))?;

        Ok(Self {
            reverse,
            z_in,
            hidden,
            mean,
            gate,
            activation: Activation::Elu(1.0),
        })
    }

    /// whether this step reverses the dimension order first
    pub fn reverses(&self) -> bool {
        self.reverse
    }

    /// Apply the step to already-ordered samples
    ///
    /// * `z_nk` - samples (n x k)
    /// * `h_nh` - context (n x h)
    ///
    /// # Returns `(z_next, log_det_n)` with log_det = Σ_i log s_i
    pub fn transform(&self, z_nk: &Tensor, h_nh: &Tensor) -> Result<(Tensor, Tensor)> {
        let mut hidden = self
            .activation
            .forward(&(self.z_in.forward(z_nk)? + h_nh)?)?;
        for layer in self.hidden.iter() {
            hidden = self.activation.forward(&layer.forward(&hidden)?)?;
        }

        let mean_nk = self.mean.forward(&hidden)?;
        let gate_logit_nk = (self.gate.forward(&hidden)? + IAF_FORGET_BIAS)?;
        let gate_nk = ops::sigmoid(&gate_logit_nk)?;

        let z_next = ((&gate_nk * z_nk)? + (gate_nk.affine(-1., 1.)? * mean_nk)?)?;
        let log_det_n = log_sigmoid(&gate_logit_nk)?.sum(D::Minus1)?;
        Ok((z_next, log_det_n))
    }
}

/// Stack of IAF steps sharing a context vector
pub struct IafChain {
    n_latent: usize,
    h_size: usize,
    steps: Vec<IafStep>,
}

impl IafChain {
    /// Will create `num_flows` steps under `{k}`; odd steps reverse the
    /// latent order before transforming.
    ///
    /// # Arguments
    /// * `n_latent` - latent dimension
    /// * `h_size` - context and hidden width
    /// * `num_flows` - number of steps
    /// * `num_hidden` - extra masked hidden layers per step
    /// * `vb` - variable builder
    pub fn new(
        n_latent: usize,
        h_size: usize,
        num_flows: usize,
        num_hidden: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        if !compatible_widths(n_latent, h_size) {
            return Err(FlowVaeError::Configuration(format!(
                "made_h_size {} and z_size {} must divide one another",
                h_size, n_latent
            ))
            .into());
        }

        let steps = (0..num_flows)
            .map(|k| IafStep::new(n_latent, h_size, num_hidden, k % 2 == 1, vb.pp(k.to_string())))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            n_latent,
            h_size,
            steps,
        })
    }

    pub fn steps(&self) -> &[IafStep] {
        &self.steps
    }

    fn flip_index(&self, z_nk: &Tensor) -> Result<Tensor> {
        let idx: Vec<u32> = (0..self.n_latent as u32).rev().collect();
        Tensor::from_vec(idx, self.n_latent, z_nk.device())
    }

    /// Run the chain keeping every intermediate sample `z_0, ..., z_K`
    pub fn apply_with_trajectory(&self, z0_nk: &Tensor, h_nh: &Tensor) -> Result<(Vec<Tensor>, Tensor)> {
        let (n, h) = h_nh.dims2()?;
        if n != z0_nk.dim(0)? || h != self.h_size {
            return Err(FlowVaeError::ShapeMismatch {
                what: "iaf context",
                expected: vec![z0_nk.dim(0)?, self.h_size],
                actual: vec![n, h],
            }
            .into());
        }

        let flip = self.flip_index(z0_nk)?;
        let mut log_det_n = Tensor::zeros(n, z0_nk.dtype(), z0_nk.device())?;
        let mut zz = Vec::with_capacity(self.steps.len() + 1);
        zz.push(z0_nk.clone());

        for (k, step) in self.steps.iter().enumerate() {
            let z_nk = if step.reverses() {
                zz[k].index_select(&flip, 1)?
            } else {
                zz[k].clone()
            };
            let (z_next, log_det_k) = step.transform(&z_nk, h_nh)?;
            log_det_n = (log_det_n + log_det_k)?;
            zz.push(z_next);
        }
        Ok((zz, log_det_n))
    }
}

impl PosteriorFlowT for IafChain {
    fn apply(&self, z0_nk: &Tensor, params: &FlowParams) -> Result<(Tensor, Tensor)> {
        match params {
            FlowParams::Iaf { h_nh } => {
                let (mut zz, log_det_n) = self.apply_with_trajectory(z0_nk, h_nh)?;
                let zk = zz.pop().unwrap_or_else(|| z0_nk.clone());
                Ok((zk, log_det_n))
            }
            _ => candle_core::bail!("iaf chain expects a context vector"),
        }
    }

    fn num_flows(&self) -> usize {
        self.steps.len()
    }

    fn dim_latent(&self) -> usize {
        self.n_latent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn build(z: usize, h: usize, k: usize) -> Result<(VarMap, IafChain)> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F64, &Device::Cpu);
        let chain = IafChain::new(z, h, k, 1, vb)?;
        Ok((varmap, chain))
    }

    #[test]
    fn output_i_ignores_later_inputs() -> Result<()> {
        let (z, h) = (4, 8);
        let (_vm, chain) = build(z, h, 1)?;
        let step = &chain.steps()[0];

        let ctx = Tensor::randn(0f64, 1f64, (1, h), &Device::Cpu)?;
        let base = vec![0.4f64, -1.2, 0.7, 2.0];
        let z0 = Tensor::from_vec(base.clone(), (1, z), &Device::Cpu)?;
        let (out0, _) = step.transform(&z0, &ctx)?;
        let out0 = out0.to_vec2::<f64>()?[0].clone();

        for j in 0..z {
            let mut pert = base.clone();
            pert[j] += 3.0;
            let zp = Tensor::from_vec(pert, (1, z), &Device::Cpu)?;
            let (outp, _) = step.transform(&zp, &ctx)?;
            let outp = outp.to_vec2::<f64>()?[0].clone();
            for i in 0..j {
                assert_eq!(out0[i], outp[i], "z'_{} moved when z_{} changed", i, j);
            }
        }
        Ok(())
    }

    #[test]
    fn first_dimension_is_a_pure_affine_map() -> Result<()> {
        // z'_0 depends on h only through s_0 and m_0
        let (_vm, chain) = build(2, 2, 1)?;
        let step = &chain.steps()[0];
        let ctx = Tensor::zeros((2, 2), DType::F64, &Device::Cpu)?;
        let z = Tensor::new(&[[1.0f64, 5.0], [1.0, -5.0]], &Device::Cpu)?;
        let (out, _) = step.transform(&z, &ctx)?;
        let out = out.to_vec2::<f64>()?;
        assert_eq!(out[0][0], out[1][0]);
        Ok(())
    }

    #[test]
    fn chain_log_det_is_sum_of_step_log_dets() -> Result<()> {
        let (_vm, chain) = build(3, 6, 3)?;
        let z0 = Tensor::randn(0f64, 1f64, (5, 3), &Device::Cpu)?;
        let ctx = Tensor::randn(0f64, 1f64, (5, 6), &Device::Cpu)?;

        let (traj, total) = chain.apply_with_trajectory(&z0, &ctx)?;
        assert_eq!(traj.len(), 4);

        let flip = chain.flip_index(&z0)?;
        let mut expected = Tensor::zeros(5, DType::F64, &Device::Cpu)?;
        for (k, step) in chain.steps().iter().enumerate() {
            let zin = if step.reverses() {
                traj[k].index_select(&flip, 1)?
            } else {
                traj[k].clone()
            };
            let (_, ld) = step.transform(&zin, &ctx)?;
            expected = (expected + ld)?;
        }
        let total = total.to_vec1::<f64>()?;
        for (got, want) in total.iter().zip(expected.to_vec1::<f64>()?) {
            approx::assert_abs_diff_eq!(*got, want, epsilon = 1e-12);
            // gates lie in (0, 1)
            assert!(*got < 0.);
        }
        Ok(())
    }

    /// central differences of one step on z = 3
    #[test]
    fn log_det_matches_finite_difference_jacobian() -> Result<()> {
        let (z, h) = (3, 6);
        let (_vm, chain) = build(z, h, 1)?;
        let step = &chain.steps()[0];

        let ctx = Tensor::randn(0f64, 1f64, (1, h), &Device::Cpu)?;
        let base = vec![0.8f64, -0.3, 1.7];
        let z0 = Tensor::from_vec(base.clone(), (1, z), &Device::Cpu)?;
        let (_, ld) = step.transform(&z0, &ctx)?;
        let ld = ld.to_vec1::<f64>()?[0];

        let delta = 1e-6;
        let eval = |zv: Vec<f64>| -> Result<Vec<f64>> {
            let zt = Tensor::from_vec(zv, (1, z), &Device::Cpu)?;
            Ok(step.transform(&zt, &ctx)?.0.to_vec2::<f64>()?[0].clone())
        };

        // jac[i][j] = ∂z'_i / ∂z_j
        let mut jac = vec![vec![0f64; z]; z];
        for j in 0..z {
            let mut hi = base.clone();
            let mut lo = base.clone();
            hi[j] += delta;
            lo[j] -= delta;
            let (f_hi, f_lo) = (eval(hi)?, eval(lo)?);
            for i in 0..z {
                jac[i][j] = (f_hi[i] - f_lo[i]) / (2. * delta);
            }
        }

        let mut log_diag = 0f64;
        for i in 0..z {
            for j in (i + 1)..z {
                approx::assert_abs_diff_eq!(jac[i][j], 0., epsilon = 1e-9);
            }
            // diagonal is the gate s_i
            assert!(jac[i][i] > 0. && jac[i][i] < 1., "s_{} = {}", i, jac[i][i]);
            log_diag += jac[i][i].ln();
        }
        approx::assert_abs_diff_eq!(ld, log_diag, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn incompatible_context_width_is_a_configuration_error() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let err = IafChain::new(3, 8, 2, 1, vb).err().map(|e| e.to_string());
        assert!(err.unwrap_or_default().contains("configuration error"));
    }

    #[test]
    fn context_shape_is_checked() -> Result<()> {
        let (_vm, chain) = build(2, 4, 2)?;
        let z0 = Tensor::zeros((3, 2), DType::F64, &Device::Cpu)?;
        let ctx = Tensor::zeros((3, 5), DType::F64, &Device::Cpu)?;
        assert!(chain.apply_with_trajectory(&z0, &ctx).is_err());
        Ok(())
    }
}
