use crate::candle_flow_error::FlowVaeError;
use crate::candle_model_traits::{FlowParams, PosteriorFlowT};
use crate::candle_numerics::{dtype_epsilon, softplus, tanh_derivative};
use candle_core::{Result, Tensor, D};

/// floor on ‖w‖² so a vanishing `w` cannot divide by zero
const MIN_W_NORM_SQ: f64 = 1e-12;

/// One planar step `z' = z + û tanh(w·z + b)`.
///
/// Holds no weights: `u`, `w`, `b` are amortized by the posterior head.
#[derive(Clone, Copy, Debug, Default)]
pub struct PlanarStep;

impl PlanarStep {
    ///
    /// û = u + (m(w·u) - w·u) w / ‖w‖²,  m(x) = -1 + softplus(x)
    ///
    /// so that w·û = m(w·u) > -1 and the step stays invertible.
    ///
    /// * `u_nz`, `w_nz` - raw amortized vectors (n x z)
    pub fn corrected_u(u_nz: &Tensor, w_nz: &Tensor) -> Result<Tensor> {
        Ok(Self::correct(u_nz, w_nz)?.0)
    }

    /// `(û, w·û)`; `softplus` is floored at the dtype epsilon so that
    /// `m` stays strictly above -1 after rounding, and w·û is formed
    /// from `m` instead of being re-summed from û
    fn correct(u_nz: &Tensor, w_nz: &Tensor) -> Result<(Tensor, Tensor)> {
        let eps = dtype_epsilon(u_nz.dtype());
        let wu_n1 = (w_nz * u_nz)?.sum_keepdim(D::Minus1)?;
        let m_wu_n1 = (softplus(&wu_n1)?.clamp(eps, f64::INFINITY)? - 1.)?;

        let w_norm_sq_n1 = w_nz.sqr()?.sum_keepdim(D::Minus1)?;
        let floored_n1 = w_norm_sq_n1.clamp(MIN_W_NORM_SQ, f64::INFINITY)?;
        let coef_n1 = (&m_wu_n1 - &wu_n1)?.div(&floored_n1)?;
        let u_hat_nz = (u_nz + w_nz.broadcast_mul(&coef_n1)?)?;

        // w·û = w·u + coef ‖w‖², which is m(w·u) unless ‖w‖² was floored
        let wu_hat_n1 = (wu_n1 + (&coef_n1 * &w_norm_sq_n1)?)?;
        let wu_hat_n1 = w_norm_sq_n1
            .ge(MIN_W_NORM_SQ)?
            .where_cond(&m_wu_n1, &wu_hat_n1)?;
        Ok((u_hat_nz, wu_hat_n1))
    }

    ///
    /// Apply one step
    ///
    /// * `z_nz` - current samples (n x z)
    /// * `u_nz`, `w_nz` - raw amortized vectors (n x z)
    /// * `b_n1` - amortized offsets (n x 1)
    ///
    /// # Returns `(z_next, log_det_n)` with
    /// log_det = log |1 + (w·û) tanh'(w·z + b)|
    pub fn forward(
        &self,
        z_nz: &Tensor,
        u_nz: &Tensor,
        w_nz: &Tensor,
        b_n1: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let (u_hat_nz, wu_hat_n1) = Self::correct(u_nz, w_nz)?;

        let wzb_n1 = ((w_nz * z_nz)?.sum_keepdim(D::Minus1)? + b_n1)?;
        let z_next = (z_nz + u_hat_nz.broadcast_mul(&wzb_n1.tanh()?)?)?;

        let log_det_n = ((tanh_derivative(&wzb_n1)? * wu_hat_n1)? + 1.)?
            .abs()?
            .log()?
            .squeeze(D::Minus1)?;

        Ok((z_next, log_det_n))
    }
}

/// Chain of `K` planar steps sharing one amortized parameter block
pub struct PlanarChain {
    n_latent: usize,
    steps: Vec<PlanarStep>,
}

impl PlanarChain {
    pub fn new(n_latent: usize, num_flows: usize) -> Self {
        Self {
            n_latent,
            steps: vec![PlanarStep; num_flows],
        }
    }

    fn check_params(&self, z0_nk: &Tensor, u: &Tensor, w: &Tensor, b: &Tensor) -> Result<()> {
        let n = z0_nk.dim(0)?;
        let nflows = self.steps.len();
        let expected_uw = vec![n, nflows, self.n_latent];
        for (what, t) in [("planar u", u), ("planar w", w)] {
            if t.dims() != expected_uw.as_slice() {
                return Err(FlowVaeError::ShapeMismatch {
                    what,
                    expected: expected_uw.clone(),
                    actual: t.dims().to_vec(),
                }
                .into());
            }
        }
        if b.dims() != [n, nflows] {
            return Err(FlowVaeError::ShapeMismatch {
                what: "planar b",
                expected: vec![n, nflows],
                actual: b.dims().to_vec(),
            }
            .into());
        }
        Ok(())
    }

    /// Run the chain keeping every intermediate sample
    ///
    /// # Returns `(trajectory, log_det_n)` where `trajectory` holds
    /// `z_0, ..., z_K`
    pub fn apply_with_trajectory(
        &self,
        z0_nk: &Tensor,
        u_nkz: &Tensor,
        w_nkz: &Tensor,
        b_nk: &Tensor,
    ) -> Result<(Vec<Tensor>, Tensor)> {
        self.check_params(z0_nk, u_nkz, w_nkz, b_nk)?;

        let mut log_det_n = z0_nk.zeros_like()?.sum(D::Minus1)?;
        let mut zz = Vec::with_capacity(self.steps.len() + 1);
        zz.push(z0_nk.clone());

        for (k, step) in self.steps.iter().enumerate() {
            let u_nz = u_nkz.narrow(1, k, 1)?.squeeze(1)?;
            let w_nz = w_nkz.narrow(1, k, 1)?.squeeze(1)?;
            let b_n1 = b_nk.narrow(1, k, 1)?;
            let (z_next, log_det_k) = step.forward(&zz[k], &u_nz, &w_nz, &b_n1)?;
            log_det_n = (log_det_n + log_det_k)?;
            zz.push(z_next);
        }
        Ok((zz, log_det_n))
    }
}

impl PosteriorFlowT for PlanarChain {
    fn apply(&self, z0_nk: &Tensor, params: &FlowParams) -> Result<(Tensor, Tensor)> {
        match params {
            FlowParams::Planar { u_nkz, w_nkz, b_nk } => {
                let (mut zz, log_det_n) = self.apply_with_trajectory(z0_nk, u_nkz, w_nkz, b_nk)?;
                let zk = zz.pop().unwrap_or_else(|| z0_nk.clone());
                Ok((zk, log_det_n))
            }
            _ => candle_core::bail!("planar chain expects planar parameters"),
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

    fn randn(shape: &[usize]) -> Result<Tensor> {
        Tensor::randn(0f64, 1f64, shape, &Device::Cpu)
    }

    #[test]
    fn corrected_u_keeps_w_dot_u_above_minus_one() -> Result<()> {
        let u = (randn(&[256, 5])? * 4.)?;
        let w = (randn(&[256, 5])? * 4.)?;
        let u_hat = PlanarStep::corrected_u(&u, &w)?;
        let wu_hat = (&w * &u_hat)?.sum(1)?.to_vec1::<f64>()?;
        for v in wu_hat {
            assert!(v >= -1. - 1e-12, "w.u_hat = {}", v);
        }
        Ok(())
    }

    #[test]
    fn zero_w_stays_finite() -> Result<()> {
        let u = randn(&[3, 4])?;
        let w = Tensor::zeros((3, 4), DType::F64, &Device::Cpu)?;
        let b = Tensor::zeros((3, 1), DType::F64, &Device::Cpu)?;
        let z = randn(&[3, 4])?;
        let (z1, ld) = PlanarStep.forward(&z, &u, &w, &b)?;
        assert_eq!(z1.dims(), &[3, 4]);
        for v in ld.to_vec1::<f64>()? {
            assert!(v.is_finite());
        }
        Ok(())
    }

    /// brute-force det(∂z'/∂z) = det(I + û ψᵀ) on a 2-D example
    #[test]
    fn log_det_matches_explicit_jacobian() -> Result<()> {
        let z = Tensor::new(&[[0.3f64, -0.7]], &Device::Cpu)?;
        let u = Tensor::new(&[[0.9f64, -1.4]], &Device::Cpu)?;
        let w = Tensor::new(&[[1.1f64, 0.6]], &Device::Cpu)?;
        let b = Tensor::new(&[[0.2f64]], &Device::Cpu)?;

        let (_, ld) = PlanarStep.forward(&z, &u, &w, &b)?;
        let ld = ld.to_vec1::<f64>()?[0];

        let u_hat = PlanarStep::corrected_u(&u, &w)?.to_vec2::<f64>()?[0].clone();
        let (zv, wv) = ([0.3, -0.7], [1.1, 0.6]);
        let a: f64 = wv[0] * zv[0] + wv[1] * zv[1] + 0.2;
        let h1 = 1. - a.tanh().powi(2);
        let jac = [
            [1. + u_hat[0] * wv[0] * h1, u_hat[0] * wv[1] * h1],
            [u_hat[1] * wv[0] * h1, 1. + u_hat[1] * wv[1] * h1],
        ];
        let det = jac[0][0] * jac[1][1] - jac[0][1] * jac[1][0];
        approx::assert_abs_diff_eq!(ld, det.abs().ln(), epsilon = 1e-10);
        Ok(())
    }

    #[test]
    fn far_negative_w_dot_u_keeps_log_det_finite_in_f32() -> Result<()> {
        let dev = Device::Cpu;
        let z = Tensor::new(&[[0f32, 0.]], &dev)?;
        let u = Tensor::new(&[[-20f32, 0.]], &dev)?;
        let w = Tensor::new(&[[1f32, 0.]], &dev)?;
        let b = Tensor::new(&[[0f32]], &dev)?;

        let (z1, ld) = PlanarStep.forward(&z, &u, &w, &b)?;
        let ld = ld.to_vec1::<f32>()?[0];
        assert!(ld.is_finite(), "log_det = {}", ld);
        // 1 + tanh'(0) m(w·u) bottoms out at the f32 epsilon
        approx::assert_abs_diff_eq!(ld, f32::EPSILON.ln(), epsilon = 1e-3);
        for v in z1.flatten_all()?.to_vec1::<f32>()? {
            assert!(v.is_finite());
        }
        Ok(())
    }

    #[test]
    fn chain_log_det_is_sum_of_steps() -> Result<()> {
        let (n, k, z) = (4, 3, 2);
        let chain = PlanarChain::new(z, k);
        let u = randn(&[n, k, z])?;
        let w = randn(&[n, k, z])?;
        let b = randn(&[n, k])?;
        let z0 = randn(&[n, z])?;

        let (traj, total) = chain.apply_with_trajectory(&z0, &u, &w, &b)?;
        assert_eq!(traj.len(), k + 1);

        let mut expected = vec![0f64; n];
        for j in 0..k {
            let (_, ld) = PlanarStep.forward(
                &traj[j],
                &u.narrow(1, j, 1)?.squeeze(1)?,
                &w.narrow(1, j, 1)?.squeeze(1)?,
                &b.narrow(1, j, 1)?,
            )?;
            for (e, v) in expected.iter_mut().zip(ld.to_vec1::<f64>()?) {
                *e += v;
            }
        }
        for (got, want) in total.to_vec1::<f64>()?.iter().zip(expected) {
            approx::assert_abs_diff_eq!(*got, want, epsilon = 1e-12);
        }
        Ok(())
    }

    #[test]
    fn empty_chain_is_identity() -> Result<()> {
        let chain = PlanarChain::new(3, 0);
        let z0 = randn(&[5, 3])?;
        let params = FlowParams::Planar {
            u_nkz: Tensor::zeros((5, 0, 3), DType::F64, &Device::Cpu)?,
            w_nkz: Tensor::zeros((5, 0, 3), DType::F64, &Device::Cpu)?,
            b_nk: Tensor::zeros((5, 0), DType::F64, &Device::Cpu)?,
        };
        let (zk, ld) = chain.apply(&z0, &params)?;
        let diff = (zk - &z0)?.abs()?.sum_all()?.to_scalar::<f64>()?;
        assert_eq!(diff, 0.);
        assert_eq!(ld.to_vec1::<f64>()?, vec![0.; 5]);
        Ok(())
    }

    #[test]
    fn wrong_parameter_shape_is_reported() -> Result<()> {
        let chain = PlanarChain::new(2, 2);
        let z0 = randn(&[3, 2])?;
        let err = chain
            .apply_with_trajectory(&z0, &randn(&[3, 1, 2])?, &randn(&[3, 2, 2])?, &randn(&[3, 2])?)
            .unwrap_err();
        assert!(err.to_string().contains("planar u"));
        Ok(())
    }
}
