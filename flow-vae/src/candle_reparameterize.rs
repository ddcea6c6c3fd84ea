use crate::candle_flow_error::FlowVaeError;
use candle_core::{Result, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Source of standard normal noise for the reparameterization trick.
pub trait NoiseSource {
    /// `eps ~ N(0, I)` with the shape, dtype and device of `like`
    fn randn_like(&mut self, like: &Tensor) -> Result<Tensor>;
}

/// Seedable host-side generator; the same seed replays the same noise.
pub struct SeededNoise {
    rng: StdRng,
}

impl SeededNoise {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// restart the stream from `seed`
    pub fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }
}

impl NoiseSource for SeededNoise {
    fn randn_like(&mut self, like: &Tensor) -> Result<Tensor> {
        let eps: Vec<f32> = (&mut self.rng)
            .sample_iter(StandardNormal)
            .take(like.elem_count())
            .collect();
        Tensor::from_vec(eps, like.dims(), like.device())?.to_dtype(like.dtype())
    }
}

/// Device-side generator (`Tensor::randn_like`)
#[derive(Default)]
pub struct DeviceNoise;

impl NoiseSource for DeviceNoise {
    fn randn_like(&mut self, like: &Tensor) -> Result<Tensor> {
        Tensor::randn_like(like, 0., 1.)
    }
}

///
/// z = mu + sigma * eps
/// where eps ~ N(0, 1) and sigma = sqrt(var)
///
/// `eps` is not a variable, so gradients reach `z_mean` and `z_var`
/// without differentiating through the sampling itself.
///
/// # Arguments
/// * `z_mean` - mean of Gaussian distribution (n x k)
/// * `z_var` - variance of Gaussian distribution (n x k), strictly positive
/// * `noise` - standard normal source
pub fn reparameterize<N>(z_mean: &Tensor, z_var: &Tensor, noise: &mut N) -> Result<Tensor>
where
    N: NoiseSource + ?Sized,
{
    if z_mean.dims() != z_var.dims() {
        return Err(FlowVaeError::ShapeMismatch {
            what: "reparameterize",
            expected: z_mean.dims().to_vec(),
            actual: z_var.dims().to_vec(),
        }
        .into());
    }

    let eps = noise.randn_like(z_mean)?;

    if !eps.device().same_device(z_mean.device()) {
        return Err(FlowVaeError::DeviceMismatch(format!(
            "noise on {:?}, parameters on {:?}",
            eps.device().location(),
            z_mean.device().location()
        ))
        .into());
    }

    z_mean + (z_var.sqrt()? * eps)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Var};

    #[test]
    fn seeded_noise_replays() -> Result<()> {
        let like = Tensor::zeros((4, 3), DType::F32, &Device::Cpu)?;
        let mut a = SeededNoise::new(42);
        let mut b = SeededNoise::new(42);
        let ea = a.randn_like(&like)?.flatten_all()?.to_vec1::<f32>()?;
        let eb = b.randn_like(&like)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(ea, eb);

        let ea2 = a.randn_like(&like)?.flatten_all()?.to_vec1::<f32>()?;
        assert_ne!(ea, ea2);

        a.reseed(42);
        let ea3 = a.randn_like(&like)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(ea, ea3);
        Ok(())
    }

    #[test]
    fn sample_mean_converges_to_mu() -> Result<()> {
        let dev = Device::Cpu;
        let n = 20_000;
        let mu = Tensor::new(&[[1.5f32, -2.0, 0.0]], &dev)?.broadcast_as((n, 3))?;
        let var = Tensor::new(&[[0.5f32, 2.0, 1.0]], &dev)?.broadcast_as((n, 3))?;
        let mut noise = SeededNoise::new(7);

        let z = reparameterize(&mu.contiguous()?, &var.contiguous()?, &mut noise)?;
        let zbar = z.mean(0)?.to_vec1::<f32>()?;

        // standard error is at most sqrt(2 / 20000) = 0.01
        for (got, want) in zbar.iter().zip([1.5f32, -2.0, 0.0]) {
            assert!((got - want).abs() < 0.05, "{} vs {}", got, want);
        }
        Ok(())
    }

    #[test]
    fn gradients_flow_through_mean_and_variance() -> Result<()> {
        let dev = Device::Cpu;
        let mu = Var::new(&[[0.3f32, -0.1]], &dev)?;
        let var = Var::new(&[[4.0f32, 0.25]], &dev)?;
        let mut noise = SeededNoise::new(3);

        let z = reparameterize(mu.as_tensor(), var.as_tensor(), &mut noise)?;
        let grads = z.sum_all()?.backward()?;

        let d_mu = grads.get(mu.as_tensor()).expect("grad wrt mu");
        assert_eq!(d_mu.to_vec2::<f32>()?, vec![vec![1., 1.]]);

        // dz/dvar = eps / (2 sqrt(var))
        noise.reseed(3);
        let eps = noise.randn_like(mu.as_tensor())?.to_vec2::<f32>()?;
        let d_var = grads.get(var.as_tensor()).expect("grad wrt var");
        let d_var = d_var.to_vec2::<f32>()?;
        assert!((d_var[0][0] - eps[0][0] / 4.).abs() < 1e-5);
        assert!((d_var[0][1] - eps[0][1] / 1.).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn mismatched_shapes_are_rejected() -> Result<()> {
        let dev = Device::Cpu;
        let mu = Tensor::zeros((2, 3), DType::F32, &dev)?;
        let var = Tensor::ones((2, 2), DType::F32, &dev)?;
        let err = reparameterize(&mu, &var, &mut DeviceNoise).unwrap_err();
        assert!(err.to_string().contains("shape mismatch"));
        Ok(())
    }
}
