use crate::candle_flow_error::FlowVaeError;
use candle_core::{DType, Result, Tensor};

/// Numerically stable softplus
///
/// softplus(x) = log(1 + exp(x)) = max(x, 0) + log(1 + exp(-|x|))
///
pub fn softplus(x: &Tensor) -> Result<Tensor> {
    let tail = (x.abs()?.neg()?.exp()? + 1.)?.log()?;
    x.relu()? + tail
}

/// log(sigmoid(x)) = -softplus(-x), finite for any finite `x`
pub fn log_sigmoid(x: &Tensor) -> Result<Tensor> {
    softplus(&x.neg()?)?.neg()
}

/// machine epsilon of the working dtype
pub fn dtype_epsilon(dtype: DType) -> f64 {
    match dtype {
        DType::F64 => f64::EPSILON,
        DType::F16 => 9.765_625e-4,
        DType::BF16 => 7.812_5e-3,
        _ => f32::EPSILON as f64,
    }
}

/// derivative of tanh evaluated at `x`: 1 - tanh(x)^2
pub fn tanh_derivative(x: &Tensor) -> Result<Tensor> {
    x.tanh()?.sqr()?.affine(-1., 1.)
}

/// (min, sum) in f64; the sum carries any NaN or Inf forward
fn min_sum_f64(x: &Tensor) -> Result<(f64, f64)> {
    let x = x.to_dtype(DType::F64)?;
    let lo = x.min_all()?.to_scalar::<f64>()?;
    let tot = x.sum_all()?.to_scalar::<f64>()?;
    Ok((lo, tot))
}

/// Surface NaN or Inf as an error
///
/// * `x` - tensor to check
/// * `what` - name used in the error message
pub fn ensure_finite(x: &Tensor, what: &str) -> Result<()> {
    if x.elem_count() == 0 {
        return Ok(());
    }
    let (lo, tot) = min_sum_f64(x)?;
    if lo.is_finite() && tot.is_finite() {
        Ok(())
    } else {
        Err(FlowVaeError::NumericalInstability(format!(
            "{} has non-finite entries (min {}, sum {})",
            what, lo, tot
        ))
        .into())
    }
}

/// Surface non-positive, NaN or Inf entries as an error
pub fn ensure_positive(x: &Tensor, what: &str) -> Result<()> {
    if x.elem_count() == 0 {
        return Ok(());
    }
    let (lo, tot) = min_sum_f64(x)?;
    if lo > 0. && tot.is_finite() {
        Ok(())
    } else {
        Err(FlowVaeError::NumericalInstability(format!(
            "{} must be strictly positive and finite (min {}, sum {})",
            what, lo, tot
        ))
        .into())
    }
}
