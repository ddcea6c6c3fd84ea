use candle_core::{Result, Tensor};
use candle_nn::Module;

////////////////////////////////////////////
// Linear module with autoregressive mask //
////////////////////////////////////////////

/// Linear map whose weight is multiplied by a fixed 0/1 mask so that
/// output unit `c` only sees inputs of lower (or equal) autoregressive
/// degree.
#[derive(Clone, Debug)]
pub struct MaskedLinear {
    weight_oi: Tensor, // out x in
    mask_oi: Tensor,   // out x in, constant
    bias_o: Option<Tensor>,
}

impl MaskedLinear {
    pub fn new(weight_oi: Tensor, mask_oi: Tensor, bias_o: Option<Tensor>) -> Result<Self> {
        if mask_oi.dims() != weight_oi.dims() {
            candle_core::bail!(
                "mask {:?} does not match weight {:?}",
                mask_oi.dims(),
                weight_oi.dims()
            );
        }
        Ok(Self {
            weight_oi,
            mask_oi,
            bias_o,
        })
    }

    /// effective (masked) weight: out x in
    pub fn weight(&self) -> Result<Tensor> {
        self.weight_oi.mul(&self.mask_oi)
    }
}

impl Module for MaskedLinear {
    fn forward(&self, x_ni: &Tensor) -> Result<Tensor> {
        let w_io = self.weight()?.t()?;
        let y_no = x_ni.matmul(&w_io)?;
        match &self.bias_o {
            None => Ok(y_no),
            Some(bias) => y_no.broadcast_add(bias),
        }
    }
}

/// Whether `n_in` and `n_out` can share autoregressive degrees
pub fn compatible_widths(n_in: usize, n_out: usize) -> bool {
    n_in > 0 && n_out > 0 && (n_in % n_out == 0 || n_out % n_in == 0)
}

/// Build an `n_out x n_in` 0/1 mask (row-major) from block degrees.
///
/// When `n_out >= n_in`, output `c` gets degree `c / (n_out / n_in)`
/// and input `r` has degree `r`; otherwise input `r` gets degree
/// `r / (n_in / n_out)` and output `c` has degree `c`. A connection is
/// kept if `deg(in) <= deg(out)`, or `deg(in) < deg(out)` when `strict`.
pub fn autoregressive_mask(n_in: usize, n_out: usize, strict: bool) -> Vec<f32> {
    debug_assert!(compatible_widths(n_in, n_out));

    let degrees = |r: usize, c: usize| -> (usize, usize) {
        if n_out >= n_in {
            (r, c / (n_out / n_in))
        } else {
            (r / (n_in / n_out), c)
        }
    };

    let mut mask = vec![0_f32; n_out * n_in];
    for c in 0..n_out {
        for r in 0..n_in {
            let (deg_in, deg_out) = degrees(r, c);
            let keep = if strict {
                deg_in < deg_out
            } else {
                deg_in <= deg_out
            };
            if keep {
                mask[c * n_in + r] = 1.;
            }
        }
    }
    mask
}

/// Will create a new masked linear module with these variables:
/// * `weight` (out x in)
/// * `bias` (out)
///
/// # Arguments
/// * `in_dim` - input dimension
/// * `out_dim` - output dimension
/// * `strict` - exclude same-degree connections (output heads)
/// * `vb` - variable builder
pub fn masked_linear(
    in_dim: usize,
    out_dim: usize,
    strict: bool,
    vb: candle_nn::VarBuilder,
) -> Result<MaskedLinear> {
    if !compatible_widths(in_dim, out_dim) {
        candle_core::bail!(
            "masked linear needs one width to divide the other: {} vs {}",
            in_dim,
            out_dim
        );
    }

    let bound = 1. / (in_dim as f64).sqrt();
    let init_ws = candle_nn::Init::Uniform {
        lo: -bound,
        up: bound,
    };
    let ws = vb.get_with_hints((out_dim, in_dim), "weight", init_ws)?;
    let bs = vb.get_with_hints(out_dim, "bias", candle_nn::init::ZERO)?;

    let mask = Tensor::from_vec(
        autoregressive_mask(in_dim, out_dim, strict),
        (out_dim, in_dim),
        vb.device(),
    )?
    .to_dtype(vb.dtype())?;

    MaskedLinear::new(ws, mask, Some(bs))
}
