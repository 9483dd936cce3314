#![allow(dead_code)]

use candle_core::{Result, Tensor};

//////////////////////////////////////////////////////
// Block-masked affine layer with tractable log-det //
//////////////////////////////////////////////////////

/// Affine layer whose weight matrix is constrained to block-lower-triangular
/// structure over `n_dims` contiguous blocks. The diagonal blocks carry an
/// exponential parameterization, so the per-block log-derivatives are read
/// off the parameters directly instead of going through a determinant.
#[derive(Clone, Debug)]
pub struct MaskedLinear {
    in_features: usize,
    out_features: usize,
    n_dims: usize,
    weight_oi: Tensor,     // free parameter (out x in)
    log_diag_o1: Tensor,   // log-scale of each output row (out x 1)
    bias_o: Tensor,        // (out)
    mask_diag_oi: Tensor,  // 1 on the block diagonal
    mask_lower_oi: Tensor, // 1 strictly below the block diagonal
}

impl MaskedLinear {
    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn n_dims(&self) -> usize {
        self.n_dims
    }

    /// Effective (masked, row-normalized) weight matrix `w_oi` and the log of
    /// its diagonal blocks `wpl_doi` with shape (n_dims x out_mult x in_mult).
    ///
    /// w = exp(diag) * (exp(W) * mask_d + W * mask_o) / ||row||
    pub fn get_weights(&self) -> Result<(Tensor, Tensor)> {
        let w_oi = self
            .weight_oi
            .exp()?
            .mul(&self.mask_diag_oi)?
            .add(&self.weight_oi.mul(&self.mask_lower_oi)?)?;

        let norm_o1 = w_oi.sqr()?.sum_keepdim(1)?;

        let w_oi = w_oi
            .broadcast_mul(&self.log_diag_o1.exp()?)?
            .broadcast_div(&norm_o1.sqrt()?)?;

        // log of the diagonal-block entries before masking; only the
        // block-diagonal region of this matrix is meaningful
        let wpl_oi = self
            .log_diag_o1
            .broadcast_add(&self.weight_oi)?
            .broadcast_sub(&(norm_o1.log()? * 0.5)?)?;

        let om = self.out_features / self.n_dims;
        let im = self.in_features / self.n_dims;

        let blocks = (0..self.n_dims)
            .map(|d| wpl_oi.narrow(0, d * om, om)?.narrow(1, d * im, im))
            .collect::<Result<Vec<_>>>()?;

        Ok((w_oi, Tensor::stack(&blocks, 0)?))
    }

    /// Forward evaluation with log-Jacobian bookkeeping.
    ///
    /// `grad_ndmi` accumulates, per sample and per data dimension, the log of
    /// the diagonal Jacobian block of the composition so far (all entries are
    /// positive, so blocks compose with a log-matmul-exp). Shape
    /// (n x n_dims x mult x in0).
    pub fn forward(&self, x_ni: &Tensor, grad_ndmi: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        let (w_oi, wpl_doi) = self.get_weights()?;
        let y_no = x_ni.matmul(&w_oi.t()?)?.broadcast_add(&self.bias_o)?;

        let grad_new = match grad_ndmi {
            Some(grad_ndmi) => {
                // new[n,d,o,i] = logsumexp_m( wpl[d,o,m] + grad[n,d,m,i] )
                let lhs = wpl_doi.unsqueeze(0)?.unsqueeze(4)?; // (1,d,o,m,1)
                let rhs = grad_ndmi.unsqueeze(2)?; // (n,d,1,m,i)
                logsumexp(&lhs.broadcast_add(&rhs)?, 3)?
            }
            None => {
                let n = x_ni.dim(0)?;
                let om = self.out_features / self.n_dims;
                let im = self.in_features / self.n_dims;
                wpl_doi.unsqueeze(0)?.expand((n, self.n_dims, om, im))?
            }
        };

        Ok((y_no, grad_new))
    }
}

/// Build a `MaskedLinear` where both `in_features` and `out_features` split
/// into `n_dims` contiguous blocks. Initialization keeps the diagonal blocks
/// on a sub-unit scale so the initial Jacobian stays close to identity-like
/// scaling.
pub fn masked_linear(
    in_features: usize,
    out_features: usize,
    n_dims: usize,
    vb: candle_nn::VarBuilder,
) -> Result<MaskedLinear> {
    if n_dims == 0 || in_features % n_dims != 0 || out_features % n_dims != 0 {
        candle_core::bail!(
            "masked_linear: {} blocks must evenly divide in = {} and out = {}",
            n_dims,
            in_features,
            out_features
        )
    }

    let init_ws = candle_nn::init::DEFAULT_KAIMING_NORMAL;
    let weight_oi = vb.get_with_hints((out_features, in_features), "weight", init_ws)?;

    let log_diag_o1 = vb.get_with_hints(
        (out_features, 1),
        "log.diag",
        candle_nn::Init::Uniform { lo: -2.0, up: 0.0 },
    )?;

    let k = 1.0 / (out_features as f64).sqrt();
    let bias_o = vb.get_with_hints(
        out_features,
        "bias",
        candle_nn::Init::Uniform { lo: -k, up: k },
    )?;

    let om = out_features / n_dims;
    let im = in_features / n_dims;

    let mut mask_diag = vec![0f32; out_features * in_features];
    let mut mask_lower = vec![0f32; out_features * in_features];
    for o in 0..out_features {
        for i in 0..in_features {
            let (bo, bi) = (o / om, i / im);
            if bo == bi {
                mask_diag[o * in_features + i] = 1.0;
            } else if bi < bo {
                mask_lower[o * in_features + i] = 1.0;
            }
        }
    }

    let mask_diag_oi = Tensor::from_vec(mask_diag, (out_features, in_features), vb.device())?;
    let mask_lower_oi = Tensor::from_vec(mask_lower, (out_features, in_features), vb.device())?;

    Ok(MaskedLinear {
        in_features,
        out_features,
        n_dims,
        weight_oi,
        log_diag_o1,
        bias_o,
        mask_diag_oi,
        mask_lower_oi,
    })
}

/////////////////////////////////
// Elementwise tanh activation //
/////////////////////////////////

/// `y = tanh(x)` with the saturation-stable log-derivative
/// `log(1 - tanh(x)^2) = 2 (ln 2 - x - softplus(-2x))`
#[derive(Clone, Copy, Debug, Default)]
pub struct Tanh;

impl Tanh {
    pub fn forward(&self, x_ni: &Tensor, grad_ndmi: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        let y_ni = x_ni.tanh()?;

        let log_grad_ni =
            ((x_ni.add(&softplus(&(x_ni * (-2.0))?)?)? * (-2.0))? + 2.0 * std::f64::consts::LN_2)?;

        match grad_ndmi {
            Some(grad_ndmi) => {
                let (n, d, m, _i) = grad_ndmi.dims4()?;
                let log_grad_ndm1 = log_grad_ni.reshape((n, d, m, 1))?;
                Ok((y_ni, grad_ndmi.broadcast_add(&log_grad_ndm1)?))
            }
            None => {
                candle_core::bail!("tanh cannot be the first layer of a flow block")
            }
        }
    }
}

/// numerically stable `log(1 + exp(x))`
pub fn softplus(x: &Tensor) -> Result<Tensor> {
    x.relu()?.add(&((x.abs()?.neg()?.exp()? + 1.0)?.log()?))
}

/// `log sum_k exp(x_k)` along `dim`, removing that dimension
pub fn logsumexp(x: &Tensor, dim: usize) -> Result<Tensor> {
    let max = x.max_keepdim(dim)?;
    let sum = x.broadcast_sub(&max)?.exp()?.sum_keepdim(dim)?;
    sum.log()?.add(&max)?.squeeze(dim)
}
