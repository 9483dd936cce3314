#![allow(dead_code)]

use crate::bnaf_model::DensityModel;

use candle_core::Tensor;
use log::info;

pub const DEFAULT_RATIO_EPS: f32 = 1e-9;

/// Two-class density ratio `pdf_S(x) / pdf_B(x)` per row of `x_nd`.
///
/// `models[0]` is the background density and `models[1]` the signal density;
/// the ordering is a caller contract. With `return_prob` the output is the
/// equal-prior posterior `pdf_S / clip(pdf_S + pdf_B, eps, inf)`, otherwise
/// the raw ratio `pdf_S / clip(pdf_B, eps, inf)`. Rows where the arithmetic
/// produces a non-finite value are mapped to the sentinel `0.0`.
pub fn predict(
    x_nd: &Tensor,
    models: &[DensityModel],
    return_prob: bool,
    eps: f32,
) -> anyhow::Result<Vec<f32>> {
    anyhow::ensure!(
        models.len() == 2,
        "density ratio needs exactly two models (background, signal), got {}",
        models.len()
    );

    info!(
        "computing density ratio for n = {} rows | return_prob = {}",
        x_nd.dim(0)?,
        return_prob
    );

    let bgk_pdf = models[0].pdf(x_nd)?;
    let sgn_pdf = models[1].pdf(x_nd)?;

    let out = sgn_pdf
        .iter()
        .zip(bgk_pdf.iter())
        .map(|(&sgn, &bgk)| {
            let ratio = if return_prob {
                sgn / (sgn + bgk).max(eps)
            } else {
                sgn / bgk.max(eps)
            };
            if ratio.is_finite() {
                ratio
            } else {
                0.0
            }
        })
        .collect();

    Ok(out)
}
