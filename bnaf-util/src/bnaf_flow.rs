#![allow(dead_code)]

use crate::bnaf_masked_linear::{softplus, MaskedLinear, Tanh};

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::ops;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

/// One layer inside a flow block
pub enum FlowLayer {
    Linear(MaskedLinear),
    Tanh(Tanh),
}

impl FlowLayer {
    pub fn forward(&self, x_ni: &Tensor, grad_ndmi: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        match self {
            FlowLayer::Linear(layer) => layer.forward(x_ni, grad_ndmi),
            FlowLayer::Tanh(layer) => layer.forward(x_ni, grad_ndmi),
        }
    }
}

/// Residual connection around a flow block
pub enum Residual {
    None,
    /// `y = x + f(x)`
    Normal,
    /// `y = sigmoid(gate) * f(x) + (1 - sigmoid(gate)) * x` with a learned
    /// scalar gate
    Gated(Tensor),
}

/// Fold a residual gate into per-dimension log-derivatives.
///
/// With `g = sigmoid(gate)` the gated Jacobian diagonal is
/// `g * exp(log_diag) + (1 - g)`, whose log is
/// `softplus(log_diag + gate) - softplus(gate)`.
pub fn fold_residual_log_det(log_diag_nd: &Tensor, gate: &Tensor) -> Result<Tensor> {
    softplus(&log_diag_nd.broadcast_add(gate)?)?.broadcast_sub(&softplus(gate)?)
}

///////////////////////////////////////////
// One BNAF block: masked + tanh layers  //
///////////////////////////////////////////

pub struct Bnaf {
    layers: Vec<FlowLayer>,
    residual: Residual,
    n_dims: usize,
}

impl Bnaf {
    pub fn new(layers: Vec<FlowLayer>, residual: Residual, n_dims: usize) -> Self {
        Self {
            layers,
            residual,
            n_dims,
        }
    }

    /// Returns `(y_nd, log_det_n)` where `log_det_n` is this block's
    /// per-sample log |det J| contribution.
    pub fn forward(&self, x_nd: &Tensor) -> Result<(Tensor, Tensor)> {
        let mut y = x_nd.clone();
        let mut grad: Option<Tensor> = None;

        for layer in self.layers.iter() {
            let (y_next, grad_next) = layer.forward(&y, grad.as_ref())?;
            y = y_next;
            grad = Some(grad_next);
        }

        let grad_ndmi = match grad {
            Some(grad) => grad,
            None => candle_core::bail!("flow block has no layers"),
        };

        debug_assert_eq!(y.dims(), x_nd.dims());

        // (n, d, 1, 1) -> per-dimension log-derivative (n, d)
        let log_diag_nd = grad_ndmi.squeeze(3)?.squeeze(2)?;

        match &self.residual {
            Residual::None => Ok((y, log_diag_nd.sum(1)?)),
            Residual::Normal => {
                let y = x_nd.add(&y)?;
                Ok((y, softplus(&log_diag_nd)?.sum(1)?))
            }
            Residual::Gated(gate) => {
                let g = ops::sigmoid(gate)?;
                let y = y
                    .broadcast_mul(&g)?
                    .add(&x_nd.broadcast_mul(&(g.neg()? + 1.0)?)?)?;
                Ok((y, fold_residual_log_det(&log_diag_nd, gate)?.sum(1)?))
            }
        }
    }

    pub fn n_dims(&self) -> usize {
        self.n_dims
    }
}

/////////////////////////////////////
// Fixed permutation between blocks //
/////////////////////////////////////

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PermutationKind {
    /// reverse the dimension order
    Flip,
    /// pseudo-random order drawn once from an explicit seed
    Random,
}

/// Dimension reordering with unit-magnitude determinant; the order is fixed
/// at construction so repeated forward evaluations are deterministic.
pub struct Permutation {
    index_d: Tensor,
    order: Vec<u32>,
}

impl Permutation {
    pub fn new(n_dims: usize, kind: PermutationKind, seed: u64, device: &Device) -> Result<Self> {
        let mut order: Vec<u32> = (0..n_dims as u32).collect();
        match kind {
            PermutationKind::Flip => order.reverse(),
            PermutationKind::Random => {
                let mut rng = StdRng::seed_from_u64(seed);
                order.shuffle(&mut rng);
            }
        }
        let index_d = Tensor::from_vec(order.clone(), n_dims, device)?;
        Ok(Self { index_d, order })
    }

    pub fn forward(&self, x_nd: &Tensor) -> Result<Tensor> {
        x_nd.index_select(&self.index_d, 1)
    }

    pub fn order(&self) -> &[u32] {
        &self.order
    }
}

////////////////////////////////////
// Composition of blocks and perms //
////////////////////////////////////

pub enum FlowModule {
    Bnaf(Bnaf),
    Permutation(Permutation),
}

/// Ordered composition of flow modules; log-determinants are additive across
/// the composition and permutations contribute zero.
pub struct FlowStack {
    modules: Vec<FlowModule>,
    n_dims: usize,
}

impl FlowStack {
    pub fn new(n_dims: usize) -> Self {
        Self {
            modules: Vec::new(),
            n_dims,
        }
    }

    pub fn push(&mut self, module: FlowModule) {
        self.modules.push(module);
    }

    pub fn n_dims(&self) -> usize {
        self.n_dims
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn forward(&self, x_nd: &Tensor) -> Result<(Tensor, Tensor)> {
        if x_nd.dim(1)? != self.n_dims {
            candle_core::bail!(
                "flow expects {} dimensions, got {}",
                self.n_dims,
                x_nd.dim(1)?
            )
        }

        let n = x_nd.dim(0)?;
        let mut y = x_nd.clone();
        let mut log_det_n = Tensor::zeros(n, DType::F32, x_nd.device())?;

        for module in self.modules.iter() {
            match module {
                FlowModule::Bnaf(block) => {
                    let (y_next, block_log_det_n) = block.forward(&y)?;
                    y = y_next;
                    log_det_n = log_det_n.add(&block_log_det_n)?;
                }
                FlowModule::Permutation(perm) => {
                    y = perm.forward(&y)?;
                }
            }
        }

        Ok((y, log_det_n))
    }
}
