#![allow(dead_code)]

use crate::bnaf_checkpoint::{checkpoint_path, load_model_weights};
use crate::bnaf_flow::{Bnaf, FlowLayer, FlowModule, FlowStack, Permutation, PermutationKind, Residual};
use crate::bnaf_masked_linear::{masked_linear, Tanh};

use candle_core::{DType, Device, Result, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use log::info;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResidualKind {
    None,
    Normal,
    Gated,
}

/// Architecture descriptor; fully determines the flow, and must match
/// between training and loading for a checkpoint to apply.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelParam {
    pub n_dims: usize,
    pub hidden_dim: usize,
    pub layers: usize,
    pub flows: usize,
    pub residual: ResidualKind,
    pub perm: PermutationKind,
    pub seed: u64,
}

/// Build a flow of `flows` BNAF blocks separated by `flows - 1` permutation
/// layers. Each block maps `n_dims -> n_dims * hidden_dim -> ... -> n_dims`
/// through `layers` interior masked layers; the residual connection applies
/// to every block except the last.
pub fn create_model(param: &ModelParam, vb: VarBuilder) -> Result<FlowStack> {
    if param.n_dims == 0 || param.hidden_dim == 0 || param.flows == 0 {
        candle_core::bail!(
            "invalid architecture: n_dims = {}, hidden_dim = {}, flows = {}",
            param.n_dims,
            param.hidden_dim,
            param.flows
        )
    }

    let hidden = param.n_dims * param.hidden_dim;
    let mut stack = FlowStack::new(param.n_dims);

    for f in 0..param.flows {
        let vb_f = vb.pp(format!("flow.{}", f));

        let mut layers = Vec::with_capacity(2 * param.layers + 3);
        layers.push(FlowLayer::Linear(masked_linear(
            param.n_dims,
            hidden,
            param.n_dims,
            vb_f.pp("layer.in"),
        )?));
        layers.push(FlowLayer::Tanh(Tanh));

        for l in 0..param.layers {
            layers.push(FlowLayer::Linear(masked_linear(
                hidden,
                hidden,
                param.n_dims,
                vb_f.pp(format!("layer.{}", l)),
            )?));
            layers.push(FlowLayer::Tanh(Tanh));
        }

        layers.push(FlowLayer::Linear(masked_linear(
            hidden,
            param.n_dims,
            param.n_dims,
            vb_f.pp("layer.out"),
        )?));

        let interior = f + 1 < param.flows;
        let residual = match (param.residual, interior) {
            (ResidualKind::Gated, true) => {
                let gate = vb_f.get_with_hints(
                    1,
                    "gate",
                    candle_nn::Init::Randn {
                        mean: 0.0,
                        stdev: 1.0,
                    },
                )?;
                Residual::Gated(gate)
            }
            (ResidualKind::Normal, true) => Residual::Normal,
            _ => Residual::None,
        };

        stack.push(FlowModule::Bnaf(Bnaf::new(layers, residual, param.n_dims)));

        if interior {
            stack.push(FlowModule::Permutation(Permutation::new(
                param.n_dims,
                param.perm,
                param.seed.wrapping_add(f as u64),
                vb.device(),
            )?));
        }
    }

    Ok(stack)
}

///////////////////////////////////////////
// Density model over a flow composition //
///////////////////////////////////////////

/// A trained (or trainable) density estimator: a flow composition evaluated
/// against a standard Gaussian base distribution.
pub struct DensityModel {
    stack: FlowStack,
    variable_map: VarMap,
    param: ModelParam,
    device: Device,
}

impl DensityModel {
    pub fn new(param: &ModelParam, device: &Device) -> Result<Self> {
        let variable_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&variable_map, DType::F32, device);
        let stack = create_model(param, vb)?;

        let model = Self {
            stack,
            variable_map,
            param: param.clone(),
            device: device.clone(),
        };

        info!(
            "BNAF flow: parameters = {}, n_dims = {}, flows = {}",
            model.num_parameters(),
            param.n_dims,
            param.flows
        );
        Ok(model)
    }

    /// Model log-density `log p(x) = log N(y; 0, I) + sum_k log|det J_k|`
    /// for each row of `x_nd` (change of variables under the flow).
    pub fn log_prob(&self, x_nd: &Tensor) -> Result<Tensor> {
        let (y_nd, log_det_n) = self.stack.forward(x_nd)?;
        let d = self.param.n_dims as f64;
        let log_base_n =
            ((y_nd.sqr()?.sum(1)? * (-0.5))? - 0.5 * d * (2.0 * std::f64::consts::PI).ln())?;
        log_base_n.add(&log_det_n)
    }

    /// Learned density evaluated at each row, detached to plain numbers.
    /// Underflow to zero far from the support is acceptable; the estimate is
    /// not renormalized over finite samples.
    pub fn pdf(&self, x_nd: &Tensor) -> Result<Vec<f32>> {
        self.log_prob(x_nd)?.exp()?.detach().to_vec1::<f32>()
    }

    pub fn forward(&self, x_nd: &Tensor) -> Result<(Tensor, Tensor)> {
        self.stack.forward(x_nd)
    }

    pub fn param(&self) -> &ModelParam {
        &self.param
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn variable_map(&self) -> &VarMap {
        &self.variable_map
    }

    pub fn num_parameters(&self) -> usize {
        self.variable_map
            .all_vars()
            .iter()
            .map(|v| v.elem_count())
            .sum()
    }

    /// Trainable variables in deterministic (name-sorted) order.
    pub fn named_vars(&self) -> Vec<(String, Var)> {
        let data = self.variable_map.data().lock().expect("varmap lock");
        let mut vars: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        vars
    }
}

/// Reconstruct one model per name from `{dir}/{name}_{epoch}.safetensors`
/// checkpoints. The stored architecture fingerprint is validated against
/// `param`, and a missing file or shape mismatch aborts the load.
pub fn load_models(
    param: &ModelParam,
    model_names: &[String],
    model_dir: &Path,
    epoch: usize,
    device: &Device,
) -> anyhow::Result<Vec<DensityModel>> {
    let mut models = Vec::with_capacity(model_names.len());
    for (i, name) in model_names.iter().enumerate() {
        let path = checkpoint_path(model_dir, name, epoch);
        info!("loading model[{}] from {}", i, path.display());

        let model = DensityModel::new(param, device)?;
        load_model_weights(&model, &path)?;
        models.push(model);
    }
    Ok(models)
}
