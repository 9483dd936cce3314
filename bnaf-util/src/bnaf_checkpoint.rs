#![allow(dead_code)]

use crate::bnaf_model::{DensityModel, ModelParam, ResidualKind};
use crate::bnaf_flow::PermutationKind;
use crate::bnaf_optimizer::PolyakAdam;
use crate::bnaf_train::TrainingTrace;

use candle_core::{safetensors, Device, Tensor};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// `{dir}/{save_name}_{epoch}.safetensors`
pub fn checkpoint_path(dir: &Path, save_name: &str, epoch: usize) -> PathBuf {
    dir.join(format!("{}_{}.safetensors", save_name, epoch))
}

/// Architecture fingerprint stored with every snapshot; a checkpoint only
/// applies to a model built from the same `ModelParam`.
fn arch_fingerprint(param: &ModelParam, device: &Device) -> candle_core::Result<Tensor> {
    let residual = match param.residual {
        ResidualKind::None => 0u32,
        ResidualKind::Normal => 1,
        ResidualKind::Gated => 2,
    };
    let perm = match param.perm {
        PermutationKind::Flip => 0u32,
        PermutationKind::Random => 1,
    };
    let v = vec![
        param.n_dims as u32,
        param.hidden_dim as u32,
        param.layers as u32,
        param.flows as u32,
        residual,
        perm,
        param.seed as u32,
        (param.seed >> 32) as u32,
    ];
    Tensor::from_vec(v, 8, device)
}

/// Persist one epoch snapshot: model parameters under their variable names,
/// optimizer state, epoch index, loss histories and the architecture
/// fingerprint, all on CPU so the file loads on any compute resource.
pub fn save_checkpoint(
    model: &DensityModel,
    optimizer: &PolyakAdam,
    epoch: usize,
    trace: &TrainingTrace,
    path: &Path,
) -> anyhow::Result<()> {
    let cpu = Device::Cpu;
    let mut tensors: HashMap<String, Tensor> = HashMap::new();

    for (name, var) in model.named_vars() {
        tensors.insert(name, var.as_tensor().to_device(&cpu)?);
    }
    for (name, tensor) in optimizer.state_tensors()? {
        tensors.insert(name, tensor.to_device(&cpu)?);
    }

    tensors.insert(
        "meta::epoch".to_string(),
        Tensor::from_vec(vec![epoch as u32], 1, &cpu)?,
    );
    tensors.insert("meta::arch".to_string(), arch_fingerprint(model.param(), &cpu)?);
    tensors.insert(
        "loss::train".to_string(),
        Tensor::from_vec(trace.train_loss.clone(), trace.train_loss.len(), &cpu)?,
    );
    tensors.insert(
        "loss::validation".to_string(),
        Tensor::from_vec(
            trace.validation_loss.clone(),
            trace.validation_loss.len(),
            &cpu,
        )?,
    );

    safetensors::save(&tensors, path)?;
    Ok(())
}

/// Read a snapshot into host memory (location-independent: tensors land on
/// CPU and move to the target device at restore time).
pub fn load_checkpoint(path: &Path) -> anyhow::Result<HashMap<String, Tensor>> {
    anyhow::ensure!(path.exists(), "missing checkpoint file {}", path.display());
    Ok(safetensors::load(path, &Device::Cpu)?)
}

fn verify_fingerprint(
    tensors: &HashMap<String, Tensor>,
    param: &ModelParam,
) -> anyhow::Result<()> {
    let stored = tensors
        .get("meta::arch")
        .ok_or_else(|| anyhow::anyhow!("checkpoint has no architecture fingerprint"))?
        .to_vec1::<u32>()?;
    let expected = arch_fingerprint(param, &Device::Cpu)?.to_vec1::<u32>()?;
    anyhow::ensure!(
        stored == expected,
        "architecture fingerprint mismatch: checkpoint {:?} vs requested {:?}",
        stored,
        expected
    );
    Ok(())
}

/// Restore all model parameters from a snapshot. The fingerprint and every
/// tensor shape are validated before any variable is touched, so a bad file
/// never partially loads.
pub fn load_model_weights(model: &DensityModel, path: &Path) -> anyhow::Result<()> {
    let tensors = load_checkpoint(path)?;
    verify_fingerprint(&tensors, model.param())?;

    let named_vars = model.named_vars();
    for (name, var) in named_vars.iter() {
        let tensor = tensors
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("checkpoint missing model tensor `{}`", name))?;
        anyhow::ensure!(
            tensor.dims() == var.dims(),
            "shape mismatch for `{}`: checkpoint {:?} vs model {:?}",
            name,
            tensor.dims(),
            var.dims()
        );
    }

    for (name, var) in named_vars.iter() {
        var.set(&tensors[name].to_device(model.device())?)?;
    }
    Ok(())
}

/// Restore optimizer state, the epoch counter and the loss histories for a
/// resumed run; returns `(next_start_epoch, trace)`.
pub fn load_training_state(
    optimizer: &mut PolyakAdam,
    path: &Path,
) -> anyhow::Result<(usize, TrainingTrace)> {
    let tensors = load_checkpoint(path)?;
    optimizer.load_state(&tensors)?;

    let epoch = tensors
        .get("meta::epoch")
        .ok_or_else(|| anyhow::anyhow!("checkpoint has no epoch index"))?
        .to_vec1::<u32>()?[0] as usize;

    let trace = TrainingTrace {
        train_loss: tensors
            .get("loss::train")
            .ok_or_else(|| anyhow::anyhow!("checkpoint has no training loss history"))?
            .to_vec1::<f32>()?,
        validation_loss: tensors
            .get("loss::validation")
            .ok_or_else(|| anyhow::anyhow!("checkpoint has no validation loss history"))?
            .to_vec1::<f32>()?,
    };

    Ok((epoch + 1, trace))
}
