#![allow(dead_code)]

use crate::bnaf_checkpoint::{checkpoint_path, save_checkpoint};
use crate::bnaf_data_loader::DataLoader;
use crate::bnaf_model::DensityModel;
use crate::bnaf_optimizer::PolyakAdam;
use crate::bnaf_scheduler::ReduceLROnPlateau;

use candle_core::{Device, Result, Tensor};
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::info;
use std::path::PathBuf;

pub struct TrainConfig {
    pub batch_size: usize,
    pub eval_batch_size: usize,
    pub start_epoch: usize,
    pub num_epochs: usize,
    /// maximum global gradient norm
    pub clip_norm: f64,
    /// validate every this many epochs (the first epoch always validates)
    pub eval_every: usize,
    pub device: Device,
    pub show_progress: bool,
    pub verbose: bool,
}

/// Where to persist the per-epoch snapshots (`{save_name}_{epoch}`)
pub struct CheckpointConfig {
    pub directory: PathBuf,
    pub save_name: String,
}

#[derive(Clone, Debug, Default)]
pub struct TrainingTrace {
    pub train_loss: Vec<f32>,
    pub validation_loss: Vec<f32>,
}

/// Weighted negative log-likelihood of one minibatch. The weights are
/// renormalized to sum to one, so
/// `loss = -sum_i w_i log p(x_i) / sum_i w_i`
/// (a weighted product of likelihoods turns into a weighted sum of logs).
pub fn weighted_nll(model: &DensityModel, x_nd: &Tensor, weight_n: &Tensor) -> Result<Tensor> {
    let weight_n = weight_n.broadcast_div(&weight_n.sum_all()?)?;
    let log_p_n = model.log_prob(x_nd)?;
    log_p_n.mul(&weight_n)?.sum_all()?.neg()
}

/// Train a density model by weighted maximum likelihood.
///
/// Each epoch runs TRAIN (minibatch updates with gradient clipping), swaps in
/// the averaged parameter view for the optional VALIDATE phase, swaps back,
/// writes a CHECKPOINT, and feeds the scheduler, which may stop the run
/// early. Skipped validation epochs re-log the last computed validation
/// loss. Per-batch numeric failures are not caught; they abort the run.
pub fn train<D>(
    model: &DensityModel,
    optimizer: &mut PolyakAdam,
    scheduler: &mut ReduceLROnPlateau,
    train_data: &mut D,
    validation_data: &mut D,
    config: &TrainConfig,
    checkpoint: Option<&CheckpointConfig>,
) -> anyhow::Result<TrainingTrace>
where
    D: DataLoader,
{
    anyhow::ensure!(config.eval_every > 0, "eval_every must be positive");
    let device = &config.device;

    let pb = ProgressBar::new(config.num_epochs as u64);
    if !config.show_progress || config.verbose {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    }

    let mut trace = TrainingTrace::default();
    let mut last_validation = f32::NAN;

    let end_epoch = config.start_epoch + config.num_epochs;
    for epoch in config.start_epoch..end_epoch {
        train_data.shuffle_minibatch(config.batch_size)?;

        let mut epoch_loss = 0f32;
        let num_batches = train_data.num_minibatch();
        for b in 0..num_batches {
            let batch = train_data.minibatch_data(b, device)?;
            let loss = weighted_nll(model, &batch.input, &batch.weight)?;
            let grads = loss.backward()?;
            optimizer.step_clipped(&grads, Some(config.clip_norm))?;
            epoch_loss += loss.to_scalar::<f32>()?;
        }
        let train_loss = epoch_loss / num_batches.max(1) as f32;

        // evaluate under the averaged trajectory, train under the raw one
        optimizer.swap()?;

        if epoch == config.start_epoch || epoch % config.eval_every == 0 {
            validation_data.shuffle_minibatch(config.eval_batch_size)?;
            let mut validation_loss = 0f32;
            let num_batches = validation_data.num_minibatch();
            for b in 0..num_batches {
                let batch = validation_data.minibatch_data(b, device)?;
                let loss = weighted_nll(model, &batch.input.detach(), &batch.weight.detach())?;
                validation_loss += loss.to_scalar::<f32>()?;
            }
            last_validation = validation_loss / num_batches.max(1) as f32;
        }

        optimizer.swap()?;

        trace.train_loss.push(train_loss);
        trace.validation_loss.push(last_validation);

        if let Some(ck) = checkpoint {
            let path = checkpoint_path(&ck.directory, &ck.save_name, epoch);
            save_checkpoint(model, optimizer, epoch, &trace, &path)?;
        }

        let stop = scheduler.step(last_validation, optimizer);

        if config.verbose {
            info!(
                "epoch {:3}/{:3} | train: {:.4} | validation: {:.4} | lr: {:.3e}",
                epoch,
                end_epoch,
                train_loss,
                last_validation,
                scheduler.get_last_lr()[0]
            );
        }
        pb.inc(1);

        if stop {
            info!("early stopping at epoch {}", epoch);
            break;
        }
    }

    pb.finish_and_clear();
    Ok(trace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bnaf_data_loader::InMemoryData;
    use crate::bnaf_flow::PermutationKind;
    use crate::bnaf_model::{ModelParam, ResidualKind};
    use crate::bnaf_optimizer::{ParamsPolyakAdam, ParameterView};
    use crate::bnaf_scheduler::{PlateauConfig, ReduceLROnPlateau};
    use approx::assert_abs_diff_eq;
    use candle_core::Device;
    use ndarray::Array2;

    #[test]
    fn batch_weights_are_renormalized() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let param = ModelParam {
            n_dims: 2,
            hidden_dim: 2,
            layers: 0,
            flows: 1,
            residual: ResidualKind::None,
            perm: PermutationKind::Flip,
            seed: 0,
        };
        let model = DensityModel::new(&param, &dev)?;

        let x = Tensor::from_vec(vec![0.1f32, 0.2, -0.3, 0.4], (2, 2), &dev)?;
        let w1 = Tensor::from_vec(vec![1.0f32, 3.0], 2, &dev)?;
        let w2 = Tensor::from_vec(vec![10.0f32, 30.0], 2, &dev)?;

        // loss is scale-invariant in the weights
        let a = weighted_nll(&model, &x, &w1)?.to_scalar::<f32>()?;
        let b = weighted_nll(&model, &x, &w2)?.to_scalar::<f32>()?;
        assert_abs_diff_eq!(a, b, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn training_leaves_the_raw_view_live() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let param = ModelParam {
            n_dims: 2,
            hidden_dim: 2,
            layers: 0,
            flows: 1,
            residual: ResidualKind::None,
            perm: PermutationKind::Flip,
            seed: 1,
        };
        let model = DensityModel::new(&param, &dev)?;
        let mut optimizer = PolyakAdam::new(model.named_vars(), ParamsPolyakAdam::default())?;
        let mut scheduler = ReduceLROnPlateau::new(PlateauConfig::default(), 1e-3);

        let data = Array2::from_shape_fn((32, 2), |(i, j)| ((i + j) as f32).sin());
        let mut train_data = InMemoryData::new(&data)?;
        let mut validation_data = InMemoryData::new(&data)?;

        let config = TrainConfig {
            batch_size: 16,
            eval_batch_size: 16,
            start_epoch: 0,
            num_epochs: 2,
            clip_norm: 5.0,
            eval_every: 2, // epoch 1 skips validation
            device: dev,
            show_progress: false,
            verbose: false,
        };

        let trace = train(
            &model,
            &mut optimizer,
            &mut scheduler,
            &mut train_data,
            &mut validation_data,
            &config,
            None,
        )?;

        assert_eq!(optimizer.active_view(), ParameterView::Raw);
        assert_eq!(trace.train_loss.len(), 2);
        assert_eq!(trace.validation_loss.len(), 2);
        // the skipped epoch re-logs the last computed validation loss
        assert_eq!(trace.validation_loss[0], trace.validation_loss[1]);
        Ok(())
    }
}
