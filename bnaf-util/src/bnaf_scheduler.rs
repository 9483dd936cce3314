#![allow(dead_code)]

use crate::bnaf_optimizer::PolyakAdam;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlateauConfig {
    /// multiplicative learning-rate decay on plateau
    pub factor: f64,
    /// epochs without improvement tolerated before a reduction
    pub patience: usize,
    /// absolute improvement required to reset the plateau counters
    pub threshold: f32,
    /// learning-rate floor
    pub min_lr: f64,
    /// number of reductions since the last improvement that triggers a stop
    /// (0 disables early stopping)
    pub early_stopping: usize,
}

impl Default for PlateauConfig {
    fn default() -> Self {
        Self {
            factor: 0.5,
            patience: 10,
            threshold: 1e-4,
            min_lr: 1e-6,
            early_stopping: 3,
        }
    }
}

/// Validation-loss driven scheduler: reduces the learning rate after a
/// plateau and signals early stopping after repeated reductions without
/// improvement.
pub struct ReduceLROnPlateau {
    config: PlateauConfig,
    best: f32,
    num_bad_epochs: usize,
    num_reductions: usize,
    last_lr: f64,
}

impl ReduceLROnPlateau {
    pub fn new(config: PlateauConfig, initial_lr: f64) -> Self {
        Self {
            config,
            best: f32::INFINITY,
            num_bad_epochs: 0,
            num_reductions: 0,
            last_lr: initial_lr,
        }
    }

    /// Feed one validation loss; returns `true` when training should stop.
    /// A NaN loss never counts as an improvement.
    pub fn step(&mut self, validation_loss: f32, optimizer: &mut PolyakAdam) -> bool {
        if validation_loss < self.best - self.config.threshold {
            self.best = validation_loss;
            self.num_bad_epochs = 0;
            self.num_reductions = 0;
            return false;
        }

        self.num_bad_epochs += 1;
        if self.num_bad_epochs > self.config.patience {
            self.num_bad_epochs = 0;
            self.num_reductions += 1;
            let lr = (self.last_lr * self.config.factor).max(self.config.min_lr);
            self.last_lr = lr;
            optimizer.set_learning_rate(lr);
        }

        self.config.early_stopping > 0 && self.num_reductions >= self.config.early_stopping
    }

    pub fn get_last_lr(&self) -> Vec<f64> {
        vec![self.last_lr]
    }

    pub fn best(&self) -> f32 {
        self.best
    }
}
