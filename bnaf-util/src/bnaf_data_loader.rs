#![allow(dead_code)]

use candle_core::{Device, Tensor};
use nalgebra::DMatrix;
use ndarray::Array2;
use rand::seq::SliceRandom;
use rayon::prelude::*;

/// One minibatch: feature vectors and their event weights
pub struct WeightedBatch {
    pub input: Tensor,  // (batch x n_dims)
    pub weight: Tensor, // (batch)
}

/// `DataLoader` for weighted minibatch learning
pub trait DataLoader {
    fn minibatch_data(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<WeightedBatch>;

    fn num_minibatch(&self) -> usize;

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()>;
}

///
/// In-memory loader over a 2d matrix. Each row is one feature vector with an
/// associated non-negative event weight (unit weights when none are given).
/// Batches are sampled batch-wise: index chunks are drawn first, then whole
/// row blocks are concatenated and preloaded.
///
pub struct InMemoryData {
    input_data: Vec<Tensor>,
    weight_data: Vec<Tensor>,

    shuffled_input_data: Option<Vec<Tensor>>,
    shuffled_weight_data: Option<Vec<Tensor>>,

    minibatches: Minibatches,
}

impl InMemoryData {
    /// Loader with unit weights
    pub fn new<D>(data: &D) -> anyhow::Result<Self>
    where
        D: RowsToTensorVec,
    {
        let input = data.rows_to_tensor_vec();
        let ones = vec![1.0_f32; input.len()];
        Self::build(input, &ones)
    }

    /// Loader with per-row event weights
    pub fn new_with_weights<D>(data: &D, weights: &[f32]) -> anyhow::Result<Self>
    where
        D: RowsToTensorVec,
    {
        let input = data.rows_to_tensor_vec();
        anyhow::ensure!(
            input.len() == weights.len(),
            "{} rows vs. {} weights",
            input.len(),
            weights.len()
        );
        anyhow::ensure!(
            weights.iter().all(|w| w.is_finite() && *w >= 0.0),
            "event weights must be finite and non-negative"
        );
        Self::build(input, weights)
    }

    fn build(input_data: Vec<Tensor>, weights: &[f32]) -> anyhow::Result<Self> {
        let weight_data = weights
            .iter()
            .map(|&w| Tensor::from_vec(vec![w], 1, &Device::Cpu))
            .collect::<candle_core::Result<Vec<_>>>()?;

        let rows = (0..input_data.len()).collect();

        Ok(InMemoryData {
            input_data,
            weight_data,
            shuffled_input_data: None,
            shuffled_weight_data: None,
            minibatches: Minibatches {
                samples: rows,
                chunks: vec![],
            },
        })
    }

    pub fn num_rows(&self) -> usize {
        self.input_data.len()
    }
}

impl DataLoader for InMemoryData {
    fn minibatch_data(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<WeightedBatch> {
        match (&self.shuffled_input_data, &self.shuffled_weight_data) {
            (Some(input), Some(weight)) => {
                anyhow::ensure!(
                    batch_idx < input.len(),
                    "invalid index = {} vs. total # = {}",
                    batch_idx,
                    input.len()
                );
                Ok(WeightedBatch {
                    input: input[batch_idx].to_device(target_device)?,
                    weight: weight[batch_idx].to_device(target_device)?,
                })
            }
            _ => Err(anyhow::anyhow!("need to shuffle data")),
        }
    }

    fn num_minibatch(&self) -> usize {
        self.minibatches.chunks.len()
    }

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()> {
        anyhow::ensure!(batch_size > 0, "batch size must be positive");
        anyhow::ensure!(!self.input_data.is_empty(), "empty data set");

        self.minibatches.shuffle_minibatch(batch_size);

        // preload all the shuffled chunks
        let preloaded = self
            .minibatches
            .chunks
            .par_iter()
            .map(|samples| {
                let rows: Vec<Tensor> = samples.iter().map(|&i| self.input_data[i].clone()).collect();
                let weights: Vec<Tensor> =
                    samples.iter().map(|&i| self.weight_data[i].clone()).collect();
                let x = Tensor::cat(&rows, 0)?;
                let w = Tensor::cat(&weights, 0)?;
                Ok((x, w))
            })
            .collect::<candle_core::Result<Vec<_>>>()?;

        let (input, weight) = preloaded.into_iter().unzip();
        self.shuffled_input_data = Some(input);
        self.shuffled_weight_data = Some(weight);

        Ok(())
    }
}

///
/// A helper `struct` for shuffling and creating minibatch indexes; after
/// `shuffle_minibatch` is called, `chunks` partition the row indexes
/// (the last chunk may be short).
///
pub struct Minibatches {
    samples: Vec<usize>,
    pub chunks: Vec<Vec<usize>>,
}

impl Minibatches {
    pub fn shuffle_minibatch(&mut self, batch_size: usize) {
        let mut rng = rand::rng();
        self.samples.shuffle(&mut rng);
        self.chunks = self
            .samples
            .chunks(batch_size)
            .map(|chunk| chunk.to_vec())
            .collect();
    }

    pub fn size(&self) -> usize {
        self.samples.len()
    }
}

///
/// Convert rows of a matrix to a vector of `(1 x d)` tensors
///
pub trait RowsToTensorVec {
    fn rows_to_tensor_vec(&self) -> Vec<Tensor>;
}

impl RowsToTensorVec for Array2<f32> {
    fn rows_to_tensor_vec(&self) -> Vec<Tensor> {
        self.axis_iter(ndarray::Axis(0))
            .map(|row| {
                Tensor::from_iter(row.iter().copied(), &Device::Cpu)
                    .and_then(|v| v.reshape((1, row.len())))
                    .expect("failed to create row tensor")
            })
            .collect()
    }
}

impl RowsToTensorVec for DMatrix<f32> {
    fn rows_to_tensor_vec(&self) -> Vec<Tensor> {
        self.row_iter()
            .map(|row| {
                Tensor::from_iter(row.iter().copied(), &Device::Cpu)
                    .and_then(|v| v.reshape((1, row.len())))
                    .expect("failed to create row tensor")
            })
            .collect()
    }
}

impl RowsToTensorVec for Tensor {
    fn rows_to_tensor_vec(&self) -> Vec<Tensor> {
        (0..self.dims()[0])
            .map(|i| self.narrow(0, i, 1).expect("failed to take row"))
            .collect()
    }
}
