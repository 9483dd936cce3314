pub mod bnaf_checkpoint;
pub mod bnaf_data_loader;
pub mod bnaf_density_ratio;
pub mod bnaf_flow;
pub mod bnaf_masked_linear;
pub mod bnaf_model;
pub mod bnaf_optimizer;
pub mod bnaf_scheduler;
pub mod bnaf_train;

pub use candle_core;
pub use candle_nn;
