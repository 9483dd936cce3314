use bnaf_util::bnaf_data_loader::InMemoryData;
use bnaf_util::bnaf_density_ratio::{predict, DEFAULT_RATIO_EPS};
use bnaf_util::bnaf_flow::PermutationKind;
use bnaf_util::bnaf_model::{load_models, DensityModel, ModelParam, ResidualKind};
use bnaf_util::bnaf_optimizer::{ParamsPolyakAdam, PolyakAdam};
use bnaf_util::bnaf_scheduler::{PlateauConfig, ReduceLROnPlateau};
use bnaf_util::bnaf_train::{train, CheckpointConfig, TrainConfig, TrainingTrace};

use candle_core::{Device, Tensor};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

fn gaussian_sample(n: usize, mean: f32, seed: u64) -> Array2<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(mean, 1.0f32).unwrap();
    Array2::from_shape_fn((n, 2), |_| normal.sample(&mut rng))
}

fn toy_param(seed: u64) -> ModelParam {
    ModelParam {
        n_dims: 2,
        hidden_dim: 4,
        layers: 1,
        flows: 2,
        residual: ResidualKind::Gated,
        perm: PermutationKind::Random,
        seed,
    }
}

fn fit(
    model: &DensityModel,
    data: &Array2<f32>,
    num_epochs: usize,
    checkpoint: Option<&CheckpointConfig>,
) -> anyhow::Result<TrainingTrace> {
    let mut optimizer = PolyakAdam::new(
        model.named_vars(),
        ParamsPolyakAdam {
            lr: 1e-2,
            polyak: 0.5,
            ..Default::default()
        },
    )?;
    let mut scheduler = ReduceLROnPlateau::new(PlateauConfig::default(), 1e-2);

    let mut train_data = InMemoryData::new(data)?;
    let mut validation_data = InMemoryData::new(data)?;

    let config = TrainConfig {
        batch_size: 100,
        eval_batch_size: 250,
        start_epoch: 0,
        num_epochs,
        clip_norm: 10.0,
        eval_every: 1,
        device: Device::Cpu,
        show_progress: false,
        verbose: false,
    };

    train(
        model,
        &mut optimizer,
        &mut scheduler,
        &mut train_data,
        &mut validation_data,
        &config,
        checkpoint,
    )
}

#[test]
fn likelihood_improves_on_gaussian_data() -> anyhow::Result<()> {
    let _ = env_logger::try_init();
    let dev = Device::Cpu;
    let data = gaussian_sample(500, 0.0, 42);

    let model = DensityModel::new(&toy_param(7), &dev)?;
    let trace = fit(&model, &data, 8, None)?;

    assert_eq!(trace.train_loss.len(), trace.validation_loss.len());
    assert!(trace.train_loss.iter().all(|l| l.is_finite()));
    assert!(trace.validation_loss.iter().all(|l| l.is_finite()));
    assert!(
        trace.train_loss.last().unwrap() < trace.train_loss.first().unwrap(),
        "training loss did not improve: {:?}",
        trace.train_loss
    );
    assert!(
        trace.validation_loss[2] < trace.validation_loss[0],
        "validation loss did not improve: {:?}",
        trace.validation_loss
    );

    // the fitted density concentrates near the data, not five sigmas away
    let center = Tensor::from_vec(vec![0.0f32, 0.0], (1, 2), &dev)?;
    let tail = Tensor::from_vec(vec![5.0f32, 5.0], (1, 2), &dev)?;
    let p_center = model.pdf(&center)?[0];
    let p_tail = model.pdf(&tail)?[0];
    assert!(
        p_center > p_tail,
        "pdf(center) = {} vs pdf(tail) = {}",
        p_center,
        p_tail
    );
    Ok(())
}

#[test]
fn trained_pair_round_trips_through_checkpoints() -> anyhow::Result<()> {
    let _ = env_logger::try_init();
    let dev = Device::Cpu;
    let dir = tempfile::tempdir()?;
    let param = toy_param(13);
    let num_epochs = 4;
    let last_epoch = num_epochs - 1;

    // background drawn around -1, signal around +1
    let names = ["bgk".to_string(), "sgn".to_string()];
    let mut fitted = Vec::new();
    for (name, mean) in names.iter().zip([-1.0f32, 1.0]) {
        let model = DensityModel::new(&param, &dev)?;
        let data = gaussian_sample(300, mean, 99);
        let ck = CheckpointConfig {
            directory: dir.path().to_path_buf(),
            save_name: name.clone(),
        };
        fit(&model, &data, num_epochs, Some(&ck))?;
        fitted.push(model);
    }

    let loaded = load_models(&param, &names, dir.path(), last_epoch, &dev)?;

    // the final snapshot reproduces the in-memory model exactly
    let x = Tensor::from_vec(vec![0.5f32, -0.2, -1.0, 1.3], (2, 2), &dev)?;
    for (m, l) in fitted.iter().zip(loaded.iter()) {
        assert_eq!(m.pdf(&x)?, l.pdf(&x)?);
    }

    let posterior = predict(&x, &loaded, true, DEFAULT_RATIO_EPS)?;
    for p in posterior {
        assert!((0.0..=1.0).contains(&p), "posterior {} out of [0,1]", p);
    }
    Ok(())
}
