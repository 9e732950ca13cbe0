//! Training and evaluation entry points.
//!
//! The dynamics and measurement models are first trained in isolation
//! on supervised single-step objectives, then refined end-to-end by
//! backpropagating a trajectory loss through the full filtering
//! recursion with soft resampling.

use std::path::PathBuf;

use anyhow::Context;
use burn::config::Config;
use burn::data::dataloader::{DataLoader, DataLoaderBuilder};
use burn::data::dataset::SqliteDataset;
use burn::module::Module;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::record::{CompactRecorder, Recorder};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{Distribution, ElementConversion, Tensor};
use particle_filter::dynamics::reproject_angles;
use particle_filter::filter::FilterModelRecord;
use particle_filter::{
    gmm_loss, mse_loss, Belief, DynamicsModel, FilterError, FilterModel, FilterModelConfig,
    MeasurementModel, Observation, ObservationSeq, ParticleInit, ResampleMode, RolloutConfig,
    StepOptions,
};
use rand::rngs::SmallRng;
use rand::SeedableRng;

use crate::dataset::{PushBatch, PushBatcher};
use crate::{CONTROL_DIM, LINEAR_DIMS};

/// Perturbed states scored per true state when pretraining the
/// measurement model.
const MEASUREMENT_SAMPLES: usize = 8;

#[derive(Config)]
pub struct ExperimentConfig {
    pub model: FilterModelConfig,
    pub optimizer: AdamConfig,
    #[config(default = 8)]
    pub num_epochs: usize,
    #[config(default = 16)]
    pub batch_size: usize,
    #[config(default = 4)]
    pub num_workers: usize,
    #[config(default = 1342)]
    pub seed: u64,
    #[config(default = 1.0e-3)]
    pub learning_rate: f64,
    #[config(default = 30)]
    pub particle_count: usize,
    #[config(default = 0.2)]
    pub init_noise_std: f64,
    #[config(default = 0.1)]
    pub gmm_variance: f64,
    #[config(default = 0.9)]
    pub soft_resample_alpha: f64,
}

/// Trajectory objective for end-to-end training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LossKind {
    /// Negative log-likelihood of the truth under the particle mixture.
    Gmm,
    /// Squared error of the point estimate.
    Mse,
}

#[derive(Debug, Clone)]
pub struct E2eOptions {
    pub loss: LossKind,
    /// Detach the belief every this many steps (truncated
    /// backpropagation through time), or carry gradients across the
    /// whole trajectory.
    pub truncate: Option<usize>,
    /// Timesteps whose observation is withheld during training.
    pub blackout: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct EvalOptions {
    pub particle_count: usize,
    /// Spread the initial particles over the whole workspace instead of
    /// around the true initial state.
    pub uninformed_init: bool,
    pub blackout: Vec<usize>,
}

fn prepare(artifact_dir: &str, config: &ExperimentConfig) -> anyhow::Result<()> {
    std::fs::create_dir_all(artifact_dir)
        .with_context(|| format!("creating {artifact_dir}"))?;
    config
        .save(format!("{artifact_dir}/config.json"))
        .context("saving experiment config")?;
    Ok(())
}

fn load_or_init<B: Backend>(
    artifact_dir: &str,
    config: &FilterModelConfig,
    device: &B::Device,
) -> FilterModel<B> {
    let model = config.init::<B>(device);
    if PathBuf::from(format!("{artifact_dir}/model.mpk")).exists() {
        let loaded: Result<FilterModelRecord<B>, _> =
            CompactRecorder::new().load(format!("{artifact_dir}/model").into(), device);
        match loaded {
            Ok(record) => {
                log::info!("restored model checkpoint from {artifact_dir}");
                return model.load_record(record);
            }
            Err(e) => log::warn!("ignoring unreadable checkpoint in {artifact_dir}: {e}"),
        }
    }
    model
}

fn save<B: Backend>(artifact_dir: &str, model: FilterModel<B>) -> anyhow::Result<()> {
    model
        .save_file(format!("{artifact_dir}/model"), &CompactRecorder::new())
        .context("saving model checkpoint")?;
    Ok(())
}

fn dataloader<B: Backend>(
    config: &ExperimentConfig,
    device: &B::Device,
    split: &str,
) -> anyhow::Result<std::sync::Arc<dyn DataLoader<PushBatch<B>>>> {
    Ok(DataLoaderBuilder::new(PushBatcher::<B>::new(device.clone()))
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .num_workers(config.num_workers)
        .build(
            SqliteDataset::from_db_file("data.sqlite", split)
                .context("data.sqlite should be readable; run the gen command first")?,
        ))
}

/// Supervised pretraining of the dynamics model: predict the next true
/// state from the previous one and the control input.
pub fn train_dynamics<B: AutodiffBackend>(
    artifact_dir: &str,
    config: ExperimentConfig,
    device: B::Device,
) -> anyhow::Result<()> {
    prepare(artifact_dir, &config)?;
    B::seed(config.seed);

    let loader = dataloader::<B>(&config, &device, "train")?;
    let mut model = load_or_init::<B>(artifact_dir, &config.model, &device);
    let mut optim = config.optimizer.init();

    for epoch in 1..=config.num_epochs {
        let mut total = 0.0f32;
        let mut batches = 0usize;
        for batch in loader.iter() {
            let [n, t, d] = batch.states.dims();
            let prev = batch
                .states
                .clone()
                .slice([0..n, 0..t - 1, 0..d])
                .reshape([n * (t - 1), 1, d]);
            let next = batch
                .states
                .clone()
                .slice([0..n, 1..t, 0..d])
                .reshape([n * (t - 1), d]);
            let controls = batch
                .controls
                .slice([0..n, 1..t, 0..CONTROL_DIM])
                .reshape([n * (t - 1), CONTROL_DIM]);

            let predicted = model.dynamics.propagate(prev, controls, false)?;
            let loss = mse_loss(predicted.squeeze::<2>(1), next);

            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optim.step(config.learning_rate, model, grads);

            total += loss.into_scalar().elem::<f32>();
            batches += 1;
        }
        log::info!(
            "dynamics epoch {epoch}/{}: mse {:.6}",
            config.num_epochs,
            total / batches.max(1) as f32
        );
    }

    save(artifact_dir, model)
}

/// Rolls the dynamics model alone through a control sequence from the
/// true initial state, `[n, t, d] -> [n, t - 1, d]` predictions for
/// timesteps `1..t`. One particle per trajectory, deterministic.
fn recurrent_prediction<B: Backend, D: DynamicsModel<B>>(
    dynamics: &D,
    states: Tensor<B, 3>,
    controls: Tensor<B, 3>,
) -> Result<Tensor<B, 3>, FilterError> {
    let [n, t, d] = states.dims();
    let c = controls.dims()[2];
    if t < 2 {
        return Err(FilterError::InvalidConfig {
            context: "recurrent dynamics training needs at least two timesteps",
        });
    }

    let mut current = states.slice([0..n, 0..1, 0..d]);
    let mut predicted = Vec::with_capacity(t - 1);
    for step in 1..t {
        let step_controls = controls
            .clone()
            .slice([0..n, step..step + 1, 0..c])
            .squeeze::<2>(1);
        current = dynamics.propagate(current, step_controls, false)?;
        predicted.push(current.clone());
    }
    Ok(Tensor::cat(predicted, 1))
}

/// Recurrent pretraining of the dynamics model: predictions are rolled
/// out over the whole sequence without measurement corrections, so
/// single-step errors that compound over time are penalized too.
pub fn train_dynamics_recurrent<B: AutodiffBackend>(
    artifact_dir: &str,
    config: ExperimentConfig,
    device: B::Device,
) -> anyhow::Result<()> {
    prepare(artifact_dir, &config)?;
    B::seed(config.seed);

    let loader = dataloader::<B>(&config, &device, "train")?;
    let mut model = load_or_init::<B>(artifact_dir, &config.model, &device);
    let mut optim = config.optimizer.init();

    for epoch in 1..=config.num_epochs {
        let mut total = 0.0f32;
        let mut batches = 0usize;
        for batch in loader.iter() {
            let [n, t, d] = batch.states.dims();
            let predicted =
                recurrent_prediction(&model.dynamics, batch.states.clone(), batch.controls)?;
            let target = batch.states.slice([0..n, 1..t, 0..d]);
            let loss = mse_loss(
                predicted.reshape([n * (t - 1), d]),
                target.reshape([n * (t - 1), d]),
            );

            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optim.step(config.learning_rate, model, grads);

            total += loss.into_scalar().elem::<f32>();
            batches += 1;
        }
        log::info!(
            "recurrent dynamics epoch {epoch}/{}: mse {:.6}",
            config.num_epochs,
            total / batches.max(1) as f32
        );
    }

    save(artifact_dir, model)
}

/// Supervised pretraining of the measurement model: score perturbed
/// states against the observation, with a Gaussian in state space around
/// the truth as the target log-likelihood.
pub fn train_measurement<B: AutodiffBackend>(
    artifact_dir: &str,
    config: ExperimentConfig,
    device: B::Device,
) -> anyhow::Result<()> {
    prepare(artifact_dir, &config)?;
    B::seed(config.seed);

    let loader = dataloader::<B>(&config, &device, "train")?;
    let mut model = load_or_init::<B>(artifact_dir, &config.model, &device);
    let mut optim = config.optimizer.init();

    for epoch in 1..=config.num_epochs {
        let mut total = 0.0f32;
        let mut batches = 0usize;
        for batch in loader.iter() {
            let [n, t, d] = batch.states.dims();
            let states = batch.states.reshape([n * t, d]);
            let observation = flatten_observations(&batch.observations);

            let spread = states
                .clone()
                .unsqueeze_dim::<3>(1)
                .repeat(1, MEASUREMENT_SAMPLES);
            let noise = Tensor::random(
                spread.dims(),
                Distribution::Normal(0.0, config.init_noise_std),
                &device,
            );
            let particles = reproject_angles(spread + noise, LINEAR_DIMS)?;

            let diff = particles.clone() - states.unsqueeze_dim::<3>(1);
            let targets = (diff.clone() * diff)
                .sum_dim(2)
                .squeeze::<2>(2)
                .mul_scalar(-0.5 / config.gmm_variance)
                .detach();

            let scores = model.measurement.log_likelihood(particles, &observation)?;
            let loss = mse_loss(scores, targets);

            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optim.step(config.learning_rate, model, grads);

            total += loss.into_scalar().elem::<f32>();
            batches += 1;
        }
        log::info!(
            "measurement epoch {epoch}/{}: mse {:.6}",
            config.num_epochs,
            total / batches.max(1) as f32
        );
    }

    save(artifact_dir, model)
}

/// End-to-end refinement: run the filter over whole trajectories with
/// soft resampling and backpropagate the trajectory loss through every
/// stage.
pub fn train_e2e<B: AutodiffBackend>(
    artifact_dir: &str,
    config: ExperimentConfig,
    device: B::Device,
    options: E2eOptions,
) -> anyhow::Result<()> {
    prepare(artifact_dir, &config)?;
    B::seed(config.seed);

    let loader = dataloader::<B>(&config, &device, "train")?;
    let mut model = load_or_init::<B>(artifact_dir, &config.model, &device);
    let mut optim = config.optimizer.init();
    let mut rng = SmallRng::seed_from_u64(config.seed);

    let step_options = StepOptions {
        resample: Some(ResampleMode::Soft {
            alpha: config.soft_resample_alpha,
        }),
        noisy_dynamics: true,
    };
    let init = ParticleInit::TrueState {
        noise_std: config.init_noise_std,
    };

    for epoch in 1..=config.num_epochs {
        let mut total = 0.0f32;
        let mut batches = 0usize;
        for batch in loader.iter() {
            let [n, t, d] = batch.states.dims();
            let c = batch.controls.dims()[2];

            let loss = {
                let filter = model.particle_filter();
                let initial = batch
                    .states
                    .clone()
                    .slice([0..n, 0..1, 0..d])
                    .squeeze::<2>(1);
                let particles = init.seed(initial, config.particle_count, LINEAR_DIMS)?;
                let mut belief = Belief::uniform(particles);

                let mut loss_sum: Tensor<B, 1> = Tensor::zeros([1], &device);
                for step in 1..t {
                    let controls = batch
                        .controls
                        .clone()
                        .slice([0..n, step..step + 1, 0..c])
                        .squeeze::<2>(1);
                    let observation = if options.blackout.contains(&step) {
                        None
                    } else {
                        Some(batch.observations.at(step))
                    };
                    let out = filter.step(
                        belief,
                        controls,
                        observation.as_ref(),
                        step_options,
                        &mut rng,
                    )?;
                    belief = out.belief;

                    let truth = batch
                        .states
                        .clone()
                        .slice([0..n, step..step + 1, 0..d])
                        .squeeze::<2>(1);
                    loss_sum = loss_sum
                        + match options.loss {
                            LossKind::Gmm => {
                                gmm_loss(&belief, truth, &[config.gmm_variance])?
                            }
                            LossKind::Mse => mse_loss(out.estimate, truth),
                        };

                    if let Some(k) = options.truncate {
                        if step % k == 0 {
                            belief = belief.detach();
                        }
                    }
                }
                loss_sum.div_scalar((t - 1) as f32)
            };

            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optim.step(config.learning_rate, model, grads);

            total += loss.into_scalar().elem::<f32>();
            batches += 1;
        }
        log::info!(
            "e2e epoch {epoch}/{}: loss {:.6}",
            config.num_epochs,
            total / batches.max(1) as f32
        );
    }

    save(artifact_dir, model)
}

/// Rolls the trained filter over the test split and reports the
/// estimation error.
pub fn evaluate<B: Backend>(
    artifact_dir: &str,
    config: ExperimentConfig,
    device: B::Device,
    options: EvalOptions,
) -> anyhow::Result<()> {
    B::seed(config.seed);
    let loader = dataloader::<B>(&config, &device, "test")?;
    let model = load_or_init::<B>(artifact_dir, &config.model, &device);
    let filter = model.particle_filter();
    let mut rng = SmallRng::seed_from_u64(config.seed);

    let rollout_config = RolloutConfig {
        particle_count: options.particle_count,
        linear_dims: LINEAR_DIMS,
        init: if options.uninformed_init {
            ParticleInit::UninformedSpread {
                lows: vec![-1.0; 4],
                highs: vec![1.0; 4],
            }
        } else {
            ParticleInit::TrueState {
                noise_std: config.init_noise_std,
            }
        },
        step: StepOptions {
            resample: Some(ResampleMode::Multinomial),
            noisy_dynamics: true,
        },
        blackout: options.blackout,
    };

    let mut predicted = Vec::new();
    let mut actual = Vec::new();
    for batch in loader.iter() {
        let out = particle_filter::rollout(
            &filter,
            &rollout_config,
            batch.states,
            batch.controls,
            &batch.observations,
            &mut rng,
        )?;
        predicted.push(out.predicted);
        actual.push(out.actual);
    }

    let pooled = particle_filter::Rollout {
        predicted: Tensor::cat(predicted, 0),
        actual: Tensor::cat(actual, 0),
    };
    let rmse = pooled.rmse_per_dim();
    log::info!("rmse per state dimension: {rmse:?}");
    Ok(())
}

/// Folds the time axis into the batch axis, `[n, t, ...] -> [n * t, ...]`,
/// so every timestep is scored as its own sample.
fn flatten_observations<B: Backend>(observations: &ObservationSeq<B>) -> Observation<B> {
    let [n, t, h, w] = observations.images.dims();
    let pos_dim = observations.gripper_pos.dims()[2];
    let sensor_dim = observations.gripper_sensors.dims()[2];
    Observation {
        image: observations.images.clone().reshape([n * t, h, w]),
        gripper_pos: observations.gripper_pos.clone().reshape([n * t, pos_dim]),
        gripper_sensors: observations
            .gripper_sensors
            .clone()
            .reshape([n * t, sensor_dim]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use particle_filter::IdentityDynamics;

    type B = NdArray;

    #[test]
    fn recurrent_prediction_covers_every_step_after_the_first() {
        let device = Default::default();
        let states = Tensor::<B, 3>::random([2, 5, 4], Distribution::Default, &device);
        let controls = Tensor::<B, 3>::zeros([2, 5, 7], &device);
        let dynamics = IdentityDynamics {
            noise_std: 0.0,
            linear_dims: 4,
        };
        let predicted =
            recurrent_prediction(&dynamics, states.clone(), controls).unwrap();
        assert_eq!(predicted.dims(), [2, 4, 4]);

        // Identity dynamics can only ever repeat the initial state.
        let first: Vec<f32> = states
            .slice([0..2, 0..1, 0..4])
            .into_data()
            .convert::<f32>()
            .value;
        let values: Vec<f32> = predicted.into_data().convert::<f32>().value;
        for (i, v) in values.iter().enumerate() {
            let trajectory = i / 16;
            let dim = i % 4;
            assert_eq!(*v, first[trajectory * 4 + dim]);
        }
    }

    #[test]
    fn recurrent_prediction_needs_a_sequence() {
        let device = Default::default();
        let states = Tensor::<B, 3>::zeros([1, 1, 4], &device);
        let controls = Tensor::<B, 3>::zeros([1, 1, 7], &device);
        let dynamics = IdentityDynamics {
            noise_std: 0.0,
            linear_dims: 4,
        };
        let err = recurrent_prediction(&dynamics, states, controls).unwrap_err();
        assert!(matches!(err, FilterError::InvalidConfig { .. }));
    }
}
