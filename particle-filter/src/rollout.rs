//! Driving the filter over whole trajectories.
//!
//! A rollout seeds the initial particle set, steps the filter through a
//! control and observation sequence, and collects the per-step point
//! estimates alongside the true states for evaluation.

use burn::tensor::{backend::Backend, Distribution, Tensor};
use rand::Rng;

use crate::dynamics::{linear_noise, reproject_angles, DynamicsModel};
use crate::error::{check_dim, FilterError};
use crate::filter::{ParticleFilter, StepOptions};
use crate::measurement::MeasurementModel;
use crate::state::{Belief, ObservationSeq};

/// How the initial particle set is seeded.
#[derive(Debug, Clone)]
pub enum ParticleInit {
    /// Particles scattered around the known initial state. The standard
    /// tracking setup.
    TrueState { noise_std: f64 },
    /// Particles spread uniformly over per-dimension ranges, ignoring
    /// the initial state. Tests whether the filter can localize from
    /// scratch.
    UninformedSpread { lows: Vec<f64>, highs: Vec<f64> },
}

impl ParticleInit {
    /// Draws the initial particle set, `[n, particle_count, d]`, from
    /// the true initial states `[n, d]`.
    pub fn seed<B: Backend>(
        &self,
        initial_states: Tensor<B, 2>,
        particle_count: usize,
        linear_dims: usize,
    ) -> Result<Tensor<B, 3>, FilterError> {
        let [n, d] = initial_states.dims();
        let device = initial_states.device();
        match self {
            ParticleInit::TrueState { noise_std } => {
                let particles = initial_states
                    .unsqueeze_dim::<3>(1)
                    .repeat(1, particle_count);
                let noise = linear_noise(
                    [n, particle_count, d],
                    linear_dims,
                    *noise_std,
                    &device,
                );
                reproject_angles(particles + noise, linear_dims)
            }
            ParticleInit::UninformedSpread { lows, highs } => {
                check_dim("uninformed spread lows", d, lows.len())?;
                check_dim("uninformed spread highs", d, highs.len())?;
                let columns: Vec<Tensor<B, 3>> = lows
                    .iter()
                    .zip(highs)
                    .map(|(low, high)| {
                        Tensor::random(
                            [n, particle_count, 1],
                            Distribution::Uniform(*low, *high),
                            &device,
                        )
                    })
                    .collect();
                reproject_angles(Tensor::cat(columns, 2), linear_dims)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RolloutConfig {
    pub particle_count: usize,
    /// Leading unconstrained state entries; the rest are `(cos, sin)`
    /// pairs.
    pub linear_dims: usize,
    pub init: ParticleInit,
    pub step: StepOptions,
    /// Timesteps at which the observation is withheld from the filter,
    /// simulating sensor blackout.
    pub blackout: Vec<usize>,
}

/// Estimates and ground truth for timesteps `1..t`, both `[n, t - 1, d]`.
/// Step zero seeds the belief and is not predicted.
#[derive(Debug, Clone)]
pub struct Rollout<B: Backend> {
    pub predicted: Tensor<B, 3>,
    pub actual: Tensor<B, 3>,
}

impl<B: Backend> Rollout<B> {
    /// Root-mean-square estimation error per state dimension, pooled
    /// over trajectories and timesteps.
    pub fn rmse_per_dim(&self) -> Vec<f32> {
        let diff = self.predicted.clone() - self.actual.clone();
        (diff.clone() * diff)
            .mean_dim(0)
            .mean_dim(1)
            .sqrt()
            .into_data()
            .convert::<f32>()
            .value
    }
}

/// Runs the filter over full trajectories.
///
/// `true_states` is `[n, t, d]`, `controls` is `[n, t, c]` and the
/// observation sequence must cover the same `t` timesteps. The belief is
/// seeded from the states at step zero per `config.init`, then the
/// filter steps through `1..t`.
pub fn rollout<B, D, M, R>(
    filter: &ParticleFilter<D, M>,
    config: &RolloutConfig,
    true_states: Tensor<B, 3>,
    controls: Tensor<B, 3>,
    observations: &ObservationSeq<B>,
    rng: &mut R,
) -> Result<Rollout<B>, FilterError>
where
    B: Backend,
    D: DynamicsModel<B>,
    M: MeasurementModel<B>,
    R: Rng,
{
    let [n, t, d] = true_states.dims();
    let [cn, ct, c] = controls.dims();
    check_dim("rollout control batch", n, cn)?;
    check_dim("rollout control steps", t, ct)?;
    check_dim("rollout observation steps", t, observations.len())?;
    if t < 2 {
        return Err(FilterError::InvalidConfig {
            context: "a rollout needs at least two timesteps",
        });
    }

    let initial = true_states
        .clone()
        .slice([0..n, 0..1, 0..d])
        .squeeze::<2>(1);
    let particles = config
        .init
        .seed(initial, config.particle_count, config.linear_dims)?;
    let mut belief = Belief::uniform(particles);

    let mut estimates = Vec::with_capacity(t - 1);
    for step in 1..t {
        let step_controls = controls
            .clone()
            .slice([0..n, step..step + 1, 0..c])
            .squeeze::<2>(1);
        let observation = if config.blackout.contains(&step) {
            None
        } else {
            Some(observations.at(step))
        };
        let out = filter.step(
            belief,
            step_controls,
            observation.as_ref(),
            config.step,
            rng,
        )?;
        belief = out.belief;
        estimates.push(out.estimate.unsqueeze_dim::<3>(1));
    }

    Ok(Rollout {
        predicted: Tensor::cat(estimates, 1),
        actual: true_states.slice([0..n, 1..t, 0..d]),
    })
}
