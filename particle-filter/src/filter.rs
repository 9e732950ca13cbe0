//! The filtering recursion.
//!
//! One step is propagate, weight, normalize, estimate, resample, in that
//! order. The estimate is taken before resampling so that it reflects
//! the full weighted belief rather than the redrawn one.

use burn::config::Config;
use burn::module::Module;
use burn::tensor::{backend::Backend, Tensor};
use rand::Rng;

use crate::dynamics::{DynamicsModel, ResidualDynamics, ResidualDynamicsConfig};
use crate::error::{check_dim, FilterError};
use crate::measurement::{
    MeasurementModel, MultimodalMeasurement, MultimodalMeasurementConfig,
};
use crate::resample::{resample, ResampleMode};
use crate::state::{Belief, Observation};
use crate::weights;

/// Per-step behavior switches.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOptions {
    /// Redraw the particle set after the update, or `None` to let
    /// weights keep accumulating across steps.
    pub resample: Option<ResampleMode>,
    /// Inject process noise during propagation.
    pub noisy_dynamics: bool,
}

impl Default for StepOptions {
    fn default() -> Self {
        Self {
            resample: Some(ResampleMode::Multinomial),
            noisy_dynamics: true,
        }
    }
}

/// The belief after one step, plus the point estimate taken from the
/// pre-resampling weighted particle set.
#[derive(Debug, Clone)]
pub struct StepOutput<B: Backend> {
    pub belief: Belief<B>,
    /// Weighted particle mean, `[n, d]`.
    pub estimate: Tensor<B, 2>,
}

/// A particle filter over a dynamics model and a measurement model.
///
/// The models are type parameters rather than trait objects so that the
/// same filter code runs over learned `Module` models during training
/// (borrowed from the enclosing model, keeping gradients intact) and
/// over plain baselines during evaluation.
#[derive(Debug, Clone)]
pub struct ParticleFilter<D, M> {
    pub dynamics: D,
    pub measurement: M,
}

impl<D, M> ParticleFilter<D, M> {
    pub fn new(dynamics: D, measurement: M) -> Self {
        Self {
            dynamics,
            measurement,
        }
    }

    /// Advances the belief by one timestep.
    ///
    /// `observation` may be absent (sensor blackout); the update then
    /// consists of propagation only and the weights carry over. The
    /// trajectory count of `controls` and the observation must match the
    /// belief.
    pub fn step<B, R>(
        &self,
        belief: Belief<B>,
        controls: Tensor<B, 2>,
        observation: Option<&Observation<B>>,
        options: StepOptions,
        rng: &mut R,
    ) -> Result<StepOutput<B>, FilterError>
    where
        B: Backend,
        D: DynamicsModel<B>,
        M: MeasurementModel<B>,
        R: Rng,
    {
        let (n, _m, _d) = belief.dims();
        check_dim("step control batch", n, controls.dims()[0])?;

        let particles =
            self.dynamics
                .propagate(belief.particles, controls, options.noisy_dynamics)?;

        let log_weights = match observation {
            Some(observation) => {
                let log_likelihoods = self
                    .measurement
                    .log_likelihood(particles.clone(), observation)?;
                weights::normalize(belief.log_weights + log_likelihoods)
            }
            None => belief.log_weights,
        };

        let estimate = weighted_mean(particles.clone(), log_weights.clone());

        let (particles, log_weights) = match options.resample {
            Some(mode) => resample(mode, particles, log_weights, rng)?,
            None => (particles, log_weights),
        };

        Ok(StepOutput {
            belief: Belief {
                particles,
                log_weights,
            },
            estimate,
        })
    }
}

#[derive(Config, Debug)]
pub struct FilterModelConfig {
    pub dynamics: ResidualDynamicsConfig,
    pub measurement: MultimodalMeasurementConfig,
}

impl FilterModelConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> FilterModel<B> {
        FilterModel {
            dynamics: self.dynamics.init(device),
            measurement: self.measurement.init(device),
        }
    }
}

/// The learned dynamics and measurement models as one `Module`, so a
/// single optimizer step updates both during end-to-end training.
#[derive(Module, Debug)]
pub struct FilterModel<B: Backend> {
    pub dynamics: ResidualDynamics<B>,
    pub measurement: MultimodalMeasurement<B>,
}

impl<B: Backend> FilterModel<B> {
    /// Borrows both models into a runnable filter.
    pub fn particle_filter(
        &self,
    ) -> ParticleFilter<&ResidualDynamics<B>, &MultimodalMeasurement<B>> {
        ParticleFilter::new(&self.dynamics, &self.measurement)
    }
}

/// Weighted mean of the particle set, `[n, m, d] -> [n, d]`.
pub fn weighted_mean<B: Backend>(
    particles: Tensor<B, 3>,
    log_weights: Tensor<B, 2>,
) -> Tensor<B, 2> {
    (particles * log_weights.exp().unsqueeze_dim::<3>(2))
        .sum_dim(1)
        .squeeze::<2>(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dynamics::IdentityDynamics;
    use burn::backend::NdArray;
    use burn::tensor::{Data, Distribution, Shape};
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    type B = NdArray;

    /// Scores every particle with a fixed, particle-indexed log-likelihood.
    struct FixedScores(Vec<f32>);

    impl MeasurementModel<B> for FixedScores {
        fn log_likelihood(
            &self,
            particles: Tensor<B, 3>,
            _observation: &Observation<B>,
        ) -> Result<Tensor<B, 2>, FilterError> {
            let [n, m, _d] = particles.dims();
            Ok(Tensor::from_data(
                Data::new(self.0.clone(), Shape::new([n, m])).convert(),
                &Default::default(),
            ))
        }
    }

    fn observation(n: usize) -> Observation<B> {
        let device = Default::default();
        Observation {
            image: Tensor::zeros([n, 8, 8], &device),
            gripper_pos: Tensor::zeros([n, 3], &device),
            gripper_sensors: Tensor::zeros([n, 7], &device),
        }
    }

    #[test]
    fn blackout_step_leaves_the_belief_untouched() {
        let device = Default::default();
        let mut rng = SmallRng::seed_from_u64(5);
        let particles = Tensor::<B, 3>::random([2, 8, 4], Distribution::Default, &device);
        let belief = Belief::uniform(particles.clone());
        let filter = ParticleFilter::new(
            IdentityDynamics {
                noise_std: 0.0,
                linear_dims: 4,
            },
            FixedScores(vec![]),
        );
        let out = filter
            .step(
                belief,
                Tensor::zeros([2, 7], &device),
                None,
                StepOptions {
                    resample: None,
                    noisy_dynamics: false,
                },
                &mut rng,
            )
            .unwrap();
        assert_eq!(
            out.belief.particles.into_data().convert::<f32>().value,
            particles.clone().into_data().convert::<f32>().value
        );
        // Uniform weights: the estimate is the plain particle mean.
        let expected: Vec<f32> = particles
            .mean_dim(1)
            .squeeze::<2>(1)
            .into_data()
            .convert::<f32>()
            .value;
        let estimate: Vec<f32> = out.estimate.into_data().convert::<f32>().value;
        for (a, b) in estimate.iter().zip(expected) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn decisive_observation_concentrates_the_belief() {
        let device = Default::default();
        let mut rng = SmallRng::seed_from_u64(21);
        let states: Vec<f32> = vec![0.0, 0.0, 1.0, 1.0, 2.0, 2.0, 3.0, 3.0];
        let particles = Tensor::<B, 3>::from_data(
            Data::new(states, Shape::new([1, 4, 2])).convert(),
            &device,
        );
        let belief = Belief::uniform(particles);
        // Only particle 2 is compatible with the observation.
        let scores = vec![
            f32::NEG_INFINITY,
            f32::NEG_INFINITY,
            0.0,
            f32::NEG_INFINITY,
        ];
        let filter = ParticleFilter::new(
            IdentityDynamics {
                noise_std: 0.0,
                linear_dims: 2,
            },
            FixedScores(scores),
        );
        let out = filter
            .step(
                belief,
                Tensor::zeros([1, 7], &device),
                Some(&observation(1)),
                StepOptions {
                    resample: Some(ResampleMode::Multinomial),
                    noisy_dynamics: false,
                },
                &mut rng,
            )
            .unwrap();

        let estimate: Vec<f32> = out.estimate.into_data().convert::<f32>().value;
        assert_eq!(estimate, vec![2.0, 2.0]);
        let survivors: Vec<f32> = out
            .belief
            .particles
            .into_data()
            .convert::<f32>()
            .value;
        for particle in survivors.chunks(2) {
            assert_eq!(particle, [2.0, 2.0]);
        }
        let uniform = -(4.0f32).ln();
        for w in out.belief.log_weights.into_data().convert::<f32>().value {
            assert!((w - uniform).abs() < 1e-6);
        }
    }

    #[test]
    fn uninformative_observation_adds_no_information() {
        let device = Default::default();
        let mut rng = SmallRng::seed_from_u64(2);
        let particles = Tensor::<B, 3>::random([1, 4, 2], Distribution::Default, &device);
        let before = weights::normalize(Tensor::<B, 2>::random(
            [1, 4],
            Distribution::Normal(0.0, 1.0),
            &device,
        ));
        let belief = Belief {
            particles,
            log_weights: before.clone(),
        };
        // Every particle gets the same score, so the posterior matches
        // the prior.
        let filter = ParticleFilter::new(
            IdentityDynamics {
                noise_std: 0.0,
                linear_dims: 2,
            },
            FixedScores(vec![1.5; 4]),
        );
        let out = filter
            .step(
                belief,
                Tensor::zeros([1, 7], &device),
                Some(&observation(1)),
                StepOptions {
                    resample: None,
                    noisy_dynamics: false,
                },
                &mut rng,
            )
            .unwrap();
        let before: Vec<f32> = before.into_data().convert::<f32>().value;
        let after: Vec<f32> = out
            .belief
            .log_weights
            .into_data()
            .convert::<f32>()
            .value;
        for (a, b) in after.iter().zip(before) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn weights_accumulate_across_steps_without_resampling() {
        let device = Default::default();
        let mut rng = SmallRng::seed_from_u64(9);
        let particles = Tensor::<B, 3>::zeros([1, 2, 2], &device);
        let mut belief = Belief::uniform(particles);
        let filter = ParticleFilter::new(
            IdentityDynamics {
                noise_std: 0.0,
                linear_dims: 2,
            },
            FixedScores(vec![0.0, (0.5f32).ln()]),
        );
        let options = StepOptions {
            resample: None,
            noisy_dynamics: false,
        };
        for _ in 0..2 {
            belief = filter
                .step(
                    belief,
                    Tensor::zeros([1, 7], &device),
                    Some(&observation(1)),
                    options,
                    &mut rng,
                )
                .unwrap()
                .belief;
        }
        // Two factor-of-two updates: posterior 4/5 vs 1/5.
        let values: Vec<f32> = belief
            .log_weights
            .exp()
            .into_data()
            .convert::<f32>()
            .value;
        assert!((values[0] - 0.8).abs() < 1e-5);
        assert!((values[1] - 0.2).abs() < 1e-5);
    }

    #[test]
    fn weighted_mean_matches_hand_computation() {
        let device = Default::default();
        let particles = Tensor::<B, 3>::from_data(
            Data::new(vec![0.0f32, 1.0], Shape::new([1, 2, 1])).convert(),
            &device,
        );
        let log_weights = Tensor::<B, 2>::from_data(
            Data::new(vec![(0.25f32).ln(), (0.75f32).ln()], Shape::new([1, 2])).convert(),
            &device,
        );
        let mean: Vec<f32> = weighted_mean(particles, log_weights)
            .into_data()
            .convert::<f32>()
            .value;
        assert!((mean[0] - 0.75).abs() < 1e-6);
    }
}
