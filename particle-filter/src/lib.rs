//! A differentiable particle filter for state estimation with learned
//! dynamics and measurement models.
//!
//! The filter keeps a batch of weighted particle sets and advances them
//! with the classic propagate, weight, normalize, estimate, resample
//! recursion. Every stage except hard resampling is built from
//! differentiable tensor ops, so the models can be trained end-to-end
//! through the filter with backpropagation; a soft resampler keeps
//! gradients alive across resampling steps.
//!
//! Models plug in through the [`DynamicsModel`] and [`MeasurementModel`]
//! traits. [`ResidualDynamics`] and [`MultimodalMeasurement`] are the
//! learned implementations; [`FilterModel`] bundles them into a single
//! trainable module.

pub mod dynamics;
pub mod error;
pub mod filter;
pub mod loss;
pub mod measurement;
pub mod resample;
pub mod rollout;
pub mod state;
pub mod weights;

pub use dynamics::{DynamicsModel, IdentityDynamics, ResidualDynamics, ResidualDynamicsConfig};
pub use error::FilterError;
pub use filter::{
    weighted_mean, FilterModel, FilterModelConfig, ParticleFilter, StepOptions, StepOutput,
};
pub use loss::{gmm_loss, mse_loss};
pub use measurement::{MeasurementModel, MultimodalMeasurement, MultimodalMeasurementConfig};
pub use resample::ResampleMode;
pub use rollout::{rollout, ParticleInit, Rollout, RolloutConfig};
pub use state::{Belief, Observation, ObservationSeq};
