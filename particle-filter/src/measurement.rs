//! Measurement models.
//!
//! A measurement model scores every particle against the current
//! observation, producing unnormalized log-likelihoods. Observation
//! features only depend on the trajectory, so they are computed once per
//! trajectory and broadcast across the particle axis before scoring.

use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{Linear, LinearConfig, PaddingConfig2d};
use burn::tensor::activation::relu;
use burn::tensor::{backend::Backend, Tensor};

use crate::dynamics::ResidualLinear;
use crate::error::{check_dim, FilterError};
use crate::state::Observation;

/// Scores particles `[n, m, d]` against one observation, returning
/// unnormalized log-likelihoods `[n, m]`.
pub trait MeasurementModel<B: Backend> {
    fn log_likelihood(
        &self,
        particles: Tensor<B, 3>,
        observation: &Observation<B>,
    ) -> Result<Tensor<B, 2>, FilterError>;
}

impl<B: Backend, T: MeasurementModel<B>> MeasurementModel<B> for &T {
    fn log_likelihood(
        &self,
        particles: Tensor<B, 3>,
        observation: &Observation<B>,
    ) -> Result<Tensor<B, 2>, FilterError> {
        (*self).log_likelihood(particles, observation)
    }
}

/// A 3x3 same-padding convolution with a skip connection.
#[derive(Module, Debug)]
pub struct ResidualConv2d<B: Backend> {
    inner: Conv2d<B>,
}

impl<B: Backend> ResidualConv2d<B> {
    pub fn new(channels: usize, device: &B::Device) -> Self {
        Self {
            inner: Conv2dConfig::new([channels, channels], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device),
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        relu(self.inner.forward(input.clone())) + input
    }
}

#[derive(Config, Debug)]
pub struct MultimodalMeasurementConfig {
    pub state_dim: usize,
    #[config(default = 32)]
    pub units: usize,
    #[config(default = 32)]
    pub image_size: usize,
    #[config(default = 3)]
    pub pos_dim: usize,
    #[config(default = 7)]
    pub sensor_dim: usize,
}

impl MultimodalMeasurementConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> MultimodalMeasurement<B> {
        let units = self.units;
        MultimodalMeasurement {
            conv_in: Conv2dConfig::new([1, 3], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device),
            conv_block: ResidualConv2d::new(3, device),
            conv_out: Conv2dConfig::new([3, 1], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device),
            image_linear: LinearConfig::new(self.image_size * self.image_size, units)
                .init(device),
            pos_linear: LinearConfig::new(self.pos_dim, units).init(device),
            sensor_linear: LinearConfig::new(self.sensor_dim, units).init(device),
            state_linear: LinearConfig::new(self.state_dim, units).init(device),
            shared_in: LinearConfig::new(4 * units, units).init(device),
            shared_blocks: vec![
                ResidualLinear::new(units, device),
                ResidualLinear::new(units, device),
            ],
            shared_out: LinearConfig::new(units, 1).init(device),
        }
    }
}

/// Learned observation likelihood over camera, gripper position and
/// gripper force/torque modalities. Each modality is encoded separately,
/// concatenated with a per-particle state encoding, and scored by a
/// shared residual head.
#[derive(Module, Debug)]
pub struct MultimodalMeasurement<B: Backend> {
    conv_in: Conv2d<B>,
    conv_block: ResidualConv2d<B>,
    conv_out: Conv2d<B>,
    image_linear: Linear<B>,
    pos_linear: Linear<B>,
    sensor_linear: Linear<B>,
    state_linear: Linear<B>,
    shared_in: Linear<B>,
    shared_blocks: Vec<ResidualLinear<B>>,
    shared_out: Linear<B>,
}

impl<B: Backend> MultimodalMeasurement<B> {
    /// Per-trajectory observation encoding, `[n, 3 * units]`.
    fn observation_features(&self, observation: &Observation<B>) -> Tensor<B, 2> {
        let [n, h, w] = observation.image.dims();
        let image = observation.image.clone().reshape([n, 1, h, w]);
        let image = relu(self.conv_in.forward(image));
        let image = self.conv_block.forward(image);
        let image = relu(self.conv_out.forward(image));
        let image = relu(self.image_linear.forward(image.reshape([n, h * w])));

        let pos = relu(self.pos_linear.forward(observation.gripper_pos.clone()));
        let sensors = relu(
            self.sensor_linear
                .forward(observation.gripper_sensors.clone()),
        );
        Tensor::cat(vec![image, pos, sensors], 1)
    }
}

impl<B: Backend> MeasurementModel<B> for MultimodalMeasurement<B> {
    fn log_likelihood(
        &self,
        particles: Tensor<B, 3>,
        observation: &Observation<B>,
    ) -> Result<Tensor<B, 2>, FilterError> {
        let [n, m, d] = particles.dims();
        observation.validate(n)?;
        check_dim(
            "measurement state dim",
            self.state_linear.weight.val().dims()[0],
            d,
        )?;

        let state_features = relu(self.state_linear.forward(particles.reshape([n * m, d])));
        let obs_features = self.observation_features(observation);
        let feature_width = obs_features.dims()[1];
        let obs_features = obs_features
            .unsqueeze_dim::<3>(1)
            .repeat(1, m)
            .reshape([n * m, feature_width]);

        let mut features = relu(
            self.shared_in
                .forward(Tensor::cat(vec![obs_features, state_features], 1)),
        );
        for block in &self.shared_blocks {
            features = block.forward(features);
        }
        Ok(self.shared_out.forward(features).reshape([n, m]))
    }
}
