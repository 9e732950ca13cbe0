//! State transition models.
//!
//! A dynamics model pushes every particle forward one timestep given the
//! control input for its trajectory. State vectors follow a fixed layout:
//! `linear_dims` unconstrained entries first, then consecutive
//! `(cos, sin)` pairs for each angular quantity. Propagation keeps the
//! pairs on the unit circle by reprojecting after every update.

use burn::config::Config;
use burn::module::Module;
use burn::nn::{Linear, LinearConfig};
use burn::tensor::activation::relu;
use burn::tensor::{backend::Backend, Data, Distribution, Shape, Tensor};

use crate::error::{check_dim, FilterError};

/// Pushes particles `[n, m, d]` forward one timestep under controls
/// `[n, c]`. With `noisy` set, process noise is added so that the
/// particle set keeps covering the state space; without it propagation
/// is deterministic (for evaluation and single-step supervised training).
pub trait DynamicsModel<B: Backend> {
    fn propagate(
        &self,
        particles: Tensor<B, 3>,
        controls: Tensor<B, 2>,
        noisy: bool,
    ) -> Result<Tensor<B, 3>, FilterError>;
}

impl<B: Backend, T: DynamicsModel<B>> DynamicsModel<B> for &T {
    fn propagate(
        &self,
        particles: Tensor<B, 3>,
        controls: Tensor<B, 2>,
        noisy: bool,
    ) -> Result<Tensor<B, 3>, FilterError> {
        (*self).propagate(particles, controls, noisy)
    }
}

/// Renormalizes every `(cos, sin)` pair past `linear_dims` back onto the
/// unit circle. Near-zero pairs are clamped away from division by zero.
pub fn reproject_angles<B: Backend>(
    particles: Tensor<B, 3>,
    linear_dims: usize,
) -> Result<Tensor<B, 3>, FilterError> {
    let [n, m, d] = particles.dims();
    if linear_dims > d || (d - linear_dims) % 2 != 0 {
        return Err(FilterError::InvalidConfig {
            context: "angular state entries must form (cos, sin) pairs",
        });
    }
    let mut particles = particles;
    let mut i = linear_dims;
    while i < d {
        let cos = particles.clone().slice([0..n, 0..m, i..i + 1]);
        let sin = particles.clone().slice([0..n, 0..m, i + 1..i + 2]);
        let norm = (cos.clone() * cos.clone() + sin.clone() * sin.clone())
            .sqrt()
            .clamp_min(1e-6);
        particles = particles.slice_assign([0..n, 0..m, i..i + 1], cos / norm.clone());
        particles = particles.slice_assign([0..n, 0..m, i + 1..i + 2], sin / norm);
        i += 2;
    }
    Ok(particles)
}

/// Zero-mean Gaussian noise on the linear state entries only. Angular
/// pairs are left untouched; reprojection handles them.
pub(crate) fn linear_noise<B: Backend>(
    dims: [usize; 3],
    linear_dims: usize,
    std: f64,
    device: &B::Device,
) -> Tensor<B, 3> {
    let [_n, _m, d] = dims;
    let mut scale = vec![0.0f32; d];
    for s in scale.iter_mut().take(linear_dims) {
        *s = std as f32;
    }
    let scale =
        Tensor::<B, 1>::from_data(Data::new(scale, Shape::new([d])).convert(), device)
            .reshape([1, 1, d]);
    Tensor::random(dims, Distribution::Normal(0.0, 1.0), device) * scale
}

/// Baseline that assumes the state never moves. Useful as a control
/// experiment: with this model the filter can only ever track through
/// its measurement updates.
#[derive(Debug, Clone)]
pub struct IdentityDynamics {
    pub noise_std: f64,
    pub linear_dims: usize,
}

impl<B: Backend> DynamicsModel<B> for IdentityDynamics {
    fn propagate(
        &self,
        particles: Tensor<B, 3>,
        controls: Tensor<B, 2>,
        noisy: bool,
    ) -> Result<Tensor<B, 3>, FilterError> {
        let [n, _m, _d] = particles.dims();
        check_dim("dynamics control batch", n, controls.dims()[0])?;
        if !noisy {
            return Ok(particles);
        }
        let dims = particles.dims();
        let device = particles.device();
        let noise = linear_noise(dims, self.linear_dims, self.noise_std, &device);
        reproject_angles(particles + noise, self.linear_dims)
    }
}

/// A fully connected block with a skip connection, `x + relu(W x + b)`.
#[derive(Module, Debug)]
pub struct ResidualLinear<B: Backend> {
    inner: Linear<B>,
}

impl<B: Backend> ResidualLinear<B> {
    pub fn new(size: usize, device: &B::Device) -> Self {
        Self {
            inner: LinearConfig::new(size, size).init(device),
        }
    }

    pub fn forward(&self, input: Tensor<B, 2>) -> Tensor<B, 2> {
        relu(self.inner.forward(input.clone())) + input
    }
}

#[derive(Config, Debug)]
pub struct ResidualDynamicsConfig {
    pub state_dim: usize,
    pub control_dim: usize,
    /// Leading state entries that are unconstrained; the rest are
    /// `(cos, sin)` pairs.
    pub linear_dims: usize,
    #[config(default = 32)]
    pub units: usize,
    #[config(default = 3)]
    pub blocks: usize,
    #[config(default = 0.05)]
    pub noise_std: f64,
}

impl ResidualDynamicsConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ResidualDynamics<B> {
        let half = self.units / 2;
        ResidualDynamics {
            state_branch: LinearConfig::new(self.state_dim, half).init(device),
            control_branch: LinearConfig::new(self.control_dim, half).init(device),
            trunk: (0..self.blocks)
                .map(|_| ResidualLinear::new(self.units, device))
                .collect(),
            output: LinearConfig::new(self.units, self.state_dim).init(device),
            linear_dims: self.linear_dims,
            noise_std: self.noise_std,
        }
    }
}

/// Learned residual dynamics: separate state and control encoders feed a
/// residual trunk that predicts a per-particle state delta.
#[derive(Module, Debug)]
pub struct ResidualDynamics<B: Backend> {
    state_branch: Linear<B>,
    control_branch: Linear<B>,
    trunk: Vec<ResidualLinear<B>>,
    output: Linear<B>,
    linear_dims: usize,
    noise_std: f64,
}

impl<B: Backend> ResidualDynamics<B> {
    fn delta(&self, particles: Tensor<B, 3>, controls: Tensor<B, 2>) -> Tensor<B, 3> {
        let [n, m, d] = particles.dims();

        let state_features = relu(self.state_branch.forward(particles.reshape([n * m, d])));
        // Control features depend only on the trajectory; encode once
        // and broadcast over the particle axis.
        let control_features = relu(self.control_branch.forward(controls));
        let width = control_features.dims()[1];
        let control_features = control_features
            .unsqueeze_dim::<3>(1)
            .repeat(1, m)
            .reshape([n * m, width]);

        let mut features = Tensor::cat(vec![state_features, control_features], 1);
        for block in &self.trunk {
            features = block.forward(features);
        }
        self.output.forward(features).reshape([n, m, d])
    }
}

impl<B: Backend> DynamicsModel<B> for ResidualDynamics<B> {
    fn propagate(
        &self,
        particles: Tensor<B, 3>,
        controls: Tensor<B, 2>,
        noisy: bool,
    ) -> Result<Tensor<B, 3>, FilterError> {
        let [n, _m, _d] = particles.dims();
        check_dim("dynamics control batch", n, controls.dims()[0])?;

        let delta = self.delta(particles.clone(), controls);
        let mut propagated = particles + delta;
        if noisy {
            let dims = propagated.dims();
            let device = propagated.device();
            propagated =
                propagated + linear_noise(dims, self.linear_dims, self.noise_std, &device);
        }
        reproject_angles(propagated, self.linear_dims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray;

    #[test]
    fn reprojection_restores_unit_norm() {
        let device = Default::default();
        let raw = Tensor::<B, 3>::from_data(
            Data::new(vec![1.0f32, 2.0, 3.0, 4.0], Shape::new([1, 1, 4])).convert(),
            &device,
        );
        let out = reproject_angles(raw, 2).unwrap();
        let values: Vec<f32> = out.into_data().convert::<f32>().value;
        assert_eq!(values[0], 1.0);
        assert_eq!(values[1], 2.0);
        let norm = values[2] * values[2] + values[3] * values[3];
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn reprojection_rejects_odd_pair_layout() {
        let device = Default::default();
        let raw = Tensor::<B, 3>::zeros([1, 1, 3], &device);
        assert!(reproject_angles(raw, 2).is_err());
    }

    #[test]
    fn identity_without_noise_is_exact() {
        let device = Default::default();
        let particles = Tensor::<B, 3>::from_data(
            Data::new(vec![0.5f32, -0.5, 1.0, 0.0], Shape::new([1, 1, 4])).convert(),
            &device,
        );
        let controls = Tensor::<B, 2>::zeros([1, 7], &device);
        let model = IdentityDynamics {
            noise_std: 0.05,
            linear_dims: 2,
        };
        let out = model.propagate(particles.clone(), controls, false).unwrap();
        assert_eq!(
            out.into_data().convert::<f32>().value,
            particles.into_data().convert::<f32>().value
        );
    }

    #[test]
    fn identity_noise_leaves_angles_on_the_unit_circle() {
        let device = Default::default();
        let particles = Tensor::<B, 3>::from_data(
            Data::new(
                vec![0.5f32, -0.5, 1.0, 0.0, 0.0, 0.25, 0.0, 1.0],
                Shape::new([1, 2, 4]),
            )
            .convert(),
            &device,
        );
        let controls = Tensor::<B, 2>::zeros([1, 7], &device);
        let model = IdentityDynamics {
            noise_std: 0.1,
            linear_dims: 2,
        };
        let out = model.propagate(particles, controls, true).unwrap();
        let values: Vec<f32> = out.into_data().convert::<f32>().value;
        for particle in values.chunks(4) {
            let norm = particle[2] * particle[2] + particle[3] * particle[3];
            assert!((norm - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn residual_dynamics_preserves_shape() {
        let device = Default::default();
        let model = ResidualDynamicsConfig::new(4, 7, 2).init::<B>(&device);
        let particles = Tensor::<B, 3>::random([3, 10, 4], Distribution::Default, &device);
        let controls = Tensor::<B, 2>::random([3, 7], Distribution::Default, &device);
        let out = model.propagate(particles, controls, true).unwrap();
        assert_eq!(out.dims(), [3, 10, 4]);
    }

    #[test]
    fn particles_in_a_trajectory_share_the_control_encoding() {
        let device = Default::default();
        let model = ResidualDynamicsConfig::new(4, 7, 2).init::<B>(&device);
        let single = Tensor::<B, 3>::random([1, 1, 4], Distribution::Default, &device);
        let repeated = single.repeat(1, 3);
        let controls = Tensor::<B, 2>::random([1, 7], Distribution::Default, &device);
        let out = model.propagate(repeated, controls, false).unwrap();
        let values: Vec<f32> = out.into_data().convert::<f32>().value;
        let (first, rest) = values.split_at(4);
        for particle in rest.chunks(4) {
            for (a, b) in particle.iter().zip(first) {
                assert!((a - b).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn residual_dynamics_rejects_mismatched_control_batch() {
        let device = Default::default();
        let model = ResidualDynamicsConfig::new(4, 7, 2).init::<B>(&device);
        let particles = Tensor::<B, 3>::zeros([3, 10, 4], &device);
        let controls = Tensor::<B, 2>::zeros([2, 7], &device);
        let err = model.propagate(particles, controls, false).unwrap_err();
        assert!(matches!(err, FilterError::ShapeMismatch { .. }));
    }
}
