use burn::tensor::{backend::Backend, Tensor};

use crate::error::{check_dim, FilterError};
use crate::weights;

/// The belief carried between filtering steps: a batch of particle sets
/// with one log-weight per particle.
///
/// Shapes are `[n, m, d]` for particles and `[n, m]` for log-weights,
/// where `n` is the trajectory count, `m` the particle count and `d`
/// the state dimension.
#[derive(Debug, Clone)]
pub struct Belief<B: Backend> {
    pub particles: Tensor<B, 3>,
    pub log_weights: Tensor<B, 2>,
}

impl<B: Backend> Belief<B> {
    pub fn new(particles: Tensor<B, 3>, log_weights: Tensor<B, 2>) -> Result<Self, FilterError> {
        let [n, m, _d] = particles.dims();
        let [wn, wm] = log_weights.dims();
        check_dim("belief trajectory count", n, wn)?;
        check_dim("belief particle count", m, wm)?;
        Ok(Self {
            particles,
            log_weights,
        })
    }

    /// Builds a belief with uniform `-ln m` log-weights.
    pub fn uniform(particles: Tensor<B, 3>) -> Self {
        let [n, m, _] = particles.dims();
        let log_weights = weights::uniform(n, m, &particles.device());
        Self {
            particles,
            log_weights,
        }
    }

    /// Severs the autodiff graph, for truncated backprop through time.
    pub fn detach(self) -> Self {
        Self {
            particles: self.particles.detach(),
            log_weights: self.log_weights.detach(),
        }
    }

    /// `(n, m, d)`
    pub fn dims(&self) -> (usize, usize, usize) {
        let [n, m, d] = self.particles.dims();
        (n, m, d)
    }
}

/// One timestep of multi-modal sensor data, batched over trajectories.
///
/// All modalities share the trajectory axis; none depend on the particle
/// axis. The measurement model broadcasts their features over particles.
#[derive(Debug, Clone)]
pub struct Observation<B: Backend> {
    /// Grayscale camera frame, `[n, height, width]`.
    pub image: Tensor<B, 3>,
    /// Gripper position, `[n, 3]`.
    pub gripper_pos: Tensor<B, 2>,
    /// Gripper force/torque and contact readings, `[n, 7]`.
    pub gripper_sensors: Tensor<B, 2>,
}

impl<B: Backend> Observation<B> {
    pub fn batch_size(&self) -> usize {
        self.image.dims()[0]
    }

    pub(crate) fn validate(&self, n: usize) -> Result<(), FilterError> {
        check_dim("observation image batch", n, self.image.dims()[0])?;
        check_dim("observation gripper_pos batch", n, self.gripper_pos.dims()[0])?;
        check_dim(
            "observation gripper_sensors batch",
            n,
            self.gripper_sensors.dims()[0],
        )
    }
}

/// A full sequence of observations, `[n, t, ...]` time-major.
#[derive(Debug, Clone)]
pub struct ObservationSeq<B: Backend> {
    pub images: Tensor<B, 4>,
    pub gripper_pos: Tensor<B, 3>,
    pub gripper_sensors: Tensor<B, 3>,
}

impl<B: Backend> ObservationSeq<B> {
    pub fn len(&self) -> usize {
        self.images.dims()[1]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slices out the observation for timestep `t`.
    pub fn at(&self, t: usize) -> Observation<B> {
        let [n, _t, h, w] = self.images.dims();
        let [_, _, pos_dim] = self.gripper_pos.dims();
        let [_, _, sensor_dim] = self.gripper_sensors.dims();
        Observation {
            image: self
                .images
                .clone()
                .slice([0..n, t..t + 1, 0..h, 0..w])
                .squeeze::<3>(1),
            gripper_pos: self
                .gripper_pos
                .clone()
                .slice([0..n, t..t + 1, 0..pos_dim])
                .squeeze::<2>(1),
            gripper_sensors: self
                .gripper_sensors
                .clone()
                .slice([0..n, t..t + 1, 0..sensor_dim])
                .squeeze::<2>(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type B = NdArray;

    #[test]
    fn belief_rejects_mismatched_weights() {
        let device = Default::default();
        let particles = Tensor::<B, 3>::zeros([2, 5, 3], &device);
        let log_weights = Tensor::<B, 2>::zeros([2, 4], &device);
        let err = Belief::new(particles, log_weights).unwrap_err();
        assert!(matches!(err, FilterError::ShapeMismatch { .. }));
    }

    #[test]
    fn uniform_belief_sums_to_one() {
        let device = Default::default();
        let particles = Tensor::<B, 3>::random([3, 8, 2], Distribution::Default, &device);
        let belief = Belief::uniform(particles);
        let sums: Vec<f32> = belief
            .log_weights
            .exp()
            .sum_dim(1)
            .into_data()
            .convert::<f32>()
            .value;
        for sum in sums {
            assert!((sum - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn observation_seq_slices_one_timestep() {
        let device = Default::default();
        let seq = ObservationSeq {
            images: Tensor::<B, 4>::zeros([2, 6, 8, 8], &device),
            gripper_pos: Tensor::<B, 3>::zeros([2, 6, 3], &device),
            gripper_sensors: Tensor::<B, 3>::zeros([2, 6, 7], &device),
        };
        let obs = seq.at(4);
        assert_eq!(obs.image.dims(), [2, 8, 8]);
        assert_eq!(obs.gripper_pos.dims(), [2, 3]);
        assert_eq!(obs.gripper_sensors.dims(), [2, 7]);
        assert!(obs.validate(2).is_ok());
        assert!(obs.validate(3).is_err());
    }
}
