//! Training losses.
//!
//! The end-to-end loss treats the weighted particle set as a Gaussian
//! mixture over the true state and minimizes its negative log-likelihood,
//! which rewards beliefs that keep probability mass on the truth even
//! when they are multimodal. A mean-squared-error alternative on the
//! point estimate is provided for comparison runs.

use burn::nn::loss::{MseLoss, Reduction};
use burn::tensor::{backend::Backend, Data, Shape, Tensor};

use crate::error::{check_dim, FilterError};
use crate::state::Belief;
use crate::weights;

/// Negative log-likelihood of `truth` `[n, d]` under the belief read as
/// a Gaussian mixture: one diagonal-covariance component per particle,
/// mixed by the particle weights. `variances` holds either one shared
/// value or one per state dimension. Returns the mean over trajectories
/// as a scalar tensor.
pub fn gmm_loss<B: Backend>(
    belief: &Belief<B>,
    truth: Tensor<B, 2>,
    variances: &[f64],
) -> Result<Tensor<B, 1>, FilterError> {
    let (n, _m, d) = belief.dims();
    check_dim("loss truth batch", n, truth.dims()[0])?;
    check_dim("loss truth dim", d, truth.dims()[1])?;
    if variances.len() != 1 && variances.len() != d {
        return Err(FilterError::InvalidConfig {
            context: "gmm variances must have length 1 or the state dimension",
        });
    }
    if variances.iter().any(|v| *v <= 0.0) {
        return Err(FilterError::InvalidConfig {
            context: "gmm variances must be positive",
        });
    }

    let device = belief.particles.device();
    let per_dim: Vec<f64> = if variances.len() == 1 {
        vec![variances[0]; d]
    } else {
        variances.to_vec()
    };
    let log_norm: f64 = per_dim
        .iter()
        .map(|v| 0.5 * (2.0 * std::f64::consts::PI * v).ln())
        .sum();
    let inv_two_var: Vec<f32> = per_dim.iter().map(|v| (0.5 / v) as f32).collect();
    let inv_two_var =
        Tensor::<B, 1>::from_data(Data::new(inv_two_var, Shape::new([d])).convert(), &device)
            .reshape([1, 1, d]);

    let diff = belief.particles.clone() - truth.unsqueeze_dim::<3>(1);
    let component_log_probs = (diff.clone() * diff * inv_two_var)
        .sum_dim(2)
        .squeeze::<2>(2)
        .neg()
        .sub_scalar(log_norm);

    let mixture = weights::log_sum_exp(belief.log_weights.clone() + component_log_probs);
    Ok(mixture.neg().mean())
}

/// Mean squared error between the point estimate and the true state.
pub fn mse_loss<B: Backend>(estimate: Tensor<B, 2>, truth: Tensor<B, 2>) -> Tensor<B, 1> {
    MseLoss::new().forward(estimate, truth, Reduction::Mean)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray;

    fn belief_from(particles: Vec<f32>, log_weights: Vec<f32>, n: usize, m: usize, d: usize) -> Belief<B> {
        let device = Default::default();
        Belief {
            particles: Tensor::from_data(
                Data::new(particles, Shape::new([n, m, d])).convert(),
                &device,
            ),
            log_weights: Tensor::from_data(
                Data::new(log_weights, Shape::new([n, m])).convert(),
                &device,
            ),
        }
    }

    fn truth_from(values: Vec<f32>, n: usize, d: usize) -> Tensor<B, 2> {
        Tensor::from_data(
            Data::new(values, Shape::new([n, d])).convert(),
            &Default::default(),
        )
    }

    fn scalar(t: Tensor<B, 1>) -> f32 {
        t.into_data().convert::<f32>().value[0]
    }

    #[test]
    fn single_particle_matches_the_gaussian_closed_form() {
        let variance = 0.1f64;
        let belief = belief_from(vec![0.3], vec![0.0], 1, 1, 1);
        let truth = truth_from(vec![0.5], 1, 1);
        let loss = scalar(gmm_loss(&belief, truth, &[variance]).unwrap());
        let expected = 0.5 * (2.0 * std::f64::consts::PI * variance).ln()
            + (0.5 - 0.3f64).powi(2) / (2.0 * variance);
        assert!((loss - expected as f32).abs() < 1e-5);
    }

    #[test]
    fn mass_on_the_truth_beats_a_collapsed_belief() {
        let half = (0.5f32).ln();
        // Half the mass on the truth, half far away.
        let spread = belief_from(vec![1.0, -1.0], vec![half, half], 1, 2, 1);
        // All mass far away.
        let collapsed = belief_from(vec![-1.0, -1.0], vec![half, half], 1, 2, 1);
        let truth = truth_from(vec![1.0], 1, 1);
        let spread_loss = scalar(gmm_loss(&spread, truth.clone(), &[0.1]).unwrap());
        let collapsed_loss = scalar(gmm_loss(&collapsed, truth, &[0.1]).unwrap());
        assert!(spread_loss < collapsed_loss);
    }

    #[test]
    fn per_dimension_variances_are_accepted() {
        let belief = belief_from(vec![0.0, 0.0], vec![0.0], 1, 1, 2);
        let truth = truth_from(vec![0.1, 0.2], 1, 2);
        assert!(gmm_loss(&belief, truth.clone(), &[0.1, 0.2]).is_ok());
        assert!(gmm_loss(&belief, truth.clone(), &[0.1, 0.2, 0.3]).is_err());
        assert!(gmm_loss(&belief, truth, &[0.0]).is_err());
    }

    #[test]
    fn mse_of_a_perfect_estimate_is_zero() {
        let estimate = truth_from(vec![0.5, -0.5], 1, 2);
        let loss = scalar(mse_loss(estimate.clone(), estimate));
        assert!(loss.abs() < 1e-7);
    }
}
