//! Particle resampling.
//!
//! Two modes: a hard multinomial draw for inference, and a soft
//! importance-corrected relaxation for training, where gradients must
//! keep flowing to the pre-resampling particles and weights.

use burn::tensor::{backend::Backend, Data, Int, Shape, Tensor};
use rand::Rng;

use crate::error::FilterError;
use crate::weights;

/// How the particle set is redrawn from the current weights.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResampleMode {
    /// Hard categorical draw with replacement. Resulting weights are
    /// uniform by construction. Blocks gradient flow; inference only.
    Multinomial,
    /// Soft resampling: indices are drawn from the mixture
    /// `q = alpha * w + (1 - alpha) / m` and the surviving particles
    /// carry importance-corrected weights `w / q`, so gradients reach
    /// the pre-resampling weights through the correction and the
    /// pre-resampling particles through the gather. `alpha` in `(0, 1]`;
    /// `alpha = 1` recovers the multinomial distribution while still
    /// letting gradients through.
    Soft { alpha: f64 },
}

/// Draws `m` particle indices per trajectory from categorical
/// distributions given as probabilities, `[n, m]` row-major.
fn sample_indices<R: Rng>(probs: &[f32], n: usize, m: usize, rng: &mut R) -> Vec<i64> {
    let mut indices = Vec::with_capacity(n * m);
    let mut cumulative = vec![0.0f32; m];
    for row in 0..n {
        let weights = &probs[row * m..(row + 1) * m];
        let mut acc = 0.0f32;
        for (c, &w) in cumulative.iter_mut().zip(weights) {
            acc += w;
            *c = acc;
        }
        let total = acc;
        for _ in 0..m {
            let u = rng.gen_range(0.0..1.0f32) * total;
            let idx = cumulative.partition_point(|&c| c < u).min(m - 1);
            indices.push(idx as i64);
        }
    }
    indices
}

fn gather_particles<B: Backend>(
    particles: Tensor<B, 3>,
    indices: Tensor<B, 2, Int>,
) -> Tensor<B, 3> {
    let [_n, _m, d] = particles.dims();
    let expanded = indices.unsqueeze_dim::<3>(2).repeat(2, d);
    particles.gather(1, expanded)
}

/// Redraws the particle set according to `mode`.
///
/// Preserves `n` and `m` exactly. `m == 1` is a no-op pass-through:
/// there is nothing meaningful to redraw from a single particle.
/// A soft `alpha` outside `(0, 1]` is rejected before any sampling
/// happens. Precondition: `log_weights` are normalized.
pub fn resample<B: Backend, R: Rng>(
    mode: ResampleMode,
    particles: Tensor<B, 3>,
    log_weights: Tensor<B, 2>,
    rng: &mut R,
) -> Result<(Tensor<B, 3>, Tensor<B, 2>), FilterError> {
    if let ResampleMode::Soft { alpha } = mode {
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(FilterError::InvalidConfig {
                context: "soft resampling alpha must be in (0, 1]",
            });
        }
    }
    let [n, m, _d] = particles.dims();
    if m == 1 {
        return Ok((particles, log_weights));
    }
    let device = particles.device();

    Ok(match mode {
        ResampleMode::Multinomial => {
            let probs: Vec<f32> = log_weights.exp().into_data().convert::<f32>().value;
            let raw = sample_indices(&probs, n, m, rng);
            let indices = Tensor::<B, 2, Int>::from_data(
                Data::new(raw, Shape::new([n, m])).convert(),
                &device,
            );
            let resampled = gather_particles(particles, indices);
            (resampled, weights::uniform(n, m, &device))
        }
        ResampleMode::Soft { alpha } => {
            // q keeps every particle reachable, so log(q) stays finite
            // and the importance correction w/q is well defined.
            let q = log_weights
                .clone()
                .exp()
                .mul_scalar(alpha)
                .add_scalar((1.0 - alpha) / m as f64);
            let q_probs: Vec<f32> = q.clone().into_data().convert::<f32>().value;
            let raw = sample_indices(&q_probs, n, m, rng);
            let indices = Tensor::<B, 2, Int>::from_data(
                Data::new(raw, Shape::new([n, m])).convert(),
                &device,
            );
            let resampled = gather_particles(particles, indices.clone());
            let corrected =
                log_weights.gather(1, indices.clone()) - q.log().gather(1, indices);
            (resampled, weights::normalize(corrected))
        }
    })
}
