//! Log-space particle weight bookkeeping.
//!
//! Weights live in log space from the moment a likelihood is folded in
//! until the belief is consumed, so that long products of small
//! likelihoods neither underflow nor overflow. Normalization uses the
//! max-subtraction trick and never produces NaN: a trajectory whose
//! weights have all collapsed falls back to uniform with a warning.

use burn::tensor::{backend::Backend, Tensor};

/// Uniform log-weights `-ln m` for `n` trajectories of `m` particles.
pub fn uniform<B: Backend>(n: usize, m: usize, device: &B::Device) -> Tensor<B, 2> {
    Tensor::full([n, m], -(m as f64).ln(), device)
}

/// Per-trajectory log-sum-exp over the particle axis, `[n, m] -> [n, 1]`.
///
/// The row maximum is subtracted before exponentiation. Rows whose
/// maximum is `-inf` propagate `-inf` (the caller decides how to
/// recover); no NaN is produced for finite rows containing `-inf`
/// entries.
pub fn log_sum_exp<B: Backend>(log_weights: Tensor<B, 2>) -> Tensor<B, 2> {
    let max = log_weights.clone().max_dim(1);
    let shifted = log_weights - max.clone();
    max + shifted.exp().sum_dim(1).log()
}

/// Normalizes log-weights so that `sum(exp(row)) == 1` per trajectory.
///
/// Trajectories whose weights have degenerated (row maximum `-inf` or
/// NaN, i.e. every particle was assigned zero likelihood) are reset to
/// uniform rather than poisoning the belief with NaN. This is reported
/// as a degenerate-filter warning, once per offending trajectory.
pub fn normalize<B: Backend>(log_weights: Tensor<B, 2>) -> Tensor<B, 2> {
    let [_n, m] = log_weights.dims();
    let max = log_weights.clone().max_dim(1);
    let row_max: Vec<f32> = max.clone().into_data().convert::<f32>().value;

    let degenerate: Vec<usize> = row_max
        .iter()
        .enumerate()
        .filter(|(_, v)| !v.is_finite())
        .map(|(i, _)| i)
        .collect();

    let shifted = log_weights - max.clone();
    let mut normalized = shifted.clone() - shifted.exp().sum_dim(1).log();

    if !degenerate.is_empty() {
        log::warn!(
            "particle weights collapsed in {} trajectorie(s) {:?}; falling back to uniform",
            degenerate.len(),
            degenerate
        );
        let device = normalized.device();
        let uniform_row = Tensor::<B, 2>::full([1, m], -(m as f64).ln(), &device);
        for row in degenerate {
            normalized = normalized.slice_assign([row..row + 1, 0..m], uniform_row.clone());
        }
    }

    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Data;

    type B = NdArray;

    fn tensor2(rows: Vec<Vec<f32>>) -> Tensor<B, 2> {
        let n = rows.len();
        let m = rows[0].len();
        let flat: Vec<f32> = rows.into_iter().flatten().collect();
        Tensor::from_data(
            Data::new(flat, burn::tensor::Shape::new([n, m])).convert(),
            &Default::default(),
        )
    }

    fn row_sums(log_weights: Tensor<B, 2>) -> Vec<f32> {
        log_weights
            .exp()
            .sum_dim(1)
            .into_data()
            .convert::<f32>()
            .value
    }

    #[test]
    fn normalize_sums_to_one() {
        let lw = tensor2(vec![vec![0.0, -1.0, -2.0], vec![3.0, 3.0, 3.0]]);
        for sum in row_sums(normalize(lw)) {
            assert!((sum - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn normalize_is_stable_for_large_magnitudes() {
        let lw = tensor2(vec![
            vec![-1000.0, -1000.5, -999.0],
            vec![800.0, 801.0, 799.0],
        ]);
        for sum in row_sums(normalize(lw)) {
            assert!((sum - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn normalize_keeps_neg_infinity_entries_finite_sum() {
        let lw = tensor2(vec![vec![0.0, f32::NEG_INFINITY, f32::NEG_INFINITY]]);
        let out = normalize(lw);
        let values: Vec<f32> = out.clone().into_data().convert::<f32>().value;
        assert!((values[0] - 0.0).abs() < 1e-6);
        assert_eq!(values[1], f32::NEG_INFINITY);
        for sum in row_sums(out) {
            assert!((sum - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn fully_collapsed_row_falls_back_to_uniform() {
        let lw = tensor2(vec![
            vec![f32::NEG_INFINITY, f32::NEG_INFINITY],
            vec![0.0, 0.0],
        ]);
        let out = normalize(lw);
        let values: Vec<f32> = out.into_data().convert::<f32>().value;
        let uniform = -(2.0f32).ln();
        for v in values {
            assert!((v - uniform).abs() < 1e-5);
        }
    }

    #[test]
    fn log_sum_exp_matches_reference() {
        let lw = tensor2(vec![vec![0.0, -1.0]]);
        let lse: f32 = log_sum_exp(lw).into_data().convert::<f32>().value[0];
        let expected = (1.0f32 + (-1.0f32).exp()).ln();
        assert!((lse - expected).abs() < 1e-6);
    }
}
