//! 学習の進み具合を見るための指標。損失には使いません。

/// 平均絶対パーセント誤差 `mean(|t - p| / max(|t|, ε))`。
///
/// 真値が 0 に近い点では分母を `f64::EPSILON` で下から抑えます。
pub fn mean_absolute_percentage_error(truth: &[f32], prediction: &[f32]) -> f64 {
    let n = truth.len().min(prediction.len());
    if n == 0 {
        return 0.0;
    }
    let total: f64 = truth
        .iter()
        .zip(prediction)
        .map(|(&t, &p)| {
            let (t, p) = (t as f64, p as f64);
            (t - p).abs() / t.abs().max(f64::EPSILON)
        })
        .sum();
    total / n as f64
}

/// `1 - MAPE`
pub fn accuracy(truth: &[f32], prediction: &[f32]) -> f64 {
    1.0 - mean_absolute_percentage_error(truth, prediction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn perfect_prediction_has_full_accuracy() {
        let values = [0.3, -1.2, 4.0];
        assert_eq!(mean_absolute_percentage_error(&values, &values), 0.0);
        assert_eq!(accuracy(&values, &values), 1.0);
    }

    #[test]
    fn relative_errors_are_averaged() {
        let truth = [1.0, -2.0];
        let prediction = [1.1, -1.0];
        // (0.1 / 1 + 1 / 2) / 2
        assert_relative_eq!(
            mean_absolute_percentage_error(&truth, &prediction),
            0.3,
            epsilon = 1e-6
        );
        assert_relative_eq!(accuracy(&truth, &prediction), 0.7, epsilon = 1e-6);
    }

    #[test]
    fn zero_truth_is_bounded_by_epsilon() {
        let mape = mean_absolute_percentage_error(&[0.0], &[1e-3]);
        assert!(mape.is_finite());
        assert!(mape > 1e9);
    }

    #[test]
    fn empty_input_is_zero() {
        assert_eq!(mean_absolute_percentage_error(&[], &[]), 0.0);
    }
}
