//! Batch Statistics
//!
//! Noise handling for a batch of scaled weight samples.
//! Mechanical vibration shows up as isolated spikes, so the batch is
//! trimmed at two population standard deviations before taking the median.

/// Minimum batch size before outlier rejection is attempted.
pub const MIN_FILTER_BATCH: usize = 3;

/// Samples further than this many standard deviations from the mean are dropped.
pub const OUTLIER_SIGMA: f64 = 2.0;

/// Arithmetic mean. Returns `None` for an empty batch.
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Population standard deviation (divides by `n`, not `n - 1`).
pub fn population_stdev(values: &[f64]) -> Option<f64> {
    let m = mean(values)?;
    let variance = values.iter()
        .map(|x| (x - m) * (x - m))
        .sum::<f64>() / values.len() as f64;
    Some(variance.sqrt())
}

/// Median; the mean of the two middle values for even-length batches.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Keep only samples within `OUTLIER_SIGMA` standard deviations of the mean.
pub fn reject_outliers(values: &[f64]) -> Vec<f64> {
    let (m, sd) = match (mean(values), population_stdev(values)) {
        (Some(m), Some(sd)) => (m, sd),
        _ => return Vec::new(),
    };

    values.iter()
        .copied()
        .filter(|x| (x - m).abs() <= OUTLIER_SIGMA * sd)
        .collect()
}

/// Round to one decimal place.
#[inline]
pub fn round_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Reduce a sample batch to a single reading.
///
/// - fewer than [`MIN_FILTER_BATCH`] samples: plain median, no filtering
/// - otherwise: median of the outlier-free subset, falling back to the
///   unfiltered median if the filter empties the batch
///
/// The result is rounded to one decimal. `None` only for an empty batch.
pub fn filtered_median(values: &[f64]) -> Option<f64> {
    if values.len() >= MIN_FILTER_BATCH {
        let kept = reject_outliers(values);
        if let Some(m) = median(&kept) {
            return Some(round_tenth(m));
        }
    }
    median(values).map(round_tenth)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    #[test]
    fn test_median_odd_and_even() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), Some(2.5));
        assert_eq!(median(&[]), None);
    }

    #[test]
    fn test_population_stdev() {
        // Classic example: population stdev is exactly 2
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert_eq!(mean(&values), Some(5.0));
        assert!((population_stdev(&values).unwrap() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_spike_is_rejected() {
        let values = [100.0, 100.2, 99.8, 100.1, 99.9, 100.0, 100.1, 99.9, 100.0, 500.0];
        assert_eq!(filtered_median(&values), Some(100.0));
        assert!(!reject_outliers(&values).contains(&500.0));
    }

    #[test]
    fn test_small_batch_skips_filter() {
        assert_eq!(filtered_median(&[10.0, 90.0]), Some(50.0));
        assert_eq!(filtered_median(&[42.04]), Some(42.0));
        assert_eq!(filtered_median(&[]), None);
    }

    #[test]
    fn test_identical_samples_survive_zero_stdev() {
        let values = [12.34; 5];
        assert_eq!(reject_outliers(&values).len(), 5);
        assert_eq!(filtered_median(&values), Some(12.3));
    }

    #[test]
    fn test_noisy_batches_stay_near_true_weight() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let mut batch: Vec<f64> = (0..5)
                .map(|_| 250.0 + rng.gen_range(-0.5..0.5))
                .collect();
            batch.push(250.0 + rng.gen_range(2000.0..5000.0));
            let reading = filtered_median(&batch).unwrap();
            assert!((reading - 250.0).abs() <= 0.6, "reading {reading}");
        }
    }

    #[test]
    fn test_round_tenth() {
        assert_eq!(round_tenth(1.26), 1.3);
        assert_eq!(round_tenth(-1.24), -1.2);
    }

    proptest! {
        #[test]
        fn prop_filter_excludes_far_samples(
            values in prop::collection::vec(-9999.0f64..9999.0, 3..40)
        ) {
            let m = mean(&values).unwrap();
            let sd = population_stdev(&values).unwrap();
            let kept = reject_outliers(&values);

            for x in &kept {
                prop_assert!((x - m).abs() <= OUTLIER_SIGMA * sd);
            }
            let expected = if kept.is_empty() {
                median(&values).map(round_tenth)
            } else {
                median(&kept).map(round_tenth)
            };
            prop_assert_eq!(filtered_median(&values), expected);
        }

        #[test]
        fn prop_reading_within_batch_bounds(
            values in prop::collection::vec(-9999.0f64..9999.0, 1..40)
        ) {
            let lo = values.iter().copied().fold(f64::INFINITY, f64::min);
            let hi = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let reading = filtered_median(&values).unwrap();
            prop_assert!(reading >= round_tenth(lo) - 0.05);
            prop_assert!(reading <= round_tenth(hi) + 0.05);
        }
    }
}
