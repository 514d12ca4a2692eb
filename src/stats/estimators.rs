//! Central tendency and dispersion estimators.
//!
//! Values are compared for exact equality when counting modes. Frequencies
//! and zero points arrive already quantized (device resolution, or rounded
//! to two decimals), so exact comparison is what groups them.

use crate::core::{CentralMethod, SelectionMethod};

/// Arithmetic mean. `None` for an empty slice.
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Median, averaging the two middle values for even lengths.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        Some(sorted[mid])
    } else {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    }
}

/// Values sharing the highest count, in order of first appearance.
pub fn multimode(values: &[f64]) -> Vec<f64> {
    let mut counts: Vec<(f64, usize)> = Vec::new();
    for &value in values {
        match counts.iter_mut().find(|(v, _)| *v == value) {
            Some((_, count)) => *count += 1,
            None => counts.push((value, 1)),
        }
    }
    let top = counts.iter().map(|&(_, c)| c).max().unwrap_or(0);
    counts
        .into_iter()
        .filter(|&(_, c)| c == top)
        .map(|(v, _)| v)
        .collect()
}

/// Most common value; ties go to the value seen first.
pub fn mode(values: &[f64]) -> Option<f64> {
    multimode(values).first().copied()
}

/// Most common value only when no other value is as common.
pub fn unique_mode(values: &[f64]) -> Option<f64> {
    match multimode(values).as_slice() {
        [single] => Some(*single),
        _ => None,
    }
}

/// Unique mode, falling back to the median when there is none.
pub fn mode_or_median(values: &[f64]) -> Option<(f64, SelectionMethod)> {
    if let Some(value) = unique_mode(values) {
        return Some((value, SelectionMethod::Mode));
    }
    median(values).map(|value| (value, SelectionMethod::Median))
}

/// Sample standard deviation around `center` (n − 1 denominator).
/// `None` with fewer than two values.
pub fn stdev_about(values: &[f64], center: f64) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let ss: f64 = values.iter().map(|v| (v - center).powi(2)).sum();
    Some((ss / (values.len() - 1) as f64).sqrt())
}

/// Applies the configured estimator.
pub fn central(method: CentralMethod, values: &[f64]) -> Option<f64> {
    match method {
        CentralMethod::Mean => mean(values),
        CentralMethod::Median => median(values),
        CentralMethod::Mode => mode(values),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_or_median_prefers_unique_mode() {
        assert_eq!(
            mode_or_median(&[20.10, 20.10, 20.12]),
            Some((20.10, SelectionMethod::Mode))
        );
        assert_eq!(
            mode_or_median(&[20.10, 20.12, 20.14]),
            Some((20.12, SelectionMethod::Median))
        );
        assert_eq!(
            mode_or_median(&[20.38, 20.39, 20.38]),
            Some((20.38, SelectionMethod::Mode))
        );
        assert_eq!(mode_or_median(&[]), None);
    }

    #[test]
    fn tied_modes_fall_back_to_median() {
        assert_eq!(
            mode_or_median(&[1.0, 1.0, 3.0, 3.0]),
            Some((2.0, SelectionMethod::Median))
        );
        // The window estimator still picks the first of the tie.
        assert_eq!(mode(&[3.0, 1.0, 1.0, 3.0]), Some(3.0));
    }

    #[test]
    fn median_of_even_length_averages_middle_values() {
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), Some(2.5));
        assert_eq!(median(&[5.0]), Some(5.0));
    }

    #[test]
    fn stdev_is_computed_about_the_given_center() {
        let values = [1.0, 2.0, 3.0];
        assert_eq!(stdev_about(&values, 2.0), Some(1.0));
        let about_one = stdev_about(&values, 1.0).unwrap();
        assert!((about_one - (5.0f64 / 2.0).sqrt()).abs() < 1e-12);
        assert_eq!(stdev_about(&[1.0], 1.0), None);
        assert_eq!(stdev_about(&[7.0, 7.0, 7.0], 7.0), Some(0.0));
    }

    #[test]
    fn central_dispatches_on_method() {
        let values = [1.0, 2.0, 2.0, 7.0];
        assert_eq!(central(CentralMethod::Mean, &values), Some(3.0));
        assert_eq!(central(CentralMethod::Median, &values), Some(2.0));
        assert_eq!(central(CentralMethod::Mode, &values), Some(2.0));
    }
}
