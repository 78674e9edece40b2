//! Robust statistics used to collapse per-day fits and scale series

use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, Median, OrderStatistics, Statistics};

/// Median of `values`, `None` when empty.
///
/// Odd-length input returns the middle element itself, never an interpolated
/// value.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(Median::median(&Data::new(values.to_vec())))
}

/// Arithmetic mean, `None` when empty
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().mean())
    }
}

/// Mean of the values inside the inter-quartile range [Q1, Q3].
///
/// Fewer than four values cannot be trimmed meaningfully and fall back to the
/// median.
pub fn iqr_mean(values: &[f64]) -> Option<f64> {
    if values.len() < 4 {
        return median(values);
    }

    let mut data = Data::new(values.to_vec());
    let q1 = data.lower_quartile();
    let q3 = data.upper_quartile();

    let kept: Vec<f64> = values
        .iter()
        .copied()
        .filter(|v| *v >= q1 && *v <= q3)
        .collect();

    mean(&kept).or_else(|| median(values))
}

/// Mean and population standard deviation of a series
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Distribution {
    pub mean: f64,
    pub stddev: f64,
}

impl Distribution {
    pub fn of(values: &[f64]) -> Self {
        if values.is_empty() {
            return Distribution {
                mean: 0.0,
                stddev: 0.0,
            };
        }
        Distribution {
            mean: values.iter().mean(),
            stddev: values.iter().population_std_dev(),
        }
    }
}

/// Scale `values` to zero mean and unit deviation.
///
/// A constant series maps to all zeros.
pub fn normalize(values: &[f64]) -> (Vec<f64>, Distribution) {
    let distribution = Distribution::of(values);
    let normalized = values
        .iter()
        .map(|v| {
            if distribution.stddev > 0.0 {
                (v - distribution.mean) / distribution.stddev
            } else {
                0.0
            }
        })
        .collect();
    (normalized, distribution)
}

/// Inverse of [`normalize`]
pub fn denormalize(values: &[f64], distribution: &Distribution) -> Vec<f64> {
    values
        .iter()
        .map(|v| v * distribution.stddev + distribution.mean)
        .collect()
}
