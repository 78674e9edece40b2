//! Discrete calculus on uniformly sampled sequences
//!
//! Both primitives assume unit spacing between samples. Callers that need a
//! physical rate divide by the real sample interval themselves.

use crate::error::{PacingError, Result};

/// Second-order accurate derivative of a uniformly sampled sequence.
///
/// - interior points: `x[i+1] - x[i-1]`
/// - first point: `-3*x[0] + 4*x[1] - x[2]`
/// - last point: `3*x[n-1] - 4*x[n-2] + x[n-3]`
///
/// The division by two is omitted, so for three or more samples the result is
/// twice the slope per sample. Two samples yield the plain first difference
/// at both positions.
pub fn discrete_derivative(samples: &[f64]) -> Result<Vec<f64>> {
    let n = samples.len();
    if n < 2 {
        return Err(PacingError::insufficient_data(
            "discrete derivative",
            format!("need at least 2 samples, got {}", n),
        ));
    }

    if n == 2 {
        let slope = samples[1] - samples[0];
        return Ok(vec![slope, slope]);
    }

    let mut derivative = vec![0.0; n];
    derivative[0] = -3.0 * samples[0] + 4.0 * samples[1] - samples[2];
    derivative[n - 1] = 3.0 * samples[n - 1] - 4.0 * samples[n - 2] + samples[n - 3];
    for i in 1..n - 1 {
        derivative[i] = samples[i + 1] - samples[i - 1];
    }

    Ok(derivative)
}

/// Cumulative trapezoidal integral starting at `initial_offset`.
///
/// `out[0] = initial_offset`, `out[i] = out[i-1] + 0.5 * (x[i-1] + x[i])`.
pub fn trapezoidal_integral(samples: &[f64], initial_offset: f64) -> Result<Vec<f64>> {
    if samples.is_empty() {
        return Err(PacingError::insufficient_data(
            "trapezoidal integral",
            "need at least 1 sample",
        ));
    }

    let mut integral = Vec::with_capacity(samples.len());
    let mut sum = initial_offset;
    integral.push(sum);
    for window in samples.windows(2) {
        sum += 0.5 * (window[0] + window[1]);
        integral.push(sum);
    }

    Ok(integral)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_derivative_two_samples() {
        let d = discrete_derivative(&[3.0, 7.5]).unwrap();
        assert_eq!(d, vec![4.5, 4.5]);
    }

    #[test]
    fn test_derivative_rejects_single_sample() {
        assert!(discrete_derivative(&[1.0]).is_err());
        assert!(discrete_derivative(&[]).is_err());
    }

    #[test]
    fn test_derivative_of_line_is_exact() {
        // slope 2 per sample, scaled by 2
        let line: Vec<f64> = (0..6).map(|i| 1.0 + 2.0 * i as f64).collect();
        let d = discrete_derivative(&line).unwrap();
        for value in d {
            assert!((value - 4.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_derivative_of_parabola_boundaries() {
        // x^2 sampled at 0..5: true slope 2x, scaled result 4x
        let parabola: Vec<f64> = (0..5).map(|i| (i * i) as f64).collect();
        let d = discrete_derivative(&parabola).unwrap();
        assert!((d[0] - 0.0).abs() < 1e-12);
        assert!((d[2] - 8.0).abs() < 1e-12);
        assert!((d[4] - 16.0).abs() < 1e-12);
    }

    #[test]
    fn test_integral_with_offset() {
        let out = trapezoidal_integral(&[1.0, 1.0, 1.0], 50.0).unwrap();
        assert_eq!(out, vec![50.0, 51.0, 52.0]);

        let single = trapezoidal_integral(&[9.0], 3.0).unwrap();
        assert_eq!(single, vec![3.0]);

        assert!(trapezoidal_integral(&[], 0.0).is_err());
    }

    #[test]
    fn test_integral_inverts_derivative_on_smooth_input() {
        let dt = 0.01;
        let signal: Vec<f64> = (0..400).map(|i| (i as f64 * dt).sin()).collect();

        // derivative is 2 * slope per sample, integral is per sample
        let d = discrete_derivative(&signal).unwrap();
        let half: Vec<f64> = d.iter().map(|v| v * 0.5).collect();
        let rebuilt = trapezoidal_integral(&half, signal[0]).unwrap();

        for (original, recovered) in signal.iter().zip(&rebuilt) {
            assert!(
                (original - recovered).abs() < 1e-3,
                "round trip drifted: {} vs {}",
                original,
                recovered
            );
        }
    }

    proptest! {
        #[test]
        fn test_integral_preserves_length_and_offset(
            values in prop::collection::vec(-100.0f64..100.0, 1..64),
            offset in -50.0f64..50.0
        ) {
            let out = trapezoidal_integral(&values, offset).unwrap();
            prop_assert_eq!(out.len(), values.len());
            prop_assert_eq!(out[0], offset);
        }

        #[test]
        fn test_derivative_of_constant_is_zero(
            value in -1000.0f64..1000.0,
            len in 2usize..64
        ) {
            let d = discrete_derivative(&vec![value; len]).unwrap();
            prop_assert!(d.iter().all(|v| v.abs() < 1e-9));
        }

        #[test]
        fn test_round_trip_on_smooth_quadratics(
            a in -1.0f64..1.0,
            b in -5.0f64..5.0,
            c in -10.0f64..10.0
        ) {
            // trapezoid rule on the exact-for-quadratics derivative stays within O(dt^2)
            let dt = 0.05;
            let signal: Vec<f64> = (0..100)
                .map(|i| {
                    let t = i as f64 * dt;
                    a * t * t + b * t + c
                })
                .collect();
            let d = discrete_derivative(&signal).unwrap();
            let half: Vec<f64> = d.iter().map(|v| v * 0.5).collect();
            let rebuilt = trapezoidal_integral(&half, signal[0]).unwrap();
            for (original, recovered) in signal.iter().zip(&rebuilt) {
                prop_assert!((original - recovered).abs() < 1e-6 + 10.0 * dt * dt);
            }
        }
    }
}
