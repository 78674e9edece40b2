//! HRV-based drain adjustment
//!
//! Low heart rate variability relative to the personal baseline indicates
//! sympathetic (stress) dominance, so the same heart rate drains more energy.
//! High HRV indicates a relaxed state and drains less.
//!
//! For every prediction timestamp two trailing means of rMSSD are compared:
//!
//! - the **window mean** over the last `window_seconds`
//! - the **baseline mean** over the last `baseline_window_hours`
//!
//! ratio = window / baseline. Below `low_threshold` the low-HRV multiplier
//! applies, above `high_threshold` the high-HRV multiplier. In between the
//! multiplier moves linearly from the normal multiplier at ratio 1.0 towards
//! the nearer bound, so the curve is continuous at both thresholds.

use chrono::{DateTime, Duration, Utc};

use crate::error::Result;
use crate::models::{HrDataPoint, HrvDrainConfig, HrvPoint};

/// Computes drain multipliers from an HRV stream
#[derive(Debug, Clone)]
pub struct HrvDrainAdjuster {
    config: HrvDrainConfig,
}

impl Default for HrvDrainAdjuster {
    fn default() -> Self {
        Self {
            config: HrvDrainConfig::default(),
        }
    }
}

impl HrvDrainAdjuster {
    /// Create an adjuster, rejecting configurations that break the
    /// multiplier ordering
    pub fn new(config: HrvDrainConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &HrvDrainConfig {
        &self.config
    }

    /// Multiplier for one ratio of current to baseline HRV
    pub fn multiplier_for_ratio(&self, ratio: f64) -> f64 {
        let c = &self.config;
        if !ratio.is_finite() {
            return c.normal_hrv_multiplier;
        }

        if ratio < c.low_threshold {
            c.low_hrv_multiplier
        } else if ratio > c.high_threshold {
            c.high_hrv_multiplier
        } else if ratio <= 1.0 {
            let position = (1.0 - ratio) / (1.0 - c.low_threshold);
            c.normal_hrv_multiplier + (c.low_hrv_multiplier - c.normal_hrv_multiplier) * position
        } else {
            let position = (ratio - 1.0) / (c.high_threshold - 1.0);
            c.normal_hrv_multiplier + (c.high_hrv_multiplier - c.normal_hrv_multiplier) * position
        }
    }

    /// Multiplier at `at`, using only HRV samples at or before it.
    ///
    /// `hrv` must be time-sorted. Missing data in either window yields the
    /// normal multiplier.
    pub fn multiplier_at(&self, hrv: &[HrvPoint], at: DateTime<Utc>) -> f64 {
        let window = Duration::seconds(i64::from(self.config.window_seconds));
        let baseline_window = Duration::hours(i64::from(self.config.baseline_window_hours));

        let current = trailing_mean(hrv, at, window);
        let baseline = trailing_mean(hrv, at, baseline_window);

        match (current, baseline) {
            (Some(current), Some(baseline)) if baseline > 0.0 => {
                self.multiplier_for_ratio(current / baseline)
            }
            _ => self.config.normal_hrv_multiplier,
        }
    }

    /// One multiplier per timestamp
    pub fn multipliers(&self, hrv: &[HrvPoint], timestamps: &[DateTime<Utc>]) -> Vec<f64> {
        timestamps
            .iter()
            .map(|t| self.multiplier_at(hrv, *t))
            .collect()
    }
}

/// Mean rMSSD of samples in `(at - window, at]`
fn trailing_mean(hrv: &[HrvPoint], at: DateTime<Utc>, window: Duration) -> Option<f64> {
    let start = at - window;
    let end = hrv.partition_point(|p| p.timestamp <= at);
    let begin = hrv[..end].partition_point(|p| p.timestamp <= start);
    let slice = &hrv[begin..end];
    if slice.is_empty() {
        return None;
    }
    Some(slice.iter().map(|p| p.rmssd).sum::<f64>() / slice.len() as f64)
}

/// Rough rMSSD proxy from successive heart rate differences.
///
/// Minute-level heart rate cannot resolve beat-to-beat intervals, so this is
/// only a stand-in for devices that export no HRV stream. Each sample gets the
/// root mean square of successive bpm differences in its trailing
/// `window_minutes`; windows with fewer than 3 samples and implausible values
/// (>= 50) are skipped.
pub fn approximate_rmssd_from_heart_rate(hr: &[HrDataPoint], window_minutes: u32) -> Vec<HrvPoint> {
    if hr.len() < 5 {
        return Vec::new();
    }

    let window = Duration::minutes(i64::from(window_minutes));
    let mut points = Vec::new();

    for (i, sample) in hr.iter().enumerate() {
        let start = sample.timestamp - window;
        let begin = hr[..=i].partition_point(|p| p.timestamp <= start);
        let values: Vec<f64> = hr[begin..=i].iter().map(|p| p.bpm).collect();
        if values.len() < 3 {
            continue;
        }

        let sum_squared: f64 = values.windows(2).map(|w| (w[1] - w[0]).powi(2)).sum();
        let rmssd = (sum_squared / (values.len() - 1) as f64).sqrt();
        if (0.0..50.0).contains(&rmssd) {
            points.push(HrvPoint::new(sample.timestamp, rmssd));
        }
    }

    points
}
