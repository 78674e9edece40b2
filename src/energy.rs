//! Decay/recovery energy model
//!
//! Heart rate drives an energy balance in percent:
//!
//! - at or below `hr_low` the body recovers, proportional to the distance
//!   below the threshold
//! - at or above `hr_high` energy drains, proportional to the distance above
//!   the threshold and amplified by the HRV multiplier
//! - in between nothing changes
//!
//! Rates are expressed per aggregation interval and integrated with the
//! trapezoid rule. The resulting curve is shifted forward by the configured
//! time offset because exertion shows up in perceived energy with a delay.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use tracing::trace;

use crate::calculus::trapezoidal_integral;
use crate::error::{PacingError, Result};
use crate::hrv::HrvDrainAdjuster;
use crate::models::{EnergyConfig, EnergyDataPoint, EnergyPoint, HrDataPoint, HrvDrainConfig, HrvPoint};

/// Resample heart rate into fixed buckets of `minutes`.
///
/// Each bucket is stamped with its floor timestamp and carries the mean bpm of
/// its samples. Empty buckets are skipped.
pub fn aggregate_heart_rate(hr: &[HrDataPoint], minutes: u32) -> Vec<HrDataPoint> {
    let bucket_seconds = i64::from(minutes.max(1)) * 60;
    let mut buckets: BTreeMap<i64, (f64, usize)> = BTreeMap::new();

    for sample in hr {
        let key = sample.timestamp.timestamp().div_euclid(bucket_seconds) * bucket_seconds;
        let entry = buckets.entry(key).or_insert((0.0, 0));
        entry.0 += sample.bpm;
        entry.1 += 1;
    }

    buckets
        .into_iter()
        .filter_map(|(key, (sum, count))| {
            DateTime::<Utc>::from_timestamp(key, 0)
                .map(|timestamp| HrDataPoint::new(timestamp, sum / count as f64))
        })
        .collect()
}

/// Energy change per aggregation interval at one heart rate sample
pub fn energy_rate(bpm: f64, config: &EnergyConfig, hrv_multiplier: f64) -> f64 {
    if bpm <= config.hr_low {
        config.recovery_factor * (config.hr_low - bpm)
    } else if bpm >= config.hr_high {
        -config.drain_factor * (bpm - config.hr_high) * hrv_multiplier
    } else {
        0.0
    }
}

/// Evaluates the energy curve for a heart rate series
#[derive(Debug, Clone, Default)]
pub struct EnergyModel {
    adjuster: HrvDrainAdjuster,
}

impl EnergyModel {
    pub fn new(hrv_config: HrvDrainConfig) -> Result<Self> {
        Ok(Self {
            adjuster: HrvDrainAdjuster::new(hrv_config)?,
        })
    }

    pub fn adjuster(&self) -> &HrvDrainAdjuster {
        &self.adjuster
    }

    /// Integrate `hr` into an energy curve starting at
    /// `start_energy + config.energy_offset`.
    ///
    /// `hr` is used as given; resample with [`aggregate_heart_rate`] first for
    /// raw sensor streams. Output values are not clamped.
    pub fn evaluate(
        &self,
        hr: &[HrDataPoint],
        hrv: Option<&[HrvPoint]>,
        config: &EnergyConfig,
        start_energy: f64,
    ) -> Result<Vec<EnergyPoint>> {
        config.validate()?;
        if hr.is_empty() {
            return Err(PacingError::insufficient_data(
                "energy curve",
                "empty heart rate series",
            ));
        }

        let multipliers: Vec<f64> = match hrv {
            Some(hrv) if !hrv.is_empty() => {
                let timestamps: Vec<DateTime<Utc>> = hr.iter().map(|p| p.timestamp).collect();
                self.adjuster.multipliers(hrv, &timestamps)
            }
            _ => vec![self.adjuster.config().normal_hrv_multiplier; hr.len()],
        };

        let interval = f64::from(config.aggregation_minutes);
        let scales = interval_scales(hr, interval);
        let rates: Vec<f64> = hr
            .iter()
            .zip(&multipliers)
            .zip(&scales)
            .map(|((sample, multiplier), scale)| energy_rate(sample.bpm, config, *multiplier) * scale)
            .collect();

        let energies = trapezoidal_integral(&rates, start_energy + config.energy_offset)?;
        let shift = Duration::minutes(i64::from(config.time_offset_minutes));

        trace!(
            samples = hr.len(),
            start = start_energy,
            end = energies.last().copied().unwrap_or(start_energy),
            "evaluated energy curve"
        );

        Ok(hr
            .iter()
            .zip(energies)
            .zip(multipliers)
            .map(|((sample, energy), hrv_multiplier)| EnergyPoint {
                timestamp: sample.timestamp + shift,
                energy,
                hrv_multiplier,
            })
            .collect())
    }

    /// Evaluate with restarts at validated entries.
    ///
    /// A validated entry at `t` anchors the heart rate sample at
    /// `t - time_offset`, and integration restarts there from the validated
    /// percentage. The first segment starts from the last validated entry at
    /// or before the series start, or from `fallback_start`.
    pub fn evaluate_anchored(
        &self,
        hr: &[HrDataPoint],
        hrv: Option<&[HrvPoint]>,
        config: &EnergyConfig,
        validated: &[EnergyDataPoint],
        fallback_start: f64,
    ) -> Result<Vec<EnergyPoint>> {
        config.validate()?;
        let (first, last) = match (hr.first(), hr.last()) {
            (Some(first), Some(last)) => (first.timestamp, last.timestamp),
            _ => {
                return Err(PacingError::insufficient_data(
                    "anchored energy curve",
                    "empty heart rate series",
                ))
            }
        };

        let shift = Duration::minutes(i64::from(config.time_offset_minutes));
        let mut sorted: Vec<&EnergyDataPoint> =
            validated.iter().filter(|v| v.is_validated()).collect();
        sorted.sort_by_key(|v| v.timestamp);

        let initial = sorted
            .iter()
            .filter(|v| v.timestamp - shift <= first)
            .last()
            .map(|v| v.percentage)
            .unwrap_or(fallback_start);

        let mut anchors = vec![(first, initial)];
        anchors.extend(
            sorted
                .iter()
                .map(|v| (v.timestamp - shift, v.percentage))
                .filter(|(at, _)| *at > first && *at <= last),
        );

        let mut curve = Vec::with_capacity(hr.len());
        for (i, (start, energy)) in anchors.iter().enumerate() {
            let end = anchors.get(i + 1).map(|(next, _)| *next);
            let begin = hr.partition_point(|p| p.timestamp < *start);
            let stop = match end {
                Some(end) => hr.partition_point(|p| p.timestamp < end),
                None => hr.len(),
            };
            if begin >= stop {
                continue;
            }
            curve.extend(self.evaluate(&hr[begin..stop], hrv, config, *energy)?);
        }

        Ok(curve)
    }
}

/// Nearest curve value to `at`, if one lies within `tolerance`.
///
/// `curve` must be time-sorted.
pub fn sample_at(curve: &[EnergyPoint], at: DateTime<Utc>, tolerance: Duration) -> Option<f64> {
    let idx = curve.partition_point(|p| p.timestamp < at);
    let before = idx.checked_sub(1).and_then(|i| curve.get(i));
    let after = curve.get(idx);

    let nearest = match (before, after) {
        (Some(b), Some(a)) => {
            if at - b.timestamp <= a.timestamp - at {
                b
            } else {
                a
            }
        }
        (Some(b), None) => b,
        (None, Some(a)) => a,
        (None, None) => return None,
    };

    let distance = if nearest.timestamp > at {
        nearest.timestamp - at
    } else {
        at - nearest.timestamp
    };
    if distance <= tolerance {
        Some(nearest.energy)
    } else {
        None
    }
}

/// Elapsed time per sample in aggregation intervals. The first sample borrows
/// the spacing to its successor.
fn interval_scales(hr: &[HrDataPoint], interval: f64) -> Vec<f64> {
    let gaps: Vec<f64> = hr
        .windows(2)
        .map(|w| (w[1].timestamp - w[0].timestamp).num_seconds() as f64 / 60.0 / interval)
        .collect();

    let mut scales = Vec::with_capacity(hr.len());
    scales.push(gaps.first().copied().unwrap_or(1.0));
    scales.extend(gaps);
    scales
}
