//! Time-of-day decay rate estimation
//!
//! Used when there is too little validated data to run the optimizer. Rates
//! are reported in percent (or bpm) per hour, positive meaning loss, and
//! grouped into four local-time buckets:
//!
//! | bucket    | hours       |
//! |-----------|-------------|
//! | morning   | 06:00-12:00 |
//! | afternoon | 12:00-18:00 |
//! | evening   | 18:00-22:00 |
//! | night     | 22:00-06:00 |
//!
//! Nothing in this module returns an error; missing data shows up as absent
//! bucket values.

use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::calculus::discrete_derivative;
use crate::energy::{aggregate_heart_rate, energy_rate};
use crate::models::{DecayRateResult, EnergyConfig, EnergyDataPoint, HrDataPoint};
use crate::stats::{mean, median};

/// Consecutive validated pairs needed for a personal rate
const MIN_PAIRS_TOTAL: usize = 5;
const MIN_PAIRS_PER_BUCKET: usize = 3;
const MIN_PAIR_HOURS: f64 = 0.1;
const MAX_PAIR_HOURS: f64 = 12.0;

/// Decay analyzer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecayConfig {
    /// Buckets with fewer samples are reported as absent
    pub min_samples_per_bucket: usize,

    /// Resampling granularity when no energy configuration is given
    pub aggregation_minutes: u32,

    /// Local time offset for bucket assignment
    pub utc_offset_minutes: i32,

    /// Assumed loss in % per hour without enough history
    pub default_hourly_decay: f64,
}

impl Default for DecayConfig {
    fn default() -> Self {
        DecayConfig {
            min_samples_per_bucket: 1,
            aggregation_minutes: 15,
            utc_offset_minutes: 0,
            default_hourly_decay: 3.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bucket {
    Morning,
    Afternoon,
    Evening,
    Night,
}

impl Bucket {
    fn of_hour(hour: u32) -> Self {
        match hour {
            6..=11 => Bucket::Morning,
            12..=17 => Bucket::Afternoon,
            18..=21 => Bucket::Evening,
            _ => Bucket::Night,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DecayRateAnalyzer {
    config: DecayConfig,
}

impl Default for DecayRateAnalyzer {
    fn default() -> Self {
        Self::new(DecayConfig::default())
    }
}

impl DecayRateAnalyzer {
    pub fn new(config: DecayConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DecayConfig {
        &self.config
    }

    /// Bucketed rates from a heart rate stream.
    ///
    /// With an energy configuration each sample contributes the model's
    /// energy loss per hour. Without one the resampled heart rate trend in
    /// bpm per hour is used instead.
    pub fn analyze(&self, hr: &[HrDataPoint], energy: Option<&EnergyConfig>) -> DecayRateResult {
        let energy = match energy {
            Some(config) => match config.validate() {
                Ok(()) => Some(config),
                Err(e) => {
                    warn!("Ignoring invalid energy configuration for decay analysis: {}", e);
                    None
                }
            },
            None => None,
        };

        let samples = match energy {
            Some(config) => self.model_rates(hr, config),
            None => self.trend_rates(hr),
        };

        debug!(samples = samples.len(), model = energy.is_some(), "decay analysis");
        self.summarize(&samples, mean, self.config.min_samples_per_bucket, None)
    }

    /// Personal rates from consecutive validated energy entries.
    ///
    /// Model-predicted entries are ignored. Pairs closer than 6 minutes or
    /// further than 12 hours apart are skipped. Bucket rates need at least 3
    /// pairs; fewer than 5 pairs overall yield the default rate.
    pub fn from_validated_energy(&self, entries: &[EnergyDataPoint]) -> DecayRateResult {
        let mut sorted: Vec<&EnergyDataPoint> =
            entries.iter().filter(|e| e.is_validated()).collect();
        sorted.sort_by_key(|e| e.timestamp);

        let pairs: Vec<(DateTime<Utc>, f64)> = sorted
            .windows(2)
            .filter_map(|w| {
                let hours = (w[1].timestamp - w[0].timestamp).num_seconds() as f64 / 3600.0;
                if !(MIN_PAIR_HOURS..=MAX_PAIR_HOURS).contains(&hours) {
                    return None;
                }
                let midpoint = w[0].timestamp + (w[1].timestamp - w[0].timestamp) / 2;
                Some((midpoint, (w[0].percentage - w[1].percentage) / hours))
            })
            .collect();

        if pairs.len() < MIN_PAIRS_TOTAL {
            debug!(pairs = pairs.len(), "too few validated pairs, using default decay");
            return self.default_rate();
        }

        self.summarize(&pairs, median, MIN_PAIRS_PER_BUCKET, Some((-10.0, 15.0)))
    }

    /// Result carrying only the default hourly decay
    pub fn default_rate(&self) -> DecayRateResult {
        DecayRateResult {
            average_hourly_decay: Some(self.config.default_hourly_decay),
            morning_decay_rate: None,
            afternoon_decay_rate: None,
            evening_decay_rate: None,
            night_recovery_rate: None,
            data_points_used: 0,
        }
    }

    /// Rate for a local hour, falling back to the average and then the
    /// default decay
    pub fn decay_for_hour(&self, result: &DecayRateResult, hour: u32) -> f64 {
        let bucket = match Bucket::of_hour(hour % 24) {
            Bucket::Morning => result.morning_decay_rate,
            Bucket::Afternoon => result.afternoon_decay_rate,
            Bucket::Evening => result.evening_decay_rate,
            Bucket::Night => result.night_recovery_rate,
        };
        bucket
            .or(result.average_hourly_decay)
            .unwrap_or(self.config.default_hourly_decay)
    }

    /// Project the last known energy to `now` and two hours beyond.
    ///
    /// Both values are clamped to 0-100.
    pub fn predict_with_decay(
        &self,
        last_energy: f64,
        last_time: DateTime<Utc>,
        now: DateTime<Utc>,
        result: &DecayRateResult,
    ) -> (f64, f64) {
        let elapsed_hours = (now - last_time).num_seconds() as f64 / 3600.0;
        let hour = self.local_hour(now);

        let current =
            (last_energy - self.decay_for_hour(result, hour) * elapsed_hours).clamp(0.0, 100.0);
        let future = (current - self.decay_for_hour(result, hour + 2) * 2.0).clamp(0.0, 100.0);

        (current, future)
    }

    fn model_rates(&self, hr: &[HrDataPoint], config: &EnergyConfig) -> Vec<(DateTime<Utc>, f64)> {
        let per_hour = 60.0 / f64::from(config.aggregation_minutes);
        aggregate_heart_rate(hr, config.aggregation_minutes)
            .iter()
            .map(|p| (p.timestamp, -energy_rate(p.bpm, config, 1.0) * per_hour))
            .collect()
    }

    fn trend_rates(&self, hr: &[HrDataPoint]) -> Vec<(DateTime<Utc>, f64)> {
        let samples = aggregate_heart_rate(hr, self.config.aggregation_minutes);
        let bpms: Vec<f64> = samples.iter().map(|p| p.bpm).collect();

        let derivative = match discrete_derivative(&bpms) {
            Ok(d) => d,
            Err(_) => return Vec::new(),
        };

        // the derivative is scaled by two from three samples on
        let scale = if bpms.len() == 2 { 1.0 } else { 0.5 };
        let per_hour = 60.0 / f64::from(self.config.aggregation_minutes.max(1));

        samples
            .iter()
            .zip(derivative)
            .map(|(p, d)| (p.timestamp, d * scale * per_hour))
            .collect()
    }

    fn summarize(
        &self,
        samples: &[(DateTime<Utc>, f64)],
        reduce: fn(&[f64]) -> Option<f64>,
        min_per_bucket: usize,
        average_bounds: Option<(f64, f64)>,
    ) -> DecayRateResult {
        let bucket_rate = |bucket: Bucket| {
            let values: Vec<f64> = samples
                .iter()
                .filter(|(t, _)| Bucket::of_hour(self.local_hour(*t)) == bucket)
                .map(|(_, v)| *v)
                .collect();
            if values.len() < min_per_bucket.max(1) {
                None
            } else {
                reduce(&values)
            }
        };

        let all: Vec<f64> = samples.iter().map(|(_, v)| *v).collect();
        let average = reduce(&all).map(|v| match average_bounds {
            Some((lo, hi)) => v.clamp(lo, hi),
            None => v,
        });

        DecayRateResult {
            average_hourly_decay: average,
            morning_decay_rate: bucket_rate(Bucket::Morning),
            afternoon_decay_rate: bucket_rate(Bucket::Afternoon),
            evening_decay_rate: bucket_rate(Bucket::Evening),
            night_recovery_rate: bucket_rate(Bucket::Night),
            data_points_used: samples.len(),
        }
    }

    fn local_hour(&self, at: DateTime<Utc>) -> u32 {
        (at + Duration::minutes(i64::from(self.config.utc_offset_minutes))).hour()
    }
}
