use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PacingError, Result};

/// Raw heart rate sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HrDataPoint {
    pub timestamp: DateTime<Utc>,

    /// Heart rate in beats per minute
    pub bpm: f64,
}

impl HrDataPoint {
    pub fn new(timestamp: DateTime<Utc>, bpm: f64) -> Self {
        Self { timestamp, bpm }
    }
}

/// Heart rate variability sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HrvPoint {
    pub timestamp: DateTime<Utc>,

    /// Root mean square of successive differences in milliseconds
    pub rmssd: f64,
}

impl HrvPoint {
    pub fn new(timestamp: DateTime<Utc>, rmssd: f64) -> Self {
        Self { timestamp, rmssd }
    }
}

/// How a user confirmed an energy reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Validation {
    /// The displayed value was confirmed as correct
    Correct,
    /// The user corrected the displayed value
    Adjusted,
}

impl std::str::FromStr for Validation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "correct" | "validated" => Ok(Validation::Correct),
            "adjusted" => Ok(Validation::Adjusted),
            _ => Err(format!("Invalid validation tag: {}", s)),
        }
    }
}

/// Energy level entry, either model output or user ground truth
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnergyDataPoint {
    pub timestamp: DateTime<Utc>,

    /// Energy on the 0-100 scale, may overshoot transiently
    pub percentage: f64,

    /// Present only for ground truth entries
    pub validation: Option<Validation>,
}

impl EnergyDataPoint {
    /// Create a validated (ground truth) entry
    pub fn validated(timestamp: DateTime<Utc>, percentage: f64) -> Self {
        Self {
            timestamp,
            percentage,
            validation: Some(Validation::Correct),
        }
    }

    pub fn is_validated(&self) -> bool {
        self.validation.is_some()
    }
}

/// Tunable parameters of the decay/recovery model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnergyConfig {
    /// Below this heart rate energy recovers
    pub hr_low: f64,

    /// Above this heart rate energy drains
    pub hr_high: f64,

    /// Lag before heart rate shows up in the energy curve
    pub time_offset_minutes: u32,

    /// Recovery in % per aggregation interval per bpm below `hr_low`
    pub recovery_factor: f64,

    /// Drain in % per aggregation interval per bpm above `hr_high`
    pub drain_factor: f64,

    /// Resampling granularity of the heart rate stream
    pub aggregation_minutes: u32,

    /// Additive bias applied to the starting energy
    pub energy_offset: f64,
}

impl Default for EnergyConfig {
    fn default() -> Self {
        EnergyConfig {
            hr_low: 60.0,
            hr_high: 75.0,
            time_offset_minutes: 120,
            recovery_factor: 0.86,
            drain_factor: 0.06,
            aggregation_minutes: 15,
            energy_offset: 0.0,
        }
    }
}

impl EnergyConfig {
    /// Check parameter bounds
    pub fn validate(&self) -> Result<()> {
        if !(self.hr_low < self.hr_high) {
            return Err(PacingError::invalid_config(
                "hr_low",
                self.hr_low,
                format!("must be below hr_high ({})", self.hr_high),
            ));
        }
        if !(self.drain_factor > 0.0) {
            return Err(PacingError::invalid_config(
                "drain_factor",
                self.drain_factor,
                "must be positive",
            ));
        }
        if !(self.recovery_factor > 0.0) {
            return Err(PacingError::invalid_config(
                "recovery_factor",
                self.recovery_factor,
                "must be positive",
            ));
        }
        if self.aggregation_minutes == 0 {
            return Err(PacingError::invalid_config(
                "aggregation_minutes",
                0,
                "must be at least one minute",
            ));
        }
        Ok(())
    }

    /// Copy of this configuration with the fitted parameters of `fit`
    pub fn with_fit(&self, fit: &OptimizationResult) -> Self {
        EnergyConfig {
            hr_low: fit.hr_low,
            hr_high: fit.hr_high,
            drain_factor: fit.drain_factor,
            recovery_factor: fit.recovery_factor,
            energy_offset: fit.energy_offset,
            ..self.clone()
        }
    }
}

/// One sample of the modelled energy curve
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnergyPoint {
    /// Heart rate timestamp shifted by the configured time offset
    pub timestamp: DateTime<Utc>,

    /// Unclamped energy percentage
    pub energy: f64,

    /// Drain multiplier applied at this sample
    pub hrv_multiplier: f64,
}

impl EnergyPoint {
    /// Energy limited to the displayable 0-100 range
    pub fn clamped(&self) -> f64 {
        self.energy.clamp(0.0, 100.0)
    }
}

/// One optimizable interval, typically a waking day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleData {
    pub label: String,
    pub cycle_start: DateTime<Utc>,
    pub cycle_end: DateTime<Utc>,
    pub validated_points: Vec<EnergyDataPoint>,
    pub hr_data: Vec<HrDataPoint>,

    /// Initial condition of the integration
    pub start_energy: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SleepPhase {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl SleepPhase {
    pub fn duration_minutes(&self) -> f64 {
        (self.end - self.start).num_seconds() as f64 / 60.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WakeEvent {
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SleepCycle {
    pub cycle_start: DateTime<Utc>,
    pub cycle_end: DateTime<Utc>,

    /// Local date of the cycle start (YYYY-MM-DD)
    pub label: String,
}

/// Sleep detector configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SleepConfig {
    /// Heart rate at or below which time counts towards sleep onset
    pub sleep_hr_threshold: f64,

    /// Heart rate at or above which a sleeper is considered waking
    pub wake_hr_threshold: f64,

    /// Accumulated low heart rate time needed to fall asleep
    pub min_sleep_minutes: u32,

    /// Start a new cycle at every wake event instead of at local midnight
    pub reset_on_wake: bool,

    /// Wake-level stretches up to this long do not reset sleep onset progress
    pub spike_tolerance_minutes: u32,

    /// Time after the wake crossing before the wake is confirmed
    pub wake_confirm_minutes: u32,

    /// Resampling granularity of the heart rate stream
    pub aggregation_minutes: u32,

    /// Local time offset used for midnight boundaries and labels
    pub utc_offset_minutes: i32,
}

impl Default for SleepConfig {
    fn default() -> Self {
        SleepConfig {
            sleep_hr_threshold: 62.0,
            wake_hr_threshold: 70.0,
            min_sleep_minutes: 200,
            reset_on_wake: false,
            spike_tolerance_minutes: 15,
            wake_confirm_minutes: 15,
            aggregation_minutes: 15,
            utc_offset_minutes: 0,
        }
    }
}

impl SleepConfig {
    pub fn validate(&self) -> Result<()> {
        if self.sleep_hr_threshold > self.wake_hr_threshold {
            return Err(PacingError::invalid_config(
                "sleep_hr_threshold",
                self.sleep_hr_threshold,
                format!(
                    "must not exceed wake_hr_threshold ({})",
                    self.wake_hr_threshold
                ),
            ));
        }
        if self.aggregation_minutes == 0 {
            return Err(PacingError::invalid_config(
                "aggregation_minutes",
                0,
                "must be at least one minute",
            ));
        }
        if self.utc_offset_minutes.abs() >= 24 * 60 {
            return Err(PacingError::invalid_config(
                "utc_offset_minutes",
                self.utc_offset_minutes,
                "must be within one day",
            ));
        }
        Ok(())
    }
}

/// HRV drain multiplier configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HrvDrainConfig {
    /// Trailing window for the current rMSSD mean
    pub window_seconds: u32,

    /// Trailing window for the baseline rMSSD mean
    pub baseline_window_hours: u32,

    /// Multiplier when HRV is well below baseline (stress)
    pub low_hrv_multiplier: f64,

    /// Multiplier at baseline HRV
    pub normal_hrv_multiplier: f64,

    /// Multiplier when HRV is well above baseline (relaxed)
    pub high_hrv_multiplier: f64,

    /// Ratio below which the low multiplier applies
    pub low_threshold: f64,

    /// Ratio above which the high multiplier applies
    pub high_threshold: f64,
}

impl Default for HrvDrainConfig {
    fn default() -> Self {
        HrvDrainConfig {
            window_seconds: 300,
            baseline_window_hours: 24,
            low_hrv_multiplier: 1.5,
            normal_hrv_multiplier: 1.0,
            high_hrv_multiplier: 0.5,
            low_threshold: 0.7,
            high_threshold: 1.3,
        }
    }
}

impl HrvDrainConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.low_hrv_multiplier >= self.normal_hrv_multiplier
            && self.normal_hrv_multiplier >= self.high_hrv_multiplier)
        {
            return Err(PacingError::invalid_config(
                "hrv_multipliers",
                format!(
                    "{}/{}/{}",
                    self.low_hrv_multiplier, self.normal_hrv_multiplier, self.high_hrv_multiplier
                ),
                "low HRV must drain at least as much as normal, normal at least as much as high",
            ));
        }
        if !(self.low_threshold < 1.0 && 1.0 < self.high_threshold) {
            return Err(PacingError::invalid_config(
                "hrv_thresholds",
                format!("{}/{}", self.low_threshold, self.high_threshold),
                "thresholds must bracket a ratio of 1.0",
            ));
        }
        if self.window_seconds == 0 || self.baseline_window_hours == 0 {
            return Err(PacingError::invalid_config(
                "hrv_windows",
                format!("{}s/{}h", self.window_seconds, self.baseline_window_hours),
                "windows must be non-empty",
            ));
        }
        Ok(())
    }
}

/// Hourly decay estimates, positive values mean energy loss
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecayRateResult {
    pub average_hourly_decay: Option<f64>,

    /// 06:00-12:00
    pub morning_decay_rate: Option<f64>,

    /// 12:00-18:00
    pub afternoon_decay_rate: Option<f64>,

    /// 18:00-22:00
    pub evening_decay_rate: Option<f64>,

    /// 22:00-06:00, negative values mean recovery
    pub night_recovery_rate: Option<f64>,

    pub data_points_used: usize,
}

/// Fitted model parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub hr_low: f64,
    pub hr_high: f64,
    pub drain_factor: f64,
    pub recovery_factor: f64,
    pub energy_offset: f64,

    /// Mean squared error against validated points, lower is better
    pub loss: f64,
}

/// Fit of a single cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DayFitResult {
    pub hr_low: f64,
    pub hr_high: f64,
    pub drain_factor: f64,
    pub recovery_factor: f64,
    pub energy_offset: f64,
    pub loss: f64,

    /// Cycle label
    pub date: String,

    /// Validated points the fit was scored against
    pub data_points: usize,
}

impl DayFitResult {
    pub fn from_result(result: OptimizationResult, date: String, data_points: usize) -> Self {
        DayFitResult {
            hr_low: result.hr_low,
            hr_high: result.hr_high,
            drain_factor: result.drain_factor,
            recovery_factor: result.recovery_factor,
            energy_offset: result.energy_offset,
            loss: result.loss,
            date,
            data_points,
        }
    }

    pub fn as_result(&self) -> OptimizationResult {
        OptimizationResult {
            hr_low: self.hr_low,
            hr_high: self.hr_high,
            drain_factor: self.drain_factor,
            recovery_factor: self.recovery_factor,
            energy_offset: self.energy_offset,
            loss: self.loss,
        }
    }
}

/// Aggregated fit over a range of cycles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoFitResult {
    pub result: OptimizationResult,

    /// Used days in chronological order
    pub day_results: Vec<DayFitResult>,
    pub used_days: usize,
    pub total_days: usize,
}

/// Where a prediction came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictionSource {
    /// Anchored model curve over recent heart rate
    Curve,
    /// Last validated entry projected with hourly decay rates
    Decay,
}

/// Energy now and at the end of the prediction horizon, both 0-100
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub time: DateTime<Utc>,
    pub energy_now: f64,
    pub time_future: DateTime<Utc>,
    pub energy_future: f64,
    pub source: PredictionSource,
}

/// Historical window fed into AutoFit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FitRange {
    All,
    Month,
    Week,
}

impl FitRange {
    /// Window length in days, `None` for everything
    pub fn days(&self) -> Option<i64> {
        match self {
            FitRange::All => None,
            FitRange::Month => Some(30),
            FitRange::Week => Some(7),
        }
    }
}

impl std::str::FromStr for FitRange {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "all" => Ok(FitRange::All),
            "month" => Ok(FitRange::Month),
            "week" => Ok(FitRange::Week),
            _ => Err(format!("Invalid fit range: {}", s)),
        }
    }
}

/// How per-day parameters collapse into one configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationMethod {
    /// Per-parameter median
    Median,
    /// Per-parameter mean of the values inside [Q1, Q3]
    Iqr,
}

impl std::str::FromStr for AggregationMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "median" => Ok(AggregationMethod::Median),
            "iqr" => Ok(AggregationMethod::Iqr),
            _ => Err(format!("Invalid aggregation method: {}", s)),
        }
    }
}
