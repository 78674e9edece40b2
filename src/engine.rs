//! High level entry points over a [`PacingConfig`]
//!
//! The engine holds no per-call state: every operation takes its inputs
//! explicitly and can be called from several threads at once.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use crate::config::PacingConfig;
use crate::decay::DecayRateAnalyzer;
use crate::energy::{aggregate_heart_rate, sample_at, EnergyModel};
use crate::error::{PacingError, Result};
use crate::hrv::approximate_rmssd_from_heart_rate;
use crate::models::{
    AggregationMethod, AutoFitResult, CycleData, DayFitResult, DecayRateResult, EnergyConfig,
    EnergyDataPoint, EnergyPoint, FitRange, HrDataPoint, HrvPoint, Prediction, PredictionSource,
    SleepConfig,
};
use crate::optimizer::{CancellationToken, ParameterOptimizer};
use crate::sleep::{build_cycle_data, SleepAnalysis, SleepDetector, DEFAULT_START_ENERGY};

/// Distance ahead of `now` the second predicted value refers to
pub const PREDICTION_HORIZON_HOURS: i64 = 2;

/// Curve samples further than this from the requested time are not used
const PREDICTION_TOLERANCE_MINUTES: i64 = 30;

const HRV_PROXY_WINDOW_MINUTES: u32 = 5;

/// Facade combining the model, detector, decay analyzer and optimizer
#[derive(Debug, Clone)]
pub struct EnergyEngine {
    config: PacingConfig,
    model: EnergyModel,
    detector: SleepDetector,
    decay: DecayRateAnalyzer,
    cancel: CancellationToken,
}

impl EnergyEngine {
    /// Build an engine, validating every section of `config`
    pub fn new(config: PacingConfig) -> Result<Self> {
        config.energy.validate()?;
        config.optimizer.validate()?;

        let model = EnergyModel::new(config.hrv.clone())?;
        let detector = SleepDetector::new(config.sleep.clone())?;
        let decay = DecayRateAnalyzer::new(config.decay.clone());

        Ok(Self {
            config,
            model,
            detector,
            decay,
            cancel: CancellationToken::new(),
        })
    }

    /// Share `token` with every fit started from this engine
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn config(&self) -> &PacingConfig {
        &self.config
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Energy curve for a raw heart rate stream.
    ///
    /// The stream is resampled to `config.aggregation_minutes` first.
    pub fn evaluate(
        &self,
        hr: &[HrDataPoint],
        hrv: Option<&[HrvPoint]>,
        config: &EnergyConfig,
        start_energy: f64,
    ) -> Result<Vec<EnergyPoint>> {
        config.validate()?;
        let samples = aggregate_heart_rate(hr, config.aggregation_minutes);
        self.model.evaluate(&samples, hrv, config, start_energy)
    }

    /// Energy curve restarted at every validated entry
    pub fn evaluate_anchored(
        &self,
        hr: &[HrDataPoint],
        hrv: Option<&[HrvPoint]>,
        config: &EnergyConfig,
        validated: &[EnergyDataPoint],
    ) -> Result<Vec<EnergyPoint>> {
        config.validate()?;
        let samples = aggregate_heart_rate(hr, config.aggregation_minutes);
        self.model
            .evaluate_anchored(&samples, hrv, config, validated, DEFAULT_START_ENERGY)
    }

    /// Sleep phases, wake events and cycles under `sleep_config`
    pub fn detect_cycles(&self, hr: &[HrDataPoint], sleep_config: &SleepConfig) -> Result<SleepAnalysis> {
        let analysis = if *sleep_config == self.config.sleep {
            self.detector.detect(hr)
        } else {
            SleepDetector::new(sleep_config.clone())?.detect(hr)
        };
        Ok(analysis)
    }

    /// Cycles of the configured detector, filled with heart rate and
    /// validated entries
    pub fn build_cycles(&self, hr: &[HrDataPoint], validated: &[EnergyDataPoint]) -> Vec<CycleData> {
        let analysis = self.detector.detect(hr);
        build_cycle_data(&analysis.cycles, hr, validated, DEFAULT_START_ENERGY)
    }

    /// Time of day decay profile from heart rate trend
    pub fn analyze_decay(&self, hr: &[HrDataPoint]) -> DecayRateResult {
        self.decay.analyze(hr, None)
    }

    /// Time of day decay profile under a fitted configuration
    pub fn analyze_decay_fitted(&self, hr: &[HrDataPoint], fitted: &EnergyConfig) -> DecayRateResult {
        self.decay.analyze(hr, Some(fitted))
    }

    /// Decay profile from consecutive validated entries
    pub fn decay_from_entries(&self, entries: &[EnergyDataPoint]) -> DecayRateResult {
        self.decay.from_validated_energy(entries)
    }

    pub fn decay_analyzer(&self) -> &DecayRateAnalyzer {
        &self.decay
    }

    pub fn fit_day(&self, cycle: &CycleData, seed: Option<&EnergyConfig>) -> Result<DayFitResult> {
        self.optimizer()?.fit_day(cycle, seed)
    }

    /// Segment, slice and fit every cycle in `range`
    pub fn auto_fit(
        &self,
        hr: &[HrDataPoint],
        validated: &[EnergyDataPoint],
        range: FitRange,
        aggregation: AggregationMethod,
        seed: Option<&EnergyConfig>,
        now: DateTime<Utc>,
    ) -> Result<AutoFitResult> {
        if hr.is_empty() {
            return Err(PacingError::insufficient_data("auto fit", "empty heart rate series"));
        }

        let cycles = self.build_cycles(hr, validated);
        debug!(cycles = cycles.len(), ?range, "built cycles for auto fit");

        let result = self
            .optimizer()?
            .auto_fit(&cycles, range, aggregation, seed, now)?;

        info!(
            used_days = result.used_days,
            total_days = result.total_days,
            loss = result.result.loss,
            "auto fit complete"
        );
        Ok(result)
    }

    /// Energy at `now` and [`PREDICTION_HORIZON_HOURS`] later.
    ///
    /// With heart rate the anchored curve under `fitted` is sampled, HRV
    /// being approximated from the heart rate itself. Without heart rate the
    /// last validated entry is projected with the decay profile of `entries`.
    /// Both values are clamped to 0-100.
    pub fn predict(
        &self,
        hr: &[HrDataPoint],
        entries: &[EnergyDataPoint],
        fitted: &EnergyConfig,
        now: DateTime<Utc>,
    ) -> Result<Prediction> {
        fitted.validate()?;
        let future = now + Duration::hours(PREDICTION_HORIZON_HOURS);
        let last_validated = entries
            .iter()
            .filter(|e| e.is_validated())
            .max_by_key(|e| e.timestamp);

        let samples = aggregate_heart_rate(hr, fitted.aggregation_minutes);
        if samples.is_empty() {
            let decay = self.decay_from_entries(entries);
            let (energy, at) = match last_validated {
                Some(last) => (last.percentage, last.timestamp),
                None => (DEFAULT_START_ENERGY, now),
            };
            let (energy_now, energy_future) =
                self.decay.predict_with_decay(energy, at, now, &decay);
            debug!(pairs = decay.data_points_used, "predicted from decay rates");

            return Ok(Prediction {
                time: now,
                energy_now,
                time_future: future,
                energy_future,
                source: PredictionSource::Decay,
            });
        }

        let fallback = last_validated
            .map(|e| e.percentage)
            .unwrap_or(DEFAULT_START_ENERGY);
        let hrv = approximate_rmssd_from_heart_rate(hr, HRV_PROXY_WINDOW_MINUTES);
        let hrv = (!hrv.is_empty()).then_some(hrv.as_slice());
        let curve = self
            .model
            .evaluate_anchored(&samples, hrv, fitted, entries, fallback)?;

        let tolerance = Duration::minutes(PREDICTION_TOLERANCE_MINUTES);
        let energy_now = sample_at(&curve, now, tolerance).unwrap_or(fallback);
        let energy_future = sample_at(&curve, future, tolerance)
            .or_else(|| curve.last().map(|p| p.energy))
            .unwrap_or(fallback);

        Ok(Prediction {
            time: now,
            energy_now: energy_now.clamp(0.0, 100.0),
            time_future: future,
            energy_future: energy_future.clamp(0.0, 100.0),
            source: PredictionSource::Curve,
        })
    }

    fn optimizer(&self) -> Result<ParameterOptimizer> {
        Ok(ParameterOptimizer::new(
            self.config.optimizer.clone(),
            self.config.energy.clone(),
            self.model.clone(),
        )?
        .with_cancellation(self.cancel.clone()))
    }
}
