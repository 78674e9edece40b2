//! Parameter fitting against validated energy entries
//!
//! A single cycle is fitted in two stages:
//!
//! 1. a coarse grid over the heart rate thresholds and both factors, with the
//!    energy offset set to the median residual of each candidate
//! 2. bounded Nelder-Mead over all five parameters, restarted from its own
//!    optimum until the loss stops improving
//!
//! Candidates outside [`ParameterBounds`] are rejected before the model runs.
//! [`ParameterOptimizer::auto_fit`] fits every cycle of a range in parallel
//! and collapses the per-day parameters into one configuration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::energy::{aggregate_heart_rate, EnergyModel};
use crate::error::{OptimizationError, PacingError, Result};
use crate::models::{
    AggregationMethod, AutoFitResult, CycleData, DayFitResult, EnergyConfig, FitRange,
    HrDataPoint, OptimizationResult,
};
use crate::stats::{iqr_mean, median};

/// hr_low, hr_high, drain_factor, recovery_factor, energy_offset
type Params = [f64; 5];

const DIMENSIONS: usize = 5;

const GRID_HR_LOW: [f64; 5] = [50.0, 55.0, 60.0, 65.0, 70.0];
const GRID_HR_HIGH: [f64; 6] = [75.0, 80.0, 90.0, 100.0, 110.0, 120.0];
const GRID_DRAIN: [f64; 5] = [0.02, 0.05, 0.1, 0.2, 0.4];
const GRID_RECOVERY: [f64; 5] = [0.1, 0.25, 0.5, 1.0, 2.0];

// Nelder-Mead coefficients
const REFLECTION: f64 = 1.0;
const EXPANSION: f64 = 2.0;
const CONTRACTION: f64 = 0.5;
const SHRINK: f64 = 0.5;

/// Closed interval for one parameter
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterRange {
    pub min: f64,
    pub max: f64,
}

impl ParameterRange {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Search space of the optimizer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParameterBounds {
    pub hr_low: ParameterRange,
    pub hr_high: ParameterRange,
    pub drain_factor: ParameterRange,
    pub recovery_factor: ParameterRange,
    pub energy_offset: ParameterRange,
}

impl Default for ParameterBounds {
    fn default() -> Self {
        ParameterBounds {
            hr_low: ParameterRange::new(35.0, 110.0),
            hr_high: ParameterRange::new(45.0, 200.0),
            drain_factor: ParameterRange::new(0.001, 5.0),
            recovery_factor: ParameterRange::new(0.001, 5.0),
            energy_offset: ParameterRange::new(-50.0, 50.0),
        }
    }
}

impl ParameterBounds {
    fn contains(&self, p: &Params) -> bool {
        p.iter().all(|v| v.is_finite())
            && self.hr_low.contains(p[0])
            && self.hr_high.contains(p[1])
            && p[0] < p[1]
            && self.drain_factor.contains(p[2])
            && p[2] > 0.0
            && self.recovery_factor.contains(p[3])
            && p[3] > 0.0
            && self.energy_offset.contains(p[4])
    }

    fn clamp_offset(&self, offset: f64) -> f64 {
        offset.clamp(self.energy_offset.min, self.energy_offset.max)
    }
}

/// Optimizer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Cycles with fewer validated entries are skipped
    pub min_validated_points: usize,

    /// Fraction of the cycle span that must be covered by heart rate buckets
    pub min_hr_coverage: f64,

    /// Per-day fits above this loss are left out of the aggregate
    pub max_day_loss: f64,

    /// Maximum distance between a validated entry and the model sample it is
    /// compared with
    pub sample_tolerance_minutes: u32,

    /// Nelder-Mead iteration budget per restart
    pub max_iterations: usize,

    /// Additional Nelder-Mead runs from the previous optimum
    pub restarts: usize,

    /// Simplex loss spread treated as converged
    pub loss_tolerance: f64,

    /// Fit cycles on the rayon thread pool
    pub parallel: bool,

    pub bounds: ParameterBounds,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig {
            min_validated_points: 2,
            min_hr_coverage: 0.25,
            max_day_loss: 500.0,
            sample_tolerance_minutes: 30,
            max_iterations: 2000,
            restarts: 3,
            loss_tolerance: 1e-10,
            parallel: true,
            bounds: ParameterBounds::default(),
        }
    }
}

impl OptimizerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_validated_points == 0 {
            return Err(PacingError::invalid_config(
                "min_validated_points",
                0,
                "at least one validated entry is needed to score a fit",
            ));
        }
        if !(0.0..=1.0).contains(&self.min_hr_coverage) {
            return Err(PacingError::invalid_config(
                "min_hr_coverage",
                self.min_hr_coverage,
                "must be a fraction between 0 and 1",
            ));
        }
        if self.max_iterations == 0 {
            return Err(PacingError::invalid_config(
                "max_iterations",
                0,
                "must allow at least one iteration",
            ));
        }
        Ok(())
    }
}

/// Cooperative cancellation flag shared between a caller and running fits
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(OptimizationError::Cancelled.into())
        } else {
            Ok(())
        }
    }
}

/// One cycle prepared for repeated evaluation
struct Objective<'a> {
    model: &'a EnergyModel,
    bounds: &'a ParameterBounds,
    base: &'a EnergyConfig,
    hr: Vec<HrDataPoint>,
    start_energy: f64,
    /// Curve index and validated percentage of every scored entry
    targets: Vec<(usize, f64)>,
}

impl<'a> Objective<'a> {
    fn config(&self, p: &Params) -> EnergyConfig {
        EnergyConfig {
            hr_low: p[0],
            hr_high: p[1],
            drain_factor: p[2],
            recovery_factor: p[3],
            energy_offset: p[4],
            ..self.base.clone()
        }
    }

    /// Validated minus modelled energy at every target
    fn residuals(&self, p: &Params) -> Option<Vec<f64>> {
        let curve = self
            .model
            .evaluate(&self.hr, None, &self.config(p), self.start_energy)
            .ok()?;
        Some(
            self.targets
                .iter()
                .map(|(idx, value)| value - curve[*idx].energy)
                .collect(),
        )
    }

    /// Mean squared error, `None` for rejected candidates
    fn loss(&self, p: &Params) -> Option<f64> {
        if !self.bounds.contains(p) {
            return None;
        }
        self.residuals(p).map(|r| mean_square(&r, 0.0))
    }

    fn loss_or_inf(&self, p: &Params) -> f64 {
        self.loss(p).unwrap_or(f64::INFINITY)
    }
}

fn mean_square(residuals: &[f64], shift: f64) -> f64 {
    if residuals.is_empty() {
        return f64::INFINITY;
    }
    residuals.iter().map(|r| (r - shift).powi(2)).sum::<f64>() / residuals.len() as f64
}

/// Fits [`EnergyConfig`] parameters to validated energy entries
#[derive(Debug, Clone)]
pub struct ParameterOptimizer {
    config: OptimizerConfig,
    base: EnergyConfig,
    model: EnergyModel,
    cancel: CancellationToken,
}

impl ParameterOptimizer {
    /// `base` supplies the parameters that are not fitted (time offset and
    /// aggregation interval).
    pub fn new(config: OptimizerConfig, base: EnergyConfig, model: EnergyModel) -> Result<Self> {
        config.validate()?;
        if base.aggregation_minutes == 0 {
            return Err(PacingError::invalid_config(
                "aggregation_minutes",
                0,
                "must be at least one minute",
            ));
        }
        Ok(Self {
            config,
            base,
            model,
            cancel: CancellationToken::new(),
        })
    }

    /// Share `token` with the caller so it can abort running fits
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Fit one cycle.
    ///
    /// `seed` adds a previously known configuration to the starting
    /// candidates.
    pub fn fit_day(&self, cycle: &CycleData, seed: Option<&EnergyConfig>) -> Result<DayFitResult> {
        self.cancel.check()?;
        let objective = self.prepare(cycle)?;

        let (start, start_loss) = self.grid_search(&objective, seed)?;
        let (best, loss) = self.refine(&objective, start, start_loss)?;

        debug!(
            cycle = %cycle.label,
            loss,
            hr_low = best[0],
            hr_high = best[1],
            "fitted cycle"
        );

        Ok(DayFitResult::from_result(
            to_result(&best, loss),
            cycle.label.clone(),
            objective.targets.len(),
        ))
    }

    /// Fit every cycle of `range` and aggregate the per-day parameters.
    ///
    /// Cycles that cannot be fitted, or whose loss exceeds `max_day_loss`,
    /// are logged and left out. The aggregate loss is recomputed over the
    /// validated entries of all used cycles.
    pub fn auto_fit(
        &self,
        cycles: &[CycleData],
        range: FitRange,
        aggregation: AggregationMethod,
        seed: Option<&EnergyConfig>,
        now: DateTime<Utc>,
    ) -> Result<AutoFitResult> {
        let mut selected = select_range(cycles, range, now);
        selected.sort_by_key(|c| c.cycle_start);
        let total_days = selected.len();

        let fits: Vec<(&CycleData, Result<DayFitResult>)> = if self.config.parallel {
            selected
                .par_iter()
                .map(|cycle| (*cycle, self.fit_day(cycle, seed)))
                .collect()
        } else {
            selected
                .iter()
                .map(|cycle| (*cycle, self.fit_day(cycle, seed)))
                .collect()
        };

        let mut used: Vec<(&CycleData, DayFitResult)> = Vec::with_capacity(fits.len());
        for (cycle, fit) in fits {
            match fit {
                Ok(day) if day.loss <= self.config.max_day_loss => used.push((cycle, day)),
                Ok(day) => warn!(
                    cycle = %cycle.label,
                    loss = day.loss,
                    "Excluding cycle, loss above {}",
                    self.config.max_day_loss
                ),
                Err(PacingError::Optimization(OptimizationError::Cancelled)) => {
                    return Err(OptimizationError::Cancelled.into())
                }
                Err(e) => warn!(cycle = %cycle.label, "Excluding cycle: {}", e),
            }
        }

        if used.is_empty() {
            return Err(OptimizationError::EmptyRange { range, total_days }.into());
        }

        let pick = |field: fn(&DayFitResult) -> f64| -> Result<f64> {
            let values: Vec<f64> = used.iter().map(|(_, day)| field(day)).collect();
            let aggregated = match aggregation {
                AggregationMethod::Median => median(&values),
                AggregationMethod::Iqr => iqr_mean(&values),
            };
            aggregated.ok_or_else(|| {
                PacingError::insufficient_data("parameter aggregation", "no used cycles")
            })
        };

        let params: Params = [
            pick(|d| d.hr_low)?,
            pick(|d| d.hr_high)?,
            pick(|d| d.drain_factor)?,
            pick(|d| d.recovery_factor)?,
            pick(|d| d.energy_offset)?,
        ];

        let loss = self.union_loss(&used, &params)?;
        let day_results: Vec<DayFitResult> = used.into_iter().map(|(_, day)| day).collect();

        info!(
            range = ?range,
            aggregation = ?aggregation,
            used_days = day_results.len(),
            total_days,
            loss,
            "auto fit finished"
        );

        Ok(AutoFitResult {
            result: to_result(&params, loss),
            used_days: day_results.len(),
            day_results,
            total_days,
        })
    }

    fn prepare(&self, cycle: &CycleData) -> Result<Objective<'_>> {
        let hr = aggregate_heart_rate(&cycle.hr_data, self.base.aggregation_minutes);
        let interval = i64::from(self.base.aggregation_minutes);

        let span_minutes = (cycle.cycle_end - cycle.cycle_start).num_minutes();
        let coverage = if span_minutes > 0 {
            (hr.len() as i64 * interval) as f64 / span_minutes as f64
        } else {
            0.0
        };
        if hr.is_empty() || coverage < self.config.min_hr_coverage {
            return Err(PacingError::insufficient_data(
                format!("fit of cycle {}", cycle.label),
                format!(
                    "heart rate covers {:.0}% of the cycle, need {:.0}%",
                    coverage * 100.0,
                    self.config.min_hr_coverage * 100.0
                ),
            ));
        }

        // Curve timestamps do not depend on the fitted parameters, so the
        // sample matched to each validated entry is fixed per cycle.
        let shift = Duration::minutes(i64::from(self.base.time_offset_minutes));
        let tolerance = Duration::minutes(i64::from(self.config.sample_tolerance_minutes));
        let times: Vec<DateTime<Utc>> = hr.iter().map(|p| p.timestamp + shift).collect();
        let targets: Vec<(usize, f64)> = cycle
            .validated_points
            .iter()
            .filter(|v| v.is_validated())
            .filter_map(|v| nearest_index(&times, v.timestamp, tolerance).map(|i| (i, v.percentage)))
            .collect();

        if targets.len() < self.config.min_validated_points {
            return Err(PacingError::insufficient_data(
                format!("fit of cycle {}", cycle.label),
                format!(
                    "{} validated entries near the modelled curve, need {}",
                    targets.len(),
                    self.config.min_validated_points
                ),
            ));
        }

        Ok(Objective {
            model: &self.model,
            bounds: &self.config.bounds,
            base: &self.base,
            hr,
            start_energy: cycle.start_energy,
            targets,
        })
    }

    fn grid_search(
        &self,
        objective: &Objective<'_>,
        seed: Option<&EnergyConfig>,
    ) -> Result<(Params, f64)> {
        let mut candidates: Vec<[f64; 4]> = Vec::new();
        if let Some(seed) = seed {
            candidates.push([seed.hr_low, seed.hr_high, seed.drain_factor, seed.recovery_factor]);
        }
        for &hr_low in &GRID_HR_LOW {
            for &hr_high in &GRID_HR_HIGH {
                for &drain in &GRID_DRAIN {
                    for &recovery in &GRID_RECOVERY {
                        candidates.push([hr_low, hr_high, drain, recovery]);
                    }
                }
            }
        }

        let mut best: Option<(Params, f64)> = None;
        for (i, c) in candidates.iter().enumerate() {
            if i % 64 == 0 {
                self.cancel.check()?;
            }

            let unshifted = [c[0], c[1], c[2], c[3], 0.0];
            if !objective.bounds.contains(&unshifted) {
                continue;
            }
            let residuals = match objective.residuals(&unshifted) {
                Some(r) => r,
                None => continue,
            };

            let offset = objective
                .bounds
                .clamp_offset(median(&residuals).unwrap_or(0.0));
            let loss = mean_square(&residuals, offset);
            if best.as_ref().map_or(true, |(_, b)| loss < *b) {
                best = Some(([c[0], c[1], c[2], c[3], offset], loss));
            }
        }

        best.ok_or_else(|| {
            PacingError::insufficient_data("grid search", "no candidate inside the parameter bounds")
        })
    }

    fn refine(&self, objective: &Objective<'_>, start: Params, start_loss: f64) -> Result<(Params, f64)> {
        let (mut best, mut best_loss) = (start, start_loss);
        for attempt in 0..=self.config.restarts {
            let (candidate, loss) = match self.nelder_mead(objective, best, best_loss) {
                Ok(found) => found,
                // a restart that stalls keeps the earlier optimum
                Err(PacingError::Optimization(OptimizationError::NoConvergence { .. }))
                    if attempt > 0 =>
                {
                    break
                }
                Err(e) => return Err(e),
            };
            let improvement = best_loss - loss;
            if loss < best_loss {
                best = candidate;
                best_loss = loss;
            }
            if improvement <= self.config.loss_tolerance {
                break;
            }
        }
        Ok((best, best_loss))
    }

    fn nelder_mead(
        &self,
        objective: &Objective<'_>,
        start: Params,
        start_loss: f64,
    ) -> Result<(Params, f64)> {
        let bounds = objective.bounds;
        let mut simplex: Vec<(Params, f64)> = Vec::with_capacity(DIMENSIONS + 1);
        simplex.push((start, start_loss));
        for i in 0..DIMENSIONS {
            let step = initial_step(i, start[i]);
            let mut vertex = start;
            vertex[i] = start[i] + step;
            if !bounds.contains(&vertex) {
                vertex[i] = start[i] - step;
            }
            if !bounds.contains(&vertex) {
                vertex[i] = start[i] + step * 0.1;
            }
            simplex.push((vertex, objective.loss_or_inf(&vertex)));
        }

        for _ in 0..self.config.max_iterations {
            self.cancel.check()?;
            simplex.sort_by(|a, b| a.1.total_cmp(&b.1));

            let best = simplex[0];
            let worst = simplex[DIMENSIONS];
            let second_worst = simplex[DIMENSIONS - 1].1;

            let loss_spread = worst.1 - best.1;
            let size = simplex[1..]
                .iter()
                .flat_map(|(x, _)| x.iter().zip(&best.0).map(|(a, b)| (a - b).abs()))
                .fold(0.0, f64::max);
            if loss_spread <= self.config.loss_tolerance * (1.0 + best.1.abs()) || size <= 1e-9 {
                return Ok(best);
            }

            let mut centroid = [0.0; DIMENSIONS];
            for (x, _) in &simplex[..DIMENSIONS] {
                for (c, v) in centroid.iter_mut().zip(x) {
                    *c += v / DIMENSIONS as f64;
                }
            }

            let reflected = along(&centroid, &worst.0, -REFLECTION);
            let reflected_loss = objective.loss_or_inf(&reflected);

            if reflected_loss < best.1 {
                let expanded = along(&centroid, &worst.0, -REFLECTION * EXPANSION);
                let expanded_loss = objective.loss_or_inf(&expanded);
                simplex[DIMENSIONS] = if expanded_loss < reflected_loss {
                    (expanded, expanded_loss)
                } else {
                    (reflected, reflected_loss)
                };
                continue;
            }

            if reflected_loss < second_worst {
                simplex[DIMENSIONS] = (reflected, reflected_loss);
                continue;
            }

            let (contracted, limit) = if reflected_loss < worst.1 {
                (along(&centroid, &worst.0, -REFLECTION * CONTRACTION), reflected_loss)
            } else {
                (along(&centroid, &worst.0, CONTRACTION), worst.1)
            };
            let contracted_loss = objective.loss_or_inf(&contracted);
            if contracted_loss < limit {
                simplex[DIMENSIONS] = (contracted, contracted_loss);
                continue;
            }

            for vertex in simplex.iter_mut().skip(1) {
                let shrunk = along(&best.0, &vertex.0, SHRINK);
                *vertex = (shrunk, objective.loss_or_inf(&shrunk));
            }
        }

        simplex.sort_by(|a, b| a.1.total_cmp(&b.1));
        Err(OptimizationError::NoConvergence {
            iterations: self.config.max_iterations,
            best_loss: simplex[0].1,
        }
        .into())
    }

    fn union_loss(&self, used: &[(&CycleData, DayFitResult)], params: &Params) -> Result<f64> {
        let mut residuals = Vec::new();
        for (cycle, _) in used {
            let objective = self.prepare(cycle)?;
            let cycle_residuals = objective.residuals(params).ok_or_else(|| {
                PacingError::invalid_config(
                    "aggregated parameters",
                    format!("{:?}", params),
                    "hr_low must stay below hr_high and both factors positive",
                )
            })?;
            residuals.extend(cycle_residuals);
        }
        Ok(mean_square(&residuals, 0.0))
    }
}

/// Cycles whose start lies inside the range window ending at `now`
pub fn select_range(cycles: &[CycleData], range: FitRange, now: DateTime<Utc>) -> Vec<&CycleData> {
    match range.days() {
        None => cycles.iter().collect(),
        Some(days) => {
            let since = now - Duration::days(days);
            cycles.iter().filter(|c| c.cycle_start >= since).collect()
        }
    }
}

/// `origin + factor * (point - origin)`
fn along(origin: &Params, point: &Params, factor: f64) -> Params {
    let mut out = [0.0; DIMENSIONS];
    for i in 0..DIMENSIONS {
        out[i] = origin[i] + factor * (point[i] - origin[i]);
    }
    out
}

fn initial_step(dimension: usize, value: f64) -> f64 {
    match dimension {
        0 | 1 => 5.0,
        2 | 3 => (value * 0.25).max(0.01),
        _ => 5.0,
    }
}

fn nearest_index(times: &[DateTime<Utc>], at: DateTime<Utc>, tolerance: Duration) -> Option<usize> {
    let idx = times.partition_point(|t| *t < at);
    let candidates = [idx.checked_sub(1), Some(idx)];
    candidates
        .iter()
        .flatten()
        .filter(|i| **i < times.len())
        .map(|i| {
            let distance = if times[*i] > at { times[*i] - at } else { at - times[*i] };
            (*i, distance)
        })
        .filter(|(_, distance)| *distance <= tolerance)
        .min_by_key(|(_, distance)| *distance)
        .map(|(i, _)| i)
}

fn to_result(p: &Params, loss: f64) -> OptimizationResult {
    OptimizationResult {
        hr_low: p[0],
        hr_high: p[1],
        drain_factor: p[2],
        recovery_factor: p[3],
        energy_offset: p[4],
        loss,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EnergyDataPoint;
    use chrono::TimeZone;

    fn day(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap() + Duration::days(n)
    }

    fn base() -> EnergyConfig {
        EnergyConfig {
            time_offset_minutes: 0,
            aggregation_minutes: 15,
            ..EnergyConfig::default()
        }
    }

    fn truth(hr_low: f64, hr_high: f64, drain: f64, recovery: f64, offset: f64) -> EnergyConfig {
        EnergyConfig {
            hr_low,
            hr_high,
            drain_factor: drain,
            recovery_factor: recovery,
            energy_offset: offset,
            ..base()
        }
    }

    fn optimizer() -> ParameterOptimizer {
        ParameterOptimizer::new(OptimizerConfig::default(), base(), EnergyModel::default()).unwrap()
    }

    /// One day of 15-minute heart rate with every model sample validated
    fn synthetic_cycle(start: DateTime<Utc>, truth: &EnergyConfig) -> CycleData {
        let hr: Vec<HrDataPoint> = (0..96)
            .map(|i| {
                let x = i as f64;
                let bpm = 77.5 + 30.0 * (x * 0.37).sin() + 8.0 * (x * 1.13).sin();
                HrDataPoint::new(start + Duration::minutes(15 * i), bpm)
            })
            .collect();
        let curve = EnergyModel::default().evaluate(&hr, None, truth, 60.0).unwrap();
        let validated_points = curve
            .iter()
            .map(|p| EnergyDataPoint::validated(p.timestamp, p.energy))
            .collect();

        CycleData {
            label: start.format("%Y-%m-%d").to_string(),
            cycle_start: start,
            cycle_end: start + Duration::days(1),
            validated_points,
            hr_data: hr,
            start_energy: 60.0,
        }
    }

    #[test]
    fn test_bounds_reject_inverted_thresholds() {
        let bounds = ParameterBounds::default();
        assert!(bounds.contains(&[60.0, 80.0, 0.1, 0.5, 0.0]));
        assert!(!bounds.contains(&[80.0, 80.0, 0.1, 0.5, 0.0]));
        assert!(!bounds.contains(&[60.0, 80.0, 0.0, 0.5, 0.0]));
        assert!(!bounds.contains(&[60.0, 80.0, 0.1, 0.5, 75.0]));
        assert!(!bounds.contains(&[f64::NAN, 80.0, 0.1, 0.5, 0.0]));
    }

    #[test]
    fn test_fit_recovers_grid_parameters() {
        let optimizer = optimizer();
        let cycle = synthetic_cycle(day(0), &truth(60.0, 80.0, 0.1, 0.5, 0.0));
        let fit = optimizer.fit_day(&cycle, None).unwrap();

        assert!(fit.loss < 1e-9, "loss {}", fit.loss);
        assert!((fit.hr_low - 60.0).abs() < 1e-6);
        assert!((fit.hr_high - 80.0).abs() < 1e-6);
        assert!((fit.drain_factor - 0.1).abs() < 1e-6);
        assert!((fit.recovery_factor - 0.5).abs() < 1e-6);
        assert!(fit.energy_offset.abs() < 1e-6);
        assert_eq!(fit.data_points, 96);
        assert_eq!(fit.date, "2024-06-01");
    }

    #[test]
    fn test_fit_refines_off_grid_parameters() {
        let optimizer = optimizer();
        let cycle = synthetic_cycle(day(0), &truth(62.0, 84.0, 0.15, 0.4, 2.0));
        let fit = optimizer.fit_day(&cycle, None).unwrap();

        assert!(fit.loss < 1e-6, "loss {}", fit.loss);
        assert!((fit.hr_low - 62.0).abs() < 1e-3, "hr_low {}", fit.hr_low);
        assert!((fit.hr_high - 84.0).abs() < 1e-3, "hr_high {}", fit.hr_high);
        assert!((fit.drain_factor - 0.15).abs() < 1e-3, "drain {}", fit.drain_factor);
        assert!((fit.recovery_factor - 0.4).abs() < 1e-3, "recovery {}", fit.recovery_factor);
        assert!((fit.energy_offset - 2.0).abs() < 1e-3, "offset {}", fit.energy_offset);
    }

    #[test]
    fn test_seed_is_a_starting_candidate() {
        let optimizer = optimizer();
        let exact = truth(62.0, 84.0, 0.15, 0.4, 0.0);
        let cycle = synthetic_cycle(day(0), &exact);
        let fit = optimizer.fit_day(&cycle, Some(&exact)).unwrap();
        assert!(fit.loss < 1e-9, "loss {}", fit.loss);
    }

    #[test]
    fn test_too_few_validated_points() {
        let optimizer = optimizer();
        let mut cycle = synthetic_cycle(day(0), &truth(60.0, 80.0, 0.1, 0.5, 0.0));
        cycle.validated_points.truncate(1);

        let err = optimizer.fit_day(&cycle, None).unwrap_err();
        assert!(matches!(
            err,
            PacingError::Calculation(crate::error::CalculationError::InsufficientData { .. })
        ));
    }

    #[test]
    fn test_sparse_heart_rate_coverage() {
        let optimizer = optimizer();
        let mut cycle = synthetic_cycle(day(0), &truth(60.0, 80.0, 0.1, 0.5, 0.0));
        // 12 of 96 buckets
        cycle.hr_data.truncate(12);
        assert!(optimizer.fit_day(&cycle, None).is_err());
    }

    #[test]
    fn test_cancelled_fit() {
        let token = CancellationToken::new();
        let optimizer = optimizer().with_cancellation(token.clone());
        token.cancel();

        let cycle = synthetic_cycle(day(0), &truth(60.0, 80.0, 0.1, 0.5, 0.0));
        let err = optimizer.fit_day(&cycle, None).unwrap_err();
        assert!(matches!(
            err,
            PacingError::Optimization(OptimizationError::Cancelled)
        ));

        let err = optimizer
            .auto_fit(&[cycle], FitRange::All, AggregationMethod::Median, None, day(1))
            .unwrap_err();
        assert!(matches!(
            err,
            PacingError::Optimization(OptimizationError::Cancelled)
        ));
    }

    #[test]
    fn test_auto_fit_median_of_odd_days() {
        let optimizer = optimizer();
        let cycles = vec![
            synthetic_cycle(day(0), &truth(55.0, 80.0, 0.1, 0.5, 0.0)),
            synthetic_cycle(day(1), &truth(60.0, 90.0, 0.2, 0.5, 0.0)),
            synthetic_cycle(day(2), &truth(65.0, 80.0, 0.1, 1.0, 0.0)),
        ];

        let result = optimizer
            .auto_fit(&cycles, FitRange::All, AggregationMethod::Median, None, day(3))
            .unwrap();

        assert_eq!(result.total_days, 3);
        assert_eq!(result.used_days, 3);
        assert!(result.used_days <= result.total_days);

        let lows: Vec<f64> = result.day_results.iter().map(|d| d.hr_low).collect();
        assert_eq!(result.result.hr_low, median(&lows).unwrap());
        let labels: Vec<&str> = result.day_results.iter().map(|d| d.date.as_str()).collect();
        assert_eq!(labels, vec!["2024-06-01", "2024-06-02", "2024-06-03"]);
        assert!(result.result.loss >= 0.0);
    }

    #[test]
    fn test_auto_fit_week_range_and_exclusions() {
        let optimizer = optimizer();
        let mut sparse = synthetic_cycle(day(9), &truth(60.0, 80.0, 0.1, 0.5, 0.0));
        sparse.validated_points.clear();

        let cycles = vec![
            synthetic_cycle(day(0), &truth(60.0, 80.0, 0.1, 0.5, 0.0)),
            synthetic_cycle(day(8), &truth(60.0, 80.0, 0.1, 0.5, 0.0)),
            sparse,
        ];

        let result = optimizer
            .auto_fit(&cycles, FitRange::Week, AggregationMethod::Iqr, None, day(10))
            .unwrap();

        assert_eq!(result.total_days, 2);
        assert_eq!(result.used_days, 1);
        assert_eq!(result.day_results[0].date, "2024-06-09");
        assert!(result.result.loss < 1e-9);
    }

    #[test]
    fn test_auto_fit_empty_range() {
        let optimizer = optimizer();
        let cycles = vec![synthetic_cycle(day(0), &truth(60.0, 80.0, 0.1, 0.5, 0.0))];

        let err = optimizer
            .auto_fit(&cycles, FitRange::Week, AggregationMethod::Median, None, day(30))
            .unwrap_err();
        assert!(matches!(
            err,
            PacingError::Optimization(OptimizationError::EmptyRange { total_days: 0, .. })
        ));
    }

    #[test]
    fn test_high_loss_days_are_excluded() {
        let optimizer = ParameterOptimizer::new(
            OptimizerConfig {
                max_day_loss: 1.0,
                parallel: false,
                ..OptimizerConfig::default()
            },
            base(),
            EnergyModel::default(),
        )
        .unwrap();

        let good = synthetic_cycle(day(0), &truth(60.0, 80.0, 0.1, 0.5, 0.0));
        let mut noisy = synthetic_cycle(day(1), &truth(60.0, 80.0, 0.1, 0.5, 0.0));
        for (i, point) in noisy.validated_points.iter_mut().enumerate() {
            point.percentage = if i % 2 == 0 { 0.0 } else { 100.0 };
        }

        let result = optimizer
            .auto_fit(&[good, noisy], FitRange::All, AggregationMethod::Median, None, day(2))
            .unwrap();
        assert_eq!(result.total_days, 2);
        assert_eq!(result.used_days, 1);
    }

    #[test]
    fn test_select_range_windows() {
        let cycles: Vec<CycleData> = (0..40)
            .map(|d| synthetic_cycle(day(d), &truth(60.0, 80.0, 0.1, 0.5, 0.0)))
            .collect();
        let now = day(40);
        assert_eq!(select_range(&cycles, FitRange::All, now).len(), 40);
        assert_eq!(select_range(&cycles, FitRange::Month, now).len(), 30);
        assert_eq!(select_range(&cycles, FitRange::Week, now).len(), 7);
    }

    #[test]
    fn test_nearest_index() {
        let times: Vec<DateTime<Utc>> = (0..4).map(|i| day(0) + Duration::minutes(15 * i)).collect();
        let tolerance = Duration::minutes(30);
        assert_eq!(nearest_index(&times, day(0) + Duration::minutes(20), tolerance), Some(1));
        assert_eq!(nearest_index(&times, day(0) + Duration::minutes(23), tolerance), Some(2));
        assert_eq!(nearest_index(&times, day(0) - Duration::minutes(45), tolerance), None);
    }
}
