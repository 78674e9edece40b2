//! Sleep/wake segmentation
//!
//! The heart rate stream is resampled and fed through a three-state
//! hysteresis machine:
//!
//! ```text
//!   Awake --(low HR for min_sleep_minutes)--> Asleep
//!   Asleep --(HR >= wake threshold)--> PendingWake
//!   PendingWake --(HR <= sleep threshold)--> Asleep        (false wake)
//!   PendingWake --(wake_confirm_minutes elapsed)--> Awake  (phase + wake event)
//! ```
//!
//! Samples between the two thresholds never change state. Detected wake
//! events (or local midnights) then bound the cycles the optimizer fits.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::energy::aggregate_heart_rate;
use crate::error::Result;
use crate::models::{
    CycleData, EnergyDataPoint, HrDataPoint, SleepConfig, SleepCycle, SleepPhase, WakeEvent,
};

/// Start energy for a cycle without any earlier validated entry
pub const DEFAULT_START_ENERGY: f64 = 50.0;

const SECONDS_PER_DAY: i64 = 86_400;

/// Detector state between two samples
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SleepState {
    /// Accumulating low heart rate time towards sleep onset
    Awake {
        onset: Option<DateTime<Utc>>,
        low_minutes: f64,
        spike_minutes: f64,
    },
    Asleep {
        onset: DateTime<Utc>,
    },
    /// Heart rate crossed the wake threshold, waiting for confirmation
    PendingWake {
        onset: DateTime<Utc>,
        crossing: DateTime<Utc>,
    },
}

impl Default for SleepState {
    fn default() -> Self {
        SleepState::awake()
    }
}

/// Observable effect of one state transition
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SleepTransition {
    FellAsleep { onset: DateTime<Utc> },
    /// A wake crossing fell back below the sleep threshold
    FalseWake,
    Woke { phase: SleepPhase, wake: WakeEvent },
}

impl SleepState {
    fn awake() -> Self {
        SleepState::Awake {
            onset: None,
            low_minutes: 0.0,
            spike_minutes: 0.0,
        }
    }

    /// Advance by one sample.
    ///
    /// `elapsed_minutes` is the time since the previous sample (zero for the
    /// first one).
    pub fn step(
        self,
        sample: &HrDataPoint,
        elapsed_minutes: f64,
        config: &SleepConfig,
    ) -> (SleepState, Option<SleepTransition>) {
        let is_low = sample.bpm <= config.sleep_hr_threshold;
        let is_wake = sample.bpm >= config.wake_hr_threshold;

        match self {
            SleepState::Awake {
                onset,
                low_minutes,
                spike_minutes,
            } => {
                if is_low {
                    let (onset, low_minutes) = match onset {
                        Some(onset) => (onset, low_minutes + elapsed_minutes),
                        None => (sample.timestamp, 0.0),
                    };
                    if low_minutes >= f64::from(config.min_sleep_minutes) {
                        (
                            SleepState::Asleep { onset },
                            Some(SleepTransition::FellAsleep { onset }),
                        )
                    } else {
                        (
                            SleepState::Awake {
                                onset: Some(onset),
                                low_minutes,
                                spike_minutes: 0.0,
                            },
                            None,
                        )
                    }
                } else if is_wake && onset.is_some() {
                    let spike_minutes = spike_minutes + elapsed_minutes;
                    if spike_minutes > f64::from(config.spike_tolerance_minutes) {
                        (SleepState::awake(), None)
                    } else {
                        (
                            SleepState::Awake {
                                onset,
                                low_minutes,
                                spike_minutes,
                            },
                            None,
                        )
                    }
                } else {
                    (
                        SleepState::Awake {
                            onset,
                            low_minutes,
                            spike_minutes: 0.0,
                        },
                        None,
                    )
                }
            }

            SleepState::Asleep { onset } => {
                if !is_wake {
                    return (self, None);
                }
                let pending = SleepState::PendingWake {
                    onset,
                    crossing: sample.timestamp,
                };
                if config.wake_confirm_minutes == 0 {
                    pending.confirm()
                } else {
                    (pending, None)
                }
            }

            SleepState::PendingWake { onset, crossing } => {
                if is_low {
                    (
                        SleepState::Asleep { onset },
                        Some(SleepTransition::FalseWake),
                    )
                } else if sample.timestamp - crossing
                    >= Duration::minutes(i64::from(config.wake_confirm_minutes))
                {
                    self.confirm()
                } else {
                    (self, None)
                }
            }
        }
    }

    /// Close out the stream. A pending wake is confirmed; an unfinished
    /// sleep produces nothing.
    pub fn finish(self) -> Option<SleepTransition> {
        match self {
            SleepState::PendingWake { .. } => self.confirm().1,
            _ => None,
        }
    }

    fn confirm(self) -> (SleepState, Option<SleepTransition>) {
        match self {
            SleepState::PendingWake { onset, crossing } => (
                SleepState::awake(),
                Some(SleepTransition::Woke {
                    phase: SleepPhase {
                        start: onset,
                        end: crossing,
                    },
                    wake: WakeEvent {
                        timestamp: crossing,
                    },
                }),
            ),
            other => (other, None),
        }
    }
}

/// Everything the detector derives from one heart rate stream
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SleepAnalysis {
    pub phases: Vec<SleepPhase>,
    pub wake_events: Vec<WakeEvent>,
    pub cycles: Vec<SleepCycle>,
}

/// Segments heart rate into sleep phases, wake events and cycles
#[derive(Debug, Clone)]
pub struct SleepDetector {
    config: SleepConfig,
}

impl SleepDetector {
    pub fn new(config: SleepConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &SleepConfig {
        &self.config
    }

    /// Run the state machine over `hr` and derive cycles.
    ///
    /// Empty input yields an empty analysis.
    pub fn detect(&self, hr: &[HrDataPoint]) -> SleepAnalysis {
        let (first, last) = match (hr.first(), hr.last()) {
            (Some(first), Some(last)) => (first.timestamp, last.timestamp),
            _ => return SleepAnalysis::default(),
        };

        let samples = aggregate_heart_rate(hr, self.config.aggregation_minutes);
        let mut analysis = SleepAnalysis::default();
        let mut state = SleepState::default();
        let mut previous: Option<DateTime<Utc>> = None;

        for sample in &samples {
            let elapsed = previous
                .map(|p| (sample.timestamp - p).num_seconds() as f64 / 60.0)
                .unwrap_or(0.0);
            previous = Some(sample.timestamp);

            let (next, transition) = state.step(sample, elapsed, &self.config);
            state = next;
            if let Some(transition) = transition {
                record(&mut analysis, transition);
            }
        }
        if let Some(transition) = state.finish() {
            record(&mut analysis, transition);
        }

        let span_end = last + Duration::minutes(i64::from(self.config.aggregation_minutes));

        analysis.cycles = if self.config.reset_on_wake {
            self.cycles_between_wakes(first, span_end, &analysis.wake_events)
        } else {
            self.calendar_cycles(first, span_end)
        };

        debug!(
            phases = analysis.phases.len(),
            wake_events = analysis.wake_events.len(),
            cycles = analysis.cycles.len(),
            "sleep detection finished"
        );

        analysis
    }

    fn cycles_between_wakes(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        wake_events: &[WakeEvent],
    ) -> Vec<SleepCycle> {
        let mut boundaries = vec![start];
        boundaries.extend(
            wake_events
                .iter()
                .map(|w| w.timestamp)
                .filter(|t| *t > start && *t < end),
        );
        boundaries.push(end);

        boundaries
            .windows(2)
            .map(|w| SleepCycle {
                cycle_start: w[0],
                cycle_end: w[1],
                label: self.local_label(w[0]),
            })
            .collect()
    }

    fn calendar_cycles(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<SleepCycle> {
        let offset = i64::from(self.config.utc_offset_minutes) * 60;
        let first_day = (start.timestamp() + offset).div_euclid(SECONDS_PER_DAY);
        let mut cycles = Vec::new();

        let mut day = first_day;
        loop {
            let day_start = DateTime::<Utc>::from_timestamp(day * SECONDS_PER_DAY - offset, 0);
            let day_end = DateTime::<Utc>::from_timestamp((day + 1) * SECONDS_PER_DAY - offset, 0);
            let (cycle_start, cycle_end) = match (day_start, day_end) {
                (Some(s), Some(e)) if s < end => (s, e),
                _ => break,
            };
            cycles.push(SleepCycle {
                cycle_start,
                cycle_end,
                label: self.local_label(cycle_start),
            });
            day += 1;
        }

        cycles
    }

    /// Local calendar date of `at` as YYYY-MM-DD
    pub fn local_label(&self, at: DateTime<Utc>) -> String {
        let shifted = at + Duration::minutes(i64::from(self.config.utc_offset_minutes));
        shifted.format("%Y-%m-%d").to_string()
    }
}

fn record(analysis: &mut SleepAnalysis, transition: SleepTransition) {
    if let SleepTransition::Woke { phase, wake } = transition {
        analysis.phases.push(phase);
        analysis.wake_events.push(wake);
    }
}

/// Slice heart rate and validated entries into cycles.
///
/// Each cycle covers `[cycle_start, cycle_end)`. Its start energy is the last
/// validated percentage strictly before the cycle, otherwise
/// `fallback_start_energy`.
pub fn build_cycle_data(
    cycles: &[SleepCycle],
    hr: &[HrDataPoint],
    validated: &[EnergyDataPoint],
    fallback_start_energy: f64,
) -> Vec<CycleData> {
    let mut ground_truth: Vec<&EnergyDataPoint> =
        validated.iter().filter(|v| v.is_validated()).collect();
    ground_truth.sort_by_key(|v| v.timestamp);

    cycles
        .iter()
        .map(|cycle| {
            let hr_begin = hr.partition_point(|p| p.timestamp < cycle.cycle_start);
            let hr_end = hr.partition_point(|p| p.timestamp < cycle.cycle_end);
            let v_begin = ground_truth.partition_point(|v| v.timestamp < cycle.cycle_start);
            let v_end = ground_truth.partition_point(|v| v.timestamp < cycle.cycle_end);

            let start_energy = v_begin
                .checked_sub(1)
                .and_then(|i| ground_truth.get(i))
                .map(|v| v.percentage)
                .unwrap_or(fallback_start_energy);

            CycleData {
                label: cycle.label.clone(),
                cycle_start: cycle.cycle_start,
                cycle_end: cycle.cycle_end,
                validated_points: ground_truth[v_begin..v_end]
                    .iter()
                    .map(|v| (*v).clone())
                    .collect(),
                hr_data: hr[hr_begin..hr_end].to_vec(),
                start_energy,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 10, 0, 0, 0).unwrap()
    }

    fn at(minutes: i64) -> DateTime<Utc> {
        t0() + Duration::minutes(minutes)
    }

    fn series(bpms: &[f64]) -> Vec<HrDataPoint> {
        bpms.iter()
            .enumerate()
            .map(|(i, bpm)| HrDataPoint::new(at(15 * i as i64), *bpm))
            .collect()
    }

    fn config() -> SleepConfig {
        SleepConfig {
            min_sleep_minutes: 60,
            ..SleepConfig::default()
        }
    }

    #[test]
    fn test_low_stretch_falls_asleep() {
        let config = config();
        let mut state = SleepState::default();
        let mut fell_asleep = None;
        for (i, sample) in series(&[55.0; 5]).iter().enumerate() {
            let elapsed = if i == 0 { 0.0 } else { 15.0 };
            let (next, transition) = state.step(sample, elapsed, &config);
            state = next;
            if transition.is_some() {
                fell_asleep = transition;
            }
        }
        assert_eq!(state, SleepState::Asleep { onset: at(0) });
        assert_eq!(fell_asleep, Some(SleepTransition::FellAsleep { onset: at(0) }));
    }

    #[test]
    fn test_band_samples_hold_progress() {
        let config = config();
        let state = SleepState::Awake {
            onset: Some(at(0)),
            low_minutes: 30.0,
            spike_minutes: 0.0,
        };
        let (next, transition) = state.step(&HrDataPoint::new(at(45), 66.0), 15.0, &config);
        assert_eq!(next, state);
        assert!(transition.is_none());
    }

    #[test]
    fn test_short_spike_tolerated_long_spike_resets() {
        let config = config();
        let state = SleepState::Awake {
            onset: Some(at(0)),
            low_minutes: 30.0,
            spike_minutes: 0.0,
        };
        let (state, _) = state.step(&HrDataPoint::new(at(45), 80.0), 15.0, &config);
        assert!(matches!(state, SleepState::Awake { onset: Some(_), .. }));

        let (state, _) = state.step(&HrDataPoint::new(at(60), 80.0), 15.0, &config);
        assert_eq!(state, SleepState::awake());
    }

    #[test]
    fn test_asleep_to_pending_to_false_wake() {
        let config = config();
        let asleep = SleepState::Asleep { onset: at(0) };

        let (pending, transition) = asleep.step(&HrDataPoint::new(at(90), 75.0), 15.0, &config);
        assert_eq!(
            pending,
            SleepState::PendingWake {
                onset: at(0),
                crossing: at(90)
            }
        );
        assert!(transition.is_none());

        let (back, transition) = pending.step(&HrDataPoint::new(at(95), 58.0), 5.0, &config);
        assert_eq!(back, asleep);
        assert_eq!(transition, Some(SleepTransition::FalseWake));
    }

    #[test]
    fn test_pending_wake_confirms_after_delay() {
        let config = config();
        let pending = SleepState::PendingWake {
            onset: at(0),
            crossing: at(90),
        };
        let (still, transition) = pending.step(&HrDataPoint::new(at(100), 72.0), 10.0, &config);
        assert_eq!(still, pending);
        assert!(transition.is_none());

        let (awake, transition) = pending.step(&HrDataPoint::new(at(105), 66.0), 15.0, &config);
        assert_eq!(awake, SleepState::awake());
        assert_eq!(
            transition,
            Some(SleepTransition::Woke {
                phase: SleepPhase {
                    start: at(0),
                    end: at(90)
                },
                wake: WakeEvent { timestamp: at(90) },
            })
        );
    }

    #[test]
    fn test_exact_minimum_then_jump_yields_one_phase() {
        let detector = SleepDetector::new(config()).unwrap();
        let hr = series(&[55.0, 55.0, 55.0, 55.0, 55.0, 80.0]);
        let analysis = detector.detect(&hr);

        assert_eq!(analysis.phases.len(), 1);
        assert_eq!(analysis.wake_events.len(), 1);
        assert_eq!(analysis.phases[0].start, at(0));
        assert_eq!(analysis.phases[0].end, at(75));
        assert!(analysis.phases[0].duration_minutes() >= 60.0);
        assert_eq!(analysis.wake_events[0].timestamp, at(75));
    }

    #[test]
    fn test_unfinished_sleep_yields_no_phase() {
        let detector = SleepDetector::new(config()).unwrap();
        let analysis = detector.detect(&series(&[55.0; 10]));
        assert!(analysis.phases.is_empty());
        assert!(analysis.wake_events.is_empty());
    }

    #[test]
    fn test_reset_on_wake_cycles_cover_span() {
        let detector = SleepDetector::new(SleepConfig {
            reset_on_wake: true,
            ..config()
        })
        .unwrap();
        let mut bpms = vec![75.0; 4];
        bpms.extend([55.0; 6]);
        bpms.extend([85.0; 6]);
        let analysis = detector.detect(&series(&bpms));

        assert_eq!(analysis.wake_events.len(), 1);
        assert_eq!(analysis.cycles.len(), 2);
        assert_eq!(analysis.cycles[0].cycle_start, at(0));
        assert_eq!(analysis.cycles[0].cycle_end, analysis.wake_events[0].timestamp);
        assert_eq!(analysis.cycles[1].cycle_start, analysis.cycles[0].cycle_end);
        assert!(analysis.cycles[1].cycle_end > at(15 * 15));
    }

    #[test]
    fn test_calendar_cycles_follow_local_midnight() {
        let detector = SleepDetector::new(SleepConfig {
            utc_offset_minutes: 60,
            ..config()
        })
        .unwrap();
        // 2024-02-10 22:00 UTC to 2024-02-12 01:00 UTC
        let start = t0() + Duration::hours(22);
        let hr: Vec<HrDataPoint> = (0..=27)
            .map(|h| HrDataPoint::new(start + Duration::hours(h), 70.0))
            .collect();
        let analysis = detector.detect(&hr);

        let labels: Vec<&str> = analysis.cycles.iter().map(|c| c.label.as_str()).collect();
        assert_eq!(labels, vec!["2024-02-10", "2024-02-11", "2024-02-12"]);
        // local midnight at UTC+1 is 23:00 UTC
        assert_eq!(analysis.cycles[1].cycle_start, t0() + Duration::hours(23));
        for pair in analysis.cycles.windows(2) {
            assert_eq!(pair[0].cycle_end, pair[1].cycle_start);
        }
    }

    #[test]
    fn test_detect_empty_input() {
        let detector = SleepDetector::new(config()).unwrap();
        assert_eq!(detector.detect(&[]), SleepAnalysis::default());
    }

    #[test]
    fn test_invalid_thresholds_rejected() {
        let config = SleepConfig {
            sleep_hr_threshold: 72.0,
            wake_hr_threshold: 68.0,
            ..SleepConfig::default()
        };
        assert!(SleepDetector::new(config).is_err());
    }

    #[test]
    fn test_build_cycle_data_start_energy() {
        let cycles = vec![
            SleepCycle {
                cycle_start: at(0),
                cycle_end: at(60),
                label: "a".into(),
            },
            SleepCycle {
                cycle_start: at(60),
                cycle_end: at(120),
                label: "b".into(),
            },
        ];
        let hr = series(&[70.0; 8]);
        let validated = vec![
            EnergyDataPoint::validated(at(30), 64.0),
            EnergyDataPoint::validated(at(45), 61.0),
            EnergyDataPoint {
                timestamp: at(50),
                percentage: 10.0,
                validation: None,
            },
            EnergyDataPoint::validated(at(90), 55.0),
        ];

        let data = build_cycle_data(&cycles, &hr, &validated, DEFAULT_START_ENERGY);
        assert_eq!(data[0].start_energy, 50.0);
        assert_eq!(data[0].validated_points.len(), 2);
        assert_eq!(data[0].hr_data.len(), 4);
        assert_eq!(data[1].start_energy, 61.0);
        assert_eq!(data[1].validated_points.len(), 1);
        assert_eq!(data[1].hr_data.len(), 4);
    }
}
