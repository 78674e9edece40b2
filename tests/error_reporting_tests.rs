//! Integration tests for error classification and user facing messages
//!
//! Covers the failure paths a caller sees from CSV input and the engine

use chrono::{Duration, TimeZone, Utc};
use std::fs;

use pacing::config::PacingConfig;
use pacing::engine::EnergyEngine;
use pacing::error::{CalculationError, ErrorSeverity, ImportError, OptimizationError, PacingError};
use pacing::io;
use pacing::models::{AggregationMethod, EnergyDataPoint, FitRange, HrDataPoint};

#[test]
fn test_missing_column_is_reported_with_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hr.csv");
    fs::write(&path, "timestamp,power\n2024-01-01 08:00:00,210\n").unwrap();

    let err = io::read_heart_rate(&path).unwrap_err();
    assert!(matches!(err, PacingError::Import(ImportError::MissingColumn { .. })));
    assert_eq!(err.severity(), ErrorSeverity::Error);
    assert!(err.is_contract_violation());

    let message = err.user_message();
    assert!(message.contains("hr.csv"));
    assert!(message.contains("bpm"));
}

#[test]
fn test_unreadable_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = io::read_energy(dir.path().join("missing.csv")).unwrap_err();
    assert!(matches!(err, PacingError::Io(_)));
}

#[test]
fn test_bad_timestamp_names_the_line() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("energy.csv");
    fs::write(
        &path,
        "timestamp,percentage\n2024-01-01T08:00:00Z,70\nnot a time,65\n",
    )
    .unwrap();

    let err = io::read_energy(&path).unwrap_err();
    assert!(err.to_string().contains("line 3"), "{}", err);
}

#[test]
fn test_empty_range_is_not_a_contract_violation() {
    let engine = EnergyEngine::new(PacingConfig::default()).unwrap();
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let hr: Vec<HrDataPoint> = (0..96)
        .map(|i| HrDataPoint::new(start + Duration::minutes(15 * i), 70.0))
        .collect();
    // a single entry cannot support a fit
    let entries = vec![EnergyDataPoint::validated(start + Duration::hours(9), 60.0)];

    let err = engine
        .auto_fit(&hr, &entries, FitRange::All, AggregationMethod::Median, None, start)
        .unwrap_err();

    assert!(matches!(
        err,
        PacingError::Optimization(OptimizationError::EmptyRange { total_days: 1, .. })
    ));
    assert!(!err.is_contract_violation());
    assert_eq!(err.severity(), ErrorSeverity::Warning);
    assert!(err.user_message().contains("enough validated energy entries"));
}

#[test]
fn test_invalid_energy_config_is_rejected() {
    let engine = EnergyEngine::new(PacingConfig::default()).unwrap();
    let mut config = engine.config().energy.clone();
    config.hr_low = config.hr_high;

    let hr = vec![HrDataPoint::new(Utc::now(), 70.0)];
    let err = engine.evaluate(&hr, None, &config, 50.0).unwrap_err();

    assert!(matches!(
        err,
        PacingError::Calculation(CalculationError::InvalidConfig { .. })
    ));
    assert!(err.is_contract_violation());
}

#[test]
fn test_empty_heart_rate_is_insufficient_data() {
    let engine = EnergyEngine::new(PacingConfig::default()).unwrap();
    let config = engine.config().energy.clone();

    let err = engine.evaluate(&[], None, &config, 50.0).unwrap_err();
    assert!(matches!(
        err,
        PacingError::Calculation(CalculationError::InsufficientData { .. })
    ));
    assert_eq!(err.severity(), ErrorSeverity::Warning);
}
