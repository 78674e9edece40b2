//! CSV input and output
//!
//! Expected layouts (header names are case-insensitive, common aliases are
//! accepted):
//!
//! - heart rate: `timestamp,bpm`
//! - HRV: `timestamp,rmssd`
//! - energy entries: `timestamp,percentage[,validation]`
//!
//! Timestamps may be RFC 3339, one of several naive formats (read as UTC) or
//! epoch seconds. Rows are returned sorted by time with duplicate timestamps
//! collapsed to the first row.

use chrono::{DateTime, NaiveDateTime, Utc};
use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{ImportError, PacingError, Result};
use crate::models::{EnergyDataPoint, EnergyPoint, HrDataPoint, HrvPoint, Validation};

const DATETIME_FORMATS: [&str; 8] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%SZ",
    "%Y-%m-%dT%H:%M:%S%.fZ",
    "%d/%m/%Y %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

/// Maps header variations onto canonical column names
struct ColumnMapping {
    aliases: HashMap<String, &'static str>,
}

impl ColumnMapping {
    fn new() -> Self {
        let mut aliases = HashMap::new();
        Self::add(&mut aliases, "timestamp", &["timestamp", "time", "datetime", "date", "start_time"]);
        Self::add(&mut aliases, "bpm", &["bpm", "heart_rate", "hr", "heartrate"]);
        Self::add(&mut aliases, "rmssd", &["rmssd", "hrv", "hrv_rmssd"]);
        Self::add(&mut aliases, "percentage", &["percentage", "energy", "energy_level", "level"]);
        Self::add(&mut aliases, "validation", &["validation", "validated", "status"]);
        Self { aliases }
    }

    fn add(aliases: &mut HashMap<String, &'static str>, standard: &'static str, variations: &[&str]) {
        for variation in variations {
            aliases.insert(variation.to_lowercase(), standard);
        }
    }

    /// Canonical column name to index
    fn resolve(&self, headers: &StringRecord) -> HashMap<&'static str, usize> {
        headers
            .iter()
            .enumerate()
            .filter_map(|(idx, name)| {
                let normalized = name.trim().to_lowercase().replace([' ', '-'], "_");
                self.aliases.get(normalized.as_str()).map(|standard| (*standard, idx))
            })
            .collect()
    }
}

/// Parse a timestamp in any supported format
pub fn parse_datetime(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }

    for format in &DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(DateTime::from_naive_utc_and_offset(naive, Utc));
        }
    }

    value
        .parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
}

struct CsvTable {
    path: PathBuf,
    columns: HashMap<&'static str, usize>,
    rows: Vec<(u64, StringRecord)>,
}

impl CsvTable {
    fn read<R: Read>(reader: R, path: &Path, required: &[&'static str]) -> Result<Self> {
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers = reader.headers().map_err(ImportError::from)?.clone();
        let columns = ColumnMapping::new().resolve(&headers);

        for column in required {
            if !columns.contains_key(column) {
                return Err(ImportError::MissingColumn {
                    path: path.to_path_buf(),
                    column: column.to_string(),
                }
                .into());
            }
        }

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(ImportError::from)?;
            let line = record.position().map(|p| p.line()).unwrap_or(0);
            if record.iter().all(|field| field.is_empty()) {
                continue;
            }
            rows.push((line, record));
        }

        Ok(Self {
            path: path.to_path_buf(),
            columns,
            rows,
        })
    }

    fn field<'r>(&self, record: &'r StringRecord, column: &str) -> Option<&'r str> {
        self.columns
            .get(column)
            .and_then(|idx| record.get(*idx))
            .filter(|value| !value.is_empty())
    }

    fn parse_error(&self, line: u64, reason: String) -> PacingError {
        ImportError::ParseError {
            path: self.path.clone(),
            line,
            reason,
        }
        .into()
    }

    fn timestamp(&self, line: u64, record: &StringRecord) -> Result<DateTime<Utc>> {
        let raw = self.field(record, "timestamp").unwrap_or_default();
        parse_datetime(raw)
            .ok_or_else(|| self.parse_error(line, format!("unrecognised timestamp '{}'", raw)))
    }

    fn number(&self, line: u64, record: &StringRecord, column: &str) -> Result<f64> {
        let raw = self.field(record, column).unwrap_or_default();
        raw.parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| self.parse_error(line, format!("invalid {} '{}'", column, raw)))
    }
}

/// Read heart rate samples from any reader
pub fn parse_heart_rate<R: Read>(reader: R, path: &Path) -> Result<Vec<HrDataPoint>> {
    let table = CsvTable::read(reader, path, &["timestamp", "bpm"])?;
    let mut points = table
        .rows
        .iter()
        .map(|(line, record)| {
            Ok(HrDataPoint::new(
                table.timestamp(*line, record)?,
                table.number(*line, record, "bpm")?,
            ))
        })
        .collect::<Result<Vec<_>>>()?;

    points.sort_by_key(|p| p.timestamp);
    points.dedup_by_key(|p| p.timestamp);
    Ok(points)
}

/// Read HRV samples from any reader
pub fn parse_hrv<R: Read>(reader: R, path: &Path) -> Result<Vec<HrvPoint>> {
    let table = CsvTable::read(reader, path, &["timestamp", "rmssd"])?;
    let mut points = table
        .rows
        .iter()
        .map(|(line, record)| {
            Ok(HrvPoint::new(
                table.timestamp(*line, record)?,
                table.number(*line, record, "rmssd")?,
            ))
        })
        .collect::<Result<Vec<_>>>()?;

    points.sort_by_key(|p| p.timestamp);
    points.dedup_by_key(|p| p.timestamp);
    Ok(points)
}

/// Read energy entries from any reader.
///
/// Without a `validation` column every row counts as validated. Rows sharing
/// a timestamp collapse into one, a validated row winning over a predicted one.
pub fn parse_energy<R: Read>(reader: R, path: &Path) -> Result<Vec<EnergyDataPoint>> {
    let table = CsvTable::read(reader, path, &["timestamp", "percentage"])?;
    let has_validation = table.columns.contains_key("validation");

    let mut points = table
        .rows
        .iter()
        .map(|(line, record)| {
            let validation = if has_validation {
                match table.field(record, "validation") {
                    Some(tag) => Some(
                        tag.parse::<Validation>()
                            .map_err(|reason| table.parse_error(*line, reason))?,
                    ),
                    None => None,
                }
            } else {
                Some(Validation::Correct)
            };

            Ok(EnergyDataPoint {
                timestamp: table.timestamp(*line, record)?,
                percentage: table.number(*line, record, "percentage")?,
                validation,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    // validated rows first within a timestamp so deduplication keeps them
    points.sort_by_key(|p| (p.timestamp, !p.is_validated()));
    points.dedup_by_key(|p| p.timestamp);
    Ok(points)
}

pub fn read_heart_rate<P: AsRef<Path>>(path: P) -> Result<Vec<HrDataPoint>> {
    let path = path.as_ref();
    parse_heart_rate(File::open(path)?, path)
}

pub fn read_hrv<P: AsRef<Path>>(path: P) -> Result<Vec<HrvPoint>> {
    let path = path.as_ref();
    parse_hrv(File::open(path)?, path)
}

pub fn read_energy<P: AsRef<Path>>(path: P) -> Result<Vec<EnergyDataPoint>> {
    let path = path.as_ref();
    parse_energy(File::open(path)?, path)
}

/// Write an energy curve as `timestamp,energy,hrv_multiplier`
pub fn write_energy_curve<W: Write>(writer: W, curve: &[EnergyPoint]) -> Result<()> {
    let mut writer = WriterBuilder::new().has_headers(true).from_writer(writer);
    for point in curve {
        writer.serialize(point).map_err(ImportError::from)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn path() -> PathBuf {
        PathBuf::from("test.csv")
    }

    #[test]
    fn test_parse_datetime_variants() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 7, 30, 0).unwrap();
        assert_eq!(parse_datetime("2024-03-01T07:30:00Z"), Some(expected));
        assert_eq!(parse_datetime("2024-03-01T08:30:00+01:00"), Some(expected));
        assert_eq!(parse_datetime("2024-03-01 07:30:00"), Some(expected));
        assert_eq!(parse_datetime("2024-03-01 07:30"), Some(expected));
        assert_eq!(parse_datetime("1709278200"), Some(expected));
        assert_eq!(parse_datetime("yesterday"), None);
    }

    #[test]
    fn test_heart_rate_with_aliases_sorted() {
        let data = "Time,Heart Rate\n\
                    2024-03-01 07:45:00,64\n\
                    2024-03-01 07:30:00,61.5\n\
                    2024-03-01 07:30:00,99\n";
        let points = parse_heart_rate(data.as_bytes(), &path()).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].bpm, 61.5);
        assert_eq!(points[1].bpm, 64.0);
    }

    #[test]
    fn test_missing_column() {
        let data = "timestamp,power\n2024-03-01 07:30:00,200\n";
        let err = parse_heart_rate(data.as_bytes(), &path()).unwrap_err();
        assert!(matches!(
            err,
            PacingError::Import(ImportError::MissingColumn { ref column, .. }) if column == "bpm"
        ));
    }

    #[test]
    fn test_bad_value_reports_line() {
        let data = "timestamp,bpm\n2024-03-01 07:30:00,60\n2024-03-01 07:45:00,fast\n";
        let err = parse_heart_rate(data.as_bytes(), &path()).unwrap_err();
        match err {
            PacingError::Import(ImportError::ParseError { line, reason, .. }) => {
                assert_eq!(line, 3);
                assert!(reason.contains("fast"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_energy_validation_column() {
        let data = "timestamp,percentage,validation\n\
                    2024-03-01T07:30:00Z,70,correct\n\
                    2024-03-01T09:30:00Z,55,\n\
                    2024-03-01T11:30:00Z,48,adjusted\n";
        let points = parse_energy(data.as_bytes(), &path()).unwrap();
        assert_eq!(points.len(), 3);
        assert_eq!(points[0].validation, Some(Validation::Correct));
        assert_eq!(points[1].validation, None);
        assert_eq!(points[2].validation, Some(Validation::Adjusted));
    }

    #[test]
    fn test_duplicate_energy_timestamp_keeps_validated_row() {
        let data = "timestamp,percentage,validation\n\
                    2024-03-01T07:30:00Z,20,\n\
                    2024-03-01T07:30:00Z,70,correct\n\
                    2024-03-01T09:30:00Z,55,\n";
        let points = parse_energy(data.as_bytes(), &path()).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].percentage, 70.0);
        assert_eq!(points[0].validation, Some(Validation::Correct));
        assert_eq!(points[1].validation, None);
    }

    #[test]
    fn test_energy_without_validation_column_is_ground_truth() {
        let data = "timestamp,energy\n2024-03-01T07:30:00Z,70\n";
        let points = parse_energy(data.as_bytes(), &path()).unwrap();
        assert!(points[0].is_validated());
    }

    #[test]
    fn test_hrv_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("hrv.csv");
        std::fs::write(&file, "timestamp,rmssd\n1709278200,42.5\n").unwrap();
        let points = read_hrv(&file).unwrap();
        assert_eq!(points, vec![HrvPoint::new(Utc.with_ymd_and_hms(2024, 3, 1, 7, 30, 0).unwrap(), 42.5)]);
    }

    #[test]
    fn test_write_energy_curve() {
        let curve = vec![EnergyPoint {
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 7, 30, 0).unwrap(),
            energy: 61.25,
            hrv_multiplier: 1.0,
        }];
        let mut out = Vec::new();
        write_energy_curve(&mut out, &curve).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("timestamp,energy,hrv_multiplier"));
        assert!(text.contains("61.25"));
    }
}
