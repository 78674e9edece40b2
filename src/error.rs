//! Unified error hierarchy for the pacing engine
//!
//! Numeric and model errors describe a violated input contract and always
//! propagate to the caller. "No result because there is no data" is never an
//! error: those paths return empty or absent values instead.

use std::path::PathBuf;
use thiserror::Error;

use crate::models::FitRange;

/// Top-level error type for all pacing operations
#[derive(Debug, Error)]
pub enum PacingError {
    /// Numeric and model evaluation errors
    #[error("Calculation error: {0}")]
    Calculation(#[from] CalculationError),

    /// Parameter search errors
    #[error("Optimization error: {0}")]
    Optimization(#[from] OptimizationError),

    /// CSV ingestion errors
    #[error("Import error: {0}")]
    Import(#[from] ImportError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file errors
    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Calculation errors
#[derive(Debug, Error)]
pub enum CalculationError {
    /// Too few samples for a numeric operation
    #[error("Insufficient data for {calculation}: {reason}")]
    InsufficientData { calculation: String, reason: String },

    /// Parameter bounds violated
    #[error("Invalid configuration: {parameter}={value} ({reason})")]
    InvalidConfig {
        parameter: String,
        value: String,
        reason: String,
    },
}

/// Optimizer errors
#[derive(Debug, Error)]
pub enum OptimizationError {
    /// Iteration budget exhausted before the simplex collapsed
    #[error("No convergence after {iterations} iterations (best loss {best_loss:.4})")]
    NoConvergence { iterations: usize, best_loss: f64 },

    /// The selected range contains zero usable cycles
    #[error("No usable cycles in range {range:?} ({total_days} days considered)")]
    EmptyRange { range: FitRange, total_days: usize },

    /// Caller requested cancellation
    #[error("Optimization cancelled")]
    Cancelled,
}

/// CSV ingestion errors
#[derive(Debug, Error)]
pub enum ImportError {
    /// Required column missing from the header
    #[error("Missing column '{column}' in {path}")]
    MissingColumn { path: PathBuf, column: String },

    /// A field could not be parsed
    #[error("Parse error in {path} line {line}: {reason}")]
    ParseError {
        path: PathBuf,
        line: u64,
        reason: String,
    },

    /// Underlying CSV reader error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Result type alias for pacing operations
pub type Result<T> = std::result::Result<T, PacingError>;

impl PacingError {
    /// Shorthand for [`CalculationError::InsufficientData`]
    pub fn insufficient_data(calculation: impl Into<String>, reason: impl Into<String>) -> Self {
        PacingError::Calculation(CalculationError::InsufficientData {
            calculation: calculation.into(),
            reason: reason.into(),
        })
    }

    /// Shorthand for [`CalculationError::InvalidConfig`]
    pub fn invalid_config(
        parameter: impl Into<String>,
        value: impl ToString,
        reason: impl Into<String>,
    ) -> Self {
        PacingError::Calculation(CalculationError::InvalidConfig {
            parameter: parameter.into(),
            value: value.to_string(),
            reason: reason.into(),
        })
    }

    /// True when the caller handed in data or parameters that break an input
    /// contract, as opposed to a search that simply found nothing usable.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            PacingError::Calculation(_) | PacingError::Import(_) | PacingError::Configuration(_)
        )
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            PacingError::Calculation(CalculationError::InsufficientData { .. }) => {
                ErrorSeverity::Warning
            }
            PacingError::Calculation(CalculationError::InvalidConfig { .. }) => ErrorSeverity::Error,
            PacingError::Optimization(OptimizationError::Cancelled) => ErrorSeverity::Info,
            PacingError::Optimization(OptimizationError::EmptyRange { .. }) => {
                ErrorSeverity::Warning
            }
            PacingError::Optimization(OptimizationError::NoConvergence { .. }) => {
                ErrorSeverity::Warning
            }
            PacingError::Import(_) => ErrorSeverity::Error,
            PacingError::Io(_) => ErrorSeverity::Error,
            PacingError::Configuration(_) => ErrorSeverity::Critical,
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            PacingError::Calculation(CalculationError::InsufficientData { calculation, .. }) => {
                format!(
                    "Not enough data to calculate {}. Record more heart rate or energy entries.",
                    calculation
                )
            }
            PacingError::Optimization(OptimizationError::EmptyRange { range, .. }) => {
                format!(
                    "No day in the selected range ({:?}) has enough validated energy entries to fit.",
                    range
                )
            }
            PacingError::Import(ImportError::MissingColumn { path, column }) => {
                format!("{} has no '{}' column", path.display(), column)
            }
            _ => self.to_string(),
        }
    }
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical error, the engine cannot run
    Critical,
    /// Error that prevents the operation
    Error,
    /// Warning that doesn't prevent other operations
    Warning,
    /// Informational message
    Info,
}

impl ErrorSeverity {
    /// Convert to tracing level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            ErrorSeverity::Critical => tracing::Level::ERROR,
            ErrorSeverity::Error => tracing::Level::ERROR,
            ErrorSeverity::Warning => tracing::Level::WARN,
            ErrorSeverity::Info => tracing::Level::INFO,
        }
    }
}
