// Library interface for the pacing engine
// The `pacing` binary and the integration tests build on these modules

pub mod calculus;
pub mod config;
pub mod decay;
pub mod energy;
pub mod engine;
pub mod error;
pub mod hrv;
pub mod io;
pub mod logging;
pub mod models;
pub mod optimizer;
pub mod sleep;
pub mod stats;

// Re-export commonly used types for convenience
pub use models::*;
pub use config::PacingConfig;
pub use decay::{DecayConfig, DecayRateAnalyzer};
pub use energy::EnergyModel;
pub use engine::EnergyEngine;
pub use error::{PacingError, Result};
pub use hrv::HrvDrainAdjuster;
pub use logging::{LogConfig, LogFormat, LogLevel};
pub use optimizer::{CancellationToken, OptimizerConfig, ParameterBounds, ParameterOptimizer};
pub use sleep::{SleepAnalysis, SleepDetector, SleepState, SleepTransition};
