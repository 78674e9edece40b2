use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use colored::*;
use serde::Serialize;
use std::fs::File;
use std::path::{Path, PathBuf};

use pacing::config::PacingConfig;
use pacing::engine::EnergyEngine;
use pacing::io;
use pacing::logging::init_logging;
use pacing::models::{
    AggregationMethod, DecayRateResult, EnergyDataPoint, EnergyPoint, FitRange,
    OptimizationResult, Prediction, PredictionSource,
};
use pacing::PacingError;

/// Pacing - Energy Estimation CLI
///
/// Estimates an energy curve from heart rate and calibrates the model
/// parameters against validated energy entries.
#[derive(Parser)]
#[command(name = "pacing")]
#[command(version)]
#[command(about = "Energy estimation and calibration for activity pacing", long_about = None)]
struct Cli {
    /// Sets a custom config file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity of output
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute the energy curve for a heart rate recording
    Evaluate {
        /// Heart rate CSV (timestamp,bpm)
        #[arg(long)]
        hr: PathBuf,

        /// HRV CSV (timestamp,rmssd)
        #[arg(long)]
        hrv: Option<PathBuf>,

        /// Energy CSV; validated entries restart the curve
        #[arg(long)]
        energy: Option<PathBuf>,

        /// Starting energy when no entries are given
        #[arg(short, long, default_value = "50")]
        start: f64,

        /// Write the curve to a CSV file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Detect sleep phases, wake events and cycles
    Cycles {
        /// Heart rate CSV (timestamp,bpm)
        #[arg(long)]
        hr: PathBuf,
    },

    /// Estimate hourly decay rates by time of day
    Decay {
        /// Heart rate CSV (timestamp,bpm)
        #[arg(long)]
        hr: Option<PathBuf>,

        /// Energy CSV; rates come from consecutive validated entries
        #[arg(long)]
        energy: Option<PathBuf>,

        /// Use the configured energy parameters instead of the heart rate trend
        #[arg(long)]
        fitted: bool,
    },

    /// Predict energy now and two hours ahead
    Predict {
        /// Heart rate CSV (timestamp,bpm); without it the decay rates are used
        #[arg(long)]
        hr: Option<PathBuf>,

        /// Energy CSV (timestamp,percentage[,validation])
        #[arg(long)]
        energy: PathBuf,

        /// Fit the parameters on all days first instead of using the configured ones
        #[arg(long)]
        fit: bool,
    },

    /// Fit the energy parameters against validated entries
    Fit {
        /// Heart rate CSV (timestamp,bpm)
        #[arg(long)]
        hr: PathBuf,

        /// Energy CSV (timestamp,percentage[,validation])
        #[arg(long)]
        energy: PathBuf,

        /// Days to include (all, month, week)
        #[arg(short, long, default_value = "all")]
        range: FitRange,

        /// How per-day estimates are combined (median, iqr)
        #[arg(short, long, default_value = "median")]
        aggregation: AggregationMethod,

        /// Fit a single day (YYYY-MM-DD) instead of a range
        #[arg(short, long)]
        day: Option<String>,

        /// Start the search from the configured parameters
        #[arg(long)]
        seed: bool,

        /// Store the fitted parameters in the config file
        #[arg(long)]
        save: bool,
    },

    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Print the configuration file location
    Path,
}

fn main() {
    if let Err(err) = run() {
        match err.downcast_ref::<PacingError>() {
            Some(e) => eprintln!("{} {}", "error:".red().bold(), e.user_message()),
            None => eprintln!("{} {:#}", "error:".red().bold(), err),
        }
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(PacingConfig::default_config_path);
    let mut config = if cli.config.is_some() {
        PacingConfig::load_from_file(&config_path)?
    } else {
        PacingConfig::load_or_default(&config_path)?
    };

    let mut log_config = config.logging.clone();
    log_config.level = log_config.level.raised_by(cli.verbose);
    init_logging(&log_config)?;

    match cli.command {
        Commands::Config { action } => run_config(action, &config, &config_path, cli.json),

        Commands::Evaluate {
            hr,
            hrv,
            energy,
            start,
            output,
        } => {
            let engine = EnergyEngine::new(config.clone())?;
            let hr = io::read_heart_rate(&hr)?;
            let hrv = hrv.map(io::read_hrv).transpose()?;

            let curve = match energy {
                Some(path) => {
                    let entries = io::read_energy(path)?;
                    engine.evaluate_anchored(&hr, hrv.as_deref(), &config.energy, &entries)?
                }
                None => engine.evaluate(&hr, hrv.as_deref(), &config.energy, start)?,
            };

            if let Some(path) = output {
                let file = File::create(&path)
                    .with_context(|| format!("Failed to create {}", path.display()))?;
                io::write_energy_curve(file, &curve)?;
                if !cli.json {
                    println!("{} {}", "✓ Curve written to".green(), path.display());
                }
            }

            if cli.json {
                print_json(&curve)
            } else {
                print_curve(&curve);
                Ok(())
            }
        }

        Commands::Cycles { hr } => {
            let engine = EnergyEngine::new(config.clone())?;
            let hr = io::read_heart_rate(&hr)?;
            let analysis = engine.detect_cycles(&hr, &config.sleep)?;

            if cli.json {
                return print_json(&analysis);
            }

            println!("{}", "Sleep analysis".cyan().bold());
            println!("  Sleep phases: {}", analysis.phases.len());
            for phase in &analysis.phases {
                println!(
                    "    {} → {} ({:.0} min)",
                    phase.start.format("%Y-%m-%d %H:%M"),
                    phase.end.format("%Y-%m-%d %H:%M"),
                    phase.duration_minutes()
                );
            }
            println!("  Wake events: {}", analysis.wake_events.len());
            println!("  Cycles: {}", analysis.cycles.len());
            for cycle in &analysis.cycles {
                println!(
                    "    {} {} → {}",
                    cycle.label.bold(),
                    cycle.cycle_start.format("%Y-%m-%d %H:%M"),
                    cycle.cycle_end.format("%Y-%m-%d %H:%M")
                );
            }
            Ok(())
        }

        Commands::Decay { hr, energy, fitted } => {
            let engine = EnergyEngine::new(config.clone())?;

            let entries = energy.map(io::read_energy).transpose()?;
            let result = match (&entries, hr) {
                (Some(entries), _) => engine.decay_from_entries(entries),
                (None, Some(path)) => {
                    let hr = io::read_heart_rate(path)?;
                    if fitted {
                        engine.analyze_decay_fitted(&hr, &config.energy)
                    } else {
                        engine.analyze_decay(&hr)
                    }
                }
                (None, None) => bail!("decay needs --hr or --energy"),
            };

            let last = entries
                .as_ref()
                .and_then(|e| e.iter().filter(|p| p.is_validated()).last().cloned());

            if cli.json {
                return print_json(&result);
            }
            print_decay(&result);
            if let Some(last) = last {
                print_decay_projection(&engine, &last, &result);
            }
            Ok(())
        }

        Commands::Predict { hr, energy, fit } => {
            let engine = EnergyEngine::new(config.clone())?;
            let hr = hr.map(io::read_heart_rate).transpose()?.unwrap_or_default();
            let entries = io::read_energy(&energy)?;
            let now = Utc::now();

            let fitted = if fit && !hr.is_empty() {
                let fit = engine.auto_fit(
                    &hr,
                    &entries,
                    FitRange::All,
                    AggregationMethod::Median,
                    None,
                    now,
                );
                match fit {
                    Ok(result) => config.energy.with_fit(&result.result),
                    Err(e) if !e.is_contract_violation() => {
                        tracing::warn!("Fit failed, using configured parameters: {}", e);
                        config.energy.clone()
                    }
                    Err(e) => return Err(e.into()),
                }
            } else {
                config.energy.clone()
            };

            let prediction = engine.predict(&hr, &entries, &fitted, now)?;
            if cli.json {
                print_json(&prediction)
            } else {
                print_prediction(&prediction);
                Ok(())
            }
        }

        Commands::Fit {
            hr,
            energy,
            range,
            aggregation,
            day,
            seed,
            save,
        } => {
            let engine = EnergyEngine::new(config.clone())?;
            let hr = io::read_heart_rate(&hr)?;
            let entries = io::read_energy(&energy)?;
            let seed_config = config.energy.clone();
            let seed = seed.then_some(&seed_config);

            let fitted = match day {
                Some(label) => {
                    let cycles = engine.build_cycles(&hr, &entries);
                    let cycle = cycles
                        .iter()
                        .find(|c| c.label == label)
                        .with_context(|| format!("No cycle labelled {}", label))?;
                    let result = engine.fit_day(cycle, seed)?;

                    if cli.json {
                        print_json(&result)?;
                    } else {
                        println!("{} {}", "Fit for".green().bold(), result.date.bold());
                        print_fit(&result.as_result());
                        println!("  Validated entries: {}", result.data_points);
                    }
                    result.as_result()
                }
                None => {
                    let result =
                        engine.auto_fit(&hr, &entries, range, aggregation, seed, Utc::now())?;

                    if cli.json {
                        print_json(&result)?;
                    } else {
                        println!(
                            "{} {} of {} days ({:?}, {:?})",
                            "Fitted".green().bold(),
                            result.used_days,
                            result.total_days,
                            range,
                            aggregation
                        );
                        print_fit(&result.result);
                        for day in &result.day_results {
                            println!(
                                "    {} hr {:.1}-{:.1} loss {:.2} ({} entries)",
                                day.date, day.hr_low, day.hr_high, day.loss, day.data_points
                            );
                        }
                    }
                    result.result
                }
            };

            if save {
                config.energy = config.energy.with_fit(&fitted);
                config.save_to_file(&config_path)?;
                if !cli.json {
                    println!("{} {}", "✓ Saved to".green(), config_path.display());
                }
            }
            Ok(())
        }
    }
}

fn run_config(action: ConfigAction, config: &PacingConfig, path: &Path, json: bool) -> Result<()> {
    match action {
        ConfigAction::Show => {
            if json {
                print_json(config)
            } else {
                print!("{}", toml::to_string_pretty(config)?);
                Ok(())
            }
        }
        ConfigAction::Init { force } => {
            if path.exists() && !force {
                bail!("{} already exists, use --force to overwrite", path.display());
            }
            PacingConfig::default().save_to_file(path)?;
            println!("{} {}", "✓ Wrote default configuration to".green(), path.display());
            Ok(())
        }
        ConfigAction::Path => {
            println!("{}", path.display());
            Ok(())
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_curve(curve: &[EnergyPoint]) {
    let (first, last) = match (curve.first(), curve.last()) {
        (Some(first), Some(last)) => (first, last),
        _ => return,
    };
    let lowest = curve
        .iter()
        .min_by(|a, b| a.energy.total_cmp(&b.energy))
        .unwrap_or(first);

    println!("{}", "Energy curve".blue().bold());
    println!("  Samples: {}", curve.len());
    println!(
        "  Start:   {:>5.1}% at {}",
        first.clamped(),
        first.timestamp.format("%Y-%m-%d %H:%M")
    );
    println!(
        "  Lowest:  {:>5.1}% at {}",
        lowest.clamped(),
        lowest.timestamp.format("%Y-%m-%d %H:%M")
    );
    println!(
        "  End:     {} at {}",
        colored_energy(last.clamped()),
        last.timestamp.format("%Y-%m-%d %H:%M")
    );
}

fn colored_energy(value: f64) -> ColoredString {
    let text = format!("{:>5.1}%", value);
    if value < 20.0 {
        text.red().bold()
    } else if value < 50.0 {
        text.yellow()
    } else {
        text.green()
    }
}

fn print_decay(result: &DecayRateResult) {
    let show = |rate: Option<f64>| match rate {
        Some(r) => format!("{:>6.2} %/h", r),
        None => "     -".dimmed().to_string(),
    };

    println!("{}", "Decay rates".magenta().bold());
    println!("  Average:   {}", show(result.average_hourly_decay));
    println!("  Morning:   {}", show(result.morning_decay_rate));
    println!("  Afternoon: {}", show(result.afternoon_decay_rate));
    println!("  Evening:   {}", show(result.evening_decay_rate));
    println!("  Night:     {}", show(result.night_recovery_rate));
    println!("  Samples:   {}", result.data_points_used);
}

fn print_decay_projection(engine: &EnergyEngine, last: &EnergyDataPoint, result: &DecayRateResult) {
    let (current, future) =
        engine
            .decay_analyzer()
            .predict_with_decay(last.percentage, last.timestamp, Utc::now(), result);
    println!("  Now:       {}", colored_energy(current));
    println!("  In 2h:     {}", colored_energy(future));
}

fn print_prediction(prediction: &Prediction) {
    let source = match prediction.source {
        PredictionSource::Curve => "heart rate model",
        PredictionSource::Decay => "decay rates",
    };
    println!("{} ({})", "Prediction".blue().bold(), source.dimmed());
    println!(
        "  Now   {}: {}",
        prediction.time.format("%Y-%m-%d %H:%M"),
        colored_energy(prediction.energy_now)
    );
    println!(
        "  Later {}: {}",
        prediction.time_future.format("%Y-%m-%d %H:%M"),
        colored_energy(prediction.energy_future)
    );
}

fn print_fit(result: &OptimizationResult) {
    println!("  hr_low:          {:.1}", result.hr_low);
    println!("  hr_high:         {:.1}", result.hr_high);
    println!("  drain_factor:    {:.4}", result.drain_factor);
    println!("  recovery_factor: {:.4}", result.recovery_factor);
    println!("  energy_offset:   {:.2}", result.energy_offset);
    println!("  loss:            {:.3}", result.loss);
}
