//! Station configuration using Figment
//!
//! Configuration is merged from, in order of increasing precedence:
//! 1. built-in defaults
//! 2. `config/probe_station.toml` (or the file given with `--config`)
//! 3. environment variables prefixed with `PROBE_STATION_`, nested keys
//!    separated by `__` (e.g. `PROBE_STATION_SWEEP__IMAX=5e-5`)
//!
//! Command-line flags are applied last through [`SweepOverrides`].
//!
//! # Example
//! ```no_run
//! use probe_station::config::StationConfig;
//! use probe_core::SweepKind;
//!
//! let config = StationConfig::load()?;
//! config.validate()?;
//! let spec = config.sweep_spec(SweepKind::Iv)?;
//! # Ok::<(), probe_station::config::ConfigError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use probe_core::{BiasSpec, RampProfile, SweepError, SweepKind, SweepSpec};
use probe_driver_mock::{MockLcrMeterConfig, MockMode, MockSourceMeterConfig};
use probe_sweep::RampDownSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/probe_station.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "PROBE_STATION_";

/// Configuration loading or validation failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Figment could not merge or extract the sources.
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    /// A value failed validation.
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// The derived sweep was rejected.
    #[error(transparent)]
    Sweep(#[from] SweepError),
}

/// Top-level station configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StationConfig {
    /// `[application]` section
    pub application: ApplicationConfig,
    /// `[sweep]` section
    pub sweep: SweepConfig,
    /// Held source of `iv-smu` / `cv-smu` sweeps
    pub bias: BiasConfig,
    /// Safety ramp-down pacing
    pub ramp_down: RampDownConfig,
    /// Simulated bench
    pub simulation: SimulationConfig,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line human-readable output
    #[default]
    Pretty,
    /// Single-line output without colors
    Compact,
    /// Newline-delimited JSON
    Json,
}

/// `[application]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Display name
    pub name: String,
    /// trace, debug, info, warn or error
    pub log_level: String,
    /// Log output format
    pub log_format: LogFormat,
    /// Directory for measurement logs and plots
    pub output_dir: PathBuf,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Probe Station".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            output_dir: PathBuf::from("data"),
        }
    }
}

/// Swept-source parameters
///
/// Targets come from `voltages` when set, otherwise from the
/// `start`/`step`/`end` triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Literal target list
    pub voltages: Option<Vec<f64>>,
    /// First target, volts
    pub start: f64,
    /// Step between targets, volts; sign follows direction of travel
    pub step: f64,
    /// Last target, volts
    pub end: f64,
    /// Voltage the source must read before the sweep starts
    pub initial_voltage: f64,
    /// Wait at each target before reading, in seconds
    pub rest_time_secs: f64,
    /// Extra wait before the first reading, in seconds
    pub first_point_rest_time_secs: f64,
    /// Ramp increment. Falls back to the source's profile default.
    pub ramp_step: Option<f64>,
    /// Command each target in one step
    pub full_step: bool,
    /// Volts of travel between compliance checks while ramping
    pub check_interval: Option<f64>,
    /// Wait after each ramp increment, in milliseconds
    pub settle_ms: Option<u64>,
    /// Current limit in amps
    pub imax: f64,
    /// Starting current range exponent (log10 amps)
    pub initial_range: Option<i32>,
    /// Switch off without ramping on a compliance abort
    pub kill_on_hit_compliance: bool,
    /// Ramp down after a completed sweep
    pub ramp_down: bool,
    /// LCR frequencies in hertz, CV sweeps only
    pub frequencies: Vec<f64>,
    /// LCR settle after each frequency change, in seconds
    pub lcr_settle_secs: f64,
    /// Measurement log file name inside the output directory
    pub output_file: Option<String>,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            voltages: None,
            start: 0.0,
            step: 10.0,
            end: -100.0,
            initial_voltage: 0.0,
            rest_time_secs: 1.0,
            first_point_rest_time_secs: 0.0,
            ramp_step: None,
            full_step: false,
            check_interval: None,
            settle_ms: None,
            imax: 1e-5,
            initial_range: None,
            kill_on_hit_compliance: false,
            ramp_down: true,
            frequencies: vec![1_000.0],
            lcr_settle_secs: 0.5,
            output_file: None,
        }
    }
}

/// `[bias]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BiasConfig {
    /// Held voltage
    pub voltage: f64,
    /// Voltage the bias source must read before it is ramped
    pub initial_voltage: f64,
    /// Ramp increment
    pub ramp_step: f64,
    /// Volts of travel between compliance checks
    pub check_interval: f64,
    /// Wait after each ramp increment, in milliseconds
    pub settle_ms: u64,
}

impl Default for BiasConfig {
    fn default() -> Self {
        let profile = RampProfile::high_voltage();
        Self {
            voltage: -100.0,
            initial_voltage: 0.0,
            ramp_step: profile.step_size,
            check_interval: profile.check_interval,
            settle_ms: duration_ms(profile.settle),
        }
    }
}

/// `[ramp_down]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RampDownConfig {
    /// Coarse step magnitude
    pub step: f64,
    /// Distance from 0 V where the fine step takes over
    pub fine_window: f64,
    /// Fine step magnitude
    pub fine_step: f64,
    /// Wait after each step, in milliseconds
    pub settle_ms: u64,
    /// Wait before the first step, in seconds
    pub pre_wait_secs: f64,
    /// Poll compliance after each step
    pub check_compliance: bool,
    /// Upper bound on each teardown command, in seconds
    pub command_timeout_secs: f64,
}

impl Default for RampDownConfig {
    fn default() -> Self {
        let settings = RampDownSettings::default();
        Self {
            step: settings.step,
            fine_window: settings.fine_window,
            fine_step: settings.fine_step,
            settle_ms: duration_ms(settings.settle),
            pre_wait_secs: settings.pre_wait.as_secs_f64(),
            check_compliance: settings.check_compliance,
            command_timeout_secs: settings.command_timeout.as_secs_f64(),
        }
    }
}

/// Behaviour of the simulated bench
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Latency model
    pub mode: MockMode,
    /// Swept source
    pub source: MockSourceMeterConfig,
    /// Held bias source
    pub bias: MockSourceMeterConfig,
    /// LCR meter
    pub lcr: MockLcrMeterConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            mode: MockMode::Instant,
            source: MockSourceMeterConfig {
                name: "sim_source".to_string(),
                ..Default::default()
            },
            bias: MockSourceMeterConfig {
                name: "sim_bias".to_string(),
                ..Default::default()
            },
            lcr: MockLcrMeterConfig {
                name: "sim_lcr".to_string(),
                ..Default::default()
            },
        }
    }
}

/// Per-run values given on the command line
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepOverrides {
    /// First target, volts
    pub start: Option<f64>,
    /// Step between targets, volts
    pub step: Option<f64>,
    /// Last target, volts
    pub end: Option<f64>,
    /// Current limit, amps
    pub imax: Option<f64>,
    /// Log file name inside the output directory
    pub output_file: Option<String>,
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn seconds(name: &str, value: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| ConfigError::Invalid(format!("{name} must be a non-negative duration, got {value}")))
}

impl StationConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file. A missing file leaves the defaults in
    /// place.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Figment::from(Serialized::defaults(StationConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ConfigError::Load(Box::new(e)))
    }

    /// Apply command-line values. Any of start, step or end replaces an
    /// explicit voltage list.
    pub fn apply_overrides(&mut self, overrides: &SweepOverrides) {
        let sweep = &mut self.sweep;
        if overrides.start.is_some() || overrides.step.is_some() || overrides.end.is_some() {
            sweep.voltages = None;
        }
        if let Some(start) = overrides.start {
            sweep.start = start;
        }
        if let Some(step) = overrides.step {
            sweep.step = step;
        }
        if let Some(end) = overrides.end {
            sweep.end = end;
        }
        if let Some(imax) = overrides.imax {
            sweep.imax = imax;
        }
        if let Some(file) = &overrides.output_file {
            sweep.output_file = Some(file.clone());
        }
    }

    /// Reject values that cannot be run, before any hardware is touched
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let sweep = &self.sweep;
        match &sweep.voltages {
            Some(v) if v.is_empty() => {
                return Err(ConfigError::Invalid("sweep.voltages is empty".into()))
            }
            Some(_) => {}
            None if sweep.step == 0.0 || !sweep.step.is_finite() => {
                return Err(ConfigError::Invalid(format!(
                    "sweep.step must be non-zero, got {}",
                    sweep.step
                )))
            }
            None => {}
        }
        if !(sweep.imax.is_finite() && sweep.imax > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "sweep.imax must be positive, got {}",
                sweep.imax
            )));
        }
        if let Some(f) = sweep.frequencies.iter().find(|f| !(f.is_finite() && **f > 0.0)) {
            return Err(ConfigError::Invalid(format!("frequency {f} Hz is not positive")));
        }
        if sweep.ramp_step.is_some_and(|s| !(s.is_finite() && s > 0.0)) {
            return Err(ConfigError::Invalid("sweep.ramp_step must be positive".into()));
        }
        if !(self.ramp_down.step > 0.0 && self.ramp_down.fine_step > 0.0) {
            return Err(ConfigError::Invalid("ramp_down steps must be positive".into()));
        }

        seconds("sweep.rest_time_secs", sweep.rest_time_secs)?;
        seconds("sweep.first_point_rest_time_secs", sweep.first_point_rest_time_secs)?;
        seconds("sweep.lcr_settle_secs", sweep.lcr_settle_secs)?;
        seconds("ramp_down.pre_wait_secs", self.ramp_down.pre_wait_secs)?;
        seconds("ramp_down.command_timeout_secs", self.ramp_down.command_timeout_secs)?;
        Ok(())
    }

    /// Build the [`SweepSpec`] for a sweep of the given kind.
    pub fn sweep_spec(&self, kind: SweepKind) -> Result<SweepSpec, ConfigError> {
        let sweep = &self.sweep;
        let mut spec = match &sweep.voltages {
            Some(v) => SweepSpec::from_targets(v.clone(), sweep.imax),
            None => SweepSpec::linear(sweep.start, sweep.step, sweep.end, sweep.imax)?,
        };

        // The measurement side of a dual-source sweep is the low-voltage unit.
        let mut profile = if kind.is_dual() {
            RampProfile::source_measure_unit()
        } else {
            RampProfile::high_voltage()
        };
        profile.full_step = sweep.full_step;
        if let Some(step) = sweep.ramp_step {
            profile.step_size = step;
        }
        if let Some(interval) = sweep.check_interval {
            profile.check_interval = interval;
        }
        if let Some(ms) = sweep.settle_ms {
            profile.settle = Duration::from_millis(ms);
        }

        spec = spec
            .with_profile(profile)
            .with_rest_time(seconds("sweep.rest_time_secs", sweep.rest_time_secs)?)
            .with_first_point_rest_time(seconds(
                "sweep.first_point_rest_time_secs",
                sweep.first_point_rest_time_secs,
            )?)
            .with_initial_voltage(sweep.initial_voltage)
            .with_kill_on_hit_compliance(sweep.kill_on_hit_compliance)
            .with_ramp_down(sweep.ramp_down)
            .with_lcr_settle(seconds("sweep.lcr_settle_secs", sweep.lcr_settle_secs)?);
        if let Some(range) = sweep.initial_range {
            spec = spec.with_initial_range(range);
        }

        if kind.is_cv() {
            if sweep.frequencies.is_empty() {
                return Err(ConfigError::Invalid("CV sweep needs at least one frequency".into()));
            }
            spec = spec.with_frequencies(sweep.frequencies.clone());
        }

        if kind.is_dual() {
            let bias = &self.bias;
            spec = spec.with_bias(BiasSpec {
                voltage: bias.voltage,
                initial_voltage: bias.initial_voltage,
                profile: RampProfile {
                    full_step: false,
                    step_size: bias.ramp_step,
                    check_interval: bias.check_interval,
                    settle: Duration::from_millis(bias.settle_ms),
                },
            });
        }

        spec.validate()?;
        Ok(spec)
    }

    /// Ramp-down settings from the `[ramp_down]` section.
    pub fn ramp_down_settings(&self) -> Result<RampDownSettings, ConfigError> {
        let rd = &self.ramp_down;
        Ok(RampDownSettings {
            step: rd.step,
            fine_window: rd.fine_window,
            fine_step: rd.fine_step,
            settle: Duration::from_millis(rd.settle_ms),
            pre_wait: seconds("ramp_down.pre_wait_secs", rd.pre_wait_secs)?,
            check_compliance: rd.check_compliance,
            command_timeout: seconds("ramp_down.command_timeout_secs", rd.command_timeout_secs)?,
        })
    }

    /// Log file path for a sweep of the given kind.
    pub fn log_path(&self, kind: SweepKind) -> PathBuf {
        let name = self
            .sweep
            .output_file
            .clone()
            .unwrap_or_else(|| format!("{}_log.txt", kind.to_string().to_lowercase()));
        self.application.output_dir.join(name)
    }
}
