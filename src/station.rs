//! Wiring of one sweep run: simulated bench, result sink and orchestrator.

use crate::config::{SimulationConfig, StationConfig};
use anyhow::{Context, Result};
use probe_core::{SweepKind, SweepResult};
use probe_driver_mock::{MockLcrMeter, MockSourceMeter};
use probe_storage::{ResultSink, SvgPlot};
use probe_sweep::{SweepInstruments, SweepOrchestrator};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Simulated instruments for one sweep kind.
pub struct SimulatedBench {
    /// Swept source
    pub source: Arc<MockSourceMeter>,
    /// Held bias source of dual-source sweeps
    pub bias: Option<Arc<MockSourceMeter>>,
    /// LCR meter of CV sweeps
    pub lcr: Option<Arc<MockLcrMeter>>,
}

impl SimulatedBench {
    /// Build the instruments `kind` needs. The LCR meter sees the bias of
    /// the depleting source: the held bias in dual-source sweeps, the swept
    /// source otherwise.
    pub fn build(kind: SweepKind, config: &SimulationConfig) -> Self {
        let source =
            Arc::new(MockSourceMeter::with_config(config.source.clone()).with_mode(config.mode));
        let bias = kind.is_dual().then(|| {
            Arc::new(MockSourceMeter::with_config(config.bias.clone()).with_mode(config.mode))
        });
        let lcr = kind.is_cv().then(|| {
            let depleting = bias.clone().unwrap_or_else(|| Arc::clone(&source));
            Arc::new(
                MockLcrMeter::with_config(config.lcr.clone())
                    .with_mode(config.mode)
                    .attached_to(depleting),
            )
        });
        Self { source, bias, lcr }
    }

    /// Orchestrator handles for this bench.
    pub fn instruments(&self) -> SweepInstruments {
        let mut instruments = SweepInstruments::single(self.source.clone());
        if let Some(bias) = &self.bias {
            instruments = instruments.with_bias(bias.clone());
        }
        if let Some(lcr) = &self.lcr {
            instruments = instruments.with_lcr(lcr.clone());
        }
        instruments
    }
}

/// A prepared sweep, ready to run.
pub struct SweepSession {
    /// Named test being run
    pub kind: SweepKind,
    /// Engine for this run
    pub orchestrator: SweepOrchestrator,
    /// Log and plot sink
    pub sink: ResultSink,
    /// Simulated instruments
    pub bench: SimulatedBench,
    /// SVG written at the end when plotting is on.
    pub plot_path: Option<PathBuf>,
}

impl SweepSession {
    /// Validate `config`, build the bench and open the log.
    pub fn prepare(kind: SweepKind, config: &StationConfig, plot: bool) -> Result<Self> {
        config.validate()?;
        let spec = config.sweep_spec(kind)?;
        let ramp_down = config.ramp_down_settings()?;

        let log_path = config.log_path(kind);
        let mut sink = ResultSink::open(&log_path)
            .with_context(|| format!("cannot open measurement log {}", log_path.display()))?;
        let plot_path = plot.then(|| log_path.with_extension("svg"));
        if let Some(path) = &plot_path {
            sink = sink.with_plot(Box::new(SvgPlot::new(format!("{kind} sweep"))), Some(path.clone()));
        }

        let bench = SimulatedBench::build(kind, &config.simulation);
        let orchestrator =
            SweepOrchestrator::new(spec, bench.instruments()).with_ramp_down(ramp_down);
        info!(%kind, log = %log_path.display(), "Sweep prepared");

        Ok(Self {
            kind,
            orchestrator,
            sink,
            bench,
            plot_path,
        })
    }

    /// Run the sweep. Sources are ramped down before this returns.
    pub async fn run(&mut self) -> SweepResult {
        self.orchestrator.run(&mut self.sink).await
    }
}
