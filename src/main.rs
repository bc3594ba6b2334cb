//! CLI entry point for probe-station
//!
//! Runs IV and CV sweeps against the simulated bench:
//!
//! ```bash
//! probe-station iv --start 0 --step 5 --end -200 --imax 1e-5
//! probe-station cv-smu --config config/probe_station.toml -o sensor_cv.txt
//! probe-station show-config
//! ```
//!
//! Ctrl-C cancels the sweep at the next step boundary; sources are ramped
//! down before the process exits.

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use probe_core::SweepKind;
use probe_station::config::{StationConfig, SweepOverrides, DEFAULT_CONFIG_PATH};
use probe_station::station::SweepSession;
use probe_station::tracing_init;
use probe_sweep::SweepEvent;
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "probe-station")]
#[command(about = "IV/CV sweeps for sensor characterization", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Current against voltage, single source
    Iv(SweepArgs),
    /// Current against voltage on a source-measure unit, with a held bias source
    IvSmu(SweepArgs),
    /// Capacitance against voltage, single source
    Cv(SweepArgs),
    /// Capacitance against voltage with a held bias source
    CvSmu(SweepArgs),
    /// Print the merged configuration and exit
    ShowConfig,
}

#[derive(Args)]
struct SweepArgs {
    #[arg(long, allow_hyphen_values = true)]
    start: Option<f64>,

    #[arg(long, allow_hyphen_values = true)]
    step: Option<f64>,

    #[arg(long, allow_hyphen_values = true)]
    end: Option<f64>,

    /// Current limit in amps
    #[arg(long)]
    imax: Option<f64>,

    /// Log file name inside the output directory
    #[arg(short, long)]
    output: Option<String>,

    /// Skip the SVG plot
    #[arg(long)]
    no_plot: bool,
}

impl SweepArgs {
    fn overrides(&self) -> SweepOverrides {
        SweepOverrides {
            start: self.start,
            step: self.step,
            end: self.end,
            imax: self.imax,
            output_file: self.output.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = StationConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    tracing_init::init_from_config(&config).map_err(|e| anyhow!(e))?;

    let (kind, args) = match cli.command {
        Commands::Iv(args) => (SweepKind::Iv, args),
        Commands::IvSmu(args) => (SweepKind::IvSmu, args),
        Commands::Cv(args) => (SweepKind::Cv, args),
        Commands::CvSmu(args) => (SweepKind::CvSmu, args),
        Commands::ShowConfig => {
            println!("{}", toml::to_string_pretty(&config)?);
            return Ok(());
        }
    };

    config.apply_overrides(&args.overrides());
    run_sweep(kind, &config, !args.no_plot).await
}

async fn run_sweep(kind: SweepKind, config: &StationConfig, plot: bool) -> Result<()> {
    let mut session = SweepSession::prepare(kind, config, plot)?;
    info!(
        %kind,
        targets = session.orchestrator.spec().targets().len(),
        imax = session.orchestrator.spec().imax,
        "Starting sweep"
    );

    let cancel = session.orchestrator.abort_handle();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, cancelling sweep");
            cancel.trigger();
        }
    });

    let mut events = session.orchestrator.subscribe();
    let progress = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SweepEvent::Measured(m) => match m.cv_reading() {
                    Some(cv) => println!(
                        "  {:>9.3} V  {:>12.4e} A  {:>12.4e} F @ {} Hz",
                        m.voltage(),
                        m.current(),
                        cv.capacitance,
                        cv.frequency
                    ),
                    None => println!("  {:>9.3} V  {:>12.4e} A", m.voltage(), m.current()),
                },
                SweepEvent::RangeEscalated { range } => println!("  current range -> 1e{range} A"),
                SweepEvent::Finished { .. } => break,
                _ => {}
            }
        }
    });

    let result = session.run().await;
    let _ = progress.await;

    println!();
    println!("{} sweep {}: {} points", kind, result.status, result.accepted);
    println!("  log: {}", session.sink.log_path().display());
    if let Some(path) = &session.plot_path {
        println!("  plot: {}", path.display());
    }
    for report in &result.shutdown {
        println!(
            "  {}: {} V, output {}{}",
            report.instrument,
            report.final_voltage,
            report.output,
            if report.clean { "" } else { " (ramp-down incomplete)" }
        );
    }

    match result.error {
        None => Ok(()),
        Some(err) => {
            error!(error = %err, "Sweep did not complete");
            Err(err).context(format!("{kind} sweep aborted"))
        }
    }
}
