//! Live curve plots.
//!
//! A [`PlotSink`] receives the same measurements as the log. Plot failures
//! never stop a sweep, so callers log and skip them.

use crate::error::StorageError;
use plotters::prelude::*;
use probe_core::Measurement;
use std::path::Path;
use tracing::debug;

/// Destination for curve updates.
pub trait PlotSink: Send {
    /// Add one measurement to the curve.
    fn update(&mut self, measurement: &Measurement) -> Result<(), StorageError>;

    /// Render the curve to `path`.
    fn savefig(&mut self, path: &Path) -> Result<(), StorageError>;

    /// Release buffered points.
    fn close(&mut self) -> Result<(), StorageError>;
}

/// Plot that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPlot;

impl PlotSink for NullPlot {
    fn update(&mut self, _measurement: &Measurement) -> Result<(), StorageError> {
        Ok(())
    }

    fn savefig(&mut self, _path: &Path) -> Result<(), StorageError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Voltage against current (IV) or capacitance (CV) curve rendered as SVG.
#[derive(Debug, Clone)]
pub struct SvgPlot {
    title: String,
    size: (u32, u32),
    points: Vec<(f64, f64)>,
    capacitance: bool,
    closed: bool,
}

impl SvgPlot {
    /// Empty plot titled `title`.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            size: (800, 600),
            points: Vec::new(),
            capacitance: false,
            closed: false,
        }
    }

    /// Canvas size in pixels.
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.size = (width, height);
        self
    }

    /// Points plotted so far.
    pub fn points(&self) -> &[(f64, f64)] {
        &self.points
    }

    fn y_label(&self) -> &'static str {
        if self.capacitance {
            "Capacitance (F)"
        } else {
            "Current (A)"
        }
    }
}

fn plot_err(err: impl std::fmt::Display) -> StorageError {
    StorageError::Plot(err.to_string())
}

/// Axis span padded so a single point or a flat curve still has extent.
fn padded_range(values: impl Iterator<Item = f64>) -> std::ops::Range<f64> {
    let (lo, hi) = values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    });
    if !lo.is_finite() || !hi.is_finite() {
        return 0.0..1.0;
    }
    let pad = if hi > lo { (hi - lo) * 0.05 } else { lo.abs().max(1e-15) * 0.1 };
    (lo - pad)..(hi + pad)
}

impl PlotSink for SvgPlot {
    fn update(&mut self, measurement: &Measurement) -> Result<(), StorageError> {
        if self.closed {
            return Err(StorageError::Plot(format!("plot '{}' is closed", self.title)));
        }
        let y = match measurement.cv_reading() {
            Some(cv) => {
                self.capacitance = true;
                cv.capacitance
            }
            None => measurement.current(),
        };
        self.points.push((measurement.voltage(), y));
        Ok(())
    }

    fn savefig(&mut self, path: &Path) -> Result<(), StorageError> {
        if self.points.is_empty() {
            debug!(title = %self.title, "No points to plot");
            return Ok(());
        }
        let x_range = padded_range(self.points.iter().map(|p| p.0));
        let y_range = padded_range(self.points.iter().map(|p| p.1));

        let root = SVGBackend::new(path, self.size).into_drawing_area();
        root.fill(&WHITE).map_err(plot_err)?;
        let mut chart = ChartBuilder::on(&root)
            .caption(&self.title, ("sans-serif", 20))
            .margin(10)
            .x_label_area_size(40)
            .y_label_area_size(80)
            .build_cartesian_2d(x_range, y_range)
            .map_err(plot_err)?;
        chart
            .configure_mesh()
            .x_desc("Voltage (V)")
            .y_desc(self.y_label())
            .y_label_formatter(&|v| format!("{:.2e}", v))
            .draw()
            .map_err(plot_err)?;
        chart
            .draw_series(LineSeries::new(self.points.iter().copied(), &BLUE))
            .map_err(plot_err)?;
        chart
            .draw_series(
                self.points
                    .iter()
                    .map(|&(x, y)| Circle::new((x, y), 3, BLUE.filled())),
            )
            .map_err(plot_err)?;
        root.present().map_err(plot_err)?;
        debug!(path = %path.display(), points = self.points.len(), "Plot saved");
        Ok(())
    }

    fn close(&mut self) -> Result<(), StorageError> {
        self.points.clear();
        self.closed = true;
        Ok(())
    }
}
