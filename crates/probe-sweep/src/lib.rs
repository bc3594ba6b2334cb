//! Sweep control and safety engine.
//!
//! [`SweepOrchestrator`] runs a sweep end to end. The pieces it is built
//! from are usable on their own:
//!
//! - [`RampStepper`] walks a source to a voltage in bounded increments
//! - [`ComplianceMonitor`] is the compliance interlock run at ramp check
//!   points and before every measurement
//! - [`CurrentRangeController`] escalates the current range on overcurrent
//!   up to the ceiling implied by Imax
//! - [`SafetyRampDown`] and the [`EnergizedSource`] guard return sources to
//!   0 V on every exit path
//!
//! Instruments are reached only through the
//! [`VoltageSource`](probe_core::VoltageSource) and
//! [`LcrMeter`](probe_core::LcrMeter) traits.

pub mod compliance;
pub mod events;
pub mod orchestrator;
pub mod ramp;
pub mod range;
pub mod teardown;

pub use compliance::{ComplianceMonitor, ComplianceState};
pub use events::SweepEvent;
pub use orchestrator::{SweepInstruments, SweepOrchestrator, SweepState};
pub use ramp::{NoCheck, RampReport, RampStepper, StepCheck};
pub use range::{ceiling_for, CurrentRangeController};
pub use teardown::{EnergizedSource, RampDownSettings, SafetyRampDown};
