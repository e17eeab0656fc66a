//! The control-API seam.
//!
//! Every hardware action the scripting layer takes goes through
//! [`ControlApi`]: motor moves ("blocks"), PV reads and writes, wiring-table
//! changes in the data-acquisition electronics (DAE) and run control. The real
//! implementation is supplied by the facility's instrument-control system;
//! [`mock::MockControl`] stands in for it during development and when a user
//! script is dry-run before execution.
//!
//! ```text
//! ScanningInstrument ──► ControlApi
//!                          ├── facility control system (external)
//!                          └── MockControl (in-memory, call log)
//! ```

pub mod mock;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{AppResult, SansError};

pub use mock::{ControlCall, MockControl};

// =============================================================================
// Values
// =============================================================================

/// A block setpoint or PV value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Numeric value (motor positions, phases, status words).
    Number(f64),
    /// Text value (sample-changer slots, on/off switches, commands).
    Text(String),
}

impl Value {
    /// Numeric view of the value. Text that parses as a number is accepted.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Text(s) => s.trim().parse().ok(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{}", n),
            Value::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Number(value as f64)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Number(f64::from(value))
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

// =============================================================================
// Run control
// =============================================================================

/// Run state reported by the control system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    /// Idle and ready to begin a run.
    Setup,
    /// Counting.
    Running,
    /// Run paused.
    Paused,
    /// Any transitional state (BEGINNING, ENDING, SAVING, ...).
    Other(String),
}

impl RunState {
    /// Parse the upper-case state string used by the control system.
    pub fn parse(state: &str) -> Self {
        match state.trim().to_uppercase().as_str() {
            "SETUP" => RunState::Setup,
            "RUNNING" => RunState::Running,
            "PAUSED" => RunState::Paused,
            other => RunState::Other(other.to_string()),
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Setup => f.write_str("SETUP"),
            RunState::Running => f.write_str("RUNNING"),
            RunState::Paused => f.write_str("PAUSED"),
            RunState::Other(s) => f.write_str(s),
        }
    }
}

/// A run duration condition passed to `waitfor`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Timing {
    /// Integrated proton current in microamp hours.
    Uamps(f64),
    /// Proton pulses.
    Frames(u64),
    /// Wall-clock seconds.
    Seconds(f64),
    /// Wall-clock minutes.
    Minutes(f64),
    /// Wall-clock hours.
    Hours(f64),
}

impl Timing {
    /// Keyword names that denote a run duration rather than a block move.
    pub const NAMES: [&'static str; 5] = ["uamps", "frames", "seconds", "minutes", "hours"];

    /// Whether `key` names a timing.
    pub fn is_timing(key: &str) -> bool {
        Self::NAMES.contains(&key)
    }

    /// Build a timing from its keyword and amount.
    pub fn from_key(key: &str, amount: f64) -> AppResult<Self> {
        if !amount.is_finite() || amount < 0.0 {
            return Err(SansError::InvalidArgument(format!(
                "{} must be a non-negative number, got {}",
                key, amount
            )));
        }
        match key {
            "uamps" => Ok(Timing::Uamps(amount)),
            "frames" => {
                if amount.fract() != 0.0 || amount >= u64::MAX as f64 {
                    return Err(SansError::InvalidArgument(format!(
                        "frames must be a whole number below {}, got {}",
                        u64::MAX,
                        amount
                    )));
                }
                Ok(Timing::Frames(amount as u64))
            }
            "seconds" => Ok(Timing::Seconds(amount)),
            "minutes" => Ok(Timing::Minutes(amount)),
            "hours" => Ok(Timing::Hours(amount)),
            other => Err(SansError::InvalidArgument(format!(
                "'{}' is not a timing. Expected one of: {}",
                other,
                Self::NAMES.join(", ")
            ))),
        }
    }

    /// Keyword for this timing.
    pub fn key(&self) -> &'static str {
        match self {
            Timing::Uamps(_) => "uamps",
            Timing::Frames(_) => "frames",
            Timing::Seconds(_) => "seconds",
            Timing::Minutes(_) => "minutes",
            Timing::Hours(_) => "hours",
        }
    }

    /// Amount in the timing's own unit.
    pub fn amount(&self) -> f64 {
        match *self {
            Timing::Uamps(v) | Timing::Seconds(v) | Timing::Minutes(v) | Timing::Hours(v) => v,
            Timing::Frames(v) => v as f64,
        }
    }
}

impl fmt::Display for Timing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key(), self.amount())
    }
}

/// Run-level setting changed through `change`.
#[derive(Debug, Clone, PartialEq)]
pub enum RunChange {
    /// Number of hardware periods.
    Periods(u32),
    /// Run title.
    Title(String),
}

// =============================================================================
// DAE tables
// =============================================================================

/// Which of the three DAE binding tables a file is loaded into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableKind {
    /// Detector table.
    Detector,
    /// Spectra table.
    Spectra,
    /// Wiring table.
    Wiring,
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TableKind::Detector => "detector",
            TableKind::Spectra => "spectra",
            TableKind::Wiring => "wiring",
        })
    }
}

/// One time-channel boundary entry for the DAE.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeChannelBoundary {
    /// Lower time bound (µs).
    pub low: f64,
    /// Upper time bound (µs).
    pub high: f64,
    /// Bin width, or the log step when `log` is set.
    pub step: f64,
    /// Time range index within the regime.
    pub trange: u8,
    /// Logarithmic binning. `None` leaves the DAE default.
    pub log: Option<bool>,
    /// Time regime. `None` is the primary regime.
    pub regime: Option<u8>,
}

impl TimeChannelBoundary {
    /// Linear boundary in the primary regime.
    pub const fn new(low: f64, high: f64, step: f64, trange: u8) -> Self {
        Self {
            low,
            high,
            step,
            trange,
            log: Some(false),
            regime: None,
        }
    }

    /// The empty second range that terminates a regime.
    pub const fn terminator() -> Self {
        Self::new(0.0, 0.0, 0.0, 2)
    }

    /// Switch to logarithmic binning.
    pub const fn logarithmic(mut self) -> Self {
        self.log = Some(true);
        self
    }

    /// Leave the binning flag unspecified.
    pub const fn default_binning(mut self) -> Self {
        self.log = None;
        self
    }

    /// Place the boundary in another time regime.
    pub const fn in_regime(mut self, regime: u8) -> Self {
        self.regime = Some(regime);
        self
    }
}

// =============================================================================
// Sample parameters
// =============================================================================

/// Sample parameters recorded with each run.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleParameters {
    /// Sample geometry, e.g. "Flat Plate".
    pub geometry: String,
    /// Sample width (mm).
    pub width: f64,
    /// Sample height (mm).
    pub height: f64,
    /// Sample thickness (mm).
    pub thickness: f64,
}

impl Default for SampleParameters {
    fn default() -> Self {
        Self {
            geometry: "Flat Plate".to_string(),
            width: 10.0,
            height: 10.0,
            thickness: 1.0,
        }
    }
}

// =============================================================================
// The control API
// =============================================================================

/// Instrument-control API.
///
/// Mirrors the vendor console API one call at a time. Implementations must be
/// shareable across the script host and the instrument, hence `Send + Sync`
/// and `&self` receivers.
#[async_trait]
pub trait ControlApi: Send + Sync {
    /// Change a run-level setting.
    async fn change(&self, change: RunChange) -> AppResult<()>;

    /// Open a block of DAE table changes.
    async fn change_start(&self) -> AppResult<()>;

    /// Load a table file into the DAE.
    async fn change_tables(&self, kind: TableKind, path: &str) -> AppResult<()>;

    /// Set one time-channel boundary.
    async fn change_tcb(&self, tcb: &TimeChannelBoundary) -> AppResult<()>;

    /// Commit the DAE table changes opened by `change_start`.
    async fn change_finish(&self) -> AppResult<()>;

    /// Select the DAE synchronisation source.
    async fn change_sync(&self, source: &str) -> AppResult<()>;

    /// Current run state.
    async fn get_runstate(&self) -> AppResult<RunState>;

    /// Begin a run.
    async fn begin(&self) -> AppResult<()>;

    /// End the current run.
    async fn end(&self) -> AppResult<()>;

    /// Block until a run-duration condition is met. With several conditions
    /// the first one met ends the wait; with none it returns immediately.
    async fn waitfor(&self, timings: &[Timing]) -> AppResult<()>;

    /// Block until every motor has stopped.
    async fn waitfor_move(&self) -> AppResult<()>;

    /// Set a block to a value.
    async fn cset(&self, block: &str, value: Value) -> AppResult<()>;

    /// Set several blocks, issued in order.
    async fn cset_many(&self, moves: &[(&str, Value)]) -> AppResult<()> {
        for (block, value) in moves {
            self.cset(block, value.clone()).await?;
        }
        Ok(())
    }

    /// Read a block.
    async fn cget(&self, block: &str) -> AppResult<Value>;

    /// Write a process variable.
    async fn set_pv(&self, name: &str, value: Value) -> AppResult<()>;

    /// Read a process variable.
    async fn get_pv(&self, name: &str) -> AppResult<Value>;

    /// Change one sample parameter.
    async fn change_sample_par(&self, name: &str, value: Value) -> AppResult<()>;

    /// Read the sample parameters.
    async fn get_sample_pars(&self) -> AppResult<SampleParameters>;

    /// Pause the script. Real backends wait; the mock only records the call.
    async fn sleep(&self, duration: Duration) -> AppResult<()>;
}

/// A named move that puts the sample in place for a measurement.
///
/// Used as the `pos` of a measurement when a sample-changer slot is not
/// enough, e.g. swinging a polariser into the beam.
#[async_trait]
pub trait PositionRoutine: Send + Sync {
    /// Name shown in the progress log.
    fn name(&self) -> &str;

    /// Perform the move.
    async fn apply(&self, control: &dyn ControlApi) -> AppResult<()>;
}
