//! The per-instrument contract.
//!
//! [`ScanningInstrument`] declares what every SANS beamline must provide to
//! run generic user scripts: the DAE wiring-table setups, aperture control,
//! detector power control and the sample-changer allow-list. The scientist
//! facing operations ([`configure_sans`](ScanningInstrument::configure_sans),
//! [`configure_trans`](ScanningInstrument::configure_trans) and
//! [`measure`](ScanningInstrument::measure)) are default methods built on
//! top of those.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut larmor = Larmor::new(Arc::new(MockControl::new()), LarmorConfig::default());
//!
//! // SANS on a 1mm water sample until 10 µAh have been delivered
//! larmor.measure(MeasureRequest::new("H2O").uamps(10.0)).await?;
//!
//! // Transmission on a 2mm D2O sample in slot LT with CoarseZ at 38mm
//! larmor
//!     .measure(
//!         MeasureRequest::new("D2O")
//!             .position("LT")
//!             .thickness(2.0)
//!             .trans(true)
//!             .block("CoarseZ", 38.0)
//!             .frames(300),
//!     )
//!     .await?;
//! ```

pub mod larmor;
pub mod zoom;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::control::{ControlApi, PositionRoutine, RunChange, RunState, Timing, Value};
use crate::dae::{DaeMode, DaeOptions, InstrumentState, TitleFooter};
use crate::error::{AppResult, SansError};

pub use larmor::{Larmor, LarmorMove};
pub use zoom::Zoom;

/// Named sample-changer slots shared by the Larmor and Zoom changers.
pub const SAMPLE_CHANGER: &[&str] = &[
    "AB", "BB", "CB", "DB", "EB", "FB", "GB", "HB", "IB", "JB", "KB", "LB", "MB", "NB", "OB",
    "PB", "QB", "RB", "SB", "TB", "AT", "BT", "CT", "DT", "ET", "FT", "GT", "HT", "IT", "JT",
    "KT", "LT", "MT", "NT", "OT", "PT", "QT", "RT", "ST", "TT", "1CB", "2CB", "3CB", "4CB",
    "5CB", "6CB", "7CB", "8CB", "9CB", "10CB", "11CB", "12CB", "13CB", "14CB", "1CT", "2CT",
    "3CT", "4CT", "5CT", "6CT", "7CT", "8CT", "9CT", "10CT", "11CT", "12CT", "13CT", "14CT",
    "1WB", "2WB", "3WB", "4WB", "5WB", "6WB", "7WB", "8WB", "9WB", "10WB", "11WB", "12WB",
    "13WB", "14WB", "1WT", "2WT", "3WT", "4WT", "5WT", "6WT", "7WT", "8WT", "9WT", "10WT",
    "11WT", "12WT", "13WT", "14WT",
];

// =============================================================================
// Arguments
// =============================================================================

/// Beam aperture size. `Unchanged` leaves the slits where they are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApertureSize {
    /// Do not touch the slits.
    #[default]
    Unchanged,
    /// Small aperture.
    Small,
    /// Medium aperture.
    Medium,
    /// Large aperture.
    Large,
}

impl FromStr for ApertureSize {
    type Err = SansError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "" => Ok(ApertureSize::Unchanged),
            "SMALL" => Ok(ApertureSize::Small),
            "MEDIUM" => Ok(ApertureSize::Medium),
            "LARGE" => Ok(ApertureSize::Large),
            _ => Err(SansError::InvalidAperture(s.to_string())),
        }
    }
}

impl fmt::Display for ApertureSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ApertureSize::Unchanged => "unchanged",
            ApertureSize::Small => "Small",
            ApertureSize::Medium => "Medium",
            ApertureSize::Large => "Large",
        })
    }
}

/// Acquisition mode for a SANS run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SansMode {
    /// Event mode.
    #[default]
    Event,
    /// Histogram mode.
    Histogram,
}

impl FromStr for SansMode {
    type Err = SansError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "EVENT" => Ok(SansMode::Event),
            "HISTOGRAM" => Ok(SansMode::Histogram),
            _ => Err(SansError::InvalidSansMode(s.to_string())),
        }
    }
}

/// Where to put the sample before a measurement.
#[derive(Clone)]
pub enum Position {
    /// A sample-changer slot, checked against the allow-list.
    Named(String),
    /// A move routine, e.g. swinging a polariser into the beam.
    Routine(Arc<dyn PositionRoutine>),
}

impl fmt::Debug for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Position::Named(name) => f.debug_tuple("Named").field(name).finish(),
            Position::Routine(routine) => f.debug_tuple("Routine").field(&routine.name()).finish(),
        }
    }
}

/// Everything `measure` needs to know about one run.
#[derive(Debug, Clone)]
pub struct MeasureRequest {
    /// Run title; the SANS/TRANS footer is appended.
    pub title: String,
    /// Sample position. `None` measures where the sample already is.
    pub position: Option<Position>,
    /// Sample thickness (mm).
    pub thickness: f64,
    /// Transmission rather than SANS.
    pub trans: bool,
    /// Aperture to configure.
    pub aperture: ApertureSize,
    /// Acquisition mode for SANS runs.
    pub sans_mode: SansMode,
    /// Blocks to move before the run, in order.
    pub blocks: Vec<(String, Value)>,
    /// Run duration conditions.
    pub timings: Vec<Timing>,
}

impl MeasureRequest {
    /// A SANS run on a 1mm sample in the current position.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            position: None,
            thickness: 1.0,
            trans: false,
            aperture: ApertureSize::Unchanged,
            sans_mode: SansMode::Event,
            blocks: Vec::new(),
            timings: Vec::new(),
        }
    }

    /// Move to a sample-changer slot first.
    pub fn position(mut self, slot: impl Into<String>) -> Self {
        self.position = Some(Position::Named(slot.into()));
        self
    }

    /// Run a move routine first.
    pub fn routine(mut self, routine: Arc<dyn PositionRoutine>) -> Self {
        self.position = Some(Position::Routine(routine));
        self
    }

    /// Sample thickness in mm.
    pub fn thickness(mut self, thickness: f64) -> Self {
        self.thickness = thickness;
        self
    }

    /// Take a transmission run instead of a SANS run.
    pub fn trans(mut self, trans: bool) -> Self {
        self.trans = trans;
        self
    }

    /// Aperture to configure.
    pub fn aperture(mut self, aperture: ApertureSize) -> Self {
        self.aperture = aperture;
        self
    }

    /// Acquisition mode for a SANS run.
    pub fn sans_mode(mut self, mode: SansMode) -> Self {
        self.sans_mode = mode;
        self
    }

    /// Move a block before the run.
    pub fn block(mut self, block: impl Into<String>, value: impl Into<Value>) -> Self {
        self.blocks.push((block.into(), value.into()));
        self
    }

    /// Add a run duration condition.
    pub fn timing(mut self, timing: Timing) -> Self {
        self.timings.push(timing);
        self
    }

    /// Count until `uamps` microamp hours have been delivered.
    pub fn uamps(self, uamps: f64) -> Self {
        self.timing(Timing::Uamps(uamps))
    }

    /// Count for `frames` proton pulses.
    pub fn frames(self, frames: u64) -> Self {
        self.timing(Timing::Frames(frames))
    }

    /// Count for `seconds`.
    pub fn seconds(self, seconds: f64) -> Self {
        self.timing(Timing::Seconds(seconds))
    }

    /// Count for `minutes`.
    pub fn minutes(self, minutes: f64) -> Self {
        self.timing(Timing::Minutes(minutes))
    }

    /// Count for `hours`.
    pub fn hours(self, hours: f64) -> Self {
        self.timing(Timing::Hours(hours))
    }

    /// Keyword-style option: timing names set the run duration, anything
    /// else is a block move.
    pub fn option(self, key: &str, value: Value) -> AppResult<Self> {
        if Timing::is_timing(key) {
            let amount = value.as_f64().ok_or_else(|| {
                SansError::InvalidArgument(format!("{} must be numeric, got {}", key, value))
            })?;
            Ok(self.timing(Timing::from_key(key, amount)?))
        } else {
            Ok(self.block(key, value))
        }
    }

    /// Build a request from keyword options, in the order given.
    ///
    /// `pos`, `routine`, `thickness`, `trans`, `aperture` (or `size`) and
    /// `mode` configure the run; everything else goes through
    /// [`option`](Self::option). `routine` is resolved on `instrument`.
    pub fn from_options(
        title: impl Into<String>,
        options: &[(&str, Value)],
        instrument: &dyn ScanningInstrument,
    ) -> AppResult<Self> {
        let mut request = Self::new(title);
        for (key, value) in options {
            request = match (*key, value) {
                ("pos", Value::Text(slot)) => request.position(slot.clone()),
                ("routine", Value::Text(name)) => {
                    let routine = instrument
                        .routine(name)
                        .ok_or_else(|| SansError::UnknownPosition(name.clone()))?;
                    request.routine(routine)
                }
                ("thickness", Value::Number(thickness)) => request.thickness(*thickness),
                ("trans", Value::Number(flag)) => request.trans(*flag != 0.0),
                ("aperture" | "size", Value::Text(size)) => request.aperture(size.parse()?),
                ("mode", Value::Text(mode)) => request.sans_mode(mode.parse()?),
                (
                    "pos" | "routine" | "thickness" | "trans" | "aperture" | "size" | "mode",
                    other,
                ) => {
                    return Err(SansError::InvalidArgument(format!(
                        "Bad value {} for {}",
                        other, key
                    )))
                }
                (key, value) => request.option(key, value.clone())?,
            };
        }
        Ok(request)
    }
}

// =============================================================================
// The contract
// =============================================================================

/// A scanning SANS instrument.
///
/// Implementors supply the hardware-specific operations; the run logic lives
/// in the default methods.
#[async_trait]
pub trait ScanningInstrument: Send + Sync {
    /// Instrument name used in log messages, e.g. "Larmor".
    fn name(&self) -> &'static str;

    /// The control API this instrument drives.
    fn control(&self) -> &dyn ControlApi;

    /// Sample-changer slots this instrument can move through.
    fn positions(&self) -> &[&'static str];

    /// Memoized DAE mode and title footer.
    fn state(&self) -> &InstrumentState;

    /// Mutable access to [`state`](Self::state).
    fn state_mut(&mut self) -> &mut InstrumentState;

    /// Load the tables for `mode`, unconditionally.
    ///
    /// Called through [`setup_dae`](Self::setup_dae); call that instead.
    async fn apply_dae(&self, mode: DaeMode, options: &DaeOptions) -> AppResult<()>;

    /// Set the beam aperture.
    async fn set_aperture(&self, size: ApertureSize) -> AppResult<()>;

    /// Is the detector currently powered?
    async fn detector_is_on(&self) -> AppResult<bool>;

    /// Power on the detector, optionally waiting for it to warm up.
    async fn detector_turn_on(&self, delay: bool) -> AppResult<()>;

    /// Remove detector power, optionally waiting for it to ramp down.
    async fn detector_turn_off(&self, delay: bool) -> AppResult<()>;

    /// Instrument-specific steps for a SANS run (e.g. remove the monitor
    /// from the beam).
    async fn configure_sans_custom(&self, _size: ApertureSize, _mode: SansMode) -> AppResult<()> {
        Ok(())
    }

    /// Instrument-specific steps for a transmission run (e.g. put the
    /// monitor in the beam).
    async fn configure_trans_custom(&self, _size: ApertureSize) -> AppResult<()> {
        Ok(())
    }

    /// Look up a named move routine.
    fn routine(&self, _name: &str) -> Option<Arc<dyn PositionRoutine>> {
        None
    }

    /// Load the tables for `mode` with default options, unless already loaded.
    async fn setup_dae(&mut self, mode: DaeMode) -> AppResult<()> {
        self.setup_dae_with(mode, &DaeOptions::default()).await
    }

    /// Load the tables for `mode`, unless already loaded.
    ///
    /// A change is logged before it is applied. If applying fails the loaded
    /// mode is unknown and the next setup always reloads.
    async fn setup_dae_with(&mut self, mode: DaeMode, options: &DaeOptions) -> AppResult<()> {
        if !self.state().needs(mode) {
            debug!("{} already set up for {}", self.name(), mode);
            return Ok(());
        }
        info!("Setup {} for {}", self.name(), mode);
        match self.apply_dae(mode, options).await {
            Ok(()) => {
                self.state_mut().record(mode);
                Ok(())
            }
            Err(e) => {
                self.state_mut().forget();
                Err(e)
            }
        }
    }

    /// Set up the instrument for a SANS measurement.
    async fn configure_sans(&mut self, size: ApertureSize, mode: SansMode) -> AppResult<()> {
        self.state_mut().title_footer = TitleFooter::Sans;
        match mode {
            SansMode::Histogram => self.setup_dae(DaeMode::Histogram).await?,
            SansMode::Event => self.setup_dae(DaeMode::Event).await?,
        }
        self.set_aperture(size).await?;
        self.configure_sans_custom(size, mode).await
    }

    /// Set up the instrument for a transmission measurement.
    async fn configure_trans(&mut self, size: ApertureSize) -> AppResult<()> {
        self.state_mut().title_footer = TitleFooter::Trans;
        self.setup_dae(DaeMode::Transmission).await?;
        self.control().waitfor_move().await?;
        self.set_aperture(size).await?;
        self.configure_trans_custom(size).await
    }

    /// Whether `pos` is a known sample-changer slot (case-insensitive).
    fn check_move_pos(&self, pos: &str) -> bool {
        let wanted = pos.to_uppercase();
        if self.positions().iter().any(|p| *p == wanted) {
            true
        } else {
            warn!("Error in script, position {} does not exist", pos);
            false
        }
    }

    /// Fail unless the control system is ready to begin a run.
    async fn needs_setup(&self) -> AppResult<()> {
        match self.control().get_runstate().await? {
            RunState::Setup => Ok(()),
            state => Err(SansError::MeasurementInProgress {
                state: state.to_string(),
            }),
        }
    }

    /// Display the basic sample parameters.
    async fn print_sample_pars(&self) -> AppResult<()> {
        let pars = self.control().get_sample_pars().await?;
        info!("Geometry={}", pars.geometry);
        info!("Width={}", pars.width);
        info!("Height={}", pars.height);
        info!("Thickness={}", pars.thickness);
        Ok(())
    }

    /// Take a sample measurement.
    ///
    /// Moves the sample and any requested blocks, configures the instrument
    /// for SANS or transmission, records the thickness and counts for the
    /// requested duration.
    async fn measure(&mut self, request: MeasureRequest) -> AppResult<()> {
        self.needs_setup().await?;
        if !request.trans && !self.detector_is_on().await? {
            warn!("The detector was off.  Turning on the detector");
            self.detector_turn_on(true).await?;
        }

        match &request.position {
            Some(Position::Named(slot)) => {
                if !self.check_move_pos(slot) {
                    return Err(SansError::UnknownPosition(slot.clone()));
                }
                let slot = slot.to_uppercase();
                info!("Moving to sample changer position {}", slot);
                self.control().cset("SamplePos", Value::Text(slot)).await?;
            }
            Some(Position::Routine(routine)) => {
                info!("Moving to position {}", routine.name());
                routine.apply(self.control()).await?;
            }
            None => {}
        }

        for (block, value) in &request.blocks {
            info!("Moving {} to {}", block, value);
            self.control().cset(block, value.clone()).await?;
        }
        if !request.blocks.is_empty() {
            self.control().waitfor_move().await?;
        }

        if request.trans {
            self.configure_trans(request.aperture).await?;
        } else {
            self.configure_sans(request.aperture, request.sans_mode)
                .await?;
        }
        self.control().waitfor_move().await?;
        self.control()
            .change_sample_par("Thick", Value::Number(request.thickness))
            .await?;
        info!("Using the following Sample Parameters");
        self.print_sample_pars().await?;

        let title = format!("{}{}", request.title, self.state().title_footer.as_str());
        self.control().change(RunChange::Title(title)).await?;
        self.control().begin().await?;
        self.control().waitfor(&request.timings).await?;
        self.control().end().await
    }
}
