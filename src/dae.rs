//! Wiring-table modes for the data-acquisition electronics.
//!
//! Each [`DaeMode`] names a complete DAE configuration: the detector, spectra
//! and wiring tables plus the time-channel boundaries. Reloading the tables
//! takes time, so instruments remember the mode they last loaded in
//! [`InstrumentState`] and skip a setup that would change nothing.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::control::{ControlApi, RunChange, TableKind, TimeChannelBoundary};
use crate::error::{AppResult, SansError};

/// A named DAE configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DaeMode {
    /// Scanning.
    Scanning,
    /// Neutron reflectivity.
    Nr,
    /// Scans during neutron reflectivity.
    NrScanning,
    /// Event mode with full detector binning.
    Event,
    /// Event mode with reduced detector binning for smaller files.
    EventFastsave,
    /// Histogram mode.
    Histogram,
    /// Transmission measurement (monitors only).
    Transmission,
    /// Polarisation measurement.
    Polarised,
    /// Beamstop alignment.
    BsAlignment,
    /// Record only the monitors.
    MonitorsOnly,
    /// Chopper monochromator test.
    Monotest,
    /// Detectors shifted in time to count over the frame.
    Tshift,
    /// Diffraction with log binning.
    Diffraction,
    /// Resonant imaging.
    ResonantImaging,
    /// Chopper phasing for resonant imaging.
    ResonantImagingChoppers,
    /// Four-period mode.
    FourPeriods,
}

impl DaeMode {
    /// Modes every instrument must answer for.
    pub const CONTRACT: [DaeMode; 10] = [
        DaeMode::Scanning,
        DaeMode::Nr,
        DaeMode::NrScanning,
        DaeMode::Event,
        DaeMode::EventFastsave,
        DaeMode::Histogram,
        DaeMode::Transmission,
        DaeMode::Polarised,
        DaeMode::BsAlignment,
        DaeMode::MonitorsOnly,
    ];

    /// Every known mode.
    pub const ALL: [DaeMode; 16] = [
        DaeMode::Scanning,
        DaeMode::Nr,
        DaeMode::NrScanning,
        DaeMode::Event,
        DaeMode::EventFastsave,
        DaeMode::Histogram,
        DaeMode::Transmission,
        DaeMode::Polarised,
        DaeMode::BsAlignment,
        DaeMode::MonitorsOnly,
        DaeMode::Monotest,
        DaeMode::Tshift,
        DaeMode::Diffraction,
        DaeMode::ResonantImaging,
        DaeMode::ResonantImagingChoppers,
        DaeMode::FourPeriods,
    ];

    /// Identifier used by scripts, e.g. `event_fastsave`.
    pub fn name(&self) -> &'static str {
        match self {
            DaeMode::Scanning => "scanning",
            DaeMode::Nr => "nr",
            DaeMode::NrScanning => "nrscanning",
            DaeMode::Event => "event",
            DaeMode::EventFastsave => "event_fastsave",
            DaeMode::Histogram => "histogram",
            DaeMode::Transmission => "transmission",
            DaeMode::Polarised => "polarised",
            DaeMode::BsAlignment => "bsalignment",
            DaeMode::MonitorsOnly => "monitorsonly",
            DaeMode::Monotest => "monotest",
            DaeMode::Tshift => "tshift",
            DaeMode::Diffraction => "diffraction",
            DaeMode::ResonantImaging => "resonantimaging",
            DaeMode::ResonantImagingChoppers => "resonantimaging_choppers",
            DaeMode::FourPeriods => "4periods",
        }
    }
}

impl fmt::Display for DaeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name().replace('_', " "))
    }
}

impl FromStr for DaeMode {
    type Err = SansError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        let wanted = wanted.strip_prefix("setup_dae_").unwrap_or(&wanted);
        DaeMode::ALL
            .iter()
            .copied()
            .find(|mode| mode.name() == wanted || mode.name().replace('_', " ") == wanted)
            .ok_or_else(|| SansError::UnknownDaeMode(s.to_string()))
    }
}

/// Chopper phasing for the usable wavelength band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WavelengthRange {
    /// 0.9–13.25 Å.
    #[default]
    Standard,
    /// 0.65–12.95 Å.
    Short,
}

/// Detector and monitor time windows for `tshift`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TshiftWindow {
    /// Detector window start (µs).
    pub low_detector: f64,
    /// Detector window end (µs).
    pub high_detector: f64,
    /// Monitor window start (µs).
    pub low_monitor: f64,
    /// Monitor window end (µs).
    pub high_monitor: f64,
}

impl Default for TshiftWindow {
    fn default() -> Self {
        Self {
            low_detector: 5.0,
            high_detector: 100000.0,
            low_monitor: 5.0,
            high_monitor: 100000.0,
        }
    }
}

/// Parameters some modes accept.
///
/// They do not take part in the memo: a mode that is already loaded is not
/// reloaded for different options.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DaeOptions {
    /// Detector bin width for event mode (µs).
    pub step: f64,
    /// Chopper phasing.
    pub range: WavelengthRange,
    /// Time windows for `tshift`.
    pub tshift: TshiftWindow,
}

impl Default for DaeOptions {
    fn default() -> Self {
        Self {
            step: 100.0,
            range: WavelengthRange::Standard,
            tshift: TshiftWindow::default(),
        }
    }
}

/// Paths of the three DAE binding tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WiringTables {
    /// Detector table.
    pub detector: String,
    /// Spectra table.
    pub spectra: String,
    /// Wiring table.
    pub wiring: String,
}

/// Load a complete DAE configuration in a single period.
pub async fn generic_scan(
    control: &dyn ControlApi,
    tables: &WiringTables,
    tcbs: &[TimeChannelBoundary],
) -> AppResult<()> {
    control.change(RunChange::Periods(1)).await?;
    control.change_start().await?;
    control
        .change_tables(TableKind::Detector, &tables.detector)
        .await?;
    control
        .change_tables(TableKind::Spectra, &tables.spectra)
        .await?;
    control
        .change_tables(TableKind::Wiring, &tables.wiring)
        .await?;
    for tcb in tcbs {
        control.change_tcb(tcb).await?;
    }
    control.change_finish().await
}

/// Title suffix for the kind of run the instrument is configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TitleFooter {
    /// Not configured yet.
    #[default]
    None,
    /// Small-angle scattering.
    Sans,
    /// Transmission.
    Trans,
}

impl TitleFooter {
    /// Suffix appended to run titles.
    pub fn as_str(&self) -> &'static str {
        match self {
            TitleFooter::None => "",
            TitleFooter::Sans => "_SANS",
            TitleFooter::Trans => "_TRANS",
        }
    }
}

/// Mutable per-instrument state: the memoized DAE mode and the title footer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstrumentState {
    dae_mode: Option<DaeMode>,
    /// Suffix for the next run title.
    pub title_footer: TitleFooter,
}

impl InstrumentState {
    /// Mode last loaded, or `None` when unknown.
    pub fn dae_mode(&self) -> Option<DaeMode> {
        self.dae_mode
    }

    /// Whether loading `mode` would change the tables.
    pub fn needs(&self, mode: DaeMode) -> bool {
        self.dae_mode != Some(mode)
    }

    /// Record that `mode` is loaded.
    pub fn record(&mut self, mode: DaeMode) {
        self.dae_mode = Some(mode);
    }

    /// Forget the loaded mode, e.g. after a failed or external change.
    pub fn forget(&mut self) {
        self.dae_mode = None;
    }
}
