//! Instrument selection and the shared beamline handle.
//!
//! A session owns exactly one concrete instrument. Scripts reach it through
//! [`SharedBeamline`], which serialises every call onto the instrument.

use std::fmt;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::{InstrumentSelection, MockConfig, SansConfig};
use crate::control::{ControlApi, MockControl};
use crate::error::{AppResult, SansError};
use crate::instrument::{Larmor, ScanningInstrument, Zoom};

/// The beamlines this crate can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrumentKind {
    /// Larmor.
    Larmor,
    /// Zoom.
    Zoom,
}

impl InstrumentKind {
    /// Instrument name as it appears in host names and logs.
    pub fn name(&self) -> &'static str {
        match self {
            InstrumentKind::Larmor => "Larmor",
            InstrumentKind::Zoom => "Zoom",
        }
    }
}

impl fmt::Display for InstrumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Whether `host` belongs to the instrument called `title`.
pub fn is_instrument(title: &str, host: &str) -> bool {
    host.to_uppercase().contains(&title.to_uppercase())
}

/// Name of the machine this process runs on, or an empty string.
pub fn current_host() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Instrument for a host when nothing is configured.
///
/// Off a Larmor machine this still answers Larmor, so development machines
/// get a working instrument. Zoom is never picked from the host name.
pub fn detect(host: &str) -> InstrumentKind {
    if is_instrument(InstrumentKind::Larmor.name(), host) {
        debug!("Host {} is a Larmor machine", host);
    } else {
        debug!("Host {} is not an instrument machine; defaulting to Larmor", host);
    }
    InstrumentKind::Larmor
}

/// Resolve a configured selection against the host name.
pub fn select(selection: InstrumentSelection, host: &str) -> InstrumentKind {
    match selection {
        InstrumentSelection::Auto => detect(host),
        InstrumentSelection::Larmor => InstrumentKind::Larmor,
        InstrumentSelection::Zoom => InstrumentKind::Zoom,
    }
}

/// A mock control system with the configured extra blocks.
pub fn mock_control(config: &MockConfig) -> MockControl {
    config
        .extra_blocks
        .iter()
        .fold(MockControl::new(), |mock, (name, value)| {
            mock.with_block(name, *value)
        })
}

/// The instrument a session drives.
pub enum Beamline {
    /// Larmor.
    Larmor(Larmor),
    /// Zoom.
    Zoom(Zoom),
}

/// A beamline shared between the script host and its caller.
pub type SharedBeamline = Arc<Mutex<Beamline>>;

impl Beamline {
    /// Build the instrument of `kind` on top of `control`.
    pub fn build(kind: InstrumentKind, control: Arc<dyn ControlApi>, config: &SansConfig) -> Self {
        info!("Using the {} instrument", kind);
        match kind {
            InstrumentKind::Larmor => Beamline::Larmor(Larmor::new(control, config.larmor.clone())),
            InstrumentKind::Zoom => {
                Beamline::Zoom(Zoom::new(control, config.zoom.pv_prefix.clone()))
            }
        }
    }

    /// Wrap for sharing with a script host.
    pub fn shared(self) -> SharedBeamline {
        Arc::new(Mutex::new(self))
    }

    /// Which instrument this is.
    pub fn kind(&self) -> InstrumentKind {
        match self {
            Beamline::Larmor(_) => InstrumentKind::Larmor,
            Beamline::Zoom(_) => InstrumentKind::Zoom,
        }
    }

    /// The instrument contract.
    pub fn instrument(&self) -> &dyn ScanningInstrument {
        match self {
            Beamline::Larmor(larmor) => larmor,
            Beamline::Zoom(zoom) => zoom,
        }
    }

    /// The instrument contract, mutably.
    pub fn instrument_mut(&mut self) -> &mut dyn ScanningInstrument {
        match self {
            Beamline::Larmor(larmor) => larmor,
            Beamline::Zoom(zoom) => zoom,
        }
    }

    /// The Larmor instrument, for a script function that only Larmor has.
    pub fn larmor(&self, function: &str) -> AppResult<&Larmor> {
        match self {
            Beamline::Larmor(larmor) => Ok(larmor),
            other => Err(other.not_here(function)),
        }
    }

    /// The Zoom instrument, for a script function that only Zoom has.
    pub fn zoom(&self, function: &str) -> AppResult<&Zoom> {
        match self {
            Beamline::Zoom(zoom) => Ok(zoom),
            other => Err(other.not_here(function)),
        }
    }

    fn not_here(&self, function: &str) -> SansError {
        SansError::NotOnInstrument {
            function: function.to_string(),
            instrument: self.kind().to_string(),
        }
    }
}
