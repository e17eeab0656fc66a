//! Zoom beamline.
//!
//! Only the sample changer and the measurement metadata PVs are wired up so
//! far. Wiring tables, slits and the detector report
//! [`SansError::NotImplemented`] so a script fails before the first run.

use std::sync::Arc;

use async_trait::async_trait;

use super::{ApertureSize, ScanningInstrument, SAMPLE_CHANGER};
use crate::control::{ControlApi, Value};
use crate::dae::{DaeMode, DaeOptions, InstrumentState};
use crate::error::{AppResult, SansError};

/// The Zoom instrument.
pub struct Zoom {
    control: Arc<dyn ControlApi>,
    pv_prefix: String,
    state: InstrumentState,
}

impl Zoom {
    /// Create a Zoom driving `control` with PVs under `pv_prefix`.
    pub fn new(control: Arc<dyn ControlApi>, pv_prefix: impl Into<String>) -> Self {
        Self {
            control,
            pv_prefix: pv_prefix.into(),
            state: InstrumentState::default(),
        }
    }

    async fn set_measurement_field(&self, field: &str, value: Value) -> AppResult<()> {
        let pv = format!("{}PARS:SAMPLE:MEAS:{}", self.pv_prefix, field);
        self.control.set_pv(&pv, value).await
    }

    /// Record the measurement type in the journal.
    pub async fn set_measurement_type(&self, value: impl Into<Value> + Send) -> AppResult<()> {
        self.set_measurement_field("TYPE", value.into()).await
    }

    /// Record the measurement label in the journal.
    pub async fn set_measurement_label(&self, value: impl Into<Value> + Send) -> AppResult<()> {
        self.set_measurement_field("LABEL", value.into()).await
    }

    /// Record the measurement id in the journal.
    pub async fn set_measurement_id(&self, value: impl Into<Value> + Send) -> AppResult<()> {
        self.set_measurement_field("ID", value.into()).await
    }

    fn missing(&self, feature: &str) -> SansError {
        SansError::NotImplemented {
            instrument: self.name().to_string(),
            feature: feature.to_string(),
        }
    }
}

/// Tables Zoom is meant to have. Larmor-only modes have no entry.
fn table_feature(mode: DaeMode) -> Option<&'static str> {
    Some(match mode {
        DaeMode::Scanning => "Scanning tables",
        DaeMode::Nr => "Neutron reflectivity tables",
        DaeMode::NrScanning => "Neutron reflectivity scanning tables",
        DaeMode::Event => "Event mode tables",
        DaeMode::EventFastsave => "Event fastsave tables",
        DaeMode::Histogram => "Histogram mode tables",
        DaeMode::Transmission => "Transmission tables",
        DaeMode::Polarised => "Polarised tables",
        DaeMode::BsAlignment => "Beam Stop Alignment tables",
        DaeMode::MonitorsOnly => "Monitors only tables",
        _ => return None,
    })
}

#[async_trait]
impl ScanningInstrument for Zoom {
    fn name(&self) -> &'static str {
        "Zoom"
    }

    fn control(&self) -> &dyn ControlApi {
        self.control.as_ref()
    }

    fn positions(&self) -> &[&'static str] {
        SAMPLE_CHANGER
    }

    fn state(&self) -> &InstrumentState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut InstrumentState {
        &mut self.state
    }

    async fn apply_dae(&self, mode: DaeMode, _options: &DaeOptions) -> AppResult<()> {
        match table_feature(mode) {
            Some(feature) => Err(self.missing(feature)),
            None => Err(SansError::UnsupportedDaeMode {
                instrument: self.name().to_string(),
                mode: mode.to_string(),
            }),
        }
    }

    async fn set_aperture(&self, _size: ApertureSize) -> AppResult<()> {
        Err(self.missing("Aperture setting"))
    }

    async fn detector_is_on(&self) -> AppResult<bool> {
        Err(self.missing("Detector testing"))
    }

    async fn detector_turn_on(&self, _delay: bool) -> AppResult<()> {
        Err(self.missing("Detector toggling"))
    }

    async fn detector_turn_off(&self, _delay: bool) -> AppResult<()> {
        Err(self.missing("Detector toggling"))
    }
}
