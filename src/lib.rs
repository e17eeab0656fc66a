//! Scripting layer for the Larmor and Zoom SANS beamlines.
//!
//! User scripts call a small set of instrument commands (`measure`,
//! `setup_dae`, `set_aperture`, ...) that are translated into control-API
//! calls. The crate is organised as:
//!
//! - [`control`]: the control-API seam and an in-memory mock
//! - [`dae`]: wiring-table modes and the setup memo
//! - [`instrument`]: the scanning-instrument contract, Larmor and Zoom
//! - [`session`]: instrument selection and the shared beamline handle
//! - [`scripting`]: the Rhai host and the dry-run runner
//! - [`estimate`]: run-time estimates from a dry run
//! - [`config`], [`error`]: configuration and error types

pub mod config;
pub mod control;
pub mod dae;
pub mod error;
pub mod estimate;
pub mod instrument;
pub mod scripting;
pub mod session;

pub use error::{AppResult, SansError};
pub use instrument::{MeasureRequest, ScanningInstrument};
pub use session::{Beamline, InstrumentKind, SharedBeamline};
