//! Custom error types for the scripting layer.
//!
//! `SansError` is the single error type returned by the instrument contract,
//! the control-API seam and the script host. Using `thiserror`, each variant
//! carries the operator-facing message that ends up on the console when a
//! user script aborts.
//!
//! ## Error Hierarchy
//!
//! - **`MeasurementInProgress`**: the control system is not in `SETUP`, so a
//!   new run cannot be started.
//! - **`UnknownPosition` / `UnknownBlock`**: script mistakes caught before any
//!   hardware moves (a sample-changer slot that is not on the allow-list, or a
//!   block the control system does not know).
//! - **`UnsupportedDaeMode` / `NotImplemented`**: the instrument does not
//!   provide the requested wiring table or operation.
//! - **`Control`**: anything raised by the control API itself.
//! - **`Script`**: compilation or runtime failures inside a user script.
//! - **`Config`**: wraps [`ConfigError`] from configuration loading.

use thiserror::Error;

use crate::config::ConfigError;

/// Convenience alias for results using the scripting error type.
pub type AppResult<T> = std::result::Result<T, SansError>;

/// Errors raised while driving a beamline.
#[derive(Error, Debug)]
pub enum SansError {
    /// A run is already under way.
    #[error("Cannot start a measurement in a measurement (run state is {state})")]
    MeasurementInProgress {
        /// Run state reported by the control system.
        state: String,
    },

    /// Sample-changer position not on the instrument's allow-list.
    #[error("Position {0} does not exist")]
    UnknownPosition(String),

    /// Block name the control system does not know.
    #[error("Unknown Block {0}")]
    UnknownBlock(String),

    /// Wiring-table mode name that does not parse.
    #[error("Unknown DAE mode '{0}'")]
    UnknownDaeMode(String),

    /// The instrument has no tables for this mode.
    #[error("{instrument} has no wiring tables for {mode}")]
    UnsupportedDaeMode {
        /// Instrument name.
        instrument: String,
        /// Requested mode, human readable.
        mode: String,
    },

    /// The instrument does not implement this operation yet.
    #[error("{instrument}: {feature} hasn't been written")]
    NotImplemented {
        /// Instrument name.
        instrument: String,
        /// Missing operation.
        feature: String,
    },

    /// Script function that belongs to another beamline.
    #[error("{function} is not available on {instrument}")]
    NotOnInstrument {
        /// Script function called.
        function: String,
        /// Instrument in use.
        instrument: String,
    },

    /// Unrecognised aperture size.
    #[error("Unknown aperture size '{0}'")]
    InvalidAperture(String),

    /// Unrecognised SANS acquisition mode.
    #[error("Unknown SANS mode '{0}'. Expected 'event' or 'histogram'")]
    InvalidSansMode(String),

    /// Bad argument passed to an operation.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Failure reported by the control API.
    #[error("Control API error: {0}")]
    Control(String),

    /// Failure inside a user script.
    #[error("Script error: {0}")]
    Script(String),

    /// Configuration could not be loaded or validated.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// I/O failure, typically reading a script file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
