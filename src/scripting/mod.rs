//! User scripts.
//!
//! Scripts are written in Rhai and call the instrument directly:
//!
//! ```text
//! setup_dae("event");
//! for pos in ["AB", "BB", "CB"] {
//!     measure(`sample ${pos}`, #{ pos: pos, thickness: 1.0, uamps: 15 });
//!     measure(`sample ${pos}`, #{ pos: pos, trans: true, uamps: 5 });
//! }
//! ```
//!
//! [`ScriptRunner`] dry-runs each script against the mock control system
//! first, so a typo in a block name or position fails before the beamline
//! moves, and reports when the real run should finish.

pub mod host;
pub mod runner;

pub use host::ScriptHost;
pub use runner::ScriptRunner;
