//! Run-time estimates from a dry run.
//!
//! A user script is first executed against [`MockControl`](crate::control::MockControl);
//! the waits it would perform are summed from the recorded call log to tell
//! the operator roughly when the real script will finish.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Local};

use crate::control::{ControlCall, Timing};
use crate::error::{AppResult, SansError};

/// Seconds of beam time per unit of each timing.
///
/// One microamp hour takes about 90 s at nominal current; one frame is a
/// 10 Hz proton pulse.
pub fn seconds_per_unit(timing: &Timing) -> f64 {
    match timing {
        Timing::Uamps(_) => 90.0,
        Timing::Frames(_) => 0.1,
        Timing::Seconds(_) => 1.0,
        Timing::Minutes(_) => 60.0,
        Timing::Hours(_) => 3600.0,
    }
}

/// Expected wall-clock seconds for one `waitfor` call.
///
/// The first condition met ends the wait, so the shortest one counts.
pub fn wait_seconds(timings: &[Timing]) -> f64 {
    timings
        .iter()
        .map(|t| seconds_per_unit(t) * t.amount())
        .reduce(f64::min)
        .unwrap_or(0.0)
}

/// Total waiting time implied by a call log.
///
/// Fails when the total does not fit in a [`Duration`].
pub fn script_duration(calls: &[ControlCall]) -> AppResult<Duration> {
    let seconds: f64 = calls
        .iter()
        .map(|call| match call {
            ControlCall::WaitFor(timings) => wait_seconds(timings),
            ControlCall::Sleep(duration) => duration.as_secs_f64(),
            _ => 0.0,
        })
        .sum();
    Duration::try_from_secs_f64(seconds).map_err(|_| {
        SansError::InvalidArgument(format!(
            "The script would wait for {} seconds, which is too long to estimate",
            seconds
        ))
    })
}

/// Estimate a script from its recorded call log, starting now.
pub fn estimate(calls: &[ControlCall]) -> AppResult<ScriptEstimate> {
    ScriptEstimate::from_calls(calls)
}

/// Outcome of a dry run.
#[derive(Debug, Clone)]
pub struct ScriptEstimate {
    /// Expected duration of the script.
    pub duration: Duration,
    /// Expected completion time if started at `started`.
    pub finish: DateTime<Local>,
    /// Number of control-API calls the script made.
    pub call_count: usize,
}

impl ScriptEstimate {
    /// Estimate from a recorded call log, for a script starting now.
    pub fn from_calls(calls: &[ControlCall]) -> AppResult<Self> {
        Self::from_calls_at(calls, Local::now())
    }

    /// Estimate from a recorded call log, for a script starting at `started`.
    pub fn from_calls_at(calls: &[ControlCall], started: DateTime<Local>) -> AppResult<Self> {
        let duration = script_duration(calls)?;
        let finish = chrono::Duration::from_std(duration)
            .ok()
            .and_then(|d| started.checked_add_signed(d))
            .ok_or_else(|| {
                SansError::InvalidArgument(format!(
                    "The script would run for {:.0} hours, past any representable finish time",
                    duration.as_secs_f64() / 3600.0
                ))
            })?;
        Ok(Self {
            duration,
            finish,
            call_count: calls.len(),
        })
    }

    /// Expected duration in hours.
    pub fn hours(&self) -> f64 {
        self.duration.as_secs_f64() / 3600.0
    }
}

impl fmt::Display for ScriptEstimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "The script should finish in {} hours\nat {}",
            self.hours(),
            self.finish.format("%Y-%m-%d %H:%M:%S")
        )
    }
}
