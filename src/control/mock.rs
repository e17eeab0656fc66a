//! Mock control API
//!
//! Provides an in-memory stand-in for the facility control system so scripts
//! can be exercised without a beamline. It provides:
//! - Run-state tracking (`SETUP` ⇄ `RUNNING` through `begin`/`end`)
//! - A block table that rejects unknown block names, catching typos in a
//!   user script before it reaches the real instrument
//! - Simulated detector high-voltage PVs
//! - A typed call log for test verification and run-time estimates
//!
//! Waits and sleeps return immediately.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    ControlApi, RunChange, RunState, SampleParameters, TableKind, TimeChannelBoundary, Timing,
    Value,
};
use crate::error::{AppResult, SansError};

/// Blocks known to a fresh mock, with their initial values.
pub const DEFAULT_BLOCKS: &[(&str, f64)] = &[
    ("CoarseZ", 0.0),
    ("Translation", 0.0),
    ("SampleX", 0.0),
    ("T0Phase", 0.0),
    ("TargetDiskPhase", 0.0),
    ("InstrumentDiskPhase", 0.0),
    ("m4trans", 0.0),
    ("Julabo1_SP", 0.0),
    ("a1hgap", 0.0),
    ("a1vgap", 0.0),
    ("s1hgap", 0.0),
    ("s1vgap", 0.0),
    ("cjhgap", 0.0),
    ("cjvgap", 0.0),
    ("pol_trans", 0.0),
    ("pol_arc", 0.0),
    ("BSY", 0.0),
    ("BSZ", 0.0),
    ("benchlift", 0.0),
    ("bench_rot", 0.0),
];

/// One recorded call against the mock.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCall {
    /// `change`
    Change(RunChange),
    /// `change_start`
    ChangeStart,
    /// `change_tables`
    ChangeTables {
        /// Table loaded.
        kind: TableKind,
        /// File loaded into it.
        path: String,
    },
    /// `change_tcb`
    ChangeTcb(TimeChannelBoundary),
    /// `change_finish`
    ChangeFinish,
    /// `change_sync`
    ChangeSync(String),
    /// `get_runstate`
    GetRunState,
    /// `begin`
    Begin,
    /// `end`
    End,
    /// `waitfor`
    WaitFor(Vec<Timing>),
    /// `waitfor_move`
    WaitForMove,
    /// `cset`
    Cset {
        /// Block moved.
        block: String,
        /// Target value.
        value: Value,
    },
    /// `cget`
    Cget(String),
    /// `set_pv`
    SetPv {
        /// PV written.
        name: String,
        /// Value written.
        value: Value,
    },
    /// `get_pv`
    GetPv(String),
    /// `change_sample_par`
    ChangeSamplePar {
        /// Parameter name as given.
        name: String,
        /// New value.
        value: Value,
    },
    /// `get_sample_pars`
    GetSamplePars,
    /// `sleep`
    Sleep(Duration),
}

struct MockState {
    run_state: RunState,
    blocks: HashMap<String, Value>,
    pvs: HashMap<String, Value>,
    sample: SampleParameters,
    detector_power: String,
    fail_next: Option<String>,
    calls: Vec<ControlCall>,
}

impl MockState {
    fn new() -> Self {
        let mut blocks: HashMap<String, Value> = DEFAULT_BLOCKS
            .iter()
            .map(|(name, value)| (name.to_string(), Value::Number(*value)))
            .collect();
        blocks.insert("SamplePos".to_string(), Value::Text(String::new()));

        Self {
            run_state: RunState::Setup,
            blocks,
            pvs: HashMap::new(),
            sample: SampleParameters::default(),
            detector_power: "On".to_string(),
            fail_next: None,
            calls: Vec::new(),
        }
    }
}

/// In-memory control system.
///
/// Cloning shares the underlying state, so a test can keep a handle while
/// the instrument owns another.
///
/// # Example
///
/// ```
/// use sans_scripting::control::{ControlApi, MockControl, RunState};
///
/// # tokio_test_block(async {
/// let mock = MockControl::new();
/// mock.begin().await.unwrap();
/// assert_eq!(mock.run_state(), RunState::Running);
/// # });
/// # fn tokio_test_block<F: std::future::Future>(f: F) {
/// #     tokio::runtime::Runtime::new().unwrap().block_on(f);
/// # }
/// ```
#[derive(Clone)]
pub struct MockControl {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockControl {
    fn default() -> Self {
        Self::new()
    }
}

impl MockControl {
    /// Create a mock in `SETUP` with the default block table and the
    /// detector powered on.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::new())),
        }
    }

    /// Register an additional block.
    pub fn with_block(self, name: &str, value: impl Into<Value>) -> Self {
        self.state
            .lock()
            .blocks
            .insert(name.to_string(), value.into());
        self
    }

    /// Preset a PV value.
    pub fn with_pv(self, name: &str, value: impl Into<Value>) -> Self {
        self.state.lock().pvs.insert(name.to_string(), value.into());
        self
    }

    /// Start in a given run state.
    pub fn with_run_state(self, run_state: RunState) -> Self {
        self.state.lock().run_state = run_state;
        self
    }

    /// Simulated detector high-voltage state.
    pub fn set_detector_powered(&self, on: bool) {
        self.state.lock().detector_power = if on { "On" } else { "Off" }.to_string();
    }

    /// Whether the simulated detector is powered.
    pub fn detector_powered(&self) -> bool {
        self.state.lock().detector_power == "On"
    }

    /// Make the next call fail with a control error.
    pub fn inject_next_failure(&self, message: &str) {
        self.state.lock().fail_next = Some(message.to_string());
    }

    /// Current run state.
    pub fn run_state(&self) -> RunState {
        self.state.lock().run_state.clone()
    }

    /// Current value of a block.
    pub fn block(&self, name: &str) -> Option<Value> {
        self.state.lock().blocks.get(name).cloned()
    }

    /// Last value written to a PV.
    pub fn pv(&self, name: &str) -> Option<Value> {
        self.state.lock().pvs.get(name).cloned()
    }

    /// Current sample parameters.
    pub fn sample_parameters(&self) -> SampleParameters {
        self.state.lock().sample.clone()
    }

    /// Snapshot of every call made so far.
    pub fn calls(&self) -> Vec<ControlCall> {
        self.state.lock().calls.clone()
    }

    /// Clear the call log. The simulated hardware state is kept.
    pub fn reset(&self) {
        self.state.lock().calls.clear();
    }

    fn record(&self, call: ControlCall) -> AppResult<()> {
        let mut state = self.state.lock();
        state.calls.push(call);
        match state.fail_next.take() {
            Some(message) => Err(SansError::Control(message)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ControlApi for MockControl {
    async fn change(&self, change: RunChange) -> AppResult<()> {
        self.record(ControlCall::Change(change))
    }

    async fn change_start(&self) -> AppResult<()> {
        self.record(ControlCall::ChangeStart)
    }

    async fn change_tables(&self, kind: TableKind, path: &str) -> AppResult<()> {
        self.record(ControlCall::ChangeTables {
            kind,
            path: path.to_string(),
        })
    }

    async fn change_tcb(&self, tcb: &TimeChannelBoundary) -> AppResult<()> {
        self.record(ControlCall::ChangeTcb(*tcb))
    }

    async fn change_finish(&self) -> AppResult<()> {
        self.record(ControlCall::ChangeFinish)
    }

    async fn change_sync(&self, source: &str) -> AppResult<()> {
        self.record(ControlCall::ChangeSync(source.to_string()))
    }

    async fn get_runstate(&self) -> AppResult<RunState> {
        self.record(ControlCall::GetRunState)?;
        Ok(self.state.lock().run_state.clone())
    }

    async fn begin(&self) -> AppResult<()> {
        self.record(ControlCall::Begin)?;
        self.state.lock().run_state = RunState::Running;
        Ok(())
    }

    async fn end(&self) -> AppResult<()> {
        self.record(ControlCall::End)?;
        self.state.lock().run_state = RunState::Setup;
        Ok(())
    }

    async fn waitfor(&self, timings: &[Timing]) -> AppResult<()> {
        self.record(ControlCall::WaitFor(timings.to_vec()))
    }

    async fn waitfor_move(&self) -> AppResult<()> {
        self.record(ControlCall::WaitForMove)
    }

    async fn cset(&self, block: &str, value: Value) -> AppResult<()> {
        self.record(ControlCall::Cset {
            block: block.to_string(),
            value: value.clone(),
        })?;
        let mut state = self.state.lock();
        match state.blocks.get_mut(block) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(SansError::UnknownBlock(block.to_string())),
        }
    }

    async fn cget(&self, block: &str) -> AppResult<Value> {
        self.record(ControlCall::Cget(block.to_string()))?;
        self.state
            .lock()
            .blocks
            .get(block)
            .cloned()
            .ok_or_else(|| SansError::UnknownBlock(block.to_string()))
    }

    async fn set_pv(&self, name: &str, value: Value) -> AppResult<()> {
        self.record(ControlCall::SetPv {
            name: name.to_string(),
            value: value.clone(),
        })?;
        let mut state = self.state.lock();
        if name.contains("pwonoff") {
            state.detector_power = value.to_string();
        }
        state.pvs.insert(name.to_string(), value);
        Ok(())
    }

    async fn get_pv(&self, name: &str) -> AppResult<Value> {
        self.record(ControlCall::GetPv(name.to_string()))?;
        let state = self.state.lock();
        if name.contains("hv0") {
            let on = state.detector_power == "On";
            return Ok(Value::Number(if on { 1.0 } else { 0.0 }));
        }
        Ok(state.pvs.get(name).cloned().unwrap_or(Value::Number(0.0)))
    }

    async fn change_sample_par(&self, name: &str, value: Value) -> AppResult<()> {
        self.record(ControlCall::ChangeSamplePar {
            name: name.to_string(),
            value: value.clone(),
        })?;
        if name.eq_ignore_ascii_case("thick") {
            let thickness = value.as_f64().ok_or_else(|| {
                SansError::InvalidArgument(format!("Thickness must be numeric, got {}", value))
            })?;
            self.state.lock().sample.thickness = thickness;
        }
        Ok(())
    }

    async fn get_sample_pars(&self) -> AppResult<SampleParameters> {
        self.record(ControlCall::GetSamplePars)?;
        Ok(self.state.lock().sample.clone())
    }

    async fn sleep(&self, duration: Duration) -> AppResult<()> {
        self.record(ControlCall::Sleep(duration))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_begin_end_tracks_run_state() {
        let mock = MockControl::new();
        assert_eq!(mock.get_runstate().await.unwrap(), RunState::Setup);

        mock.begin().await.unwrap();
        assert_eq!(mock.get_runstate().await.unwrap(), RunState::Running);

        mock.end().await.unwrap();
        assert_eq!(mock.get_runstate().await.unwrap(), RunState::Setup);
    }

    #[tokio::test]
    async fn test_cset_unknown_block_fails() {
        let mock = MockControl::new();
        let result = mock.cset("CoarseZZ", Value::from(38.0)).await;
        assert!(matches!(result, Err(SansError::UnknownBlock(name)) if name == "CoarseZZ"));

        mock.cset("CoarseZ", Value::from(38.0)).await.unwrap();
        assert_eq!(mock.cget("CoarseZ").await.unwrap(), Value::from(38.0));
    }

    #[tokio::test]
    async fn test_with_block_registers_extra_block() {
        let mock = MockControl::new().with_block("Julabo2_SP", 20.0);
        mock.cset("Julabo2_SP", Value::from(25.0)).await.unwrap();
        assert_eq!(mock.block("Julabo2_SP"), Some(Value::from(25.0)));
    }

    #[tokio::test]
    async fn test_detector_pvs() {
        let mock = MockControl::new();
        let status = "IN:LARMOR:CAEN:hv0:0:8:status";
        assert_eq!(mock.get_pv(status).await.unwrap(), Value::from(1.0));

        mock.set_pv("IN:LARMOR:CAEN:hv0:0:8:pwonoff", Value::from("Off"))
            .await
            .unwrap();
        assert!(!mock.detector_powered());
        assert_eq!(mock.get_pv(status).await.unwrap(), Value::from(0.0));
    }

    #[tokio::test]
    async fn test_unknown_pv_reads_last_written_or_zero() {
        let mock = MockControl::new().with_pv("IN:LARMOR:BENCH:STATUS", 1.0);
        assert_eq!(
            mock.get_pv("IN:LARMOR:BENCH:STATUS").await.unwrap(),
            Value::from(1.0)
        );
        assert_eq!(mock.get_pv("IN:LARMOR:UNSET").await.unwrap(), Value::from(0.0));
    }

    #[tokio::test]
    async fn test_change_sample_thickness() {
        let mock = MockControl::new();
        assert_eq!(mock.sample_parameters().thickness, 1.0);
        mock.change_sample_par("Thick", Value::from(2.0)).await.unwrap();
        assert_eq!(mock.get_sample_pars().await.unwrap().thickness, 2.0);

        // Other parameters are accepted but not simulated
        mock.change_sample_par("Width", Value::from(5.0)).await.unwrap();
        assert_eq!(mock.sample_parameters().width, 10.0);
    }

    #[tokio::test]
    async fn test_call_log_and_reset() {
        let mock = MockControl::new();
        mock.waitfor(&[Timing::Uamps(10.0)]).await.unwrap();
        mock.sleep(Duration::from_secs(20)).await.unwrap();

        assert_eq!(
            mock.calls(),
            vec![
                ControlCall::WaitFor(vec![Timing::Uamps(10.0)]),
                ControlCall::Sleep(Duration::from_secs(20)),
            ]
        );

        mock.reset();
        assert!(mock.calls().is_empty());
    }

    #[tokio::test]
    async fn test_injected_failure_applies_once() {
        let mock = MockControl::new();
        mock.inject_next_failure("DAE not responding");

        let result = mock.change_start().await;
        assert!(matches!(result, Err(SansError::Control(msg)) if msg == "DAE not responding"));
        assert!(mock.change_start().await.is_ok());
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let mock = MockControl::new();
        let handle = mock.clone();
        mock.begin().await.unwrap();
        assert_eq!(handle.run_state(), RunState::Running);
        assert_eq!(handle.calls().len(), 1);
    }
}
