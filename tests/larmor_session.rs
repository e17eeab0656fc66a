//! A complete user script on Larmor, end to end against the mock.

use std::sync::Arc;
use std::time::Duration;

use sans_scripting::config::SansConfig;
use sans_scripting::control::{ControlCall, MockControl, RunChange, Timing, Value};
use sans_scripting::dae::DaeMode;
use sans_scripting::scripting::ScriptRunner;
use sans_scripting::session::{Beamline, InstrumentKind};

const CALIBRATION: &str = include_str!("../demos/water_calibration.rhai");

fn titles(calls: &[ControlCall]) -> Vec<String> {
    calls
        .iter()
        .filter_map(|c| match c {
            ControlCall::Change(RunChange::Title(t)) => Some(t.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_calibration_estimate() {
    let runner = ScriptRunner::new(SansConfig::default(), InstrumentKind::Larmor);
    let estimate = runner.estimate(CALIBRATION).await.unwrap();

    // Three samples at 20 + 5 uamps, then 3000 frames of direct beam
    let expected = 3.0 * 25.0 * 90.0 + 300.0;
    assert_eq!(estimate.duration, Duration::from_secs_f64(expected));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_calibration_run() {
    let mock = MockControl::new();
    let beamline = Beamline::build(
        InstrumentKind::Larmor,
        Arc::new(mock.clone()),
        &SansConfig::default(),
    )
    .shared();
    let runner = ScriptRunner::new(SansConfig::default(), InstrumentKind::Larmor);

    runner.run(CALIBRATION, beamline.clone()).await.unwrap();

    let calls = mock.calls();
    assert_eq!(
        titles(&calls),
        vec![
            "H2O 1mm_SANS",
            "H2O 1mm_TRANS",
            "D2O 2mm_SANS",
            "D2O 2mm_TRANS",
            "Empty cell_SANS",
            "Empty cell_TRANS",
            "Direct beam_TRANS",
        ]
    );
    assert!(calls.contains(&ControlCall::WaitFor(vec![Timing::Frames(3000)])));
    assert_eq!(mock.block("a1hgap"), Some(Value::from(20.0)));
    assert_eq!(mock.block("BSY"), Some(Value::from(88.5)));

    // The first SANS run reuses the event tables and the direct beam reuses
    // the transmission tables; every other run reloads
    let reloads = calls
        .iter()
        .filter(|c| matches!(c, ControlCall::ChangeStart))
        .count();
    assert_eq!(reloads, 6);

    let beamline = beamline.lock().await;
    assert_eq!(
        beamline.instrument().state().dae_mode(),
        Some(DaeMode::Transmission)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_zoom_script_fails_in_dry_run() {
    let mock = MockControl::new();
    let beamline = Beamline::build(
        InstrumentKind::Zoom,
        Arc::new(mock.clone()),
        &SansConfig::default(),
    )
    .shared();
    let runner = ScriptRunner::new(SansConfig::default(), InstrumentKind::Zoom);

    let err = runner.run(CALIBRATION, beamline).await.unwrap_err();
    assert!(err.to_string().contains("hasn't been written"));
    assert!(mock.calls().is_empty());
}
