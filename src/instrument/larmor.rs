//! Larmor beamline.
//!
//! Wiring tables, chopper phasing, slits and the detector high voltage for
//! Larmor, plus the instrument scripts the beamline scientists use between
//! measurements: polariser and beamstop moves, jaw homing, detector bench
//! rotation and the PI rotation stage.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{ApertureSize, SansMode, ScanningInstrument, SAMPLE_CHANGER};
use crate::config::LarmorConfig;
use crate::control::{ControlApi, PositionRoutine, TimeChannelBoundary as Tcb, Value};
use crate::dae::{generic_scan, DaeMode, DaeOptions, InstrumentState, WavelengthRange, WiringTables};
use crate::error::AppResult;

/// CAEN high-voltage channels feeding the main detector.
pub const DETECTOR_CHANNELS: [u8; 4] = [8, 9, 10, 11];

/// Command sequence that brings the PI rotation stage under servo control.
const PI_SETUP_COMMANDS: [&str; 7] = [
    "*IDN?", "ERR?", "SVO 1 1", "RON 1 1", "VEL 1 180", "ACC 1 90", "DEC 1 90",
];

/// The standard primary time regime: 5 µs to 100 ms in 100 µs bins.
const STANDARD_TCB: Tcb = Tcb::new(5.0, 100000.0, 100.0, 1);

/// Named moves that can be used as measurement positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LarmorMove {
    /// Flipper-only polarisation setup.
    FomIn,
    /// Short polariser into the beam.
    ShortPolariserIn,
    /// Long polariser into the beam.
    LongPolariserIn,
    /// Beamstop in.
    BeamstopIn,
    /// Beamstop out.
    BeamstopOut,
}

impl LarmorMove {
    /// Every named move.
    pub const ALL: [LarmorMove; 5] = [
        LarmorMove::FomIn,
        LarmorMove::ShortPolariserIn,
        LarmorMove::LongPolariserIn,
        LarmorMove::BeamstopIn,
        LarmorMove::BeamstopOut,
    ];

    /// Name used in scripts and logs.
    pub fn name(&self) -> &'static str {
        match self {
            LarmorMove::FomIn => "FOMin",
            LarmorMove::ShortPolariserIn => "ShortPolariserin",
            LarmorMove::LongPolariserIn => "LongPolariserin",
            LarmorMove::BeamstopIn => "BSIn",
            LarmorMove::BeamstopOut => "BSOut",
        }
    }

    /// Look up a move by name, ignoring case.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|m| m.name().eq_ignore_ascii_case(name))
    }

    fn moves(&self) -> [(&'static str, f64); 2] {
        // Polariser arcs are in degrees
        match self {
            LarmorMove::FomIn => [("pol_trans", 0.0), ("pol_arc", -0.084)],
            LarmorMove::ShortPolariserIn => [("pol_trans", -100.0), ("pol_arc", -0.069)],
            LarmorMove::LongPolariserIn => [("pol_trans", 100.0), ("pol_arc", -0.069)],
            LarmorMove::BeamstopIn => [("BSY", 88.5), ("BSZ", 353.0)],
            LarmorMove::BeamstopOut => [("BSY", 200.0), ("BSZ", 0.0)],
        }
    }
}

#[async_trait]
impl PositionRoutine for LarmorMove {
    fn name(&self) -> &str {
        LarmorMove::name(self)
    }

    async fn apply(&self, control: &dyn ControlApi) -> AppResult<()> {
        let moves: Vec<(&str, Value)> = self
            .moves()
            .iter()
            .map(|(block, value)| (*block, Value::Number(*value)))
            .collect();
        control.cset_many(&moves).await
    }
}

/// What a bench rotation attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BenchOutcome {
    /// The bench was lifted, rotated and lowered.
    Rotated,
    /// The detector still had high voltage; nothing moved.
    DetectorStillOn,
    /// The bench did not report lifted; it was not rotated.
    LiftFailed,
    /// The angle is outside the bench's range; nothing moved.
    AngleOutOfRange,
}

/// The Larmor instrument.
pub struct Larmor {
    control: Arc<dyn ControlApi>,
    config: LarmorConfig,
    state: InstrumentState,
}

impl Larmor {
    /// Create a Larmor driving `control`.
    pub fn new(control: Arc<dyn ControlApi>, config: LarmorConfig) -> Self {
        Self {
            control,
            config,
            state: InstrumentState::default(),
        }
    }

    /// The instrument configuration.
    pub fn config(&self) -> &LarmorConfig {
        &self.config
    }

    fn pv(&self, suffix: &str) -> String {
        format!("{}{}", self.config.pv_prefix, suffix)
    }

    fn table(&self, file: &str) -> String {
        format!("{}\\{}", self.config.tables_dir.trim_end_matches('\\'), file)
    }

    fn default_tables(&self) -> WiringTables {
        WiringTables {
            detector: self.table("detector.dat"),
            spectra: self.table("spectra_1To1.dat"),
            wiring: self.table("wiring.dat"),
        }
    }

    fn monitor_tables(&self) -> WiringTables {
        WiringTables {
            detector: self.table("detector_monitors_only.dat"),
            spectra: self.table("spectra_monitors_only.dat"),
            wiring: self.table("wiring_monitors_only.dat"),
        }
    }

    fn with_spectra(&self, spectra: String) -> WiringTables {
        WiringTables {
            spectra,
            ..self.default_tables()
        }
    }

    fn with_wiring(&self, file: &str) -> WiringTables {
        WiringTables {
            wiring: self.table(file),
            ..self.default_tables()
        }
    }

    async fn set_choppers(&self, range: WavelengthRange) -> AppResult<()> {
        // T0 phase 0 (50ms) suppresses the fast flash at 5Hz
        match range {
            WavelengthRange::Standard => {
                self.control
                    .cset_many(&[
                        ("T0Phase", Value::Number(0.0)),
                        ("TargetDiskPhase", Value::Number(2750.0)),
                        ("InstrumentDiskPhase", Value::Number(2450.0)),
                    ])
                    .await
            }
            WavelengthRange::Short => {
                self.control
                    .cset_many(&[
                        ("TargetDiskPhase", Value::Number(1900.0)),
                        ("InstrumentDiskPhase", Value::Number(1600.0)),
                    ])
                    .await
            }
        }
    }

    fn detector_pv(&self, channel: u8, field: &str) -> String {
        self.pv(&format!("CAEN:hv0:0:{}:{}", channel, field))
    }

    async fn detector_status_total(&self) -> AppResult<f64> {
        let mut total = 0.0;
        for channel in DETECTOR_CHANNELS {
            let status = self.control.get_pv(&self.detector_pv(channel, "status")).await?;
            total += status.as_f64().unwrap_or(0.0);
        }
        Ok(total)
    }

    /// Switch the detector high voltage, waiting for the ramp when `delay`.
    pub async fn detector_power(&self, on: bool, delay: bool) -> AppResult<()> {
        let setting = if on { "On" } else { "Off" };
        for channel in DETECTOR_CHANNELS {
            self.control
                .set_pv(&self.detector_pv(channel, "pwonoff"), Value::from(setting))
                .await?;
        }
        if delay {
            if on {
                let secs = self.config.detector_power_up_secs;
                info!("Waiting For Detector To Power Up ({}s)", secs);
                self.control.sleep(Duration::from_secs(secs)).await?;
            } else {
                let secs = self.config.detector_power_down_secs;
                info!("Waiting For Detector To Power Down ({}s)", secs);
                self.control.sleep(Duration::from_secs(secs)).await?;
            }
        }
        Ok(())
    }

    async fn lift_and_rotate(&self, angle: f64, min_angle: f64) -> AppResult<BenchOutcome> {
        if self.detector_status_total().await? > 0.0 {
            warn!("The detector is not turned off");
            warn!("Not attempting Move");
            return Ok(BenchOutcome::DetectorStillOn);
        }
        info!("The detector is off");

        if angle < min_angle {
            warn!("Bench angle {} is below {}; move not attempted", angle, min_angle);
            return Ok(BenchOutcome::AngleOutOfRange);
        }

        let lift = Duration::from_secs(self.config.bench_lift_secs);
        self.control.cset("benchlift", Value::Number(1.0)).await?;
        info!("Lifting Bench ({}s)", lift.as_secs());
        self.control.sleep(lift).await?;

        let lifted = self.control.get_pv(&self.pv("BENCH:STATUS")).await?;
        if lifted.as_f64() != Some(1.0) {
            warn!("Bench failed to lift");
            warn!("Move not attempted");
            return Ok(BenchOutcome::LiftFailed);
        }

        info!("Rotating Bench");
        self.control.cset("bench_rot", Value::Number(angle)).await?;
        self.control.waitfor_move().await?;
        info!("Lowering Bench ({}s)", lift.as_secs());
        self.control.cset("benchlift", Value::Number(0.0)).await?;
        self.control.sleep(lift).await?;
        Ok(BenchOutcome::Rotated)
    }

    /// Rotate the detector bench, cycling the detector power around the move.
    ///
    /// If the detector does not report off after powering down the move is
    /// abandoned and the detector is left off.
    pub async fn move_bench(&self, angle: f64, delay_detector: bool) -> AppResult<BenchOutcome> {
        info!("Turning Detector Off");
        self.detector_power(false, delay_detector).await?;
        let outcome = self.lift_and_rotate(angle, 0.0).await?;
        if outcome == BenchOutcome::DetectorStillOn {
            return Ok(outcome);
        }
        info!("Turning Detector Back on");
        self.detector_power(true, delay_detector).await?;
        Ok(outcome)
    }

    /// Rotate the detector bench. The detector must already be off.
    pub async fn rotate_bench(&self, angle: f64) -> AppResult<BenchOutcome> {
        self.lift_and_rotate(angle, -0.5).await
    }

    /// Apply a named move.
    pub async fn apply_move(&self, named: LarmorMove) -> AppResult<()> {
        info!("Moving to position {}", named.name());
        named.apply(self.control.as_ref()).await
    }

    /// Move the beamstop in, or out when `out` is set.
    pub async fn beamstop(&self, out: bool) -> AppResult<()> {
        let named = if out {
            LarmorMove::BeamstopOut
        } else {
            LarmorMove::BeamstopIn
        };
        named.apply(self.control.as_ref()).await
    }

    async fn home_jaws(&self, label: &str, gap_block: &str, jaws: u8) -> AppResult<()> {
        info!("Homing {}", label);
        let hgap = format!("{}hgap", gap_block);
        let vgap = format!("{}vgap", gap_block);
        self.control
            .cset_many(&[
                (hgap.as_str(), Value::Number(40.0)),
                (vgap.as_str(), Value::Number(40.0)),
            ])
            .await?;
        self.control.waitfor_move().await?;

        for pair in [["JN", "JW"], ["JS", "JE"]] {
            for blade in pair {
                let pv = self.pv(&format!("MOT:JAWS{}:{}:MTR.HOMR", jaws, blade));
                self.control.set_pv(&pv, Value::from("1")).await?;
            }
            self.control.waitfor_move().await?;
            for blade in pair {
                let pv = self.pv(&format!("MOT:JAWS{}:{}:MTR.VAL", jaws, blade));
                self.control.set_pv(&pv, Value::from("20")).await?;
            }
        }
        self.control.waitfor_move().await
    }

    /// Home the coarse jaws.
    pub async fn home_coarse_jaws(&self) -> AppResult<()> {
        self.home_jaws("Coarse Jaws", "cj", 1).await
    }

    /// Home the a1 aperture.
    pub async fn home_a1(&self) -> AppResult<()> {
        self.home_jaws("a1", "a1", 2).await
    }

    /// Home the s1 slits.
    pub async fn home_s1(&self) -> AppResult<()> {
        self.home_jaws("s1", "s1", 3).await
    }

    /// Put the PI rotation stage under servo control.
    pub async fn setup_pi_rotation(&self) -> AppResult<()> {
        let pv = self.pv("SDTEST_01:P2:COMM");
        let interval = Duration::from_millis(self.config.pi_command_interval_ms);
        for (i, command) in PI_SETUP_COMMANDS.iter().enumerate() {
            if i > 0 {
                self.control.sleep(interval).await?;
            }
            self.control.set_pv(&pv, Value::from(*command)).await?;
        }
        Ok(())
    }

    /// Reference the PI rotation stage.
    pub async fn home_pi_rotation(&self) -> AppResult<()> {
        self.control
            .set_pv(&self.pv("SDTEST_01:P2:COMM"), Value::from("FRF 1"))
            .await
    }
}

#[async_trait]
impl ScanningInstrument for Larmor {
    fn name(&self) -> &'static str {
        "Larmor"
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

    async fn apply_dae(&self, mode: DaeMode, options: &DaeOptions) -> AppResult<()> {
        let control = self.control.as_ref();
        let end = Tcb::terminator();
        match mode {
            DaeMode::Scanning => {
                let tables = self.with_spectra(self.table("spectra_scanning_80.dat"));
                generic_scan(control, &tables, &[STANDARD_TCB]).await
            }
            DaeMode::Nr => {
                let tables = self.with_spectra(self.table("spectra_nrscanning.dat"));
                generic_scan(control, &tables, &[STANDARD_TCB]).await
            }
            DaeMode::NrScanning => {
                let spectra = format!(
                    "{}\\spectra_scanning_auto.dat",
                    self.config.masks_dir.trim_end_matches('\\')
                );
                generic_scan(control, &self.with_spectra(spectra), &[STANDARD_TCB]).await
            }
            DaeMode::Event => {
                let tcbs = [
                    Tcb::new(5.0, 100000.0, options.step, 1),
                    end,
                    Tcb::new(5.0, 100000.0, 2.0, 1).in_regime(2),
                ];
                generic_scan(control, &self.with_wiring("wiring_event.dat"), &tcbs).await?;
                self.set_choppers(options.range).await
            }
            DaeMode::EventFastsave => {
                // Log binning cuts the detector bins tenfold; monitors get
                // their own regime so they keep linear bins
                let tcbs = [
                    Tcb::new(5.0, 100000.0, 0.1, 1).logarithmic(),
                    end,
                    Tcb::new(5.0, 100000.0, 2.0, 1).in_regime(2),
                    Tcb::new(5.0, 100000.0, 100.0, 1).in_regime(3),
                    end.in_regime(3),
                ];
                generic_scan(control, &self.with_wiring("wiring_event_fastsave.dat"), &tcbs)
                    .await?;
                self.set_choppers(options.range).await
            }
            DaeMode::Histogram => {
                control.change_sync("isis").await?;
                generic_scan(control, &self.default_tables(), &[STANDARD_TCB, end]).await?;
                self.set_choppers(options.range).await
            }
            DaeMode::Transmission => {
                control.change_sync("isis").await?;
                generic_scan(control, &self.monitor_tables(), &[STANDARD_TCB, end]).await?;
                self.set_choppers(options.range).await
            }
            DaeMode::Polarised => {
                let tcbs = [STANDARD_TCB.default_binning(), end];
                generic_scan(control, &self.default_tables(), &tcbs).await
            }
            DaeMode::BsAlignment => {
                let tcbs = [Tcb::new(1000.0, 100000.0, 99000.0, 1), end];
                generic_scan(control, &self.default_tables(), &tcbs).await
            }
            DaeMode::MonitorsOnly => {
                let tables = self.with_spectra(self.table("spectra_phase1.dat"));
                let tcbs = [Tcb::new(5.0, 100000.0, 20.0, 1), end];
                generic_scan(control, &tables, &tcbs).await
            }
            DaeMode::Monotest => {
                generic_scan(control, &self.default_tables(), &[STANDARD_TCB, end]).await?;
                control.cset("T0Phase", Value::Number(0.0)).await?;
                control
                    .set_pv(&self.pv("MK3CHOPR_01:CH2:DIR:SP"), Value::from("CW"))
                    .await?;
                control.cset("TargetDiskPhase", Value::Number(8200.0)).await?;
                control
                    .set_pv(&self.pv("MK3CHOPR_01:CH3:DIR:SP"), Value::from("CCW"))
                    .await?;
                control
                    .cset("InstrumentDiskPhase", Value::Number(77650.0))
                    .await
            }
            DaeMode::Tshift => {
                // m1 counts as normal; the detectors are shifted to count
                // over the frame
                let window = options.tshift;
                let tcbs = [
                    Tcb::new(window.low_detector, window.high_detector, 100.0, 1),
                    end,
                    Tcb::new(window.low_monitor, window.high_monitor, 20.0, 1).in_regime(3),
                ];
                generic_scan(control, &self.with_wiring("wiring_tshift.dat"), &tcbs).await
            }
            DaeMode::Diffraction => {
                let tcbs = [Tcb::new(5.0, 100000.0, 0.01, 1).logarithmic(), end];
                generic_scan(control, &self.default_tables(), &tcbs).await
            }
            DaeMode::ResonantImaging => {
                let tcbs = [
                    Tcb::new(5.0, 1500.0, 0.256, 1),
                    Tcb::new(1500.0, 100000.0, 100.0, 2),
                ];
                generic_scan(control, &self.monitor_tables(), &tcbs).await
            }
            DaeMode::ResonantImagingChoppers => {
                info!("Setting Chopper phases");
                control
                    .cset_many(&[
                        ("T0Phase", Value::Number(49200.0)),
                        ("TargetDiskPhase", Value::Number(0.0)),
                        ("InstrumentDiskPhase", Value::Number(0.0)),
                    ])
                    .await
            }
            DaeMode::FourPeriods => {
                let tables = self.with_spectra(self.table("spectra_4To1.dat"));
                generic_scan(control, &tables, &[STANDARD_TCB, end]).await
            }
        }
    }

    async fn set_aperture(&self, size: ApertureSize) -> AppResult<()> {
        if size == ApertureSize::Medium {
            self.control
                .cset_many(&[
                    ("a1hgap", Value::Number(20.0)),
                    ("a1vgap", Value::Number(20.0)),
                    ("s1hgap", Value::Number(14.0)),
                    ("s1vgap", Value::Number(14.0)),
                ])
                .await?;
        }
        self.control.waitfor_move().await
    }

    async fn detector_is_on(&self) -> AppResult<bool> {
        for channel in DETECTOR_CHANNELS {
            let status = self.control.get_pv(&self.detector_pv(channel, "status")).await?;
            if status.as_f64().unwrap_or(0.0) <= 0.0 {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn detector_turn_on(&self, delay: bool) -> AppResult<()> {
        self.detector_power(true, delay).await
    }

    async fn detector_turn_off(&self, delay: bool) -> AppResult<()> {
        self.detector_power(false, delay).await
    }

    async fn configure_sans_custom(&self, _size: ApertureSize, _mode: SansMode) -> AppResult<()> {
        // Transmission monitor out of the beam
        self.control.cset("m4trans", Value::Number(200.0)).await?;
        self.control.waitfor_move().await
    }

    async fn configure_trans_custom(&self, _size: ApertureSize) -> AppResult<()> {
        // Transmission monitor into the beam
        self.control.cset("m4trans", Value::Number(0.0)).await?;
        self.control.waitfor_move().await
    }

    fn routine(&self, name: &str) -> Option<Arc<dyn PositionRoutine>> {
        LarmorMove::from_name(name).map(|m| Arc::new(m) as Arc<dyn PositionRoutine>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{ControlCall, MockControl, RunChange, RunState, Timing};
    use crate::dae::TshiftWindow;
    use crate::instrument::MeasureRequest;
    use tracing_test::traced_test;

    fn larmor() -> (Larmor, MockControl) {
        let mock = MockControl::new();
        let larmor = Larmor::new(Arc::new(mock.clone()), LarmorConfig::default());
        (larmor, mock)
    }

    fn csets(calls: &[ControlCall]) -> Vec<(String, Value)> {
        calls
            .iter()
            .filter_map(|c| match c {
                ControlCall::Cset { block, value } => Some((block.clone(), value.clone())),
                _ => None,
            })
            .collect()
    }

    fn tables(calls: &[ControlCall]) -> Vec<String> {
        calls
            .iter()
            .filter_map(|c| match c {
                ControlCall::ChangeTables { path, .. } => Some(path.clone()),
                _ => None,
            })
            .collect()
    }

    fn tcbs(calls: &[ControlCall]) -> Vec<Tcb> {
        calls
            .iter()
            .filter_map(|c| match c {
                ControlCall::ChangeTcb(tcb) => Some(*tcb),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_event_mode_tables_and_choppers() {
        let (mut larmor, mock) = larmor();
        larmor.setup_dae(DaeMode::Event).await.unwrap();

        let calls = mock.calls();
        assert_eq!(
            tables(&calls),
            vec![
                r"C:\Instrument\Settings\Tables\detector.dat".to_string(),
                r"C:\Instrument\Settings\Tables\spectra_1To1.dat".to_string(),
                r"C:\Instrument\Settings\Tables\wiring_event.dat".to_string(),
            ]
        );
        assert_eq!(
            tcbs(&calls),
            vec![
                Tcb::new(5.0, 100000.0, 100.0, 1),
                Tcb::terminator(),
                Tcb::new(5.0, 100000.0, 2.0, 1).in_regime(2),
            ]
        );
        assert_eq!(
            csets(&calls),
            vec![
                ("T0Phase".to_string(), Value::from(0.0)),
                ("TargetDiskPhase".to_string(), Value::from(2750.0)),
                ("InstrumentDiskPhase".to_string(), Value::from(2450.0)),
            ]
        );
    }

    #[tokio::test]
    async fn test_event_options_change_step_and_choppers() {
        let (mut larmor, mock) = larmor();
        let options = DaeOptions {
            step: 50.0,
            range: WavelengthRange::Short,
            ..DaeOptions::default()
        };
        larmor.setup_dae_with(DaeMode::Event, &options).await.unwrap();

        let calls = mock.calls();
        assert_eq!(tcbs(&calls)[0].step, 50.0);
        assert_eq!(
            csets(&calls),
            vec![
                ("TargetDiskPhase".to_string(), Value::from(1900.0)),
                ("InstrumentDiskPhase".to_string(), Value::from(1600.0)),
            ]
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn test_transmission_is_memoized() {
        let (mut larmor, mock) = larmor();
        larmor.setup_dae(DaeMode::Transmission).await.unwrap();
        let first = mock.calls().len();
        assert!(logs_contain("Setup Larmor for transmission"));
        assert_eq!(mock.calls()[0], ControlCall::ChangeSync("isis".into()));
        assert!(tables(&mock.calls())
            .iter()
            .all(|t| t.ends_with("monitors_only.dat")));

        larmor.setup_dae(DaeMode::Transmission).await.unwrap();
        assert_eq!(mock.calls().len(), first);
    }

    #[tokio::test]
    async fn test_nrscanning_uses_masks_directory() {
        let (larmor, mock) = larmor();
        larmor
            .apply_dae(DaeMode::NrScanning, &DaeOptions::default())
            .await
            .unwrap();
        assert_eq!(
            tables(&mock.calls())[1],
            r"U:\Users\Masks\spectra_scanning_auto.dat"
        );
    }

    #[tokio::test]
    async fn test_polarised_leaves_binning_flag_unset() {
        let (larmor, mock) = larmor();
        larmor
            .apply_dae(DaeMode::Polarised, &DaeOptions::default())
            .await
            .unwrap();
        assert_eq!(tcbs(&mock.calls())[0].log, None);
    }

    fn table_file(name: &str) -> String {
        format!(r"C:\Instrument\Settings\Tables\{}", name)
    }

    fn with_spectra_file(spectra: String) -> Vec<String> {
        vec![table_file("detector.dat"), spectra, table_file("wiring.dat")]
    }

    fn with_wiring_file(wiring: &str) -> Vec<String> {
        vec![
            table_file("detector.dat"),
            table_file("spectra_1To1.dat"),
            table_file(wiring),
        ]
    }

    #[tokio::test]
    async fn test_mode_tables_and_time_channels() {
        let end = Tcb::terminator();
        let standard = with_spectra_file(table_file("spectra_1To1.dat"));
        let monitors = vec![
            table_file("detector_monitors_only.dat"),
            table_file("spectra_monitors_only.dat"),
            table_file("wiring_monitors_only.dat"),
        ];
        let cases = vec![
            (
                DaeMode::Scanning,
                with_spectra_file(table_file("spectra_scanning_80.dat")),
                vec![STANDARD_TCB],
            ),
            (
                DaeMode::Nr,
                with_spectra_file(table_file("spectra_nrscanning.dat")),
                vec![STANDARD_TCB],
            ),
            (
                DaeMode::NrScanning,
                with_spectra_file(
                    r"U:\Users\Masks\spectra_scanning_auto.dat".to_string(),
                ),
                vec![STANDARD_TCB],
            ),
            (
                DaeMode::Event,
                with_wiring_file("wiring_event.dat"),
                vec![
                    Tcb::new(5.0, 100000.0, 100.0, 1),
                    end,
                    Tcb::new(5.0, 100000.0, 2.0, 1).in_regime(2),
                ],
            ),
            (
                DaeMode::EventFastsave,
                with_wiring_file("wiring_event_fastsave.dat"),
                vec![
                    Tcb::new(5.0, 100000.0, 0.1, 1).logarithmic(),
                    end,
                    Tcb::new(5.0, 100000.0, 2.0, 1).in_regime(2),
                    Tcb::new(5.0, 100000.0, 100.0, 1).in_regime(3),
                    end.in_regime(3),
                ],
            ),
            (DaeMode::Histogram, standard.clone(), vec![STANDARD_TCB, end]),
            (DaeMode::Transmission, monitors.clone(), vec![STANDARD_TCB, end]),
            (
                DaeMode::Polarised,
                standard.clone(),
                vec![STANDARD_TCB.default_binning(), end],
            ),
            (
                DaeMode::BsAlignment,
                standard.clone(),
                vec![Tcb::new(1000.0, 100000.0, 99000.0, 1), end],
            ),
            (
                DaeMode::MonitorsOnly,
                with_spectra_file(table_file("spectra_phase1.dat")),
                vec![Tcb::new(5.0, 100000.0, 20.0, 1), end],
            ),
            (DaeMode::Monotest, standard.clone(), vec![STANDARD_TCB, end]),
            (
                DaeMode::Tshift,
                with_wiring_file("wiring_tshift.dat"),
                vec![
                    Tcb::new(5.0, 100000.0, 100.0, 1),
                    end,
                    Tcb::new(5.0, 100000.0, 20.0, 1).in_regime(3),
                ],
            ),
            (
                DaeMode::Diffraction,
                standard.clone(),
                vec![Tcb::new(5.0, 100000.0, 0.01, 1).logarithmic(), end],
            ),
            (
                DaeMode::ResonantImaging,
                monitors,
                vec![
                    Tcb::new(5.0, 1500.0, 0.256, 1),
                    Tcb::new(1500.0, 100000.0, 100.0, 2),
                ],
            ),
            (DaeMode::ResonantImagingChoppers, vec![], vec![]),
            (
                DaeMode::FourPeriods,
                with_spectra_file(table_file("spectra_4To1.dat")),
                vec![STANDARD_TCB, end],
            ),
        ];
        assert_eq!(cases.len(), DaeMode::ALL.len());

        let standard_choppers = vec![
            ("T0Phase".to_string(), Value::from(0.0)),
            ("TargetDiskPhase".to_string(), Value::from(2750.0)),
            ("InstrumentDiskPhase".to_string(), Value::from(2450.0)),
        ];
        for (mode, expected_tables, expected_tcbs) in cases {
            let (larmor, mock) = larmor();
            larmor
                .apply_dae(mode, &DaeOptions::default())
                .await
                .unwrap();
            let calls = mock.calls();

            assert_eq!(tables(&calls), expected_tables, "{} tables", mode);
            assert_eq!(tcbs(&calls), expected_tcbs, "{} time channels", mode);
            match mode {
                DaeMode::Event
                | DaeMode::EventFastsave
                | DaeMode::Histogram
                | DaeMode::Transmission => {
                    assert_eq!(csets(&calls), standard_choppers, "{} choppers", mode)
                }
                DaeMode::Monotest | DaeMode::ResonantImagingChoppers => {}
                _ => assert!(csets(&calls).is_empty(), "{} moved blocks", mode),
            }
        }
    }

    #[tokio::test]
    async fn test_isis_sync_selected_before_tables() {
        for mode in DaeMode::ALL {
            let (larmor, mock) = larmor();
            larmor
                .apply_dae(mode, &DaeOptions::default())
                .await
                .unwrap();
            let calls = mock.calls();

            let synced = calls
                .iter()
                .any(|c| matches!(c, ControlCall::ChangeSync(_)));
            if matches!(mode, DaeMode::Histogram | DaeMode::Transmission) {
                assert_eq!(
                    calls[0],
                    ControlCall::ChangeSync("isis".into()),
                    "{}",
                    mode
                );
                assert_eq!(
                    calls[1],
                    ControlCall::Change(RunChange::Periods(1)),
                    "{}",
                    mode
                );
            } else {
                assert!(!synced, "{} changed sync", mode);
            }
        }
    }

    #[tokio::test]
    async fn test_monotest_reverses_choppers() {
        let (larmor, mock) = larmor();
        larmor
            .apply_dae(DaeMode::Monotest, &DaeOptions::default())
            .await
            .unwrap();

        let calls = mock.calls();
        let finish = calls
            .iter()
            .position(|c| *c == ControlCall::ChangeFinish)
            .unwrap();
        let expected = vec![
            ControlCall::Cset {
                block: "T0Phase".into(),
                value: Value::from(0.0),
            },
            ControlCall::SetPv {
                name: "IN:LARMOR:MK3CHOPR_01:CH2:DIR:SP".into(),
                value: Value::from("CW"),
            },
            ControlCall::Cset {
                block: "TargetDiskPhase".into(),
                value: Value::from(8200.0),
            },
            ControlCall::SetPv {
                name: "IN:LARMOR:MK3CHOPR_01:CH3:DIR:SP".into(),
                value: Value::from("CCW"),
            },
            ControlCall::Cset {
                block: "InstrumentDiskPhase".into(),
                value: Value::from(77650.0),
            },
        ];
        assert_eq!(calls[finish + 1..], expected[..]);
    }

    #[tokio::test]
    async fn test_tshift_window_sets_time_channels() {
        let (larmor, mock) = larmor();
        let options = DaeOptions {
            tshift: TshiftWindow {
                low_detector: 1000.0,
                high_detector: 60000.0,
                low_monitor: 20.0,
                high_monitor: 40000.0,
            },
            ..DaeOptions::default()
        };
        larmor.apply_dae(DaeMode::Tshift, &options).await.unwrap();

        assert_eq!(
            tcbs(&mock.calls()),
            vec![
                Tcb::new(1000.0, 60000.0, 100.0, 1),
                Tcb::terminator(),
                Tcb::new(20.0, 40000.0, 20.0, 1).in_regime(3),
            ]
        );
    }

    #[tokio::test]
    async fn test_resonant_imaging_choppers_only_moves_choppers() {
        let (mut larmor, mock) = larmor();
        larmor
            .setup_dae(DaeMode::ResonantImagingChoppers)
            .await
            .unwrap();
        let calls = mock.calls();
        assert!(tables(&calls).is_empty());
        assert_eq!(csets(&calls)[0], ("T0Phase".to_string(), Value::from(49200.0)));
        assert_eq!(
            larmor.state().dae_mode(),
            Some(DaeMode::ResonantImagingChoppers)
        );
    }

    #[tokio::test]
    async fn test_medium_aperture_sets_slits() {
        let (larmor, mock) = larmor();
        larmor.set_aperture(ApertureSize::Medium).await.unwrap();
        assert_eq!(
            csets(&mock.calls()),
            vec![
                ("a1hgap".to_string(), Value::from(20.0)),
                ("a1vgap".to_string(), Value::from(20.0)),
                ("s1hgap".to_string(), Value::from(14.0)),
                ("s1vgap".to_string(), Value::from(14.0)),
            ]
        );

        mock.reset();
        larmor.set_aperture(ApertureSize::Unchanged).await.unwrap();
        assert_eq!(mock.calls(), vec![ControlCall::WaitForMove]);
    }

    #[tokio::test]
    async fn test_detector_power_cycle() {
        let (larmor, mock) = larmor();
        assert!(larmor.detector_is_on().await.unwrap());

        larmor.detector_turn_off(true).await.unwrap();
        assert!(!larmor.detector_is_on().await.unwrap());
        assert!(mock
            .calls()
            .contains(&ControlCall::Sleep(Duration::from_secs(60))));
        assert_eq!(
            mock.pv("IN:LARMOR:CAEN:hv0:0:11:pwonoff"),
            Some(Value::from("Off"))
        );

        mock.reset();
        larmor.detector_turn_on(false).await.unwrap();
        assert!(larmor.detector_is_on().await.unwrap());
        assert!(!mock
            .calls()
            .iter()
            .any(|c| matches!(c, ControlCall::Sleep(_))));
    }

    #[tokio::test]
    async fn test_measure_sans_moves_monitor_out() {
        let (mut larmor, mock) = larmor();
        larmor
            .measure(MeasureRequest::new("H2O").uamps(10.0))
            .await
            .unwrap();

        let calls = mock.calls();
        assert!(csets(&calls).contains(&("m4trans".to_string(), Value::from(200.0))));
        assert!(calls.contains(&ControlCall::Change(RunChange::Title("H2O_SANS".into()))));
        assert!(calls.contains(&ControlCall::WaitFor(vec![Timing::Uamps(10.0)])));
        assert_eq!(larmor.state().dae_mode(), Some(DaeMode::Event));
        assert_eq!(mock.run_state(), RunState::Setup);
    }

    #[tokio::test]
    async fn test_measure_trans_moves_monitor_in() {
        let (mut larmor, mock) = larmor();
        larmor
            .measure(
                MeasureRequest::new("D2O")
                    .position("LT")
                    .thickness(2.0)
                    .trans(true)
                    .block("CoarseZ", 38.0)
                    .frames(300),
            )
            .await
            .unwrap();

        let calls = mock.calls();
        assert!(csets(&calls).contains(&("m4trans".to_string(), Value::from(0.0))));
        assert!(calls.contains(&ControlCall::Change(RunChange::Title("D2O_TRANS".into()))));
        assert_eq!(mock.block("SamplePos"), Some(Value::from("LT")));
        assert_eq!(mock.block("CoarseZ"), Some(Value::from(38.0)));
        assert_eq!(larmor.state().dae_mode(), Some(DaeMode::Transmission));
    }

    #[tokio::test]
    async fn test_second_measure_skips_table_reload() {
        let (mut larmor, mock) = larmor();
        larmor.measure(MeasureRequest::new("A").uamps(1.0)).await.unwrap();
        mock.reset();
        larmor.measure(MeasureRequest::new("B").uamps(1.0)).await.unwrap();
        assert!(!mock.calls().contains(&ControlCall::ChangeStart));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_measure_with_routine_position() {
        let (mut larmor, mock) = larmor();
        let routine = larmor.routine("fomin").unwrap();
        larmor
            .measure(MeasureRequest::new("Pol").routine(routine).seconds(60.0))
            .await
            .unwrap();

        assert!(logs_contain("Moving to position FOMin"));
        assert_eq!(mock.block("pol_arc"), Some(Value::from(-0.084)));
    }

    #[tokio::test]
    async fn test_beamstop_moves() {
        let (larmor, mock) = larmor();
        larmor.beamstop(true).await.unwrap();
        assert_eq!(mock.block("BSY"), Some(Value::from(200.0)));
        larmor.beamstop(false).await.unwrap();
        assert_eq!(mock.block("BSY"), Some(Value::from(88.5)));
        assert_eq!(mock.block("BSZ"), Some(Value::from(353.0)));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_move_bench_aborts_while_detector_powered() {
        let (larmor, mock) = larmor();
        let outcome = larmor.rotate_bench(10.0).await.unwrap();

        assert_eq!(outcome, BenchOutcome::DetectorStillOn);
        assert!(logs_contain("The detector is not turned off"));
        assert_eq!(mock.block("bench_rot"), Some(Value::from(0.0)));
    }

    #[tokio::test]
    async fn test_move_bench_rotates_and_restores_detector() {
        let mock = MockControl::new().with_pv("IN:LARMOR:BENCH:STATUS", 1.0);
        let larmor = Larmor::new(Arc::new(mock.clone()), LarmorConfig::default());

        let outcome = larmor.move_bench(12.5, true).await.unwrap();
        assert_eq!(outcome, BenchOutcome::Rotated);
        assert_eq!(mock.block("bench_rot"), Some(Value::from(12.5)));
        assert_eq!(mock.block("benchlift"), Some(Value::from(0.0)));
        assert!(mock.detector_powered());

        let sleeps: Vec<Duration> = mock
            .calls()
            .iter()
            .filter_map(|c| match c {
                ControlCall::Sleep(d) => Some(*d),
                _ => None,
            })
            .collect();
        assert_eq!(
            sleeps,
            vec![
                Duration::from_secs(60),
                Duration::from_secs(20),
                Duration::from_secs(20),
                Duration::from_secs(180),
            ]
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn test_rotate_bench_reports_failed_lift() {
        let (larmor, mock) = larmor();
        larmor.detector_turn_off(false).await.unwrap();

        let outcome = larmor.rotate_bench(5.0).await.unwrap();
        assert_eq!(outcome, BenchOutcome::LiftFailed);
        assert!(logs_contain("Bench failed to lift"));
        assert_eq!(mock.block("bench_rot"), Some(Value::from(0.0)));
    }

    #[tokio::test]
    async fn test_bench_angle_limits() {
        let (larmor, _mock) = larmor();
        larmor.detector_turn_off(false).await.unwrap();
        assert_eq!(
            larmor.rotate_bench(-1.0).await.unwrap(),
            BenchOutcome::AngleOutOfRange
        );
    }

    #[tokio::test]
    async fn test_home_a1_sequence() {
        let (larmor, mock) = larmor();
        larmor.home_a1().await.unwrap();

        let pvs: Vec<String> = mock
            .calls()
            .iter()
            .filter_map(|c| match c {
                ControlCall::SetPv { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(
            pvs,
            vec![
                "IN:LARMOR:MOT:JAWS2:JN:MTR.HOMR",
                "IN:LARMOR:MOT:JAWS2:JW:MTR.HOMR",
                "IN:LARMOR:MOT:JAWS2:JN:MTR.VAL",
                "IN:LARMOR:MOT:JAWS2:JW:MTR.VAL",
                "IN:LARMOR:MOT:JAWS2:JS:MTR.HOMR",
                "IN:LARMOR:MOT:JAWS2:JE:MTR.HOMR",
                "IN:LARMOR:MOT:JAWS2:JS:MTR.VAL",
                "IN:LARMOR:MOT:JAWS2:JE:MTR.VAL",
            ]
        );
        assert_eq!(mock.block("a1hgap"), Some(Value::from(40.0)));
    }

    #[tokio::test]
    async fn test_pi_rotation_setup() {
        let (larmor, mock) = larmor();
        larmor.setup_pi_rotation().await.unwrap();

        let calls = mock.calls();
        let sleeps = calls
            .iter()
            .filter(|c| matches!(c, ControlCall::Sleep(_)))
            .count();
        assert_eq!(sleeps, PI_SETUP_COMMANDS.len() - 1);
        assert_eq!(
            mock.pv("IN:LARMOR:SDTEST_01:P2:COMM"),
            Some(Value::from("DEC 1 90"))
        );

        larmor.home_pi_rotation().await.unwrap();
        assert_eq!(
            mock.pv("IN:LARMOR:SDTEST_01:P2:COMM"),
            Some(Value::from("FRF 1"))
        );
    }
}
