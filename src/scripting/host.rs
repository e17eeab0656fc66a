//! Rhai bindings for the beamline.
//!
//! Every registered function locks the shared beamline and drives the
//! instrument to completion with [`Handle::block_on`], so a script reads as a
//! plain sequence of instrument commands. [`ScriptHost::run_script`] must
//! therefore be called from a blocking thread, never from inside the async
//! runtime.
//!
//! ```text
//! measure("H2O", #{ pos: "LT", thickness: 2.0, uamps: 10 });
//! measure("H2O", "LT", #{ trans: true, frames: 3000 });
//! setup_dae("event_fastsave");
//! cset("CoarseZ", 38);
//! ```

use std::future::Future;
use std::time::Duration;

use rhai::{Array, Dynamic, Engine, EvalAltResult, Map, Scope};
use tokio::runtime::Handle;
use tracing::info;

use crate::control::Value;
use crate::dae::{DaeMode, DaeOptions, WavelengthRange};
use crate::error::{AppResult, SansError};
use crate::instrument::{LarmorMove, MeasureRequest, ScanningInstrument};
use crate::session::SharedBeamline;

type RhaiResult<T> = Result<T, Box<EvalAltResult>>;

/// A Rhai engine bound to one beamline.
pub struct ScriptHost {
    engine: Engine,
}

impl ScriptHost {
    /// Create a host whose scripts drive `beamline` on `runtime`.
    ///
    /// Scripts are stopped after `max_operations` Rhai operations.
    pub fn new(beamline: SharedBeamline, runtime: Handle, max_operations: u64) -> Self {
        let mut engine = Engine::new();

        engine.on_progress(move |count| {
            if count > max_operations {
                Some(format!("Safety limit exceeded: maximum {} operations", max_operations).into())
            } else {
                None
            }
        });
        engine.on_print(|text| info!("{}", text));

        let bindings = Bindings { beamline, runtime };
        register_common(&mut engine, &bindings);
        register_larmor(&mut engine, &bindings);
        register_zoom(&mut engine, &bindings);

        Self { engine }
    }

    /// Compile and run a script. Blocks until it finishes.
    pub fn run_script(&self, script: &str) -> AppResult<Dynamic> {
        let mut scope = Scope::new();
        self.engine
            .eval_with_scope::<Dynamic>(&mut scope, script)
            .map_err(convert_rhai_error)
    }

    /// Check that a script compiles.
    pub fn validate_script(&self, script: &str) -> AppResult<()> {
        self.engine
            .compile(script)
            .map(|_| ())
            .map_err(|e| SansError::Script(e.to_string()))
    }
}

#[derive(Clone)]
struct Bindings {
    beamline: SharedBeamline,
    runtime: Handle,
}

impl Bindings {
    fn block_on<T>(&self, fut: impl Future<Output = AppResult<T>>) -> RhaiResult<T> {
        self.runtime.block_on(fut).map_err(to_rhai)
    }
}

fn to_rhai(err: SansError) -> Box<EvalAltResult> {
    err.to_string().into()
}

fn convert_rhai_error(error: Box<EvalAltResult>) -> SansError {
    match *error {
        EvalAltResult::ErrorRuntime(message, pos) if pos.is_none() => {
            SansError::Script(message.to_string())
        }
        EvalAltResult::ErrorRuntime(message, pos) => {
            SansError::Script(format!("{} ({})", message, pos))
        }
        EvalAltResult::ErrorTerminated(token, _) => SansError::Script(token.to_string()),
        other => SansError::Script(other.to_string()),
    }
}

// =============================================================================
// Argument conversion
// =============================================================================

fn to_value(value: &Dynamic) -> AppResult<Value> {
    if let Ok(i) = value.as_int() {
        return Ok(Value::Number(i as f64));
    }
    if let Ok(f) = value.as_float() {
        return Ok(Value::Number(f));
    }
    if let Ok(b) = value.as_bool() {
        return Ok(Value::Number(if b { 1.0 } else { 0.0 }));
    }
    if value.is_string() {
        return Ok(Value::Text(value.to_string()));
    }
    Err(SansError::InvalidArgument(format!(
        "Cannot send a {} to the control system",
        value.type_name()
    )))
}

fn from_value(value: Value) -> Dynamic {
    match value {
        Value::Number(n) => Dynamic::from_float(n),
        Value::Text(s) => Dynamic::from(s),
    }
}

fn to_f64(key: &str, value: &Dynamic) -> AppResult<f64> {
    to_value(value)?
        .as_f64()
        .ok_or_else(|| SansError::InvalidArgument(format!("{} must be numeric", key)))
}

/// Build a measurement from a Rhai option map.
///
/// The map is handed to [`MeasureRequest::from_options`] in key order, after
/// the positional `pos` when one is given.
pub fn request_from_map(
    title: &str,
    pos: Option<&str>,
    options: &Map,
    instrument: &dyn ScanningInstrument,
) -> AppResult<MeasureRequest> {
    let mut pairs = Vec::with_capacity(options.len() + 1);
    if let Some(pos) = pos {
        pairs.push(("pos", Value::from(pos)));
    }
    for (key, value) in options {
        pairs.push((key.as_str(), to_value(value)?));
    }
    MeasureRequest::from_options(title, &pairs, instrument)
}

/// Build DAE options from a Rhai option map.
pub fn dae_options_from_map(options: &Map) -> AppResult<DaeOptions> {
    let mut dae = DaeOptions::default();
    for (key, value) in options {
        let key = key.as_str();
        match key {
            "step" => dae.step = to_f64(key, value)?,
            "range" | "lrange" => {
                dae.range = match to_value(value)? {
                    Value::Number(n) if n == 0.0 => WavelengthRange::Standard,
                    Value::Number(n) if n == 1.0 => WavelengthRange::Short,
                    Value::Text(t) if t.eq_ignore_ascii_case("standard") => {
                        WavelengthRange::Standard
                    }
                    Value::Text(t) if t.eq_ignore_ascii_case("short") => WavelengthRange::Short,
                    other => {
                        return Err(SansError::InvalidArgument(format!(
                            "Unknown wavelength range {}",
                            other
                        )))
                    }
                }
            }
            "tlowdet" => dae.tshift.low_detector = to_f64(key, value)?,
            "thighdet" => dae.tshift.high_detector = to_f64(key, value)?,
            "tlowmon" => dae.tshift.low_monitor = to_f64(key, value)?,
            "thighmon" => dae.tshift.high_monitor = to_f64(key, value)?,
            other => {
                return Err(SansError::InvalidArgument(format!(
                    "Unknown DAE option {}",
                    other
                )))
            }
        }
    }
    Ok(dae)
}

// =============================================================================
// Registration
// =============================================================================

fn register_common(engine: &mut Engine, bindings: &Bindings) {
    let b = bindings.clone();
    engine.register_fn("measure", move |title: &str| -> RhaiResult<()> {
        let request = MeasureRequest::new(title);
        b.block_on(async {
            let mut beamline = b.beamline.lock().await;
            beamline.instrument_mut().measure(request).await
        })
    });

    let b = bindings.clone();
    engine.register_fn("measure", move |title: &str, options: Map| -> RhaiResult<()> {
        b.block_on(async {
            let mut beamline = b.beamline.lock().await;
            let request = request_from_map(title, None, &options, beamline.instrument())?;
            beamline.instrument_mut().measure(request).await
        })
    });

    let b = bindings.clone();
    engine.register_fn(
        "measure",
        move |title: &str, pos: &str, options: Map| -> RhaiResult<()> {
            b.block_on(async {
                let mut beamline = b.beamline.lock().await;
                let request =
                    request_from_map(title, Some(pos), &options, beamline.instrument())?;
                beamline.instrument_mut().measure(request).await
            })
        },
    );

    let b = bindings.clone();
    engine.register_fn("configure_sans", move || -> RhaiResult<()> {
        b.block_on(async {
            let mut beamline = b.beamline.lock().await;
            beamline
                .instrument_mut()
                .configure_sans(Default::default(), Default::default())
                .await
        })
    });

    let b = bindings.clone();
    engine.register_fn("configure_sans", move |size: &str| -> RhaiResult<()> {
        b.block_on(async {
            let size = size.parse()?;
            let mut beamline = b.beamline.lock().await;
            beamline
                .instrument_mut()
                .configure_sans(size, Default::default())
                .await
        })
    });

    let b = bindings.clone();
    engine.register_fn(
        "configure_sans",
        move |size: &str, mode: &str| -> RhaiResult<()> {
            b.block_on(async {
                let size = size.parse()?;
                let mode = mode.parse()?;
                let mut beamline = b.beamline.lock().await;
                beamline.instrument_mut().configure_sans(size, mode).await
            })
        },
    );

    let b = bindings.clone();
    engine.register_fn("configure_trans", move || -> RhaiResult<()> {
        b.block_on(async {
            let mut beamline = b.beamline.lock().await;
            beamline
                .instrument_mut()
                .configure_trans(Default::default())
                .await
        })
    });

    let b = bindings.clone();
    engine.register_fn("configure_trans", move |size: &str| -> RhaiResult<()> {
        b.block_on(async {
            let size = size.parse()?;
            let mut beamline = b.beamline.lock().await;
            beamline.instrument_mut().configure_trans(size).await
        })
    });

    let b = bindings.clone();
    engine.register_fn("check_move_pos", move |pos: &str| -> RhaiResult<bool> {
        b.block_on(async {
            let beamline = b.beamline.lock().await;
            Ok(beamline.instrument().check_move_pos(pos))
        })
    });

    let b = bindings.clone();
    engine.register_fn("positions", move || -> RhaiResult<Array> {
        b.block_on(async {
            let beamline = b.beamline.lock().await;
            Ok(beamline
                .instrument()
                .positions()
                .iter()
                .map(|p| Dynamic::from(p.to_string()))
                .collect())
        })
    });

    let b = bindings.clone();
    engine.register_fn("setup_dae", move |mode: &str| -> RhaiResult<()> {
        b.block_on(async {
            let mode: DaeMode = mode.parse()?;
            let mut beamline = b.beamline.lock().await;
            beamline.instrument_mut().setup_dae(mode).await
        })
    });

    let b = bindings.clone();
    engine.register_fn("setup_dae", move |mode: &str, options: Map| -> RhaiResult<()> {
        b.block_on(async {
            let mode: DaeMode = mode.parse()?;
            let options = dae_options_from_map(&options)?;
            let mut beamline = b.beamline.lock().await;
            beamline.instrument_mut().setup_dae_with(mode, &options).await
        })
    });

    let b = bindings.clone();
    engine.register_fn("set_aperture", move |size: &str| -> RhaiResult<()> {
        b.block_on(async {
            let size = size.parse()?;
            let beamline = b.beamline.lock().await;
            beamline.instrument().set_aperture(size).await
        })
    });

    for (name, on) in [("detector_on", true), ("detector_off", false)] {
        let b = bindings.clone();
        engine.register_fn(name, move || -> RhaiResult<()> {
            b.block_on(async {
                let beamline = b.beamline.lock().await;
                let instrument = beamline.instrument();
                if on {
                    instrument.detector_turn_on(true).await
                } else {
                    instrument.detector_turn_off(true).await
                }
            })
        });

        let b = bindings.clone();
        engine.register_fn(name, move |delay: bool| -> RhaiResult<()> {
            b.block_on(async {
                let beamline = b.beamline.lock().await;
                let instrument = beamline.instrument();
                if on {
                    instrument.detector_turn_on(delay).await
                } else {
                    instrument.detector_turn_off(delay).await
                }
            })
        });
    }

    let b = bindings.clone();
    engine.register_fn("detector_is_on", move || -> RhaiResult<bool> {
        b.block_on(async {
            let beamline = b.beamline.lock().await;
            beamline.instrument().detector_is_on().await
        })
    });

    let b = bindings.clone();
    engine.register_fn("printsamplepars", move || -> RhaiResult<()> {
        b.block_on(async {
            let beamline = b.beamline.lock().await;
            beamline.instrument().print_sample_pars().await
        })
    });

    let b = bindings.clone();
    engine.register_fn("cset", move |block: &str, value: Dynamic| -> RhaiResult<()> {
        b.block_on(async {
            let value = to_value(&value)?;
            let beamline = b.beamline.lock().await;
            beamline.instrument().control().cset(block, value).await
        })
    });

    let b = bindings.clone();
    engine.register_fn("cget", move |block: &str| -> RhaiResult<Dynamic> {
        b.block_on(async {
            let beamline = b.beamline.lock().await;
            let value = beamline.instrument().control().cget(block).await?;
            Ok::<_, SansError>(from_value(value))
        })
    });

    let b = bindings.clone();
    engine.register_fn("waitfor_move", move || -> RhaiResult<()> {
        b.block_on(async {
            let beamline = b.beamline.lock().await;
            beamline.instrument().control().waitfor_move().await
        })
    });

    let b = bindings.clone();
    engine.register_fn("sleep", move |seconds: Dynamic| -> RhaiResult<()> {
        b.block_on(async {
            let seconds = to_f64("seconds", &seconds)?;
            let duration = Duration::try_from_secs_f64(seconds).map_err(|_| {
                SansError::InvalidArgument(format!("Cannot sleep for {} seconds", seconds))
            })?;
            let beamline = b.beamline.lock().await;
            beamline.instrument().control().sleep(duration).await
        })
    });
}

fn register_larmor(engine: &mut Engine, bindings: &Bindings) {
    for named in LarmorMove::ALL {
        let b = bindings.clone();
        engine.register_fn(named.name(), move || -> RhaiResult<()> {
            b.block_on(async {
                let beamline = b.beamline.lock().await;
                beamline.larmor(named.name())?.apply_move(named).await
            })
        });
    }

    let b = bindings.clone();
    engine.register_fn("BSInOut", move |in_out: &str| -> RhaiResult<()> {
        b.block_on(async {
            let out = match in_out.to_uppercase().as_str() {
                "IN" => false,
                "OUT" => true,
                other => {
                    return Err(SansError::InvalidArgument(format!(
                        "BSInOut takes IN or OUT, not {}",
                        other
                    )))
                }
            };
            let beamline = b.beamline.lock().await;
            beamline.larmor("BSInOut")?.beamstop(out).await
        })
    });

    for name in [
        "homecoarsejaws",
        "homea1",
        "homes1",
        "setup_pi_rotation",
        "home_pi_rotation",
    ] {
        let b = bindings.clone();
        engine.register_fn(name, move || -> RhaiResult<()> {
            b.block_on(async {
                let beamline = b.beamline.lock().await;
                let larmor = beamline.larmor(name)?;
                match name {
                    "homecoarsejaws" => larmor.home_coarse_jaws().await,
                    "homea1" => larmor.home_a1().await,
                    "homes1" => larmor.home_s1().await,
                    "setup_pi_rotation" => larmor.setup_pi_rotation().await,
                    _ => larmor.home_pi_rotation().await,
                }
            })
        });
    }

    let b = bindings.clone();
    engine.register_fn("movebench", move |angle: Dynamic| -> RhaiResult<()> {
        b.block_on(async {
            let angle = to_f64("angle", &angle)?;
            let beamline = b.beamline.lock().await;
            beamline.larmor("movebench")?.move_bench(angle, true).await?;
            Ok::<_, SansError>(())
        })
    });

    let b = bindings.clone();
    engine.register_fn(
        "movebench",
        move |angle: Dynamic, delay: bool| -> RhaiResult<()> {
            b.block_on(async {
                let angle = to_f64("angle", &angle)?;
                let beamline = b.beamline.lock().await;
                beamline.larmor("movebench")?.move_bench(angle, delay).await?;
                Ok::<_, SansError>(())
            })
        },
    );

    let b = bindings.clone();
    engine.register_fn("rotatebench", move |angle: Dynamic| -> RhaiResult<()> {
        b.block_on(async {
            let angle = to_f64("angle", &angle)?;
            let beamline = b.beamline.lock().await;
            beamline.larmor("rotatebench")?.rotate_bench(angle).await?;
            Ok::<_, SansError>(())
        })
    });
}

fn register_zoom(engine: &mut Engine, bindings: &Bindings) {
    for (name, field) in [
        ("set_measurement_type", "TYPE"),
        ("set_measurement_label", "LABEL"),
        ("set_measurement_id", "ID"),
    ] {
        let b = bindings.clone();
        engine.register_fn(name, move |value: Dynamic| -> RhaiResult<()> {
            b.block_on(async {
                let value = to_value(&value)?;
                let beamline = b.beamline.lock().await;
                let zoom = beamline.zoom(name)?;
                match field {
                    "TYPE" => zoom.set_measurement_type(value).await,
                    "LABEL" => zoom.set_measurement_label(value).await,
                    _ => zoom.set_measurement_id(value).await,
                }
            })
        });
    }
}
