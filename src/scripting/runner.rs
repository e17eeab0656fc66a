//! Dry run, estimate, then run for real.

use std::path::Path;
use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::subscriber::NoSubscriber;
use tracing::{info, warn, Span};

use super::host::ScriptHost;
use crate::config::SansConfig;
use crate::error::{AppResult, SansError};
use crate::estimate::{estimate, ScriptEstimate};
use crate::session::{mock_control, Beamline, InstrumentKind, SharedBeamline};

/// Runs user scripts against a beamline.
pub struct ScriptRunner {
    config: SansConfig,
    kind: InstrumentKind,
}

impl ScriptRunner {
    /// A runner for `kind`, configured by `config`.
    pub fn new(config: SansConfig, kind: InstrumentKind) -> Self {
        Self { config, kind }
    }

    /// Read a script file.
    pub fn load(path: impl AsRef<Path>) -> AppResult<String> {
        Ok(std::fs::read_to_string(path)?)
    }

    /// Run `script` against a fresh mock control system and estimate how long
    /// it would take. Nothing is logged while the mock runs.
    pub async fn estimate(&self, script: &str) -> AppResult<ScriptEstimate> {
        let mock = mock_control(&self.config.mock);
        let beamline = tracing::subscriber::with_default(NoSubscriber::default(), || {
            Beamline::build(self.kind, Arc::new(mock.clone()), &self.config).shared()
        });
        let host = ScriptHost::new(
            beamline,
            Handle::current(),
            self.config.script.max_operations,
        );

        let script = script.to_string();
        tokio::task::spawn_blocking(move || {
            tracing::subscriber::with_default(NoSubscriber::default(), || {
                host.run_script(&script)
            })
        })
        .await
        .map_err(|e| SansError::Script(format!("Task join error: {}", e)))??;

        estimate(&mock.calls())
    }

    /// Run `script` on `beamline`.
    ///
    /// When dry runs are enabled the script is first run against the mock;
    /// a failure there aborts before any real hardware is touched. Returns
    /// the estimate when one was made.
    pub async fn run(
        &self,
        script: &str,
        beamline: SharedBeamline,
    ) -> AppResult<Option<ScriptEstimate>> {
        let estimate = if self.config.script.dry_run {
            let estimate = self.estimate(script).await.map_err(|e| {
                warn!("Dry run failed, script not started: {}", e);
                e
            })?;
            info!("{}", estimate);
            Some(estimate)
        } else {
            None
        };

        let host = ScriptHost::new(
            beamline,
            Handle::current(),
            self.config.script.max_operations,
        );
        let script = script.to_string();
        let span = Span::current();
        tokio::task::spawn_blocking(move || span.in_scope(|| host.run_script(&script)))
            .await
            .map_err(|e| SansError::Script(format!("Task join error: {}", e)))??;

        Ok(estimate)
    }
}
