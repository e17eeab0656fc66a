//! `sans`: run and estimate beamline scripts.
//!
//! Scripts run against the mock control system; the console API of the
//! real beamline is provided by the facility.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use sans_scripting::config::{InstrumentSelection, LoggingConfig, SansConfig};
use sans_scripting::scripting::ScriptRunner;
use sans_scripting::session::{self, Beamline};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "SANS beamline scripting")]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "sans.toml")]
    config: PathBuf,

    /// Override the configured instrument
    #[arg(short, long, value_enum)]
    instrument: Option<InstrumentArg>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum InstrumentArg {
    Auto,
    Larmor,
    Zoom,
}

impl From<InstrumentArg> for InstrumentSelection {
    fn from(arg: InstrumentArg) -> Self {
        match arg {
            InstrumentArg::Auto => InstrumentSelection::Auto,
            InstrumentArg::Larmor => InstrumentSelection::Larmor,
            InstrumentArg::Zoom => InstrumentSelection::Zoom,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Dry-run a script, report the estimate, then run it
    Run {
        /// Rhai script file
        script: PathBuf,
        /// Skip the dry run
        #[arg(long)]
        no_dry_run: bool,
    },
    /// Report how long a script would take
    Estimate {
        /// Rhai script file
        script: PathBuf,
    },
    /// List the sample-changer positions
    Positions,
    /// Check a sample-changer position
    CheckPos {
        /// Position name, e.g. 1CB
        pos: String,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));
    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn read_script(path: &PathBuf) -> anyhow::Result<String> {
    ScriptRunner::load(path)
        .with_context(|| format!("Failed to read script {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = SansConfig::load_from(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    if let Some(instrument) = args.instrument {
        config.instrument = instrument.into();
    }
    init_tracing(&config.logging);

    let kind = session::select(config.instrument, &session::current_host());
    let control = Arc::new(session::mock_control(&config.mock));

    match args.command {
        Command::Run { script, no_dry_run } => {
            let source = read_script(&script)?;
            if no_dry_run {
                config.script.dry_run = false;
            }
            let beamline = Beamline::build(kind, control, &config).shared();
            let runner = ScriptRunner::new(config, kind);
            runner.run(&source, beamline).await?;
            info!("Script {} finished", script.display());
        }
        Command::Estimate { script } => {
            let source = read_script(&script)?;
            let runner = ScriptRunner::new(config, kind);
            let estimate = runner.estimate(&source).await?;
            println!("{}", estimate);
        }
        Command::Positions => {
            let beamline = Beamline::build(kind, control, &config);
            println!("{}", beamline.instrument().positions().join(" "));
        }
        Command::CheckPos { pos } => {
            let beamline = Beamline::build(kind, control, &config);
            if !beamline.instrument().check_move_pos(&pos) {
                bail!("Position {} does not exist on {}", pos, kind);
            }
            println!("{} is a valid position on {}", pos.to_uppercase(), kind);
        }
    }

    Ok(())
}
