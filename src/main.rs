//! vtdtr: run a scripted guest/host control session over an in-memory link.

use std::path::PathBuf;
use std::sync::mpsc::channel;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vtdtr::script::FireResult;
use vtdtr::{Loopback, ScriptRunner, SessionReport, SessionScript};

#[derive(Parser)]
#[command(name = "vtdtr")]
#[command(about = "Drive a virtio DTrace control session between a guest and a host")]
#[command(version)]
struct Cli {
    /// Verbosity (-v info, -vv debug, -vvv trace); RUST_LOG overrides
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbosity: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a session script and print both sides' final state as JSON
    Run {
        /// Path to the JSON session script
        script: PathBuf,

        /// Override the ring size of both endpoints
        #[arg(long)]
        ring_size: Option<usize>,

        /// Keep the session up after the script until Ctrl-C
        #[arg(long)]
        linger: bool,
    },
    /// Print an example session script
    Example,
}

#[derive(Serialize)]
struct RunReport {
    fired: Vec<FireResult>,
    #[serde(flatten)]
    session: SessionReport,
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_script(script: PathBuf, ring_size: Option<usize>, linger: bool) -> Result<()> {
    let mut script = SessionScript::load(&script)?;
    if let Some(ring_size) = ring_size {
        script.guest.ring_size = ring_size;
        script.host.ring_size = ring_size;
    }

    let session = Loopback::connect(&script.guest, &script.host)
        .context("failed to bring up loopback session")?;
    info!("Running {} steps", script.steps.len());

    let fired = {
        let mut runner = ScriptRunner::new(&session);
        runner.run(&script.steps)?;
        runner.into_fired()
    };

    if linger {
        let (tx, rx) = channel();
        let _ = ctrlc::set_handler(move || {
            let _ = tx.send(());
        });
        eprintln!("Session up, press Ctrl-C to stop");
        let _ = rx.recv();
    }

    let report = RunReport {
        fired,
        session: session.finish(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbosity);

    match cli.command {
        Commands::Run {
            script,
            ring_size,
            linger,
        } => run_script(script, ring_size, linger),
        Commands::Example => {
            println!(
                "{}",
                serde_json::to_string_pretty(&SessionScript::example())?
            );
            Ok(())
        }
    }
}
