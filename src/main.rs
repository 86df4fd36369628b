//! NoiseCleanse CLI
//!
//! Command-line entry point for the NoiseCleanse engine.

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use noisecleanse::cli::commands;
use noisecleanse::cli::{CaptureCommand, Cli, Commands};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("NOISECLEANSE_LOG").unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    info!("NoiseCleanse v{}", env!("CARGO_PKG_VERSION"));

    let session = commands::build_session(cli.config.as_deref(), cli.loopback)
        .context("failed to initialize engine")?;

    match cli.command {
        Commands::Serve { listen, lines, stdio } => commands::serve(session, listen, lines, stdio)?,
        Commands::Devices => commands::list_devices(&session)?,
        Commands::PrepareIr { ir } => commands::prepare_ir(&session, &ir)?,
        Commands::Deconvolve { signal, ir, gain } => commands::deconvolve(&session, &signal, &ir, gain)
            .with_context(|| format!("deconvolution of {} failed", signal.display()))?,
        Commands::CaptureIr { mode } => match mode {
            CaptureCommand::Offline { response, probe } => {
                commands::capture_offline(&session, probe.as_deref(), response.as_deref())?
            }
            CaptureCommand::Live { input, output } => commands::capture_live(&session, input, output)?,
        },
        Commands::Live {
            ir,
            input,
            output,
            volume,
        } => commands::live(&session, ir, input, output, volume)?,
        Commands::Record { input, seconds } => commands::record(&session, input, seconds)?,
    }

    Ok(())
}
