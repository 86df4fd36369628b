//! CLI Module
//!
//! Command-line interface for the NoiseCleanse engine.

pub mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// NoiseCleanse - acoustic deconvolution and noise cleansing
#[derive(Parser, Debug)]
#[command(name = "noisecleanse")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// JSON configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Use virtual loopback devices instead of audio hardware
    #[arg(long, global = true)]
    pub loopback: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the control plane (HTTP by default)
    #[command(name = "serve")]
    Serve {
        /// HTTP address to listen on (defaults to the configured address)
        #[arg(short, long)]
        listen: Option<String>,

        /// Serve the JSON-lines protocol over TCP on this address instead
        #[arg(long, value_name = "ADDR", conflicts_with = "listen")]
        lines: Option<String>,

        /// Serve the JSON-lines protocol on stdin/stdout instead
        #[arg(long, conflicts_with_all = ["listen", "lines"])]
        stdio: bool,
    },

    /// List audio devices
    #[command(name = "devices")]
    Devices,

    /// Prepare an impulse response and print its summary
    #[command(name = "prepare-ir")]
    PrepareIr {
        /// Impulse response recording
        ir: PathBuf,
    },

    /// Recover a clean signal from a recording
    #[command(name = "deconvolve")]
    Deconvolve {
        /// Recorded signal
        signal: PathBuf,

        /// Impulse response the signal was recorded through
        #[arg(short, long)]
        ir: PathBuf,

        /// Output gain
        #[arg(short, long)]
        gain: Option<f32>,
    },

    /// Measure the impulse response of a playback/recording chain
    #[command(name = "capture-ir")]
    CaptureIr {
        #[command(subcommand)]
        mode: CaptureCommand,
    },

    /// Run live deconvolution until Enter is pressed
    #[command(name = "live")]
    Live {
        /// Impulse response (defaults to the last captured one)
        #[arg(long)]
        ir: Option<PathBuf>,

        /// Input device index
        #[arg(short, long)]
        input: Option<usize>,

        /// Output device index
        #[arg(short, long)]
        output: Option<usize>,

        /// Output volume
        #[arg(long, default_value_t = 1.0)]
        volume: f32,
    },

    /// Record the input device to a WAV file
    #[command(name = "record")]
    Record {
        /// Input device index
        #[arg(short, long)]
        input: Option<usize>,

        /// Recording length in seconds
        #[arg(short, long, default_value_t = 5.0)]
        seconds: f32,
    },
}

#[derive(Subcommand, Debug)]
pub enum CaptureCommand {
    /// Derive the IR from a probe file and its recorded response
    #[command(name = "offline")]
    Offline {
        /// Recorded room response (defaults to room_recorded.wav)
        #[arg(short, long)]
        response: Option<PathBuf>,

        /// Probe that was played (defaults to the generated sweep)
        #[arg(short, long)]
        probe: Option<PathBuf>,
    },

    /// Play the sweep and record it through the devices
    #[command(name = "live")]
    Live {
        /// Input device index
        #[arg(short, long)]
        input: Option<usize>,

        /// Output device index
        #[arg(short, long)]
        output: Option<usize>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_capture_live() {
        let cli = Cli::parse_from(["noisecleanse", "--loopback", "capture-ir", "live", "-i", "0", "-o", "1"]);
        assert!(cli.loopback);
        match cli.command {
            Commands::CaptureIr {
                mode: CaptureCommand::Live { input, output },
            } => {
                assert_eq!(input, Some(0));
                assert_eq!(output, Some(1));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_serve_flags_conflict() {
        let result = Cli::try_parse_from(["noisecleanse", "serve", "--stdio", "--listen", "0.0.0.0:1"]);
        assert!(result.is_err());

        let result = Cli::try_parse_from(["noisecleanse", "serve", "--lines", "0.0.0.0:2", "--listen", "0.0.0.0:1"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_serve_defaults_to_http() {
        let cli = Cli::parse_from(["noisecleanse", "serve"]);
        match cli.command {
            Commands::Serve { listen, lines, stdio } => {
                assert!(listen.is_none());
                assert!(lines.is_none());
                assert!(!stdio);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_record_default_length() {
        let cli = Cli::parse_from(["noisecleanse", "record"]);
        match cli.command {
            Commands::Record { seconds, input } => {
                assert_eq!(seconds, 5.0);
                assert!(input.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
