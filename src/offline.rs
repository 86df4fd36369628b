//! Offline Deconvolution Pipeline
//!
//! Recovers a clean signal from a recording and the impulse response it was
//! recorded through, then writes the recovered WAV and two plot series.
//! Runs on the caller's thread; the session layer makes sure only one job
//! runs at a time.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::DeconvolutionConfig;
use crate::dsp::analysis::{magnitude_spectrum, waveform, PlotSeries};
use crate::dsp::postprocess::PostProcessor;
use crate::engine::artifacts::ArtifactStore;
use crate::engine::buffer::AudioBuffer;
use crate::engine::io::{export_audio, ExportFormat};
use crate::error::{EngineError, Result};
use crate::ir::ImpulseResponse;

/// Lifecycle of an offline job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Where a job's plot series were written
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlotArtifacts {
    pub time_plot: PathBuf,
    pub freq_plot: PathBuf,
}

/// One offline deconvolution request and its outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeconvolutionJob {
    pub id: Uuid,
    pub signal: PathBuf,
    pub ir_fingerprint: String,
    pub output_file: PathBuf,
    pub gain: f32,
    pub status: JobStatus,
    pub plots: Option<PlotArtifacts>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl DeconvolutionJob {
    pub fn new(signal: PathBuf, ir_fingerprint: String, output_file: PathBuf, gain: f32) -> Self {
        Self {
            id: Uuid::new_v4(),
            signal,
            ir_fingerprint,
            output_file,
            gain,
            status: JobStatus::Pending,
            plots: None,
            created_at: Utc::now(),
            finished_at: None,
            error: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == JobStatus::Completed
    }

    fn complete(&mut self, plots: PlotArtifacts) {
        self.status = JobStatus::Completed;
        self.plots = Some(plots);
        self.finished_at = Some(Utc::now());
    }

    fn fail(&mut self, error: &EngineError) {
        self.status = JobStatus::Failed;
        self.error = Some(error.to_string());
        self.finished_at = Some(Utc::now());
    }
}

/// Recovered signal plus its diagnostic plots
#[derive(Debug, Clone)]
pub struct Recovered {
    pub buffer: AudioBuffer,
    pub time: PlotSeries,
    pub freq: PlotSeries,
}

/// Apply the inverse of `ir` to every channel of `signal`
///
/// `gain` is applied after filtering; the result is scaled down only if its
/// peak then exceeds full scale.
///
/// # Errors
/// * `LengthMismatch` - signal and IR are at different sample rates
/// * `EmptyOrInvalidAudio` - the signal has no samples
/// * `DegenerateIr` - the IR cannot be inverted
pub fn recover(
    signal: &AudioBuffer,
    ir: &ImpulseResponse,
    gain: f32,
    max_plot_points: usize,
) -> Result<Recovered> {
    let settings = DeconvolutionConfig {
        max_plot_points,
        ..DeconvolutionConfig::default()
    };
    recover_with(signal, ir, gain, &settings)
}

/// [`recover`] with the plot size and post-processing taken from `settings`
pub fn recover_with(
    signal: &AudioBuffer,
    ir: &ImpulseResponse,
    gain: f32,
    settings: &DeconvolutionConfig,
) -> Result<Recovered> {
    if signal.sample_rate != ir.sample_rate() {
        return Err(EngineError::LengthMismatch {
            signal_rate: signal.sample_rate,
            ir_rate: ir.sample_rate(),
        });
    }
    if signal.is_empty() {
        return Err(EngineError::invalid_audio("signal has no samples"));
    }
    if !gain.is_finite() || gain < 0.0 {
        return Err(EngineError::invalid_input(format!("invalid gain {}", gain)));
    }

    let filter = ir.inverse_filter()?;
    debug!(
        channels = signal.channels(),
        samples = signal.len(),
        design_len = ir.design_len(),
        "applying inverse filter"
    );

    let mut buffer = AudioBuffer {
        samples: signal
            .samples
            .iter()
            .map(|channel| filter.apply(channel))
            .collect(),
        sample_rate: signal.sample_rate,
    };

    if gain != 1.0 {
        buffer.scale(gain);
    }
    if let Some(post) = PostProcessor::from_config(&settings.postprocess, buffer.sample_rate) {
        debug!("post-processing recovered signal");
        post.apply(&mut buffer);
    }
    let peak = buffer.peak();
    if peak > 1.0 {
        warn!(peak, "recovered signal exceeds full scale, normalizing");
        buffer.normalize_peak(1.0);
    }

    let mono = buffer.to_mono();
    let time = waveform(mono.channel(0), mono.sample_rate, settings.max_plot_points);
    let freq = magnitude_spectrum(mono.channel(0), mono.sample_rate, settings.max_plot_points);

    Ok(Recovered { buffer, time, freq })
}

/// Run `job` to completion, writing its artifacts through `store`
///
/// On error the job is marked `Failed` and the error is returned.
pub fn run_job(
    job: &mut DeconvolutionJob,
    signal: &AudioBuffer,
    ir: &ImpulseResponse,
    store: &ArtifactStore,
    format: ExportFormat,
    settings: &DeconvolutionConfig,
) -> Result<Recovered> {
    job.status = JobStatus::Running;
    info!(job = %job.id, signal = %job.signal.display(), "deconvolution started");

    let result = recover_with(signal, ir, job.gain, settings).and_then(|recovered| {
        export_audio(&recovered.buffer, &job.output_file, format)?;
        let plots = PlotArtifacts {
            time_plot: store.time_plot(),
            freq_plot: store.freq_plot(),
        };
        write_plot(&recovered.time, &plots.time_plot)?;
        write_plot(&recovered.freq, &plots.freq_plot)?;
        Ok((recovered, plots))
    });

    match result {
        Ok((recovered, plots)) => {
            job.complete(plots);
            info!(job = %job.id, output = %job.output_file.display(), "deconvolution completed");
            Ok(recovered)
        }
        Err(e) => {
            warn!(job = %job.id, error = %e, "deconvolution failed");
            job.fail(&e);
            Err(e)
        }
    }
}

/// Write a plot series as JSON
pub fn write_plot(series: &PlotSeries, path: &Path) -> Result<()> {
    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer(writer, series)?;
    Ok(())
}

/// Read a plot series written by [`write_plot`]
pub fn read_plot(path: &Path) -> Result<PlotSeries> {
    let file = File::open(path).map_err(|e| EngineError::FileNotFound {
        path: path.display().to_string(),
        source: Some(e),
    })?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}
