//! Working-file layout
//!
//! Every artifact the engine produces lives at a stable, well-known path;
//! each new artifact of a kind overwrites the previous one. Files referenced
//! by requests are staged into the upload directory under a unique name so
//! that later edits to the caller's copy cannot affect a running job.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::config::PathsConfig;
use crate::error::{EngineError, Result};

pub const RECOVERED_FILE: &str = "recovered_output.wav";
pub const RECORDING_FILE: &str = "speech_recorded.wav";
pub const IMPULSE_RESPONSE_FILE: &str = "impulse_response.wav";
pub const SWEEP_FILE: &str = "sine_sweep.wav";
pub const ROOM_RESPONSE_FILE: &str = "room_recorded.wav";
pub const TIME_PLOT_FILE: &str = "plot_time.json";
pub const FREQ_PLOT_FILE: &str = "plot_freq.json";

/// Resolves artifact paths and manages staged uploads
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    paths: PathsConfig,
}

impl ArtifactStore {
    /// Create the store and make sure its directories exist
    pub fn open(paths: PathsConfig) -> Result<Self> {
        for dir in [&paths.output_dir, &paths.plot_dir, &paths.upload_dir] {
            fs::create_dir_all(dir)?;
        }
        Ok(Self { paths })
    }

    pub fn recovered(&self) -> PathBuf {
        self.paths.output_dir.join(RECOVERED_FILE)
    }

    pub fn recording(&self) -> PathBuf {
        self.paths.output_dir.join(RECORDING_FILE)
    }

    pub fn impulse_response(&self) -> PathBuf {
        self.paths.output_dir.join(IMPULSE_RESPONSE_FILE)
    }

    pub fn sweep(&self) -> PathBuf {
        self.paths.output_dir.join(SWEEP_FILE)
    }

    pub fn room_response(&self) -> PathBuf {
        self.paths.output_dir.join(ROOM_RESPONSE_FILE)
    }

    pub fn time_plot(&self) -> PathBuf {
        self.paths.plot_dir.join(TIME_PLOT_FILE)
    }

    pub fn freq_plot(&self) -> PathBuf {
        self.paths.plot_dir.join(FREQ_PLOT_FILE)
    }

    pub fn upload_dir(&self) -> &Path {
        &self.paths.upload_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.paths.output_dir
    }

    pub fn plot_dir(&self) -> &Path {
        &self.paths.plot_dir
    }

    fn staged_name(extension: Option<&str>) -> PathBuf {
        let mut name = Uuid::new_v4().to_string();
        if let Some(ext) = extension.filter(|e| !e.is_empty()) {
            name.push('.');
            name.push_str(ext);
        }
        PathBuf::from(name)
    }

    /// Copy a caller-supplied file into the upload directory
    ///
    /// The staged name keeps the original extension so container probing
    /// still gets a useful hint.
    ///
    /// A file that already sits in the upload directory is used in place.
    ///
    /// # Errors
    /// `FileNotFound` if `source` does not exist
    pub fn stage_upload(&self, source: &Path) -> Result<PathBuf> {
        if !source.is_file() {
            return Err(EngineError::FileNotFound {
                path: source.display().to_string(),
                source: None,
            });
        }
        if source.parent() == Some(self.paths.upload_dir.as_path()) {
            return Ok(source.to_path_buf());
        }

        let extension = source.extension().and_then(|e| e.to_str());
        let staged = self.paths.upload_dir.join(Self::staged_name(extension));

        fs::copy(source, &staged).map_err(|e| EngineError::FileNotFound {
            path: source.display().to_string(),
            source: Some(e),
        })?;
        debug!(from = %source.display(), to = %staged.display(), "staged upload");

        Ok(staged)
    }

    /// Write an uploaded body into the upload directory
    ///
    /// `file_name` is the client-side name; only its extension is kept.
    pub fn stage_bytes(&self, file_name: Option<&str>, bytes: &[u8]) -> Result<PathBuf> {
        let extension = file_name
            .map(Path::new)
            .and_then(|name| name.extension())
            .and_then(|e| e.to_str());
        let staged = self.paths.upload_dir.join(Self::staged_name(extension));

        fs::write(&staged, bytes)?;
        debug!(to = %staged.display(), bytes = bytes.len(), "staged uploaded body");

        Ok(staged)
    }

    /// Remove every staged upload, returning how many files were deleted
    pub fn clear_uploads(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in WalkDir::new(&self.paths.upload_dir)
            .min_depth(1)
            .contents_first(true)
        {
            let entry = entry.map_err(|e| EngineError::internal(e.to_string()))?;
            if entry.file_type().is_dir() {
                fs::remove_dir(entry.path())?;
            } else {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        info!(removed, dir = %self.paths.upload_dir.display(), "cleared staged uploads");
        Ok(removed)
    }
}
