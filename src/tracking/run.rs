use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::TrackingError;

/// Lifecycle state recorded in a run's `meta.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Running,
    Finished,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RunMeta {
    pub run_id: String,
    pub experiment_id: String,
    pub status: RunStatus,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub artifact_uri: String,
}

/// A tracking run in progress. All writes happen through this handle while
/// the session is open; dropping it seals the run. A handle dropped without
/// an explicit [`ActiveRun::end`] marks the run as failed, so an error that
/// unwinds out of the training block still leaves a closed run behind.
pub struct ActiveRun {
    run_dir: PathBuf,
    meta: RunMeta,
    ended: bool,
}

impl ActiveRun {
    pub(crate) fn create(
        run_dir: PathBuf,
        run_id: String,
        experiment_id: String,
    ) -> Result<Self, TrackingError> {
        for sub in ["params", "metrics", "tags", "artifacts"] {
            fs::create_dir_all(run_dir.join(sub))?;
        }

        let meta = RunMeta {
            run_id,
            experiment_id,
            status: RunStatus::Running,
            start_time: Utc::now().timestamp_millis(),
            end_time: None,
            artifact_uri: run_dir.join("artifacts").display().to_string(),
        };

        let run = Self {
            run_dir,
            meta,
            ended: false,
        };
        run.write_meta()?;

        Ok(run)
    }

    pub fn run_id(&self) -> &str {
        &self.meta.run_id
    }

    pub fn experiment_id(&self) -> &str {
        &self.meta.experiment_id
    }

    /// Location of this run's artifact root on disk.
    pub fn artifact_uri(&self) -> &str {
        &self.meta.artifact_uri
    }

    /// Records a key-value parameter. Parameters are write-once: re-logging
    /// the same value is accepted, a conflicting value is an error.
    pub fn log_param(&self, key: &str, value: &str) -> Result<(), TrackingError> {
        let path = self.run_dir.join("params").join(key);
        if path.exists() {
            let existing = fs::read_to_string(&path)?;
            if existing == value {
                return Ok(());
            }
            return Err(TrackingError::ParamAlreadyLogged {
                key: key.to_string(),
                existing,
            });
        }
        fs::write(path, value)?;
        Ok(())
    }

    /// Appends one observation to a named metric time series.
    pub fn log_metric(&self, name: &str, value: f64, step: usize) -> Result<(), TrackingError> {
        let path = self.run_dir.join("metrics").join(name);
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{} {} {}", Utc::now().timestamp_millis(), value, step)?;
        Ok(())
    }

    /// Sets a tag, overwriting any previous value.
    pub fn set_tag(&self, key: &str, value: &str) -> Result<(), TrackingError> {
        fs::write(self.run_dir.join("tags").join(key), value)?;
        Ok(())
    }

    /// Writes an artifact directly from memory.
    pub fn log_artifact_bytes(&self, name: &str, bytes: &[u8]) -> Result<(), TrackingError> {
        let mut file = File::create(self.run_dir.join("artifacts").join(name))?;
        file.write_all(bytes)?;
        Ok(())
    }

    /// Returns (and creates) a subdirectory of the artifact root, for
    /// collaborators that write files themselves, such as model recorders.
    pub fn artifact_dir(&self, sub: &str) -> Result<PathBuf, TrackingError> {
        let dir = self.run_dir.join("artifacts").join(sub);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Seals the run as finished.
    pub fn end(mut self) -> Result<(), TrackingError> {
        self.seal(RunStatus::Finished)?;
        self.ended = true;
        Ok(())
    }

    fn seal(&mut self, status: RunStatus) -> Result<(), TrackingError> {
        self.meta.status = status;
        self.meta.end_time = Some(Utc::now().timestamp_millis());
        self.write_meta()
    }

    fn write_meta(&self) -> Result<(), TrackingError> {
        let json = serde_json::to_vec_pretty(&self.meta)?;
        fs::write(self.run_dir.join("meta.json"), json)?;
        Ok(())
    }
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        if !self.ended {
            let _ = self.seal(RunStatus::Failed);
        }
    }
}
