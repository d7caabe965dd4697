use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::registry::ModelRegistry;
use super::run::{ActiveRun, RunMeta, RunStatus};
use super::{TrackingError, RESERVED_TAG_PREFIX};

/// Name of the experiment used when the caller does not pick one.
const DEFAULT_EXPERIMENT_NAME: &str = "Default";
const DEFAULT_EXPERIMENT_ID: &str = "0";

/// Directory name reserved for the model registry under the store root.
const MODELS_DIR: &str = "models";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ExperimentMeta {
    experiment_id: String,
    name: String,
    creation_time: i64,
}

/// The recorded data of a run, read back after it closed.
#[derive(Debug, Clone)]
pub struct RunData {
    pub run_id: String,
    pub experiment_id: String,
    pub status: RunStatus,
    pub params: BTreeMap<String, String>,
    pub metrics: BTreeMap<String, f64>,
    pub tags: BTreeMap<String, String>,
}

/// Local directory-backed tracking store.
pub struct TrackingStore {
    root: PathBuf,
}

impl TrackingStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, TrackingError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// The model registry sharing this store's root.
    pub fn registry(&self) -> ModelRegistry {
        ModelRegistry::new(self.root.join(MODELS_DIR))
    }

    /// Id of the default experiment, creating it on first use.
    pub fn default_experiment(&self) -> Result<String, TrackingError> {
        self.get_or_create_experiment(DEFAULT_EXPERIMENT_NAME)
    }

    /// Looks an experiment up by name, creating it when absent.
    pub fn get_or_create_experiment(&self, name: &str) -> Result<String, TrackingError> {
        let experiments = self.experiments()?;
        if let Some(meta) = experiments.iter().find(|meta| meta.name == name) {
            return Ok(meta.experiment_id.clone());
        }

        let experiment_id = if name == DEFAULT_EXPERIMENT_NAME {
            DEFAULT_EXPERIMENT_ID.to_string()
        } else {
            let next = experiments
                .iter()
                .filter_map(|meta| meta.experiment_id.parse::<u64>().ok())
                .max()
                .map_or(1, |max| max + 1);
            next.to_string()
        };

        let dir = self.root.join(&experiment_id);
        fs::create_dir_all(&dir)?;
        let meta = ExperimentMeta {
            experiment_id: experiment_id.clone(),
            name: name.to_string(),
            creation_time: Utc::now().timestamp_millis(),
        };
        fs::write(dir.join("meta.json"), serde_json::to_vec_pretty(&meta)?)?;

        Ok(experiment_id)
    }

    /// Opens a new run under the given experiment. The returned handle owns
    /// the session; see [`ActiveRun`] for the sealing guarantee.
    pub fn start_run(&self, experiment_id: &str) -> Result<ActiveRun, TrackingError> {
        let run_id = Uuid::new_v4().simple().to_string();
        let run_dir = self.root.join(experiment_id).join(&run_id);

        let run = ActiveRun::create(run_dir, run_id, experiment_id.to_string())?;

        // Bookkeeping tags under the reserved namespace; the run-summary
        // display filters these out.
        run.set_tag(
            &format!("{RESERVED_TAG_PREFIX}user"),
            &std::env::var("USER").unwrap_or_else(|_| "unknown".to_string()),
        )?;
        run.set_tag(
            &format!("{RESERVED_TAG_PREFIX}source.name"),
            env!("CARGO_PKG_NAME"),
        )?;

        Ok(run)
    }

    /// Reads a closed (or still running) run's recorded data back.
    pub fn get_run(&self, run_id: &str) -> Result<RunData, TrackingError> {
        let run_dir = self.find_run_dir(run_id)?;
        let meta: RunMeta = serde_json::from_slice(&fs::read(run_dir.join("meta.json"))?)?;

        let params = read_kv_dir(&run_dir.join("params"))?;
        let tags = read_kv_dir(&run_dir.join("tags"))?;

        let mut metrics = BTreeMap::new();
        for (name, series) in read_kv_dir(&run_dir.join("metrics"))? {
            // Latest observation wins: each line is "timestamp value step".
            if let Some(value) = series
                .lines()
                .last()
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|field| field.parse::<f64>().ok())
            {
                metrics.insert(name, value);
            }
        }

        Ok(RunData {
            run_id: meta.run_id,
            experiment_id: meta.experiment_id,
            status: meta.status,
            params,
            metrics,
            tags,
        })
    }

    /// Lists artifact paths under the given subdirectory of a run's
    /// artifact root, relative to that root.
    pub fn list_artifacts(&self, run_id: &str, prefix: &str) -> Result<Vec<String>, TrackingError> {
        let base = self.find_run_dir(run_id)?.join("artifacts");
        let mut found = Vec::new();
        collect_files(&base.join(prefix), &base, &mut found)?;
        found.sort();
        Ok(found)
    }

    fn find_run_dir(&self, run_id: &str) -> Result<PathBuf, TrackingError> {
        for meta in self.experiments()? {
            let candidate = self.root.join(&meta.experiment_id).join(run_id);
            if candidate.is_dir() {
                return Ok(candidate);
            }
        }
        Err(TrackingError::RunNotFound(run_id.to_string()))
    }

    fn experiments(&self) -> Result<Vec<ExperimentMeta>, TrackingError> {
        let mut experiments = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            let meta_path = path.join("meta.json");
            if !path.is_dir() || path.ends_with(MODELS_DIR) || !meta_path.is_file() {
                continue;
            }
            experiments.push(serde_json::from_slice(&fs::read(meta_path)?)?);
        }
        Ok(experiments)
    }
}

fn read_kv_dir(dir: &Path) -> Result<BTreeMap<String, String>, TrackingError> {
    let mut entries = BTreeMap::new();
    if !dir.is_dir() {
        return Ok(entries);
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            entries.insert(name.to_string(), fs::read_to_string(&path)?);
        }
    }
    Ok(entries)
}

fn collect_files(dir: &Path, base: &Path, out: &mut Vec<String>) -> Result<(), TrackingError> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(&path, base, out)?;
        } else if let Ok(rel) = path.strip_prefix(base) {
            out.push(rel.display().to_string());
        }
    }
    Ok(())
}
