use std::fs;
use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::run::ActiveRun;
use super::TrackingError;

/// A named, versioned entry in the model registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredModel {
    pub name: String,
    pub creation_time: i64,
    pub versions: Vec<ModelVersion>,
}

/// One version of a registered model, pointing at a run's model artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelVersion {
    pub version: usize,
    pub run_id: String,
    pub source: String,
    pub creation_time: i64,
}

/// Versioned model registry stored under `<store root>/models`.
pub struct ModelRegistry {
    root: PathBuf,
}

impl ModelRegistry {
    pub(crate) fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Creates a registered model. Fails with
    /// [`TrackingError::ResourceAlreadyExists`] when the name is taken.
    pub fn create_registered_model(&self, name: &str) -> Result<RegisteredModel, TrackingError> {
        if self.meta_path(name).exists() {
            return Err(TrackingError::ResourceAlreadyExists(name.to_string()));
        }

        let model = RegisteredModel {
            name: name.to_string(),
            creation_time: Utc::now().timestamp_millis(),
            versions: Vec::new(),
        };
        self.write(&model)?;
        Ok(model)
    }

    /// Cuts a new version of a registered model pointing at the given
    /// artifact source. Version numbers are monotonically increasing.
    pub fn create_model_version(
        &self,
        name: &str,
        source: &str,
        run_id: &str,
    ) -> Result<ModelVersion, TrackingError> {
        let mut model = self.get_registered_model(name)?;
        let version = ModelVersion {
            version: model.versions.len() + 1,
            run_id: run_id.to_string(),
            source: source.to_string(),
            creation_time: Utc::now().timestamp_millis(),
        };
        model.versions.push(version.clone());
        self.write(&model)?;
        Ok(version)
    }

    pub fn get_registered_model(&self, name: &str) -> Result<RegisteredModel, TrackingError> {
        let path = self.meta_path(name);
        if !path.is_file() {
            return Err(TrackingError::ModelNotFound(name.to_string()));
        }
        Ok(serde_json::from_slice(&fs::read(path)?)?)
    }

    /// Registers a run's model artifact under the given name. A name that
    /// already exists is reused; a new version is always created.
    pub fn register_model(
        &self,
        run: &ActiveRun,
        name: &str,
    ) -> Result<ModelVersion, TrackingError> {
        match self.create_registered_model(name) {
            Ok(_) | Err(TrackingError::ResourceAlreadyExists(_)) => {}
            Err(err) => return Err(err),
        }

        let source = format!("{}/model", run.artifact_uri());
        self.create_model_version(name, &source, run.run_id())
    }

    fn meta_path(&self, name: &str) -> PathBuf {
        self.root.join(name).join("meta.json")
    }

    fn write(&self, model: &RegisteredModel) -> Result<(), TrackingError> {
        let dir = self.root.join(&model.name);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join("meta.json"), serde_json::to_vec_pretty(model)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::TrackingStore;
    use super::*;

    fn setup() -> (tempfile::TempDir, TrackingStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = TrackingStore::new(dir.path().join("runs")).unwrap();
        (dir, store)
    }

    #[test]
    fn duplicate_name_is_an_explicit_error() {
        let (_guard, store) = setup();
        let registry = store.registry();

        registry.create_registered_model("classifier").unwrap();
        let err = registry.create_registered_model("classifier").unwrap_err();
        assert!(matches!(err, TrackingError::ResourceAlreadyExists(_)));
    }

    #[test]
    fn registering_twice_yields_two_resolvable_versions() {
        let (_guard, store) = setup();
        let registry = store.registry();
        let experiment = store.default_experiment().unwrap();

        let run = store.start_run(&experiment).unwrap();
        let first = registry.register_model(&run, "classifier").unwrap();
        let second = registry.register_model(&run, "classifier").unwrap();

        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);

        let model = registry.get_registered_model("classifier").unwrap();
        assert_eq!(model.versions.len(), 2);
        assert!(model.versions.iter().all(|v| v.run_id == run.run_id()));
        assert!(model.versions[0].source.ends_with("/model"));
    }

    #[test]
    fn version_for_unknown_model_is_an_error() {
        let (_guard, store) = setup();
        let registry = store.registry();

        let err = registry
            .create_model_version("ghost", "somewhere/model", "abc")
            .unwrap_err();
        assert!(matches!(err, TrackingError::ModelNotFound(_)));
    }
}
