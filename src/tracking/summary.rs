use std::collections::BTreeMap;

use super::store::{RunData, TrackingStore};
use super::TrackingError;

/// Tags under this prefix are store bookkeeping, not user data.
pub const RESERVED_TAG_PREFIX: &str = "tracking.";

/// The run's tags without the reserved bookkeeping namespace.
pub fn filtered_tags(run: &RunData) -> BTreeMap<String, String> {
    run.tags
        .iter()
        .filter(|(key, _)| !key.starts_with(RESERVED_TAG_PREFIX))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Prints a closed run's recorded data: id, model artifacts, parameters,
/// metrics, and non-reserved tags. Read-only.
pub fn print_run_info(store: &TrackingStore, run: &RunData) -> Result<(), TrackingError> {
    let artifacts = store.list_artifacts(&run.run_id, "model")?;

    println!("run_id: {}", run.run_id);
    println!("artifacts: {artifacts:?}");
    println!("params: {:?}", run.params);
    println!("metrics: {:?}", run.metrics);
    println!("tags: {:?}", filtered_tags(run));

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::run::RunStatus;
    use super::*;

    #[test]
    fn reserved_tags_are_filtered_out() {
        let mut tags = BTreeMap::new();
        tags.insert("tracking.user".to_string(), "ci".to_string());
        tags.insert("tracking.source.name".to_string(), "app".to_string());
        tags.insert("custom_log".to_string(), "true".to_string());

        let run = RunData {
            run_id: "abc".to_string(),
            experiment_id: "0".to_string(),
            status: RunStatus::Finished,
            params: BTreeMap::new(),
            metrics: BTreeMap::new(),
            tags,
        };

        let filtered = filtered_tags(&run);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered["custom_log"], "true");
    }
}
