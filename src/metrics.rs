//! Historical stage-timing store backing ETA estimates.
//!
//! One JSON file per stage under `<data_dir>/metrics/`, holding the most
//! recent run samples. The file is written by exactly one writer per stage
//! (the pipeline completing a stage) and may be read by anyone.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::events::StageId;

/// Retained samples per stage; older samples are discarded.
const MAX_SAMPLES: usize = 50;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One completed stage run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSample {
    pub timestamp: DateTime<Utc>,
    /// Items processed in the run.
    pub total: u64,
    pub duration_ms: u64,
}

/// Keyed file store of per-stage timing history.
#[derive(Debug, Clone)]
pub struct MetricsStore {
    dir: PathBuf,
}

impl MetricsStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn stage_path(&self, stage: StageId) -> PathBuf {
        self.dir.join(format!("{}.json", stage.as_str()))
    }

    /// Load the retained samples for a stage. Missing or corrupt files
    /// yield an empty history rather than an error.
    pub fn load(&self, stage: StageId) -> Vec<StageSample> {
        let path = self.stage_path(stage);
        let data = match fs::read_to_string(&path) {
            Ok(data) => data,
            Err(_) => return Vec::new(),
        };
        match serde_json::from_str(&data) {
            Ok(samples) => samples,
            Err(e) => {
                warn!("ignoring corrupt metrics file {}: {}", path.display(), e);
                Vec::new()
            }
        }
    }

    /// Append a run sample, dropping the oldest beyond the retention cap.
    pub fn record(
        &self,
        stage: StageId,
        total: u64,
        duration: Duration,
    ) -> Result<(), MetricsError> {
        let mut samples = self.load(stage);
        samples.push(StageSample {
            timestamp: Utc::now(),
            total,
            duration_ms: duration.as_millis() as u64,
        });
        if samples.len() > MAX_SAMPLES {
            let excess = samples.len() - MAX_SAMPLES;
            samples.drain(..excess);
        }

        fs::create_dir_all(&self.dir)?;
        let tmp = self.stage_path(stage).with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&samples)?)?;
        fs::rename(&tmp, self.stage_path(stage))?;
        Ok(())
    }

    /// Mean per-item duration in milliseconds across the retained history.
    ///
    /// Samples with a zero item count carry no rate information and are
    /// ignored. Returns `None` when no usable history exists.
    pub fn mean_per_item_ms(&self, stage: StageId) -> Option<f64> {
        let samples = self.load(stage);
        let (items, ms): (u64, u64) = samples
            .iter()
            .filter(|s| s.total > 0)
            .fold((0, 0), |(items, ms), s| {
                (items + s.total, ms + s.duration_ms)
            });
        if items == 0 {
            None
        } else {
            Some(ms as f64 / items as f64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_missing_is_empty() {
        let dir = tempdir().unwrap();
        let store = MetricsStore::new(dir.path().join("metrics"));
        assert!(store.load(StageId::Scraping).is_empty());
        assert_eq!(store.mean_per_item_ms(StageId::Scraping), None);
    }

    #[test]
    fn test_record_and_mean() {
        let dir = tempdir().unwrap();
        let store = MetricsStore::new(dir.path().join("metrics"));

        store
            .record(StageId::Processing, 10, Duration::from_millis(1000))
            .unwrap();
        store
            .record(StageId::Processing, 20, Duration::from_millis(4000))
            .unwrap();

        let samples = store.load(StageId::Processing);
        assert_eq!(samples.len(), 2);
        // (1000 + 4000) ms over 30 items
        let mean = store.mean_per_item_ms(StageId::Processing).unwrap();
        assert!((mean - 166.66).abs() < 1.0);
    }

    #[test]
    fn test_zero_total_samples_ignored_for_mean() {
        let dir = tempdir().unwrap();
        let store = MetricsStore::new(dir.path());

        store
            .record(StageId::Indices, 0, Duration::from_millis(500))
            .unwrap();
        assert_eq!(store.mean_per_item_ms(StageId::Indices), None);

        store
            .record(StageId::Indices, 5, Duration::from_millis(500))
            .unwrap();
        assert_eq!(store.mean_per_item_ms(StageId::Indices), Some(100.0));
    }

    #[test]
    fn test_retention_cap() {
        let dir = tempdir().unwrap();
        let store = MetricsStore::new(dir.path());

        for i in 0..60 {
            store
                .record(StageId::Scraping, i + 1, Duration::from_millis(100))
                .unwrap();
        }
        let samples = store.load(StageId::Scraping);
        assert_eq!(samples.len(), 50);
        // Oldest entries were dropped
        assert_eq!(samples.first().unwrap().total, 11);
        assert_eq!(samples.last().unwrap().total, 60);
    }

    #[test]
    fn test_corrupt_file_treated_as_empty() {
        let dir = tempdir().unwrap();
        let store = MetricsStore::new(dir.path());
        fs::create_dir_all(dir.path()).unwrap();
        fs::write(dir.path().join("analysis.json"), "not json").unwrap();

        assert!(store.load(StageId::Analysis).is_empty());
    }

    #[test]
    fn test_stages_are_keyed_separately() {
        let dir = tempdir().unwrap();
        let store = MetricsStore::new(dir.path());

        store
            .record(StageId::Scraping, 4, Duration::from_millis(400))
            .unwrap();
        assert!(store.load(StageId::Processing).is_empty());
        assert_eq!(store.load(StageId::Scraping).len(), 1);
    }
}
