//! Measurement Storage
//!
//! Implementations of the `MeasurementStore` port: an in-memory store and a
//! JSON file backed store that rewrites the whole file on every save.

use crate::api::storage::MeasurementStore;
use crate::core::errors::PersistenceError;
use crate::model::record::MeasurementRecord;
use async_trait::async_trait;
use log::{debug, info};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::{fs, sync::RwLock};

fn newest_first(records: &[MeasurementRecord], limit: Option<usize>) -> Vec<MeasurementRecord> {
    let mut sorted = records.to_vec();
    sorted.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
    sorted.truncate(limit.unwrap_or(usize::MAX));
    sorted
}

/// Keeps measurements for the lifetime of the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<Vec<MeasurementRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MeasurementStore for MemoryStore {
    async fn save(&self, record: MeasurementRecord) -> Result<(), PersistenceError> {
        self.records.write().await.push(record);
        Ok(())
    }

    async fn recent(&self, limit: Option<usize>) -> Result<Vec<MeasurementRecord>, PersistenceError> {
        Ok(newest_first(&self.records.read().await, limit))
    }
}

/// Persists measurements as a JSON array in a single file.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    records: RwLock<Vec<MeasurementRecord>>,
}

impl JsonFileStore {
    /// Opens the store, loading existing measurements. A missing file is an
    /// empty store.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let path = path.as_ref().to_path_buf();
        let records = match fs::read_to_string(&path).await {
            Ok(json) => tokio::task::spawn_blocking(move || {
                serde_json::from_str::<Vec<MeasurementRecord>>(json.as_str())
            })
            .await
            .map_err(|e| PersistenceError::Task(e.to_string()))??,
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        info!(
            "Opened measurement store {} with {} entries.",
            path.display(),
            records.len()
        );
        Ok(Self {
            path,
            records: RwLock::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn store_to_file(&self, records: Vec<MeasurementRecord>) -> Result<(), PersistenceError> {
        let json = tokio::task::spawn_blocking(move || serde_json::to_string_pretty(&records))
            .await
            .map_err(|e| PersistenceError::Task(e.to_string()))??;
        fs::write(&self.path, json).await?;
        Ok(())
    }
}

#[async_trait]
impl MeasurementStore for JsonFileStore {
    async fn save(&self, record: MeasurementRecord) -> Result<(), PersistenceError> {
        let mut records = self.records.write().await;
        let mut updated = records.clone();
        updated.push(record);
        // only commit in memory once the file reflects it
        self.store_to_file(updated.clone()).await?;
        debug!("Stored measurement, {} entries in total.", updated.len());
        *records = updated;
        Ok(())
    }

    async fn recent(&self, limit: Option<usize>) -> Result<Vec<MeasurementRecord>, PersistenceError> {
        Ok(newest_first(&self.records.read().await, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{Gender, UserProfile};
    use crate::model::reading::{decode, encode_frame, Frame};
    use tempdir::TempDir;
    use time::Duration;

    fn record(weight: f64, age_secs: i64) -> MeasurementRecord {
        let reading = decode(&Frame::now(encode_frame(weight, Some(500), true))).unwrap();
        let mut record = MeasurementRecord::new(reading, None);
        record.recorded_at -= Duration::seconds(age_secs);
        record
    }

    #[tokio::test]
    async fn test_memory_store_newest_first() {
        let store = MemoryStore::new();
        store.save(record(70.0, 20)).await.unwrap();
        store.save(record(71.0, 0)).await.unwrap();
        store.save(record(72.0, 10)).await.unwrap();

        let all = store.recent(None).await.unwrap();
        let weights: Vec<f64> = all.iter().map(|r| r.reading.weight_kg()).collect();
        assert_eq!(weights, vec![71.0, 72.0, 70.0]);

        let latest = store.recent(Some(1)).await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].reading.weight_kg(), 71.0);
    }

    #[tokio::test]
    async fn test_json_store_missing_file_is_empty() {
        let dir = TempDir::new("miscale").unwrap();
        let store = JsonFileStore::open(dir.path().join("none.json")).await.unwrap();
        assert!(store.recent(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_json_store_and_reload() {
        let dir = TempDir::new("miscale").unwrap();
        let path = dir.path().join("measurements.json");

        let store = JsonFileStore::open(&path).await.unwrap();
        let profile = UserProfile::new(25, 178.0, Gender::Male).unwrap();
        let reading = decode(&Frame::now(encode_frame(72.4, Some(480), true))).unwrap();
        let saved = MeasurementRecord::new(reading, Some(&profile));
        store.save(saved.clone()).await.unwrap();

        let reopened = JsonFileStore::open(&path).await.unwrap();
        let loaded = reopened.recent(None).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, saved.id);
        assert_eq!(loaded[0].reading.weight_kg(), 72.4);
        assert_eq!(loaded[0].reading.impedance_ohms(), Some(480.0));
        assert!(loaded[0].composition.is_some());
    }

    #[tokio::test]
    async fn test_json_store_rejects_corrupt_file() {
        let dir = TempDir::new("miscale").unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            JsonFileStore::open(&path).await,
            Err(PersistenceError::Encoding(_))
        ));
    }

    #[tokio::test]
    async fn test_json_store_save_failure_keeps_memory_unchanged() {
        let dir = TempDir::new("miscale").unwrap();
        let path = dir.path().join("missing-dir").join("m.json");
        let store = JsonFileStore::open(&path).await.unwrap();
        assert!(matches!(
            store.save(record(70.0, 0)).await,
            Err(PersistenceError::Io(_))
        ));
        assert!(store.recent(None).await.unwrap().is_empty());
    }
}
