//! Storage Module
//!
//! Persistence port receiving the finalized measurements.
use crate::core::errors::PersistenceError;
use crate::model::record::MeasurementRecord;
use async_trait::async_trait;

/// MeasurementStore trait
///
/// Called exactly once per completed session. A failing save is reported as a
/// session event and never changes the session's terminal state.
#[async_trait]
pub trait MeasurementStore: Send + Sync + 'static {
    /// Persist a finalized measurement.
    async fn save(&self, record: MeasurementRecord) -> Result<(), PersistenceError>;

    /// Stored measurements, newest first. `None` returns all of them.
    async fn recent(&self, limit: Option<usize>) -> Result<Vec<MeasurementRecord>, PersistenceError>;
}
