//! Stored measurement record.
use crate::core::config::UserProfile;
use crate::math::body::BodyComposition;
use crate::model::reading::Reading;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// A finalized reading as handed to the persistence port.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    pub id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
    pub reading: Reading,
    pub composition: Option<BodyComposition>,
}

impl MeasurementRecord {
    pub fn new(reading: Reading, profile: Option<&UserProfile>) -> Self {
        Self {
            id: Uuid::new_v4(),
            recorded_at: OffsetDateTime::now_utc(),
            reading,
            composition: profile.map(|p| BodyComposition::estimate(&reading, p)),
        }
    }
}
