//! Embedded ordered store for completed trajectories and calibration state.
//!
//! One process writes at a time; concurrent readers are fine. Trajectory
//! samples live under a one-byte epoch prefix (see [`keys`]) so generations
//! of data can be told apart; the calibration document sits under its own
//! key outside the sample layout. A trajectory is committed as a single
//! atomic batch and is never partially visible to readers.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub mod keys;

pub const DEFAULT_EPOCH: u8 = 0;

const CALIBRATION_KEY: &[u8] = b"node/calibration";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O failure: {0}")]
    Io(#[from] sled::Error),
    #[error("stored document is malformed: {0}")]
    Corrupt(String),
}

/// A geographic coordinate in degrees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

/// Pixel dimensions of the tracking frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameDims {
    pub height: u32,
    pub width: u32,
}

/// The four named calibration corners. `ul`/`ur` sit at mid-frame height
/// (the top half is excluded from fitting); `ll`/`lr` follow the producing
/// map tool's boundary walk, pairing with pixel corners `(w,h)` and `(0,h)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Corners {
    pub ul: GeoPoint,
    pub ur: GeoPoint,
    pub ll: GeoPoint,
    pub lr: GeoPoint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HomographyPoints {
    pub corners: Corners,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub markers: Option<serde_json::Value>,
}

/// Calibration document as exchanged over the handoff protocol and persisted
/// in the store. `tracking_frame` is filled in by the node; handoff payloads
/// usually carry only the corner points.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Calibration {
    pub homography_points: HomographyPoints,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_frame: Option<FrameDims>,
}

/// One persisted position sample of a completed trajectory.
#[derive(Debug, Clone, Copy)]
pub struct TrackSample {
    pub point: GeoPoint,
    pub timestamp_ms: u64,
}

/// A sample decoded back out of the store.
#[derive(Debug, Clone, Copy)]
pub struct StoredSample {
    pub object_id: Uuid,
    pub class_id: u16,
    pub point: GeoPoint,
    pub timestamp_ms: u64,
}

pub struct TrackletStore {
    db: sled::Db,
    epoch: u8,
}

impl TrackletStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_epoch(path, DEFAULT_EPOCH)
    }

    pub fn open_with_epoch(path: impl AsRef<Path>, epoch: u8) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Ok(Self { db, epoch })
    }

    pub fn epoch(&self) -> u8 {
        self.epoch
    }

    /// Persist one completed trajectory as a single atomic batch.
    pub fn put_track(
        &self,
        object_id: Uuid,
        class_id: u16,
        samples: &[TrackSample],
    ) -> Result<(), StoreError> {
        let mut batch = sled::Batch::default();
        for sample in samples {
            let key = keys::sample_key(self.epoch, keys::cell_id(sample.point), sample.timestamp_ms);
            batch.insert(key.to_vec(), keys::sample_value(object_id, class_id).to_vec());
        }
        self.db.apply_batch(batch)?;
        debug!(
            "committed trajectory {} ({} samples)",
            object_id.simple(),
            samples.len()
        );
        Ok(())
    }

    /// All samples of the current epoch whose timestamp falls in
    /// `[start_ms, start_ms + range_ms)`, in key order.
    pub fn samples_in_range(
        &self,
        start_ms: u64,
        range_ms: u64,
    ) -> Result<Vec<StoredSample>, StoreError> {
        let end_ms = start_ms.saturating_add(range_ms);
        let mut out = Vec::new();
        for entry in self.db.scan_prefix([self.epoch]) {
            let (key, value) = entry?;
            let Some((cell, timestamp_ms)) = keys::decode_sample_key(&key) else {
                continue;
            };
            if timestamp_ms < start_ms || timestamp_ms >= end_ms {
                continue;
            }
            let (object_id, class_id) = keys::decode_sample_value(&value).ok_or_else(|| {
                StoreError::Corrupt(format!("sample value has {} bytes", value.len()))
            })?;
            out.push(StoredSample {
                object_id,
                class_id,
                point: keys::cell_center(cell),
                timestamp_ms,
            });
        }
        Ok(out)
    }

    pub fn put_calibration(&self, calibration: &Calibration) -> Result<(), StoreError> {
        let doc = serde_json::to_vec(calibration)
            .map_err(|err| StoreError::Corrupt(err.to_string()))?;
        self.db.insert(CALIBRATION_KEY, doc)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn calibration(&self) -> Result<Option<Calibration>, StoreError> {
        match self.db.get(CALIBRATION_KEY)? {
            Some(doc) => serde_json::from_slice(&doc)
                .map(Some)
                .map_err(|err| StoreError::Corrupt(err.to_string())),
            None => Ok(None),
        }
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}
