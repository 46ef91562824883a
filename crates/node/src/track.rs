//! Centroid tracker and trajectory lifecycle.
//!
//! Every sequenced frame yields a list of candidate rectangles: detector
//! boxes when the frame was detected, motion-derived regions otherwise.
//! Candidates are matched against the active registry by greedy nearest-
//! neighbor assignment on centroid distance. Matched objects gain an
//! observation (with geographic coordinates for the rectangle's bottom
//! edge), unmatched objects accumulate misses until deregistration, and
//! unmatched candidates register as new objects. A deregistered object with
//! a positive classification is emitted as a completed trajectory;
//! unclassified objects are discarded.

use std::collections::HashMap;

use crossbeam_channel::Sender;
use tracing::{debug, warn};
use tracklet_store::{GeoPoint, TrackSample};
use uuid::Uuid;

use crate::context::TaggedFrame;
use crate::mapper::SharedMapper;
use crate::motion::RegionSource;

/// Axis-aligned pixel rectangle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PixelRect {
    pub x_min: i32,
    pub y_min: i32,
    pub x_max: i32,
    pub y_max: i32,
}

impl PixelRect {
    pub fn centroid(&self) -> (f32, f32) {
        (
            (self.x_min + self.x_max) as f32 / 2.0,
            (self.y_min + self.y_max) as f32 / 2.0,
        )
    }
}

/// A rectangle proposed for matching on one frame. Motion-derived regions
/// carry class 0 (unknown).
#[derive(Clone, Copy, Debug)]
pub struct Candidate {
    pub rect: PixelRect,
    pub class_id: u16,
}

/// One position sample of a tracked object.
#[derive(Clone, Copy, Debug)]
pub struct Observation {
    pub timestamp_ms: i64,
    pub centroid: (f32, f32),
    pub rect: PixelRect,
    pub bottom_left: GeoPoint,
    pub bottom_right: GeoPoint,
    pub bottom_center: GeoPoint,
}

/// An object under active or completed tracking.
#[derive(Clone, Debug)]
pub struct TrackedObject {
    pub object_id: Uuid,
    /// Sticky classification: 0 until the first positive class, immutable
    /// once positive.
    pub class_id: u16,
    pub observations: Vec<Observation>,
    pub complete: bool,
}

/// A finalized trajectory headed for the store.
#[derive(Clone, Debug)]
pub struct CompletedTrack {
    pub object_id: Uuid,
    pub class_id: u16,
    pub samples: Vec<TrackSample>,
}

impl CompletedTrack {
    fn from_object(object: &TrackedObject) -> Self {
        Self {
            object_id: object.object_id,
            class_id: object.class_id,
            samples: object
                .observations
                .iter()
                .map(|obs| TrackSample {
                    point: obs.bottom_center,
                    timestamp_ms: obs.timestamp_ms.max(0) as u64,
                })
                .collect(),
        }
    }
}

struct RegistryEntry {
    object_id: Uuid,
    centroid: (f32, f32),
    rect: PixelRect,
    class_id: u16,
    misses: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct TrackerParams {
    /// Consecutive missed frames tolerated before deregistration.
    pub max_disappeared: u32,
    /// Maximum centroid distance for a match, in pixels.
    pub max_distance: f32,
    /// Minimum detector score for a box to become a candidate.
    pub score_threshold: f32,
}

impl Default for TrackerParams {
    fn default() -> Self {
        Self {
            max_disappeared: 10,
            max_distance: 25.0,
            score_threshold: 0.5,
        }
    }
}

pub struct ObjectTracker {
    params: TrackerParams,
    registry: Vec<RegistryEntry>,
    objects: HashMap<Uuid, TrackedObject>,
    mapper: SharedMapper,
    tracklet_tx: Sender<CompletedTrack>,
    regions: Box<dyn RegionSource>,
}

impl ObjectTracker {
    pub fn new(
        params: TrackerParams,
        mapper: SharedMapper,
        tracklet_tx: Sender<CompletedTrack>,
        regions: Box<dyn RegionSource>,
    ) -> Self {
        Self {
            params,
            registry: Vec::new(),
            objects: HashMap::new(),
            mapper,
            tracklet_tx,
            regions,
        }
    }

    pub fn active_count(&self) -> usize {
        self.registry.len()
    }

    /// Process one sequenced frame.
    pub fn process(&mut self, frame: &TaggedFrame) {
        // The background model integrates every frame, detected or not, so
        // motion candidates stay coherent across detection gaps.
        let motion = self.regions.regions(&frame.frame);

        let candidates: Vec<Candidate> = match &frame.detection {
            Some(result) => result
                .pixel_boxes(
                    frame.frame.width,
                    frame.frame.height,
                    self.params.score_threshold,
                )
                .into_iter()
                .map(|b| Candidate {
                    rect: PixelRect {
                        x_min: b.x_min,
                        y_min: b.y_min,
                        x_max: b.x_max,
                        y_max: b.y_max,
                    },
                    class_id: b.class_id.max(0) as u16,
                })
                .collect(),
            None => motion
                .into_iter()
                .map(|rect| Candidate { rect, class_id: 0 })
                .collect(),
        };

        self.step(frame.timestamp_ms, &candidates);
        metrics::gauge!("node_tracked_objects").set(self.registry.len() as f64);
    }

    /// One matching cycle against the given candidates.
    pub fn step(&mut self, timestamp_ms: i64, candidates: &[Candidate]) {
        let assigned = self.assign(candidates);
        let mut row_used = vec![false; self.registry.len()];
        let mut col_used = vec![false; candidates.len()];

        for &(row, col) in &assigned {
            row_used[row] = true;
            col_used[col] = true;
            let candidate = candidates[col];
            let observation = self.observe(timestamp_ms, &candidate);

            let object_id = {
                let entry = &mut self.registry[row];
                entry.centroid = candidate.rect.centroid();
                entry.rect = candidate.rect;
                entry.misses = 0;
                if entry.class_id == 0 && candidate.class_id > 0 {
                    entry.class_id = candidate.class_id;
                }
                entry.object_id
            };

            if let Some(object) = self.objects.get_mut(&object_id) {
                if object.class_id == 0 && candidate.class_id > 0 {
                    object.class_id = candidate.class_id;
                }
                object.observations.push(observation);
            }
        }

        // Unmatched rows age; overdue ones deregister.
        let max_disappeared = self.params.max_disappeared;
        let mut deregistered = Vec::new();
        for (row, entry) in self.registry.iter_mut().enumerate() {
            if row_used.get(row).copied().unwrap_or(false) {
                continue;
            }
            entry.misses += 1;
            if entry.misses > max_disappeared {
                deregistered.push(entry.object_id);
            }
        }
        self.registry
            .retain(|entry| !deregistered.contains(&entry.object_id));
        for object_id in deregistered {
            self.finalize(object_id);
        }

        // Unmatched candidates register as new objects.
        for (col, candidate) in candidates.iter().enumerate() {
            if col_used[col] {
                continue;
            }
            self.register(timestamp_ms, candidate);
        }
    }

    /// Greedy assignment: repeatedly take the globally smallest
    /// registry/candidate distance within `max_distance`. Ties break by
    /// lowest registry index, then lowest candidate index.
    fn assign(&self, candidates: &[Candidate]) -> Vec<(usize, usize)> {
        let rows = self.registry.len();
        let cols = candidates.len();
        let mut row_used = vec![false; rows];
        let mut col_used = vec![false; cols];
        let mut assigned = Vec::new();

        let centroids: Vec<(f32, f32)> = candidates.iter().map(|c| c.rect.centroid()).collect();

        loop {
            let mut best: Option<(f32, usize, usize)> = None;
            for row in 0..rows {
                if row_used[row] {
                    continue;
                }
                let origin = self.registry[row].centroid;
                for col in 0..cols {
                    if col_used[col] {
                        continue;
                    }
                    let d = distance(origin, centroids[col]);
                    let better = match best {
                        None => true,
                        Some((bd, _, _)) => d < bd,
                    };
                    if better {
                        best = Some((d, row, col));
                    }
                }
            }

            match best {
                Some((d, row, col)) if d <= self.params.max_distance => {
                    row_used[row] = true;
                    col_used[col] = true;
                    assigned.push((row, col));
                }
                _ => break,
            }
        }

        assigned
    }

    fn register(&mut self, timestamp_ms: i64, candidate: &Candidate) {
        let observation = self.observe(timestamp_ms, candidate);
        let object_id = Uuid::new_v4();
        self.registry.push(RegistryEntry {
            object_id,
            centroid: candidate.rect.centroid(),
            rect: candidate.rect,
            class_id: candidate.class_id,
            misses: 0,
        });
        self.objects.insert(
            object_id,
            TrackedObject {
                object_id,
                class_id: candidate.class_id,
                observations: vec![observation],
                complete: false,
            },
        );
        debug!("registered object {}", object_id.simple());
    }

    fn finalize(&mut self, object_id: Uuid) {
        let Some(mut object) = self.objects.remove(&object_id) else {
            return;
        };
        object.complete = true;

        if object.class_id > 0 {
            debug!(
                "object {} complete ({} observations, class {})",
                object_id.simple(),
                object.observations.len(),
                object.class_id
            );
            metrics::counter!("node_tracks_completed_total").increment(1);
            if self
                .tracklet_tx
                .send(CompletedTrack::from_object(&object))
                .is_err()
            {
                warn!("tracklet queue closed; discarding completed trajectory");
            }
        } else {
            debug!(
                "object {} never classified; discarding",
                object_id.simple()
            );
        }
    }

    fn observe(&self, timestamp_ms: i64, candidate: &Candidate) -> Observation {
        let rect = candidate.rect;
        let centroid = rect.centroid();
        let (bottom_left, bottom_right, bottom_center) = match self.mapper.lock() {
            Ok(state) => (
                state.coord(rect.x_min as f64, rect.y_max as f64),
                state.coord(rect.x_max as f64, rect.y_max as f64),
                state.coord(centroid.0 as f64, rect.y_max as f64),
            ),
            Err(_) => {
                warn!("mapper lock poisoned; recording origin coordinates");
                (GeoPoint::default(), GeoPoint::default(), GeoPoint::default())
            }
        };
        Observation {
            timestamp_ms,
            centroid,
            rect,
            bottom_left,
            bottom_right,
            bottom_center,
        }
    }
}

fn distance(a: (f32, f32), b: (f32, f32)) -> f32 {
    let dx = a.0 - b.0;
    let dy = a.1 - b.1;
    (dx * dx + dy * dy).sqrt()
}
