//! Pipeline context: every queue endpoint and the shared shutdown signal,
//! created once and handed out to the stages at spawn time. No stage reaches
//! for globals.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use detector_client::DetectionResult;
use video_ingest::Frame;

use crate::track::CompletedTrack;

/// Bounded capacity of the output queue feeding the sequencer.
pub const OUTPUT_QUEUE_CAPACITY: usize = 80;

/// Producers stop enqueueing once the output queue reaches 90% of capacity;
/// the remaining headroom is reserved for in-flight detected frames.
pub const OUTPUT_QUEUE_SAFE_LEN: usize = OUTPUT_QUEUE_CAPACITY * 9 / 10;

/// A frame queued for remote detection, at capture resolution.
pub struct DetectionRequest {
    pub seq: u64,
    pub timestamp_ms: i64,
    pub frame: Frame,
}

/// A sequenced frame on its way to the tracker, at tracking resolution.
pub struct TaggedFrame {
    pub seq: u64,
    pub timestamp_ms: i64,
    pub frame: Frame,
    pub detection: Option<DetectionResult>,
}

impl TaggedFrame {
    pub fn detected(&self) -> bool {
        self.detection.is_some()
    }
}

pub struct PipelineContext {
    pub input_tx: Sender<DetectionRequest>,
    pub input_rx: Receiver<DetectionRequest>,
    pub output_tx: Sender<TaggedFrame>,
    pub output_rx: Receiver<TaggedFrame>,
    pub tracklet_tx: Sender<CompletedTrack>,
    pub tracklet_rx: Receiver<CompletedTrack>,
    pub shutdown: Arc<AtomicBool>,
}

impl PipelineContext {
    pub fn new() -> Self {
        let (input_tx, input_rx) = unbounded();
        let (output_tx, output_rx) = bounded(OUTPUT_QUEUE_CAPACITY);
        let (tracklet_tx, tracklet_rx) = unbounded();
        Self {
            input_tx,
            input_rx,
            output_tx,
            output_rx,
            tracklet_tx,
            tracklet_rx,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

impl Default for PipelineContext {
    fn default() -> Self {
        Self::new()
    }
}
