//! Ingest/dispatch stage.
//!
//! Tags each newly captured, non-duplicate frame with the next sequence
//! number, then routes it: a full-resolution copy goes to the detection
//! queue when no detection has been requested within the configured
//! interval, otherwise a tracking-resolution copy goes straight to the
//! output queue. Either way the output queue is left 10% of headroom for
//! detected frames coming back; past that watermark frames are dropped with
//! a rate-limited warning. The dispatcher never blocks on a full queue.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{error, info, warn};
use tracklet_store::{FrameDims, TrackletStore};
use video_ingest::{CaptureError, Frame};

use crate::context::{DetectionRequest, TaggedFrame, OUTPUT_QUEUE_SAFE_LEN};
use crate::mapper::SharedMapper;
use crate::throttle::Throttle;

const DROP_WARNING_INTERVAL: Duration = Duration::from_secs(30);
const SOURCE_POLL: Duration = Duration::from_millis(500);

pub struct IngestConfig {
    pub tracking_size: (i32, i32),
    pub detect_interval: Duration,
}

#[allow(clippy::too_many_arguments)]
pub fn spawn_ingest(
    config: IngestConfig,
    source: Receiver<Result<Frame, CaptureError>>,
    input_tx: Sender<DetectionRequest>,
    output_tx: Sender<TaggedFrame>,
    store: Arc<TrackletStore>,
    mapper: SharedMapper,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("ingest".into())
        .spawn(move || {
            run_loop(config, source, input_tx, output_tx, store, mapper, shutdown)
        })
        .expect("failed to spawn ingest thread")
}

fn run_loop(
    config: IngestConfig,
    source: Receiver<Result<Frame, CaptureError>>,
    input_tx: Sender<DetectionRequest>,
    output_tx: Sender<TaggedFrame>,
    store: Arc<TrackletStore>,
    mapper: SharedMapper,
    shutdown: Arc<AtomicBool>,
) {
    let (tw, th) = config.tracking_size;
    let mut seq: u64 = 0;
    let mut last_digest: Option<u64> = None;
    let mut last_dispatch: Option<Instant> = None;
    let mut dropped: u64 = 0;
    let mut drop_warning = Throttle::new(DROP_WARNING_INTERVAL);

    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        let frame = match source.recv_timeout(SOURCE_POLL) {
            Ok(Ok(frame)) => frame,
            Ok(Err(err)) => {
                error!("capture error: {err}");
                break;
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                info!("reached end of video stream");
                break;
            }
        };

        // Threaded capture sources can hand back the same frame twice.
        let digest = frame_digest(&frame);
        if last_digest == Some(digest) {
            continue;
        }
        last_digest = Some(digest);

        if seq == 0 {
            record_dims(&store, &mapper, (tw, th));
        }

        let below_watermark = output_tx.len() < OUTPUT_QUEUE_SAFE_LEN;
        let detection_due = last_dispatch
            .map_or(true, |at| at.elapsed() >= config.detect_interval);

        if detection_due && below_watermark {
            let request = DetectionRequest {
                seq,
                timestamp_ms: frame.timestamp_ms,
                frame,
            };
            if input_tx.send(request).is_err() {
                error!("detection queue closed unexpectedly");
                break;
            }
            last_dispatch = Some(Instant::now());
        } else if below_watermark {
            let tagged = TaggedFrame {
                seq,
                timestamp_ms: frame.timestamp_ms,
                frame: frame.resized(tw, th),
                detection: None,
            };
            match output_tx.try_send(tagged) {
                Ok(()) => {
                    metrics::gauge!("node_queue_depth", "queue" => "output")
                        .set(output_tx.len() as f64);
                }
                Err(TrySendError::Full(_)) => {
                    dropped = count_drop(dropped, &mut drop_warning);
                }
                Err(TrySendError::Disconnected(_)) => {
                    error!("tracking stage terminated unexpectedly");
                    break;
                }
            }
        } else {
            dropped = count_drop(dropped, &mut drop_warning);
        }

        seq += 1;
    }
}

fn count_drop(dropped: u64, warning: &mut Throttle) -> u64 {
    let total = dropped + 1;
    metrics::counter!("node_dropped_frames_total").increment(1);
    if warning.ready() {
        warn!("output queue above 90% capacity, dropping frames (total dropped: {total})");
    }
    total
}

/// On the first frame, record the tracking-frame dimensions into the shared
/// mapper state and persist them with the calibration document if one
/// exists.
fn record_dims(store: &TrackletStore, mapper: &SharedMapper, tracking_size: (i32, i32)) {
    let dims = FrameDims {
        width: tracking_size.0 as u32,
        height: tracking_size.1 as u32,
    };

    let Ok(mut state) = mapper.lock() else {
        warn!("mapper lock poisoned; skipping dimension update");
        return;
    };
    if let Err(err) = state.set_dims(dims) {
        warn!("transform refit after dimension update failed: {err}");
    }
    if let Some(calibration) = state.calibration() {
        if let Err(err) = store.put_calibration(calibration) {
            warn!("failed to persist tracking-frame dimensions: {err}");
        }
    }
}

fn frame_digest(frame: &Frame) -> u64 {
    let mut hasher = DefaultHasher::new();
    frame.data.hash(&mut hasher);
    frame.width.hash(&mut hasher);
    frame.height.hash(&mut hasher);
    hasher.finish()
}
