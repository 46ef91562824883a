//! Remote-detection stage.
//!
//! Pops pending frames off the input queue without blocking and keeps
//! exactly one detector call in flight, so a slow or overloaded service
//! cannot cause request buildup. Successful results are resized back to
//! tracking resolution and pushed to the output queue; failures are logged
//! and the frame is dropped, never retried.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};
use detector_client::DetectorClient;
use tracing::{debug, error, warn};

use crate::context::{DetectionRequest, TaggedFrame};
use crate::throttle::IdleAlarm;

const IDLE_DIAGNOSTIC_AFTER: Duration = Duration::from_secs(40);
const IDLE_SLEEP: Duration = Duration::from_millis(50);

pub fn spawn_detector(
    client: DetectorClient,
    input_rx: Receiver<DetectionRequest>,
    output_tx: Sender<TaggedFrame>,
    tracking_size: (i32, i32),
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("detector-client".into())
        .spawn(move || {
            let (tw, th) = tracking_size;
            let mut idle = IdleAlarm::new(IDLE_DIAGNOSTIC_AFTER);

            loop {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }

                let request = match input_rx.try_recv() {
                    Ok(request) => request,
                    Err(TryRecvError::Empty) => {
                        if idle.idle() {
                            debug!(
                                "no detection requests for {}s",
                                IDLE_DIAGNOSTIC_AFTER.as_secs()
                            );
                        }
                        thread::sleep(IDLE_SLEEP);
                        continue;
                    }
                    Err(TryRecvError::Disconnected) => break,
                };
                idle.busy();

                let started = Instant::now();
                let result = match client.detect(&request.frame) {
                    Ok(result) => result,
                    Err(err) => {
                        warn!("detection failed for frame #{}: {err}", request.seq);
                        metrics::counter!("node_detector_errors_total").increment(1);
                        continue;
                    }
                };
                metrics::histogram!("node_detector_round_trip_seconds")
                    .record(started.elapsed().as_secs_f64());
                debug!(
                    "frame #{}: {} detection(s) in {:.2}s",
                    request.seq,
                    result.detection_boxes.len(),
                    started.elapsed().as_secs_f64()
                );

                let tagged = TaggedFrame {
                    seq: request.seq,
                    timestamp_ms: request.timestamp_ms,
                    frame: request.frame.resized(tw, th),
                    detection: Some(result),
                };
                match output_tx.try_send(tagged) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        // The dispatcher reserves headroom for detected
                        // frames; hitting this means the queue capacity is
                        // misconfigured.
                        error!(
                            "output queue full, dropping detected frame #{}",
                            request.seq
                        );
                        metrics::counter!("node_dropped_frames_total").increment(1);
                    }
                    Err(TrySendError::Disconnected(_)) => break,
                }
            }
        })
        .expect("failed to spawn detector thread")
}
