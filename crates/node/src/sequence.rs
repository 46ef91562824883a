//! Frame re-sequencing between detection and tracking.
//!
//! Detection completes out of order: a dispatched frame re-enters the output
//! queue only after its round trip, while later frames flow straight
//! through. The sequencer buffers arrivals in a bounded priority queue keyed
//! by sequence number and releases them in strictly increasing order. When
//! the buffer fills while waiting on a missing sequence it evicts the
//! minimum and accepts a gap rather than deadlocking.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, info, warn};

use crate::context::TaggedFrame;
use crate::track::ObjectTracker;

/// Bounded capacity of the reordering queue.
pub const PENDING_CAPACITY: usize = 300;

/// A pop timeout with no further input is treated as end of stream.
pub const POP_TIMEOUT: Duration = Duration::from_secs(20);

const POLL_INTERVAL: Duration = Duration::from_millis(500);

struct Pending(TaggedFrame);

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.0.seq == other.0.seq
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.seq.cmp(&other.0.seq)
    }
}

/// Reordering buffer. `push` admits a frame (possibly evicting), `pop_ready`
/// yields the next in-sequence frame if it has arrived.
pub struct FrameSequencer {
    pending: BinaryHeap<Reverse<Pending>>,
    expected: Option<u64>,
    capacity: usize,
}

impl FrameSequencer {
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: BinaryHeap::new(),
            expected: None,
            capacity,
        }
    }

    /// Admit a frame. If the buffer is full the minimum-sequence frame is
    /// evicted and the expected counter skips past it; the evicted sequence
    /// is returned so the stage can log the gap.
    pub fn push(&mut self, frame: TaggedFrame) -> Option<u64> {
        let mut skipped = None;
        if self.pending.len() >= self.capacity {
            if let Some(Reverse(Pending(evicted))) = self.pending.pop() {
                let resume = evicted.seq + 1;
                self.expected = Some(self.expected.map_or(resume, |e| e.max(resume)));
                skipped = Some(evicted.seq);
            }
        }
        self.pending.push(Reverse(Pending(frame)));
        skipped
    }

    /// The next frame, only if it is exactly the expected sequence. Stale
    /// frames below the expected counter (left behind by a forced skip) are
    /// discarded on the way.
    pub fn pop_ready(&mut self) -> Option<TaggedFrame> {
        loop {
            let head = self.pending.peek()?;
            let seq = head.0 .0.seq;
            let expected = *self.expected.get_or_insert(seq);

            if seq < expected {
                let Reverse(Pending(stale)) = self.pending.pop()?;
                debug!("discarding stale frame #{} after forced skip", stale.seq);
                continue;
            }
            if seq > expected {
                return None;
            }

            let Reverse(Pending(frame)) = self.pending.pop()?;
            self.expected = Some(expected + 1);
            return Some(frame);
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Spawn the sequencer + tracker stage: frames leave the output queue,
/// regain strict order, and drive one tracker cycle each.
pub fn spawn_tracking(
    output_rx: Receiver<TaggedFrame>,
    mut tracker: ObjectTracker,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("sequence-track".into())
        .spawn(move || {
            let mut sequencer = FrameSequencer::new(PENDING_CAPACITY);
            let mut last_input = Instant::now();

            loop {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }

                match output_rx.recv_timeout(POLL_INTERVAL) {
                    Ok(frame) => {
                        last_input = Instant::now();
                        admit(&mut sequencer, frame, &mut tracker);
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        if last_input.elapsed() >= POP_TIMEOUT {
                            info!("no frames for {}s, ending tracking", POP_TIMEOUT.as_secs());
                            break;
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        while let Some(frame) = sequencer.pop_ready() {
                            tracker.process(&frame);
                        }
                        info!("frame stream ended, tracking stage stopping");
                        break;
                    }
                }
            }
        })
        .expect("failed to spawn tracking thread")
}

fn admit(sequencer: &mut FrameSequencer, frame: TaggedFrame, tracker: &mut ObjectTracker) {
    if let Some(skipped) = sequencer.push(frame) {
        warn!("reorder queue full, skipping past frame #{skipped}");
        metrics::counter!("node_sequence_skips_total").increment(1);
    }
    metrics::gauge!("node_queue_depth", "queue" => "reorder").set(sequencer.len() as f64);
    while let Some(next) = sequencer.pop_ready() {
        tracker.process(&next);
    }
}

#[cfg(test)]
mod tests {
    use video_ingest::{Frame, FrameFormat};

    use super::*;

    fn frame(seq: u64) -> TaggedFrame {
        TaggedFrame {
            seq,
            timestamp_ms: seq as i64,
            frame: Frame {
                data: Vec::new(),
                width: 0,
                height: 0,
                timestamp_ms: seq as i64,
                format: FrameFormat::Bgr8,
            },
            detection: None,
        }
    }

    fn drain(sequencer: &mut FrameSequencer) -> Vec<u64> {
        let mut seqs = Vec::new();
        while let Some(f) = sequencer.pop_ready() {
            seqs.push(f.seq);
        }
        seqs
    }

    #[test]
    fn in_order_frames_pass_straight_through() {
        let mut sequencer = FrameSequencer::new(10);
        for seq in 0..3 {
            assert!(sequencer.push(frame(seq)).is_none());
        }
        assert_eq!(drain(&mut sequencer), vec![0, 1, 2]);
    }

    #[test]
    fn expected_counter_initializes_from_lowest_seen() {
        let mut sequencer = FrameSequencer::new(10);
        sequencer.push(frame(5));
        assert_eq!(drain(&mut sequencer), vec![5]);
        sequencer.push(frame(6));
        assert_eq!(drain(&mut sequencer), vec![6]);
    }

    #[test]
    fn early_frames_wait_for_the_missing_sequence() {
        let mut sequencer = FrameSequencer::new(10);
        sequencer.push(frame(0));
        assert_eq!(drain(&mut sequencer), vec![0]);

        // Frame 1 is still in flight; 2 and 3 must hold.
        sequencer.push(frame(2));
        sequencer.push(frame(3));
        assert_eq!(drain(&mut sequencer), Vec::<u64>::new());
        assert_eq!(sequencer.len(), 2);

        sequencer.push(frame(1));
        assert_eq!(drain(&mut sequencer), vec![1, 2, 3]);
    }

    #[test]
    fn overflow_evicts_and_skips_forward() {
        let mut sequencer = FrameSequencer::new(3);
        sequencer.push(frame(0));
        assert_eq!(drain(&mut sequencer), vec![0]);

        // Sequence 1 never arrives; the buffer fills with later frames.
        assert!(sequencer.push(frame(2)).is_none());
        assert!(sequencer.push(frame(3)).is_none());
        assert!(sequencer.push(frame(4)).is_none());
        assert_eq!(sequencer.push(frame(5)), Some(2));

        // Expected advanced to 3; delivery resumes with a logged gap.
        assert_eq!(drain(&mut sequencer), vec![3, 4, 5]);
    }

    #[test]
    fn stale_frames_below_expected_are_discarded() {
        let mut sequencer = FrameSequencer::new(3);
        sequencer.push(frame(10));
        assert_eq!(drain(&mut sequencer), vec![10]);

        sequencer.push(frame(12));
        sequencer.push(frame(13));
        sequencer.push(frame(14));
        // Eviction skips expected past 12; 13..=15 drain normally.
        assert_eq!(sequencer.push(frame(15)), Some(12));
        assert_eq!(drain(&mut sequencer), vec![13, 14, 15]);

        // The missing frame 11 finally arrives, now below the expected
        // counter, and is dropped instead of delivered out of order.
        sequencer.push(frame(11));
        assert_eq!(drain(&mut sequencer), Vec::<u64>::new());
        assert!(sequencer.is_empty());
    }
}
