//! Trajectory persistence stage.
//!
//! Drains the tracklet queue and commits each completed trajectory as one
//! atomic batch. The trajectory query listener is polled between queue
//! receives, so reads and writes share a single cooperative loop and the
//! store keeps exactly one writer. A failed write loses that one trajectory
//! and the loop continues.

use std::net::TcpListener;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, error, info};
use tracklet_store::TrackletStore;

use crate::throttle::IdleAlarm;
use crate::track::CompletedTrack;

const QUEUE_POLL: Duration = Duration::from_secs(1);
const IDLE_DIAGNOSTIC_AFTER: Duration = Duration::from_secs(40);

pub fn spawn_writer(
    store: Arc<TrackletStore>,
    tracklet_rx: Receiver<CompletedTrack>,
    query_listener: TcpListener,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("store-writer".into())
        .spawn(move || {
            let mut idle = IdleAlarm::new(IDLE_DIAGNOSTIC_AFTER);
            info!(
                "trajectory queries listening on {}",
                query_listener
                    .local_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_default()
            );

            loop {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }

                while crate::servers::query::poll(&query_listener, &store) {}

                match tracklet_rx.recv_timeout(QUEUE_POLL) {
                    Ok(track) => {
                        idle.busy();
                        persist(&store, track);
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        if idle.idle() {
                            debug!(
                                "no completed trajectories for {}s",
                                IDLE_DIAGNOSTIC_AFTER.as_secs()
                            );
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        info!("tracklet queue closed, writer stopping");
                        break;
                    }
                }
            }

            // Anything already queued still gets committed.
            while let Ok(track) = tracklet_rx.try_recv() {
                persist(&store, track);
            }
        })
        .expect("failed to spawn writer thread")
}

fn persist(store: &TrackletStore, track: CompletedTrack) {
    match store.put_track(track.object_id, track.class_id, &track.samples) {
        Ok(()) => {
            metrics::counter!("node_trajectories_persisted_total").increment(1);
        }
        Err(err) => {
            error!(
                "failed to persist trajectory {}: {err}",
                track.object_id.simple()
            );
            metrics::counter!("node_trajectory_write_errors_total").increment(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use crossbeam_channel::unbounded;
    use tracklet_store::{GeoPoint, TrackSample};
    use uuid::Uuid;

    use super::*;

    #[test]
    fn queued_trajectories_reach_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TrackletStore::open(dir.path()).unwrap());
        let (tx, rx) = unbounded();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();

        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = spawn_writer(store.clone(), rx, listener, shutdown);

        let id = Uuid::new_v4();
        tx.send(CompletedTrack {
            object_id: id,
            class_id: 2,
            samples: vec![
                TrackSample {
                    point: GeoPoint {
                        lat: 45.0,
                        lng: -75.0,
                    },
                    timestamp_ms: 100,
                },
                TrackSample {
                    point: GeoPoint {
                        lat: 45.001,
                        lng: -75.001,
                    },
                    timestamp_ms: 200,
                },
            ],
        })
        .unwrap();
        drop(tx);
        handle.join().unwrap();

        let stored = store.samples_in_range(0, 1_000).unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|s| s.object_id == id));
    }
}
