//! Trajectory query server.
//!
//! One exchange per connection: the peer sends `{timestamp, range}` (integer
//! values, possibly as decimal strings), and the node replies with every
//! stored sample whose timestamp falls in `[timestamp, timestamp + range)`,
//! grouped by object id. Positions are the centers of the stored spatial
//! cells, so they sit within a fraction of a centimeter of the sampled
//! points.

use std::collections::BTreeMap;
use std::io::Write;
use std::net::{TcpListener, TcpStream};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use tracklet_store::TrackletStore;
use uuid::Uuid;

use crate::servers::read_document;

#[derive(Deserialize)]
struct QueryRequest {
    timestamp: serde_json::Value,
    range: serde_json::Value,
}

#[derive(Serialize)]
struct TrackletsEntry {
    object_id: String,
    detection_class_id: u16,
    vendor: u16,
    /// `[lng, lat, timestamp_ms]` triples in store order.
    tracklets: Vec<(f64, f64, u64)>,
}

pub fn bind(port: u16) -> Result<TcpListener> {
    let listener = TcpListener::bind(("127.0.0.1", port))
        .with_context(|| format!("failed to bind trajectory query listener on port {port}"))?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Accept and serve at most one pending connection; returns whether one was
/// handled. The store-writer loop calls this between queue polls.
pub fn poll(listener: &TcpListener, store: &TrackletStore) -> bool {
    match listener.accept() {
        Ok((stream, peer)) => {
            if let Err(err) = handle_connection(stream, store) {
                warn!("trajectory query from {peer} failed: {err}");
            }
            true
        }
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => false,
        Err(err) => {
            warn!("trajectory query accept failed: {err}");
            false
        }
    }
}

fn handle_connection(mut stream: TcpStream, store: &TrackletStore) -> Result<()> {
    let request: QueryRequest = read_document(&mut stream)?;
    let timestamp = integer_field(&request.timestamp, "timestamp")?;
    let range = integer_field(&request.range, "range")?;

    let samples = store.samples_in_range(timestamp, range)?;

    let mut grouped: BTreeMap<Uuid, TrackletsEntry> = BTreeMap::new();
    for sample in samples {
        grouped
            .entry(sample.object_id)
            .or_insert_with(|| TrackletsEntry {
                object_id: sample.object_id.simple().to_string(),
                detection_class_id: sample.class_id,
                vendor: sample.class_id,
                tracklets: Vec::new(),
            })
            .tracklets
            .push((sample.point.lng, sample.point.lat, sample.timestamp_ms));
    }

    let entries: Vec<TrackletsEntry> = grouped.into_values().collect();
    debug!(
        "query [{timestamp}, +{range}) matched {} object(s)",
        entries.len()
    );
    stream.write_all(&serde_json::to_vec(&entries)?)?;
    Ok(())
}

/// Accept both JSON integers and decimal strings.
fn integer_field(value: &serde_json::Value, name: &str) -> Result<u64> {
    match value {
        serde_json::Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| anyhow!("{name} must be a non-negative integer")),
        serde_json::Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| anyhow!("{name} must be an integer, got {s:?}")),
        other => Err(anyhow!("{name} must be an integer, got {other}")),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use tracklet_store::{GeoPoint, TrackSample};

    use super::*;

    fn serve(store: Arc<TrackletStore>) -> (std::net::SocketAddr, Arc<AtomicBool>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();
        let done = Arc::new(AtomicBool::new(false));
        let thread_done = done.clone();
        thread::spawn(move || {
            while !thread_done.load(Ordering::Relaxed) {
                if !poll(&listener, &store) {
                    thread::sleep(Duration::from_millis(10));
                }
            }
        });
        (addr, done)
    }

    fn query(addr: std::net::SocketAddr, body: &str) -> serde_json::Value {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(body.as_bytes()).unwrap();
        let mut reply = String::new();
        stream.read_to_string(&mut reply).unwrap();
        serde_json::from_str(&reply).unwrap()
    }

    #[test]
    fn range_query_groups_samples_by_object() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TrackletStore::open(dir.path()).unwrap());

        let walker = Uuid::new_v4();
        store
            .put_track(
                walker,
                1,
                &[
                    TrackSample {
                        point: GeoPoint {
                            lat: 45.393,
                            lng: -75.751,
                        },
                        timestamp_ms: 1_000,
                    },
                    TrackSample {
                        point: GeoPoint {
                            lat: 45.394,
                            lng: -75.752,
                        },
                        timestamp_ms: 2_000,
                    },
                ],
            )
            .unwrap();
        store
            .put_track(
                Uuid::new_v4(),
                3,
                &[TrackSample {
                    point: GeoPoint {
                        lat: 45.395,
                        lng: -75.753,
                    },
                    timestamp_ms: 90_000,
                }],
            )
            .unwrap();

        let (addr, done) = serve(store);
        let reply = query(addr, r#"{"timestamp": "0", "range": "10000"}"#);
        done.store(true, Ordering::SeqCst);

        let entries = reply.as_array().unwrap();
        assert_eq!(entries.len(), 1, "second trajectory is out of range");
        let entry = &entries[0];
        assert_eq!(entry["object_id"], walker.simple().to_string());
        assert_eq!(entry["detection_class_id"], 1);
        assert_eq!(entry["vendor"], 1);

        let tracklets = entry["tracklets"].as_array().unwrap();
        assert_eq!(tracklets.len(), 2);
        let early = tracklets
            .iter()
            .map(|t| t.as_array().unwrap())
            .find(|t| t[2].as_u64() == Some(1_000))
            .expect("sample at t=1000");
        assert!((early[0].as_f64().unwrap() - (-75.751)).abs() < 1e-6);
        assert!((early[1].as_f64().unwrap() - 45.393).abs() < 1e-6);
    }

    #[test]
    fn integer_requests_are_accepted_too() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TrackletStore::open(dir.path()).unwrap());
        let (addr, done) = serve(store);

        let reply = query(addr, r#"{"timestamp": 0, "range": 1000}"#);
        done.store(true, Ordering::SeqCst);
        assert_eq!(reply, serde_json::json!([]));
    }

    #[test]
    fn integer_field_rejects_garbage() {
        assert!(integer_field(&serde_json::json!("12"), "t").is_ok());
        assert!(integer_field(&serde_json::json!(12), "t").is_ok());
        assert!(integer_field(&serde_json::json!("x"), "t").is_err());
        assert!(integer_field(&serde_json::json!(null), "t").is_err());
    }
}
