//! Calibration handoff server.
//!
//! One exchange per connection: the peer sends a calibration document
//! (corner geopoints), the node persists it, reloads it into the shared
//! mapper state, refits the transform, and replies with the current
//! tracking-frame dimensions. Store write, reload, and refit happen under
//! one mapper lock so a concurrent handoff cannot interleave with a fit.
//!
//! In calibrating mode the same loop also refits the transform from the
//! store every few seconds, keeping the node current while the operator
//! drags corners around in the map tool.

use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::tick;
use tracing::{debug, info, warn};
use tracklet_store::{Calibration, TrackletStore};

use crate::mapper::SharedMapper;
use crate::servers::read_document;

/// Refit period while an operator is adjusting the calibration live.
const CALIBRATING_REFIT_INTERVAL: Duration = Duration::from_secs(4);

const ACCEPT_POLL: Duration = Duration::from_millis(50);

pub fn bind(port: u16) -> Result<TcpListener> {
    let listener = TcpListener::bind(("127.0.0.1", port))
        .with_context(|| format!("failed to bind calibration listener on port {port}"))?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Spawn the handoff loop on its own thread. `live_refit` enables the
/// periodic calibrating-mode refit.
pub fn spawn(
    listener: TcpListener,
    store: Arc<TrackletStore>,
    mapper: SharedMapper,
    live_refit: bool,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("calibration-server".into())
        .spawn(move || {
            let refit_tick = tick(CALIBRATING_REFIT_INTERVAL);
            info!(
                "calibration handoff listening on {}",
                listener
                    .local_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_default()
            );

            loop {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }

                match listener.accept() {
                    Ok((stream, peer)) => {
                        match handle_connection(stream, &store, &mapper) {
                            Ok(()) => info!("calibration received from {peer}"),
                            Err(err) => warn!("calibration handoff from {peer} failed: {err}"),
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(ACCEPT_POLL);
                    }
                    Err(err) => {
                        warn!("calibration accept failed: {err}");
                        thread::sleep(ACCEPT_POLL);
                    }
                }

                if live_refit && refit_tick.try_recv().is_ok() {
                    refit_from_store(&store, &mapper);
                }
            }
            info!("calibration handoff server stopped");
        })
        .expect("failed to spawn calibration server thread")
}

fn handle_connection(
    mut stream: TcpStream,
    store: &TrackletStore,
    mapper: &SharedMapper,
) -> Result<()> {
    let document: Calibration = read_document(&mut stream)?;

    let mut state = mapper
        .lock()
        .map_err(|_| anyhow!("mapper lock poisoned"))?;

    let mut calibration = document;
    calibration.tracking_frame = Some(state.dims());
    store.put_calibration(&calibration)?;

    let reloaded = store
        .calibration()?
        .ok_or_else(|| anyhow!("calibration read-back came up empty"))?;
    state.install(reloaded)?;
    let dims = state.dims();
    drop(state);

    let reply = serde_json::json!({"height": dims.height, "width": dims.width});
    stream.write_all(reply.to_string().as_bytes())?;
    Ok(())
}

fn refit_from_store(store: &TrackletStore, mapper: &SharedMapper) {
    let calibration = match store.calibration() {
        Ok(Some(calibration)) => calibration,
        Ok(None) => return,
        Err(err) => {
            warn!("calibration reload failed: {err}");
            return;
        }
    };
    let Ok(mut state) = mapper.lock() else {
        warn!("mapper lock poisoned; skipping refit");
        return;
    };
    if let Err(err) = state.install(calibration) {
        warn!("periodic transform refit failed: {err}");
    } else {
        debug!("transform refit from stored calibration");
    }
}
