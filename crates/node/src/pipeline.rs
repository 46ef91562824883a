//! Pipeline wiring and supervision.
//!
//! Builds the context, enforces the startup mode's calibration
//! requirements, spawns each stage on its own thread, and tears everything
//! down in a fixed order: socket servers, worker threads, store, video
//! source.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, Once,
};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use detector_client::DetectorClient;
use tracing::{error, info, warn};
use tracklet_store::{FrameDims, TrackletStore};

use crate::config::{frame_height, NodeConfig, NodeMode};
use crate::context::PipelineContext;
use crate::detect;
use crate::ingest::{self, IngestConfig};
use crate::mapper::{MapperState, SharedMapper};
use crate::motion::DeltaRegionExtractor;
use crate::sequence;
use crate::servers;
use crate::track::{ObjectTracker, TrackerParams};
use crate::writer;

/// CALIBRATING mode waits this long for a handoff before giving up.
const CALIBRATION_WAIT: Duration = Duration::from_secs(300);

const CALIBRATION_POLL: Duration = Duration::from_millis(500);

pub fn run(config: NodeConfig) -> Result<()> {
    info!("node starting in {:?} mode", config.mode);

    let store = Arc::new(
        TrackletStore::open_with_epoch(&config.store_path, config.epoch).with_context(|| {
            format!("failed to open trajectory store at {}", config.store_path.display())
        })?,
    );

    let tracking_size = (config.tracking_width, frame_height(config.tracking_width));
    let mapper: SharedMapper = Arc::new(Mutex::new(MapperState::new(FrameDims {
        width: tracking_size.0 as u32,
        height: tracking_size.1 as u32,
    })));

    load_calibration(&config, &store, &mapper)?;

    let ctx = PipelineContext::new();
    install_interrupt_handler(ctx.shutdown.clone());

    let calibration_listener = servers::calibration::bind(config.calibration_port)?;
    let calibration_server = servers::calibration::spawn(
        calibration_listener,
        store.clone(),
        mapper.clone(),
        config.mode == NodeMode::Calibrating,
        ctx.shutdown.clone(),
    );

    if config.mode == NodeMode::Calibrating {
        if let Err(err) = wait_for_calibration(&mapper, &ctx.shutdown) {
            ctx.request_shutdown();
            let _ = calibration_server.join();
            return Err(err);
        }
    }

    let capture_size = (config.capture_width, frame_height(config.capture_width));
    let source = video_ingest::spawn_ffmpeg_reader(&config.source_uri, capture_size)
        .with_context(|| format!("failed to start video source {}", config.source_uri))?;

    let client = DetectorClient::new(&config.detector_url)
        .context("failed to build detector client")?;
    let query_listener = servers::query::bind(config.query_port)?;

    let PipelineContext {
        input_tx,
        input_rx,
        output_tx,
        output_rx,
        tracklet_tx,
        tracklet_rx,
        shutdown,
    } = ctx;

    let writer = writer::spawn_writer(store.clone(), tracklet_rx, query_listener, shutdown.clone());

    let tracker = ObjectTracker::new(
        TrackerParams {
            max_disappeared: config.max_disappeared,
            max_distance: config.max_distance,
            score_threshold: config.score_threshold,
        },
        mapper.clone(),
        tracklet_tx,
        Box::new(DeltaRegionExtractor::new(config.tracking_width)),
    );
    let tracking = sequence::spawn_tracking(output_rx, tracker, shutdown.clone());

    let detector = detect::spawn_detector(
        client,
        input_rx,
        output_tx.clone(),
        tracking_size,
        shutdown.clone(),
    );

    let ingest = ingest::spawn_ingest(
        IngestConfig {
            tracking_size,
            detect_interval: config.detect_interval,
        },
        source,
        input_tx,
        output_tx,
        store.clone(),
        mapper,
        shutdown.clone(),
    );

    info!("pipeline running");

    // The ingest stage returning means the stream ended or an interrupt
    // fired. Downstream stages drain behind it as their input channels
    // disconnect; the socket servers stop once the flag is raised.
    let _ = ingest.join();
    let _ = detector.join();
    let _ = tracking.join();
    shutdown.store(true, Ordering::SeqCst);
    let _ = calibration_server.join();
    let _ = writer.join();

    if let Err(err) = store.flush() {
        error!("final store flush failed: {err}");
    }
    info!("pipeline stopped");
    Ok(())
}

/// ONLINE requires a stored calibration and refuses to start without one;
/// CALIBRATING picks up whatever is already there.
fn load_calibration(
    config: &NodeConfig,
    store: &TrackletStore,
    mapper: &SharedMapper,
) -> Result<()> {
    let calibration = store
        .calibration()
        .context("failed to read calibration at startup")?;

    match (calibration, config.mode) {
        (Some(calibration), _) => {
            let mut state = mapper
                .lock()
                .map_err(|_| anyhow::anyhow!("mapper lock poisoned"))?;
            state
                .install(calibration)
                .context("stored calibration failed to fit")?;
            info!("calibration loaded from store");
            Ok(())
        }
        (None, NodeMode::Calibrating) => Ok(()),
        (None, NodeMode::Online) => bail!(
            "no calibration found in {}; run the node with --mode CALIBRATING \
             and complete a calibration handoff before going online",
            config.store_path.display()
        ),
    }
}

fn wait_for_calibration(mapper: &SharedMapper, shutdown: &Arc<AtomicBool>) -> Result<()> {
    info!(
        "waiting up to {}s for a calibration handoff",
        CALIBRATION_WAIT.as_secs()
    );
    let deadline = Instant::now() + CALIBRATION_WAIT;
    loop {
        if shutdown.load(Ordering::Relaxed) {
            bail!("interrupted while waiting for calibration");
        }
        let calibrated = mapper.lock().map(|m| m.is_calibrated()).unwrap_or(false);
        if calibrated {
            info!("calibration received");
            return Ok(());
        }
        if Instant::now() >= deadline {
            bail!(
                "no calibration received within {} minutes; aborting startup",
                CALIBRATION_WAIT.as_secs() / 60
            );
        }
        thread::sleep(CALIBRATION_POLL);
    }
}

fn install_interrupt_handler(shutdown: Arc<AtomicBool>) {
    static HANDLER: Once = Once::new();
    HANDLER.call_once(move || {
        if let Err(err) = ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        }) {
            warn!("failed to install interrupt handler: {err}");
        }
    });
}
