//! CLI configuration for the node binary.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};

/// Capture sources keep the common 16:9 aspect.
const FRAME_ASPECT: f64 = 1080.0 / 1920.0;

pub const DEFAULT_CAPTURE_WIDTH: i32 = 1280;
pub const DEFAULT_TRACKING_WIDTH: i32 = 500;
pub const DEFAULT_CALIBRATION_PORT: u16 = 8765;
pub const DEFAULT_QUERY_PORT: u16 = 8766;
pub const DEFAULT_DETECT_INTERVAL: Duration = Duration::from_secs(3);

const USAGE: &str = "Usage: tracklet-node --source <uri> --detector-url <url> \
[--mode ONLINE|CALIBRATING] [--store <path>] [--epoch <0-255>] \
[--capture-width <px>] [--tracking-width <px>] \
[--calibration-port <port>] [--query-port <port>] \
[--detect-interval-secs <n>] [--max-disappeared <n>] \
[--max-distance <px>] [--score-threshold <0.0-1.0>]";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeMode {
    /// Requires an existing calibration; refuses to start without one.
    Online,
    /// Starts the handoff server and waits for a calibration to arrive.
    Calibrating,
}

#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub mode: NodeMode,
    pub source_uri: String,
    pub detector_url: String,
    pub store_path: PathBuf,
    pub epoch: u8,
    pub capture_width: i32,
    pub tracking_width: i32,
    pub calibration_port: u16,
    pub query_port: u16,
    pub detect_interval: Duration,
    pub max_disappeared: u32,
    pub max_distance: f32,
    pub score_threshold: f32,
}

/// Frame height for a given width at the capture aspect ratio.
pub fn frame_height(width: i32) -> i32 {
    (width as f64 * FRAME_ASPECT) as i32
}

impl NodeConfig {
    pub fn from_args(args: &[String]) -> Result<Self> {
        let mut mode = NodeMode::Online;
        let mut source_uri: Option<String> = None;
        let mut detector_url: Option<String> = None;
        let mut store_path: Option<PathBuf> = None;
        let mut epoch: u8 = 0;
        let mut capture_width = DEFAULT_CAPTURE_WIDTH;
        let mut tracking_width = DEFAULT_TRACKING_WIDTH;
        let mut calibration_port = DEFAULT_CALIBRATION_PORT;
        let mut query_port = DEFAULT_QUERY_PORT;
        let mut detect_interval = DEFAULT_DETECT_INTERVAL;
        let mut max_disappeared: u32 = 10;
        let mut max_distance: Option<f32> = None;
        let mut score_threshold: f32 = 0.5;

        let mut idx = 1;
        while idx < args.len() {
            let flag = args[idx].as_str();
            let mut value = |name: &str| -> Result<String> {
                idx += 1;
                args.get(idx)
                    .cloned()
                    .ok_or_else(|| anyhow!("{name} requires a value\n\n{USAGE}"))
            };
            match flag {
                "--mode" => {
                    mode = match value("--mode")?.to_ascii_uppercase().as_str() {
                        "ONLINE" => NodeMode::Online,
                        "CALIBRATING" => NodeMode::Calibrating,
                        other => bail!("unknown mode {other:?}; expected ONLINE or CALIBRATING"),
                    };
                }
                "--source" => source_uri = Some(value("--source")?),
                "--detector-url" => detector_url = Some(value("--detector-url")?),
                "--store" => store_path = Some(PathBuf::from(value("--store")?)),
                "--epoch" => {
                    epoch = value("--epoch")?
                        .parse()
                        .with_context(|| "--epoch must be an integer in 0..=255")?;
                }
                "--capture-width" => {
                    capture_width = parse_positive(&value("--capture-width")?, "--capture-width")?;
                }
                "--tracking-width" => {
                    tracking_width =
                        parse_positive(&value("--tracking-width")?, "--tracking-width")?;
                }
                "--calibration-port" => {
                    calibration_port = value("--calibration-port")?
                        .parse()
                        .with_context(|| "--calibration-port must be a port number")?;
                }
                "--query-port" => {
                    query_port = value("--query-port")?
                        .parse()
                        .with_context(|| "--query-port must be a port number")?;
                }
                "--detect-interval-secs" => {
                    let secs: u64 = value("--detect-interval-secs")?
                        .parse()
                        .with_context(|| "--detect-interval-secs must be an integer")?;
                    detect_interval = Duration::from_secs(secs);
                }
                "--max-disappeared" => {
                    max_disappeared = value("--max-disappeared")?
                        .parse()
                        .with_context(|| "--max-disappeared must be an integer")?;
                }
                "--max-distance" => {
                    max_distance = Some(
                        value("--max-distance")?
                            .parse()
                            .with_context(|| "--max-distance must be a number of pixels")?,
                    );
                }
                "--score-threshold" => {
                    let threshold: f32 = value("--score-threshold")?
                        .parse()
                        .with_context(|| "--score-threshold must be a number")?;
                    if !(0.0..=1.0).contains(&threshold) {
                        bail!("--score-threshold must be between 0.0 and 1.0");
                    }
                    score_threshold = threshold;
                }
                other => bail!("unrecognised flag: {other}\n\n{USAGE}"),
            }
            idx += 1;
        }

        let source_uri = source_uri.ok_or_else(|| anyhow!("missing --source <uri>\n\n{USAGE}"))?;
        let detector_url =
            detector_url.ok_or_else(|| anyhow!("missing --detector-url <url>\n\n{USAGE}"))?;
        if tracking_width > capture_width {
            bail!("--tracking-width must not exceed --capture-width");
        }

        let store_path = store_path.unwrap_or_else(|| match mode {
            NodeMode::Online => PathBuf::from("/tmp/tracklets_db"),
            NodeMode::Calibrating => PathBuf::from("/tmp/tracklets_calibration_db"),
        });
        let max_distance = max_distance.unwrap_or(tracking_width as f32 / 20.0);

        Ok(Self {
            mode,
            source_uri,
            detector_url,
            store_path,
            epoch,
            capture_width,
            tracking_width,
            calibration_port,
            query_port,
            detect_interval,
            max_disappeared,
            max_distance,
            score_threshold,
        })
    }
}

fn parse_positive(raw: &str, name: &str) -> Result<i32> {
    let value: i32 = raw
        .parse()
        .with_context(|| format!("{name} must be a positive integer"))?;
    if value <= 0 {
        bail!("{name} must be a positive integer");
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(rest: &[&str]) -> Vec<String> {
        let mut all = vec!["tracklet-node".to_string()];
        all.extend(rest.iter().map(|s| s.to_string()));
        all
    }

    #[test]
    fn defaults_fill_in() {
        let config = NodeConfig::from_args(&args(&[
            "--source",
            "rtsp://cam/stream",
            "--detector-url",
            "http://detector/run",
        ]))
        .unwrap();
        assert_eq!(config.mode, NodeMode::Online);
        assert_eq!(config.tracking_width, 500);
        assert_eq!(config.calibration_port, 8765);
        assert_eq!(config.query_port, 8766);
        assert!((config.max_distance - 25.0).abs() < f32::EPSILON);
    }

    #[test]
    fn calibrating_mode_uses_scratch_store() {
        let config = NodeConfig::from_args(&args(&[
            "--source",
            "video.mp4",
            "--detector-url",
            "http://detector/run",
            "--mode",
            "calibrating",
        ]))
        .unwrap();
        assert_eq!(config.mode, NodeMode::Calibrating);
        assert_eq!(
            config.store_path,
            PathBuf::from("/tmp/tracklets_calibration_db")
        );
    }

    #[test]
    fn missing_source_is_an_error() {
        let err = NodeConfig::from_args(&args(&["--detector-url", "http://detector/run"]))
            .unwrap_err();
        assert!(err.to_string().contains("--source"));
    }

    #[test]
    fn frame_height_keeps_aspect() {
        assert_eq!(frame_height(1920), 1080);
        assert_eq!(frame_height(500), 281);
    }
}
