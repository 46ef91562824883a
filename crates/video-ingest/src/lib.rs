//! Frame acquisition for the tracking pipeline.
//!
//! The node never touches capture hardware directly: an ffmpeg subprocess
//! decodes whatever the source URI points at (file, RTSP stream, or V4L
//! device) into raw BGR frames on its stdout, and a background thread
//! forwards them over a small bounded channel. The buffer is intentionally
//! tiny to backpressure the decoder when downstream consumers fall behind.

use std::{
    io::Read,
    process::{Child, Command, Stdio},
    thread,
};

use anyhow::anyhow;
use chrono::Utc;
use crossbeam_channel::{bounded, Receiver, Sender};
use thiserror::Error;
use tracing::debug;

/// Raw frame captured from a video source.
#[derive(Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: i32,
    pub height: i32,
    pub timestamp_ms: i64,
    pub format: FrameFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Bgr8,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open { uri: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Frame {
    /// Nearest-neighbor downscale to the given dimensions.
    pub fn resized(&self, width: i32, height: i32) -> Frame {
        if width == self.width && height == self.height {
            return self.clone();
        }

        let (sw, sh) = (self.width as usize, self.height as usize);
        let (dw, dh) = (width.max(1) as usize, height.max(1) as usize);
        let mut data = Vec::with_capacity(dw * dh * 3);
        for dy in 0..dh {
            let sy = (dy * sh / dh).min(sh.saturating_sub(1));
            for dx in 0..dw {
                let sx = (dx * sw / dw).min(sw.saturating_sub(1));
                let off = (sy * sw + sx) * 3;
                data.extend_from_slice(&self.data[off..off + 3]);
            }
        }

        Frame {
            data,
            width: dw as i32,
            height: dh as i32,
            timestamp_ms: self.timestamp_ms,
            format: self.format,
        }
    }

    /// Per-pixel luma (BT.601 weights), one byte per pixel.
    pub fn luma(&self) -> Vec<u8> {
        self.data
            .chunks_exact(3)
            .map(|px| {
                let (b, g, r) = (px[0] as f32, px[1] as f32, px[2] as f32);
                (0.114 * b + 0.587 * g + 0.299 * r) as u8
            })
            .collect()
    }
}

/// Spawns an ffmpeg subprocess decoding `uri` into raw BGR frames at
/// `target_size` and a background thread that forwards them over the
/// returned [`Receiver`]. The channel disconnects when the source ends.
pub fn spawn_ffmpeg_reader(
    uri: &str,
    target_size: (i32, i32),
) -> Result<Receiver<Result<Frame, CaptureError>>, CaptureError> {
    let (tx, rx) = bounded(2);
    let scale_arg = format!("scale={}:{}", target_size.0, target_size.1);

    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-hide_banner")
        .arg("-loglevel")
        .arg("error")
        .stderr(Stdio::inherit());

    if uri.starts_with("/dev/video") {
        cmd.arg("-f").arg("video4linux2");
    }

    cmd.arg("-i")
        .arg(uri)
        .arg("-vf")
        .arg(&scale_arg)
        .arg("-pix_fmt")
        .arg("bgr24")
        .arg("-f")
        .arg("rawvideo")
        .arg("-")
        .stdout(Stdio::piped());

    let mut child = cmd.spawn().map_err(|_| CaptureError::Open {
        uri: uri.to_string(),
    })?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| CaptureError::Other(anyhow!("failed to capture ffmpeg stdout")))?;

    let uri = uri.to_string();
    thread::Builder::new()
        .name("video-ingest".into())
        .spawn(move || read_loop(stdout, child, &uri, target_size, tx))
        .map_err(|err| CaptureError::Other(err.into()))?;

    Ok(rx)
}

fn read_loop(
    mut stdout: impl Read,
    mut child: Child,
    uri: &str,
    target_size: (i32, i32),
    tx: Sender<Result<Frame, CaptureError>>,
) {
    let frame_bytes = (target_size.0 as usize) * (target_size.1 as usize) * 3;
    let mut buffer = vec![0u8; frame_bytes];

    loop {
        match stdout.read_exact(&mut buffer) {
            Ok(()) => {
                let timestamp_ms = Utc::now().timestamp_millis();
                if tx
                    .send(Ok(Frame {
                        data: buffer.clone(),
                        width: target_size.0,
                        height: target_size.1,
                        timestamp_ms,
                        format: FrameFormat::Bgr8,
                    }))
                    .is_err()
                {
                    break;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("video source {uri} ended");
                break;
            }
            Err(err) => {
                let _ = tx.send(Err(CaptureError::Other(err.into())));
                break;
            }
        }
    }

    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_2x2() -> Frame {
        // Pixels: blue, green, red, white (BGR byte order).
        Frame {
            data: vec![
                255, 0, 0, 0, 255, 0, //
                0, 0, 255, 255, 255, 255,
            ],
            width: 2,
            height: 2,
            timestamp_ms: 1_000,
            format: FrameFormat::Bgr8,
        }
    }

    #[test]
    fn resized_picks_nearest_source_pixel() {
        let small = frame_2x2().resized(1, 1);
        assert_eq!(small.width, 1);
        assert_eq!(small.height, 1);
        assert_eq!(small.data, vec![255, 0, 0]);
        assert_eq!(small.timestamp_ms, 1_000);
    }

    #[test]
    fn resized_same_size_is_identity() {
        let frame = frame_2x2();
        let same = frame.resized(2, 2);
        assert_eq!(same.data, frame.data);
    }

    #[test]
    fn luma_weights_channels() {
        let luma = frame_2x2().luma();
        assert_eq!(luma.len(), 4);
        // Pure blue is the darkest channel, white the brightest.
        assert!(luma[0] < luma[1]);
        assert!(luma[1] < luma[3]);
        assert!(luma[3] >= 254);
    }
}
