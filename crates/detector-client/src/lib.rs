//! Typed client for the remote object-detector service.
//!
//! One call per frame: the frame is JPEG-encoded and POSTed to the service,
//! and the JSON reply is validated into a [`DetectionResult`] at the
//! boundary. The service's output is treated as ground truth for that frame;
//! any transport or schema failure surfaces as a [`DetectorError`] and the
//! caller drops the frame.

use std::{io::Cursor, time::Duration};

use image::{codecs::jpeg::JpegEncoder, ExtendedColorType};
use reqwest::blocking::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use video_ingest::Frame;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const JPEG_QUALITY: u8 = 85;

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("detector request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("detector returned malformed payload: {0}")]
    InvalidResponse(String),
    #[error("failed to encode frame: {0}")]
    Encode(#[from] image::ImageError),
}

/// Detections for one frame, as returned by the service.
///
/// Boxes are normalized `[ymin, xmin, ymax, xmax]` rectangles; the three
/// arrays are index-aligned. Masks are carried opaquely for consumers that
/// want them.
#[derive(Debug, Clone, Deserialize)]
pub struct DetectionResult {
    pub detection_boxes: Vec<[f32; 4]>,
    pub detection_scores: Vec<f32>,
    pub detection_classes: Vec<i32>,
    #[serde(default)]
    pub detection_masks: Option<serde_json::Value>,
}

/// A detection box converted to pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionBox {
    pub x_min: i32,
    pub y_min: i32,
    pub x_max: i32,
    pub y_max: i32,
    pub class_id: i32,
    pub score: f32,
}

#[derive(Deserialize)]
struct DetectionEnvelope {
    prediction_result: DetectionResult,
}

impl DetectionResult {
    fn validate(self) -> Result<Self, DetectorError> {
        let n = self.detection_boxes.len();
        if self.detection_scores.len() != n || self.detection_classes.len() != n {
            return Err(DetectorError::InvalidResponse(format!(
                "misaligned arrays: {} boxes, {} scores, {} classes",
                n,
                self.detection_scores.len(),
                self.detection_classes.len()
            )));
        }
        Ok(self)
    }

    /// Convert normalized boxes above `score_threshold` into pixel
    /// rectangles, dropping exact duplicates (first occurrence wins).
    pub fn pixel_boxes(&self, width: i32, height: i32, score_threshold: f32) -> Vec<DetectionBox> {
        let mut boxes: Vec<DetectionBox> = Vec::new();
        for (idx, norm) in self.detection_boxes.iter().enumerate() {
            if self.detection_scores[idx] < score_threshold {
                continue;
            }
            let [ymin, xmin, ymax, xmax] = *norm;
            let candidate = DetectionBox {
                x_min: (xmin * width as f32) as i32,
                y_min: (ymin * height as f32) as i32,
                x_max: (xmax * width as f32) as i32,
                y_max: (ymax * height as f32) as i32,
                class_id: self.detection_classes[idx],
                score: self.detection_scores[idx],
            };
            let duplicate = boxes.iter().any(|b| {
                b.x_min == candidate.x_min
                    && b.y_min == candidate.y_min
                    && b.x_max == candidate.x_max
                    && b.y_max == candidate.y_max
            });
            if !duplicate {
                boxes.push(candidate);
            }
        }
        boxes
    }
}

pub struct DetectorClient {
    client: Client,
    url: String,
}

impl DetectorClient {
    pub fn new(url: impl Into<String>) -> Result<Self, DetectorError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    /// Run one detection round trip for `frame`.
    pub fn detect(&self, frame: &Frame) -> Result<DetectionResult, DetectorError> {
        let jpeg = encode_jpeg(frame)?;
        debug!(
            "posting {}x{} frame ({} bytes) to {}",
            frame.width,
            frame.height,
            jpeg.len(),
            self.url
        );

        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .body(jpeg)
            .send()?
            .error_for_status()?;

        let body = response.text()?;
        let envelope: DetectionEnvelope = serde_json::from_str(&body)
            .map_err(|err| DetectorError::InvalidResponse(err.to_string()))?;
        envelope.prediction_result.validate()
    }
}

/// JPEG-encode a BGR frame for upload.
fn encode_jpeg(frame: &Frame) -> Result<Vec<u8>, DetectorError> {
    let mut rgb = Vec::with_capacity(frame.data.len());
    for px in frame.data.chunks_exact(3) {
        rgb.extend_from_slice(&[px[2], px[1], px[0]]);
    }

    let mut out = Cursor::new(Vec::new());
    let mut encoder = JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY);
    encoder.encode(
        &rgb,
        frame.width as u32,
        frame.height as u32,
        ExtendedColorType::Rgb8,
    )?;
    Ok(out.into_inner())
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::TcpListener,
        thread,
    };

    use video_ingest::FrameFormat;

    use super::*;

    const RESPONSE: &str = r#"{
        "prediction_result": {
            "detection_boxes": [[0.1, 0.1, 0.3, 0.3], [0.1, 0.1, 0.3, 0.3], [0.5, 0.5, 0.9, 0.9]],
            "detection_scores": [0.92, 0.92, 0.2],
            "detection_classes": [3, 3, 1]
        }
    }"#;

    #[test]
    fn parses_detection_envelope() {
        let envelope: DetectionEnvelope = serde_json::from_str(RESPONSE).unwrap();
        let result = envelope.prediction_result.validate().unwrap();
        assert_eq!(result.detection_boxes.len(), 3);
        assert_eq!(result.detection_classes[0], 3);
        assert!(result.detection_masks.is_none());
    }

    #[test]
    fn rejects_misaligned_arrays() {
        let result = DetectionResult {
            detection_boxes: vec![[0.0, 0.0, 1.0, 1.0]],
            detection_scores: vec![0.9, 0.8],
            detection_classes: vec![1],
            detection_masks: None,
        };
        assert!(matches!(
            result.validate(),
            Err(DetectorError::InvalidResponse(_))
        ));
    }

    #[test]
    fn pixel_boxes_scale_filter_and_dedup() {
        let envelope: DetectionEnvelope = serde_json::from_str(RESPONSE).unwrap();
        let result = envelope.prediction_result.validate().unwrap();

        let boxes = result.pixel_boxes(100, 100, 0.5);
        // The duplicate box collapses and the low-score box is filtered.
        assert_eq!(boxes.len(), 1);
        assert_eq!(boxes[0].x_min, 10);
        assert_eq!(boxes[0].y_min, 10);
        assert_eq!(boxes[0].x_max, 30);
        assert_eq!(boxes[0].y_max, 30);
        assert_eq!(boxes[0].class_id, 3);
    }

    #[test]
    fn detect_round_trip_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();

            // Consume the entire request (headers + declared body) before
            // replying, or closing the socket can clobber the response.
            let mut buf = Vec::new();
            let mut chunk = [0u8; 16 * 1024];
            let mut header_end = None;
            let mut content_length = 0usize;
            loop {
                let n = stream.read(&mut chunk).unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                if header_end.is_none() {
                    if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                        header_end = Some(pos + 4);
                        let headers = String::from_utf8_lossy(&buf[..pos]);
                        content_length = headers
                            .lines()
                            .find_map(|line| {
                                line.to_ascii_lowercase()
                                    .strip_prefix("content-length:")
                                    .map(|v| v.trim().parse().unwrap())
                            })
                            .unwrap_or(0);
                    }
                }
                if let Some(end) = header_end {
                    if buf.len() >= end + content_length {
                        break;
                    }
                }
            }

            let reply = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                RESPONSE.len(),
                RESPONSE
            );
            stream.write_all(reply.as_bytes()).unwrap();
        });

        let frame = Frame {
            data: vec![128u8; 8 * 8 * 3],
            width: 8,
            height: 8,
            timestamp_ms: 0,
            format: FrameFormat::Bgr8,
        };

        let client = DetectorClient::new(format!("http://{addr}/detect")).unwrap();
        let result = client.detect(&frame).unwrap();
        assert_eq!(result.detection_scores.len(), 3);
        server.join().unwrap();
    }
}
