//! Candidate regions for frames that arrive without detector output.
//!
//! The tracker only consumes a list of rectangles; where they come from is
//! pluggable through [`RegionSource`]. The shipped implementation keeps a
//! running-average luma background model, thresholds the per-pixel delta,
//! and clusters the changed pixels into bounding boxes.

use video_ingest::Frame;

use crate::track::PixelRect;

pub trait RegionSource: Send {
    /// Candidate rectangles for this frame, in pixel coordinates.
    fn regions(&mut self, frame: &Frame) -> Vec<PixelRect>;
}

/// Frame-differencing extractor tuned by the tracking-frame width.
pub struct DeltaRegionExtractor {
    background: Option<Vec<f32>>,
    dims: (i32, i32),
    delta_threshold: f32,
    min_area: usize,
}

impl DeltaRegionExtractor {
    pub fn new(tracking_width: i32) -> Self {
        Self {
            background: None,
            dims: (0, 0),
            delta_threshold: (tracking_width / 125).max(1) as f32,
            min_area: (tracking_width / 25).max(1) as usize,
        }
    }
}

impl RegionSource for DeltaRegionExtractor {
    fn regions(&mut self, frame: &Frame) -> Vec<PixelRect> {
        let luma = frame.luma();
        let dims = (frame.width, frame.height);

        if self.dims != dims || self.background.is_none() {
            self.dims = dims;
            self.background = Some(luma.iter().map(|&v| v as f32).collect());
            return Vec::new();
        }
        let Some(background) = self.background.as_mut() else {
            return Vec::new();
        };

        let width = frame.width as usize;
        let height = frame.height as usize;
        let mut mask = vec![false; width * height];
        for (idx, &value) in luma.iter().enumerate() {
            let avg = &mut background[idx];
            *avg = 0.5 * *avg + 0.5 * value as f32;
            mask[idx] = (value as f32 - *avg).abs() > self.delta_threshold;
        }

        cluster(&mask, width, height, self.min_area)
    }
}

/// Flood-fill connected changed pixels (4-neighborhood) into bounding boxes,
/// dropping components smaller than `min_area` pixels.
fn cluster(mask: &[bool], width: usize, height: usize, min_area: usize) -> Vec<PixelRect> {
    let mut visited = vec![false; mask.len()];
    let mut stack = Vec::new();
    let mut regions = Vec::new();

    for start in 0..mask.len() {
        if !mask[start] || visited[start] {
            continue;
        }

        let (mut x_min, mut y_min) = (width, height);
        let (mut x_max, mut y_max) = (0usize, 0usize);
        let mut area = 0usize;

        visited[start] = true;
        stack.push(start);
        while let Some(idx) = stack.pop() {
            let (x, y) = (idx % width, idx / width);
            x_min = x_min.min(x);
            y_min = y_min.min(y);
            x_max = x_max.max(x);
            y_max = y_max.max(y);
            area += 1;

            let neighbors = [
                (x > 0).then(|| idx - 1),
                (x + 1 < width).then(|| idx + 1),
                (y > 0).then(|| idx - width),
                (y + 1 < height).then(|| idx + width),
            ];
            for neighbor in neighbors.into_iter().flatten() {
                if mask[neighbor] && !visited[neighbor] {
                    visited[neighbor] = true;
                    stack.push(neighbor);
                }
            }
        }

        if area >= min_area {
            regions.push(PixelRect {
                x_min: x_min as i32,
                y_min: y_min as i32,
                x_max: (x_max + 1) as i32,
                y_max: (y_max + 1) as i32,
            });
        }
    }

    regions
}
