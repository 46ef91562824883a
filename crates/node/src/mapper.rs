//! Pixel → geographic coordinate transform.
//!
//! The transform is a least-squares linear fit between the four calibration
//! corners and fixed pixel anchors on the tracking frame. The top half of
//! the frame is excluded from the fit: wide-angle setups distort badly near
//! the horizon, so the `ul`/`ur` corners anchor at mid-frame height. The
//! producing map tool walks the frame boundary `ul → ur → ll → lr`, which
//! pairs `ll` with pixel `(w, h)` and `lr` with `(0, h)`.

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use nalgebra::{DMatrix, Matrix3};
use tracklet_store::{Calibration, Corners, FrameDims, GeoPoint};

pub type SharedMapper = Arc<Mutex<MapperState>>;

/// Fitted affine transform from tracking-frame pixels to lng/lat.
#[derive(Clone, Debug)]
pub struct PixelToGeo {
    a: Matrix3<f64>,
}

impl PixelToGeo {
    /// Solve the padded least-squares problem `X · A = Y` for the corner
    /// correspondence at the given frame dimensions.
    pub fn fit(corners: &Corners, dims: FrameDims) -> Result<Self> {
        let w = dims.width as f64;
        let h = dims.height as f64;
        let pixels = [[0.0, h / 2.0], [w, h / 2.0], [w, h], [0.0, h]];
        let geo = [corners.ul, corners.ur, corners.ll, corners.lr];

        let mut x = DMatrix::zeros(4, 3);
        let mut y = DMatrix::zeros(4, 3);
        for i in 0..4 {
            x[(i, 0)] = pixels[i][0];
            x[(i, 1)] = pixels[i][1];
            x[(i, 2)] = 1.0;
            y[(i, 0)] = geo[i].lng;
            y[(i, 1)] = geo[i].lat;
            y[(i, 2)] = 1.0;
        }

        let svd = x.svd(true, true);
        let a = svd
            .solve(&y, 1e-12)
            .map_err(|err| anyhow!("coordinate transform fit failed: {err}"))?;
        Ok(Self {
            a: Matrix3::from_fn(|i, j| a[(i, j)]),
        })
    }

    /// O(1) application of the fitted transform.
    pub fn coord(&self, x: f64, y: f64) -> GeoPoint {
        GeoPoint {
            lng: x * self.a[(0, 0)] + y * self.a[(1, 0)] + self.a[(2, 0)],
            lat: x * self.a[(0, 1)] + y * self.a[(1, 1)] + self.a[(2, 1)],
        }
    }
}

/// Calibration state shared between the tracker, the handoff server, and the
/// ingest stage. Reading the calibration and refitting the transform happen
/// under one lock so a concurrent handoff cannot interleave.
pub struct MapperState {
    dims: FrameDims,
    calibration: Option<Calibration>,
    transform: Option<PixelToGeo>,
}

impl MapperState {
    pub fn new(dims: FrameDims) -> Self {
        Self {
            dims,
            calibration: None,
            transform: None,
        }
    }

    pub fn dims(&self) -> FrameDims {
        self.dims
    }

    /// Record the actual tracking-frame dimensions and refit against them.
    pub fn set_dims(&mut self, dims: FrameDims) -> Result<()> {
        self.dims = dims;
        if let Some(calibration) = self.calibration.as_mut() {
            calibration.tracking_frame = Some(dims);
        }
        self.refit()
    }

    /// Install a calibration document and fit the transform.
    pub fn install(&mut self, mut calibration: Calibration) -> Result<()> {
        if let Some(dims) = calibration.tracking_frame {
            self.dims = dims;
        } else {
            calibration.tracking_frame = Some(self.dims);
        }
        self.calibration = Some(calibration);
        self.refit()
    }

    /// Refit the transform from the current calibration, if any.
    pub fn refit(&mut self) -> Result<()> {
        if let Some(calibration) = &self.calibration {
            let fitted = PixelToGeo::fit(&calibration.homography_points.corners, self.dims)?;
            self.transform = Some(fitted);
        }
        Ok(())
    }

    pub fn is_calibrated(&self) -> bool {
        self.transform.is_some()
    }

    pub fn calibration(&self) -> Option<&Calibration> {
        self.calibration.as_ref()
    }

    /// Map a pixel coordinate; identity-at-origin fallback before the first
    /// fit (startup gating makes that unreachable in a running pipeline).
    pub fn coord(&self, x: f64, y: f64) -> GeoPoint {
        match &self.transform {
            Some(transform) => transform.coord(x, y),
            None => GeoPoint::default(),
        }
    }
}
