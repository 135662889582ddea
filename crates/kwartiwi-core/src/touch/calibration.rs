//! Affine touch calibration
//!
//! Raw panel coordinates are mapped to screen coordinates with
//!
//! ```text
//! x' = a·x + b·y + c
//! y' = d·x + e·y + f
//! ```
//!
//! The six coefficients are fitted from three or more touched targets with a
//! least-squares (MMSE) solve of the 2×2 normal equations.

use core::cell::Cell;
use core::sync::atomic::{AtomicBool, Ordering};

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

use crate::config::{ConfigError, ConfigStore, keys};

/// Smallest number of points that defines an affine map
pub const MIN_CALIBRATION_POINTS: usize = 3;

/// Size of the persisted blob: six little-endian `f32`s
pub const CALIBRATION_BLOB_LEN: usize = 6 * 4;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CalibrationError {
    #[error("Calibration needs at least 3 non-collinear points")]
    InvalidArgument,
    #[error("Stored calibration blob is malformed")]
    InvalidBlob,
    #[error("Config store error: {0}")]
    Store(ConfigError),
}

impl From<ConfigError> for CalibrationError {
    fn from(e: ConfigError) -> Self {
        Self::Store(e)
    }
}

/// One touched target: where the panel reported it and where it was drawn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationPoint {
    pub raw: (u16, u16),
    pub target: (u16, u16),
}

impl CalibrationPoint {
    pub const fn new(raw: (u16, u16), target: (u16, u16)) -> Self {
        Self { raw, target }
    }
}

/// Coefficients `[a, b, c, d, e, f]` of the affine map
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationMatrix {
    pub coefficients: [f32; 6],
}

impl CalibrationMatrix {
    /// Raw values pass through unscaled
    pub const IDENTITY: Self = Self {
        coefficients: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
    };

    /// Map a raw pair to screen coordinates, rounded and clamped to `u16`
    pub fn apply(&self, x: u16, y: u16) -> (u16, u16) {
        let [a, b, c, d, e, f] = self.coefficients;
        let (x, y) = (x as f32, y as f32);
        (to_coordinate(a * x + b * y + c), to_coordinate(d * x + e * y + f))
    }

    /// Least-squares fit over `points`.
    ///
    /// Fails with [`CalibrationError::InvalidArgument`] for fewer than three
    /// points or when the raw points are collinear or coincident.
    pub fn fit(points: &[CalibrationPoint]) -> Result<Self, CalibrationError> {
        if points.len() < MIN_CALIBRATION_POINTS {
            return Err(CalibrationError::InvalidArgument);
        }

        // Integer moments keep the determinant exact, so degenerate point
        // sets give exactly zero.
        let n = points.len() as i128;
        let mut sx = 0i128;
        let mut sy = 0i128;
        let mut sxx = 0i128;
        let mut syy = 0i128;
        let mut sxy = 0i128;
        for p in points {
            let (x, y) = (p.raw.0 as i128, p.raw.1 as i128);
            sx += x;
            sy += y;
            sxx += x * x;
            syy += y * y;
            sxy += x * y;
        }

        // Second moments about the mean, scaled by n²
        let cxx = n * sxx - sx * sx;
        let cyy = n * syy - sy * sy;
        let cxy = n * sxy - sx * sy;
        let det = cxx * cyy - cxy * cxy;
        if det == 0 {
            return Err(CalibrationError::InvalidArgument);
        }

        let solve = |target: fn(&CalibrationPoint) -> u16| -> [f32; 3] {
            let mut su = 0i128;
            let mut sxu = 0i128;
            let mut syu = 0i128;
            for p in points {
                let u = target(p) as i128;
                su += u;
                sxu += p.raw.0 as i128 * u;
                syu += p.raw.1 as i128 * u;
            }
            let cxu = (n * sxu - sx * su) as f64;
            let cyu = (n * syu - sy * su) as f64;
            let det = det as f64;

            // Cramer's rule
            let a = (cxu * cyy as f64 - cxy as f64 * cyu) / det;
            let b = (cxx as f64 * cyu - cxy as f64 * cxu) / det;
            let c = (su as f64 - a * sx as f64 - b * sy as f64) / n as f64;
            [a as f32, b as f32, c as f32]
        };

        let [a, b, c] = solve(|p| p.target.0);
        let [d, e, f] = solve(|p| p.target.1);
        Ok(Self {
            coefficients: [a, b, c, d, e, f],
        })
    }
}

impl Default for CalibrationMatrix {
    fn default() -> Self {
        Self::IDENTITY
    }
}

fn to_coordinate(v: f32) -> u16 {
    // `as` saturates, so negatives clamp to 0
    (v + 0.5) as u16
}

/// The active calibration, guarded by its own lock
pub struct TouchCalibration {
    matrix: Mutex<CriticalSectionRawMutex, Cell<CalibrationMatrix>>,
    calibrated: AtomicBool,
}

impl TouchCalibration {
    pub const fn new() -> Self {
        Self {
            matrix: Mutex::new(Cell::new(CalibrationMatrix::IDENTITY)),
            calibrated: AtomicBool::new(false),
        }
    }

    pub fn matrix(&self) -> CalibrationMatrix {
        self.matrix.lock(|m| m.get())
    }

    /// Whether the matrix came from a calibration run or a stored blob
    pub fn is_calibrated(&self) -> bool {
        self.calibrated.load(Ordering::Acquire)
    }

    /// Fit and install a new matrix. On error the current one is kept.
    pub fn calibrate(&self, points: &[CalibrationPoint]) -> Result<(), CalibrationError> {
        let matrix = CalibrationMatrix::fit(points).inspect_err(|_| {
            warn!("Calibration rejected ({} points)", points.len());
        })?;
        self.install(matrix);
        info!("Touch calibrated: {:?}", matrix.coefficients);
        Ok(())
    }

    /// Write the current matrix to the config store and commit
    pub fn persist<S: ConfigStore + ?Sized>(&self, store: &mut S) -> Result<(), CalibrationError> {
        let blob = postcard::to_allocvec(&self.matrix()).map_err(|_| CalibrationError::InvalidBlob)?;
        store.set(keys::TOUCH, keys::CALIBRATION, &blob)?;
        store.commit()?;
        Ok(())
    }

    /// Load a stored matrix; without one the identity stays in place
    pub fn load<S: ConfigStore + ?Sized>(&self, store: &mut S) -> Result<(), CalibrationError> {
        let Some(blob) = store.get(keys::TOUCH, keys::CALIBRATION)? else {
            info!("No touch calibration stored, using raw coordinates");
            return Ok(());
        };
        if blob.len() != CALIBRATION_BLOB_LEN {
            return Err(CalibrationError::InvalidBlob);
        }
        let matrix: CalibrationMatrix =
            postcard::from_bytes(&blob).map_err(|_| CalibrationError::InvalidBlob)?;
        self.install(matrix);
        Ok(())
    }

    fn install(&self, matrix: CalibrationMatrix) {
        self.matrix.lock(|m| m.set(matrix));
        self.calibrated.store(true, Ordering::Release);
    }
}

impl Default for TouchCalibration {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfigStore;

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-2
    }

    #[test]
    fn test_identity_passthrough() {
        assert_eq!(CalibrationMatrix::IDENTITY.apply(123, 4000), (123, 4000));
        assert_eq!(CalibrationMatrix::default(), CalibrationMatrix::IDENTITY);
    }

    #[test]
    fn test_apply_clamps() {
        let matrix = CalibrationMatrix {
            coefficients: [1.0, 0.0, -500.0, 0.0, 100.0, 0.0],
        };
        assert_eq!(matrix.apply(100, 4000), (0, u16::MAX));
    }

    #[test]
    fn test_fit_recovers_known_map() {
        // x' = 0.08x - 0.01y + 12, y' = 0.002x + 0.06y - 5
        let map = |x: f32, y: f32| (0.08 * x - 0.01 * y + 12.0, 0.002 * x + 0.06 * y - 5.0);
        let raws = [(300u16, 400u16), (3700, 500), (2000, 3500), (600, 3000), (3300, 3300)];
        let points: Vec<_> = raws
            .iter()
            .map(|&(x, y)| {
                let (tx, ty) = map(x as f32, y as f32);
                CalibrationPoint::new((x, y), (tx.round() as u16, ty.round() as u16))
            })
            .collect();

        let matrix = CalibrationMatrix::fit(&points).unwrap();
        let [a, b, _, d, e, _] = matrix.coefficients;
        // Targets were rounded, so the slopes only come back approximately
        assert!((a - 0.08).abs() < 1e-3);
        assert!((b + 0.01).abs() < 1e-3);
        assert!((d - 0.002).abs() < 1e-3);
        assert!((e - 0.06).abs() < 1e-3);

        for p in &points {
            let (x, y) = matrix.apply(p.raw.0, p.raw.1);
            assert!(x.abs_diff(p.target.0) <= 2);
            assert!(y.abs_diff(p.target.1) <= 2);
        }
    }

    #[test]
    fn test_three_points_fit_exactly() {
        let points = [
            CalibrationPoint::new((200, 300), (10, 20)),
            CalibrationPoint::new((3800, 400), (310, 25)),
            CalibrationPoint::new((1000, 3600), (80, 230)),
        ];
        let matrix = CalibrationMatrix::fit(&points).unwrap();
        let [a, b, c, d, e, f] = matrix.coefficients;

        for p in &points {
            let (x, y) = (p.raw.0 as f32, p.raw.1 as f32);
            assert!(close(a * x + b * y + c, p.target.0 as f32));
            assert!(close(d * x + e * y + f, p.target.1 as f32));
        }
    }

    #[test]
    fn test_too_few_points() {
        let points = [
            CalibrationPoint::new((200, 300), (10, 20)),
            CalibrationPoint::new((3800, 400), (310, 25)),
        ];
        assert_eq!(
            CalibrationMatrix::fit(&points),
            Err(CalibrationError::InvalidArgument)
        );
    }

    #[test]
    fn test_collinear_points_keep_previous_matrix() {
        let calibration = TouchCalibration::new();
        let good = [
            CalibrationPoint::new((200, 300), (10, 20)),
            CalibrationPoint::new((3800, 400), (310, 25)),
            CalibrationPoint::new((1000, 3600), (80, 230)),
        ];
        calibration.calibrate(&good).unwrap();
        let before = calibration.matrix();

        let collinear = [
            CalibrationPoint::new((100, 100), (0, 0)),
            CalibrationPoint::new((200, 200), (10, 10)),
            CalibrationPoint::new((300, 300), (20, 20)),
            CalibrationPoint::new((400, 400), (30, 30)),
        ];
        assert_eq!(
            calibration.calibrate(&collinear),
            Err(CalibrationError::InvalidArgument)
        );
        assert_eq!(calibration.matrix(), before);
    }

    #[test]
    fn test_coincident_points_rejected() {
        let same = [CalibrationPoint::new((500, 500), (40, 40)); 5];
        assert_eq!(
            CalibrationMatrix::fit(&same),
            Err(CalibrationError::InvalidArgument)
        );
    }

    #[test]
    fn test_load_without_blob_keeps_identity() {
        let calibration = TouchCalibration::new();
        let mut store = MemoryConfigStore::new();

        calibration.load(&mut store).unwrap();
        assert_eq!(calibration.matrix(), CalibrationMatrix::IDENTITY);
        assert!(!calibration.is_calibrated());
    }

    #[test]
    fn test_persist_then_load() {
        let mut store = MemoryConfigStore::new();
        let source = TouchCalibration::new();
        source
            .calibrate(&[
                CalibrationPoint::new((200, 300), (10, 20)),
                CalibrationPoint::new((3800, 400), (310, 25)),
                CalibrationPoint::new((1000, 3600), (80, 230)),
            ])
            .unwrap();
        source.persist(&mut store).unwrap();

        let blob = store.get(keys::TOUCH, keys::CALIBRATION).unwrap().unwrap();
        assert_eq!(blob.len(), CALIBRATION_BLOB_LEN);

        let restored = TouchCalibration::new();
        restored.load(&mut store).unwrap();
        assert_eq!(restored.matrix(), source.matrix());
        assert!(restored.is_calibrated());
    }

    #[test]
    fn test_truncated_blob_rejected() {
        let mut store = MemoryConfigStore::new();
        store.set(keys::TOUCH, keys::CALIBRATION, &[0u8; 10]).unwrap();

        let calibration = TouchCalibration::new();
        assert_eq!(
            calibration.load(&mut store),
            Err(CalibrationError::InvalidBlob)
        );
        assert_eq!(calibration.matrix(), CalibrationMatrix::IDENTITY);
    }
}
