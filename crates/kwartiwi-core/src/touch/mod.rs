//! TSC2046 resistive touch panel acquisition
//!
//! The controller is polled over SPI. Every [`Tsc2046::read`] first measures
//! the touch pressure and only samples the coordinates when the panel is
//! actually pressed. Raw readings are mapped to screen coordinates with the
//! affine [`CalibrationMatrix`] held by [`TouchCalibration`].

mod calibration;

pub use calibration::*;

use embedded_hal::spi::SpiDevice;

use crate::config::ConfigStore;

// =============================================================================
// Control bytes
// =============================================================================

// Differential reference, 12-bit conversion, PD1 = PD0 = 1 (always powered)

/// Measure Y position
pub const CMD_READ_Y: u8 = 0b1001_0011;
/// Measure X position
pub const CMD_READ_X: u8 = 0b1101_0011;
/// Measure pressure Z1
pub const CMD_READ_Z1: u8 = 0b1011_0011;
/// Measure pressure Z2
pub const CMD_READ_Z2: u8 = 0b1100_0011;

// =============================================================================
// Acquisition parameters
// =============================================================================

/// Largest 12-bit conversion result
pub const MAX_VALUE: u16 = 4095;

/// Pressure margin below which the panel counts as released
pub const Z_THRESHOLD: u16 = 100;

/// Coordinate samples averaged per read, after the discarded settling sample
pub const AVERAGED_SAMPLES: usize = 3;

const PRESSURE_FRAME_LEN: usize = 5;
const COORDINATE_FRAME_LEN: usize = 4 * (AVERAGED_SAMPLES + 1) + 1;

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchState {
    Released,
    Pressed,
}

/// One acquisition result. Released samples always report (0, 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TouchSample {
    pub x: u16,
    pub y: u16,
    pub state: TouchState,
}

impl TouchSample {
    pub const RELEASED: Self = Self {
        x: 0,
        y: 0,
        state: TouchState::Released,
    };

    pub fn is_pressed(&self) -> bool {
        self.state == TouchState::Pressed
    }
}

/// Errors that can occur during TSC2046 operations
#[derive(Debug)]
pub enum Error<E> {
    /// SPI communication error
    Spi(E),
}

impl<E> From<E> for Error<E> {
    fn from(e: E) -> Self {
        Self::Spi(e)
    }
}

// =============================================================================
// Driver Implementation
// =============================================================================

/// TSC2046 touch controller driver on a blocking SPI device (mode 0)
pub struct Tsc2046<SPI> {
    spi: SPI,
    calibration: TouchCalibration,
}

impl<SPI> Tsc2046<SPI>
where
    SPI: SpiDevice,
{
    /// Create a driver using the identity calibration
    pub fn new(spi: SPI) -> Self {
        Self {
            spi,
            calibration: TouchCalibration::new(),
        }
    }

    /// Sample the panel.
    ///
    /// With `raw` set the averaged, orientation-corrected ADC values are
    /// returned; otherwise they are mapped through the calibration matrix.
    pub fn read(&mut self, raw: bool) -> Result<TouchSample, Error<SPI::Error>> {
        let (z1, z2) = self.read_pressure()?;
        if z1 < Z_THRESHOLD || z2 > MAX_VALUE - Z_THRESHOLD {
            return Ok(TouchSample::RELEASED);
        }

        let (x, y) = self.read_position()?;
        let (x, y) = if raw {
            (x, y)
        } else {
            self.calibration.matrix().apply(x, y)
        };

        Ok(TouchSample {
            x,
            y,
            state: TouchState::Pressed,
        })
    }

    /// Calibration state shared with the calibration flow
    pub fn calibration(&self) -> &TouchCalibration {
        &self.calibration
    }

    pub fn is_calibrated(&self) -> bool {
        self.calibration.is_calibrated()
    }

    pub fn matrix(&self) -> CalibrationMatrix {
        self.calibration.matrix()
    }

    pub fn calibrate(&self, points: &[CalibrationPoint]) -> Result<(), CalibrationError> {
        self.calibration.calibrate(points)
    }

    pub fn persist_calibration<S: ConfigStore + ?Sized>(
        &self,
        store: &mut S,
    ) -> Result<(), CalibrationError> {
        self.calibration.persist(store)
    }

    pub fn load_calibration<S: ConfigStore + ?Sized>(
        &self,
        store: &mut S,
    ) -> Result<(), CalibrationError> {
        self.calibration.load(store)
    }

    pub fn release(self) -> SPI {
        self.spi
    }

    // =========================================================================
    // Private SPI Helper Methods
    // =========================================================================

    /// Z1 and Z2 in one transfer; Z2's command overlaps Z1's last result byte
    fn read_pressure(&mut self) -> Result<(u16, u16), Error<SPI::Error>> {
        let tx = [CMD_READ_Z1, 0, CMD_READ_Z2, 0, 0];
        let mut rx = [0u8; PRESSURE_FRAME_LEN];
        self.spi.transfer(&mut rx, &tx)?;
        Ok((conversion(&rx, 1), conversion(&rx, 3)))
    }

    /// Averaged X/Y, each axis inverted for the panel's mounting orientation
    fn read_position(&mut self) -> Result<(u16, u16), Error<SPI::Error>> {
        let mut tx = [0u8; COORDINATE_FRAME_LEN];
        for group in tx.chunks_exact_mut(4) {
            group[0] = CMD_READ_X;
            group[2] = CMD_READ_Y;
        }
        let mut rx = [0u8; COORDINATE_FRAME_LEN];
        self.spi.transfer(&mut rx, &tx)?;

        // Sample 0 is a settling artifact
        let (mut sum_x, mut sum_y) = (0u32, 0u32);
        for sample in 1..=AVERAGED_SAMPLES {
            sum_x += conversion(&rx, 1 + 4 * sample) as u32;
            sum_y += conversion(&rx, 3 + 4 * sample) as u32;
        }
        let x = (sum_x / AVERAGED_SAMPLES as u32) as u16;
        let y = (sum_y / AVERAGED_SAMPLES as u32) as u16;

        Ok((MAX_VALUE - x.min(MAX_VALUE), MAX_VALUE - y.min(MAX_VALUE)))
    }
}

/// 12-bit result clocked out MSB first over two bytes, starting at `at`
fn conversion(rx: &[u8], at: usize) -> u16 {
    (((rx[at] as u16) << 8) | rx[at + 1] as u16) >> 3
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_hal::spi::{ErrorKind, ErrorType, Operation};
    use std::collections::VecDeque;

    #[derive(Debug)]
    struct BusFault;

    impl embedded_hal::spi::Error for BusFault {
        fn kind(&self) -> ErrorKind {
            ErrorKind::Other
        }
    }

    /// Replays canned receive frames and records what was sent
    #[derive(Default)]
    struct ScriptedSpi {
        responses: VecDeque<Vec<u8>>,
        sent: Vec<Vec<u8>>,
        fail: bool,
    }

    impl ErrorType for ScriptedSpi {
        type Error = BusFault;
    }

    impl SpiDevice for ScriptedSpi {
        fn transaction(&mut self, operations: &mut [Operation<'_, u8>]) -> Result<(), BusFault> {
            if self.fail {
                return Err(BusFault);
            }
            for op in operations {
                if let Operation::Transfer(read, write) = op {
                    self.sent.push(write.to_vec());
                    let response = self.responses.pop_front().expect("unexpected transfer");
                    read.copy_from_slice(&response[..read.len()]);
                }
            }
            Ok(())
        }
    }

    fn encode(value: u16) -> [u8; 2] {
        let shifted = value << 3;
        [(shifted >> 8) as u8, shifted as u8]
    }

    fn pressure_frame(z1: u16, z2: u16) -> Vec<u8> {
        let mut frame = vec![0u8; PRESSURE_FRAME_LEN];
        frame[1..3].copy_from_slice(&encode(z1));
        frame[3..5].copy_from_slice(&encode(z2));
        frame
    }

    /// Four (x, y) bus samples; the first one is the settling sample
    fn coordinate_frame(samples: [(u16, u16); 4]) -> Vec<u8> {
        let mut frame = vec![0u8; COORDINATE_FRAME_LEN];
        for (i, (x, y)) in samples.iter().enumerate() {
            frame[1 + 4 * i..3 + 4 * i].copy_from_slice(&encode(*x));
            frame[3 + 4 * i..5 + 4 * i].copy_from_slice(&encode(*y));
        }
        frame
    }

    fn pressed_with(raw_x: u16, raw_y: u16) -> ScriptedSpi {
        let bus_x = MAX_VALUE - raw_x;
        let bus_y = MAX_VALUE - raw_y;
        ScriptedSpi {
            responses: VecDeque::from([
                pressure_frame(800, 2000),
                coordinate_frame([
                    (0, 4095),
                    (bus_x - 1, bus_y + 1),
                    (bus_x, bus_y),
                    (bus_x + 1, bus_y - 1),
                ]),
            ]),
            ..Default::default()
        }
    }

    #[test]
    fn test_released_when_pressure_low() {
        let spi = ScriptedSpi {
            responses: VecDeque::from([pressure_frame(Z_THRESHOLD - 1, 2000)]),
            ..Default::default()
        };
        let mut touch = Tsc2046::new(spi);

        assert_eq!(touch.read(true).unwrap(), TouchSample::RELEASED);
        let spi = touch.release();
        assert_eq!(spi.sent, [vec![CMD_READ_Z1, 0, CMD_READ_Z2, 0, 0]]);
    }

    #[test]
    fn test_released_when_z2_saturated() {
        let spi = ScriptedSpi {
            responses: VecDeque::from([pressure_frame(1500, MAX_VALUE - Z_THRESHOLD + 1)]),
            ..Default::default()
        };
        let mut touch = Tsc2046::new(spi);
        assert_eq!(touch.read(false).unwrap(), TouchSample::RELEASED);
    }

    #[test]
    fn test_raw_read_averages_and_inverts() {
        let mut touch = Tsc2046::new(pressed_with(1200, 2500));

        let sample = touch.read(true).unwrap();
        assert_eq!(
            sample,
            TouchSample {
                x: 1200,
                y: 2500,
                state: TouchState::Pressed,
            }
        );

        let spi = touch.release();
        assert_eq!(spi.sent.len(), 2);
        assert_eq!(
            spi.sent[1],
            [
                CMD_READ_X, 0, CMD_READ_Y, 0, CMD_READ_X, 0, CMD_READ_Y, 0, CMD_READ_X, 0,
                CMD_READ_Y, 0, CMD_READ_X, 0, CMD_READ_Y, 0, 0
            ]
        );
    }

    #[test]
    fn test_identity_calibration_passes_raw_through() {
        let mut touch = Tsc2046::new(pressed_with(321, 654));
        let sample = touch.read(false).unwrap();
        assert_eq!((sample.x, sample.y), (321, 654));
    }

    #[test]
    fn test_calibrated_read_hits_targets() {
        let points = [
            CalibrationPoint::new((200, 300), (10, 20)),
            CalibrationPoint::new((3800, 400), (310, 25)),
            CalibrationPoint::new((1000, 3600), (80, 230)),
        ];

        for point in points {
            let mut touch = Tsc2046::new(pressed_with(point.raw.0, point.raw.1));
            touch.calibrate(&points).unwrap();
            let sample = touch.read(false).unwrap();
            assert_eq!((sample.x, sample.y), point.target);
        }
    }

    #[test]
    fn test_bus_error_propagates() {
        let spi = ScriptedSpi {
            fail: true,
            ..Default::default()
        };
        let mut touch = Tsc2046::new(spi);
        assert!(matches!(touch.read(true), Err(Error::Spi(BusFault))));
    }
}
