//! Synthetic scene and per-format render functions.
//!
//! Every output format is a different encoding of the same underlying
//! per-pixel electron counts: illumination scales linearly with exposure time
//! and gain into electrons, saturates at the full well, and only then gets
//! quantized to the output bit depth. Keeping that order is what makes the
//! formats mutually consistent and the exposure control loop observable in
//! the output.

use rand::Rng;

use crate::config::SensorCharacteristics;
use crate::types::{PixelFormat, BLOB_HEADER_SIZE};

/// Photon arrival rate at full illumination, electrons per second.
const FULL_SCALE_ELECTRON_RATE: f64 = 200_000.0;
/// Reference sensitivity; gain scales electrons relative to this.
const BASE_SENSITIVITY: f64 = 100.0;
/// Magic prefixing the self-describing BLOB container.
const BLOB_MAGIC: &[u8; 4] = b"SIMB";

/// Deterministic synthetic scene.
///
/// A diagonal gradient with vertical bars that drift over time, so
/// consecutive frames differ and timestamps are visible in the image.
#[derive(Clone, Debug)]
pub struct Scene {
    width: u32,
    height: u32,
}

impl Scene {
    /// Creates a scene covering the active array.
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Relative illumination at a pixel, in `[0, 1]`.
    pub fn illumination(&self, x: u32, y: u32, timestamp_ns: i64) -> f64 {
        let w = self.width.max(2) as f64;
        let h = self.height.max(2) as f64;
        let gradient = 0.55 * (f64::from(x) / (w - 1.0)) + 0.25 * (f64::from(y) / (h - 1.0));
        // Bars drift one pixel every ~8ms.
        let drift = (timestamp_ns / 8_000_000) as u64 % self.width.max(1) as u64;
        let bar_on = ((u64::from(x) + drift) / 32) % 2 == 0;
        let bar = if bar_on { 0.2 } else { 0.0 };
        (gradient + bar).min(1.0)
    }

    /// Electron count at a pixel for the given exposure and gain, saturated
    /// at the sensor's full well.
    pub fn electrons(
        &self,
        x: u32,
        y: u32,
        timestamp_ns: i64,
        exposure_ns: i64,
        sensitivity: i32,
        sensor: &SensorCharacteristics,
    ) -> f64 {
        let illum = self.illumination(x, y, timestamp_ns);
        let seconds = exposure_ns.max(0) as f64 / 1e9;
        let gain = f64::from(sensitivity.max(1)) / BASE_SENSITIVITY;
        let electrons = illum * FULL_SCALE_ELECTRON_RATE * seconds * gain;
        electrons.min(f64::from(sensor.full_well_capacity))
    }
}

/// Exposure parameters shared by all render functions.
#[derive(Clone, Copy, Debug)]
pub struct RenderParams {
    /// Exposure time, nanoseconds.
    pub exposure_ns: i64,
    /// Sensitivity (ISO).
    pub sensitivity: i32,
    /// Start-of-exposure timestamp, nanoseconds.
    pub timestamp_ns: i64,
}

fn noisy_fraction<R: Rng>(
    scene: &Scene,
    x: u32,
    y: u32,
    params: RenderParams,
    sensor: &SensorCharacteristics,
    rng: &mut R,
) -> f64 {
    let electrons = scene.electrons(
        x,
        y,
        params.timestamp_ns,
        params.exposure_ns,
        params.sensitivity,
        sensor,
    );
    let noise = (rng.gen::<f64>() - 0.5) * 2.0 * f64::from(sensor.read_noise_electrons);
    let full_well = f64::from(sensor.full_well_capacity);
    ((electrons + noise).clamp(0.0, full_well)) / full_well
}

/// Renders RAW16: linear electron fractions quantized to 16 bits.
pub fn render_raw16<R: Rng>(
    scene: &Scene,
    params: RenderParams,
    sensor: &SensorCharacteristics,
    rng: &mut R,
    width: u32,
    height: u32,
    out: &mut [u8],
) {
    for y in 0..height {
        for x in 0..width {
            let value = noisy_fraction(scene, x, y, params, sensor, rng) * 65535.0;
            let sample = value as u16;
            let offset = ((y * width + x) as usize) * 2;
            out[offset..offset + 2].copy_from_slice(&sample.to_le_bytes());
        }
    }
}

/// Renders RGBA8888 with a simple display gamma.
pub fn render_rgba8888<R: Rng>(
    scene: &Scene,
    params: RenderParams,
    sensor: &SensorCharacteristics,
    rng: &mut R,
    width: u32,
    height: u32,
    out: &mut [u8],
) {
    for y in 0..height {
        for x in 0..width {
            let fraction = noisy_fraction(scene, x, y, params, sensor, rng);
            let value = (fraction.sqrt() * 255.0) as u8;
            let offset = ((y * width + x) as usize) * 4;
            out[offset] = value;
            out[offset + 1] = value;
            out[offset + 2] = value;
            out[offset + 3] = 0xFF;
        }
    }
}

/// Renders planar YUV 4:2:0 with neutral chroma.
pub fn render_yuv420<R: Rng>(
    scene: &Scene,
    params: RenderParams,
    sensor: &SensorCharacteristics,
    rng: &mut R,
    width: u32,
    height: u32,
    out: &mut [u8],
) {
    let pixels = (width * height) as usize;
    for y in 0..height {
        for x in 0..width {
            let fraction = noisy_fraction(scene, x, y, params, sensor, rng);
            out[(y * width + x) as usize] = (fraction.sqrt() * 255.0) as u8;
        }
    }
    // Chroma planes stay neutral; the scene is monochrome.
    for byte in &mut out[pixels..] {
        *byte = 128;
    }
}

/// Renders Depth16: distance ramp modulated by the scene.
pub fn render_depth16<R: Rng>(
    scene: &Scene,
    params: RenderParams,
    _sensor: &SensorCharacteristics,
    _rng: &mut R,
    width: u32,
    height: u32,
    out: &mut [u8],
) {
    for y in 0..height {
        for x in 0..width {
            let illum = scene.illumination(x, y, params.timestamp_ns);
            // Brighter pixels read as nearer. Range 0..8m in millimeters.
            let depth_mm = (8000.0 * (1.0 - illum)) as u16;
            let offset = ((y * width + x) as usize) * 2;
            out[offset..offset + 2].copy_from_slice(&depth_mm.to_le_bytes());
        }
    }
}

/// Wraps an already-rendered YUV420 payload in the BLOB container.
///
/// The container is self-describing: magic, dimensions, payload length, then
/// the payload bytes. Not a real compressed format.
pub fn encode_blob(width: u32, height: u32, payload: &[u8], out: &mut [u8]) -> usize {
    let total = BLOB_HEADER_SIZE + payload.len();
    out[0..4].copy_from_slice(BLOB_MAGIC);
    out[4..8].copy_from_slice(&width.to_le_bytes());
    out[8..12].copy_from_slice(&height.to_le_bytes());
    out[12..16].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    out[BLOB_HEADER_SIZE..total].copy_from_slice(payload);
    total
}

/// Parses a BLOB container header, returning `(width, height, payload_len)`.
pub fn decode_blob_header(data: &[u8]) -> Option<(u32, u32, usize)> {
    if data.len() < BLOB_HEADER_SIZE || &data[0..4] != BLOB_MAGIC {
        return None;
    }
    let width = u32::from_le_bytes(data[4..8].try_into().ok()?);
    let height = u32::from_le_bytes(data[8..12].try_into().ok()?);
    let len = u32::from_le_bytes(data[12..16].try_into().ok()?) as usize;
    Some((width, height, len))
}

/// Output size check shared by the sensor before rendering into a buffer.
pub fn required_size(format: PixelFormat, width: u32, height: u32) -> usize {
    format.buffer_size(width, height)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_characteristics;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn sensor() -> SensorCharacteristics {
        default_characteristics(0).sensor.clone()
    }

    #[test]
    fn test_electrons_scale_linearly_with_exposure() {
        let scene = Scene::new(64, 64);
        let sensor = sensor();
        let short = scene.electrons(40, 40, 0, 1_000_000, 100, &sensor);
        let long = scene.electrons(40, 40, 0, 2_000_000, 100, &sensor);
        assert!(short > 0.0);
        assert!((long / short - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_electrons_scale_linearly_with_gain() {
        let scene = Scene::new(64, 64);
        let sensor = sensor();
        let base = scene.electrons(40, 40, 0, 1_000_000, 100, &sensor);
        let boosted = scene.electrons(40, 40, 0, 1_000_000, 400, &sensor);
        assert!((boosted / base - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_electrons_saturate_at_full_well() {
        let scene = Scene::new(64, 64);
        let sensor = sensor();
        let electrons = scene.electrons(63, 63, 0, 10_000_000_000, 1600, &sensor);
        assert!((electrons - f64::from(sensor.full_well_capacity)).abs() < f64::EPSILON);
    }

    #[test]
    fn test_raw16_saturation_clamps() {
        let scene = Scene::new(8, 8);
        let sensor = sensor();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut out = vec![0u8; PixelFormat::Raw16.buffer_size(8, 8)];
        let params = RenderParams {
            exposure_ns: 10_000_000_000,
            sensitivity: 1600,
            timestamp_ns: 0,
        };
        render_raw16(&scene, params, &sensor, &mut rng, 8, 8, &mut out);
        let brightest = u16::from_le_bytes([out[out.len() - 2], out[out.len() - 1]]);
        assert!(brightest > 65000);
    }

    #[test]
    fn test_yuv_chroma_neutral() {
        let scene = Scene::new(16, 16);
        let sensor = sensor();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut out = vec![0u8; PixelFormat::Yuv420.buffer_size(16, 16)];
        let params = RenderParams {
            exposure_ns: 33_333_333,
            sensitivity: 100,
            timestamp_ns: 0,
        };
        render_yuv420(&scene, params, &sensor, &mut rng, 16, 16, &mut out);
        assert!(out[256..].iter().all(|&b| b == 128));
    }

    #[test]
    fn test_blob_roundtrip() {
        let payload = vec![9u8; 24];
        let mut out = vec![0u8; BLOB_HEADER_SIZE + payload.len()];
        let written = encode_blob(4, 4, &payload, &mut out);
        assert_eq!(written, out.len());
        let (w, h, len) = decode_blob_header(&out).unwrap();
        assert_eq!((w, h, len), (4, 4, 24));
        assert!(decode_blob_header(&[0u8; 4]).is_none());
    }
}
