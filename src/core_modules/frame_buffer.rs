// THEORY:
// A `FrameBuffer` is one reusable raster surface of the pool plus the aggregate
// statistics of the detector frame currently painted into it. Buffers are created in
// bulk when the pool is built and are never destroyed until the pool is; between
// frames they are recycled through the Free → Claimed → Filled → Free cycle.
//
// Key principles:
// 1.  **Validate, then write**: every sample of a fill is bounds-checked before the
//     first pixel is touched, so a rejected fill leaves the buffer exactly as it was.
// 2.  **Plain aggregation**: the centroid is the unweighted mean of the hit
//     coordinates and the energy is the plain sum of the counts. Seeds let a caller
//     continue an aggregate that was started elsewhere.
// 3.  **Shape moments**: alongside the centroid the buffer keeps first and second
//     moments of the hits it has painted, which the classifier turns into a shape.

use crate::core_modules::classifier::ClusterShape;
use crate::core_modules::palette::palette::{Palette, to_argb};
use crate::error::PoolError;
use image::{Rgba, RgbaImage};
use std::sync::Arc;

/// Fully transparent black; the color of a blank buffer.
pub const BACKGROUND: Rgba<u8> = Rgba([0, 0, 0, 0]);

/// Lifecycle of a single buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BufferState {
    /// Blank and available to `acquire_free`.
    Free,
    /// Reserved by `acquire_free` but not yet painted.
    Claimed,
    /// Holds a frame.
    Filled,
}

/// Parallel per-hit sequences for one detector frame (or a piece of one).
#[derive(Debug, Clone, Copy)]
pub struct PixelSamples<'a> {
    pub x: &'a [u16],
    pub y: &'a [u16],
    pub counts: &'a [u16],
}

impl<'a> PixelSamples<'a> {
    pub fn new(x: &'a [u16], y: &'a [u16], counts: &'a [u16]) -> Self {
        Self { x, y, counts }
    }

    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// Fails fast when the three sequences disagree in length.
    pub fn check_lengths(&self) -> Result<(), PoolError> {
        if self.x.len() != self.y.len() || self.x.len() != self.counts.len() {
            return Err(PoolError::LengthMismatch {
                x: self.x.len(),
                y: self.y.len(),
                counts: self.counts.len(),
            });
        }
        Ok(())
    }
}

/// One detector frame as handed over by the capture collaborator.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DetectorFrame {
    pub x: Vec<u16>,
    pub y: Vec<u16>,
    pub counts: Vec<u16>,
    pub max_count: u16,
    pub seed: FillSeed,
}

impl DetectorFrame {
    pub fn samples(&self) -> PixelSamples<'_> {
        PixelSamples::new(&self.x, &self.y, &self.counts)
    }

    pub fn push(&mut self, x: u16, y: u16, count: u16) {
        self.x.push(x);
        self.y.push(y);
        self.counts.push(count);
        self.max_count = self.max_count.max(count);
    }
}

/// Aggregates carried into a fill from a previous partial aggregation.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FillSeed {
    pub center_x: f64,
    pub center_y: f64,
    pub energy: f64,
    /// Number of hits the seed centroid was averaged over.
    pub hits: u32,
}

/// Snapshot of a buffer's aggregates after a fill.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FrameStats {
    pub index: usize,
    pub center_x: f64,
    pub center_y: f64,
    pub energy: f64,
    pub hits: u32,
    pub max_count: u16,
    pub shape: ClusterShape,
}

/// Running first and second moments of painted hit coordinates.
#[derive(Debug, Clone, Copy, Default)]
struct Moments {
    n: u32,
    sum_x: f64,
    sum_y: f64,
    sum_xx: f64,
    sum_yy: f64,
    sum_xy: f64,
    sum_counts: f64,
}

impl Moments {
    fn add(&mut self, x: f64, y: f64, count: f64) {
        self.n += 1;
        self.sum_x += x;
        self.sum_y += y;
        self.sum_xx += x * x;
        self.sum_yy += y * y;
        self.sum_xy += x * y;
        self.sum_counts += count;
    }

    /// Geometry comes from the painted hits only; `hits` and `energy` are the
    /// buffer totals, seed included, so the shape agrees with `FrameStats`.
    fn shape(&self, hits: u32, energy: f64) -> ClusterShape {
        if hits == 0 {
            return ClusterShape::default();
        }
        if self.n == 0 {
            return ClusterShape::from_covariance(hits, energy, 0.0, 0.0, 0.0);
        }
        let n = self.n as f64;
        let (mx, my) = (self.sum_x / n, self.sum_y / n);
        let cxx = (self.sum_xx / n - mx * mx).max(0.0);
        let cyy = (self.sum_yy / n - my * my).max(0.0);
        let cxy = self.sum_xy / n - mx * my;
        ClusterShape::from_covariance(hits, energy, cxx, cyy, cxy)
    }
}

/// Seed hits plus sample count, or `HitCountOverflow` when it does not fit a `u32`.
fn total_hits(seed_hits: u32, samples: usize) -> Result<u32, PoolError> {
    u32::try_from(samples)
        .ok()
        .and_then(|n| seed_hits.checked_add(n))
        .ok_or(PoolError::HitCountOverflow { seed_hits, samples })
}

/// A single reusable raster with the aggregates of the frame painted into it.
#[derive(Debug)]
pub struct FrameBuffer {
    index: usize,
    state: BufferState,
    pixels: RgbaImage,
    center_x: f64,
    center_y: f64,
    energy: f64,
    hits: u32,
    max_count: u16,
    moments: Moments,
    palette: Arc<Palette>,
}

impl FrameBuffer {
    pub fn new(index: usize, width: u32, height: u32, palette: Arc<Palette>) -> Self {
        Self {
            index,
            state: BufferState::Free,
            pixels: RgbaImage::from_pixel(width, height, BACKGROUND),
            center_x: 0.0,
            center_y: 0.0,
            energy: 0.0,
            hits: 0,
            max_count: 0,
            moments: Moments::default(),
            palette,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    pub fn is_free(&self) -> bool {
        self.state == BufferState::Free
    }

    pub fn center(&self) -> (f64, f64) {
        (self.center_x, self.center_y)
    }

    pub fn energy(&self) -> f64 {
        self.energy
    }

    pub fn hits(&self) -> u32 {
        self.hits
    }

    pub fn max_count(&self) -> u16 {
        self.max_count
    }

    pub fn pixels(&self) -> &RgbaImage {
        &self.pixels
    }

    pub fn palette(&self) -> &Arc<Palette> {
        &self.palette
    }

    /// Pixel at (x, y) packed as 0xAARRGGBB.
    pub fn pixel_argb(&self, x: u32, y: u32) -> Option<u32> {
        self.pixels.get_pixel_checked(x, y).map(|p| to_argb(*p))
    }

    /// Whole raster in ARGB order, row-major.
    pub fn to_argb(&self) -> Vec<u32> {
        self.pixels.pixels().map(|p| to_argb(*p)).collect()
    }

    /// True when every pixel is background and every aggregate is zero.
    pub fn is_blank(&self) -> bool {
        self.hits == 0
            && self.energy == 0.0
            && self.center_x == 0.0
            && self.center_y == 0.0
            && self.pixels.pixels().all(|p| *p == BACKGROUND)
    }

    pub fn stats(&self) -> FrameStats {
        FrameStats {
            index: self.index,
            center_x: self.center_x,
            center_y: self.center_y,
            energy: self.energy,
            hits: self.hits,
            max_count: self.max_count,
            shape: self.moments.shape(self.hits, self.energy),
        }
    }

    pub(crate) fn claim(&mut self) {
        self.state = BufferState::Claimed;
    }

    /// Checks lengths, raster bounds and the seed without writing anything.
    pub(crate) fn validate(&self, samples: &PixelSamples<'_>, seed: &FillSeed) -> Result<(), PoolError> {
        samples.check_lengths()?;
        if !(seed.center_x.is_finite() && seed.center_y.is_finite() && seed.energy.is_finite()) {
            return Err(PoolError::NonFiniteSeed);
        }
        total_hits(seed.hits, samples.len())?;
        let (width, height) = self.pixels.dimensions();
        for (sample, (&x, &y)) in samples.x.iter().zip(samples.y.iter()).enumerate() {
            let (x, y) = (x as u32, y as u32);
            if x >= width || y >= height {
                return Err(PoolError::PixelOutOfBounds {
                    sample,
                    x,
                    y,
                    width,
                    height,
                });
            }
        }
        Ok(())
    }

    /// Paints validated samples and folds them into the seed aggregates.
    pub(crate) fn paint(&mut self, samples: &PixelSamples<'_>, max_count: u16, seed: FillSeed) -> FrameStats {
        // `validate` has already ruled out overflow.
        let total_hits = total_hits(seed.hits, samples.len()).unwrap_or(u32::MAX);
        let mut sum_x = 0.0;
        let mut sum_y = 0.0;
        let mut sum_counts = 0.0;
        let mut observed_max = max_count;

        for i in 0..samples.len() {
            let (x, y, count) = (samples.x[i], samples.y[i], samples.counts[i]);
            let color = self.palette.lookup(count as i32);
            self.pixels.put_pixel(x as u32, y as u32, color);

            sum_x += x as f64;
            sum_y += y as f64;
            sum_counts += count as f64;
            observed_max = observed_max.max(count);
            self.moments.add(x as f64, y as f64, count as f64);
        }

        if !samples.is_empty() {
            let seed_weight = seed.hits as f64;
            self.center_x = (seed.center_x * seed_weight + sum_x) / total_hits as f64;
            self.center_y = (seed.center_y * seed_weight + sum_y) / total_hits as f64;
        } else {
            self.center_x = seed.center_x;
            self.center_y = seed.center_y;
        }
        self.energy = seed.energy + sum_counts;
        self.hits = total_hits;
        self.max_count = self.max_count.max(observed_max);
        self.state = BufferState::Filled;
        self.stats()
    }

    /// The buffer's own aggregates, used to continue a fill in pieces.
    pub(crate) fn current_seed(&self) -> FillSeed {
        FillSeed {
            center_x: self.center_x,
            center_y: self.center_y,
            energy: self.energy,
            hits: self.hits,
        }
    }

    /// Back to background with zeroed aggregates and the Free flag set.
    pub(crate) fn reset(&mut self) {
        for pixel in self.pixels.pixels_mut() {
            *pixel = BACKGROUND;
        }
        self.center_x = 0.0;
        self.center_y = 0.0;
        self.energy = 0.0;
        self.hits = 0;
        self.max_count = 0;
        self.moments = Moments::default();
        self.state = BufferState::Free;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer() -> FrameBuffer {
        FrameBuffer::new(0, 8, 8, Arc::new(Palette::build()))
    }

    #[test]
    fn new_buffer_is_free_and_blank() {
        let fb = buffer();
        assert!(fb.is_free());
        assert!(fb.is_blank());
        assert_eq!(fb.pixel_argb(7, 7), Some(0));
        assert_eq!(fb.pixel_argb(8, 0), None);
    }

    #[test]
    fn validate_rejects_out_of_bounds_without_writing() {
        let fb = buffer();
        let samples = PixelSamples::new(&[1, 8], &[1, 1], &[5, 5]);
        assert_eq!(
            fb.validate(&samples, &FillSeed::default()),
            Err(PoolError::PixelOutOfBounds { sample: 1, x: 8, y: 1, width: 8, height: 8 })
        );
        assert!(fb.is_blank());
    }

    #[test]
    fn paint_uses_palette_colors() {
        let mut fb = buffer();
        let samples = PixelSamples::new(&[2], &[3], &[255]);
        fb.paint(&samples, 255, FillSeed::default());
        assert_eq!(*fb.pixels().get_pixel(2, 3), Rgba([255, 0, 0, 255]));
        assert_eq!(fb.state(), BufferState::Filled);
    }

    #[test]
    fn seed_hits_weight_the_centroid() {
        let mut fb = buffer();
        let seed = FillSeed { center_x: 0.0, center_y: 0.0, energy: 4.0, hits: 2 };
        let stats = fb.paint(&PixelSamples::new(&[4, 4], &[6, 6], &[1, 1]), 1, seed);
        assert_eq!(stats.center_x, 2.0);
        assert_eq!(stats.center_y, 3.0);
        assert_eq!(stats.energy, 6.0);
        assert_eq!(stats.hits, 4);
    }

    #[test]
    fn empty_fill_keeps_seed_centroid() {
        let mut fb = buffer();
        let seed = FillSeed { center_x: 3.5, center_y: 1.25, energy: 9.0, hits: 0 };
        let stats = fb.paint(&PixelSamples::new(&[], &[], &[]), 0, seed);
        assert_eq!((stats.center_x, stats.center_y, stats.energy), (3.5, 1.25, 9.0));
    }

    #[test]
    fn reset_restores_background() {
        let mut fb = buffer();
        fb.paint(&PixelSamples::new(&[0, 7], &[0, 7], &[10, 200]), 200, FillSeed::default());
        assert!(!fb.is_blank());
        fb.reset();
        assert!(fb.is_blank());
        assert!(fb.is_free());
        assert_eq!(fb.max_count(), 0);
    }

    #[test]
    fn validate_rejects_bad_seeds() {
        let fb = buffer();
        let samples = PixelSamples::new(&[1], &[1], &[5]);
        let overflowing = FillSeed { hits: u32::MAX, ..FillSeed::default() };
        assert_eq!(
            fb.validate(&samples, &overflowing),
            Err(PoolError::HitCountOverflow { seed_hits: u32::MAX, samples: 1 })
        );
        let nan_center = FillSeed { center_y: f64::NAN, ..FillSeed::default() };
        assert_eq!(fb.validate(&samples, &nan_center), Err(PoolError::NonFiniteSeed));
        let infinite_energy = FillSeed { energy: f64::INFINITY, ..FillSeed::default() };
        assert_eq!(fb.validate(&samples, &infinite_energy), Err(PoolError::NonFiniteSeed));
        assert!(fb.is_blank());
    }

    #[test]
    fn shape_counts_seed_hits() {
        let mut fb = buffer();
        let seed = FillSeed { center_x: 1.0, center_y: 1.0, energy: 100.0, hits: 3 };
        let stats = fb.paint(&PixelSamples::new(&[2, 3], &[2, 2], &[10, 10]), 10, seed);
        assert_eq!(stats.hits, 5);
        assert_eq!(stats.shape.hits, stats.hits);
        assert_eq!(stats.shape.energy, stats.energy);
        assert_eq!(stats.shape.mean_count(), 24.0);
    }

    #[test]
    fn seed_only_shape_is_round() {
        let mut fb = buffer();
        let seed = FillSeed { center_x: 1.0, center_y: 1.0, energy: 8.0, hits: 2 };
        let stats = fb.paint(&PixelSamples::new(&[], &[], &[]), 0, seed);
        assert_eq!(stats.shape.hits, 2);
        assert_eq!(stats.shape.elongation, 1.0);
    }
}
