// THEORY:
// The `FrameBufferPool` owns a fixed set of pre-allocated `FrameBuffer`s attached as
// sub-layers of one parent drawing surface. It is the meeting point of two contexts:
// detector producers that claim and fill buffers, and the render loop that presents
// them. Every buffer sits behind its own mutex, so a present never reads a raster that
// is half written and two producers can never claim the same buffer.
//
// Key architectural principles:
// 1.  **First-fit reuse**: `acquire_free` scans in index order and hands out the lowest
//     free buffer. Reuse order stays deterministic and low layers are preferred.
// 2.  **Atomic claim**: the scan flips the winning buffer from Free to Claimed while its
//     lock is held. `fill_next` goes further and claims and paints under one lock.
// 3.  **Backpressure, not blocking**: a full pool answers `None` / `Exhausted`
//     immediately. Dropping the frame is the caller's business.
// 4.  **Lock order**: a buffer lock may be held while taking the surface lock, never
//     the other way around.

use crate::core_modules::frame_buffer::{BufferState, FillSeed, FrameBuffer, FrameStats, PixelSamples};
use crate::core_modules::palette::palette::Palette;
use crate::core_modules::surface::DrawableSurface;
use crate::error::PoolError;
use image::imageops;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// Largest Gaussian sigma (in pixels) applied by `animate` at full defocus.
pub const MAX_FOCUS_BLUR: f32 = 6.0;

/// A parent surface shared between the pool and the rest of the renderer.
pub type SharedSurface = Arc<Mutex<dyn DrawableSurface>>;

/// Guarded state is always consistent between statements, so a poisoned lock is
/// recovered rather than propagated.
fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A fixed-capacity set of reusable frame buffers drawn onto one parent surface.
pub struct FrameBufferPool {
    buffers: Vec<Mutex<FrameBuffer>>,
    surface: SharedSurface,
    palette: Arc<Palette>,
    width: u32,
    height: u32,
}

impl FrameBufferPool {
    /// Allocates `capacity` free buffers the size of `surface` and attaches one
    /// sub-layer per buffer, in index order. Builds the shared palette.
    pub fn initialize(surface: SharedSurface, capacity: usize) -> Self {
        Self::with_palette(surface, capacity, Arc::new(Palette::build()))
    }

    /// Same as `initialize` with a palette supplied by the caller.
    pub fn with_palette(surface: SharedSurface, capacity: usize, palette: Arc<Palette>) -> Self {
        let (width, height) = {
            let mut parent = lock(&surface);
            for index in 0..capacity {
                parent.attach_layer(index);
            }
            parent.dimensions()
        };
        let buffers = (0..capacity)
            .map(|index| Mutex::new(FrameBuffer::new(index, width, height, Arc::clone(&palette))))
            .collect();
        info!(capacity, width, height, "frame buffer pool initialized");
        Self {
            buffers,
            surface,
            palette,
            width,
            height,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffers.len()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn palette(&self) -> &Arc<Palette> {
        &self.palette
    }

    pub fn surface(&self) -> &SharedSurface {
        &self.surface
    }

    fn buffer(&self, index: usize) -> Result<MutexGuard<'_, FrameBuffer>, PoolError> {
        self.buffers
            .get(index)
            .map(lock)
            .ok_or(PoolError::IndexOutOfRange {
                index,
                capacity: self.buffers.len(),
            })
    }

    /// Claims the lowest-indexed free buffer, or `None` when the pool is exhausted.
    pub fn acquire_free(&self) -> Option<usize> {
        for slot in &self.buffers {
            let mut buffer = lock(slot);
            if buffer.is_free() {
                buffer.claim();
                return Some(buffer.index());
            }
        }
        debug!("frame buffer pool exhausted");
        None
    }

    /// Paints `samples` into buffer `index` and records its aggregates.
    ///
    /// The buffer must be Free or Claimed; a Filled buffer is rejected with
    /// `BufferInUse`. Mismatched sequence lengths and out-of-raster samples reject
    /// the whole fill before any pixel is written.
    pub fn fill(
        &self,
        index: usize,
        samples: PixelSamples<'_>,
        max_count: u16,
        seed: FillSeed,
    ) -> Result<FrameStats, PoolError> {
        let mut buffer = self.buffer(index)?;
        if buffer.state() == BufferState::Filled {
            return Err(PoolError::BufferInUse(index));
        }
        buffer.validate(&samples, &seed)?;
        Ok(buffer.paint(&samples, max_count, seed))
    }

    /// Finds the first free buffer and fills it in one critical section.
    pub fn fill_next(
        &self,
        samples: PixelSamples<'_>,
        max_count: u16,
        seed: FillSeed,
    ) -> Result<FrameStats, PoolError> {
        samples.check_lengths()?;
        for slot in &self.buffers {
            let mut buffer = lock(slot);
            if !buffer.is_free() {
                continue;
            }
            buffer.validate(&samples, &seed)?;
            return Ok(buffer.paint(&samples, max_count, seed));
        }
        Err(PoolError::Exhausted)
    }

    /// Paints more samples into an already filled buffer, continuing from its
    /// current aggregates. Used when a frame arrives in pieces.
    pub fn extend(&self, index: usize, samples: PixelSamples<'_>, max_count: u16) -> Result<FrameStats, PoolError> {
        let mut buffer = self.buffer(index)?;
        if buffer.state() != BufferState::Filled {
            return Err(PoolError::NotFilled(index));
        }
        let seed = buffer.current_seed();
        buffer.validate(&samples, &seed)?;
        Ok(buffer.paint(&samples, max_count, seed))
    }

    /// Restores background, zeroes aggregates and frees the buffer. Idempotent.
    pub fn clear(&self, index: usize) -> Result<(), PoolError> {
        let mut buffer = self.buffer(index)?;
        buffer.reset();
        lock(&self.surface).clear_layer(index);
        Ok(())
    }

    /// Blits the buffer's raster to its surface layer. Logical state is untouched.
    pub fn present(&self, index: usize) -> Result<(), PoolError> {
        let buffer = self.buffer(index)?;
        lock(&self.surface).present_layer(index, buffer.pixels());
        Ok(())
    }

    /// Presents every filled buffer; returns how many were presented.
    pub fn present_filled(&self) -> usize {
        let mut presented = 0;
        for slot in &self.buffers {
            let buffer = lock(slot);
            if buffer.state() == BufferState::Filled {
                lock(&self.surface).present_layer(buffer.index(), buffer.pixels());
                presented += 1;
            }
        }
        presented
    }

    /// Presents a defocused copy of a filled buffer, simulating the camera lens at
    /// `lens_position` (0 = sharp, 1 = fully out of focus). Out-of-range positions are
    /// clamped. The buffer's pixels and aggregates are not modified.
    pub fn animate(&self, index: usize, lens_position: f32) -> Result<(), PoolError> {
        let buffer = self.buffer(index)?;
        if buffer.state() != BufferState::Filled {
            return Err(PoolError::NotFilled(index));
        }
        let lens = if lens_position.is_nan() { 0.0 } else { lens_position.clamp(0.0, 1.0) };
        let sigma = lens * MAX_FOCUS_BLUR;
        let mut surface = lock(&self.surface);
        if sigma > 0.0 {
            let blurred = imageops::blur(buffer.pixels(), sigma);
            surface.present_layer(index, &blurred);
        } else {
            surface.present_layer(index, buffer.pixels());
        }
        Ok(())
    }

    pub fn is_free(&self, index: usize) -> Result<bool, PoolError> {
        Ok(self.buffer(index)?.is_free())
    }

    pub fn state(&self, index: usize) -> Result<BufferState, PoolError> {
        Ok(self.buffer(index)?.state())
    }

    pub fn free_count(&self) -> usize {
        self.buffers.iter().filter(|slot| lock(*slot).is_free()).count()
    }

    pub fn stats(&self, index: usize) -> Result<FrameStats, PoolError> {
        Ok(self.buffer(index)?.stats())
    }

    /// Runs `f` against a locked buffer, for read access to its raster.
    pub fn with_buffer<R>(&self, index: usize, f: impl FnOnce(&FrameBuffer) -> R) -> Result<R, PoolError> {
        let buffer = self.buffer(index)?;
        Ok(f(&buffer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::surface::Compositor;
    use std::thread;

    fn pool(capacity: usize) -> (FrameBufferPool, Arc<Mutex<Compositor>>) {
        let surface = Arc::new(Mutex::new(Compositor::new(16, 16)));
        let shared: SharedSurface = surface.clone();
        (FrameBufferPool::initialize(shared, capacity), surface)
    }

    fn one_hit() -> PixelSamples<'static> {
        PixelSamples::new(&[1], &[1], &[10])
    }

    #[test]
    fn initialize_allocates_free_buffers_and_layers() {
        let (pool, surface) = pool(4);
        assert_eq!(pool.capacity(), 4);
        assert_eq!(pool.free_count(), 4);
        assert_eq!(pool.dimensions(), (16, 16));
        assert_eq!(surface.lock().unwrap().layer_order(), vec![0, 1, 2, 3]);
        assert_eq!(pool.acquire_free(), Some(0));
    }

    #[test]
    fn acquire_free_prefers_lowest_index() {
        let (pool, _) = pool(4);
        pool.fill(0, one_hit(), 10, FillSeed::default()).unwrap();
        pool.fill(1, one_hit(), 10, FillSeed::default()).unwrap();
        assert_eq!(pool.acquire_free(), Some(2));

        pool.clear(0).unwrap();
        assert_eq!(pool.acquire_free(), Some(0));
    }

    #[test]
    fn exhaustion_after_capacity_claims() {
        let (pool, _) = pool(3);
        for expected in 0..3 {
            assert_eq!(pool.acquire_free(), Some(expected));
        }
        assert_eq!(pool.acquire_free(), None);
        assert_eq!(pool.fill_next(one_hit(), 10, FillSeed::default()), Err(PoolError::Exhausted));
    }

    #[test]
    fn centroid_is_plain_average_and_energy_is_sum() {
        let (pool, _) = pool(2);
        let index = pool.acquire_free().unwrap();
        let stats = pool
            .fill(index, PixelSamples::new(&[1, 2], &[3, 4], &[5, 6]), 10, FillSeed::default())
            .unwrap();
        assert_eq!(stats.center_x, 1.5);
        assert_eq!(stats.center_y, 3.5);
        assert_eq!(stats.energy, 11.0);
        assert_eq!(stats.max_count, 10);
        assert!(!pool.is_free(index).unwrap());
    }

    #[test]
    fn fill_then_clear_round_trips_to_blank() {
        let (pool, _) = pool(2);
        pool.fill(1, PixelSamples::new(&[0, 15], &[0, 15], &[40, 250]), 250, FillSeed::default())
            .unwrap();
        pool.clear(1).unwrap();
        assert!(pool.with_buffer(1, |fb| fb.is_blank()).unwrap());
        assert!(pool.is_free(1).unwrap());
        // Clearing again is harmless.
        pool.clear(1).unwrap();
        assert!(pool.is_free(1).unwrap());
    }

    #[test]
    fn precondition_violations_are_rejected() {
        let (pool, _) = pool(2);
        assert_eq!(
            pool.fill(0, PixelSamples::new(&[1, 2], &[3], &[5, 6]), 10, FillSeed::default()),
            Err(PoolError::LengthMismatch { x: 2, y: 1, counts: 2 })
        );
        assert!(matches!(
            pool.fill(0, PixelSamples::new(&[16], &[0], &[5]), 10, FillSeed::default()),
            Err(PoolError::PixelOutOfBounds { sample: 0, x: 16, .. })
        ));
        // Rejected fills leave the buffer free and blank.
        assert!(pool.is_free(0).unwrap());
        assert!(pool.with_buffer(0, |fb| fb.is_blank()).unwrap());

        pool.fill(0, one_hit(), 10, FillSeed::default()).unwrap();
        assert_eq!(pool.fill(0, one_hit(), 10, FillSeed::default()), Err(PoolError::BufferInUse(0)));
        assert_eq!(
            pool.fill(9, one_hit(), 10, FillSeed::default()),
            Err(PoolError::IndexOutOfRange { index: 9, capacity: 2 })
        );
    }

    #[test]
    fn extend_continues_aggregation() {
        let (pool, _) = pool(1);
        pool.fill(0, PixelSamples::new(&[1], &[3], &[5]), 5, FillSeed::default()).unwrap();
        let stats = pool.extend(0, PixelSamples::new(&[2], &[4], &[6]), 6).unwrap();
        assert_eq!((stats.center_x, stats.center_y, stats.energy), (1.5, 3.5, 11.0));
        assert_eq!(stats.hits, 2);
        assert_eq!(pool.extend(0, one_hit(), 1).map(|s| s.hits), Ok(3));

        pool.clear(0).unwrap();
        assert_eq!(pool.extend(0, one_hit(), 1), Err(PoolError::NotFilled(0)));
    }

    #[test]
    fn present_and_animate_do_not_change_state() {
        let (pool, surface) = pool(2);
        pool.fill(0, PixelSamples::new(&[8], &[8], &[255]), 255, FillSeed::default()).unwrap();
        let before = pool.stats(0).unwrap();

        pool.present(0).unwrap();
        pool.present(0).unwrap();
        assert_eq!(surface.lock().unwrap().present_count(0), 2);

        pool.animate(0, 0.5).unwrap();
        pool.animate(0, 42.0).unwrap();
        pool.animate(0, f32::NAN).unwrap();
        assert_eq!(pool.stats(0).unwrap(), before);
        assert_eq!(pool.state(0).unwrap(), BufferState::Filled);

        assert_eq!(pool.animate(1, 0.5), Err(PoolError::NotFilled(1)));
    }

    #[test]
    fn animate_blurs_presented_copy_only() {
        let (pool, surface) = pool(1);
        pool.fill(0, PixelSamples::new(&[8], &[8], &[255]), 255, FillSeed::default()).unwrap();
        pool.animate(0, 1.0).unwrap();
        let presented_center = surface.lock().unwrap().layer(0).map(|l| *l.get_pixel(8, 8)).unwrap();
        let stored_center = pool.with_buffer(0, |fb| *fb.pixels().get_pixel(8, 8)).unwrap();
        assert_ne!(presented_center, stored_center);
    }

    #[test]
    fn overflowing_seed_is_rejected_before_painting() {
        let (pool, _) = pool(1);
        let seed = FillSeed { hits: u32::MAX, ..FillSeed::default() };
        assert_eq!(
            pool.fill(0, PixelSamples::new(&[3], &[3], &[200]), 200, seed),
            Err(PoolError::HitCountOverflow { seed_hits: u32::MAX, samples: 1 })
        );
        assert!(pool.is_free(0).unwrap());
        assert!(pool.with_buffer(0, |fb| fb.is_blank()).unwrap());
        assert_eq!(pool.acquire_free(), Some(0));
    }

    #[test]
    fn non_finite_seed_is_rejected() {
        let (pool, _) = pool(1);
        let seed = FillSeed { center_x: f64::NAN, ..FillSeed::default() };
        assert_eq!(pool.fill_next(one_hit(), 10, seed), Err(PoolError::NonFiniteSeed));
        let empty = PixelSamples::new(&[], &[], &[]);
        let seed = FillSeed { center_y: f64::INFINITY, ..FillSeed::default() };
        assert_eq!(pool.fill(0, empty, 0, seed), Err(PoolError::NonFiniteSeed));
        assert!(pool.with_buffer(0, |fb| fb.is_blank()).unwrap());
        assert!(pool.is_free(0).unwrap());
    }

    #[test]
    fn extend_rejects_hit_count_overflow() {
        let (pool, _) = pool(1);
        let seed = FillSeed { hits: u32::MAX - 1, ..FillSeed::default() };
        let stats = pool.fill(0, one_hit(), 10, seed).unwrap();
        assert_eq!(stats.hits, u32::MAX);
        assert!(matches!(pool.extend(0, one_hit(), 10), Err(PoolError::HitCountOverflow { .. })));
        assert_eq!(pool.stats(0).unwrap(), stats);
    }

    #[test]
    fn present_filled_skips_free_buffers() {
        let (pool, _) = pool(3);
        pool.fill(2, one_hit(), 10, FillSeed::default()).unwrap();
        assert_eq!(pool.present_filled(), 1);
    }

    #[test]
    fn concurrent_producers_never_share_an_index() {
        let (pool, _) = pool(32);
        let pool = Arc::new(pool);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    let mut claimed = Vec::new();
                    while let Some(index) = pool.acquire_free() {
                        claimed.push(index);
                    }
                    claimed
                })
            })
            .collect();
        let mut all: Vec<usize> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        assert_eq!(all, (0..32).collect::<Vec<_>>());
    }
}
