// THEORY:
// `DemoSource` stands in for a live detector. It synthesizes frames that look like the
// four particle footprints the classifier knows about, so the whole pipeline can run
// (and be shown) without hardware. Randomness comes from a small seeded xorshift
// generator: runs are reproducible and no external RNG is needed.

use crate::core_modules::classifier::ParticleKind;
use crate::core_modules::frame_buffer::DetectorFrame;

/// xorshift64* generator. Not cryptographically secure.
#[derive(Debug, Clone)]
pub struct Prng {
    state: u64,
}

impl Prng {
    pub fn new(seed: u64) -> Self {
        // A zero state would stay zero forever.
        let seed = if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed };
        Self { state: seed }
    }

    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    #[inline]
    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Uniform integer in `low..high`; `low` when the range is empty.
    pub fn range(&mut self, low: u32, high: u32) -> u32 {
        if high <= low {
            return low;
        }
        low + (self.next_u64() % (high - low) as u64) as u32
    }
}

/// Synthetic detector producing one particle footprint per frame.
#[derive(Debug, Clone)]
pub struct DemoSource {
    width: u16,
    height: u16,
    rng: Prng,
}

impl DemoSource {
    pub fn new(width: u16, height: u16, seed: u64) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            rng: Prng::new(seed),
        }
    }

    /// A frame with a randomly chosen particle kind.
    pub fn next_frame(&mut self) -> (ParticleKind, DetectorFrame) {
        let kind = match self.rng.range(0, 10) {
            0 => ParticleKind::Alpha,
            1 | 2 => ParticleKind::Muon,
            3..=5 => ParticleKind::Beta,
            _ => ParticleKind::Gamma,
        };
        (kind, self.frame_for(kind))
    }

    pub fn frame_for(&mut self, kind: ParticleKind) -> DetectorFrame {
        let cx = self.rng.range(0, self.width as u32) as i32;
        let cy = self.rng.range(0, self.height as u32) as i32;
        let mut frame = DetectorFrame::default();
        match kind {
            ParticleKind::Alpha => {
                let radius = self.rng.range(2, 4) as i32;
                for dy in -radius..=radius {
                    for dx in -radius..=radius {
                        if dx * dx + dy * dy <= radius * radius {
                            let count = self.rng.range(120, 255) as u16;
                            self.put(&mut frame, cx + dx, cy + dy, count);
                        }
                    }
                }
            }
            ParticleKind::Muon => {
                let length = self.rng.range(12, 40) as f64;
                let angle = self.rng.next_f64() * std::f64::consts::TAU;
                for step in 0..length as i32 {
                    let x = cx + (step as f64 * angle.cos()).round() as i32;
                    let y = cy + (step as f64 * angle.sin()).round() as i32;
                    let count = self.rng.range(15, 40) as u16;
                    self.put(&mut frame, x, y, count);
                }
            }
            ParticleKind::Beta => {
                let (mut x, mut y) = (cx, cy);
                for _ in 0..self.rng.range(6, 16) {
                    let count = self.rng.range(10, 60) as u16;
                    self.put(&mut frame, x, y, count);
                    x += self.rng.range(0, 3) as i32 - 1;
                    y += self.rng.range(0, 3) as i32 - 1;
                }
            }
            ParticleKind::Gamma | ParticleKind::Unknown => {
                let count = self.rng.range(10, 80) as u16;
                self.put(&mut frame, cx, cy, count);
                if self.rng.range(0, 2) == 1 {
                    self.put(&mut frame, cx + 1, cy, count / 2);
                }
            }
        }
        frame
    }

    /// Adds a hit if it lands on the sensor and the pixel is not already hit.
    fn put(&self, frame: &mut DetectorFrame, x: i32, y: i32, count: u16) {
        if x < 0 || y < 0 || x >= self.width as i32 || y >= self.height as i32 {
            return;
        }
        let (x, y) = (x as u16, y as u16);
        if frame.x.iter().zip(&frame.y).any(|(&fx, &fy)| fx == x && fy == y) {
            return;
        }
        frame.push(x, y, count);
    }
}
