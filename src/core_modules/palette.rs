// THEORY:
// The `Palette` is the leaf of the rendering stack: an immutable table that turns a
// detector time-over-threshold count into a display color. It is built exactly once
// from a handful of color stops and then shared (behind an `Arc`) by every frame
// buffer of a pool, so per-pixel color mapping is a single indexed read.
//
// Key principles:
// 1) Total: every count has a color. Counts outside 0..=255 are clamped, never rejected.
// 2) Deterministic: the table is a pure function of the stop list.
// 3) Heat ramp: colors move from cold (blue) to hot (red). Across increasing counts the
//    red channel never decreases and the blue channel never increases.

pub mod palette {
    use image::Rgba;

    /// Number of table entries, one per representable 8-bit count.
    pub const PALETTE_SIZE: usize = 256;
    pub const MAX_COUNT: i32 = (PALETTE_SIZE - 1) as i32;

    pub type Color = Rgba<u8>;

    /// (count, [r, g, b, a]) anchors of the heat ramp.
    const COLOR_STOPS: [(u8, [u8; 4]); 5] = [
        (0, [0, 0, 255, 255]),     // deep blue
        (64, [0, 255, 255, 255]),  // cyan
        (128, [0, 255, 0, 255]),   // green
        (192, [255, 255, 0, 255]), // yellow
        (255, [255, 0, 0, 255]),   // red
    ];

    /// Immutable count → color lookup table.
    #[derive(Debug, Clone, PartialEq)]
    pub struct Palette {
        entries: Vec<Color>,
    }

    impl Palette {
        /// Builds the 256-entry table by interpolating linearly between the color stops.
        pub fn build() -> Self {
            let mut entries = Vec::with_capacity(PALETTE_SIZE);
            for count in 0..PALETTE_SIZE {
                entries.push(Self::interpolate(count as u8));
            }
            Self { entries }
        }

        fn interpolate(count: u8) -> Color {
            let upper = COLOR_STOPS
                .iter()
                .position(|(stop, _)| *stop >= count)
                .unwrap_or(COLOR_STOPS.len() - 1);
            if upper == 0 {
                return Rgba(COLOR_STOPS[0].1);
            }
            let (lo_count, lo) = COLOR_STOPS[upper - 1];
            let (hi_count, hi) = COLOR_STOPS[upper];
            let t = (count - lo_count) as f32 / (hi_count - lo_count) as f32;

            let mut channels = [0u8; 4];
            for (i, channel) in channels.iter_mut().enumerate() {
                let value = lo[i] as f32 + (hi[i] as f32 - lo[i] as f32) * t;
                *channel = value.round().clamp(0.0, 255.0) as u8;
            }
            Rgba(channels)
        }

        /// Color for `count`, clamped into 0..=255.
        pub fn lookup(&self, count: i32) -> Color {
            self.entries[count.clamp(0, MAX_COUNT) as usize]
        }

        /// Fast path for counts already in 8-bit range.
        #[inline]
        pub fn lookup_u8(&self, count: u8) -> Color {
            self.entries[count as usize]
        }

        pub fn len(&self) -> usize {
            self.entries.len()
        }

        pub fn is_empty(&self) -> bool {
            self.entries.is_empty()
        }

        pub fn entries(&self) -> &[Color] {
            &self.entries
        }
    }

    impl Default for Palette {
        fn default() -> Self {
            Self::build()
        }
    }

    /// Packs an RGBA color into the 0xAARRGGBB layout used by ARGB surfaces.
    #[inline]
    pub fn to_argb(color: Color) -> u32 {
        let [r, g, b, a] = color.0;
        (a as u32) << 24 | (r as u32) << 16 | (g as u32) << 8 | b as u32
    }
}
