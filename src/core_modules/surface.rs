// THEORY:
// The `surface` module is the narrow seam between the frame-buffer pool and whatever
// actually puts pixels on a screen. The pool never knows about windows, layers or GPU
// textures; it only needs something that can accept a raster for a numbered layer and
// blank that layer again. Keeping the seam this small lets the same pool drive an
// on-screen compositor, an off-screen recorder, or the in-memory `Compositor` below
// (which is also what the tests use).

use image::{Rgba, RgbaImage};

/// A parent drawing surface that hosts one sub-layer per frame buffer.
pub trait DrawableSurface: Send {
    /// Width and height in pixels. Every attached layer has this size.
    fn dimensions(&self) -> (u32, u32);

    /// Registers a sub-layer. Layers are stacked in attachment order.
    fn attach_layer(&mut self, index: usize);

    /// Pushes a raster to the layer. Purely a rendering side effect.
    fn present_layer(&mut self, index: usize, raster: &RgbaImage);

    /// Blanks the layer.
    fn clear_layer(&mut self, index: usize);
}

/// One stacked layer of the in-memory compositor.
#[derive(Debug, Clone)]
struct Layer {
    index: usize,
    image: RgbaImage,
    presents: u64,
}

/// An in-memory `DrawableSurface` that keeps the last presented raster per layer
/// and can flatten the stack into a single image.
#[derive(Debug, Clone)]
pub struct Compositor {
    width: u32,
    height: u32,
    layers: Vec<Layer>,
}

impl Compositor {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            layers: Vec::new(),
        }
    }

    /// Layer indices in stacking order (bottom first).
    pub fn layer_order(&self) -> Vec<usize> {
        self.layers.iter().map(|l| l.index).collect()
    }

    pub fn layer(&self, index: usize) -> Option<&RgbaImage> {
        self.layers.iter().find(|l| l.index == index).map(|l| &l.image)
    }

    /// How many times `present_layer` reached this layer.
    pub fn present_count(&self, index: usize) -> u64 {
        self.layers
            .iter()
            .find(|l| l.index == index)
            .map_or(0, |l| l.presents)
    }

    /// Source-over blend of all layers, bottom to top, onto a transparent canvas.
    pub fn flatten(&self) -> RgbaImage {
        let mut out = RgbaImage::new(self.width, self.height);
        for layer in &self.layers {
            for (dst, src) in out.pixels_mut().zip(layer.image.pixels()) {
                *dst = blend_over(*src, *dst);
            }
        }
        out
    }

    fn layer_mut(&mut self, index: usize) -> Option<&mut Layer> {
        self.layers.iter_mut().find(|l| l.index == index)
    }
}

impl DrawableSurface for Compositor {
    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn attach_layer(&mut self, index: usize) {
        if self.layer_mut(index).is_some() {
            return;
        }
        self.layers.push(Layer {
            index,
            image: RgbaImage::new(self.width, self.height),
            presents: 0,
        });
    }

    fn present_layer(&mut self, index: usize, raster: &RgbaImage) {
        let (width, height) = (self.width, self.height);
        if let Some(layer) = self.layer_mut(index) {
            if raster.dimensions() == (width, height) {
                layer.image.copy_from_slice(raster.as_raw());
            }
            layer.presents += 1;
        }
    }

    fn clear_layer(&mut self, index: usize) {
        if let Some(layer) = self.layer_mut(index) {
            layer.image.fill(0);
        }
    }
}

/// Alpha blend of `src` over `dst` in straight (non-premultiplied) alpha.
#[inline]
fn blend_over(src: Rgba<u8>, dst: Rgba<u8>) -> Rgba<u8> {
    let sa = src.0[3] as u32;
    if sa == 255 {
        return src;
    }
    if sa == 0 {
        return dst;
    }
    let da = dst.0[3] as u32;
    // out_a = sa + da * (1 - sa), all scaled by 255
    let out_a = sa * 255 + da * (255 - sa);
    if out_a == 0 {
        return Rgba([0, 0, 0, 0]);
    }
    let mut out = [0u8; 4];
    for c in 0..3 {
        let value = (src.0[c] as u32 * sa * 255 + dst.0[c] as u32 * da * (255 - sa)) / out_a;
        out[c] = value.min(255) as u8;
    }
    out[3] = (out_a / 255).min(255) as u8;
    Rgba(out)
}
