// gpu/texture.rs — RGBA8 render targets of the reference device.
//
// A `Texture` is the reference device's equivalent of a framebuffer-backed
// WebGL texture: a tightly packed RGBA8 pixel buffer, plus an optional mip
// chain (an auxiliary view derived from level 0). Textures are never handed
// out directly: nodes hold `TextureHandle`s, and every access goes through
// the `GpuContext` that owns the texture storage.
//
// OUT-OF-RANGE FETCHES
// ────────────────────
// `texel()` returns transparent black for coordinates outside the texture,
// like `texelFetch` on robust-access implementations. Fragment programs rely
// on this when they probe past the end of an encoded keypoint list.

use std::fmt;

/// Opaque reference to a texture owned by a `GpuContext`.
///
/// Handles are cheap `Copy` ids. Holding one does not keep the texture
/// alive; the pool decides when a handle may be reused.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub(crate) u32);

impl TextureHandle {
    /// The visible surface. Kernels whose output is the surface render
    /// "to the screen" instead of to a pooled buffer.
    pub const SURFACE: TextureHandle = TextureHandle(0);

    /// Numeric id, for diagnostics.
    pub fn id(self) -> u32 {
        self.0
    }

    pub fn is_surface(self) -> bool {
        self == Self::SURFACE
    }
}

impl fmt::Debug for TextureHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_surface() {
            write!(f, "Texture(surface)")
        } else {
            write!(f, "Texture#{}", self.0)
        }
    }
}

/// One level of a mip chain (level 1 is half the size of level 0, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MipLevel {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl MipLevel {
    pub fn texel(&self, x: i64, y: i64) -> [u8; 4] {
        fetch(&self.pixels, self.width, self.height, x, y)
    }
}

/// A 2D RGBA8 buffer.
#[derive(Clone)]
pub struct Texture {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
    /// Levels 1.. of the mip chain. Empty = no mipmaps.
    mipmaps: Vec<MipLevel>,
}

impl Texture {
    /// A 0×0 texture. Every fetch returns transparent black.
    pub(crate) const EMPTY: Texture = Texture {
        width: 0,
        height: 0,
        pixels: Vec::new(),
        mipmaps: Vec::new(),
    };

    /// Zero-initialised texture.
    pub fn new(width: u32, height: u32) -> Self {
        Texture {
            width,
            height,
            pixels: vec![0; pixel_bytes(width, height)],
            mipmaps: Vec::new(),
        }
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub(crate) fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.pixels
    }

    /// Swap the pixel storage out (used by kernels so they can read other
    /// textures of the same context while producing this one).
    pub(crate) fn take_pixels(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pixels)
    }

    pub(crate) fn put_pixels(&mut self, pixels: Vec<u8>) {
        debug_assert_eq!(pixels.len(), pixel_bytes(self.width, self.height));
        self.pixels = pixels;
    }

    /// Resize in place. Contents are undefined afterwards (zeroed here);
    /// a no-op when the size does not change.
    pub fn resize(&mut self, width: u32, height: u32) {
        if width == self.width && height == self.height {
            return;
        }
        self.width = width;
        self.height = height;
        self.pixels = vec![0; pixel_bytes(width, height)];
        self.mipmaps.clear();
    }

    /// Fill every pixel of level 0 with `rgba`.
    pub fn clear(&mut self, rgba: [u8; 4]) {
        for px in self.pixels.chunks_exact_mut(4) {
            px.copy_from_slice(&rgba);
        }
        self.mipmaps.clear();
    }

    /// Fetch a pixel of level 0; transparent black outside the texture.
    #[inline]
    pub fn texel(&self, x: i64, y: i64) -> [u8; 4] {
        fetch(&self.pixels, self.width, self.height, x, y)
    }

    /// Fetch a pixel of an arbitrary mip level (0 = base level).
    pub fn texel_lod(&self, lod: usize, x: i64, y: i64) -> [u8; 4] {
        match lod {
            0 => self.texel(x, y),
            n => self.mipmaps.get(n - 1).map_or([0; 4], |m| m.texel(x, y)),
        }
    }

    pub fn has_mipmaps(&self) -> bool {
        !self.mipmaps.is_empty()
    }

    /// Number of levels including the base level.
    pub fn levels(&self) -> usize {
        1 + self.mipmaps.len()
    }

    pub fn mipmap(&self, level: usize) -> Option<&MipLevel> {
        level.checked_sub(1).and_then(|i| self.mipmaps.get(i))
    }

    pub(crate) fn set_mipmaps(&mut self, levels: Vec<MipLevel>) {
        self.mipmaps = levels;
    }

    /// Drop the derived mip chain (done after every write to level 0).
    pub fn discard_mipmaps(&mut self) {
        self.mipmaps.clear();
    }
}

impl fmt::Debug for Texture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Texture {{ {}×{}, levels: {} }}", self.width, self.height, self.levels())
    }
}

#[inline]
pub(crate) fn pixel_bytes(width: u32, height: u32) -> usize {
    width as usize * height as usize * 4
}

#[inline]
fn fetch(pixels: &[u8], width: u32, height: u32, x: i64, y: i64) -> [u8; 4] {
    if x < 0 || y < 0 || x >= width as i64 || y >= height as i64 {
        return [0; 4];
    }
    let i = (y as usize * width as usize + x as usize) * 4;
    [pixels[i], pixels[i + 1], pixels[i + 2], pixels[i + 3]]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_keeps_size_when_unchanged() {
        let mut t = Texture::new(4, 4);
        t.clear([9, 9, 9, 9]);
        t.resize(4, 4);
        assert_eq!(t.texel(3, 3), [9, 9, 9, 9]);
        t.resize(2, 3);
        assert_eq!((t.width(), t.height()), (2, 3));
        assert_eq!(t.pixels().len(), 2 * 3 * 4);
        assert_eq!(t.texel(1, 2), [0, 0, 0, 0]);
    }

    #[test]
    fn out_of_range_fetch_is_black() {
        let mut t = Texture::new(2, 2);
        t.clear([255; 4]);
        assert_eq!(t.texel(-1, 0), [0; 4]);
        assert_eq!(t.texel(0, 2), [0; 4]);
        assert_eq!(t.texel(1, 1), [255; 4]);
    }

    #[test]
    fn clear_discards_mipmaps() {
        let mut t = Texture::new(2, 2);
        t.set_mipmaps(vec![MipLevel { width: 1, height: 1, pixels: vec![1, 2, 3, 4] }]);
        assert!(t.has_mipmaps());
        assert_eq!(t.texel_lod(1, 0, 0), [1, 2, 3, 4]);
        t.clear([0; 4]);
        assert!(!t.has_mipmaps());
    }
}
