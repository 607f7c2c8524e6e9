// media.rs — Host-side RGBA8 bitmaps.
//
// A `Bitmap` is what crosses the host/device boundary in both directions:
//
//   ImageSource.set_media(bitmap)  ──upload──►  pooled texture
//   pooled texture  ──readback──►  ImageSink.export() -> Bitmap
//
// Layout: row-major, tightly packed, 4 bytes per pixel (R, G, B, A). Unlike
// a general image container there is no stride: textures on the device are
// always tightly packed, so a padded host layout would only force a
// compaction copy on every upload.

use std::fmt;

/// Bytes per RGBA8 pixel.
pub const BYTES_PER_PIXEL: usize = 4;

/// A tightly packed RGBA8 image living in host memory.
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl Bitmap {
    /// Create a transparent black bitmap.
    pub fn new(width: u32, height: u32) -> Self {
        Bitmap {
            width,
            height,
            data: vec![0; width as usize * height as usize * BYTES_PER_PIXEL],
        }
    }

    /// Create a bitmap filled with a single colour.
    pub fn filled(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let data = rgba
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * BYTES_PER_PIXEL)
            .collect();
        Bitmap { width, height, data }
    }

    /// Wrap an existing RGBA8 buffer.
    ///
    /// # Panics
    /// Panics if `data.len() != width * height * 4`.
    pub fn from_rgba(width: u32, height: u32, data: Vec<u8>) -> Self {
        assert_eq!(
            data.len(),
            width as usize * height as usize * BYTES_PER_PIXEL,
            "data length ({}) must equal width * height * 4 ({})",
            data.len(),
            width as usize * height as usize * BYTES_PER_PIXEL,
        );
        Bitmap { width, height, data }
    }

    /// Expand a single-channel luminance buffer into opaque RGBA.
    ///
    /// # Panics
    /// Panics if `luma.len() != width * height`.
    pub fn from_luma(width: u32, height: u32, luma: &[u8]) -> Self {
        assert_eq!(
            luma.len(),
            width as usize * height as usize,
            "luma length ({}) must equal width * height ({})",
            luma.len(),
            width as usize * height as usize,
        );
        let data = luma.iter().flat_map(|&v| [v, v, v, 255]).collect();
        Bitmap { width, height, data }
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// The RGBA value at (x, y).
    ///
    /// # Panics
    /// Panics if (x, y) is out of bounds.
    #[inline]
    pub fn get(&self, x: u32, y: u32) -> [u8; 4] {
        let i = self.index(x, y);
        [self.data[i], self.data[i + 1], self.data[i + 2], self.data[i + 3]]
    }

    #[inline]
    pub fn set(&mut self, x: u32, y: u32, rgba: [u8; 4]) {
        let i = self.index(x, y);
        self.data[i..i + BYTES_PER_PIXEL].copy_from_slice(&rgba);
    }

    /// Raw RGBA bytes, row-major.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// The red channel of every pixel, which is the luminance of a
    /// greyscale image.
    pub fn luma(&self) -> Vec<u8> {
        self.data.chunks_exact(BYTES_PER_PIXEL).map(|p| p[0]).collect()
    }

    #[inline]
    fn index(&self, x: u32, y: u32) -> usize {
        assert!(
            x < self.width && y < self.height,
            "pixel ({x},{y}) out of bounds for bitmap {}×{}",
            self.width,
            self.height,
        );
        (y as usize * self.width as usize + x as usize) * BYTES_PER_PIXEL
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bitmap {{ {}×{} }}", self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filled_bitmap_repeats_colour() {
        let b = Bitmap::filled(3, 2, [1, 2, 3, 4]);
        assert_eq!(b.as_bytes().len(), 3 * 2 * 4);
        assert_eq!(b.get(2, 1), [1, 2, 3, 4]);
    }

    #[test]
    fn luma_round_trips_through_rgba() {
        let luma: Vec<u8> = (0..12).collect();
        let b = Bitmap::from_luma(4, 3, &luma);
        assert_eq!(b.get(1, 0), [1, 1, 1, 255]);
        assert_eq!(b.luma(), luma);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn get_out_of_bounds_panics() {
        Bitmap::new(2, 2).get(2, 0);
    }
}
