// gpu/programs/pyramids.rs — Gaussian pyramid programs.
//
// One pyramid level is built from the previous one in three passes:
//
//   smoothX(image, kernel)   horizontal 5-tap blur
//   smoothY(image, kernel)   vertical 5-tap blur
//   downsample2(image)       dst(x, y) = src(2x, 2y)
//
// With the binomial kernel [1 4 6 4 1] / 16 the two blur passes form the
// classic separable 5×5 Gaussian. Samples outside the image are clamped to
// the nearest edge pixel, so a constant image stays constant. All four
// channels are filtered independently.

use crate::gpu::program::{Fragment, Param, Program};
use crate::gpu::programs::GROUP_PYRAMIDS;
use crate::gpu::texture::Texture;

/// Binomial approximation of a Gaussian with σ ≈ 1.
pub const GAUSSIAN_KERNEL_5: [f32; 5] = [
    1.0 / 16.0,
    4.0 / 16.0,
    6.0 / 16.0,
    4.0 / 16.0,
    1.0 / 16.0,
];

pub(crate) const PROGRAMS: &[Program] = &[
    Program {
        group: GROUP_PYRAMIDS,
        name: "smoothX",
        params: SMOOTH_PARAMS,
        main: smooth_x,
    },
    Program {
        group: GROUP_PYRAMIDS,
        name: "smoothY",
        params: SMOOTH_PARAMS,
        main: smooth_y,
    },
    Program {
        group: GROUP_PYRAMIDS,
        name: "downsample2",
        params: DOWNSAMPLE_PARAMS,
        main: downsample2,
    },
];

const SMOOTH_PARAMS: &[Param] = &[Param::texture("image"), Param::float_array("kernel", 5)];
const DOWNSAMPLE_PARAMS: &[Param] = &[Param::texture("image")];

/// Output size of `downsample2` for a `width`×`height` input.
pub fn half_size(width: u32, height: u32) -> (u32, u32) {
    ((width / 2).max(1), (height / 2).max(1))
}

#[inline]
fn clamped_texel(tex: &Texture, x: i64, y: i64) -> [u8; 4] {
    let x = x.clamp(0, tex.width() as i64 - 1);
    let y = y.clamp(0, tex.height() as i64 - 1);
    tex.texel(x, y)
}

fn convolve(frag: &Fragment<'_>, dx: i64, dy: i64) -> [u8; 4] {
    const IMAGE: usize = 0;
    const KERNEL: usize = 1;
    let image = frag.texture(IMAGE);
    let kernel = frag.array(KERNEL);
    let mut acc = [0.0f32; 4];
    for (i, &w) in kernel.iter().take(5).enumerate() {
        let o = i as i64 - 2;
        let t = clamped_texel(image, frag.x as i64 + o * dx, frag.y as i64 + o * dy);
        for c in 0..4 {
            acc[c] += w * t[c] as f32;
        }
    }
    acc.map(|v| v.round().clamp(0.0, 255.0) as u8)
}

fn smooth_x(frag: &Fragment<'_>) -> [u8; 4] {
    convolve(frag, 1, 0)
}

fn smooth_y(frag: &Fragment<'_>) -> [u8; 4] {
    convolve(frag, 0, 1)
}

fn downsample2(frag: &Fragment<'_>) -> [u8; 4] {
    frag.texel(0, 2 * frag.x as i64, 2 * frag.y as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_is_normalised() {
        let sum: f32 = GAUSSIAN_KERNEL_5.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
    }

    #[test]
    fn half_size_never_reaches_zero() {
        assert_eq!(half_size(64, 48), (32, 24));
        assert_eq!(half_size(5, 1), (2, 1));
    }
}
