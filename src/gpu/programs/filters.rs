// gpu/programs/filters.rs — Colour filters.
//
// rgb2grey uses the ITU-R BT.601 luma coefficients:
//   Y = 0.299 R + 0.587 G + 0.114 B
// and writes Y to the RGB channels, keeping alpha.

use crate::gpu::program::{Fragment, Param, Program};
use crate::gpu::programs::GROUP_FILTERS;

pub(crate) const PROGRAMS: &[Program] = &[Program {
    group: GROUP_FILTERS,
    name: "rgb2grey",
    params: RGB2GREY_PARAMS,
    main: rgb2grey,
}];

const RGB2GREY_PARAMS: &[Param] = &[Param::texture("image")];

/// Luma of an RGB triple, rounded to the nearest byte.
#[inline]
pub fn luma(r: u8, g: u8, b: u8) -> u8 {
    let y = 0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32;
    y.round().clamp(0.0, 255.0) as u8
}

fn rgb2grey(frag: &Fragment<'_>) -> [u8; 4] {
    let [r, g, b, a] = frag.texel_here(0);
    let y = luma(r, g, b);
    [y, y, y, a]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn luma_weights() {
        assert_eq!(luma(255, 255, 255), 255);
        assert_eq!(luma(0, 0, 0), 0);
        assert_eq!(luma(255, 0, 0), 76);
        assert_eq!(luma(0, 255, 0), 150);
        assert_eq!(luma(0, 0, 255), 29);
    }
}
