// gpu/programs/utils.rs — Utility programs.

use crate::gpu::program::{Fragment, Param, Program};
use crate::gpu::programs::GROUP_UTILS;

pub(crate) const PROGRAMS: &[Program] = &[Program {
    group: GROUP_UTILS,
    name: "copy",
    params: COPY_PARAMS,
    main: copy,
}];

const COPY_PARAMS: &[Param] = &[Param::texture("image")];

/// `copy(image)`: pixel-exact copy. The viewport is usually the size of the
/// image; anything outside it reads as transparent black.
fn copy(frag: &Fragment<'_>) -> [u8; 4] {
    frag.texel_here(0)
}
