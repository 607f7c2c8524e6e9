// keypoint/sorter.rs — Sort encoded keypoints by score, on the device.
//
// Three kernels, driven in sequence:
//
//   encoded ──create──► perm[0] ──merge──► perm[1] ⇄ perm[2] ──apply──► output
//                                 (ceil(log2 n) passes, ping-pong)
//
// The permutation texture has PERMUTATION_STRIDE texels per row and one
// texel per slot of the input encoding (see gpu/programs/keypoints.rs).
// `apply` writes the best `max_keypoints` records into a fresh encoding of
// side `output_length`; everything after them is null. Dropping the weakest
// valid keypoints when the output is smaller than the input is expected:
// this is how the clipper keeps its top-K.

use tracing::trace;

use crate::error::Result;
use crate::gpu::kernel::{Arg, Kernel};
use crate::gpu::programs::keypoints::PERMUTATION_STRIDE;
use crate::gpu::programs::GROUP_KEYPOINTS;
use crate::gpu::{GpuContext, TextureHandle};
use crate::keypoint::codec::encoder_capacity;

/// Number of scratch textures `KeypointSorter::sort` needs.
pub const SORTER_TEXTURES: usize = 4;

/// An encoded keypoint texture and its layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodedKeypoints {
    pub texture: TextureHandle,
    pub descriptor_size: usize,
    pub extra_size: usize,
    pub encoder_length: u32,
}

impl EncodedKeypoints {
    pub fn capacity(&self) -> usize {
        encoder_capacity(self.descriptor_size, self.extra_size, self.encoder_length)
    }
}

/// Size of the permutation texture for `capacity` slots.
pub fn permutation_size(capacity: usize) -> (u32, u32) {
    let rows = capacity.div_ceil(PERMUTATION_STRIDE as usize).max(1);
    (PERMUTATION_STRIDE, rows as u32)
}

/// Number of merge passes for `n` permutation texels.
pub fn merge_passes(n: usize) -> u32 {
    match n {
        0 | 1 => 0,
        n => usize::BITS - (n - 1).leading_zeros(),
    }
}

/// Permutation-based merge sort of encoded keypoints.
#[derive(Debug, Clone)]
pub struct KeypointSorter {
    create: Kernel,
    merge: Kernel,
    apply: Kernel,
}

impl KeypointSorter {
    pub fn new(gpu: &GpuContext) -> Result<Self> {
        Ok(KeypointSorter {
            create: gpu.kernel(GROUP_KEYPOINTS, "sortCreatePermutation")?,
            merge: gpu.kernel(GROUP_KEYPOINTS, "sortMergePermutation")?,
            apply: gpu.kernel(GROUP_KEYPOINTS, "sortApplyPermutation")?,
        })
    }

    /// Sort `input` by descending score and write the best `max_keypoints`
    /// records into `textures[3]`, resized to `output_length`².
    ///
    /// `textures[0..3]` hold the permutation while sorting.
    pub fn sort(
        &mut self,
        gpu: &mut GpuContext,
        textures: &[TextureHandle; SORTER_TEXTURES],
        input: EncodedKeypoints,
        max_keypoints: usize,
        output_length: u32,
    ) -> Result<TextureHandle> {
        let d = input.descriptor_size as i32;
        let e = input.extra_size as i32;
        let (w, h) = permutation_size(input.capacity());

        let mut permutation = self.create.outputs(w, h, &[textures[0]])?.call(
            gpu,
            &[
                Arg::Texture(input.texture),
                Arg::Int(d),
                Arg::Int(e),
                Arg::Int(input.encoder_length as i32),
            ],
        )?;

        let passes = merge_passes((w * h) as usize);
        self.merge.outputs(w, h, &[textures[1], textures[2]])?;
        for i in 1..=passes {
            permutation = self.merge.call(
                gpu,
                &[
                    Arg::Texture(permutation),
                    Arg::Int(1 << i),
                    Arg::Int(2 * i as i32),
                ],
            )?;
        }

        let output = self
            .apply
            .outputs(output_length, output_length, &[textures[3]])?
            .call(
                gpu,
                &[
                    Arg::Texture(permutation),
                    Arg::Int(max_keypoints.min(i32::MAX as usize) as i32),
                    Arg::Texture(input.texture),
                    Arg::Int(d),
                    Arg::Int(e),
                ],
            )?;
        trace!(slots = w * h, passes, max_keypoints, output_length, "keypoints sorted");
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permutation_rows_cover_capacity() {
        assert_eq!(permutation_size(0), (32, 1));
        assert_eq!(permutation_size(32), (32, 1));
        assert_eq!(permutation_size(33), (32, 2));
    }

    #[test]
    fn passes_are_ceil_log2() {
        assert_eq!(merge_passes(1), 0);
        assert_eq!(merge_passes(2), 1);
        assert_eq!(merge_passes(32), 5);
        assert_eq!(merge_passes(33), 6);
        assert_eq!(merge_passes(64), 6);
    }
}
