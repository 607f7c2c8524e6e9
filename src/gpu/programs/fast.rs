// gpu/programs/fast.rs — FAST corner detection programs.
//
// Reference: Rosten & Drummond, "Machine learning for high-speed corner
// detection" (ECCV 2006).
//
// fastScore(image, threshold, arcLength)
//   For each pixel, sample 16 points on a Bresenham circle of radius 3 and
//   classify each as BRIGHTER, DARKER or SIMILAR relative to the centre
//   ± threshold. The pixel is a corner if ≥ N contiguous circle pixels
//   (wrapping around) are all BRIGHTER or all DARKER. The 3-pixel border is
//   never a corner. Reads the red channel, i.e. expects a greyscale image.
//
// nonmaxSuppression(corners)
//   Keeps a corner only if no corner in its 3×3 neighbourhood beats it.
//   Equal scores are broken in raster order, so a plateau of equal corners
//   keeps exactly its first pixel.
//
// Both write the corner texture format documented in `keypoints.rs`.

use crate::gpu::program::{Fragment, Param, Program};
use crate::gpu::programs::keypoints::CORNER_FLAG;
use crate::gpu::programs::GROUP_KEYPOINTS;
use crate::keypoint::codec::{decode_score, encode_score};

/// Bresenham circle of radius 3: 16 (dx, dy) offsets, clockwise from
/// 12 o'clock.
pub const CIRCLE_OFFSETS: [(i64, i64); 16] = [
    (0, -3), (1, -3), (2, -2), (3, -1),
    (3, 0), (3, 1), (2, 2), (1, 3),
    (0, 3), (-1, 3), (-2, 2), (-3, 1),
    (-3, 0), (-3, -1), (-2, -2), (-1, -3),
];

pub(crate) const PROGRAMS: &[Program] = &[
    Program {
        group: GROUP_KEYPOINTS,
        name: "fastScore",
        params: SCORE_PARAMS,
        main: fast_score,
    },
    Program {
        group: GROUP_KEYPOINTS,
        name: "nonmaxSuppression",
        params: NMS_PARAMS,
        main: nonmax_suppression,
    },
];

const SCORE_PARAMS: &[Param] = &[
    Param::texture("image"),
    Param::int("threshold"),
    Param::int("arcLength"),
];

const NMS_PARAMS: &[Param] = &[Param::texture("corners")];

/// Corner texel for a given score.
#[inline]
pub fn corner_texel(score: f32) -> [u8; 4] {
    let s = encode_score(score);
    [s[0], s[1], 0, CORNER_FLAG]
}

/// Score of a corner texel, or `None` for a non-corner.
#[inline]
pub fn texel_score(t: [u8; 4]) -> Option<f32> {
    (t[3] == CORNER_FLAG).then(|| decode_score([t[0], t[1]]))
}

fn fast_score(frag: &Fragment<'_>) -> [u8; 4] {
    const IMAGE: usize = 0;
    let image = frag.texture(IMAGE);
    let (w, h) = (image.width() as i64, image.height() as i64);
    let (x, y) = (frag.x as i64, frag.y as i64);
    if x < 3 || y < 3 || x >= w - 3 || y >= h - 3 {
        return [0; 4];
    }

    let threshold = frag.int(1).clamp(0, 255) as i16;
    let arc_length = frag.int(2).clamp(9, 12) as usize;
    let center = image.texel(x, y)[0] as i16;

    // Quick rejection on the four cardinal points.
    let min_cardinals = if arc_length >= 12 { 3 } else { 2 };
    let (mut bright, mut dark) = (0, 0);
    for i in [0, 4, 8, 12] {
        let (dx, dy) = CIRCLE_OFFSETS[i];
        let p = image.texel(x + dx, y + dy)[0] as i16;
        bright += (p > center + threshold) as u32;
        dark += (p < center - threshold) as u32;
    }
    if bright < min_cardinals && dark < min_cardinals {
        return [0; 4];
    }

    let mut circle = [0i16; 16];
    for (i, &(dx, dy)) in CIRCLE_OFFSETS.iter().enumerate() {
        circle[i] = image.texel(x + dx, y + dy)[0] as i16;
    }
    match segment_test(center, &circle, threshold, arc_length) {
        Some(score) => corner_texel(score),
        None => [0; 4],
    }
}

/// FAST-N segment test. Returns the corner score (sum of |diff| − threshold
/// over the longest qualifying arc) if the pixel is a corner.
pub fn segment_test(center: i16, circle: &[i16; 16], threshold: i16, n: usize) -> Option<f32> {
    let mut bright_mask: u16 = 0;
    let mut dark_mask: u16 = 0;
    for (i, &p) in circle.iter().enumerate() {
        let diff = p - center;
        if diff > threshold {
            bright_mask |= 1 << i;
        } else if diff < -threshold {
            dark_mask |= 1 << i;
        }
    }

    let mut best: Option<f32> = None;
    for mask in [bright_mask, dark_mask] {
        if (mask.count_ones() as usize) < n || !has_run(mask, n) {
            continue;
        }
        let score = best_arc_score(center, circle, threshold, mask);
        best = Some(best.map_or(score, |b| b.max(score)));
    }
    best
}

/// N contiguous set bits in a circular 16-bit mask. Doubling the mask into
/// a u32 handles the wrap-around; AND-shifting N−1 times leaves a bit set
/// only where a run of N starts.
fn has_run(mask: u16, n: usize) -> bool {
    let m32 = mask as u32 | (mask as u32) << 16;
    let mut acc = m32;
    for _ in 1..n {
        acc &= acc >> 1;
    }
    acc != 0
}

fn best_arc_score(center: i16, circle: &[i16; 16], threshold: i16, mask: u16) -> f32 {
    let m32 = mask as u32 | (mask as u32) << 16;
    let (mut best_start, mut best_len) = (0usize, 0usize);
    let mut i = 0u32;
    while i < 16 {
        if m32 & (1 << i) == 0 {
            i += 1;
            continue;
        }
        let start = i;
        while i < 32 && m32 & (1 << i) != 0 {
            i += 1;
        }
        let len = (i - start) as usize;
        if len > best_len {
            best_len = len;
            best_start = start as usize;
        }
    }
    (best_start..best_start + best_len.min(16))
        .map(|j| ((circle[j % 16] - center).abs() - threshold).max(0) as f32)
        .sum()
}

fn nonmax_suppression(frag: &Fragment<'_>) -> [u8; 4] {
    const CORNERS: usize = 0;
    let corners = frag.texture(CORNERS);
    let (x, y) = (frag.x as i64, frag.y as i64);
    let here = corners.texel(x, y);
    let Some(score) = texel_score(here) else {
        return [0; 4];
    };
    for dy in -1..=1i64 {
        for dx in -1..=1i64 {
            if dx == 0 && dy == 0 {
                continue;
            }
            let Some(other) = texel_score(corners.texel(x + dx, y + dy)) else {
                continue;
            };
            let earlier = dy < 0 || (dy == 0 && dx < 0);
            if other > score || (other == score && earlier) {
                return [0; 4];
            }
        }
    }
    here
}
