// gpu/programs/keypoints.rs — Keypoint programs: sort network, mixing and
// encoding of detected corners.
//
// PERMUTATION TEXTURE
// ───────────────────
// The sort network never moves whole keypoint records around while it
// sorts. It sorts a small permutation texture instead, one texel per slot
// of the encoded keypoint texture, laid out PERMUTATION_STRIDE texels per
// row:
//
//   texel = [index lo, index hi, score lo, score hi]
//           index: u16 slot of the keypoint in the encoded texture
//           score: half float copied from the keypoint header
//
//   invalid slot (null / discarded / beyond capacity) = [FF, FF, 00, 00]
//
// Sorting is a bottom-up merge sort. Pass i merges adjacent sorted runs of
// 2^(i-1) texels into runs of 2^i; every output texel independently finds
// which element of the merged run belongs at its rank with a binary search
// along the merge path. After ceil(log2 n) passes, `sortApplyPermutation`
// gathers the records into a fresh encoded texture.
//
// Ordering: valid before invalid, then by descending score. On equal scores
// the element from the left run comes first.

use crate::gpu::program::{Fragment, Param, Program};
use crate::gpu::programs::{linear_texel, GROUP_KEYPOINTS};
use crate::gpu::texture::Texture;
use crate::keypoint::codec::{
    classify_header, decode_position, encode_lod, encode_position, encode_rotation,
    encoder_capacity, pixels_per_keypoint, Header, NULL_PIXEL,
};

/// Texels per row of a permutation texture.
pub const PERMUTATION_STRIDE: u32 = 1 << LOG2_PERMUTATION_STRIDE;
pub const LOG2_PERMUTATION_STRIDE: u32 = 5;
/// Longest permutation `shuffleKeypoints` applies. Slots past it keep
/// their place.
pub const SHUFFLE_MAX_LENGTH: usize = 2048;
/// Index marking an invalid permutation entry.
pub const INVALID_INDEX: u16 = 0xFFFF;
pub const INVALID_ENTRY: [u8; 4] = [0xFF, 0xFF, 0, 0];

pub(crate) const PROGRAMS: &[Program] = &[
    Program {
        group: GROUP_KEYPOINTS,
        name: "sortCreatePermutation",
        params: CREATE_PARAMS,
        main: sort_create_permutation,
    },
    Program {
        group: GROUP_KEYPOINTS,
        name: "sortMergePermutation",
        params: MERGE_PARAMS,
        main: sort_merge_permutation,
    },
    Program {
        group: GROUP_KEYPOINTS,
        name: "sortApplyPermutation",
        params: APPLY_PARAMS,
        main: sort_apply_permutation,
    },
    Program {
        group: GROUP_KEYPOINTS,
        name: "mixKeypointsConcat",
        params: CONCAT_PARAMS,
        main: mix_keypoints_concat,
    },
    Program {
        group: GROUP_KEYPOINTS,
        name: "shuffleKeypoints",
        params: SHUFFLE_PARAMS,
        main: shuffle_keypoints,
    },
    Program {
        group: GROUP_KEYPOINTS,
        name: "clipKeypoints",
        params: CLIP_PARAMS,
        main: clip_keypoints,
    },
    Program {
        group: GROUP_KEYPOINTS,
        name: "clipBorder",
        params: CLIP_BORDER_PARAMS,
        main: clip_border,
    },
    Program {
        group: GROUP_KEYPOINTS,
        name: "countCorners",
        params: COUNT_PARAMS,
        main: count_corners,
    },
    Program {
        group: GROUP_KEYPOINTS,
        name: "encodeKeypoints",
        params: ENCODE_PARAMS,
        main: encode_keypoints,
    },
];

/// A decoded permutation entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PermutationEntry {
    pub index: u16,
    pub score: f32,
}

impl PermutationEntry {
    #[inline]
    pub fn decode(texel: [u8; 4]) -> Self {
        PermutationEntry {
            index: u16::from_le_bytes([texel[0], texel[1]]),
            score: half::f16::from_bits(u16::from_le_bytes([texel[2], texel[3]])).to_f32(),
        }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.index != INVALID_INDEX
    }
}

/// `x` goes strictly before `y` in the sorted order.
#[inline]
fn before(x: &PermutationEntry, y: &PermutationEntry) -> bool {
    x.is_valid() && (!y.is_valid() || x.score > y.score)
}

/// Pixel `offset` of the record stored in `slot`.
#[inline]
fn record_pixel(tex: &Texture, ppk: usize, slot: usize, offset: usize) -> [u8; 4] {
    linear_texel(tex, slot * ppk + offset)
}

// ---------------------------------------------------------------------------
// sortCreatePermutation(encodedKeypoints, descriptorSize, extraSize, encoderLength)
// ---------------------------------------------------------------------------

const CREATE_PARAMS: &[Param] = &[
    Param::texture("encodedKeypoints"),
    Param::int("descriptorSize"),
    Param::int("extraSize"),
    Param::int("encoderLength"),
];

fn sort_create_permutation(frag: &Fragment<'_>) -> [u8; 4] {
    const ENCODED: usize = 0;
    let d = frag.int(1) as usize;
    let e = frag.int(2) as usize;
    let capacity = encoder_capacity(d, e, frag.int(3) as u32);
    let ppk = pixels_per_keypoint(d, e);
    let slot = frag.index() as usize;
    if slot >= capacity || slot >= INVALID_INDEX as usize {
        return INVALID_ENTRY;
    }

    let tex = frag.texture(ENCODED);
    let p0 = record_pixel(tex, ppk, slot, 0);
    let p1 = record_pixel(tex, ppk, slot, 1);
    match classify_header(p0, p1) {
        Header::Valid { .. } => {
            let idx = (slot as u16).to_le_bytes();
            [idx[0], idx[1], p1[2], p1[3]]
        }
        Header::Null | Header::Discarded => INVALID_ENTRY,
    }
}

// ---------------------------------------------------------------------------
// sortMergePermutation(permutation, blockSize, dblLog2BlockSize)
// ---------------------------------------------------------------------------

const MERGE_PARAMS: &[Param] = &[
    Param::texture("permutation"),
    Param::int("blockSize"),
    Param::int("dblLog2BlockSize"),
];

fn sort_merge_permutation(frag: &Fragment<'_>) -> [u8; 4] {
    const PERMUTATION: usize = 0;
    let perm = frag.texture(PERMUTATION);
    let block = frag.int(1).max(2) as usize;
    let max_rounds = frag.int(2).max(1) as usize;
    let n = (frag.tex_size.0 * frag.tex_size.1) as usize;
    let half = block / 2;

    let g = frag.index() as usize;
    let base = g - g % block;
    let k = g - base;
    let l_start = base;
    let r_start = (base + half).min(n);
    let r_end = (base + block).min(n);
    let len_l = r_start - l_start;
    let len_r = r_end - r_start;

    let left = |i: usize| PermutationEntry::decode(linear_texel(perm, l_start + i));
    let right = |i: usize| PermutationEntry::decode(linear_texel(perm, r_start + i));

    // merge path: a = how many of the first k merged elements come from L
    let mut lo = k.saturating_sub(len_r);
    let mut hi = k.min(len_l);
    for _ in 0..max_rounds {
        if lo >= hi {
            break;
        }
        let mid = (lo + hi) / 2;
        if before(&right(k - mid - 1), &left(mid)) {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    let a = lo;
    let b = k - a;

    let from_right = if a >= len_l {
        true
    } else if b >= len_r {
        false
    } else {
        before(&right(b), &left(a))
    };
    if from_right {
        linear_texel(perm, r_start + b)
    } else {
        linear_texel(perm, l_start + a)
    }
}

// ---------------------------------------------------------------------------
// sortApplyPermutation(permutation, maxKeypoints, encodedKeypoints,
//                      descriptorSize, extraSize)
// ---------------------------------------------------------------------------

const APPLY_PARAMS: &[Param] = &[
    Param::texture("permutation"),
    Param::int("maxKeypoints"),
    Param::texture("encodedKeypoints"),
    Param::int("descriptorSize"),
    Param::int("extraSize"),
];

fn sort_apply_permutation(frag: &Fragment<'_>) -> [u8; 4] {
    const PERMUTATION: usize = 0;
    const ENCODED: usize = 2;
    let perm = frag.texture(PERMUTATION);
    let max_keypoints = frag.int(1).max(0) as usize;
    let ppk = pixels_per_keypoint(frag.int(3) as usize, frag.int(4) as usize);

    let q = frag.index() as usize;
    let (j, r) = (q / ppk, q % ppk);
    let slots = perm.width() as usize * perm.height() as usize;
    if j >= max_keypoints || j >= slots {
        return NULL_PIXEL;
    }
    let entry = PermutationEntry::decode(linear_texel(perm, j));
    if !entry.is_valid() {
        return NULL_PIXEL;
    }
    record_pixel(frag.texture(ENCODED), ppk, entry.index as usize, r)
}

// ---------------------------------------------------------------------------
// mixKeypointsConcat(encodedKeypointsA, encodedKeypointsB, encoderLengthA,
//                    encoderLengthB, encoderCapacityA, encoderCapacityB,
//                    descriptorSize, extraSize, encoderLength)
// ---------------------------------------------------------------------------

const CONCAT_PARAMS: &[Param] = &[
    Param::texture("encodedKeypointsA"),
    Param::texture("encodedKeypointsB"),
    Param::int("encoderLengthA"),
    Param::int("encoderLengthB"),
    Param::int("encoderCapacityA"),
    Param::int("encoderCapacityB"),
    Param::int("descriptorSize"),
    Param::int("extraSize"),
    Param::int("encoderLength"),
];

fn mix_keypoints_concat(frag: &Fragment<'_>) -> [u8; 4] {
    const A: usize = 0;
    const B: usize = 1;
    let cap_a = frag.int(4).max(0) as usize;
    let cap_b = frag.int(5).max(0) as usize;
    let ppk = pixels_per_keypoint(frag.int(6) as usize, frag.int(7) as usize);

    let q = frag.index() as usize;
    let (j, r) = (q / ppk, q % ppk);
    if j < cap_a {
        let len_a = frag.int(2).max(1) as usize;
        let p = j * ppk + r;
        frag.texel(A, (p % len_a) as i64, (p / len_a) as i64)
    } else if j < cap_a + cap_b {
        let len_b = frag.int(3).max(1) as usize;
        let p = (j - cap_a) * ppk + r;
        frag.texel(B, (p % len_b) as i64, (p / len_b) as i64)
    } else {
        NULL_PIXEL
    }
}

// ---------------------------------------------------------------------------
// shuffleKeypoints(encodedKeypoints, descriptorSize, extraSize, encoderLength,
//                  permutation, permutationLength)
//
// `permutation` holds a permutation p of [0, permutationLength), one texel
// per entry: [index lo, index hi, 0, 255]. Only the list itself (the slots
// before the first null record) is shuffled, so the list stays contiguous:
// with n listed slots and m = min(n, permutationLength), slot j < m takes
// the record of p restricted to [0, m), found by walking p's cycle from j
// until it lands below m.
// ---------------------------------------------------------------------------

const SHUFFLE_PARAMS: &[Param] = &[
    Param::texture("encodedKeypoints"),
    Param::int("descriptorSize"),
    Param::int("extraSize"),
    Param::int("encoderLength"),
    Param::texture("permutation"),
    Param::int("permutationLength"),
];

/// Number of slots before the first null record.
fn listed_slots(tex: &Texture, ppk: usize, capacity: usize) -> usize {
    (0..capacity)
        .find(|&s| {
            let header = classify_header(record_pixel(tex, ppk, s, 0), record_pixel(tex, ppk, s, 1));
            header == Header::Null
        })
        .unwrap_or(capacity)
}

fn shuffle_keypoints(frag: &Fragment<'_>) -> [u8; 4] {
    const ENCODED: usize = 0;
    const PERMUTATION: usize = 4;
    let d = frag.int(1) as usize;
    let e = frag.int(2) as usize;
    let capacity = encoder_capacity(d, e, frag.int(3) as u32);
    let ppk = pixels_per_keypoint(d, e);
    let tex = frag.texture(ENCODED);

    let q = frag.index() as usize;
    let (j, r) = (q / ppk, q % ppk);
    if j >= capacity {
        return NULL_PIXEL;
    }

    let length = (frag.int(5).max(0) as usize).min(SHUFFLE_MAX_LENGTH);
    let m = listed_slots(tex, ppk, capacity).min(length);
    if j >= m {
        return record_pixel(tex, ppk, j, r);
    }

    let perm = frag.texture(PERMUTATION);
    let p = |i: usize| {
        let t = linear_texel(perm, i);
        u16::from_le_bytes([t[0], t[1]]) as usize
    };
    let mut k = p(j);
    for _ in 0..length {
        if k < m {
            break;
        }
        k = p(k.min(length - 1));
    }
    if k >= m {
        // not a permutation; leave the slot alone
        k = j;
    }
    record_pixel(tex, ppk, k, r)
}

// ---------------------------------------------------------------------------
// clipKeypoints(encodedKeypoints, descriptorSize, extraSize, maxKeypoints)
//
// Re-packs the first maxKeypoints slots into the output texture.
// ---------------------------------------------------------------------------

const CLIP_PARAMS: &[Param] = &[
    Param::texture("encodedKeypoints"),
    Param::int("descriptorSize"),
    Param::int("extraSize"),
    Param::int("maxKeypoints"),
];

fn clip_keypoints(frag: &Fragment<'_>) -> [u8; 4] {
    const ENCODED: usize = 0;
    let ppk = pixels_per_keypoint(frag.int(1) as usize, frag.int(2) as usize);
    let max_keypoints = frag.int(3).max(0) as usize;
    let tex = frag.texture(ENCODED);
    let input_slots = tex.width() as usize * tex.height() as usize / ppk;

    let q = frag.index() as usize;
    let (j, r) = (q / ppk, q % ppk);
    if j >= max_keypoints || j >= input_slots {
        return NULL_PIXEL;
    }
    record_pixel(tex, ppk, j, r)
}

// ---------------------------------------------------------------------------
// clipBorder(encodedKeypoints, descriptorSize, extraSize, encoderLength,
//            imageSize, borderSize)
//
// Keeps the keypoints with border.x <= x < width - border.x and
// border.y <= y < height - border.y, in list order, and packs them at the
// front of an encoding of the same size. Discarded records are dropped.
// ---------------------------------------------------------------------------

const CLIP_BORDER_PARAMS: &[Param] = &[
    Param::texture("encodedKeypoints"),
    Param::int("descriptorSize"),
    Param::int("extraSize"),
    Param::int("encoderLength"),
    Param::vec2("imageSize"),
    Param::vec2("borderSize"),
];

fn clip_border(frag: &Fragment<'_>) -> [u8; 4] {
    const ENCODED: usize = 0;
    let d = frag.int(1) as usize;
    let e = frag.int(2) as usize;
    let capacity = encoder_capacity(d, e, frag.int(3) as u32);
    let ppk = pixels_per_keypoint(d, e);
    let [width, height] = frag.vec2(4);
    let [bx, by] = frag.vec2(5);
    let tex = frag.texture(ENCODED);

    let q = frag.index() as usize;
    let (j, r) = (q / ppk, q % ppk);
    if j >= capacity {
        return NULL_PIXEL;
    }

    // the j-th keypoint inside the border
    let mut kept = 0;
    for s in 0..capacity {
        let p0 = record_pixel(tex, ppk, s, 0);
        match classify_header(p0, record_pixel(tex, ppk, s, 1)) {
            Header::Null => break,
            Header::Discarded => continue,
            Header::Valid { .. } => {
                let x = decode_position(u16::from_le_bytes([p0[0], p0[1]]));
                let y = decode_position(u16::from_le_bytes([p0[2], p0[3]]));
                let inside = x >= bx && x < width - bx && y >= by && y < height - by;
                if !inside {
                    continue;
                }
                if kept == j {
                    return record_pixel(tex, ppk, s, r);
                }
                kept += 1;
            }
        }
    }
    NULL_PIXEL
}

// ---------------------------------------------------------------------------
// Corner encoding
//
// A corner texture has one texel per image pixel:
//   [score lo, score hi, 0, 255] at a corner (half float score)
//   [0, 0, 0, 0]                 elsewhere
//
// countCorners produces a 1×(H+1) texture whose texel y holds, as a u32 LE,
// the number of corners in rows [0, y). encodeKeypoints then locates the
// j-th corner in raster order with a binary search over those offsets and
// a scan of one row.
// ---------------------------------------------------------------------------

/// Alpha of a corner texel.
pub const CORNER_FLAG: u8 = 255;

const COUNT_PARAMS: &[Param] = &[Param::texture("corners")];

fn count_corners(frag: &Fragment<'_>) -> [u8; 4] {
    const CORNERS: usize = 0;
    let corners = frag.texture(CORNERS);
    let rows = frag.y.min(corners.height());
    let mut count = 0u32;
    for y in 0..rows as i64 {
        for x in 0..corners.width() as i64 {
            if corners.texel(x, y)[3] == CORNER_FLAG {
                count += 1;
            }
        }
    }
    count.to_le_bytes()
}

const ENCODE_PARAMS: &[Param] = &[
    Param::texture("corners"),
    Param::texture("rowOffsets"),
    Param::int("capacity"),
    Param::int("descriptorSize"),
    Param::int("extraSize"),
];

fn encode_keypoints(frag: &Fragment<'_>) -> [u8; 4] {
    const CORNERS: usize = 0;
    const OFFSETS: usize = 1;
    let capacity = frag.int(2).max(0) as usize;
    let ppk = pixels_per_keypoint(frag.int(3) as usize, frag.int(4) as usize);

    let q = frag.index() as usize;
    let (j, r) = (q / ppk, q % ppk);
    if j >= capacity {
        return NULL_PIXEL;
    }

    let corners = frag.texture(CORNERS);
    let offsets = frag.texture(OFFSETS);
    let offset = |y: u32| u32::from_le_bytes(offsets.texel(0, y as i64)) as usize;
    let rows = corners.height();
    if j >= offset(rows) {
        return NULL_PIXEL;
    }

    // last row y with offset(y) <= j
    let (mut lo, mut hi) = (0u32, rows);
    while hi - lo > 1 {
        let mid = (lo + hi) / 2;
        if offset(mid) <= j {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    let y = lo;
    let mut remaining = j - offset(y);
    let mut found = None;
    for x in 0..corners.width() {
        let t = corners.texel(x as i64, y as i64);
        if t[3] == CORNER_FLAG {
            if remaining == 0 {
                found = Some((x, t));
                break;
            }
            remaining -= 1;
        }
    }
    let Some((x, texel)) = found else {
        return NULL_PIXEL;
    };

    match r {
        0 => {
            let px = encode_position(x as f32).to_le_bytes();
            let py = encode_position(y as f32).to_le_bytes();
            [px[0], px[1], py[0], py[1]]
        }
        1 => [encode_lod(0.0), encode_rotation(0.0), texel[0], texel[1]],
        _ => [0; 4],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: u16, score: f32) -> PermutationEntry {
        PermutationEntry { index, score }
    }

    #[test]
    fn ordering_puts_valid_and_stronger_first() {
        let invalid = PermutationEntry::decode(INVALID_ENTRY);
        assert!(!invalid.is_valid());
        assert!(before(&entry(0, 1.0), &invalid));
        assert!(!before(&invalid, &entry(0, 1.0)));
        assert!(before(&entry(0, 2.0), &entry(1, 1.0)));
        assert!(!before(&entry(0, 1.0), &entry(1, 1.0)));
        assert!(!before(&invalid, &invalid));
    }
}
