// keypoint/codec.rs — Binary layout of keypoints inside RGBA8 textures.
//
// ENCODED RECORD
// ──────────────
// Every keypoint occupies `pixels_per_keypoint(d, e)` consecutive pixels of
// a square L×L texture (row-major), starting with an 8-byte header:
//
//   pixel 0   R G = x    u16 LE fixed point, FIX_BITS fractional bits
//             B A = y    u16 LE fixed point
//   pixel 1   R   = lod byte (255 = no scale information)
//             G   = orientation byte
//             B A = score as an IEEE-754 half float, LE
//   then      e extra bytes, then d descriptor bytes, zero padded to a
//             whole number of pixels
//
// Two headers are special:
//   all ones  (x ≥ 0xFFFF and y ≥ 0xFFFF)  null: end of the list
//   all zeros                              discarded: skip, list continues
//
// Unused slots and the padding after the last slot hold null pixels.
//
// SIZING
// ──────
//   ppk      = ceil((8 + d + e) / 4)
//   length   = max(MIN_ENCODER_LENGTH, ceil(sqrt(capacity · ppk)))
//   capacity = floor(length² / ppk)
//
// The square root is taken in integers so that `encoder_length` is exact
// for every capacity: length² ≥ capacity · ppk, and (length − 1)² is not,
// whenever length > MIN_ENCODER_LENGTH.

use std::f32::consts::PI;

use half::f16;

use crate::keypoint::Keypoint;

/// Fractional bits of the fixed-point position.
pub const FIX_BITS: u32 = 3;
/// 2^FIX_BITS.
pub const FIX_RESOLUTION: f32 = (1 << FIX_BITS) as f32;
/// log2 of the largest pyramid scale (2×).
pub const LOG2_PYRAMID_MAX_SCALE: f32 = 1.0;
/// Number of pyramid levels a lod byte can address.
pub const PYRAMID_MAX_LEVELS: u32 = 4;
/// Bytes of the header.
pub const MIN_KEYPOINT_SIZE: usize = 8;
/// Smallest side of an encoded keypoint texture.
pub const MIN_ENCODER_LENGTH: u32 = 2;
/// Largest capacity a node may be configured with.
pub const MAX_ENCODER_CAPACITY: usize = 8192;
/// Capacity used by keypoint sources unless configured otherwise.
pub const DEFAULT_ENCODER_CAPACITY: usize = 2048;

/// The pixel used for null records and padding.
pub const NULL_PIXEL: [u8; 4] = [0xFF; 4];
/// Lod byte meaning "no scale information".
pub const LOD_NONE: u8 = 255;

/// Classification of an encoded header.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Header {
    /// End of the list.
    Null,
    /// Skipped record; the list continues.
    Discarded,
    Valid { score: f32 },
}

/// Classify the two header pixels of a record.
#[inline]
pub fn classify_header(p0: [u8; 4], p1: [u8; 4]) -> Header {
    let x = u16::from_le_bytes([p0[0], p0[1]]);
    let y = u16::from_le_bytes([p0[2], p0[3]]);
    if x == 0xFFFF && y == 0xFFFF {
        Header::Null
    } else if p0 == [0; 4] && p1 == [0; 4] {
        Header::Discarded
    } else {
        Header::Valid { score: decode_score([p1[2], p1[3]]) }
    }
}

#[inline]
pub fn pixels_per_keypoint(descriptor_size: usize, extra_size: usize) -> usize {
    (MIN_KEYPOINT_SIZE + descriptor_size + extra_size).div_ceil(4)
}

/// Side of the smallest square texture holding `capacity` keypoints.
pub fn encoder_length(capacity: usize, descriptor_size: usize, extra_size: usize) -> u32 {
    let ppk = pixels_per_keypoint(descriptor_size, extra_size) as u64;
    let len = ceil_isqrt(capacity as u64 * ppk);
    (len as u32).max(MIN_ENCODER_LENGTH)
}

/// Number of keypoints an L×L texture holds.
pub fn encoder_capacity(descriptor_size: usize, extra_size: usize, encoder_length: u32) -> usize {
    let ppk = pixels_per_keypoint(descriptor_size, extra_size);
    let l = encoder_length as usize;
    l * l / ppk
}

/// ceil(sqrt(n)), exactly.
pub fn ceil_isqrt(n: u64) -> u64 {
    if n == 0 {
        return 0;
    }
    let n = n as u128;
    let mut r = (n as f64).sqrt() as u128;
    while r * r > n {
        r -= 1;
    }
    while (r + 1) * (r + 1) <= n {
        r += 1;
    }
    if r * r == n {
        r as u64
    } else {
        r as u64 + 1
    }
}

// ---------------------------------------------------------------------------
// Field encodings
// ---------------------------------------------------------------------------

#[inline]
pub fn encode_position(v: f32) -> u16 {
    (v * FIX_RESOLUTION).round().clamp(0.0, 65534.0) as u16
}

#[inline]
pub fn decode_position(v: u16) -> f32 {
    v as f32 / FIX_RESOLUTION
}

pub fn encode_lod(lod: f32) -> u8 {
    let m = LOG2_PYRAMID_MAX_SCALE;
    let h = PYRAMID_MAX_LEVELS as f32;
    ((lod + m) * 255.0 / (m + h)).round().clamp(0.0, 254.0) as u8
}

/// Inverse of `encode_lod`; `LOD_NONE` decodes to the base level.
pub fn decode_lod(b: u8) -> f32 {
    if b == LOD_NONE {
        return 0.0;
    }
    let m = LOG2_PYRAMID_MAX_SCALE;
    let h = PYRAMID_MAX_LEVELS as f32;
    -m + (m + h) * b as f32 / 255.0
}

pub fn encode_rotation(rotation: f32) -> u8 {
    ((rotation / PI * 255.0 + 255.0) / 2.0).round().clamp(0.0, 255.0) as u8
}

pub fn decode_rotation(b: u8) -> f32 {
    (2.0 * b as f32 - 255.0) * PI / 255.0
}

#[inline]
pub fn encode_score(score: f32) -> [u8; 2] {
    f16::from_f32(score).to_bits().to_le_bytes()
}

#[inline]
pub fn decode_score(bytes: [u8; 2]) -> f32 {
    f16::from_bits(u16::from_le_bytes(bytes)).to_f32()
}

/// The two header pixels of a keypoint.
pub fn encode_header(kp: &Keypoint) -> [[u8; 4]; 2] {
    let x = encode_position(kp.x).to_le_bytes();
    let y = encode_position(kp.y).to_le_bytes();
    let s = encode_score(kp.score);
    [
        [x[0], x[1], y[0], y[1]],
        [encode_lod(kp.lod), encode_rotation(kp.rotation), s[0], s[1]],
    ]
}

// ---------------------------------------------------------------------------
// Whole lists
// ---------------------------------------------------------------------------

/// Encode keypoints into an L×L RGBA8 buffer. Keypoints beyond the
/// capacity of the texture are dropped; extra and descriptor bytes are
/// truncated or zero-padded to the layout.
pub fn encode_keypoints(
    keypoints: &[Keypoint],
    descriptor_size: usize,
    extra_size: usize,
    encoder_length: u32,
) -> Vec<u8> {
    let l = encoder_length as usize;
    let ppk = pixels_per_keypoint(descriptor_size, extra_size);
    let capacity = encoder_capacity(descriptor_size, extra_size, encoder_length);
    let mut pixels = NULL_PIXEL.repeat(l * l);

    for (i, kp) in keypoints.iter().take(capacity).enumerate() {
        let record = &mut pixels[i * ppk * 4..(i + 1) * ppk * 4];
        record.fill(0);
        let [p0, p1] = encode_header(kp);
        record[0..4].copy_from_slice(&p0);
        record[4..8].copy_from_slice(&p1);
        let extra = &mut record[MIN_KEYPOINT_SIZE..MIN_KEYPOINT_SIZE + extra_size];
        let n = kp.extra.len().min(extra_size);
        extra[..n].copy_from_slice(&kp.extra[..n]);
        let start = MIN_KEYPOINT_SIZE + extra_size;
        let descriptor = &mut record[start..start + descriptor_size];
        let n = kp.descriptor.len().min(descriptor_size);
        descriptor[..n].copy_from_slice(&kp.descriptor[..n]);
    }
    pixels
}

/// Decode an encoded keypoint buffer, stopping at the first null record
/// and skipping discarded ones.
pub fn decode_keypoints(
    pixels: &[u8],
    descriptor_size: usize,
    extra_size: usize,
    encoder_length: u32,
) -> Vec<Keypoint> {
    let record_len = pixels_per_keypoint(descriptor_size, extra_size) * 4;
    let capacity = encoder_capacity(descriptor_size, extra_size, encoder_length);
    let mut keypoints = Vec::new();

    for record in pixels.chunks_exact(record_len).take(capacity) {
        let p0 = [record[0], record[1], record[2], record[3]];
        let p1 = [record[4], record[5], record[6], record[7]];
        let score = match classify_header(p0, p1) {
            Header::Null => break,
            Header::Discarded => continue,
            Header::Valid { score } => score,
        };
        let extra_end = MIN_KEYPOINT_SIZE + extra_size;
        keypoints.push(Keypoint {
            x: decode_position(u16::from_le_bytes([p0[0], p0[1]])),
            y: decode_position(u16::from_le_bytes([p0[2], p0[3]])),
            lod: decode_lod(p1[0]),
            rotation: decode_rotation(p1[1]),
            score,
            extra: record[MIN_KEYPOINT_SIZE..extra_end].to_vec(),
            descriptor: record[extra_end..extra_end + descriptor_size].to_vec(),
        });
    }
    keypoints
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isqrt_is_exact_around_perfect_squares() {
        assert_eq!(ceil_isqrt(0), 0);
        assert_eq!(ceil_isqrt(1), 1);
        assert_eq!(ceil_isqrt(15), 4);
        assert_eq!(ceil_isqrt(16), 4);
        assert_eq!(ceil_isqrt(17), 5);
        let big = 4_294_967_295u64; // (2^32 - 1)
        assert_eq!(ceil_isqrt(big * big), big);
        assert_eq!(ceil_isqrt(big * big + 1), big + 1);
    }

    #[test]
    fn header_only_layout() {
        assert_eq!(pixels_per_keypoint(0, 0), 2);
        assert_eq!(pixels_per_keypoint(32, 0), 10);
        assert_eq!(pixels_per_keypoint(0, 1), 3);
        assert_eq!(encoder_length(10, 0, 0), 5);
        assert_eq!(encoder_capacity(0, 0, 5), 12);
        assert_eq!(encoder_length(0, 0, 0), MIN_ENCODER_LENGTH);
    }

    #[test]
    fn field_encodings_round_trip() {
        assert_eq!(decode_position(encode_position(12.375)), 12.375);
        assert_eq!(encode_lod(0.0), 51);
        assert_eq!(decode_lod(51), 0.0);
        assert_eq!(decode_lod(LOD_NONE), 0.0);
        assert!((decode_rotation(encode_rotation(PI)) - PI).abs() < 1e-5);
        assert!((decode_rotation(encode_rotation(-PI)) + PI).abs() < 1e-5);
        assert!(decode_rotation(encode_rotation(0.0)).abs() < PI / 255.0 + 1e-6);
        assert_eq!(decode_score(encode_score(5.0)), 5.0);
    }

    #[test]
    fn special_headers() {
        assert_eq!(classify_header(NULL_PIXEL, NULL_PIXEL), Header::Null);
        assert_eq!(classify_header([0; 4], [0; 4]), Header::Discarded);
        let [p0, p1] = encode_header(&Keypoint::new(1.0, 2.0, 3.0));
        assert_eq!(classify_header(p0, p1), Header::Valid { score: 3.0 });
    }

    #[test]
    fn decode_stops_at_null_and_skips_discarded() {
        let kps = vec![
            Keypoint::new(1.0, 1.0, 1.0),
            Keypoint::new(2.0, 2.0, 2.0),
            Keypoint::new(3.0, 3.0, 3.0),
        ];
        let mut pixels = encode_keypoints(&kps, 0, 0, 4);
        pixels[8..16].fill(0); // discard the second record
        let out = decode_keypoints(&pixels, 0, 0, 4);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].x, 1.0);
        assert_eq!(out[1].score, 3.0);
    }

    #[test]
    fn descriptor_and_extra_bytes_are_kept_apart() {
        let kp = Keypoint::new(4.0, 5.0, 1.0)
            .with_extra(vec![1, 2, 3, 4])
            .with_descriptor(vec![9; 8]);
        let len = encoder_length(1, 8, 4);
        let pixels = encode_keypoints(&[kp.clone()], 8, 4, len);
        let out = decode_keypoints(&pixels, 8, 4, len);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].extra, kp.extra);
        assert_eq!(out[0].descriptor, kp.descriptor);
    }
}
