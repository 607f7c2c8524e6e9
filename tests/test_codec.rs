// tests/test_codec.rs — Keypoint encoding: sizing laws and list layout.
//
// The sizing functions decide every keypoint texture's size, so they are
// checked as laws over random layouts rather than on a few hand-picked
// values.

use proptest::prelude::*;

use rudolf_flow::keypoint::codec::{
    decode_keypoints, encode_keypoints, encoder_capacity, encoder_length, pixels_per_keypoint,
    MAX_ENCODER_CAPACITY, MIN_ENCODER_LENGTH, NULL_PIXEL,
};
use rudolf_flow::Keypoint;

proptest! {
    #[test]
    fn encoder_length_is_the_smallest_that_fits(
        capacity in 0usize..=MAX_ENCODER_CAPACITY,
        d in (0usize..16).prop_map(|k| 4 * k),
        e in 0usize..16,
    ) {
        let length = encoder_length(capacity, d, e);
        prop_assert!(length >= MIN_ENCODER_LENGTH);
        prop_assert!(encoder_capacity(d, e, length) >= capacity);
        if length > MIN_ENCODER_LENGTH {
            prop_assert!(encoder_capacity(d, e, length - 1) < capacity);
        }
    }

    #[test]
    fn records_never_straddle_the_texture_end(
        length in MIN_ENCODER_LENGTH..64,
        d in (0usize..16).prop_map(|k| 4 * k),
        e in 0usize..16,
    ) {
        let ppk = pixels_per_keypoint(d, e);
        let capacity = encoder_capacity(d, e, length);
        prop_assert!(capacity * ppk <= (length * length) as usize);
    }
}

fn grid(n: usize) -> Vec<Keypoint> {
    (0..n)
        .map(|i| Keypoint::new(i as f32 * 1.5, 100.0 - i as f32, 1.0 + i as f32 * 0.25))
        .collect()
}

#[test]
fn list_survives_encoding_in_order() {
    let keypoints = grid(20);
    let length = encoder_length(32, 0, 0);
    let pixels = encode_keypoints(&keypoints, 0, 0, length);
    assert_eq!(pixels.len(), (length * length * 4) as usize);

    let decoded = decode_keypoints(&pixels, 0, 0, length);
    assert_eq!(decoded.len(), keypoints.len());
    for (a, b) in keypoints.iter().zip(&decoded) {
        assert_eq!(a.x, b.x);
        assert_eq!(a.y, b.y);
        assert!((a.score - b.score).abs() <= a.score * 1e-3);
    }
}

#[test]
fn keypoints_beyond_capacity_are_dropped() {
    let length = encoder_length(8, 0, 0);
    let capacity = encoder_capacity(0, 0, length);
    let pixels = encode_keypoints(&grid(capacity + 5), 0, 0, length);
    assert_eq!(decode_keypoints(&pixels, 0, 0, length).len(), capacity);
}

#[test]
fn unused_slots_are_null() {
    let length = encoder_length(16, 0, 0);
    let pixels = encode_keypoints(&grid(3), 0, 0, length);
    let ppk = pixels_per_keypoint(0, 0);
    let tail = &pixels[3 * ppk * 4..];
    assert!(tail.chunks_exact(4).all(|p| p == NULL_PIXEL));
}

#[test]
fn positions_are_quantised_to_an_eighth_of_a_pixel() {
    let kp = Keypoint::new(10.06, 3.3, 1.0);
    let pixels = encode_keypoints(&[kp], 0, 0, MIN_ENCODER_LENGTH);
    let out = decode_keypoints(&pixels, 0, 0, MIN_ENCODER_LENGTH);
    assert_eq!(out[0].x, 10.0);
    assert_eq!(out[0].y, 3.25);
}
