// keypoint/mod.rs — Keypoints on the host and on the device.
//
// On the host a keypoint is a plain struct. On the device, a list of
// keypoints lives in a square RGBA8 texture (see `codec`), and is reordered
// in place by the permutation sort network in `sorter`.

pub mod codec;
pub mod sorter;

pub use codec::{
    encoder_capacity, encoder_length, pixels_per_keypoint, DEFAULT_ENCODER_CAPACITY,
    MAX_ENCODER_CAPACITY, MIN_ENCODER_LENGTH, MIN_KEYPOINT_SIZE,
};
pub use sorter::KeypointSorter;

/// A detected feature point.
#[derive(Debug, Clone, PartialEq)]
pub struct Keypoint {
    /// Column, with 1/8 px resolution once encoded.
    pub x: f32,
    pub y: f32,
    /// Pyramid level-of-detail, in [-1, 4]. 0 = base level.
    pub lod: f32,
    /// Orientation in radians, in [-π, π].
    pub rotation: f32,
    /// Corner response. Higher = stronger. Stored as a half float.
    pub score: f32,
    /// Extra per-keypoint bytes (e.g. flow vectors); empty if none.
    pub extra: Vec<u8>,
    /// Descriptor bytes; empty if the keypoint has no descriptor.
    pub descriptor: Vec<u8>,
}

impl Keypoint {
    pub fn new(x: f32, y: f32, score: f32) -> Self {
        Keypoint {
            x,
            y,
            lod: 0.0,
            rotation: 0.0,
            score,
            extra: Vec::new(),
            descriptor: Vec::new(),
        }
    }

    pub fn with_lod(mut self, lod: f32) -> Self {
        self.lod = lod;
        self
    }

    pub fn with_rotation(mut self, rotation: f32) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_descriptor(mut self, descriptor: Vec<u8>) -> Self {
        self.descriptor = descriptor;
        self
    }

    pub fn with_extra(mut self, extra: Vec<u8>) -> Self {
        self.extra = extra;
        self
    }
}
