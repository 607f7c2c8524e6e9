// pipeline/message.rs — Values flowing between pipeline nodes.
//
// Messages are small `Copy` values republished every tick. They reference
// device textures by handle and never own pixels: a node that needs data
// to survive until the next tick copies it into its own scratch texture.

use std::fmt;

use crate::error::{PipelineError, Result};
use crate::gpu::TextureHandle;
use crate::keypoint::codec::encoder_capacity;
use crate::keypoint::sorter::EncodedKeypoints;

/// Tag of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Nothing,
    Image,
    Keypoints,
}

impl MessageType {
    pub fn name(self) -> &'static str {
        match self {
            MessageType::Nothing => "Nothing",
            MessageType::Image => "Image",
            MessageType::Keypoints => "Keypoints",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Pixel format of an image message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ImageFormat {
    #[default]
    Rgba,
    /// Luminance replicated in R, G and B.
    Grey,
}

/// An encoded keypoint list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeypointsMessage {
    pub encoded_keypoints: TextureHandle,
    /// Bytes per descriptor (a multiple of 4).
    pub descriptor_size: usize,
    /// Extra bytes per keypoint.
    pub extra_size: usize,
    /// Side of the square encoded texture.
    pub encoder_length: u32,
}

impl KeypointsMessage {
    /// # Errors
    /// `IllegalArgument` if the descriptor size is not a multiple of 4 or
    /// the encoder length is zero.
    pub fn new(
        encoded_keypoints: TextureHandle,
        descriptor_size: usize,
        extra_size: usize,
        encoder_length: u32,
    ) -> Result<Self> {
        if descriptor_size % 4 != 0 {
            return Err(PipelineError::IllegalArgument(format!(
                "descriptor size must be a multiple of 4 (got {descriptor_size})"
            )));
        }
        if encoder_length == 0 {
            return Err(PipelineError::IllegalArgument("encoder length must be positive".into()));
        }
        Ok(KeypointsMessage {
            encoded_keypoints,
            descriptor_size,
            extra_size,
            encoder_length,
        })
    }

    /// How many keypoints the encoded texture can hold.
    pub fn capacity(&self) -> usize {
        encoder_capacity(self.descriptor_size, self.extra_size, self.encoder_length)
    }

    pub fn has_descriptors(&self) -> bool {
        self.descriptor_size > 0
    }

    /// The same encoding, as the sorter sees it.
    pub fn encoded(&self) -> EncodedKeypoints {
        EncodedKeypoints {
            texture: self.encoded_keypoints,
            descriptor_size: self.descriptor_size,
            extra_size: self.extra_size,
            encoder_length: self.encoder_length,
        }
    }
}

/// A message published on an output port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    Nothing,
    Image { image: TextureHandle, format: ImageFormat },
    Keypoints(KeypointsMessage),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Nothing => MessageType::Nothing,
            Message::Image { .. } => MessageType::Image,
            Message::Keypoints(_) => MessageType::Keypoints,
        }
    }

    pub fn image(image: TextureHandle, format: ImageFormat) -> Self {
        Message::Image { image, format }
    }

    pub fn as_image(&self) -> Option<(TextureHandle, ImageFormat)> {
        match *self {
            Message::Image { image, format } => Some((image, format)),
            _ => None,
        }
    }

    pub fn as_keypoints(&self) -> Option<&KeypointsMessage> {
        match self {
            Message::Keypoints(k) => Some(k),
            _ => None,
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "message of type {}", self.message_type())
    }
}
