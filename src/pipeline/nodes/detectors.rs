// pipeline/nodes/detectors.rs — Keypoint detectors.
//
// FastDetector runs four kernels per tick:
//
//   grey image ─fastScore─► corners ─nonmaxSuppression─► corners'
//              ─countCorners─► row offsets ─encodeKeypoints─► encoded
//
// Corners are encoded in raster order, up to the configured capacity.
// They are not sorted: put a KeypointClipper downstream to keep the
// strongest ones.

use crate::error::{PipelineError, Result};
use crate::gpu::programs::GROUP_KEYPOINTS;
use crate::gpu::{Arg, GpuContext, Kernel};
use crate::keypoint::codec::{encoder_length, DEFAULT_ENCODER_CAPACITY, MAX_ENCODER_CAPACITY};
use crate::pipeline::message::{ImageFormat, Message, MessageType};
use crate::pipeline::node::{NodeCore, NodeTask, PipelineNode};
use crate::pipeline::port::{InputPort, OutputPort, DEFAULT_INPUT, DEFAULT_OUTPUT};

/// Settings of a FAST detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FastConfig {
    /// Intensity difference a circle pixel needs to count as brighter or
    /// darker than the centre. Typical: 20–40.
    pub threshold: u8,
    /// N in FAST-N. Must be in [9, 12].
    pub arc_length: usize,
    /// Maximum number of encoded corners.
    pub capacity: usize,
}

impl Default for FastConfig {
    fn default() -> Self {
        FastConfig {
            threshold: 20,
            arc_length: 9,
            capacity: DEFAULT_ENCODER_CAPACITY,
        }
    }
}

fn is_grey(message: &Message) -> bool {
    matches!(message.as_image(), Some((_, ImageFormat::Grey)))
}

#[derive(Debug)]
struct FastKernels {
    score: Kernel,
    nms: Kernel,
    count: Kernel,
    encode: Kernel,
}

/// FAST-N corner detector on a greyscale image.
#[derive(Debug)]
pub struct FastDetector {
    core: NodeCore,
    config: FastConfig,
    kernels: Option<FastKernels>,
}

impl FastDetector {
    /// # Panics
    /// Panics if `config.arc_length` is not in the range [9, 12].
    pub fn new(name: &str, config: FastConfig) -> Result<Self> {
        assert!(
            (9..=12).contains(&config.arc_length),
            "arc_length must be 9..=12 (got {})",
            config.arc_length
        );
        let input = InputPort::new(DEFAULT_INPUT).expects(MessageType::Image).satisfying(is_grey);
        let output = OutputPort::new(DEFAULT_OUTPUT).expects(MessageType::Keypoints);
        let mut detector = FastDetector {
            core: NodeCore::new("FastDetector", name, 4, vec![input], vec![output])?,
            config,
            kernels: None,
        };
        detector.set_capacity(config.capacity);
        Ok(detector)
    }

    pub fn config(&self) -> &FastConfig {
        &self.config
    }

    pub fn set_threshold(&mut self, threshold: u8) {
        self.config.threshold = threshold;
    }

    /// Clamped to `[1, MAX_ENCODER_CAPACITY]`.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.config.capacity = capacity.clamp(1, MAX_ENCODER_CAPACITY);
    }
}

impl PipelineNode for FastDetector {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    fn init(&mut self, gpu: &mut GpuContext) -> Result<()> {
        self.core.allocate_textures(gpu)?;
        self.kernels = Some(FastKernels {
            score: gpu.kernel(GROUP_KEYPOINTS, "fastScore")?,
            nms: gpu.kernel(GROUP_KEYPOINTS, "nonmaxSuppression")?,
            count: gpu.kernel(GROUP_KEYPOINTS, "countCorners")?,
            encode: gpu.kernel(GROUP_KEYPOINTS, "encodeKeypoints")?,
        });
        Ok(())
    }

    fn run(&mut self, gpu: &mut GpuContext) -> Result<NodeTask> {
        let (image, _) = self.core.read_image(0)?;
        let (w, h) = gpu.size(image)?;
        let [t_score, t_nms, t_count, t_encoded] =
            [self.core.tex(0)?, self.core.tex(1)?, self.core.tex(2)?, self.core.tex(3)?];
        let capacity = self.config.capacity;
        let length = encoder_length(capacity, 0, 0);
        let k = self
            .kernels
            .as_mut()
            .ok_or_else(|| PipelineError::NotInitialized(self.core.full_name()))?;

        let corners = k.score.outputs(w, h, &[t_score])?.call(
            gpu,
            &[
                Arg::Texture(image),
                Arg::Int(self.config.threshold as i32),
                Arg::Int(self.config.arc_length as i32),
            ],
        )?;
        let corners = k.nms.outputs(w, h, &[t_nms])?.call(gpu, &[Arg::Texture(corners)])?;
        let offsets = k.count.outputs(1, h + 1, &[t_count])?.call(gpu, &[Arg::Texture(corners)])?;
        let encoded = k.encode.outputs(length, length, &[t_encoded])?.call(
            gpu,
            &[
                Arg::Texture(corners),
                Arg::Texture(offsets),
                Arg::Int(capacity as i32),
                Arg::Int(0),
                Arg::Int(0),
            ],
        )?;

        self.core.write_keypoints(gpu, 0, encoded, 0, 0, length)?;
        Ok(NodeTask::Ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "arc_length must be 9..=12")]
    fn arc_length_is_validated() {
        let config = FastConfig { arc_length: 8, ..FastConfig::default() };
        let _ = FastDetector::new("fast", config);
    }

    #[test]
    fn capacity_is_clamped() {
        let config = FastConfig { capacity: 0, ..FastConfig::default() };
        let mut fast = FastDetector::new("fast", config).unwrap();
        assert_eq!(fast.config().capacity, 1);
        fast.set_capacity(1 << 20);
        assert_eq!(fast.config().capacity, MAX_ENCODER_CAPACITY);
    }

    #[test]
    fn only_grey_images_are_accepted() {
        use crate::gpu::TextureHandle;
        let fast = FastDetector::new("fast", FastConfig::default()).unwrap();
        let spec = fast.core().inputs()[0].spec();
        assert!(spec.accepts(&Message::image(TextureHandle::SURFACE, ImageFormat::Grey)));
        assert!(!spec.accepts(&Message::image(TextureHandle::SURFACE, ImageFormat::Rgba)));
    }
}
