// pipeline/nodes/keypoints.rs — Keypoint sources, sinks and set operations.
//
//   KeypointSource   host keypoints ─► encoded texture         (source)
//   KeypointSink     encoded texture ─► host keypoints, async  (sink)
//   KeypointBuffer   keypoints of the previous tick            (2 pages)
//   KeypointClipper  strongest `size` keypoints                (sort, 4 tex)
//   KeypointMixer    union of two sets, sorted by score        (concat + sort, 5 tex)
//   KeypointShuffler list in random order, optionally clipped  (3 tex)
//   KeypointBorderClipper  drops keypoints near the image border  (1 tex)
//
// Everything stays encoded on the device; only the sink decodes.

use std::mem;

use futures::FutureExt;

use crate::error::{PipelineError, Result};
use crate::gpu::programs::keypoints::{PERMUTATION_STRIDE, SHUFFLE_MAX_LENGTH};
use crate::gpu::programs::{GROUP_KEYPOINTS, GROUP_UTILS};
use crate::gpu::{Arg, GpuContext, Kernel};
use crate::keypoint::codec::{
    decode_keypoints, encode_keypoints, encoder_length, DEFAULT_ENCODER_CAPACITY,
    MAX_ENCODER_CAPACITY,
};
use crate::keypoint::sorter::{EncodedKeypoints, KeypointSorter};
use crate::keypoint::Keypoint;
use crate::media::Bitmap;
use crate::pipeline::message::{KeypointsMessage, Message, MessageType};
use crate::pipeline::node::{kernel, NodeCore, NodeTask, PipelineNode, SinkOutput};
use crate::pipeline::port::{InputPort, OutputPort, DEFAULT_INPUT, DEFAULT_OUTPUT};
use crate::random::Random;

fn keypoints_input(name: &str) -> InputPort {
    InputPort::new(name).expects(MessageType::Keypoints)
}

fn keypoints_output() -> OutputPort {
    OutputPort::new(DEFAULT_OUTPUT).expects(MessageType::Keypoints)
}

fn sorter<'a>(slot: &'a mut Option<KeypointSorter>, core: &NodeCore) -> Result<&'a mut KeypointSorter> {
    slot.as_mut().ok_or_else(|| PipelineError::NotInitialized(core.full_name()))
}

// ---------------------------------------------------------------------------
// KeypointSource
// ---------------------------------------------------------------------------

/// Uploads a host keypoint list every tick. Descriptors and extra bytes
/// are not uploaded.
#[derive(Debug)]
pub struct KeypointSource {
    core: NodeCore,
    keypoints: Vec<Keypoint>,
    capacity: usize,
}

impl KeypointSource {
    pub fn new(name: &str) -> Result<Self> {
        Ok(KeypointSource {
            core: NodeCore::new("KeypointSource", name, 1, vec![], vec![keypoints_output()])?,
            keypoints: Vec::new(),
            capacity: DEFAULT_ENCODER_CAPACITY,
        })
    }

    pub fn keypoints(&self) -> &[Keypoint] {
        &self.keypoints
    }

    pub fn set_keypoints(&mut self, keypoints: Vec<Keypoint>) {
        self.keypoints = keypoints;
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Clamped to `MAX_ENCODER_CAPACITY`. Keypoints beyond the capacity
    /// are not uploaded.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.min(MAX_ENCODER_CAPACITY);
    }
}

impl PipelineNode for KeypointSource {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    fn run(&mut self, gpu: &mut GpuContext) -> Result<NodeTask> {
        // sized by capacity, not by count, so the texture keeps its size
        let length = encoder_length(self.capacity, 0, 0);
        let count = self.keypoints.len().min(self.capacity);
        let pixels = encode_keypoints(&self.keypoints[..count], 0, 0, length);

        let texture = self.core.tex(0)?;
        gpu.upload_bytes(texture, length, length, &pixels)?;
        self.core.write_keypoints(gpu, 0, texture, 0, 0, length)?;
        Ok(NodeTask::Ready)
    }
}

// ---------------------------------------------------------------------------
// KeypointSink
// ---------------------------------------------------------------------------

/// Reads its input back and decodes it.
#[derive(Debug)]
pub struct KeypointSink {
    core: NodeCore,
    pending: Option<KeypointsMessage>,
    keypoints: Vec<Keypoint>,
}

impl KeypointSink {
    pub fn new(name: &str) -> Result<Self> {
        Ok(KeypointSink {
            core: NodeCore::new("KeypointSink", name, 0, vec![keypoints_input(DEFAULT_INPUT)], vec![])?,
            pending: None,
            keypoints: Vec::new(),
        })
    }

    /// Keypoints decoded by the last tick.
    pub fn keypoints(&self) -> &[Keypoint] {
        &self.keypoints
    }
}

impl PipelineNode for KeypointSink {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    fn run(&mut self, gpu: &mut GpuContext) -> Result<NodeTask> {
        let message = self.core.read_keypoints(0)?;
        let readback = gpu.read_pixels_async(message.encoded_keypoints)?;
        self.pending = Some(message);
        Ok(NodeTask::Pending(readback.boxed_local()))
    }

    fn complete(&mut self, pixels: Bitmap) -> Result<()> {
        let layout = self
            .pending
            .take()
            .ok_or_else(|| PipelineError::NotInitialized(self.core.full_name()))?;
        self.keypoints = decode_keypoints(
            pixels.as_bytes(),
            layout.descriptor_size,
            layout.extra_size,
            layout.encoder_length,
        );
        Ok(())
    }

    fn export(&self) -> Option<SinkOutput> {
        Some(SinkOutput::Keypoints(self.keypoints.clone()))
    }
}

// ---------------------------------------------------------------------------
// KeypointBuffer
// ---------------------------------------------------------------------------

/// Outputs the keypoints it received on the previous tick. On the first
/// tick after `init`, the input passes through.
#[derive(Debug)]
pub struct KeypointBuffer {
    core: NodeCore,
    copy: Option<Kernel>,
    page: usize,
    initialized: bool,
    previous: (usize, usize, u32),
}

impl KeypointBuffer {
    pub fn new(name: &str) -> Result<Self> {
        Ok(KeypointBuffer {
            core: NodeCore::new(
                "KeypointBuffer",
                name,
                2,
                vec![keypoints_input(DEFAULT_INPUT)],
                vec![keypoints_output()],
            )?,
            copy: None,
            page: 0,
            initialized: false,
            previous: (0, 0, 0),
        })
    }
}

impl PipelineNode for KeypointBuffer {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    fn init(&mut self, gpu: &mut GpuContext) -> Result<()> {
        self.core.allocate_textures(gpu)?;
        self.copy = Some(gpu.kernel(GROUP_UTILS, "copy")?);
        self.page = 0;
        self.initialized = false;
        Ok(())
    }

    fn release(&mut self, gpu: &mut GpuContext) -> Result<()> {
        self.initialized = false;
        self.core.release_textures(gpu)
    }

    fn run(&mut self, gpu: &mut GpuContext) -> Result<NodeTask> {
        let input = self.core.read_keypoints(0)?;
        let layout = (input.descriptor_size, input.extra_size, input.encoder_length);
        let (d, e, length) = mem::replace(&mut self.previous, layout);

        let previous_input = self.core.tex(1 - self.page)?;
        let output = self.core.tex(self.page)?;
        let l = input.encoder_length;
        kernel(&mut self.copy, &self.core)?
            .outputs(l, l, &[previous_input])?
            .call(gpu, &[Arg::Texture(input.encoded_keypoints)])?;
        self.page = 1 - self.page;

        if !self.initialized {
            self.initialized = true;
            let (d, e, l) = layout;
            self.core.write_keypoints(gpu, 0, previous_input, d, e, l)?;
        } else {
            self.core.write_keypoints(gpu, 0, output, d, e, length)?;
        }
        Ok(NodeTask::Ready)
    }
}

// ---------------------------------------------------------------------------
// KeypointClipper
// ---------------------------------------------------------------------------

fn has_no_payload(message: &Message) -> bool {
    message
        .as_keypoints()
        .is_some_and(|k| k.descriptor_size == 0 && k.extra_size == 0)
}

/// Keeps the `size` keypoints with the highest scores, in descending
/// score order. Accepts keypoints without descriptors or extra bytes only.
#[derive(Debug)]
pub struct KeypointClipper {
    core: NodeCore,
    sorter: Option<KeypointSorter>,
    size: usize,
}

impl KeypointClipper {
    pub fn new(name: &str) -> Result<Self> {
        Ok(KeypointClipper {
            core: NodeCore::new(
                "KeypointClipper",
                name,
                4,
                vec![keypoints_input(DEFAULT_INPUT).satisfying(has_no_payload)],
                vec![keypoints_output()],
            )?,
            sorter: None,
            size: MAX_ENCODER_CAPACITY,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Clamped to `MAX_ENCODER_CAPACITY`.
    pub fn set_size(&mut self, size: usize) {
        self.size = size.min(MAX_ENCODER_CAPACITY);
    }
}

impl PipelineNode for KeypointClipper {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    fn init(&mut self, gpu: &mut GpuContext) -> Result<()> {
        self.core.allocate_textures(gpu)?;
        self.sorter = Some(KeypointSorter::new(gpu)?);
        Ok(())
    }

    fn run(&mut self, gpu: &mut GpuContext) -> Result<NodeTask> {
        let input = self.core.read_keypoints(0)?;
        let (d, e) = (input.descriptor_size, input.extra_size);
        let capacity = input.capacity().min(self.size);
        let length = encoder_length(capacity, d, e);

        let tex = [self.core.tex(0)?, self.core.tex(1)?, self.core.tex(2)?, self.core.tex(3)?];
        let output =
            sorter(&mut self.sorter, &self.core)?.sort(gpu, &tex, input.encoded(), capacity, length)?;
        self.core.write_keypoints(gpu, 0, output, d, e, length)?;
        Ok(NodeTask::Ready)
    }
}

// ---------------------------------------------------------------------------
// KeypointMixer
// ---------------------------------------------------------------------------

/// Union of the keypoints on `in0` and `in1`, sorted by descending score.
/// Both sets must share descriptor and extra sizes.
#[derive(Debug)]
pub struct KeypointMixer {
    core: NodeCore,
    concat: Option<Kernel>,
    sorter: Option<KeypointSorter>,
}

impl KeypointMixer {
    pub fn new(name: &str) -> Result<Self> {
        Ok(KeypointMixer {
            core: NodeCore::new(
                "KeypointMixer",
                name,
                5,
                vec![keypoints_input("in0"), keypoints_input("in1")],
                vec![keypoints_output()],
            )?,
            concat: None,
            sorter: None,
        })
    }
}

impl PipelineNode for KeypointMixer {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    fn init(&mut self, gpu: &mut GpuContext) -> Result<()> {
        self.core.allocate_textures(gpu)?;
        self.concat = Some(gpu.kernel(GROUP_KEYPOINTS, "mixKeypointsConcat")?);
        self.sorter = Some(KeypointSorter::new(gpu)?);
        Ok(())
    }

    fn run(&mut self, gpu: &mut GpuContext) -> Result<NodeTask> {
        let a = self.core.read_keypoints(0)?;
        let b = self.core.read_keypoints(1)?;
        if a.descriptor_size != b.descriptor_size || a.extra_size != b.extra_size {
            return Err(PipelineError::FormatMismatch(self.core.full_name()));
        }

        let (d, e) = (a.descriptor_size, a.extra_size);
        let (cap_a, cap_b) = (a.capacity(), b.capacity());
        let capacity = cap_a + cap_b;
        let length = encoder_length(capacity, d, e);
        let as_int = |v: usize| i32::try_from(v).unwrap_or(i32::MAX);

        let concat_target = self.core.tex(0)?;
        let mixed = kernel(&mut self.concat, &self.core)?
            .outputs(length, length, &[concat_target])?
            .call(
                gpu,
                &[
                    Arg::Texture(a.encoded_keypoints),
                    Arg::Texture(b.encoded_keypoints),
                    Arg::Int(a.encoder_length as i32),
                    Arg::Int(b.encoder_length as i32),
                    Arg::Int(as_int(cap_a)),
                    Arg::Int(as_int(cap_b)),
                    Arg::Int(as_int(d)),
                    Arg::Int(as_int(e)),
                    Arg::Int(length as i32),
                ],
            )?;

        let tex = [self.core.tex(1)?, self.core.tex(2)?, self.core.tex(3)?, self.core.tex(4)?];
        let concatenated = EncodedKeypoints {
            texture: mixed,
            descriptor_size: d,
            extra_size: e,
            encoder_length: length,
        };
        let output =
            sorter(&mut self.sorter, &self.core)?.sort(gpu, &tex, concatenated, capacity, length)?;
        self.core.write_keypoints(gpu, 0, output, d, e, length)?;
        Ok(NodeTask::Ready)
    }
}

// ---------------------------------------------------------------------------
// KeypointShuffler
// ---------------------------------------------------------------------------

/// Puts the keypoint list in random order, then optionally keeps the first
/// `max_keypoints`. The permutation is drawn from a seedable generator, so
/// a fixed seed gives a fixed sequence of shuffles.
#[derive(Debug)]
pub struct KeypointShuffler {
    core: NodeCore,
    shuffle: Option<Kernel>,
    clip: Option<Kernel>,
    random: Random,
    max_keypoints: Option<usize>,
}

impl KeypointShuffler {
    pub fn new(name: &str) -> Result<Self> {
        Ok(KeypointShuffler {
            core: NodeCore::new(
                "KeypointShuffler",
                name,
                3,
                vec![keypoints_input(DEFAULT_INPUT)],
                vec![keypoints_output()],
            )?,
            shuffle: None,
            clip: None,
            random: Random::new(0),
            max_keypoints: None,
        })
    }

    /// Restart the generator from `seed`.
    pub fn set_seed(&mut self, seed: u32) {
        self.random = Random::new(seed);
    }

    pub fn max_keypoints(&self) -> Option<usize> {
        self.max_keypoints
    }

    /// `None` keeps every keypoint. Clamped to `MAX_ENCODER_CAPACITY`.
    pub fn set_max_keypoints(&mut self, max_keypoints: Option<usize>) {
        self.max_keypoints = max_keypoints.map(|m| m.min(MAX_ENCODER_CAPACITY));
    }

    /// Permutation texels, `PERMUTATION_STRIDE` per row.
    fn permutation_texels(&mut self, length: usize) -> (u32, Vec<u8>) {
        let stride = PERMUTATION_STRIDE as usize;
        let rows = length.div_ceil(stride).max(1);
        let mut texels = vec![0u8; rows * stride * 4];
        for (i, p) in self.random.permutation(length).into_iter().enumerate() {
            let [lo, hi] = (p as u16).to_le_bytes();
            texels[i * 4..i * 4 + 4].copy_from_slice(&[lo, hi, 0, 255]);
        }
        (rows as u32, texels)
    }
}

impl PipelineNode for KeypointShuffler {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    fn init(&mut self, gpu: &mut GpuContext) -> Result<()> {
        self.core.allocate_textures(gpu)?;
        self.shuffle = Some(gpu.kernel(GROUP_KEYPOINTS, "shuffleKeypoints")?);
        self.clip = Some(gpu.kernel(GROUP_KEYPOINTS, "clipKeypoints")?);
        Ok(())
    }

    fn run(&mut self, gpu: &mut GpuContext) -> Result<NodeTask> {
        let input = self.core.read_keypoints(0)?;
        let (d, e, l) = (input.descriptor_size, input.extra_size, input.encoder_length);
        let capacity = input.capacity();
        let length = capacity.min(SHUFFLE_MAX_LENGTH);

        let permutation = self.core.tex(0)?;
        let (rows, texels) = self.permutation_texels(length);
        gpu.upload_bytes(permutation, PERMUTATION_STRIDE, rows, &texels)?;

        let shuffle_target = self.core.tex(1)?;
        let shuffled = kernel(&mut self.shuffle, &self.core)?
            .outputs(l, l, &[shuffle_target])?
            .call(
                gpu,
                &[
                    Arg::Texture(input.encoded_keypoints),
                    Arg::Int(d as i32),
                    Arg::Int(e as i32),
                    Arg::Int(l as i32),
                    Arg::Texture(permutation),
                    Arg::Int(length as i32),
                ],
            )?;

        match self.max_keypoints {
            Some(max) if max < capacity => {
                let clipped_length = encoder_length(max, d, e);
                let clip_target = self.core.tex(2)?;
                let clipped = kernel(&mut self.clip, &self.core)?
                    .outputs(clipped_length, clipped_length, &[clip_target])?
                    .call(
                        gpu,
                        &[
                            Arg::Texture(shuffled),
                            Arg::Int(d as i32),
                            Arg::Int(e as i32),
                            Arg::Int(max as i32),
                        ],
                    )?;
                self.core.write_keypoints(gpu, 0, clipped, d, e, clipped_length)?;
            }
            _ => self.core.write_keypoints(gpu, 0, shuffled, d, e, l)?,
        }
        Ok(NodeTask::Ready)
    }
}

// ---------------------------------------------------------------------------
// KeypointBorderClipper
// ---------------------------------------------------------------------------

/// Removes the keypoints lying within `border_size` pixels of the edges of
/// an `image_size` image. The survivors keep their order.
#[derive(Debug)]
pub struct KeypointBorderClipper {
    core: NodeCore,
    clip: Option<Kernel>,
    image_size: (u32, u32),
    border_size: (u32, u32),
}

impl KeypointBorderClipper {
    pub fn new(name: &str) -> Result<Self> {
        Ok(KeypointBorderClipper {
            core: NodeCore::new(
                "KeypointBorderClipper",
                name,
                1,
                vec![keypoints_input(DEFAULT_INPUT)],
                vec![keypoints_output()],
            )?,
            clip: None,
            image_size: (0, 0),
            border_size: (0, 0),
        })
    }

    pub fn image_size(&self) -> (u32, u32) {
        self.image_size
    }

    pub fn set_image_size(&mut self, width: u32, height: u32) {
        self.image_size = (width, height);
    }

    pub fn border_size(&self) -> (u32, u32) {
        self.border_size
    }

    /// Horizontal and vertical border, in pixels.
    pub fn set_border_size(&mut self, x: u32, y: u32) {
        self.border_size = (x, y);
    }
}

impl PipelineNode for KeypointBorderClipper {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    fn init(&mut self, gpu: &mut GpuContext) -> Result<()> {
        self.core.allocate_textures(gpu)?;
        self.clip = Some(gpu.kernel(GROUP_KEYPOINTS, "clipBorder")?);
        Ok(())
    }

    fn run(&mut self, gpu: &mut GpuContext) -> Result<NodeTask> {
        let (width, height) = self.image_size;
        if width == 0 || height == 0 {
            return Err(PipelineError::IllegalOperation(format!(
                "{}: did you forget to set the image size?",
                self.core.full_name()
            )));
        }

        let input = self.core.read_keypoints(0)?;
        let (d, e, l) = (input.descriptor_size, input.extra_size, input.encoder_length);
        let (bx, by) = self.border_size;
        let target = self.core.tex(0)?;
        let clipped = kernel(&mut self.clip, &self.core)?.outputs(l, l, &[target])?.call(
            gpu,
            &[
                Arg::Texture(input.encoded_keypoints),
                Arg::Int(d as i32),
                Arg::Int(e as i32),
                Arg::Int(l as i32),
                Arg::Vec2([width as f32, height as f32]),
                Arg::Vec2([bx as f32, by as f32]),
            ],
        )?;
        self.core.write_keypoints(gpu, 0, clipped, d, e, l)?;
        Ok(NodeTask::Ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setters_clamp() {
        let mut clipper = KeypointClipper::new("clip").unwrap();
        assert_eq!(clipper.size(), MAX_ENCODER_CAPACITY);
        clipper.set_size(usize::MAX);
        assert_eq!(clipper.size(), MAX_ENCODER_CAPACITY);
        clipper.set_size(3);
        assert_eq!(clipper.size(), 3);

        let mut source = KeypointSource::new("src").unwrap();
        source.set_capacity(100_000);
        assert_eq!(source.capacity(), MAX_ENCODER_CAPACITY);

        let mut shuffler = KeypointShuffler::new("shuffle").unwrap();
        assert_eq!(shuffler.max_keypoints(), None);
        shuffler.set_max_keypoints(Some(usize::MAX));
        assert_eq!(shuffler.max_keypoints(), Some(MAX_ENCODER_CAPACITY));
    }

    #[test]
    fn shuffler_permutation_texels_are_padded_rows() {
        let mut shuffler = KeypointShuffler::new("shuffle").unwrap();
        let (rows, texels) = shuffler.permutation_texels(40);
        assert_eq!(rows, 2);
        assert_eq!(texels.len(), 2 * PERMUTATION_STRIDE as usize * 4);
        let mut indices: Vec<u16> =
            texels[..40 * 4].chunks_exact(4).map(|t| u16::from_le_bytes([t[0], t[1]])).collect();
        indices.sort_unstable();
        assert_eq!(indices, (0..40).collect::<Vec<u16>>());

        let (rows, _) = shuffler.permutation_texels(0);
        assert_eq!(rows, 1);
    }

    #[test]
    fn border_clipper_needs_an_image_size() {
        let mut gpu = GpuContext::default();
        let mut clipper = KeypointBorderClipper::new("border").unwrap();
        clipper.init(&mut gpu).unwrap();
        assert!(matches!(clipper.run(&mut gpu), Err(PipelineError::IllegalOperation(_))));
    }

    #[test]
    fn clipper_refuses_descriptors() {
        use crate::gpu::TextureHandle;
        let clipper = KeypointClipper::new("clip").unwrap();
        let spec = clipper.core().inputs()[0].spec();
        let plain = KeypointsMessage::new(TextureHandle::SURFACE, 0, 0, 4).unwrap();
        let described = KeypointsMessage::new(TextureHandle::SURFACE, 32, 0, 4).unwrap();
        assert!(spec.accepts(&Message::Keypoints(plain)));
        assert!(!spec.accepts(&Message::Keypoints(described)));
    }
}
