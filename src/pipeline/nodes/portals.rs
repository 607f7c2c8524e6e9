// pipeline/nodes/portals.rs — Pass images and keypoints between pipelines.
//
//   pipeline A:  ... ─► ImagePortalSink        (stores the last input)
//                             │ portal()
//   pipeline B:         ImagePortalSource ─► ...   (republishes it)
//
// A portal sink copies its input out of its own device every tick; a portal
// source uploads that copy into its pipeline on every tick of its own. The
// two ends share a `Portal` handle, so they may live in different pipelines
// (each with its own device) or in the same one, where the source sees the
// data of the previous tick.
//
// A portal sink exports nothing: it is not a pipeline result.
//
// NEW RUST CONCEPTS:
// - `Rc<RefCell<_>>` — shared, single-threaded, mutable slot. Pipelines are
//   not `Send` either, so both ends stay on one thread.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{PipelineError, Result};
use crate::gpu::GpuContext;
use crate::keypoint::codec::{encoder_length, NULL_PIXEL};
use crate::media::Bitmap;
use crate::pipeline::message::{ImageFormat, MessageType};
use crate::pipeline::node::{NodeCore, NodeTask, PipelineNode};
use crate::pipeline::port::{InputPort, OutputPort, DEFAULT_INPUT, DEFAULT_OUTPUT};

/// Shared end of a portal. Cloning yields another handle to the same data.
#[derive(Debug)]
pub struct Portal<T> {
    inner: Rc<RefCell<Slot<T>>>,
}

#[derive(Debug)]
struct Slot<T> {
    sink: String,
    data: Option<T>,
}

impl<T> Clone for Portal<T> {
    fn clone(&self) -> Self {
        Portal { inner: Rc::clone(&self.inner) }
    }
}

impl<T: Clone> Portal<T> {
    fn new(sink: String) -> Self {
        Portal { inner: Rc::new(RefCell::new(Slot { sink, data: None })) }
    }

    fn store(&self, data: Option<T>) {
        self.inner.borrow_mut().data = data;
    }

    /// Full name of the portal sink feeding this portal.
    pub fn sink_name(&self) -> String {
        self.inner.borrow().sink.clone()
    }

    /// A copy of the stored data.
    ///
    /// # Errors
    /// `PortalEmpty` while the sink is not initialised.
    pub fn load(&self) -> Result<T> {
        let slot = self.inner.borrow();
        slot.data.clone().ok_or_else(|| PipelineError::PortalEmpty(slot.sink.clone()))
    }
}

/// An image held by a portal.
#[derive(Debug, Clone, PartialEq)]
pub struct PortalImage {
    pub bitmap: Bitmap,
    pub format: ImageFormat,
}

/// An encoded keypoint list held by a portal.
#[derive(Debug, Clone, PartialEq)]
pub struct PortalKeypoints {
    /// `encoder_length`² RGBA8 texels.
    pub pixels: Vec<u8>,
    pub descriptor_size: usize,
    pub extra_size: usize,
    pub encoder_length: u32,
}

impl PortalKeypoints {
    /// The empty list, in the smallest encoding.
    fn empty() -> Self {
        let l = encoder_length(0, 0, 0);
        PortalKeypoints {
            pixels: NULL_PIXEL.repeat((l * l) as usize),
            descriptor_size: 0,
            extra_size: 0,
            encoder_length: l,
        }
    }
}

pub type ImagePortal = Portal<PortalImage>;
pub type KeypointPortal = Portal<PortalKeypoints>;

// ---------------------------------------------------------------------------
// Images
// ---------------------------------------------------------------------------

/// Stores its input image for an `ImagePortalSource`. Holds a 1×1
/// transparent image from `init` until the first tick.
#[derive(Debug)]
pub struct ImagePortalSink {
    core: NodeCore,
    portal: ImagePortal,
}

impl ImagePortalSink {
    pub fn new(name: &str) -> Result<Self> {
        let core = NodeCore::new(
            "ImagePortalSink",
            name,
            0,
            vec![InputPort::new(DEFAULT_INPUT).expects(MessageType::Image)],
            vec![],
        )?;
        let portal = Portal::new(core.full_name());
        Ok(ImagePortalSink { core, portal })
    }

    /// Handle to hand to portal sources.
    pub fn portal(&self) -> ImagePortal {
        self.portal.clone()
    }
}

impl PipelineNode for ImagePortalSink {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    fn init(&mut self, _gpu: &mut GpuContext) -> Result<()> {
        self.portal.store(Some(PortalImage { bitmap: Bitmap::new(1, 1), format: ImageFormat::Rgba }));
        Ok(())
    }

    fn release(&mut self, _gpu: &mut GpuContext) -> Result<()> {
        self.portal.store(None);
        Ok(())
    }

    fn run(&mut self, gpu: &mut GpuContext) -> Result<NodeTask> {
        let (image, format) = self.core.read_image(0)?;
        if gpu.has_mipmaps(image)? {
            return Err(PipelineError::NotSupported(format!(
                "{} can't store a pyramid",
                self.core.full_name()
            )));
        }
        let bitmap = gpu.read_pixels(image)?;
        self.portal.store(Some(PortalImage { bitmap, format }));
        Ok(NodeTask::Ready)
    }
}

/// Publishes the image stored in a portal.
#[derive(Debug)]
pub struct ImagePortalSource {
    core: NodeCore,
    source: Option<ImagePortal>,
}

impl ImagePortalSource {
    pub fn new(name: &str) -> Result<Self> {
        Ok(ImagePortalSource {
            core: NodeCore::new(
                "ImagePortalSource",
                name,
                1,
                vec![],
                vec![OutputPort::new(DEFAULT_OUTPUT).expects(MessageType::Image)],
            )?,
            source: None,
        })
    }

    pub fn source(&self) -> Option<&ImagePortal> {
        self.source.as_ref()
    }

    pub fn set_source(&mut self, portal: Option<ImagePortal>) {
        self.source = portal;
    }
}

impl PipelineNode for ImagePortalSource {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    fn run(&mut self, gpu: &mut GpuContext) -> Result<NodeTask> {
        let portal = self
            .source
            .as_ref()
            .ok_or_else(|| PipelineError::NoPortalSource(self.core.full_name()))?;
        let PortalImage { bitmap, format } = portal.load()?;
        let texture = self.core.tex(0)?;
        gpu.upload(texture, &bitmap)?;
        self.core.write_image(0, texture, format)?;
        Ok(NodeTask::Ready)
    }
}

// ---------------------------------------------------------------------------
// Keypoints
// ---------------------------------------------------------------------------

/// Stores its input keypoints for a `KeypointPortalSource`. Holds an empty
/// list from `init` until the first tick.
#[derive(Debug)]
pub struct KeypointPortalSink {
    core: NodeCore,
    portal: KeypointPortal,
}

impl KeypointPortalSink {
    pub fn new(name: &str) -> Result<Self> {
        let core = NodeCore::new(
            "KeypointPortalSink",
            name,
            0,
            vec![InputPort::new(DEFAULT_INPUT).expects(MessageType::Keypoints)],
            vec![],
        )?;
        let portal = Portal::new(core.full_name());
        Ok(KeypointPortalSink { core, portal })
    }

    pub fn portal(&self) -> KeypointPortal {
        self.portal.clone()
    }
}

impl PipelineNode for KeypointPortalSink {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    fn init(&mut self, _gpu: &mut GpuContext) -> Result<()> {
        self.portal.store(Some(PortalKeypoints::empty()));
        Ok(())
    }

    fn release(&mut self, _gpu: &mut GpuContext) -> Result<()> {
        self.portal.store(None);
        Ok(())
    }

    fn run(&mut self, gpu: &mut GpuContext) -> Result<NodeTask> {
        let input = self.core.read_keypoints(0)?;
        let pixels = gpu.read_pixels(input.encoded_keypoints)?.into_bytes();
        self.portal.store(Some(PortalKeypoints {
            pixels,
            descriptor_size: input.descriptor_size,
            extra_size: input.extra_size,
            encoder_length: input.encoder_length,
        }));
        Ok(NodeTask::Ready)
    }
}

/// Publishes the keypoints stored in a portal.
#[derive(Debug)]
pub struct KeypointPortalSource {
    core: NodeCore,
    source: Option<KeypointPortal>,
}

impl KeypointPortalSource {
    pub fn new(name: &str) -> Result<Self> {
        Ok(KeypointPortalSource {
            core: NodeCore::new(
                "KeypointPortalSource",
                name,
                1,
                vec![],
                vec![OutputPort::new(DEFAULT_OUTPUT).expects(MessageType::Keypoints)],
            )?,
            source: None,
        })
    }

    pub fn source(&self) -> Option<&KeypointPortal> {
        self.source.as_ref()
    }

    pub fn set_source(&mut self, portal: Option<KeypointPortal>) {
        self.source = portal;
    }
}

impl PipelineNode for KeypointPortalSource {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    fn run(&mut self, gpu: &mut GpuContext) -> Result<NodeTask> {
        let portal = self
            .source
            .as_ref()
            .ok_or_else(|| PipelineError::NoPortalSource(self.core.full_name()))?;
        let stored = portal.load()?;
        let l = stored.encoder_length;
        let texture = self.core.tex(0)?;
        gpu.upload_bytes(texture, l, l, &stored.pixels)?;
        self.core.write_keypoints(
            gpu,
            0,
            texture,
            stored.descriptor_size,
            stored.extra_size,
            l,
        )?;
        Ok(NodeTask::Ready)
    }
}
