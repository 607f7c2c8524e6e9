// pipeline/node.rs — The node abstraction.
//
// Every node kind is a struct implementing `PipelineNode`. The plumbing all
// kinds share (name, ports, scratch textures) lives in `NodeCore`, which
// each node embeds and exposes through `core()` / `core_mut()`.
//
// LIFECYCLE
// ─────────
//   new()      ports declared, nothing allocated
//   init()     scratch textures drawn from the pool, kernels resolved
//   run()      once per tick; reads inputs, writes every output
//   release()  scratch textures returned to the pool
//
// A node with no inputs is a source; a node with no outputs is a sink.
// Sinks hand their asynchronous readback to the scheduler as
// `NodeTask::Pending` and receive the pixels back through `complete()`.
//
// NEW RUST CONCEPTS:
// - `AsAny` supertrait with a blanket impl — lets the pipeline hand out a
//   concrete `&mut ImageSource` from its `Box<dyn PipelineNode>` arena.
// - `LocalBoxFuture` — a pinned, boxed, non-`Send` future. Readbacks share
//   an `Rc` with the device, so they stay on the current thread.

use std::any::Any;
use std::collections::HashSet;

use futures::future::LocalBoxFuture;
use tracing::trace;

use crate::error::{PipelineError, Result};
use crate::gpu::{GpuContext, Kernel, TextureHandle};
use crate::keypoint::Keypoint;
use crate::media::Bitmap;
use crate::pipeline::message::{ImageFormat, KeypointsMessage, Message, MessageType};
use crate::pipeline::port::{InputPort, OutputPort};

/// Index of a node in its pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Upcast to `Any`, for downcasting trait objects back to node types.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// What `run()` left for the scheduler to do.
pub enum NodeTask {
    /// All outputs have been written.
    Ready,
    /// Await this readback, then pass its pixels to `complete()`.
    Pending(LocalBoxFuture<'static, Result<Bitmap>>),
}

impl std::fmt::Debug for NodeTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeTask::Ready => f.write_str("Ready"),
            NodeTask::Pending(_) => f.write_str("Pending(..)"),
        }
    }
}

/// Data exported by a sink after a tick.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkOutput {
    Image(Bitmap),
    Keypoints(Vec<Keypoint>),
}

impl SinkOutput {
    pub fn as_image(&self) -> Option<&Bitmap> {
        match self {
            SinkOutput::Image(b) => Some(b),
            SinkOutput::Keypoints(_) => None,
        }
    }

    pub fn as_keypoints(&self) -> Option<&[Keypoint]> {
        match self {
            SinkOutput::Keypoints(k) => Some(k),
            SinkOutput::Image(_) => None,
        }
    }
}

/// A pipeline node.
pub trait PipelineNode: AsAny {
    fn core(&self) -> &NodeCore;
    fn core_mut(&mut self) -> &mut NodeCore;

    /// Acquire device resources. Called again after a context restore.
    fn init(&mut self, gpu: &mut GpuContext) -> Result<()> {
        self.core_mut().allocate_textures(gpu)
    }

    /// Return device resources.
    fn release(&mut self, gpu: &mut GpuContext) -> Result<()> {
        self.core_mut().release_textures(gpu)
    }

    /// One tick of work. Inputs have been pulled already.
    fn run(&mut self, gpu: &mut GpuContext) -> Result<NodeTask>;

    /// Receive the pixels of the readback returned by `run()`.
    fn complete(&mut self, _pixels: Bitmap) -> Result<()> {
        Ok(())
    }

    /// Sink result of the last tick.
    fn export(&self) -> Option<SinkOutput> {
        None
    }
}

/// State shared by every node kind.
#[derive(Debug)]
pub struct NodeCore {
    name: String,
    kind: &'static str,
    inputs: Vec<InputPort>,
    outputs: Vec<OutputPort>,
    texture_count: usize,
    textures: Vec<TextureHandle>,
}

impl NodeCore {
    /// # Errors
    /// `InvalidNodeName` for an empty name, `NoPorts` if no port is
    /// declared, `DuplicatePort` if a port name repeats within a direction,
    /// `IllegalArgument` if a port doesn't declare its message type.
    pub fn new(
        kind: &'static str,
        name: impl Into<String>,
        texture_count: usize,
        inputs: Vec<InputPort>,
        outputs: Vec<OutputPort>,
    ) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(PipelineError::InvalidNodeName(name));
        }
        let core = NodeCore {
            name,
            kind,
            inputs,
            outputs,
            texture_count,
            textures: Vec::with_capacity(texture_count),
        };
        if core.inputs.is_empty() && core.outputs.is_empty() {
            return Err(PipelineError::NoPorts(core.full_name()));
        }
        core.check_port_names(core.inputs.iter().map(InputPort::name))?;
        core.check_port_names(core.outputs.iter().map(OutputPort::name))?;

        let untyped = core
            .inputs
            .iter()
            .map(|p| (p.name(), p.spec().expected()))
            .chain(core.outputs.iter().map(|p| (p.name(), p.spec().expected())))
            .find(|(_, ty)| *ty == MessageType::Nothing);
        if let Some((port, _)) = untyped {
            return Err(PipelineError::IllegalArgument(format!(
                "port {port:?} of node {} doesn't declare a message type",
                core.full_name()
            )));
        }
        Ok(core)
    }

    fn check_port_names<'a>(&self, names: impl Iterator<Item = &'a str>) -> Result<()> {
        let mut seen = HashSet::new();
        for name in names {
            if !seen.insert(name) {
                return Err(PipelineError::DuplicatePort {
                    node: self.full_name(),
                    port: name.to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// `Kind[name]`, as used in error messages.
    pub fn full_name(&self) -> String {
        format!("{}[{}]", self.kind, self.name)
    }

    pub fn is_source(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn is_sink(&self) -> bool {
        self.outputs.is_empty()
    }

    pub fn inputs(&self) -> &[InputPort] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[OutputPort] {
        &self.outputs
    }

    pub(crate) fn inputs_mut(&mut self) -> &mut [InputPort] {
        &mut self.inputs
    }

    /// Index of the input port called `name`.
    pub fn input_index(&self, name: &str) -> Result<usize> {
        self.inputs
            .iter()
            .position(|p| p.name() == name)
            .ok_or_else(|| PipelineError::UnknownPort {
                node: self.full_name(),
                port: name.to_string(),
                direction: "input",
            })
    }

    /// Index of the output port called `name`.
    pub fn output_index(&self, name: &str) -> Result<usize> {
        self.outputs
            .iter()
            .position(|p| p.name() == name)
            .ok_or_else(|| PipelineError::UnknownPort {
                node: self.full_name(),
                port: name.to_string(),
                direction: "output",
            })
    }

    // -----------------------------------------------------------------------
    // Scratch textures
    // -----------------------------------------------------------------------

    pub fn texture_count(&self) -> usize {
        self.texture_count
    }

    /// Scratch texture `i`.
    ///
    /// # Errors
    /// `NotInitialized` before `init()` or after `release()`.
    pub fn tex(&self, i: usize) -> Result<TextureHandle> {
        self.textures
            .get(i)
            .copied()
            .ok_or_else(|| PipelineError::NotInitialized(self.full_name()))
    }

    pub fn textures(&self) -> &[TextureHandle] {
        &self.textures
    }

    pub(crate) fn allocate_textures(&mut self, gpu: &mut GpuContext) -> Result<()> {
        self.textures.clear();
        for _ in 0..self.texture_count {
            let handle = gpu.allocate()?;
            self.textures.push(handle);
        }
        trace!(node = %self.full_name(), textures = self.texture_count, "scratch textures allocated");
        Ok(())
    }

    pub(crate) fn release_textures(&mut self, gpu: &mut GpuContext) -> Result<()> {
        while let Some(handle) = self.textures.pop() {
            gpu.free(handle)?;
        }
        Ok(())
    }

    /// Drop handles that belong to a device generation that no longer exists.
    pub(crate) fn forget_textures(&mut self) {
        self.textures.clear();
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    /// The message held by input port `port`.
    ///
    /// # Errors
    /// `NoIncomingLink` if nothing was pulled into the port this tick.
    pub fn read(&self, port: usize) -> Result<Message> {
        let input = self.inputs.get(port).ok_or_else(|| PipelineError::InvalidPortIndex {
            node: self.full_name(),
            index: port,
            count: self.inputs.len(),
        })?;
        input.message().copied().ok_or_else(|| PipelineError::NoIncomingLink {
            node: self.full_name(),
            port: input.name().to_string(),
        })
    }

    /// Image held by input port `port`.
    pub fn read_image(&self, port: usize) -> Result<(TextureHandle, ImageFormat)> {
        let message = self.read(port)?;
        message.as_image().ok_or_else(|| self.rejected(port, &message))
    }

    /// Keypoints held by input port `port`.
    pub fn read_keypoints(&self, port: usize) -> Result<KeypointsMessage> {
        let message = self.read(port)?;
        message.as_keypoints().copied().ok_or_else(|| self.rejected(port, &message))
    }

    fn rejected(&self, port: usize, message: &Message) -> PipelineError {
        PipelineError::MessageRejected {
            node: self.full_name(),
            port: self.inputs[port].name().to_string(),
            message: message.to_string(),
        }
    }

    /// Publish `message` on output port `port`.
    pub fn write(&mut self, port: usize, message: Message) -> Result<()> {
        let node = self.full_name();
        let count = self.outputs.len();
        let output = self.outputs.get_mut(port).ok_or_else(|| PipelineError::InvalidPortIndex {
            node: node.clone(),
            index: port,
            count,
        })?;
        output.write(&node, message)
    }

    pub fn write_image(&mut self, port: usize, image: TextureHandle, format: ImageFormat) -> Result<()> {
        self.write(port, Message::image(image, format))
    }

    /// Publish an encoded keypoint list.
    ///
    /// # Errors
    /// `IllegalArgument` if the texture isn't `encoder_length` square or the
    /// descriptor size isn't a multiple of 4.
    pub fn write_keypoints(
        &mut self,
        gpu: &GpuContext,
        port: usize,
        encoded_keypoints: TextureHandle,
        descriptor_size: usize,
        extra_size: usize,
        encoder_length: u32,
    ) -> Result<()> {
        let message =
            KeypointsMessage::new(encoded_keypoints, descriptor_size, extra_size, encoder_length)?;
        let (w, h) = gpu.size(encoded_keypoints)?;
        if w != encoder_length || h != encoder_length {
            return Err(PipelineError::IllegalArgument(format!(
                "node {} published a {w}x{h} keypoint texture with encoder length {encoder_length}",
                self.full_name()
            )));
        }
        self.write(port, Message::Keypoints(message))
    }

    pub(crate) fn clear_outputs(&mut self) {
        self.outputs.iter_mut().for_each(OutputPort::clear);
    }

    pub(crate) fn clear_ports(&mut self) {
        self.inputs.iter_mut().for_each(InputPort::clear);
        self.clear_outputs();
    }

    /// # Errors
    /// `EmptyOutput` naming the first output nothing was written to.
    pub(crate) fn check_outputs(&self) -> Result<()> {
        match self.outputs.iter().find(|p| p.message().is_none()) {
            Some(port) => Err(PipelineError::EmptyOutput {
                node: self.full_name(),
                port: port.name().to_string(),
            }),
            None => Ok(()),
        }
    }
}

/// The kernel in `slot`, or `NotInitialized` if `init()` hasn't run.
pub(crate) fn kernel<'a>(slot: &'a mut Option<Kernel>, core: &NodeCore) -> Result<&'a mut Kernel> {
    slot.as_mut().ok_or_else(|| PipelineError::NotInitialized(core.full_name()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::message::MessageType;

    fn image_in(name: &str) -> InputPort {
        InputPort::new(name).expects(MessageType::Image)
    }

    fn image_out(name: &str) -> OutputPort {
        OutputPort::new(name).expects(MessageType::Image)
    }

    #[test]
    fn rejects_bad_declarations() {
        assert!(matches!(
            NodeCore::new("Test", "", 0, vec![image_in("in")], vec![]),
            Err(PipelineError::InvalidNodeName(_))
        ));
        assert!(matches!(
            NodeCore::new("Test", "t", 0, vec![], vec![]),
            Err(PipelineError::NoPorts(_))
        ));
        assert!(matches!(
            NodeCore::new("Test", "t", 0, vec![image_in("a"), image_in("a")], vec![]),
            Err(PipelineError::DuplicatePort { .. })
        ));
        assert!(matches!(
            NodeCore::new("Test", "t", 0, vec![InputPort::new("in")], vec![]),
            Err(PipelineError::IllegalArgument(_))
        ));
    }

    #[test]
    fn same_name_in_both_directions_is_fine() {
        let core = NodeCore::new("Test", "t", 0, vec![image_in("x")], vec![image_out("x")]).unwrap();
        assert_eq!(core.full_name(), "Test[t]");
        assert!(!core.is_source() && !core.is_sink());
        assert_eq!(core.input_index("x").unwrap(), 0);
        assert!(core.output_index("y").is_err());
    }

    #[test]
    fn textures_follow_init_and_release() {
        let mut gpu = GpuContext::default();
        let mut core = NodeCore::new("Test", "t", 2, vec![], vec![image_out("out")]).unwrap();
        assert!(matches!(core.tex(0), Err(PipelineError::NotInitialized(_))));

        let before = gpu.pool().available();
        core.allocate_textures(&mut gpu).unwrap();
        assert_eq!(gpu.pool().available(), before - 2);
        assert!(core.tex(1).is_ok());

        core.release_textures(&mut gpu).unwrap();
        assert_eq!(gpu.pool().available(), before);
        assert!(core.tex(0).is_err());
    }

    #[test]
    fn empty_output_is_reported() {
        let mut core = NodeCore::new("Test", "t", 0, vec![], vec![image_out("out")]).unwrap();
        assert!(matches!(core.check_outputs(), Err(PipelineError::EmptyOutput { .. })));
        core.write_image(0, TextureHandle::SURFACE, ImageFormat::Rgba).unwrap();
        assert!(core.check_outputs().is_ok());
        core.clear_ports();
        assert!(core.check_outputs().is_err());
    }

    #[test]
    fn keypoint_texture_must_be_square_encoder() {
        let mut gpu = GpuContext::default();
        let out = OutputPort::new("out").expects(MessageType::Keypoints);
        let mut core = NodeCore::new("Test", "t", 1, vec![], vec![out]).unwrap();
        core.allocate_textures(&mut gpu).unwrap();
        let t = core.tex(0).unwrap();
        gpu.resize(t, 4, 4).unwrap();
        assert!(core.write_keypoints(&gpu, 0, t, 0, 0, 5).is_err());
        assert!(core.write_keypoints(&gpu, 0, t, 0, 0, 4).is_ok());
    }
}
