// pipeline/nodes/images.rs — Image sources, sinks and routing.
//
//   ImageSource       host bitmap ─► texture               (source)
//   ImageSink         texture ─► host bitmap, async         (sink)
//   ImageBuffer       output of the previous tick           (2 pages)
//   ImageMultiplexer  route one of N inputs to the output
//   ImagePyramid      Gaussian pyramid as the output's mip chain

use std::mem;

use futures::FutureExt;

use crate::error::{PipelineError, Result};
use crate::gpu::programs::pyramids::{half_size, GAUSSIAN_KERNEL_5};
use crate::gpu::programs::{GROUP_PYRAMIDS, GROUP_UTILS};
use crate::gpu::{Arg, GpuContext, Kernel, MipLevel};
use crate::keypoint::codec::PYRAMID_MAX_LEVELS;
use crate::media::Bitmap;
use crate::pipeline::message::{ImageFormat, MessageType};
use crate::pipeline::node::{kernel, NodeCore, NodeTask, PipelineNode, SinkOutput};
use crate::pipeline::port::{InputPort, OutputPort, DEFAULT_INPUT, DEFAULT_OUTPUT};

fn image_input(name: &str) -> InputPort {
    InputPort::new(name).expects(MessageType::Image)
}

fn image_output() -> OutputPort {
    OutputPort::new(DEFAULT_OUTPUT).expects(MessageType::Image)
}

// ---------------------------------------------------------------------------
// ImageSource
// ---------------------------------------------------------------------------

/// Uploads a host bitmap every tick.
#[derive(Debug)]
pub struct ImageSource {
    core: NodeCore,
    media: Option<Bitmap>,
    format: ImageFormat,
}

impl ImageSource {
    pub fn new(name: &str) -> Result<Self> {
        Ok(ImageSource {
            core: NodeCore::new("ImageSource", name, 1, vec![], vec![image_output()])?,
            media: None,
            format: ImageFormat::Rgba,
        })
    }

    pub fn set_media(&mut self, media: Bitmap) {
        self.media = Some(media);
    }

    pub fn media(&self) -> Option<&Bitmap> {
        self.media.as_ref()
    }

    /// Format announced downstream. Use `Grey` for bitmaps that are
    /// greyscale already.
    pub fn set_format(&mut self, format: ImageFormat) {
        self.format = format;
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }
}

impl PipelineNode for ImageSource {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    fn run(&mut self, gpu: &mut GpuContext) -> Result<NodeTask> {
        let media = self
            .media
            .as_ref()
            .ok_or_else(|| PipelineError::MissingMedia(self.core.full_name()))?;
        let texture = self.core.tex(0)?;
        gpu.upload(texture, media)?;
        self.core.write_image(0, texture, self.format)?;
        Ok(NodeTask::Ready)
    }
}

// ---------------------------------------------------------------------------
// ImageSink
// ---------------------------------------------------------------------------

/// Reads its input back to the host.
#[derive(Debug)]
pub struct ImageSink {
    core: NodeCore,
    bitmap: Option<Bitmap>,
}

impl ImageSink {
    pub fn new(name: &str) -> Result<Self> {
        Ok(ImageSink {
            core: NodeCore::new("ImageSink", name, 0, vec![image_input(DEFAULT_INPUT)], vec![])?,
            bitmap: None,
        })
    }

    /// Bitmap read back by the last tick.
    pub fn bitmap(&self) -> Option<&Bitmap> {
        self.bitmap.as_ref()
    }
}

impl PipelineNode for ImageSink {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    fn run(&mut self, gpu: &mut GpuContext) -> Result<NodeTask> {
        let (image, _) = self.core.read_image(0)?;
        let readback = gpu.read_pixels_async(image)?;
        Ok(NodeTask::Pending(readback.boxed_local()))
    }

    fn complete(&mut self, pixels: Bitmap) -> Result<()> {
        self.bitmap = Some(pixels);
        Ok(())
    }

    fn export(&self) -> Option<SinkOutput> {
        self.bitmap.clone().map(SinkOutput::Image)
    }
}

// ---------------------------------------------------------------------------
// ImageBuffer
// ---------------------------------------------------------------------------

/// Outputs the image it received on the previous tick. On the first tick
/// after `init`, the input passes through.
#[derive(Debug)]
pub struct ImageBuffer {
    core: NodeCore,
    copy: Option<Kernel>,
    page: usize,
    initialized: bool,
    previous_format: ImageFormat,
}

impl ImageBuffer {
    pub fn new(name: &str) -> Result<Self> {
        Ok(ImageBuffer {
            core: NodeCore::new(
                "ImageBuffer",
                name,
                2,
                vec![image_input(DEFAULT_INPUT)],
                vec![image_output()],
            )?,
            copy: None,
            page: 0,
            initialized: false,
            previous_format: ImageFormat::Rgba,
        })
    }
}

impl PipelineNode for ImageBuffer {
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
        let (image, format) = self.core.read_image(0)?;
        if gpu.has_mipmaps(image)? {
            return Err(PipelineError::NotSupported(format!(
                "{} can't bufferize a pyramid",
                self.core.full_name()
            )));
        }

        let previous_input = self.core.tex(1 - self.page)?;
        let output = self.core.tex(self.page)?;
        let previous_format = mem::replace(&mut self.previous_format, format);

        let (w, h) = gpu.size(image)?;
        kernel(&mut self.copy, &self.core)?
            .outputs(w, h, &[previous_input])?
            .call(gpu, &[Arg::Texture(image)])?;
        self.page = 1 - self.page;

        if !self.initialized {
            self.initialized = true;
            self.core.write_image(0, previous_input, format)?;
        } else {
            self.core.write_image(0, output, previous_format)?;
        }
        Ok(NodeTask::Ready)
    }
}

// ---------------------------------------------------------------------------
// ImageMultiplexer
// ---------------------------------------------------------------------------

/// Routes input `in{port}` to the output.
#[derive(Debug)]
pub struct ImageMultiplexer {
    core: NodeCore,
    port: usize,
}

impl ImageMultiplexer {
    /// A multiplexer with inputs `in0` and `in1`.
    pub fn new(name: &str) -> Result<Self> {
        Self::with_inputs(name, 2)
    }

    /// A multiplexer with inputs `in0` .. `in{count-1}`.
    ///
    /// # Errors
    /// `IllegalArgument` if `count` is zero.
    pub fn with_inputs(name: &str, count: usize) -> Result<Self> {
        if count == 0 {
            return Err(PipelineError::IllegalArgument(format!(
                "multiplexer {name:?} needs at least one input"
            )));
        }
        let inputs = (0..count).map(|i| image_input(&format!("in{i}"))).collect();
        Ok(ImageMultiplexer {
            core: NodeCore::new("ImageMultiplexer", name, 0, inputs, vec![image_output()])?,
            port: 0,
        })
    }

    pub fn port(&self) -> usize {
        self.port
    }

    /// Select the routed input.
    ///
    /// # Errors
    /// `InvalidPortIndex` if there is no input `in{port}`.
    pub fn set_port(&mut self, port: usize) -> Result<()> {
        let count = self.core.inputs().len();
        if port >= count {
            return Err(PipelineError::InvalidPortIndex {
                node: self.core.full_name(),
                index: port,
                count,
            });
        }
        self.port = port;
        Ok(())
    }
}

impl PipelineNode for ImageMultiplexer {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    fn run(&mut self, _gpu: &mut GpuContext) -> Result<NodeTask> {
        let message = self.core.read(self.port)?;
        self.core.write(0, message)?;
        Ok(NodeTask::Ready)
    }
}

// ---------------------------------------------------------------------------
// ImagePyramid
// ---------------------------------------------------------------------------

/// Copies its input and attaches a Gaussian pyramid as the mip chain:
/// level i+1 = downsample2(smoothY(smoothX(level i))).
#[derive(Debug)]
pub struct ImagePyramid {
    core: NodeCore,
    kernels: Option<PyramidKernels>,
}

#[derive(Debug)]
struct PyramidKernels {
    copy: Kernel,
    smooth_x: Kernel,
    smooth_y: Kernel,
    downsample: Kernel,
}

/// Scratch texture roles.
const OUTPUT: usize = 0;
const BLUR_X: usize = 1;
const BLUR_Y: usize = 2;
const LEVEL_A: usize = 3;
const LEVEL_B: usize = 4;

impl ImagePyramid {
    pub fn new(name: &str) -> Result<Self> {
        Ok(ImagePyramid {
            core: NodeCore::new(
                "ImagePyramid",
                name,
                5,
                vec![image_input(DEFAULT_INPUT)],
                vec![image_output()],
            )?,
            kernels: None,
        })
    }

    /// Levels built for a `width`×`height` image, base level included.
    pub fn levels(width: u32, height: u32) -> usize {
        let mip_levels = 1 + width.max(height).max(1).ilog2() as usize;
        mip_levels.min(PYRAMID_MAX_LEVELS as usize)
    }
}

impl PipelineNode for ImagePyramid {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    fn init(&mut self, gpu: &mut GpuContext) -> Result<()> {
        self.core.allocate_textures(gpu)?;
        self.kernels = Some(PyramidKernels {
            copy: gpu.kernel(GROUP_UTILS, "copy")?,
            smooth_x: gpu.kernel(GROUP_PYRAMIDS, "smoothX")?,
            smooth_y: gpu.kernel(GROUP_PYRAMIDS, "smoothY")?,
            downsample: gpu.kernel(GROUP_PYRAMIDS, "downsample2")?,
        });
        Ok(())
    }

    fn run(&mut self, gpu: &mut GpuContext) -> Result<NodeTask> {
        let (image, format) = self.core.read_image(0)?;
        let tex = |i| self.core.tex(i);
        let (output, blur_x, blur_y) = (tex(OUTPUT)?, tex(BLUR_X)?, tex(BLUR_Y)?);
        let levels_tex = [tex(LEVEL_A)?, tex(LEVEL_B)?];
        let k = self
            .kernels
            .as_mut()
            .ok_or_else(|| PipelineError::NotInitialized(self.core.full_name()))?;

        let (mut w, mut h) = gpu.size(image)?;
        let num_levels = Self::levels(w, h);
        let mut mips = Vec::with_capacity(num_levels.saturating_sub(1));
        let mut current = image;

        for _ in 1..num_levels {
            let (hw, hh) = half_size(w, h);
            let bx = k.smooth_x.outputs(w, h, &[blur_x])?.call(
                gpu,
                &[Arg::Texture(current), Arg::FloatArray(&GAUSSIAN_KERNEL_5)],
            )?;
            let by = k.smooth_y.outputs(w, h, &[blur_y])?.call(
                gpu,
                &[Arg::Texture(bx), Arg::FloatArray(&GAUSSIAN_KERNEL_5)],
            )?;
            current = k.downsample.outputs(hw, hh, &levels_tex)?.call(gpu, &[Arg::Texture(by)])?;
            mips.push(MipLevel {
                width: hw,
                height: hh,
                pixels: gpu.texture(current)?.pixels().to_vec(),
            });
            (w, h) = (hw, hh);
        }

        let (w0, h0) = gpu.size(image)?;
        k.copy.outputs(w0, h0, &[output])?.call(gpu, &[Arg::Texture(image)])?;
        gpu.set_mipmaps(output, mips)?;
        self.core.write_image(0, output, format)?;
        Ok(NodeTask::Ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pyramid_levels_are_capped() {
        assert_eq!(ImagePyramid::levels(1, 1), 1);
        assert_eq!(ImagePyramid::levels(2, 1), 2);
        assert_eq!(ImagePyramid::levels(5, 3), 3);
        assert_eq!(ImagePyramid::levels(640, 480), PYRAMID_MAX_LEVELS as usize);
    }

    #[test]
    fn multiplexer_port_is_bounded() {
        let mut mux = ImageMultiplexer::with_inputs("mux", 3).unwrap();
        assert!(mux.set_port(2).is_ok());
        assert!(matches!(mux.set_port(3), Err(PipelineError::InvalidPortIndex { .. })));
        assert_eq!(mux.port(), 2);
        assert_eq!(mux.core().input_index("in2").unwrap(), 2);
    }

    #[test]
    fn multiplexer_needs_an_input() {
        let err = ImageMultiplexer::with_inputs("mux", 0).unwrap_err();
        assert!(matches!(err, PipelineError::IllegalArgument(_)), "{err}");
        assert!(ImageMultiplexer::with_inputs("mux", 1).is_ok());
    }

    #[test]
    fn source_without_media_fails() {
        let mut gpu = GpuContext::default();
        let mut source = ImageSource::new("src").unwrap();
        source.init(&mut gpu).unwrap();
        assert!(matches!(source.run(&mut gpu), Err(PipelineError::MissingMedia(_))));
    }
}
