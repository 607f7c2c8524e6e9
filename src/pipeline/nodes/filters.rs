// pipeline/nodes/filters.rs — Image filters.

use crate::error::Result;
use crate::gpu::programs::GROUP_FILTERS;
use crate::gpu::{Arg, GpuContext, Kernel};
use crate::pipeline::message::{ImageFormat, MessageType};
use crate::pipeline::node::{kernel, NodeCore, NodeTask, PipelineNode};
use crate::pipeline::port::{InputPort, OutputPort, DEFAULT_INPUT, DEFAULT_OUTPUT};

/// RGBA to greyscale (BT.601 luma in R, G and B).
#[derive(Debug)]
pub struct Greyscale {
    core: NodeCore,
    rgb2grey: Option<Kernel>,
}

impl Greyscale {
    pub fn new(name: &str) -> Result<Self> {
        Ok(Greyscale {
            core: NodeCore::new(
                "Greyscale",
                name,
                1,
                vec![InputPort::new(DEFAULT_INPUT).expects(MessageType::Image)],
                vec![OutputPort::new(DEFAULT_OUTPUT).expects(MessageType::Image)],
            )?,
            rgb2grey: None,
        })
    }
}

impl PipelineNode for Greyscale {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    fn init(&mut self, gpu: &mut GpuContext) -> Result<()> {
        self.core.allocate_textures(gpu)?;
        self.rgb2grey = Some(gpu.kernel(GROUP_FILTERS, "rgb2grey")?);
        Ok(())
    }

    fn run(&mut self, gpu: &mut GpuContext) -> Result<NodeTask> {
        let (image, _) = self.core.read_image(0)?;
        let (w, h) = gpu.size(image)?;
        let output = self.core.tex(0)?;
        let grey = kernel(&mut self.rgb2grey, &self.core)?
            .outputs(w, h, &[output])?
            .call(gpu, &[Arg::Texture(image)])?;
        self.core.write_image(0, grey, ImageFormat::Grey)?;
        Ok(NodeTask::Ready)
    }
}
