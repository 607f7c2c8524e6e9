// tests/test_pipeline.rs — Building and running pipelines.
//
// Covers the graph contract (links, cycles, sequence validation), the
// tick loop (serialised runs, busy state, port cleanup) and recovery from
// a lost device.

use rudolf_flow::keypoint::codec::{encode_keypoints, encoder_length};
use rudolf_flow::pipeline::nodes::{
    Greyscale, ImageBuffer, ImageSink, ImageSource, KeypointClipper, KeypointSink, KeypointSource,
};
use rudolf_flow::pipeline::{
    InputPort, MessageType, NodeCore, NodeTask, OutputPort, PipelineNode,
};
use rudolf_flow::{
    Bitmap, ErrorKind, GpuConfig, GpuContext, Keypoint, PipelineBuilder, PipelineError, Result,
};

fn checkerboard(w: u32, h: u32) -> Bitmap {
    let mut bmp = Bitmap::new(w, h);
    for y in 0..h {
        for x in 0..w {
            let v = if (x / 8 + y / 8) % 2 == 0 { 200 } else { 40 };
            bmp.set(x, y, [v, v / 2, 255 - v, 255]);
        }
    }
    bmp
}

/// source ─► sink
fn passthrough() -> rudolf_flow::Pipeline {
    let mut b = PipelineBuilder::new();
    let mut source = ImageSource::new("source").unwrap();
    source.set_media(checkerboard(16, 16));
    let src = b.add(source).unwrap();
    let sink = b.add(ImageSink::new("image").unwrap()).unwrap();
    b.connect(src, "out", sink, "in").unwrap();
    b.init().unwrap()
}

/// Stands in for a detector: ignores the image content and publishes a
/// fixed list of keypoints in an encoding of capacity 10.
#[derive(Debug)]
struct FixedDetector {
    core: NodeCore,
    keypoints: Vec<Keypoint>,
}

impl FixedDetector {
    fn new(name: &str, keypoints: Vec<Keypoint>) -> Result<Self> {
        Ok(FixedDetector {
            core: NodeCore::new(
                "FixedDetector",
                name,
                1,
                vec![InputPort::new("in").expects(MessageType::Image)],
                vec![OutputPort::new("out").expects(MessageType::Keypoints)],
            )?,
            keypoints,
        })
    }
}

impl PipelineNode for FixedDetector {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    fn run(&mut self, gpu: &mut GpuContext) -> Result<NodeTask> {
        self.core.read_image(0)?;
        let length = encoder_length(10, 0, 0);
        let pixels = encode_keypoints(&self.keypoints, 0, 0, length);
        let texture = self.core.tex(0)?;
        gpu.upload_bytes(texture, length, length, &pixels)?;
        self.core.write_keypoints(gpu, 0, texture, 0, 0, length)?;
        Ok(NodeTask::Ready)
    }
}

/// Remembers the layout of the last keypoint message it received as
/// `(encoder_length, descriptor_size, extra_size)`. Exports nothing.
#[derive(Debug)]
struct LayoutRecorder {
    core: NodeCore,
    seen: Option<(u32, usize, usize)>,
}

impl LayoutRecorder {
    fn new(name: &str) -> Result<Self> {
        Ok(LayoutRecorder {
            core: NodeCore::new(
                "LayoutRecorder",
                name,
                0,
                vec![InputPort::new("in").expects(MessageType::Keypoints)],
                vec![],
            )?,
            seen: None,
        })
    }
}

impl PipelineNode for LayoutRecorder {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    fn run(&mut self, _gpu: &mut GpuContext) -> Result<NodeTask> {
        let m = self.core.read_keypoints(0)?;
        self.seen = Some((m.encoder_length, m.descriptor_size, m.extra_size));
        Ok(NodeTask::Ready)
    }
}

// ---------------------------------------------------------------------------
// Topology
// ---------------------------------------------------------------------------

#[test]
fn nodes_run_in_topological_order() {
    let mut b = PipelineBuilder::new();
    // added in reverse on purpose
    let sink = b.add(ImageSink::new("image").unwrap()).unwrap();
    let grey = b.add(Greyscale::new("greyscale").unwrap()).unwrap();
    let mut source = ImageSource::new("source").unwrap();
    source.set_media(checkerboard(8, 8));
    let src = b.add(source).unwrap();
    b.connect(grey, "out", sink, "in").unwrap();
    b.connect(src, "out", grey, "in").unwrap();

    let pipeline = b.init().unwrap();
    assert_eq!(pipeline.sequence(), vec!["source", "greyscale", "image"]);
}

#[test]
fn cycles_are_rejected_at_init() {
    let mut b = PipelineBuilder::new();
    let src = b.add(ImageSource::new("source").unwrap()).unwrap();
    let mux = b.add(rudolf_flow::pipeline::nodes::ImageMultiplexer::new("mux").unwrap()).unwrap();
    let grey = b.add(Greyscale::new("greyscale").unwrap()).unwrap();
    let sink = b.add(ImageSink::new("image").unwrap()).unwrap();
    b.connect(src, "out", mux, "in0").unwrap();
    b.connect(mux, "out", grey, "in").unwrap();
    b.connect(grey, "out", mux, "in1").unwrap();
    b.connect(grey, "out", sink, "in").unwrap();

    let err = b.init().unwrap_err();
    assert!(matches!(err, PipelineError::Cycle(_)), "{err}");
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[test]
fn sequence_needs_a_source_and_a_sink() {
    assert!(matches!(PipelineBuilder::new().init(), Err(PipelineError::NoNodes)));

    let mut b = PipelineBuilder::new();
    b.add(ImageSource::new("source").unwrap()).unwrap();
    assert!(matches!(b.init(), Err(PipelineError::NoSink)));

    let mut b = PipelineBuilder::new();
    b.add(ImageSink::new("image").unwrap()).unwrap();
    assert!(matches!(b.init(), Err(PipelineError::NoSource)));
}

#[test]
fn link_contract() {
    let mut b = PipelineBuilder::new();
    let src = b.add(ImageSource::new("source").unwrap()).unwrap();
    let grey = b.add(Greyscale::new("greyscale").unwrap()).unwrap();
    let kps = b.add(KeypointSink::new("keypoints").unwrap()).unwrap();

    assert!(matches!(b.connect(grey, "out", grey, "in"), Err(PipelineError::SelfLink(_))));
    assert!(matches!(b.connect(src, "nope", grey, "in"), Err(PipelineError::UnknownPort { .. })));
    assert!(matches!(
        b.connect(src, "out", kps, "in"),
        Err(PipelineError::IncompatiblePorts { .. })
    ));

    b.connect(src, "out", grey, "in").unwrap();
    assert!(matches!(
        b.connect(src, "out", grey, "in"),
        Err(PipelineError::AlreadyConnected { .. })
    ));
}

#[test]
fn duplicate_node_names_are_rejected() {
    let mut b = PipelineBuilder::new();
    b.add(ImageSource::new("a").unwrap()).unwrap();
    let err = b.add(ImageSink::new("a").unwrap()).unwrap_err();
    assert!(matches!(err, PipelineError::DuplicateNode(name) if name == "a"));
}

#[test]
fn unlinked_input_is_rejected_at_init() {
    let mut b = PipelineBuilder::new();
    let mut source = ImageSource::new("source").unwrap();
    source.set_media(checkerboard(4, 4));
    b.add(source).unwrap();
    b.add(ImageSink::new("image").unwrap()).unwrap();

    let err = b.init().unwrap_err();
    assert!(
        matches!(&err, PipelineError::NoIncomingLink { node, port } if node.contains("image") && port == "in"),
        "{err}"
    );
}

// ---------------------------------------------------------------------------
// Ticks
// ---------------------------------------------------------------------------

#[test]
fn passthrough_returns_the_uploaded_image() {
    let pipeline = passthrough();
    let out = pollster::block_on(pipeline.run()).unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out.image("image"), Some(&checkerboard(16, 16)));
    assert_eq!(out.keypoints("image"), None);
}

#[test]
fn detector_to_clipper_to_sink() {
    let scores = [3.0, 9.0, 1.0, 7.0, 10.0, 2.0, 8.0, 5.0, 4.0, 6.0];
    let keypoints: Vec<Keypoint> = scores
        .iter()
        .enumerate()
        .map(|(i, &s)| Keypoint::new(4.0 * i as f32, 2.0, s))
        .collect();

    //                           ┌─► clipper ─► keypoints
    // source ─► grey ─► detector┤
    //                           └─► recorder
    let mut b = PipelineBuilder::new();
    let mut source = ImageSource::new("source").unwrap();
    source.set_media(Bitmap::filled(64, 64, [128, 128, 128, 255]));
    let src = b.add(source).unwrap();
    let grey = b.add(Greyscale::new("greyscale").unwrap()).unwrap();
    let det = b.add(FixedDetector::new("detector", keypoints).unwrap()).unwrap();
    let rec = b.add(LayoutRecorder::new("recorder").unwrap()).unwrap();
    let mut clipper = KeypointClipper::new("clipper").unwrap();
    clipper.set_size(3);
    let clip = b.add(clipper).unwrap();
    let sink = b.add(KeypointSink::new("keypoints").unwrap()).unwrap();
    b.connect(src, "out", grey, "in").unwrap();
    b.connect(grey, "out", det, "in").unwrap();
    b.connect(det, "out", rec, "in").unwrap();
    b.connect(det, "out", clip, "in").unwrap();
    b.connect(clip, "out", sink, "in").unwrap();

    let pipeline = b.init().unwrap();
    let out = pollster::block_on(pipeline.run()).unwrap();

    // the detector published all 10 at capacity 10
    let rec = pipeline.node_id("recorder").unwrap();
    let seen = pipeline.node::<LayoutRecorder>(rec).unwrap().seen;
    assert_eq!(seen, Some((encoder_length(10, 0, 0), 0, 0)));

    // the clipper kept the top 3 of the 10
    let kept: Vec<(f32, f32)> =
        out.keypoints("keypoints").unwrap().iter().map(|k| (k.score, k.x)).collect();
    assert_eq!(kept, vec![(10.0, 16.0), (9.0, 4.0), (8.0, 24.0)]);

    // the detector is reachable by name and type
    let id = pipeline.node_id("detector").unwrap();
    assert_eq!(pipeline.node::<FixedDetector>(id).unwrap().keypoints.len(), 10);
    assert!(matches!(
        pipeline.node::<ImageSource>(id),
        Err(PipelineError::WrongNodeType(_))
    ));
}

#[test]
fn keypoint_source_feeds_a_sink() {
    let mut b = PipelineBuilder::new();
    let mut source = KeypointSource::new("source").unwrap();
    source.set_capacity(16);
    source.set_keypoints(vec![Keypoint::new(1.0, 2.0, 3.0), Keypoint::new(5.0, 6.0, 7.0)]);
    let src = b.add(source).unwrap();
    let sink = b.add(KeypointSink::new("keypoints").unwrap()).unwrap();
    b.connect(src, "out", sink, "in").unwrap();

    let pipeline = b.init().unwrap();
    let out = pollster::block_on(pipeline.run()).unwrap();
    let kps = out.keypoints("keypoints").unwrap();
    assert_eq!(kps.len(), 2);
    assert_eq!((kps[1].x, kps[1].y), (5.0, 6.0));
}

#[test]
fn concurrent_runs_are_serialised() {
    let pipeline = passthrough();
    let (a, b) = futures::executor::block_on(async { futures::join!(pipeline.run(), pipeline.run()) });
    assert_eq!(a.unwrap(), b.unwrap());
    assert!(!pipeline.is_busy());
}

#[test]
fn nodes_are_locked_while_a_tick_is_in_flight() {
    let pipeline = passthrough();
    let id = pipeline.node_id("source").unwrap();

    let (out, during) = futures::executor::block_on(async {
        futures::join!(pipeline.run(), async {
            (pipeline.is_busy(), pipeline.node_mut::<ImageSource>(id).err())
        })
    });
    out.unwrap();
    assert!(during.0);
    assert!(matches!(during.1, Some(PipelineError::Busy)));

    // free again once the tick is over
    pipeline.node_mut::<ImageSource>(id).unwrap().set_media(checkerboard(4, 4));
    let out = pollster::block_on(pipeline.run()).unwrap();
    assert_eq!(out.image("image").unwrap().width(), 4);
}

#[test]
fn missing_media_is_a_configuration_error() {
    let mut b = PipelineBuilder::new();
    let src = b.add(ImageSource::new("source").unwrap()).unwrap();
    let sink = b.add(ImageSink::new("image").unwrap()).unwrap();
    b.connect(src, "out", sink, "in").unwrap();
    let pipeline = b.init().unwrap();

    let err = pollster::block_on(pipeline.run()).unwrap_err();
    assert!(matches!(err, PipelineError::MissingMedia(_)));
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[test]
fn textures_go_back_to_the_pool_on_release() {
    let config = GpuConfig::default().with_pool_capacity(8);
    let mut b = PipelineBuilder::with_config(config);
    let mut source = ImageSource::new("source").unwrap();
    source.set_media(checkerboard(8, 8));
    let src = b.add(source).unwrap();
    let buf = b.add(ImageBuffer::new("buffer").unwrap()).unwrap();
    let sink = b.add(ImageSink::new("image").unwrap()).unwrap();
    b.connect(src, "out", buf, "in").unwrap();
    b.connect(buf, "out", sink, "in").unwrap();

    let pipeline = b.init().unwrap();
    // source 1 + buffer 2
    assert_eq!(pipeline.available_textures(), 5);
    pollster::block_on(pipeline.run()).unwrap();
    pipeline.release().unwrap();
}

#[test]
fn pool_exhaustion_fails_init() {
    let config = GpuConfig::default().with_pool_capacity(2);
    let mut b = PipelineBuilder::with_config(config);
    let src = b.add(KeypointSource::new("source").unwrap()).unwrap();
    let clip = b.add(KeypointClipper::new("clipper").unwrap()).unwrap();
    let sink = b.add(KeypointSink::new("keypoints").unwrap()).unwrap();
    b.connect(src, "out", clip, "in").unwrap();
    b.connect(clip, "out", sink, "in").unwrap();

    let err = b.init().unwrap_err();
    assert!(matches!(err, PipelineError::OutOfMemory(_)), "{err}");
    assert_eq!(err.kind(), ErrorKind::Device);
}

// ---------------------------------------------------------------------------
// Context loss
// ---------------------------------------------------------------------------

#[test]
fn lost_context_fails_ticks_until_restored() {
    let pipeline = passthrough();
    let generation = pipeline.generation();

    pipeline.lose_context().unwrap();
    assert!(pipeline.is_context_lost());
    let err = pollster::block_on(pipeline.run()).unwrap_err();
    assert!(matches!(err, PipelineError::ContextLost));
    assert_eq!(err.kind(), ErrorKind::Device);

    pipeline.restore().unwrap();
    assert!(!pipeline.is_context_lost());
    assert_eq!(pipeline.generation(), generation + 1);
    let out = pollster::block_on(pipeline.run()).unwrap();
    assert_eq!(out.image("image"), Some(&checkerboard(16, 16)));
}

#[test]
fn context_lost_during_a_readback() {
    let pipeline = passthrough();
    let (out, lost) = futures::executor::block_on(async {
        futures::join!(pipeline.run(), async { pipeline.lose_context() })
    });
    lost.unwrap();
    assert!(matches!(out, Err(PipelineError::ContextLost)));
    assert!(!pipeline.is_busy());

    pipeline.restore().unwrap();
    assert!(pollster::block_on(pipeline.run()).is_ok());
}
