// demos/keypoint_pipeline.rs — Detect, rank and print FAST keypoints.
//
//   source ─► greyscale ─┬─► fast ─► clipper ─► keypoints
//                        └─► image
//
// Runs a few ticks over a moving synthetic scene, simulates a context loss
// halfway through and restores it. If a Vulkan adapter is present, the last
// detection is also sorted on the native device and compared.
//
// USAGE
//   cargo run --example keypoint_pipeline
//   RUST_LOG=rudolf_flow=trace cargo run --example keypoint_pipeline

use std::error::Error;
use std::time::Instant;

use tracing_subscriber::EnvFilter;

use rudolf_flow::gpu::native::{NativeDevice, NativeSorter};
use rudolf_flow::keypoint::codec::{decode_keypoints, encode_keypoints, encoder_length};
use rudolf_flow::pipeline::nodes::{
    FastConfig, FastDetector, Greyscale, ImageSink, ImageSource, KeypointClipper, KeypointSink,
};
use rudolf_flow::{Bitmap, PipelineBuilder, PipelineError};

const WIDTH: u32 = 160;
const HEIGHT: u32 = 120;
const TOP_K: usize = 12;
const TICKS: u32 = 6;

/// Bright squares on a gradient, shifted by `dx` pixels.
fn scene(dx: u32) -> Bitmap {
    let mut luma = vec![0u8; (WIDTH * HEIGHT) as usize];
    for y in 0..HEIGHT {
        for x in 0..WIDTH {
            luma[(y * WIDTH + x) as usize] = (x * 60 / WIDTH + y * 30 / HEIGHT) as u8;
        }
    }
    for (i, (sx, sy)) in [(20, 20), (90, 30), (40, 70), (110, 80)].into_iter().enumerate() {
        for y in sy..sy + 18 {
            for x in sx + dx..(sx + dx + 24).min(WIDTH) {
                luma[(y * WIDTH + x) as usize] = 180 + 15 * i as u8;
            }
        }
    }
    Bitmap::from_luma(WIDTH, HEIGHT, &luma)
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut b = PipelineBuilder::new();
    let src = b.add(ImageSource::new("source")?)?;
    let grey = b.add(Greyscale::new("greyscale")?)?;
    let fast = b.add(FastDetector::new("fast", FastConfig { threshold: 30, ..FastConfig::default() })?)?;
    let mut clipper = KeypointClipper::new("clipper")?;
    clipper.set_size(TOP_K);
    let clip = b.add(clipper)?;
    let kps = b.add(KeypointSink::new("keypoints")?)?;
    let img = b.add(ImageSink::new("image")?)?;
    b.connect(src, "out", grey, "in")?;
    b.connect(grey, "out", fast, "in")?;
    b.connect(grey, "out", img, "in")?;
    b.connect(fast, "out", clip, "in")?;
    b.connect(clip, "out", kps, "in")?;
    let pipeline = b.init()?;
    println!("execution order: {}", pipeline.sequence().join(" → "));

    let source = pipeline.node_id("source")?;
    let mut last = Vec::new();
    for t in 0..TICKS {
        pipeline.node_mut::<ImageSource>(source)?.set_media(scene(t * 2));
        if t == TICKS / 2 {
            pipeline.lose_context()?;
        }

        let start = Instant::now();
        let out = match pollster::block_on(pipeline.run()) {
            Ok(out) => out,
            Err(PipelineError::ContextLost) => {
                println!("tick {t}: context lost, restoring");
                pipeline.restore()?;
                pollster::block_on(pipeline.run())?
            }
            Err(e) => return Err(e.into()),
        };
        let keypoints = out.keypoints("keypoints").unwrap_or_default();
        println!(
            "tick {t}: {} keypoints in {:.2?} (image {}×{})",
            keypoints.len(),
            start.elapsed(),
            out.image("image").map_or(0, |b| b.width()),
            out.image("image").map_or(0, |b| b.height()),
        );
        last = keypoints.to_vec();
    }

    for k in &last {
        println!("  ({:6.2}, {:6.2})  score {:8.1}", k.x, k.y, k.score);
    }

    match NativeDevice::new() {
        Ok(gpu) => {
            let sorter = NativeSorter::new(&gpu);
            let mut shuffled = last.clone();
            shuffled.reverse();
            let length = encoder_length(shuffled.len(), 0, 0);
            let encoded = encode_keypoints(&shuffled, 0, 0, length);
            let sorted = sorter.sort(&gpu, &encoded, 0, 0, length, shuffled.len(), length)?;
            let scores = |kps: &[rudolf_flow::Keypoint]| kps.iter().map(|k| k.score).collect::<Vec<_>>();
            let agree = scores(&decode_keypoints(&sorted, 0, 0, length)) == scores(&last);
            println!("native sort on {}: same ranking as the pipeline: {agree}", gpu.adapter_info);
        }
        Err(e) => println!("native device unavailable: {e}"),
    }

    pipeline.release()?;
    Ok(())
}
