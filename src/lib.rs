// rudolf-flow: GPU-style dataflow pipelines for keypoint processing
//
// Images and keypoint lists live in RGBA8 textures on a device. Nodes run
// per-pixel kernels over them, once per tick, in topological order; only
// sinks read data back to the host.
//
//   gpu        reference device (textures, pool, kernels, fences) and the
//              native wgpu port of the keypoint sort network
//   keypoint   keypoint encoding in RGBA8 textures + the sort network
//   pipeline   typed graph of nodes, ports and messages
//   media      host bitmaps
//   random     seedable PRNG for nodes that shuffle
//
// Reference: the permutation merge sort follows the merge-path formulation
// of Green, McColl & Bader, "GPU Merge Path" (ICS 2012).

pub mod error;
pub mod gpu;
pub mod keypoint;
pub mod media;
pub mod pipeline;
pub mod random;

pub use error::{ErrorKind, PipelineError, Result};
pub use gpu::{DeviceProfile, GpuConfig, GpuContext, TextureHandle};
pub use keypoint::Keypoint;
pub use media::Bitmap;
pub use pipeline::{Pipeline, PipelineBuilder, PipelineOutput, SinkOutput};
