// gpu/mod.rs — Device layer.
//
// Two devices live here:
//
//   GpuContext (reference device)
//     Textures in host memory, a texture pool, a program center of fragment
//     programs and completion fences. Deterministic and always available;
//     the pipeline runs on it and it is the authoritative reference for
//     every keypoint kernel.
//
//   native::NativeDevice (wgpu / Vulkan)
//     Compute-shader port of the keypoint sort network, validated
//     byte-for-byte against the reference programs.
//
// The fragment-program model:
//
//   Kernel::outputs(w, h, targets) ─► Kernel::call(gpu, args)
//       for each output pixel: out[x, y] = program.main(fragment)
//
// A kernel only ever sees its bound uniforms and input textures, so a
// program written for this device ports directly to a shader.

pub mod config;
pub mod context;
pub mod kernel;
pub mod native;
pub mod pool;
pub mod program;
pub mod programs;
pub mod reader;
pub mod texture;

pub use config::{DeviceProfile, GpuConfig};
pub use context::GpuContext;
pub use kernel::{Arg, Kernel};
pub use program::{Fragment, Mat3, Param, ParamKind, Program};
pub use reader::{Fence, Readback};
pub use texture::{MipLevel, Texture, TextureHandle};
