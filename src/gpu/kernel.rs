// gpu/kernel.rs — Callable wrapper around a fragment program.
//
// Usage, mirroring how nodes drive their kernels every tick:
//
//   let mut k = gpu.kernel("keypoints", "sortMergePermutation")?;
//   k.outputs(w, h, &[tex_a, tex_b])?;          // two targets = ping-pong
//   let out = k.call(gpu, &[Arg::Texture(perm), Arg::Int(block), ...])?;
//
// CALL CONTRACT
// ─────────────
//   1. The device must be alive (else `ContextLost`).
//   2. `args.len()` must equal the declared parameter count.
//   3. Each argument must have the declared kind; float arrays must be at
//      least as long as declared (extra elements are ignored).
//   4. No texture argument may be the current output target. Reading and
//      writing the same texture in one pass is undefined on real GPUs, so
//      it is rejected here; multi-pass kernels use two targets and flip.
//   5. The target is resized to the configured viewport, shaded, and its
//      mip chain is discarded.
//
// `texSize` is not a declared parameter: every fragment receives the
// viewport size in `Fragment::tex_size`.

use tracing::trace;

use crate::error::{PipelineError, Result};
use crate::gpu::context::GpuContext;
use crate::gpu::program::{Fragment, Mat3, ParamKind, Program, Uniform};
use crate::gpu::texture::TextureHandle;

/// A call-site argument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Arg<'a> {
    Int(i32),
    Float(f32),
    Vec2([f32; 2]),
    Mat3(Mat3),
    Texture(TextureHandle),
    FloatArray(&'a [f32]),
}

impl Arg<'_> {
    fn kind_name(&self) -> &'static str {
        match self {
            Arg::Int(_) => "int",
            Arg::Float(_) => "float",
            Arg::Vec2(_) => "vec2",
            Arg::Mat3(_) => "mat3",
            Arg::Texture(_) => "texture",
            Arg::FloatArray(_) => "float array",
        }
    }
}

impl From<TextureHandle> for Arg<'_> {
    fn from(handle: TextureHandle) -> Self {
        Arg::Texture(handle)
    }
}

/// A program bound to one or two output targets.
#[derive(Debug, Clone)]
pub struct Kernel {
    program: Program,
    width: u32,
    height: u32,
    targets: Vec<TextureHandle>,
    current: usize,
}

impl Kernel {
    pub(crate) fn new(program: Program) -> Self {
        Kernel {
            program,
            width: 1,
            height: 1,
            targets: Vec::new(),
            current: 0,
        }
    }

    /// `"group.name"` of the wrapped program.
    pub fn name(&self) -> String {
        self.program.qualified_name()
    }

    /// Every uniform the program declares, arrays expanded element-wise
    /// (`weights[0]`, `weights[1]`, ...).
    pub fn uniform_names(&self) -> Vec<String> {
        self.program.params.iter().flat_map(|p| p.uniform_names()).collect()
    }

    /// Configure the viewport and the output target(s). Two targets enable
    /// ping-pong rendering: consecutive calls alternate between them,
    /// starting with the first.
    ///
    /// # Errors
    /// `IllegalArgument` unless one or two distinct targets are given.
    pub fn outputs(
        &mut self,
        width: u32,
        height: u32,
        targets: &[TextureHandle],
    ) -> Result<&mut Self> {
        let valid = match targets {
            [_] => true,
            [a, b] => a != b && !a.is_surface() && !b.is_surface(),
            _ => false,
        };
        if !valid {
            return Err(PipelineError::IllegalArgument(format!(
                "kernel {} needs one target or two distinct pooled targets, got {targets:?}",
                self.name()
            )));
        }
        self.width = width.max(1);
        self.height = height.max(1);
        if self.targets != targets {
            self.targets = targets.to_vec();
            self.current = 0;
        }
        Ok(self)
    }

    /// Viewport (`texSize`) of the next call.
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// The texture the next call will write.
    pub fn next_target(&self) -> Option<TextureHandle> {
        self.targets.get(self.current).copied()
    }

    /// Run the program over the whole viewport.
    ///
    /// # Errors
    /// See the call contract at the top of this module.
    pub fn call(&mut self, gpu: &mut GpuContext, args: &[Arg<'_>]) -> Result<TextureHandle> {
        if gpu.is_lost() {
            return Err(PipelineError::ContextLost);
        }
        let target = self
            .next_target()
            .ok_or_else(|| PipelineError::NoKernelOutput(self.name()))?;
        self.check_args(gpu, target, args)?;

        gpu.resize(target, self.width, self.height)?;
        let mut out = gpu.texture_mut(target)?.take_pixels();
        {
            let textures = &gpu.textures;
            let uniforms: Vec<Uniform<'_>> = args
                .iter()
                .map(|arg| match *arg {
                    Arg::Int(v) => Uniform::Int(v),
                    Arg::Float(v) => Uniform::Float(v),
                    Arg::Vec2(v) => Uniform::Vec2(v),
                    Arg::Mat3(m) => Uniform::Mat3(m),
                    Arg::Texture(h) => Uniform::Texture(&textures[h.0 as usize]),
                    Arg::FloatArray(a) => Uniform::FloatArray(a),
                })
                .collect();
            shade(self.program, self.width, self.height, &uniforms, &mut out);
        }
        let texture = gpu.texture_mut(target)?;
        texture.put_pixels(out);
        texture.discard_mipmaps();

        trace!(kernel = %self.name(), ?target, width = self.width, height = self.height, "kernel call");
        if self.targets.len() == 2 {
            self.current ^= 1;
        }
        Ok(target)
    }

    fn check_args(&self, gpu: &GpuContext, target: TextureHandle, args: &[Arg<'_>]) -> Result<()> {
        let params = self.program.params;
        if args.len() != params.len() {
            return Err(PipelineError::KernelArity {
                kernel: self.name(),
                expected: params.len(),
                got: args.len(),
            });
        }
        for (param, arg) in params.iter().zip(args) {
            let mismatch = |reason: String| PipelineError::KernelArgument {
                kernel: self.name(),
                param: param.name.to_string(),
                reason,
            };
            match (param.kind, arg) {
                (ParamKind::Int, Arg::Int(_))
                | (ParamKind::Float, Arg::Float(_))
                | (ParamKind::Vec2, Arg::Vec2(_))
                | (ParamKind::Mat3, Arg::Mat3(_)) => {}
                (ParamKind::Texture, Arg::Texture(h)) => {
                    if *h == target {
                        return Err(PipelineError::KernelFeedback(self.name()));
                    }
                    gpu.texture(*h)?;
                }
                (ParamKind::FloatArray(n), Arg::FloatArray(values)) => {
                    if values.len() < n {
                        return Err(mismatch(format!(
                            "array of length {} is shorter than the declared {n}",
                            values.len()
                        )));
                    }
                }
                (kind, arg) => {
                    return Err(mismatch(format!(
                        "expected {}, got {}",
                        kind.describe(),
                        arg.kind_name()
                    )));
                }
            }
        }
        Ok(())
    }
}

fn shade(program: Program, width: u32, height: u32, uniforms: &[Uniform<'_>], out: &mut [u8]) {
    let mut frag = Fragment {
        x: 0,
        y: 0,
        tex_size: (width, height),
        uniforms,
    };
    for (i, px) in out.chunks_exact_mut(4).enumerate() {
        frag.x = i as u32 % width;
        frag.y = i as u32 / width;
        px.copy_from_slice(&(program.main)(&frag));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::config::GpuConfig;
    use crate::gpu::program::Param;

    const FILL_PARAMS: &[Param] = &[Param::int("value")];

    fn fill(frag: &Fragment<'_>) -> [u8; 4] {
        [frag.int(0) as u8; 4]
    }

    const INC_PARAMS: &[Param] = &[Param::texture("image")];

    fn increment(frag: &Fragment<'_>) -> [u8; 4] {
        frag.texel_here(0).map(|c| c.wrapping_add(1))
    }

    fn context() -> GpuContext {
        let mut gpu = GpuContext::new(GpuConfig::default().with_pool_capacity(8));
        gpu.register_program(Program { group: "test", name: "fill", params: FILL_PARAMS, main: fill });
        gpu.register_program(Program {
            group: "test",
            name: "increment",
            params: INC_PARAMS,
            main: increment,
        });
        gpu
    }

    #[test]
    fn call_shades_every_pixel() {
        let mut gpu = context();
        let t = gpu.allocate().unwrap();
        let mut k = gpu.kernel("test", "fill").unwrap();
        let out = k.outputs(3, 2, &[t]).unwrap().call(&mut gpu, &[Arg::Int(42)]).unwrap();
        assert_eq!(out, t);
        let bmp = gpu.read_pixels(t).unwrap();
        assert_eq!((bmp.width(), bmp.height()), (3, 2));
        assert!(bmp.as_bytes().iter().all(|&b| b == 42));
    }

    #[test]
    fn wrong_arity_and_kind_are_rejected() {
        let mut gpu = context();
        let t = gpu.allocate().unwrap();
        let mut k = gpu.kernel("test", "fill").unwrap();
        k.outputs(1, 1, &[t]).unwrap();
        assert!(matches!(
            k.call(&mut gpu, &[]),
            Err(PipelineError::KernelArity { expected: 1, got: 0, .. })
        ));
        assert!(matches!(
            k.call(&mut gpu, &[Arg::Float(1.0)]),
            Err(PipelineError::KernelArgument { .. })
        ));
    }

    #[test]
    fn feedback_loop_is_rejected() {
        let mut gpu = context();
        let t = gpu.allocate().unwrap();
        let mut k = gpu.kernel("test", "increment").unwrap();
        k.outputs(1, 1, &[t]).unwrap();
        assert!(matches!(
            k.call(&mut gpu, &[Arg::Texture(t)]),
            Err(PipelineError::KernelFeedback(_))
        ));
    }

    #[test]
    fn ping_pong_alternates_targets() {
        let mut gpu = context();
        let a = gpu.allocate().unwrap();
        let b = gpu.allocate().unwrap();
        let seed = gpu.allocate().unwrap();
        let mut k = gpu.kernel("test", "increment").unwrap();
        k.outputs(2, 2, &[a, b]).unwrap();

        let mut src = seed;
        let mut written = Vec::new();
        for _ in 0..4 {
            src = k.call(&mut gpu, &[Arg::Texture(src)]).unwrap();
            written.push(src);
        }
        assert_eq!(written, vec![a, b, a, b]);
        assert_eq!(gpu.texture(b).unwrap().texel(1, 1), [4; 4]);
    }

    #[test]
    fn call_discards_target_mipmaps() {
        let mut gpu = context();
        let t = gpu.allocate().unwrap();
        gpu.set_mipmaps(t, vec![crate::gpu::texture::MipLevel { width: 1, height: 1, pixels: vec![0; 4] }])
            .unwrap();
        let mut k = gpu.kernel("test", "fill").unwrap();
        k.outputs(2, 2, &[t]).unwrap().call(&mut gpu, &[Arg::Int(1)]).unwrap();
        assert!(!gpu.has_mipmaps(t).unwrap());
    }

    #[test]
    fn call_without_outputs_fails() {
        let mut gpu = context();
        let mut k = gpu.kernel("test", "fill").unwrap();
        assert!(matches!(k.call(&mut gpu, &[Arg::Int(0)]), Err(PipelineError::NoKernelOutput(_))));
    }
}
