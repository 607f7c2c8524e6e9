// gpu/context.rs — The reference device.
//
// `GpuContext` owns everything device-bound:
//
//   textures   arena indexed by handle id (0 = visible surface, 1.. = pool)
//   pool       free-list deciding which pooled handles are checked out
//   programs   program center resolving "group.name" to fragment programs
//   state      loss flag shared with outstanding readback fences
//
// CONTEXT LOSS
// ────────────
// `lose_context()` simulates the WebGL "context lost" event. From then on,
// allocation, uploads and kernel calls fail with `ContextLost` (a device
// error), and every outstanding fence resolves to `ContextLost`.
// `restore()` rebuilds a fresh device: new textures, a full pool and a new
// generation number. Handles from the previous generation are meaningless
// afterwards; the pipeline re-runs every node's `init` to obtain new ones.
//
// NEW RUST CONCEPTS:
// - `Rc<Cell<bool>>` — a shared, single-threaded flag. Fences keep a clone so
//   they can observe a loss that happens after they were issued, without
//   borrowing the context.

use std::cell::Cell;
use std::rc::Rc;

use tracing::{debug, trace, warn};

use crate::error::{PipelineError, Result};
use crate::gpu::config::GpuConfig;
use crate::gpu::kernel::Kernel;
use crate::gpu::pool::TexturePool;
use crate::gpu::program::Program;
use crate::gpu::programs::ProgramCenter;
use crate::gpu::reader::Readback;
use crate::gpu::texture::{MipLevel, Texture, TextureHandle};
use crate::media::Bitmap;

/// Loss flag of one device generation.
#[derive(Debug, Default)]
pub(crate) struct DeviceState {
    lost: Cell<bool>,
}

impl DeviceState {
    pub(crate) fn is_lost(&self) -> bool {
        self.lost.get()
    }
}

/// A reference GPU device.
pub struct GpuContext {
    config: GpuConfig,
    pub(crate) textures: Vec<Texture>,
    pool: TexturePool,
    programs: ProgramCenter,
    state: Rc<DeviceState>,
    generation: u64,
}

impl GpuContext {
    /// Create a device with the built-in program groups registered.
    ///
    /// # Panics
    /// Panics if `config.pool_capacity == 0`.
    pub fn new(config: GpuConfig) -> Self {
        debug!(
            profile = %config.profile,
            pool = config.pool_capacity,
            max_texture_length = config.max_texture_length,
            "creating reference GPU context"
        );
        let pool = TexturePool::new(config.pool_capacity);
        let textures = (0..=config.pool_capacity).map(|_| Texture::new(1, 1)).collect();
        GpuContext {
            config,
            textures,
            pool,
            programs: ProgramCenter::standard(),
            state: Rc::new(DeviceState::default()),
            generation: 0,
        }
    }

    pub fn config(&self) -> &GpuConfig {
        &self.config
    }

    /// Incremented by every `restore()`.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_lost(&self) -> bool {
        self.state.is_lost()
    }

    pub(crate) fn state(&self) -> Rc<DeviceState> {
        Rc::clone(&self.state)
    }

    // -----------------------------------------------------------------------
    // Context loss
    // -----------------------------------------------------------------------

    /// Simulate losing the device.
    pub fn lose_context(&mut self) {
        if !self.state.is_lost() {
            warn!(generation = self.generation, "GPU context lost");
            self.state.lost.set(true);
        }
    }

    /// Rebuild the device. Every texture handle of the previous generation
    /// becomes invalid; registered programs survive.
    pub fn restore(&mut self) {
        self.state.lost.set(true);
        self.state = Rc::new(DeviceState::default());
        self.generation += 1;
        self.pool = TexturePool::new(self.config.pool_capacity);
        self.textures = (0..=self.config.pool_capacity).map(|_| Texture::new(1, 1)).collect();
        warn!(generation = self.generation, "GPU context restored");
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.state.is_lost() {
            Err(PipelineError::ContextLost)
        } else {
            Ok(())
        }
    }

    // -----------------------------------------------------------------------
    // Pool
    // -----------------------------------------------------------------------

    /// Check a 1×1 transparent black texture out of the pool.
    ///
    /// # Errors
    /// `ContextLost` if the device is lost, `OutOfMemory` if the pool is
    /// exhausted.
    pub fn allocate(&mut self) -> Result<TextureHandle> {
        self.ensure_alive()?;
        let handle = self.pool.acquire()?;
        let texture = &mut self.textures[handle.0 as usize];
        texture.resize(1, 1);
        texture.clear([0; 4]);
        trace!(?handle, available = self.pool.available(), "texture allocated");
        Ok(handle)
    }

    /// Return a texture to the pool. The storage is kept for reuse.
    ///
    /// # Errors
    /// `DoubleFree` if the handle is not checked out.
    pub fn free(&mut self, handle: TextureHandle) -> Result<()> {
        self.pool.free(handle)?;
        trace!(?handle, available = self.pool.available(), "texture freed");
        Ok(())
    }

    pub fn pool(&self) -> &TexturePool {
        &self.pool
    }

    // -----------------------------------------------------------------------
    // Texture access
    // -----------------------------------------------------------------------

    /// The surface, or a texture checked out of the pool.
    pub fn texture(&self, handle: TextureHandle) -> Result<&Texture> {
        self.validate(handle)?;
        Ok(&self.textures[handle.0 as usize])
    }

    pub(crate) fn texture_mut(&mut self, handle: TextureHandle) -> Result<&mut Texture> {
        self.validate(handle)?;
        Ok(&mut self.textures[handle.0 as usize])
    }

    fn validate(&self, handle: TextureHandle) -> Result<()> {
        if handle.is_surface() || self.pool.is_allocated(handle) {
            Ok(())
        } else {
            Err(PipelineError::InvalidTexture(handle.0))
        }
    }

    /// Width and height of a texture.
    pub fn size(&self, handle: TextureHandle) -> Result<(u32, u32)> {
        let t = self.texture(handle)?;
        Ok((t.width(), t.height()))
    }

    pub fn has_mipmaps(&self, handle: TextureHandle) -> Result<bool> {
        Ok(self.texture(handle)?.has_mipmaps())
    }

    /// Resize a texture, keeping its handle. Contents become undefined
    /// unless the size is unchanged.
    ///
    /// # Errors
    /// `TextureTooLarge` if either side exceeds the device limit or is zero.
    pub fn resize(&mut self, handle: TextureHandle, width: u32, height: u32) -> Result<()> {
        self.ensure_alive()?;
        let max = self.config.max_texture_length;
        if width == 0 || height == 0 || width > max || height > max {
            return Err(PipelineError::TextureTooLarge { width, height, max });
        }
        self.texture_mut(handle)?.resize(width, height);
        Ok(())
    }

    /// Fill a texture with a colour.
    pub fn clear(&mut self, handle: TextureHandle, rgba: [u8; 4]) -> Result<()> {
        self.ensure_alive()?;
        self.texture_mut(handle)?.clear(rgba);
        Ok(())
    }

    /// Upload a host bitmap, resizing the texture to fit.
    pub fn upload(&mut self, handle: TextureHandle, bitmap: &Bitmap) -> Result<()> {
        self.upload_bytes(handle, bitmap.width(), bitmap.height(), bitmap.as_bytes())
    }

    /// Upload raw RGBA8 bytes, resizing the texture to `width`×`height`.
    ///
    /// # Errors
    /// `IllegalArgument` if `bytes` does not hold exactly `width * height`
    /// pixels.
    pub fn upload_bytes(
        &mut self,
        handle: TextureHandle,
        width: u32,
        height: u32,
        bytes: &[u8],
    ) -> Result<()> {
        let expected = width as usize * height as usize * 4;
        if bytes.len() != expected {
            return Err(PipelineError::IllegalArgument(format!(
                "upload of {} bytes into a {width}×{height} texture (expected {expected})",
                bytes.len()
            )));
        }
        self.resize(handle, width, height)?;
        let texture = self.texture_mut(handle)?;
        texture.pixels_mut().copy_from_slice(bytes);
        texture.discard_mipmaps();
        Ok(())
    }

    /// Copy `src` into `dst` (size, pixels and mip chain).
    pub fn copy(&mut self, src: TextureHandle, dst: TextureHandle) -> Result<()> {
        self.ensure_alive()?;
        if src == dst {
            return Ok(());
        }
        let copy = self.texture(src)?.clone();
        self.validate(dst)?;
        self.textures[dst.0 as usize] = copy;
        Ok(())
    }

    /// Attach a mip chain (levels 1..) to a texture.
    pub fn set_mipmaps(&mut self, handle: TextureHandle, levels: Vec<MipLevel>) -> Result<()> {
        self.ensure_alive()?;
        self.texture_mut(handle)?.set_mipmaps(levels);
        Ok(())
    }

    /// Synchronous readback of a whole texture.
    pub fn read_pixels(&self, handle: TextureHandle) -> Result<Bitmap> {
        self.ensure_alive()?;
        let t = self.texture(handle)?;
        Ok(Bitmap::from_rgba(t.width(), t.height(), t.pixels().to_vec()))
    }

    /// Issue an asynchronous readback. The pixels are captured now; the
    /// returned future resolves once the device's completion fence signals.
    pub fn read_pixels_async(&self, handle: TextureHandle) -> Result<Readback> {
        let snapshot = self.read_pixels(handle)?;
        Ok(Readback::new(snapshot, self.state(), self.config.readback_latency))
    }

    // -----------------------------------------------------------------------
    // Programs
    // -----------------------------------------------------------------------

    /// Look up `group.name` and wrap it in a kernel with no outputs yet.
    ///
    /// # Errors
    /// `UnknownProgram` if nothing is registered under that name.
    pub fn kernel(&self, group: &str, name: &str) -> Result<Kernel> {
        Ok(Kernel::new(self.programs.get(group, name)?))
    }

    /// Register an extra program. Replaces an existing program of the same
    /// qualified name.
    pub fn register_program(&mut self, program: Program) {
        self.programs.register(program);
    }

    pub fn programs(&self) -> &ProgramCenter {
        &self.programs
    }
}

impl Default for GpuContext {
    fn default() -> Self {
        Self::new(GpuConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> GpuContext {
        GpuContext::new(GpuConfig::default().with_pool_capacity(4))
    }

    #[test]
    fn allocate_gives_blank_unit_texture() {
        let mut gpu = small();
        let h = gpu.allocate().unwrap();
        gpu.resize(h, 8, 8).unwrap();
        gpu.clear(h, [7; 4]).unwrap();
        gpu.free(h).unwrap();
        let h2 = gpu.allocate().unwrap();
        assert_eq!(h, h2);
        assert_eq!(gpu.size(h2).unwrap(), (1, 1));
        assert_eq!(gpu.texture(h2).unwrap().texel(0, 0), [0; 4]);
    }

    #[test]
    fn freed_texture_is_inaccessible() {
        let mut gpu = small();
        let h = gpu.allocate().unwrap();
        gpu.free(h).unwrap();
        assert!(matches!(gpu.texture(h), Err(PipelineError::InvalidTexture(_))));
        assert!(matches!(gpu.free(h), Err(PipelineError::DoubleFree(_))));
    }

    #[test]
    fn resize_enforces_device_limit() {
        let mut gpu = small();
        let h = gpu.allocate().unwrap();
        let max = gpu.config().max_texture_length;
        assert!(matches!(
            gpu.resize(h, max + 1, 1),
            Err(PipelineError::TextureTooLarge { .. })
        ));
        assert!(gpu.resize(h, max, 1).is_ok());
    }

    #[test]
    fn upload_checks_length_and_resizes() {
        let mut gpu = small();
        let h = gpu.allocate().unwrap();
        assert!(gpu.upload_bytes(h, 2, 2, &[0; 15]).is_err());
        let bmp = Bitmap::filled(3, 2, [1, 2, 3, 4]);
        gpu.upload(h, &bmp).unwrap();
        assert_eq!(gpu.read_pixels(h).unwrap(), bmp);
    }

    #[test]
    fn lost_context_refuses_work_until_restored() {
        let mut gpu = small();
        let h = gpu.allocate().unwrap();
        gpu.lose_context();
        assert!(gpu.is_lost());
        assert!(matches!(gpu.allocate(), Err(PipelineError::ContextLost)));
        assert!(matches!(gpu.clear(h, [0; 4]), Err(PipelineError::ContextLost)));

        gpu.restore();
        assert!(!gpu.is_lost());
        assert_eq!(gpu.generation(), 1);
        assert_eq!(gpu.pool().available(), 4);
        assert!(gpu.allocate().is_ok());
    }

    #[test]
    fn copy_duplicates_mip_chain() {
        let mut gpu = small();
        let a = gpu.allocate().unwrap();
        let b = gpu.allocate().unwrap();
        gpu.upload(a, &Bitmap::filled(2, 2, [9; 4])).unwrap();
        gpu.set_mipmaps(a, vec![MipLevel { width: 1, height: 1, pixels: vec![9; 4] }])
            .unwrap();
        gpu.copy(a, b).unwrap();
        assert_eq!(gpu.size(b).unwrap(), (2, 2));
        assert!(gpu.has_mipmaps(b).unwrap());
    }
}
