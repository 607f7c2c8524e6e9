// gpu/native/device.rs — wgpu device for the native kernels.
//
// Responsibilities:
//   - Enumerate Vulkan adapters and pick a hardware one when there is one.
//   - Cap wgpu limits according to the `DeviceProfile`, so that a kernel
//     that would not fit a low-power GPU is rejected on the development
//     machine too.
//   - Provide the `WorkgroupSize` every native compute pipeline is built
//     with.
//
// ADAPTER SELECTION:
// wgpu's `request_adapter` heuristics may grab llvmpipe on WSL2. Adapters
// are enumerated explicitly, hardware first, software as a last resort.
//
// DEVICE LIMITS:
// Under `LowPower`, lower limits than the hardware supports are requested.
// wgpu validates every dispatch against the requested limits, so
// violations surface at dev time. It does not make the GPU slower.
//
// NEW RUST CONCEPTS:
// - `pollster::block_on` — runs an async fn to completion on the current
//   thread. wgpu's adapter/device API is async for WebGPU's sake.
// - `#[error(...)]` from thiserror — derives `Display` and `Error` for the
//   error enum from format strings on each variant.

use std::fmt;

use thiserror::Error;
use tracing::{debug, info};

use crate::gpu::config::{DeviceProfile, GpuConfig};

/// Workgroup shape of the native compute pipelines.
///
/// The keypoint kernels are one-dimensional: they run `total()`
/// invocations per workgroup along x.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkgroupSize {
    pub x: u32,
    pub y: u32,
}

impl WorkgroupSize {
    /// Total invocations per workgroup (x * y).
    pub fn total(&self) -> u32 {
        self.x * self.y
    }

    /// - `Native`: 16×8 = 128 invocations, 4 NVIDIA warps or 2 AMD waves.
    /// - `LowPower`: 8×8 = 64 invocations, well inside V3DV's 256 limit.
    pub fn for_profile(profile: DeviceProfile) -> Self {
        match profile {
            DeviceProfile::Native => WorkgroupSize { x: 16, y: 8 },
            DeviceProfile::LowPower => WorkgroupSize { x: 8, y: 8 },
        }
    }
}

impl fmt::Display for WorkgroupSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}×{} ({} invocations)", self.x, self.y, self.total())
    }
}

/// Adapter information kept for logging.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub name: String,
    pub vendor: u32,
    pub device: u32,
    pub device_type: wgpu::DeviceType,
    pub backend: wgpu::Backend,
}

impl fmt::Display for AdapterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}, {:?})", self.name, self.backend, self.device_type)
    }
}

/// Errors of the native device.
#[derive(Debug, Error)]
pub enum GpuError {
    /// No Vulkan adapter at all. On WSL2, check that `vulkaninfo` lists one.
    #[error("no suitable Vulkan adapter found")]
    NoSuitableAdapter,
    #[error("device request failed: {0}")]
    DeviceRequest(#[from] wgpu::RequestDeviceError),
    #[error("workgroup size {total} exceeds profile limit of {max} invocations")]
    WorkgroupTooLarge { total: u32, max: u32 },
    #[error("buffer mapping failed: {0}")]
    BufferMap(#[from] wgpu::BufferAsyncError),
    /// The map callback was dropped without being called.
    #[error("readback callback never fired")]
    ReadbackLost,
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Adapter, device, queue and active profile.
///
/// Expensive to create. Hold one for the lifetime of the application.
///
/// # Field drop order
/// `_instance` is declared last so the `wgpu::Instance` outlives `device`
/// and `queue`. dzn (D3D12-to-Vulkan on WSL2) crashes when the instance is
/// destroyed first.
pub struct NativeDevice {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub profile: DeviceProfile,
    pub adapter_info: AdapterInfo,
    pub workgroup_size: WorkgroupSize,
    _instance: wgpu::Instance,
}

impl NativeDevice {
    /// First hardware Vulkan adapter, `DeviceProfile::Native` limits.
    ///
    /// # Errors
    /// Returns `Err` if no adapter is found or the device request fails.
    pub fn new() -> Result<Self, GpuError> {
        Self::new_with_profile(DeviceProfile::Native)
    }

    pub fn new_with_profile(profile: DeviceProfile) -> Result<Self, GpuError> {
        pollster::block_on(Self::init_async(profile))
    }

    async fn init_async(profile: DeviceProfile) -> Result<Self, GpuError> {
        // dzn declares itself non-conformant; without this flag wgpu hides it
        // and only llvmpipe is left on WSL2. The kernels are compute only.
        let flags = if cfg!(debug_assertions) {
            wgpu::InstanceFlags::VALIDATION | wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        } else {
            wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        };

        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::VULKAN,
            flags,
            ..Default::default()
        });

        let adapters = instance.enumerate_adapters(wgpu::Backends::VULKAN);
        for a in &adapters {
            let info = a.get_info();
            debug!(name = %info.name, backend = ?info.backend, device_type = ?info.device_type, "Vulkan adapter");
        }

        // Hardware (or dzn, which reports Other) first; software last.
        let mut adapters = adapters;
        let hardware = adapters.iter().position(|a| {
            !matches!(a.get_info().device_type, wgpu::DeviceType::Cpu)
        });
        let adapter = match hardware {
            Some(i) => adapters.swap_remove(i),
            None => adapters.into_iter().next().ok_or(GpuError::NoSuitableAdapter)?,
        };

        let raw_info = adapter.get_info();
        let adapter_info = AdapterInfo {
            name: raw_info.name.clone(),
            vendor: raw_info.vendor,
            device: raw_info.device,
            device_type: raw_info.device_type,
            backend: raw_info.backend,
        };

        let profile = match profile {
            DeviceProfile::Native if raw_info.name.to_ascii_lowercase().contains("v3d") => {
                info!("V3D adapter detected, using LowPower profile");
                DeviceProfile::LowPower
            }
            other => other,
        };

        let (device, queue): (wgpu::Device, wgpu::Queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("rudolf-flow"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits_for_profile(profile),
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .await?;

        let workgroup_size = WorkgroupSize::for_profile(profile);
        info!(adapter = %adapter_info, %profile, workgroup = %workgroup_size, "native device ready");

        Ok(NativeDevice {
            device,
            queue,
            profile,
            adapter_info,
            workgroup_size,
            _instance: instance,
        })
    }

    /// Override the default workgroup size.
    ///
    /// # Errors
    /// `WorkgroupTooLarge` if x * y exceeds the profile's
    /// `max_compute_invocations_per_workgroup`.
    pub fn set_workgroup_size(&mut self, x: u32, y: u32) -> Result<(), GpuError> {
        self.workgroup_size = validate_workgroup_size(self.profile, x, y)?;
        Ok(())
    }

    /// Workgroups needed to cover `count` invocations along x.
    pub fn dispatch_linear(&self, count: u32) -> u32 {
        dispatch_linear(self.workgroup_size, count)
    }
}

impl fmt::Display for NativeDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "NativeDevice {{ adapter: {}, profile: {}, workgroup: {} }}",
            self.adapter_info, self.profile, self.workgroup_size
        )
    }
}

// ============================================================
// Limits helpers
// ============================================================

fn limits_for_profile(profile: DeviceProfile) -> wgpu::Limits {
    match profile {
        DeviceProfile::Native => wgpu::Limits::default(),
        DeviceProfile::LowPower => wgpu::Limits {
            // V3DV reports 256 invocations and 256 per dimension.
            max_compute_invocations_per_workgroup: 256,
            max_compute_workgroup_size_x: 256,
            max_compute_workgroup_size_y: 256,
            max_compute_workgroup_size_z: 64,
            max_texture_dimension_2d: GpuConfig::for_profile(profile).max_texture_length,
            max_storage_buffer_binding_size: 128 << 20,
            ..wgpu::Limits::default()
        },
    }
}

fn max_invocations_for_profile(profile: DeviceProfile) -> u32 {
    limits_for_profile(profile).max_compute_invocations_per_workgroup
}

fn validate_workgroup_size(profile: DeviceProfile, x: u32, y: u32) -> Result<WorkgroupSize, GpuError> {
    let total = x.saturating_mul(y);
    let max = max_invocations_for_profile(profile);
    if total == 0 || total > max {
        return Err(GpuError::WorkgroupTooLarge { total, max });
    }
    Ok(WorkgroupSize { x, y })
}

fn dispatch_linear(workgroup_size: WorkgroupSize, count: u32) -> u32 {
    count.div_ceil(workgroup_size.total()).max(1)
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workgroup_size_for_native() {
        let ws = WorkgroupSize::for_profile(DeviceProfile::Native);
        assert_eq!(ws, WorkgroupSize { x: 16, y: 8 });
        assert_eq!(ws.total(), 128);
    }

    #[test]
    fn workgroup_size_for_low_power() {
        let ws = WorkgroupSize::for_profile(DeviceProfile::LowPower);
        assert_eq!(ws.total(), 64);
        assert!(ws.total() <= max_invocations_for_profile(DeviceProfile::LowPower));
    }

    #[test]
    fn linear_dispatch_rounds_up() {
        let ws = WorkgroupSize { x: 8, y: 8 };
        assert_eq!(dispatch_linear(ws, 64), 1);
        assert_eq!(dispatch_linear(ws, 65), 2);
        assert_eq!(dispatch_linear(ws, 1000), 16);
        // an empty dispatch still launches one workgroup; shaders guard the range
        assert_eq!(dispatch_linear(ws, 0), 1);
    }

    #[test]
    fn low_power_limits_are_capped() {
        let limits = limits_for_profile(DeviceProfile::LowPower);
        assert_eq!(limits.max_compute_invocations_per_workgroup, 256);
        assert_eq!(limits.max_texture_dimension_2d, 2048);
        assert_eq!(limits_for_profile(DeviceProfile::Native), wgpu::Limits::default());
    }

    #[test]
    fn workgroup_size_is_validated() {
        assert!(validate_workgroup_size(DeviceProfile::LowPower, 16, 16).is_ok());
        let err = validate_workgroup_size(DeviceProfile::LowPower, 16, 17).unwrap_err();
        assert!(matches!(err, GpuError::WorkgroupTooLarge { total: 272, max: 256 }));
        assert!(validate_workgroup_size(DeviceProfile::Native, 0, 8).is_err());
    }

    // ---- GPU integration tests (subprocess isolation) -------------------------
    //
    // dzn crashes with SIGSEGV during process exit once a Vulkan device has
    // been created. Each GPU test runs in a child process that prints
    // "GPU_TEST_OK" on success; the parent checks the output, not the exit
    // code.

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_native_device_init() {
        let gpu = NativeDevice::new().expect("should initialise a Vulkan device");
        println!("{gpu}");
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_native_device_low_power() {
        let mut gpu = NativeDevice::new_with_profile(DeviceProfile::LowPower).unwrap();
        assert_eq!(gpu.profile, DeviceProfile::LowPower);
        assert_eq!(gpu.workgroup_size, WorkgroupSize { x: 8, y: 8 });
        gpu.set_workgroup_size(16, 16).expect("256 fits the LowPower profile");
        assert!(gpu.set_workgroup_size(16, 17).is_err());
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn native_device_init() {
        let out = crate::gpu::native::run_gpu_test_in_subprocess(
            "gpu::native::device::tests::inner_native_device_init",
        );
        assert!(out.contains("GPU_TEST_OK"), "inner test did not print GPU_TEST_OK:\n{out}");
    }

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn native_device_low_power() {
        let out = crate::gpu::native::run_gpu_test_in_subprocess(
            "gpu::native::device::tests::inner_native_device_low_power",
        );
        assert!(out.contains("GPU_TEST_OK"), "inner test did not print GPU_TEST_OK:\n{out}");
    }
}
