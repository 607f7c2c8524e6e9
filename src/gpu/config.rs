// gpu/config.rs — Device profiles and reference-device configuration.
//
// A `DeviceProfile` names a class of hardware. Both devices read it:
//
//   - the reference device (`GpuContext`) derives its pool size and maximum
//     texture dimension from it, so a pipeline that would exhaust a small
//     device fails the same way on a development machine;
//   - the native device (`gpu::native::NativeDevice`) caps wgpu limits and
//     picks workgroup sizes from it.
//
// `LowPower` mirrors what a Raspberry Pi class GPU gives a WebGL2 context:
// 2048 px textures and a modest number of live render targets.

use std::fmt;

/// Hardware profile controlling device limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceProfile {
    /// Desktop-class limits. No artificial caps on the native device.
    #[default]
    Native,
    /// Embedded GPU limits (Raspberry Pi 4/5, V3DV driver).
    LowPower,
}

impl fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceProfile::Native => write!(f, "Native"),
            DeviceProfile::LowPower => write!(f, "LowPower (simulated limits)"),
        }
    }
}

/// Configuration of the reference device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuConfig {
    pub profile: DeviceProfile,
    /// Number of pooled render targets.
    pub pool_capacity: usize,
    /// Largest allowed texture width or height.
    pub max_texture_length: u32,
    /// How many times a readback fence is polled before it signals.
    /// 0 = readbacks complete on the first poll.
    pub readback_latency: u32,
}

impl GpuConfig {
    pub fn for_profile(profile: DeviceProfile) -> Self {
        match profile {
            DeviceProfile::Native => GpuConfig {
                profile,
                pool_capacity: 64,
                max_texture_length: 4096,
                readback_latency: 1,
            },
            DeviceProfile::LowPower => GpuConfig {
                profile,
                pool_capacity: 32,
                max_texture_length: 2048,
                readback_latency: 2,
            },
        }
    }

    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }

    pub fn with_readback_latency(mut self, polls: u32) -> Self {
        self.readback_latency = polls;
        self
    }
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self::for_profile(DeviceProfile::Native)
    }
}
