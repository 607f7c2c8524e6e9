// gpu/native/mod.rs — Native compute port of the keypoint kernels (wgpu).
//
// The reference device runs fragment programs on the host. This module
// runs the sort network of keypoint/sorter.rs as WGSL compute shaders on a
// Vulkan device, over the same texel layout, and must produce the same
// bytes.

pub mod device;
pub mod sort;

pub use device::{AdapterInfo, GpuError, NativeDevice, WorkgroupSize};
pub use sort::NativeSorter;

/// Spawn a child `cargo test` running one named test with `--nocapture`
/// and return its combined stdout and stderr.
///
/// The exit status is ignored: dzn segfaults on exit even when every
/// assertion passed. Inner tests print "GPU_TEST_OK" instead.
#[cfg(test)]
pub(crate) fn run_gpu_test_in_subprocess(test_name: &str) -> String {
    let output = std::process::Command::new("cargo")
        .args(["test", "--lib", "--", test_name, "--exact", "--ignored", "--nocapture"])
        .output()
        .unwrap_or_else(|e| panic!("failed to spawn subprocess for {test_name}: {e}"));

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    print!("{stdout}");
    eprint!("{stderr}");
    stdout + &stderr
}
