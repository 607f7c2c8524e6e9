// gpu/native/sort.rs — Keypoint sort network as wgpu compute passes.
//
// Same three stages as keypoint/sorter.rs, over storage buffers instead of
// textures:
//
//   encoded ──create──► perm A ──merge──► perm B ⇄ perm C ──apply──► output
//
// All passes are recorded into one command encoder; the output is read
// back once at the end. Each buffer holds one u32 per RGBA8 texel, in the
// raster order of the texture it stands for, so the bytes read back are
// directly an encoded keypoint texture.
//
// BIND GROUP LAYOUT (shared by the three entry points):
//   0  src       storage, read        permutation (encoded for `create`)
//   1  encoded   storage, read        encoded keypoints
//   2  dst       storage, read_write  pass output
//   3  params    uniform              SortParams

use bytemuck::{Pod, Zeroable};
use tracing::trace;
use wgpu::util::DeviceExt;

use crate::gpu::native::device::{GpuError, NativeDevice};
use crate::keypoint::codec::{encoder_capacity, pixels_per_keypoint};
use crate::keypoint::sorter::{merge_passes, permutation_size};

/// Uniforms of every sort pass. Mirrors `SortParams` in keypoint_sort.wgsl.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct SortParams {
    pixels_per_keypoint: u32,
    capacity: u32,
    n: u32,
    block_size: u32,
    max_rounds: u32,
    max_keypoints: u32,
    out_len: u32,
    _pad: u32,
}

/// Compiled pipelines of the sort network.
pub struct NativeSorter {
    create: wgpu::ComputePipeline,
    merge: wgpu::ComputePipeline,
    apply: wgpu::ComputePipeline,
    bgl: wgpu::BindGroupLayout,
}

impl NativeSorter {
    pub fn new(gpu: &NativeDevice) -> Self {
        // {{WG_SIZE}} is a placeholder token in the WGSL file.
        let shader_src = include_str!("../../shaders/keypoint_sort.wgsl")
            .replace("{{WG_SIZE}}", &gpu.workgroup_size.total().to_string());

        let shader = gpu.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("keypoint_sort.wgsl"),
            source: wgpu::ShaderSource::Wgsl(shader_src.into()),
        });

        let storage = |binding: u32, read_only: bool| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };

        let bgl = gpu.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("NativeSorter BGL"),
            entries: &[
                storage(0, true),
                storage(1, true),
                storage(2, false),
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let layout = gpu.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("NativeSorter pipeline layout"),
            bind_group_layouts: &[&bgl],
            push_constant_ranges: &[],
        });

        let pipeline = |entry_point: &'static str| {
            gpu.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(entry_point),
                layout: Some(&layout),
                module: &shader,
                entry_point,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            })
        };

        NativeSorter {
            create: pipeline("create"),
            merge: pipeline("merge"),
            apply: pipeline("apply"),
            bgl,
        }
    }

    /// Sort an encoded keypoint texture (raw RGBA8 bytes, `encoder_length`²
    /// texels) by descending score. Returns the best `max_keypoints` records
    /// as a fresh encoding of side `output_length`, null-padded.
    ///
    /// # Errors
    /// `InvalidInput` if `encoded` does not hold `encoder_length`² texels;
    /// `BufferMap` / `ReadbackLost` if the readback fails.
    pub fn sort(
        &self,
        gpu: &NativeDevice,
        encoded: &[u8],
        descriptor_size: usize,
        extra_size: usize,
        encoder_length: u32,
        max_keypoints: usize,
        output_length: u32,
    ) -> Result<Vec<u8>, GpuError> {
        let texels = encoder_length as usize * encoder_length as usize;
        if encoded.len() != texels * 4 || texels == 0 {
            return Err(GpuError::InvalidInput(format!(
                "{} bytes is not a {encoder_length}×{encoder_length} encoding",
                encoded.len()
            )));
        }

        let capacity = encoder_capacity(descriptor_size, extra_size, encoder_length);
        let (w, h) = permutation_size(capacity);
        let n = w * h;
        let out_len = output_length.max(1) * output_length.max(1);
        let passes = merge_passes(n as usize);
        let base = SortParams {
            pixels_per_keypoint: pixels_per_keypoint(descriptor_size, extra_size) as u32,
            capacity: capacity as u32,
            n,
            block_size: 2,
            max_rounds: 1,
            max_keypoints: max_keypoints.min(u32::MAX as usize) as u32,
            out_len,
            _pad: 0,
        };

        let device = &gpu.device;
        let input = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("NativeSorter::encoded"),
            contents: encoded,
            usage: wgpu::BufferUsages::STORAGE,
        });
        let perm_size = n as u64 * 4;
        let perms: Vec<wgpu::Buffer> = (0..3)
            .map(|_| {
                device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("NativeSorter::permutation"),
                    size: perm_size,
                    usage: wgpu::BufferUsages::STORAGE,
                    mapped_at_creation: false,
                })
            })
            .collect();
        let out_size = out_len as u64 * 4;
        let output = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("NativeSorter::output"),
            size: out_size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let readback = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("NativeSorter::readback"),
            size: out_size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("NativeSorter::sort"),
        });

        self.dispatch(gpu, &mut encoder, &self.create, base, &input, &input, &perms[0], n);

        // merge passes ping-pong between perms[1] and perms[2]
        let mut current = 0;
        for i in 1..=passes {
            let params = SortParams { block_size: 1 << i, max_rounds: 2 * i, ..base };
            let next = if current == 1 { 2 } else { 1 };
            self.dispatch(gpu, &mut encoder, &self.merge, params, &perms[current], &input, &perms[next], n);
            current = next;
        }

        self.dispatch(gpu, &mut encoder, &self.apply, base, &perms[current], &input, &output, out_len);
        encoder.copy_buffer_to_buffer(&output, 0, &readback, 0, out_size);
        gpu.queue.submit(std::iter::once(encoder.finish()));

        let slice = readback.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            // the receiver outlives the poll below
            let _ = tx.send(r);
        });
        gpu.device.poll(wgpu::Maintain::Wait);
        rx.recv().map_err(|_| GpuError::ReadbackLost)??;

        let bytes = slice.get_mapped_range().to_vec();
        readback.unmap();
        trace!(slots = n, passes, max_keypoints, output_length, "native keypoint sort");
        Ok(bytes)
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch(
        &self,
        gpu: &NativeDevice,
        encoder: &mut wgpu::CommandEncoder,
        pipeline: &wgpu::ComputePipeline,
        params: SortParams,
        src: &wgpu::Buffer,
        encoded: &wgpu::Buffer,
        dst: &wgpu::Buffer,
        invocations: u32,
    ) {
        let params_buf = gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("SortParams"),
            contents: bytemuck::bytes_of(&params),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let bind_group = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("NativeSorter bind group"),
            layout: &self.bgl,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: src.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 1, resource: encoded.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 2, resource: dst.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 3, resource: params_buf.as_entire_binding() },
            ],
        });

        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("NativeSorter pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(gpu.dispatch_linear(invocations), 1, 1);
    }
}
