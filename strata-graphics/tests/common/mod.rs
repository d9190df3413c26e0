#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use strata_graphics as gpu;

pub const TRIANGLE: &str = "
    @vertex
    fn vs_main(@builtin(vertex_index) index: u32) -> @builtin(position) vec4<f32> {
        let x = f32(i32(index) - 1);
        return vec4<f32>(x, 0.0, 0.0, 1.0);
    }

    @fragment
    fn fs_main() -> @location(0) vec4<f32> {
        return vec4<f32>(1.0, 0.0, 0.0, 1.0);
    }
";

pub const EMPTY_COMPUTE: &str = "
    @compute @workgroup_size(1)
    fn main() {}
";

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn device() -> gpu::Device {
    device_with(&gpu::DeviceDesc::default())
}

pub fn device_with(desc: &gpu::DeviceDesc) -> gpu::Device {
    init_logging();
    let instance = gpu::Instance::default();
    let adapter = instance
        .enumerate_adapters()
        .into_iter()
        .next()
        .expect("software adapter");
    adapter.create_device(desc).expect("device creation")
}

/// Device with every optional feature enabled.
pub fn full_device() -> gpu::Device {
    device_with(&gpu::DeviceDesc {
        label: "full",
        required_features: gpu::Features::all(),
        ..Default::default()
    })
}

/// Collects every error that no scope captured.
pub fn capture_errors(device: &gpu::Device) -> Arc<Mutex<Vec<gpu::Error>>> {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    device.on_uncaptured_error(move |error| sink.lock().unwrap().push(error.clone()));
    errors
}

pub fn buffer(device: &gpu::Device, size: u64, usage: gpu::BufferUsages) -> gpu::Buffer {
    device.create_buffer(&gpu::BufferDesc {
        label: "test",
        size,
        usage,
        mapped_at_creation: false,
    })
}

pub fn render_texture(device: &gpu::Device, format: gpu::TextureFormat, size: u32) -> gpu::Texture {
    device.create_texture(&gpu::TextureDesc {
        label: "target",
        size: gpu::Extent3d {
            width: size,
            height: size,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: gpu::TextureDimension::D2,
        format,
        usage: gpu::TextureUsages::RENDER_ATTACHMENT | gpu::TextureUsages::COPY_SRC,
        view_formats: &[],
    })
}

pub fn triangle_pipeline(device: &gpu::Device, format: gpu::TextureFormat) -> gpu::RenderPipeline {
    let module = device.create_shader_module(&gpu::ShaderModuleDesc {
        label: "triangle",
        source: gpu::ShaderSource::Wgsl(TRIANGLE.into()),
    });
    device.create_render_pipeline(&gpu::RenderPipelineDesc {
        label: "triangle",
        layout: None,
        vertex: gpu::VertexState {
            module: &module,
            entry_point: "vs_main",
            constants: &[],
            buffers: &[],
        },
        primitive: gpu::PrimitiveState::default(),
        depth_stencil: None,
        multisample: gpu::MultisampleState::default(),
        fragment: Some(gpu::FragmentState {
            module: &module,
            entry_point: "fs_main",
            constants: &[],
            targets: &[Some(format.into())],
        }),
    })
}

pub fn color_pass<'a>(
    attachments: &'a [Option<gpu::RenderPassColorAttachment<'a>>],
) -> gpu::RenderPassDesc<'a> {
    gpu::RenderPassDesc {
        label: "pass",
        color_attachments: attachments,
        ..Default::default()
    }
}

pub fn clear_to(view: &gpu::TextureView, color: gpu::Color) -> gpu::RenderPassColorAttachment<'_> {
    gpu::RenderPassColorAttachment {
        view,
        resolve_target: None,
        ops: gpu::Operations {
            load: gpu::LoadOp::Clear(color),
            store: gpu::StoreOp::Store,
        },
    }
}

pub fn submit(device: &gpu::Device, encoder: &gpu::CommandEncoder) {
    let command_buffer = encoder.finish(&gpu::CommandBufferDesc::default());
    device.queue().submit(&[&command_buffer]);
}

/// Maps `buffer` for reading and returns its contents.
pub fn read_mapped(device: &gpu::Device, buffer: &gpu::Buffer) -> Vec<u8> {
    let (callback, done) = gpu::oneshot();
    buffer.map_async(gpu::MapMode::READ, 0, None, callback);
    device.tick();
    pollster::block_on(done).expect("map_async");
    let data = buffer.get_mapped_range(0, None).expect("mapped range");
    buffer.unmap();
    data
}

/// Copies `size` bytes of `source` into a staging buffer and reads them back.
pub fn read_buffer(device: &gpu::Device, source: &gpu::Buffer, size: u64) -> Vec<u8> {
    let staging = buffer(
        device,
        size,
        gpu::BufferUsages::MAP_READ | gpu::BufferUsages::COPY_DST,
    );
    let encoder = device.create_command_encoder(&gpu::CommandEncoderDesc::default());
    encoder.copy_buffer_to_buffer(source, 0, &staging, 0, size);
    submit(device, &encoder);
    read_mapped(device, &staging)
}

/// Reads the first row of a square texture of 4-byte texels.
pub fn read_first_row(device: &gpu::Device, texture: &gpu::Texture, size: u32) -> Vec<u8> {
    let staging = buffer(
        device,
        gpu::COPY_BYTES_PER_ROW_ALIGNMENT as u64 * size as u64,
        gpu::BufferUsages::MAP_READ | gpu::BufferUsages::COPY_DST,
    );
    let encoder = device.create_command_encoder(&gpu::CommandEncoderDesc::default());
    encoder.copy_texture_to_buffer(
        &gpu::ImageCopyTexture {
            texture,
            mip_level: 0,
            origin: gpu::Origin3d::default(),
            aspect: gpu::TextureAspect::All,
        },
        &gpu::ImageCopyBuffer {
            buffer: &staging,
            layout: gpu::TextureDataLayout {
                offset: 0,
                bytes_per_row: Some(gpu::COPY_BYTES_PER_ROW_ALIGNMENT),
                rows_per_image: None,
            },
        },
        gpu::Extent3d {
            width: size,
            height: size,
            depth_or_array_layers: 1,
        },
    );
    submit(device, &encoder);
    let mut data = read_mapped(device, &staging);
    data.truncate(4 * size as usize);
    data
}

/// Decodes little-endian query results.
pub fn u64s(data: &[u8]) -> Vec<u64> {
    data.chunks_exact(8)
        .map(|chunk| {
            let mut bytes = [0; 8];
            bytes.copy_from_slice(chunk);
            u64::from_le_bytes(bytes)
        })
        .collect()
}
