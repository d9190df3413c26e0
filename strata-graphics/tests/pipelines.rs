mod common;

use strata_graphics as gpu;

fn module(device: &gpu::Device, source: &str) -> gpu::ShaderModule {
    device.create_shader_module(&gpu::ShaderModuleDesc {
        label: "shader",
        source: gpu::ShaderSource::Wgsl(source.to_string().into()),
    })
}

fn compute_desc<'a>(
    module: &'a gpu::ShaderModule,
    layout: Option<&'a gpu::PipelineLayout>,
    constants: &'a [(&'a str, f64)],
) -> gpu::ComputePipelineDesc<'a> {
    gpu::ComputePipelineDesc {
        label: "compute",
        layout,
        compute: gpu::ProgrammableStage {
            module,
            entry_point: "main",
            constants,
        },
    }
}

fn compilation_info(
    device: &gpu::Device,
    module: &gpu::ShaderModule,
) -> Vec<gpu::CompilationMessage> {
    let (callback, info) = gpu::oneshot();
    module.get_compilation_info(callback);
    device.tick();
    pollster::block_on(info).expect("compilation info")
}

#[test]
fn valid_shaders_have_no_messages() {
    let device = common::device();
    let module = module(&device, common::EMPTY_COMPUTE);
    assert!(module.is_valid());
    assert!(compilation_info(&device, &module).is_empty());
}

#[test]
fn broken_shaders_keep_their_diagnostics() {
    let device = common::device();
    let errors = common::capture_errors(&device);
    let module = module(&device, "@compute @workgroup_size(1)\nfn main( {}");
    assert_eq!(errors.lock().unwrap().len(), 1);

    let messages = compilation_info(&device, &module);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].message_type, gpu::CompilationMessageType::Error);
    assert_eq!(messages[0].line_num, 2);

    let pipeline = device.create_compute_pipeline(&compute_desc(&module, None, &[]));
    assert!(!pipeline.is_valid());
    assert_eq!(errors.lock().unwrap().len(), 2);
}

#[test]
fn missing_entry_point_is_rejected() {
    let device = common::device();
    let errors = common::capture_errors(&device);
    let module = module(&device, common::EMPTY_COMPUTE);
    let pipeline = device.create_compute_pipeline(&gpu::ComputePipelineDesc {
        label: "missing",
        layout: None,
        compute: gpu::ProgrammableStage {
            module: &module,
            entry_point: "absent",
            constants: &[],
        },
    });
    assert!(!pipeline.is_valid());
    assert_eq!(errors.lock().unwrap().len(), 1);
}

#[test]
fn override_constants_must_exist() {
    let device = common::device();
    let errors = common::capture_errors(&device);
    let module = module(
        &device,
        "
        override gain: f32 = 1.0;
        @compute @workgroup_size(1)
        fn main() { _ = gain; }
        ",
    );
    let tuned = device.create_compute_pipeline(&compute_desc(&module, None, &[("gain", 2.0)]));
    assert!(tuned.is_valid());
    let unknown = device.create_compute_pipeline(&compute_desc(&module, None, &[("bias", 2.0)]));
    assert!(!unknown.is_valid());
    assert_eq!(errors.lock().unwrap().len(), 1);
}

#[test]
fn async_creation_reports_through_the_callback() {
    let device = common::device();
    let errors = common::capture_errors(&device);
    let good = module(&device, common::EMPTY_COMPUTE);
    let (callback, created) = gpu::oneshot();
    device.create_compute_pipeline_async(&compute_desc(&good, None, &[]), callback);
    assert!(!created.is_ready());
    device.tick();
    assert!(pollster::block_on(created).unwrap().is_valid());

    let (callback, failed) = gpu::oneshot();
    device.create_compute_pipeline_async(
        &gpu::ComputePipelineDesc {
            label: "broken",
            layout: None,
            compute: gpu::ProgrammableStage {
                module: &good,
                entry_point: "absent",
                constants: &[],
            },
        },
        callback,
    );
    device.tick();
    assert!(matches!(
        pollster::block_on(failed),
        Err(gpu::CreatePipelineError::Validation(_))
    ));
    assert!(errors.lock().unwrap().is_empty());
}

#[test]
fn async_creation_fails_when_the_device_is_lost() {
    let device = common::device();
    let good = module(&device, common::EMPTY_COMPUTE);
    let (callback, created) = gpu::oneshot();
    device.create_compute_pipeline_async(&compute_desc(&good, None, &[]), callback);
    device.destroy();
    assert!(matches!(
        created.try_take(),
        Some(Err(gpu::CreatePipelineError::DeviceLost))
    ));
}

const STORAGE_SHADER: &str = "
    @group(0) @binding(0) var<storage, read_write> data: array<u32>;

    @compute @workgroup_size(64)
    fn main(@builtin(global_invocation_id) id: vec3<u32>) {
        data[id.x] = data[id.x] + 1u;
    }
";

#[test]
fn derived_layouts_expose_their_groups() {
    let device = common::device();
    let errors = common::capture_errors(&device);
    let module = module(&device, STORAGE_SHADER);
    let pipeline = device.create_compute_pipeline(&compute_desc(&module, None, &[]));
    assert!(pipeline.is_valid());
    assert!(pipeline.get_bind_group_layout(0).is_valid());
    assert!(errors.lock().unwrap().is_empty());
    assert!(!pipeline.get_bind_group_layout(1).is_valid());
    assert_eq!(errors.lock().unwrap().len(), 1);
}

#[test]
fn explicit_layouts_must_cover_the_shader() {
    let device = common::device();
    let errors = common::capture_errors(&device);
    let module = module(&device, STORAGE_SHADER);

    let storage = device.create_bind_group_layout(&gpu::BindGroupLayoutDesc {
        label: "storage",
        entries: &[gpu::BindGroupLayoutEntry {
            binding: 0,
            visibility: gpu::ShaderStages::COMPUTE,
            ty: gpu::BindingType::Buffer {
                ty: gpu::BufferBindingType::Storage { read_only: false },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
        }],
    });
    let matching = device.create_pipeline_layout(&gpu::PipelineLayoutDesc {
        label: "matching",
        bind_group_layouts: &[&storage],
    });
    let pipeline = device.create_compute_pipeline(&compute_desc(&module, Some(&matching), &[]));
    assert!(pipeline.is_valid());

    let uniform = device.create_bind_group_layout(&gpu::BindGroupLayoutDesc {
        label: "uniform",
        entries: &[gpu::BindGroupLayoutEntry {
            binding: 0,
            visibility: gpu::ShaderStages::COMPUTE,
            ty: gpu::BindingType::Buffer {
                ty: gpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
        }],
    });
    let mismatched = device.create_pipeline_layout(&gpu::PipelineLayoutDesc {
        label: "mismatched",
        bind_group_layouts: &[&uniform],
    });
    assert!(errors.lock().unwrap().is_empty());
    let pipeline = device.create_compute_pipeline(&compute_desc(&module, Some(&mismatched), &[]));
    assert!(!pipeline.is_valid());
    assert_eq!(errors.lock().unwrap().len(), 1);
}

#[test]
fn render_pipelines_need_an_output() {
    let device = common::device();
    let errors = common::capture_errors(&device);
    let module = module(&device, common::TRIANGLE);
    let pipeline = device.create_render_pipeline(&gpu::RenderPipelineDesc {
        label: "headless",
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
        fragment: None,
    });
    assert!(!pipeline.is_valid());
    assert_eq!(errors.lock().unwrap().len(), 1);

    let pipeline = common::triangle_pipeline(&device, gpu::TextureFormat::Rgba8Unorm);
    assert!(pipeline.is_valid());
    assert_eq!(errors.lock().unwrap().len(), 1);
}

#[test]
fn vertex_inputs_must_be_provided() {
    let device = common::device();
    let errors = common::capture_errors(&device);
    let module = module(
        &device,
        "
        @vertex
        fn vs_main(@location(0) position: vec2<f32>) -> @builtin(position) vec4<f32> {
            return vec4<f32>(position, 0.0, 1.0);
        }

        @fragment
        fn fs_main() -> @location(0) vec4<f32> {
            return vec4<f32>(1.0);
        }
        ",
    );
    let targets = [Some(gpu::TextureFormat::Rgba8Unorm.into())];
    let build = |buffers: &[gpu::VertexBufferLayout]| {
        device.create_render_pipeline(&gpu::RenderPipelineDesc {
            label: "vertices",
            layout: None,
            vertex: gpu::VertexState {
                module: &module,
                entry_point: "vs_main",
                constants: &[],
                buffers,
            },
            primitive: gpu::PrimitiveState::default(),
            depth_stencil: None,
            multisample: gpu::MultisampleState::default(),
            fragment: Some(gpu::FragmentState {
                module: &module,
                entry_point: "fs_main",
                constants: &[],
                targets: &targets,
            }),
        })
    };

    let no_buffers: &[gpu::VertexBufferLayout] = &[];
    assert!(!build(no_buffers).is_valid());
    assert_eq!(errors.lock().unwrap().len(), 1);
    let positions = [gpu::VertexBufferLayout {
        array_stride: 8,
        step_mode: gpu::VertexStepMode::Vertex,
        attributes: &[gpu::VertexAttribute {
            format: gpu::VertexFormat::Float32x2,
            offset: 0,
            shader_location: 0,
        }],
    }];
    let with_positions = build(&positions[..]);
    assert!(with_positions.is_valid());
    assert_eq!(errors.lock().unwrap().len(), 1);
}
