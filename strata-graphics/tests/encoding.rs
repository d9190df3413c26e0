mod common;

use std::sync::Arc;

use strata_graphics as gpu;

const FORMAT: gpu::TextureFormat = gpu::TextureFormat::Rgba8Unorm;

#[test]
fn finishing_twice_yields_an_invalid_buffer() {
    let device = common::device();
    let errors = common::capture_errors(&device);
    let encoder = device.create_command_encoder(&Default::default());
    let first = encoder.finish(&Default::default());
    let second = encoder.finish(&Default::default());
    assert!(first.is_valid());
    assert!(!second.is_valid());
    assert_eq!(errors.lock().unwrap().len(), 1);
}

#[test]
fn recording_after_finish_is_reported_immediately() {
    let device = common::device();
    let errors = common::capture_errors(&device);
    let encoder = device.create_command_encoder(&Default::default());
    let _ = encoder.finish(&Default::default());
    encoder.insert_debug_marker("late");
    assert_eq!(errors.lock().unwrap().len(), 1);
}

#[test]
fn encoder_use_while_a_pass_is_open_fails_at_finish() {
    let device = common::device();
    let errors = common::capture_errors(&device);
    let buffer = common::buffer(&device, 16, gpu::BufferUsages::COPY_DST);
    let encoder = device.create_command_encoder(&Default::default());
    let pass = encoder.begin_compute_pass(&Default::default());
    encoder.clear_buffer(&buffer, 0, None);
    pass.end();
    assert!(errors.lock().unwrap().is_empty());

    let command_buffer = encoder.finish(&Default::default());
    assert!(!command_buffer.is_valid());
    let errors = errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].message().contains("pass is open"), "{}", errors[0]);
}

#[test]
fn finishing_with_an_open_pass_fails() {
    let device = common::device();
    let errors = common::capture_errors(&device);
    let encoder = device.create_command_encoder(&Default::default());
    let _pass = encoder.begin_compute_pass(&Default::default());
    let command_buffer = encoder.finish(&Default::default());
    assert!(!command_buffer.is_valid());
    assert_eq!(errors.lock().unwrap().len(), 1);
}

#[test]
fn ending_a_pass_twice_is_reported() {
    let device = common::device();
    let errors = common::capture_errors(&device);
    let encoder = device.create_command_encoder(&Default::default());
    let pass = encoder.begin_compute_pass(&Default::default());
    pass.end();
    pass.end();
    assert_eq!(errors.lock().unwrap().len(), 1);
    assert!(encoder.finish(&Default::default()).is_valid());
}

#[test]
fn unbalanced_debug_groups_fail_at_finish() {
    let device = common::device();
    let errors = common::capture_errors(&device);
    let encoder = device.create_command_encoder(&Default::default());
    encoder.push_debug_group("outer");
    encoder.push_debug_group("inner");
    encoder.pop_debug_group();
    assert!(errors.lock().unwrap().is_empty());
    assert!(!encoder.finish(&Default::default()).is_valid());
    assert_eq!(errors.lock().unwrap().len(), 1);
}

#[test]
fn skip_validation_tolerates_unbalanced_debug_groups() {
    let device = common::device_with(&gpu::DeviceDesc {
        force_enabled_toggles: &["skip_validation"],
        ..Default::default()
    });
    let errors = common::capture_errors(&device);
    let encoder = device.create_command_encoder(&Default::default());
    encoder.push_debug_group("open");
    encoder.pop_debug_group();
    encoder.pop_debug_group();
    encoder.push_debug_group("left open");
    assert!(encoder.finish(&Default::default()).is_valid());
    assert!(errors.lock().unwrap().is_empty());
}

#[test]
fn draw_without_pipeline_is_deferred() {
    let device = common::device();
    let errors = common::capture_errors(&device);
    let texture = common::render_texture(&device, FORMAT, 4);
    let view = texture.create_view(&Default::default());
    let encoder = device.create_command_encoder(&Default::default());
    let attachments = [Some(common::clear_to(&view, gpu::Color::BLACK))];
    let pass = encoder.begin_render_pass(&common::color_pass(&attachments));
    pass.draw(3, 1, 0, 0);
    pass.end();
    assert!(errors.lock().unwrap().is_empty());
    assert!(!encoder.finish(&Default::default()).is_valid());
    let errors = errors.lock().unwrap();
    assert!(errors[0].message().contains("no pipeline"), "{}", errors[0]);
}

#[test]
fn passes_record_in_order() {
    let device = common::device();
    let texture = common::render_texture(&device, FORMAT, 4);
    let view = texture.create_view(&Default::default());
    let pipeline = common::triangle_pipeline(&device, FORMAT);
    let encoder = device.create_command_encoder(&Default::default());
    let attachments = [Some(common::clear_to(&view, gpu::Color::BLACK))];
    let pass = encoder.begin_render_pass(&common::color_pass(&attachments));
    pass.set_pipeline(&pipeline);
    pass.draw(3, 1, 0, 0);
    pass.end();
    let commands = encoder.finish(&Default::default()).commands().unwrap();

    assert_eq!(commands.len(), 4);
    assert!(matches!(commands[0], gpu::Command::BeginRenderPass(_)));
    assert_eq!(
        commands[1],
        gpu::Command::Render(gpu::RenderCommand::SetPipeline(pipeline.key()))
    );
    assert!(matches!(
        commands[2],
        gpu::Command::Render(gpu::RenderCommand::Draw { vertex_count: 3, .. })
    ));
    assert_eq!(commands[3], gpu::Command::EndRenderPass);
}

#[test]
fn pipeline_must_match_the_attachments() {
    let device = common::device();
    let errors = common::capture_errors(&device);
    let texture = common::render_texture(&device, FORMAT, 4);
    let view = texture.create_view(&Default::default());
    let pipeline = common::triangle_pipeline(&device, gpu::TextureFormat::Bgra8Unorm);
    let encoder = device.create_command_encoder(&Default::default());
    let attachments = [Some(common::clear_to(&view, gpu::Color::BLACK))];
    let pass = encoder.begin_render_pass(&common::color_pass(&attachments));
    pass.set_pipeline(&pipeline);
    pass.end();
    assert!(!encoder.finish(&Default::default()).is_valid());
    assert_eq!(errors.lock().unwrap().len(), 1);
}

#[test]
fn render_pass_needs_an_attachment() {
    let device = common::device();
    let errors = common::capture_errors(&device);
    let encoder = device.create_command_encoder(&Default::default());
    let pass = encoder.begin_render_pass(&common::color_pass(&[]));
    pass.end();
    assert!(!encoder.finish(&Default::default()).is_valid());
    assert_eq!(errors.lock().unwrap().len(), 1);
}

fn bundle_desc(colors: &[Option<gpu::TextureFormat>]) -> gpu::RenderBundleEncoderDesc<'_> {
    gpu::RenderBundleEncoderDesc {
        label: "bundle",
        color_formats: colors,
        depth_stencil_format: None,
        sample_count: 1,
        depth_read_only: false,
        stencil_read_only: false,
    }
}

#[test]
fn bundles_replay_the_same_commands_in_every_pass() {
    let device = common::device();
    let errors = common::capture_errors(&device);
    let texture = common::render_texture(&device, FORMAT, 4);
    let view = texture.create_view(&Default::default());
    let pipeline = common::triangle_pipeline(&device, FORMAT);

    let bundle_encoder = device.create_render_bundle_encoder(&bundle_desc(&[Some(FORMAT)]));
    bundle_encoder.set_pipeline(&pipeline);
    bundle_encoder.insert_debug_marker("triangle");
    bundle_encoder.draw(3, 1, 0, 0);
    let bundle = bundle_encoder.finish(&Default::default());
    assert!(bundle.is_valid());
    assert_eq!(bundle.command_count(), Ok(2));

    let encoder = device.create_command_encoder(&Default::default());
    for _ in 0..2 {
        let attachments = [Some(common::clear_to(&view, gpu::Color::BLACK))];
        let pass = encoder.begin_render_pass(&common::color_pass(&attachments));
        pass.execute_bundles(&[&bundle]);
        pass.end();
    }
    let commands = encoder.finish(&Default::default()).commands().unwrap();
    assert!(errors.lock().unwrap().is_empty());

    let replays: Vec<_> = commands
        .iter()
        .filter_map(|command| match *command {
            gpu::Command::Render(gpu::RenderCommand::ExecuteBundle {
                bundle: key,
                ref commands,
            }) => {
                assert_eq!(key, bundle.key());
                Some(Arc::clone(commands))
            }
            _ => None,
        })
        .collect();
    assert_eq!(replays.len(), 2);
    assert!(Arc::ptr_eq(&replays[0], &replays[1]));
    assert_eq!(replays[0].len(), 3);
}

#[test]
fn bundle_format_mismatch_invalidates_the_pass() {
    let device = common::device();
    let errors = common::capture_errors(&device);
    let texture = common::render_texture(&device, FORMAT, 4);
    let view = texture.create_view(&Default::default());
    let bundle_encoder =
        device.create_render_bundle_encoder(&bundle_desc(&[Some(gpu::TextureFormat::Bgra8Unorm)]));
    let bundle = bundle_encoder.finish(&Default::default());
    assert!(bundle.is_valid());

    let encoder = device.create_command_encoder(&Default::default());
    let attachments = [Some(common::clear_to(&view, gpu::Color::BLACK))];
    let pass = encoder.begin_render_pass(&common::color_pass(&attachments));
    pass.execute_bundles(&[&bundle]);
    pass.end();
    assert!(!encoder.finish(&Default::default()).is_valid());
    assert_eq!(errors.lock().unwrap().len(), 1);
}

#[test]
fn bundle_with_open_debug_group_fails_to_finish() {
    let device = common::device();
    let errors = common::capture_errors(&device);
    let bundle_encoder = device.create_render_bundle_encoder(&bundle_desc(&[Some(FORMAT)]));
    bundle_encoder.push_debug_group("open");
    let bundle = bundle_encoder.finish(&Default::default());
    assert!(!bundle.is_valid());
    assert_eq!(errors.lock().unwrap().len(), 1);

    let again = bundle_encoder.finish(&Default::default());
    assert!(!again.is_valid());
    assert_eq!(errors.lock().unwrap().len(), 2);
}

#[test]
fn invalid_bundle_descriptor_is_reported_at_creation() {
    let device = common::device();
    let errors = common::capture_errors(&device);
    let bundle_encoder = device.create_render_bundle_encoder(&bundle_desc(&[]));
    assert_eq!(errors.lock().unwrap().len(), 1);
    assert!(!bundle_encoder.finish(&Default::default()).is_valid());
}

#[test]
fn compute_dispatch_needs_its_bind_groups() {
    let device = common::device();
    let errors = common::capture_errors(&device);
    let module = device.create_shader_module(&gpu::ShaderModuleDesc {
        label: "double",
        source: gpu::ShaderSource::Wgsl(
            "
            @group(0) @binding(0) var<storage, read_write> data: array<u32>;

            @compute @workgroup_size(64)
            fn main(@builtin(global_invocation_id) id: vec3<u32>) {
                data[id.x] = data[id.x] * 2u;
            }
            "
            .into(),
        ),
    });
    let pipeline = device.create_compute_pipeline(&gpu::ComputePipelineDesc {
        label: "double",
        layout: None,
        compute: gpu::ProgrammableStage {
            module: &module,
            entry_point: "main",
            constants: &[],
        },
    });
    let storage = common::buffer(&device, 256, gpu::BufferUsages::STORAGE);
    let layout = pipeline.get_bind_group_layout(0);
    let group = device.create_bind_group(&gpu::BindGroupDesc {
        label: "data",
        layout: &layout,
        entries: &[gpu::BindGroupEntry {
            binding: 0,
            resource: gpu::BindingResource::Buffer(gpu::BufferBinding {
                buffer: &storage,
                offset: 0,
                size: None,
            }),
        }],
    });
    assert!(group.is_valid());

    let encoder = device.create_command_encoder(&Default::default());
    let pass = encoder.begin_compute_pass(&Default::default());
    pass.set_pipeline(&pipeline);
    pass.set_bind_group(0, Some(&group), &[]);
    pass.dispatch_workgroups(4, 1, 1);
    pass.end();
    assert!(encoder.finish(&Default::default()).is_valid());

    let encoder = device.create_command_encoder(&Default::default());
    let pass = encoder.begin_compute_pass(&Default::default());
    pass.set_pipeline(&pipeline);
    pass.dispatch_workgroups(4, 1, 1);
    pass.end();
    assert!(errors.lock().unwrap().is_empty());
    assert!(!encoder.finish(&Default::default()).is_valid());
    assert_eq!(errors.lock().unwrap().len(), 1);
}

#[test]
fn attachments_must_view_every_aspect() {
    let device = common::device();
    let errors = common::capture_errors(&device);
    let texture = common::render_texture(&device, gpu::TextureFormat::Depth24PlusStencil8, 4);
    let depth_only = texture.create_view(&gpu::TextureViewDesc {
        aspect: gpu::TextureAspect::DepthOnly,
        ..Default::default()
    });
    let full = texture.create_view(&Default::default());
    assert!(depth_only.is_valid());

    let record = |view: &gpu::TextureView| {
        let encoder = device.create_command_encoder(&Default::default());
        encoder
            .begin_render_pass(&gpu::RenderPassDesc {
                label: "depth",
                depth_stencil_attachment: Some(gpu::RenderPassDepthStencilAttachment {
                    view,
                    depth_ops: Some(gpu::Operations {
                        load: gpu::LoadOp::Clear(1.0),
                        store: gpu::StoreOp::Store,
                    }),
                    stencil_ops: None,
                }),
                ..Default::default()
            })
            .end();
        encoder.finish(&Default::default()).is_valid()
    };
    assert!(!record(&depth_only));
    assert_eq!(errors.lock().unwrap().len(), 1);
    assert!(record(&full));
    assert_eq!(errors.lock().unwrap().len(), 1);
}

#[test]
fn viewports_must_be_finite_and_inside_the_attachments() {
    let device = common::device();
    let errors = common::capture_errors(&device);
    let texture = common::render_texture(&device, FORMAT, 4);
    let view = texture.create_view(&Default::default());
    let attachments = [Some(common::clear_to(&view, gpu::Color::BLACK))];

    let record = |viewport: [f32; 6]| {
        let encoder = device.create_command_encoder(&Default::default());
        let pass = encoder.begin_render_pass(&common::color_pass(&attachments));
        let [x, y, width, height, min_depth, max_depth] = viewport;
        pass.set_viewport(x, y, width, height, min_depth, max_depth);
        pass.end();
        encoder.finish(&Default::default()).is_valid()
    };
    assert!(record([0.0, 0.0, 4.0, 4.0, 0.0, 1.0]));
    assert!(!record([0.0, 0.0, 8.0, 4.0, 0.0, 1.0]));
    assert!(!record([f32::NAN, 0.0, 4.0, 4.0, 0.0, 1.0]));
    assert!(!record([0.0, 0.0, 4.0, 4.0, 0.0, f32::NAN]));
    assert!(!record([0.0, f32::NEG_INFINITY, 4.0, 4.0, 0.0, 1.0]));
    assert_eq!(errors.lock().unwrap().len(), 4);
}
