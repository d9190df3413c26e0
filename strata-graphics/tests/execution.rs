mod common;

use std::sync::{Arc, Mutex};

use strata_graphics as gpu;

#[test]
fn buffer_copies_run_in_submission_order() {
    let device = common::device();
    let source = common::buffer(
        &device,
        16,
        gpu::BufferUsages::COPY_SRC | gpu::BufferUsages::COPY_DST,
    );
    let destination = common::buffer(
        &device,
        16,
        gpu::BufferUsages::COPY_SRC | gpu::BufferUsages::COPY_DST,
    );
    device.queue().write_buffer(&source, 0, &[1u8; 16]);

    let encoder = device.create_command_encoder(&Default::default());
    encoder.copy_buffer_to_buffer(&source, 0, &destination, 0, 8);
    encoder.write_buffer(&source, 0, &[2u8; 16]);
    encoder.copy_buffer_to_buffer(&source, 8, &destination, 8, 8);
    encoder.clear_buffer(&source, 0, Some(4));
    common::submit(&device, &encoder);

    let copied = common::read_buffer(&device, &destination, 16);
    assert_eq!(&copied[..8], &[1u8; 8]);
    assert_eq!(&copied[8..], &[2u8; 8]);
    let source_data = common::read_buffer(&device, &source, 16);
    assert_eq!(&source_data[..4], &[0u8; 4]);
    assert_eq!(&source_data[4..], &[2u8; 12]);
}

#[test]
fn misaligned_copy_invalidates_the_encoder() {
    let device = common::device();
    let errors = common::capture_errors(&device);
    let source = common::buffer(&device, 16, gpu::BufferUsages::COPY_SRC);
    let destination = common::buffer(&device, 16, gpu::BufferUsages::COPY_DST);
    let encoder = device.create_command_encoder(&Default::default());
    encoder.copy_buffer_to_buffer(&source, 2, &destination, 0, 4);
    assert!(!encoder.finish(&Default::default()).is_valid());
    assert_eq!(errors.lock().unwrap().len(), 1);
}

#[test]
fn textures_round_trip_through_buffers() {
    let device = common::device();
    let texture = device.create_texture(&gpu::TextureDesc {
        label: "texels",
        size: gpu::Extent3d {
            width: 2,
            height: 2,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: gpu::TextureDimension::D2,
        format: gpu::TextureFormat::Rgba8Unorm,
        usage: gpu::TextureUsages::COPY_DST | gpu::TextureUsages::COPY_SRC,
        view_formats: &[],
    });
    let texels: Vec<u8> = (0..16).collect();
    device.queue().write_texture(
        &gpu::ImageCopyTexture {
            texture: &texture,
            mip_level: 0,
            origin: gpu::Origin3d::default(),
            aspect: gpu::TextureAspect::All,
        },
        &texels,
        gpu::TextureDataLayout {
            offset: 0,
            bytes_per_row: Some(8),
            rows_per_image: None,
        },
        gpu::Extent3d {
            width: 2,
            height: 2,
            depth_or_array_layers: 1,
        },
    );

    let staging = common::buffer(
        &device,
        512,
        gpu::BufferUsages::MAP_READ | gpu::BufferUsages::COPY_DST,
    );
    let encoder = device.create_command_encoder(&Default::default());
    encoder.copy_texture_to_buffer(
        &gpu::ImageCopyTexture {
            texture: &texture,
            mip_level: 0,
            origin: gpu::Origin3d::default(),
            aspect: gpu::TextureAspect::All,
        },
        &gpu::ImageCopyBuffer {
            buffer: &staging,
            layout: gpu::TextureDataLayout {
                offset: 0,
                bytes_per_row: Some(256),
                rows_per_image: None,
            },
        },
        gpu::Extent3d {
            width: 2,
            height: 2,
            depth_or_array_layers: 1,
        },
    );
    common::submit(&device, &encoder);
    let data = common::read_mapped(&device, &staging);
    assert_eq!(&data[..8], &texels[..8]);
    assert_eq!(&data[256..264], &texels[8..]);
}

#[test]
fn oversized_layouts_are_rejected() {
    let device = common::device();
    let errors = common::capture_errors(&device);
    let size = gpu::Extent3d {
        width: 1,
        height: 2,
        depth_or_array_layers: 3,
    };
    let texture = device.create_texture(&gpu::TextureDesc {
        label: "layers",
        size,
        mip_level_count: 1,
        sample_count: 1,
        dimension: gpu::TextureDimension::D2,
        format: gpu::TextureFormat::R8Unorm,
        usage: gpu::TextureUsages::COPY_DST,
        view_formats: &[],
    });
    let destination = gpu::ImageCopyTexture {
        texture: &texture,
        mip_level: 0,
        origin: gpu::Origin3d::default(),
        aspect: gpu::TextureAspect::All,
    };
    let layout = gpu::TextureDataLayout {
        offset: 0,
        bytes_per_row: Some(u32::MAX),
        rows_per_image: Some(u32::MAX),
    };
    device.queue().write_texture(&destination, &[0; 6], layout, size);
    assert_eq!(errors.lock().unwrap().len(), 1);

    device.queue().write_texture(
        &destination,
        &[0; 6],
        gpu::TextureDataLayout {
            offset: 0,
            bytes_per_row: Some(1),
            rows_per_image: Some(2),
        },
        size,
    );
    assert_eq!(errors.lock().unwrap().len(), 1);
}

#[test]
fn render_pass_clears_its_attachment() {
    let device = common::device();
    let texture = common::render_texture(&device, gpu::TextureFormat::Rgba8Unorm, 4);
    let view = texture.create_view(&Default::default());
    let encoder = device.create_command_encoder(&Default::default());
    let red = gpu::Color {
        r: 1.0,
        g: 0.0,
        b: 0.0,
        a: 1.0,
    };
    let attachments = [Some(common::clear_to(&view, red))];
    encoder.begin_render_pass(&common::color_pass(&attachments)).end();
    common::submit(&device, &encoder);

    let row = common::read_first_row(&device, &texture, 4);
    assert_eq!(row, [255, 0, 0, 255].repeat(4));
}

#[test]
fn discarded_attachment_reads_back_as_zero() {
    let device = common::device();
    let texture = common::render_texture(&device, gpu::TextureFormat::Bgra8Unorm, 4);
    let view = texture.create_view(&Default::default());
    let encoder = device.create_command_encoder(&Default::default());
    let attachments = [Some(gpu::RenderPassColorAttachment {
        view: &view,
        resolve_target: None,
        ops: gpu::Operations {
            load: gpu::LoadOp::Clear(gpu::Color::WHITE),
            store: gpu::StoreOp::Discard,
        },
    })];
    encoder.begin_render_pass(&common::color_pass(&attachments)).end();
    common::submit(&device, &encoder);

    assert_eq!(common::read_first_row(&device, &texture, 4), vec![0; 16]);
}

#[test]
fn timestamps_resolve_in_order() {
    let device = common::full_device();
    let query_set = device.create_query_set(&gpu::QuerySetDesc {
        label: "timestamps",
        ty: gpu::QueryType::Timestamp,
        count: 2,
    });
    let resolve = common::buffer(
        &device,
        16,
        gpu::BufferUsages::QUERY_RESOLVE | gpu::BufferUsages::COPY_SRC,
    );
    let encoder = device.create_command_encoder(&Default::default());
    encoder.write_timestamp(&query_set, 0);
    let pass = encoder.begin_compute_pass(&gpu::ComputePassDesc {
        label: "timed",
        timestamp_writes: None,
    });
    pass.end();
    encoder.write_timestamp(&query_set, 1);
    encoder.resolve_query_set(&query_set, 0, 2, &resolve, 0);
    common::submit(&device, &encoder);

    let data = common::read_buffer(&device, &resolve, 16);
    let values = common::u64s(&data);
    assert!(values[1] >= values[0]);
}

#[test]
fn occlusion_query_records_passing_draws() {
    let device = common::device();
    let format = gpu::TextureFormat::Rgba8Unorm;
    let texture = common::render_texture(&device, format, 4);
    let view = texture.create_view(&Default::default());
    let pipeline = common::triangle_pipeline(&device, format);
    let query_set = device.create_query_set(&gpu::QuerySetDesc {
        label: "occlusion",
        ty: gpu::QueryType::Occlusion,
        count: 2,
    });
    let resolve = common::buffer(
        &device,
        16,
        gpu::BufferUsages::QUERY_RESOLVE | gpu::BufferUsages::COPY_SRC,
    );

    let encoder = device.create_command_encoder(&Default::default());
    let attachments = [Some(common::clear_to(&view, gpu::Color::BLACK))];
    let pass = encoder.begin_render_pass(&gpu::RenderPassDesc {
        label: "occluded",
        color_attachments: &attachments,
        occlusion_query_set: Some(&query_set),
        ..Default::default()
    });
    pass.set_pipeline(&pipeline);
    pass.begin_occlusion_query(0);
    pass.draw(3, 1, 0, 0);
    pass.end_occlusion_query();
    pass.begin_occlusion_query(1);
    pass.end_occlusion_query();
    pass.end();
    encoder.resolve_query_set(&query_set, 0, 2, &resolve, 0);
    common::submit(&device, &encoder);

    let data = common::read_buffer(&device, &resolve, 16);
    assert_eq!(common::u64s(&data), vec![1, 0]);
}

#[test]
fn map_requests_complete_in_order_and_reject_a_second_pending_map() {
    let device = common::device();
    let buffer = common::buffer(
        &device,
        16,
        gpu::BufferUsages::MAP_READ | gpu::BufferUsages::COPY_DST,
    );
    let order = Arc::new(Mutex::new(Vec::new()));
    for name in ["first", "second"] {
        let order = Arc::clone(&order);
        buffer.map_async(gpu::MapMode::READ, 0, None, move |result| {
            order.lock().unwrap().push((name, result));
        });
    }
    assert_eq!(buffer.map_state(), Ok(gpu::BufferMapState::Pending));
    assert!(order.lock().unwrap().is_empty());

    assert_eq!(device.tick(), 2);
    assert_eq!(
        *order.lock().unwrap(),
        vec![
            ("first", Ok(())),
            ("second", Err(gpu::BufferMapError::AlreadyPending)),
        ]
    );
    assert_eq!(buffer.map_state(), Ok(gpu::BufferMapState::Mapped));
}

#[test]
fn unmapping_before_the_callback_aborts_the_map() {
    let device = common::device();
    let buffer = common::buffer(
        &device,
        16,
        gpu::BufferUsages::MAP_READ | gpu::BufferUsages::COPY_DST,
    );
    let (callback, done) = gpu::oneshot();
    buffer.map_async(gpu::MapMode::READ, 0, None, callback);
    buffer.unmap();
    device.tick();
    assert_eq!(
        pollster::block_on(done),
        Err(gpu::BufferMapError::UnmappedBeforeCallback)
    );
    assert_eq!(buffer.map_state(), Ok(gpu::BufferMapState::Unmapped));
}

#[test]
fn destroying_before_the_callback_aborts_the_map() {
    let device = common::device();
    let buffer = common::buffer(
        &device,
        16,
        gpu::BufferUsages::MAP_READ | gpu::BufferUsages::COPY_DST,
    );
    let (callback, done) = gpu::oneshot();
    buffer.map_async(gpu::MapMode::READ, 0, None, callback);
    buffer.destroy();
    device.tick();
    assert_eq!(
        pollster::block_on(done),
        Err(gpu::BufferMapError::DestroyedBeforeCallback)
    );
}

#[test]
fn mapped_at_creation_uploads_on_unmap() {
    let device = common::device();
    let buffer = device.create_buffer(&gpu::BufferDesc {
        label: "upload",
        size: 8,
        usage: gpu::BufferUsages::COPY_SRC,
        mapped_at_creation: true,
    });
    assert_eq!(buffer.map_state(), Ok(gpu::BufferMapState::Mapped));
    buffer
        .write_mapped_range(0, &[7, 7, 7, 7, 9, 9, 9, 9])
        .unwrap();
    buffer.unmap();
    assert_eq!(
        buffer.get_mapped_range(0, None),
        Err(gpu::MapError::NotMapped)
    );
    assert_eq!(
        common::read_buffer(&device, &buffer, 8),
        vec![7, 7, 7, 7, 9, 9, 9, 9]
    );
}

#[test]
fn read_mappings_are_not_writable() {
    let device = common::device();
    let buffer = common::buffer(
        &device,
        16,
        gpu::BufferUsages::MAP_READ | gpu::BufferUsages::COPY_DST,
    );
    let (callback, done) = gpu::oneshot();
    buffer.map_async(gpu::MapMode::READ, 8, Some(8), callback);
    device.tick();
    pollster::block_on(done).unwrap();
    assert_eq!(buffer.write_mapped_range(8, &[0; 4]), Err(gpu::MapError::ReadOnly));
    assert_eq!(buffer.get_mapped_range(0, Some(8)), Err(gpu::MapError::OutOfRange));
    assert_eq!(buffer.get_mapped_range(8, None), Ok(vec![0; 8]));
}

#[test]
fn work_done_waits_for_a_tick() {
    let device = common::device();
    let (callback, done) = gpu::oneshot();
    device.queue().on_submitted_work_done(callback);
    assert!(!done.is_ready());
    assert_eq!(device.tick(), 1);
    assert_eq!(done.try_take(), Some(Ok(())));
}

#[test]
fn dumping_commands_goes_through_the_logging_callback() {
    let device = common::device_with(&gpu::DeviceDesc {
        force_enabled_toggles: &["dump_commands"],
        ..Default::default()
    });
    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&lines);
    device.set_logging_callback(move |ty, message| {
        sink.lock().unwrap().push((ty, message.to_string()));
    });
    let encoder = device.create_command_encoder(&Default::default());
    encoder.insert_debug_marker("hello");
    common::submit(&device, &encoder);

    let lines = lines.lock().unwrap();
    assert!(lines
        .iter()
        .any(|(ty, line)| *ty == gpu::LoggingType::Verbose && line.contains("hello")));
}
