mod common;

use strata_graphics as gpu;

#[test]
fn references_keep_objects_alive() {
    let device = common::device();
    let buffer = common::buffer(&device, 16, gpu::BufferUsages::COPY_DST);
    let second = buffer.reference();
    buffer.release();
    assert_eq!(second.size(), Ok(16));
    assert!(second.is_valid());
}

#[test]
fn labels_can_be_changed() {
    let device = common::device();
    let texture = common::render_texture(&device, gpu::TextureFormat::Rgba8Unorm, 4);
    assert_eq!(texture.label(), "target");
    texture.set_label("renamed");
    assert_eq!(texture.reference().label(), "renamed");
}

#[test]
fn failed_creation_yields_an_invalid_object() {
    let device = common::device();
    let errors = common::capture_errors(&device);
    let buffer = device.create_buffer(&gpu::BufferDesc {
        label: "bad",
        size: 16,
        usage: gpu::BufferUsages::MAP_READ | gpu::BufferUsages::VERTEX,
        mapped_at_creation: false,
    });
    assert!(!buffer.is_valid());
    assert_eq!(buffer.size(), Err(gpu::HandleError::Invalid));
    let errors = errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].error_type(), gpu::ErrorType::Validation);
}

#[test]
fn error_buffer_is_silent() {
    let device = common::device();
    let errors = common::capture_errors(&device);
    let buffer = device.create_error_buffer(&gpu::BufferDesc {
        label: "error",
        size: 4,
        usage: gpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    assert!(!buffer.is_valid());
    assert!(errors.lock().unwrap().is_empty());
}

#[test]
fn destroyed_buffer_fails_submission() {
    let device = common::device();
    let errors = common::capture_errors(&device);
    let source = common::buffer(&device, 16, gpu::BufferUsages::COPY_SRC);
    let destination = common::buffer(&device, 16, gpu::BufferUsages::COPY_DST);
    let encoder = device.create_command_encoder(&Default::default());
    encoder.copy_buffer_to_buffer(&source, 0, &destination, 0, 16);
    let command_buffer = encoder.finish(&Default::default());
    assert!(errors.lock().unwrap().is_empty());

    source.destroy();
    assert!(source.is_valid());
    device.queue().submit(&[&command_buffer]);

    let errors = errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].message().contains("destroyed"), "{}", errors[0]);
}

#[test]
fn command_buffer_cannot_be_submitted_twice() {
    let device = common::device();
    let errors = common::capture_errors(&device);
    let encoder = device.create_command_encoder(&Default::default());
    let command_buffer = encoder.finish(&Default::default());
    device.queue().submit(&[&command_buffer]);
    assert!(errors.lock().unwrap().is_empty());
    device.queue().submit(&[&command_buffer]);
    assert_eq!(errors.lock().unwrap().len(), 1);
}

#[test]
fn memory_is_returned_on_release_and_destroy() {
    let device = common::device();
    assert_eq!(device.memory_used(), 0);
    let first = common::buffer(&device, 256, gpu::BufferUsages::COPY_DST);
    let second = common::buffer(&device, 512, gpu::BufferUsages::COPY_DST);
    assert_eq!(device.memory_used(), 768);
    first.destroy();
    assert_eq!(device.memory_used(), 512);
    drop(second);
    assert_eq!(device.memory_used(), 0);
}

#[test]
fn allocations_past_the_budget_are_out_of_memory() {
    common::init_logging();
    let instance = gpu::Instance::new(&gpu::InstanceDesc {
        adapters: vec![gpu::AdapterDesc {
            memory_budget: 1024,
            ..gpu::AdapterDesc::software()
        }],
    });
    let adapter = instance.enumerate_adapters().remove(0);
    let device = adapter.create_device(&Default::default()).unwrap();

    device.push_error_scope(gpu::ErrorFilter::OutOfMemory);
    let _fits = common::buffer(&device, 1024, gpu::BufferUsages::COPY_DST);
    let overflow = common::buffer(&device, 4, gpu::BufferUsages::COPY_DST);
    assert!(!overflow.is_valid());

    let (callback, popped) = gpu::oneshot();
    device.pop_error_scope(callback);
    device.tick();
    let error = pollster::block_on(popped).unwrap().expect("captured error");
    assert_eq!(error.error_type(), gpu::ErrorType::OutOfMemory);
}

#[test]
fn views_of_destroyed_textures_are_invalid() {
    let device = common::device();
    let errors = common::capture_errors(&device);
    let texture = common::render_texture(&device, gpu::TextureFormat::Rgba8Unorm, 4);
    let live = texture.create_view(&Default::default());
    assert!(live.is_valid());

    texture.destroy();
    let dead = texture.create_view(&Default::default());
    assert!(!dead.is_valid());
    assert_eq!(errors.lock().unwrap().len(), 1);
}

#[test]
fn texture_queries() {
    let device = common::device();
    let texture = common::render_texture(&device, gpu::TextureFormat::Bgra8Unorm, 8);
    assert_eq!(texture.width(), Ok(8));
    assert_eq!(texture.height(), Ok(8));
    assert_eq!(texture.mip_level_count(), Ok(1));
    assert_eq!(texture.dimension(), Ok(gpu::TextureDimension::D2));
    assert_eq!(texture.format(), Ok(gpu::TextureFormat::Bgra8Unorm));
}

#[test]
fn objects_of_a_lost_device_report_it() {
    let device = common::device();
    let buffer = common::buffer(&device, 16, gpu::BufferUsages::COPY_DST);
    device.destroy();
    assert!(device.is_lost());
    assert_eq!(buffer.size(), Err(gpu::HandleError::DeviceLost));
}

#[test]
fn query_set_needs_the_timestamp_feature() {
    let device = common::device();
    let errors = common::capture_errors(&device);
    let occlusion = device.create_query_set(&gpu::QuerySetDesc {
        label: "occlusion",
        ty: gpu::QueryType::Occlusion,
        count: 4,
    });
    assert_eq!(occlusion.count(), Ok(4));
    let timestamps = device.create_query_set(&gpu::QuerySetDesc {
        label: "timestamps",
        ty: gpu::QueryType::Timestamp,
        count: 4,
    });
    assert!(!timestamps.is_valid());
    assert_eq!(errors.lock().unwrap().len(), 1);
}
