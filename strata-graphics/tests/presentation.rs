mod common;

use std::sync::{Arc, Mutex};

use strata_graphics as gpu;

fn adapter(name: &str, adapter_type: gpu::AdapterType) -> gpu::AdapterDesc {
    let mut desc = gpu::AdapterDesc::software();
    desc.properties.name = name.to_string();
    desc.properties.adapter_type = adapter_type;
    desc
}

fn request(
    instance: &gpu::Instance,
    options: &gpu::RequestAdapterOptions,
) -> Result<gpu::Adapter, gpu::RequestAdapterError> {
    let (callback, adapter) = gpu::oneshot();
    instance.request_adapter(options, callback);
    assert!(!adapter.is_ready());
    assert_eq!(instance.process_events(), 1);
    pollster::block_on(adapter)
}

#[test]
fn default_instance_exposes_the_software_adapter() {
    common::init_logging();
    let instance = gpu::Instance::default();
    let adapter = request(&instance, &Default::default()).unwrap();
    assert_eq!(adapter.properties().adapter_type, gpu::AdapterType::Cpu);
    assert!(adapter.has_feature(gpu::Features::TIMESTAMP_QUERY));
}

#[test]
fn power_preference_orders_adapters() {
    common::init_logging();
    let instance = gpu::Instance::new(&gpu::InstanceDesc {
        adapters: vec![
            adapter("integrated", gpu::AdapterType::IntegratedGpu),
            adapter("discrete", gpu::AdapterType::DiscreteGpu),
            adapter("cpu", gpu::AdapterType::Cpu),
        ],
    });
    let pick = |power_preference, force_fallback_adapter| {
        request(
            &instance,
            &gpu::RequestAdapterOptions {
                power_preference,
                force_fallback_adapter,
                ..Default::default()
            },
        )
        .unwrap()
        .properties()
        .name
        .clone()
    };
    assert_eq!(pick(gpu::PowerPreference::HighPerformance, false), "discrete");
    assert_eq!(pick(gpu::PowerPreference::LowPower, false), "integrated");
    assert_eq!(pick(gpu::PowerPreference::Undefined, false), "integrated");
    assert_eq!(pick(gpu::PowerPreference::HighPerformance, true), "cpu");
}

#[test]
fn unmatched_backend_is_unavailable() {
    common::init_logging();
    let instance = gpu::Instance::default();
    let result = request(
        &instance,
        &gpu::RequestAdapterOptions {
            backend_type: Some(gpu::BackendType::Vulkan),
            ..Default::default()
        },
    );
    assert_eq!(result.err(), Some(gpu::RequestAdapterError::Unavailable));
}

#[test]
fn devices_only_get_supported_features_and_limits() {
    common::init_logging();
    let mut desc = adapter("limited", gpu::AdapterType::DiscreteGpu);
    desc.features = gpu::Features::DEPTH_CLIP_CONTROL;
    let instance = gpu::Instance::new(&gpu::InstanceDesc {
        adapters: vec![desc],
    });
    let adapter = instance.enumerate_adapters().remove(0);

    assert!(adapter
        .create_device(&gpu::DeviceDesc {
            required_features: gpu::Features::TIMESTAMP_QUERY,
            ..Default::default()
        })
        .is_err());

    let too_large = gpu::Limits {
        max_bind_groups: 64,
        ..Default::default()
    };
    assert!(adapter
        .create_device(&gpu::DeviceDesc {
            required_limits: Some(&too_large),
            ..Default::default()
        })
        .is_err());

    assert!(adapter
        .create_device(&gpu::DeviceDesc {
            force_enabled_toggles: &["no_such_toggle"],
            ..Default::default()
        })
        .is_err());

    let device = adapter
        .create_device(&gpu::DeviceDesc {
            label: "clip",
            required_features: gpu::Features::DEPTH_CLIP_CONTROL,
            force_enabled_toggles: &["lazy_clear_resource_on_first_use"],
            ..Default::default()
        })
        .unwrap();
    assert_eq!(device.features(), gpu::Features::DEPTH_CLIP_CONTROL);
    assert!(device
        .toggles()
        .contains(gpu::Toggles::LAZY_CLEAR_RESOURCE_ON_FIRST_USE));
    assert_eq!(device.label(), "clip");
}

#[test]
fn request_device_is_delivered_by_the_instance() {
    common::init_logging();
    let instance = gpu::Instance::default();
    let adapter = instance.enumerate_adapters().remove(0);
    let (callback, device) = gpu::oneshot();
    adapter.request_device(
        &gpu::DeviceDesc {
            default_queue_label: "main queue",
            ..Default::default()
        },
        callback,
    );
    assert!(!device.is_ready());
    instance.process_events();
    let device = pollster::block_on(device).unwrap();
    assert_eq!(device.queue().label(), "main queue");
}

#[test]
fn dropping_the_instance_fails_pending_requests() {
    common::init_logging();
    let instance = gpu::Instance::default();
    let (callback, adapter) = gpu::oneshot();
    instance.request_adapter(&Default::default(), callback);
    drop(instance);
    assert_eq!(
        adapter.try_take().map(|result| result.err()),
        Some(Some(gpu::RequestAdapterError::InstanceDropped))
    );
}

fn headless(instance: &gpu::Instance) -> gpu::Surface {
    instance.create_surface(&gpu::SurfaceDesc {
        label: "window",
        target: gpu::SurfaceTarget::Headless {
            width: 64,
            height: 64,
        },
    })
}

fn swap_chain_desc(width: u32) -> gpu::SwapChainDesc<'static> {
    gpu::SwapChainDesc {
        label: "swap chain",
        usage: gpu::TextureUsages::RENDER_ATTACHMENT | gpu::TextureUsages::COPY_SRC,
        format: gpu::TextureFormat::Bgra8Unorm,
        width,
        height: 64,
        present_mode: gpu::PresentMode::Fifo,
    }
}

#[test]
fn surfaces_are_tied_to_their_instance() {
    common::init_logging();
    let instance = gpu::Instance::default();
    let other = gpu::Instance::default();
    let surface = headless(&other);

    let (callback, adapter) = gpu::oneshot();
    instance.request_adapter(
        &gpu::RequestAdapterOptions {
            compatible_surface: Some(&surface),
            ..Default::default()
        },
        callback,
    );
    instance.process_events();
    assert!(matches!(
        pollster::block_on(adapter),
        Err(gpu::RequestAdapterError::Error(_))
    ));

    let surface = headless(&instance);
    assert!(request(
        &instance,
        &gpu::RequestAdapterOptions {
            compatible_surface: Some(&surface),
            ..Default::default()
        },
    )
    .is_ok());
}

#[test]
fn swap_chain_hands_out_one_frame_until_present() {
    common::init_logging();
    let instance = gpu::Instance::default();
    let surface = headless(&instance);
    let device = instance
        .enumerate_adapters()
        .remove(0)
        .create_device(&Default::default())
        .unwrap();
    let errors = common::capture_errors(&device);
    let swap_chain = device.create_swap_chain(&surface, &swap_chain_desc(64));

    let first = swap_chain.get_current_texture_view();
    let again = swap_chain.get_current_texture_view();
    assert!(first.is_valid());
    assert_eq!(first.key(), again.key());

    let encoder = device.create_command_encoder(&Default::default());
    let attachments = [Some(common::clear_to(&first, gpu::Color::BLACK))];
    encoder.begin_render_pass(&common::color_pass(&attachments)).end();
    common::submit(&device, &encoder);
    swap_chain.present();
    assert_eq!(swap_chain.presented_count(), 1);

    let next = swap_chain.get_current_texture_view();
    assert_ne!(next.key(), first.key());
    assert!(errors.lock().unwrap().is_empty());
}

#[test]
fn presenting_without_a_frame_is_an_error() {
    common::init_logging();
    let instance = gpu::Instance::default();
    let surface = headless(&instance);
    let device = instance
        .enumerate_adapters()
        .remove(0)
        .create_device(&Default::default())
        .unwrap();
    let errors = common::capture_errors(&device);
    let swap_chain = device.create_swap_chain(&surface, &swap_chain_desc(64));
    swap_chain.present();
    assert_eq!(errors.lock().unwrap().len(), 1);
    assert_eq!(swap_chain.presented_count(), 0);
}

#[test]
fn unconfigured_swap_chain_hands_out_invalid_views() {
    common::init_logging();
    let instance = gpu::Instance::default();
    let surface = headless(&instance);
    let device = instance
        .enumerate_adapters()
        .remove(0)
        .create_device(&Default::default())
        .unwrap();
    let errors = common::capture_errors(&device);
    let swap_chain = device.create_swap_chain(&surface, &swap_chain_desc(0));
    assert_eq!(errors.lock().unwrap().len(), 1);
    assert!(!swap_chain.get_current_texture_view().is_valid());
    assert_eq!(errors.lock().unwrap().len(), 2);

    swap_chain.configure(&swap_chain_desc(32));
    assert!(swap_chain.get_current_texture_view().is_valid());
    assert_eq!(errors.lock().unwrap().len(), 2);
}

#[test]
fn error_handlers_may_use_the_swap_chain() {
    common::init_logging();
    let instance = gpu::Instance::new(&gpu::InstanceDesc {
        adapters: vec![gpu::AdapterDesc {
            memory_budget: 1024,
            ..gpu::AdapterDesc::software()
        }],
    });
    let surface = headless(&instance);
    let device = instance
        .enumerate_adapters()
        .remove(0)
        .create_device(&Default::default())
        .unwrap();
    let swap_chain = Arc::new(device.create_swap_chain(&surface, &swap_chain_desc(64)));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let (sink, chain) = (Arc::clone(&seen), Arc::clone(&swap_chain));
    device.on_uncaptured_error(move |error| {
        sink.lock()
            .unwrap()
            .push((error.error_type(), chain.presented_count()));
    });

    assert!(!swap_chain.get_current_texture_view().is_valid());
    let seen = seen.lock().unwrap();
    assert_eq!(seen.first(), Some(&(gpu::ErrorType::OutOfMemory, 0)));
}
