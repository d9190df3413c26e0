mod common;

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use strata_graphics as gpu;

fn pop_scope(device: &gpu::Device) -> Result<Option<gpu::Error>, gpu::PopErrorScopeError> {
    let (callback, popped) = gpu::oneshot();
    device.pop_error_scope(callback);
    device.tick();
    pollster::block_on(popped)
}

#[test]
fn scopes_capture_errors_before_the_uncaptured_handler() {
    let device = common::device();
    let uncaptured = common::capture_errors(&device);
    device.push_error_scope(gpu::ErrorFilter::Validation);
    device.inject_error(gpu::ErrorType::Validation, "first");
    device.inject_error(gpu::ErrorType::Validation, "second");

    let captured = pop_scope(&device).unwrap();
    assert_eq!(captured, Some(gpu::Error::Validation("first".to_string())));
    assert!(uncaptured.lock().unwrap().is_empty());
}

#[test]
fn unmatched_filters_fall_through_to_outer_scopes() {
    let device = common::device();
    let uncaptured = common::capture_errors(&device);
    device.push_error_scope(gpu::ErrorFilter::Internal);
    device.push_error_scope(gpu::ErrorFilter::OutOfMemory);
    device.inject_error(gpu::ErrorType::Internal, "deep");
    device.inject_error(gpu::ErrorType::Validation, "nobody");

    assert_eq!(pop_scope(&device), Ok(None));
    let outer = pop_scope(&device).unwrap().expect("internal error");
    assert_eq!(outer.error_type(), gpu::ErrorType::Internal);
    assert_eq!(outer.message(), "deep");

    let uncaptured = uncaptured.lock().unwrap();
    assert_eq!(*uncaptured, vec![gpu::Error::Validation("nobody".to_string())]);
}

#[test]
fn popping_an_empty_stack_fails() {
    let device = common::device();
    assert_eq!(pop_scope(&device), Err(gpu::PopErrorScopeError::EmptyStack));
}

#[test]
fn scope_results_wait_for_a_tick() {
    let device = common::device();
    device.push_error_scope(gpu::ErrorFilter::Validation);
    let (callback, popped) = gpu::oneshot();
    device.pop_error_scope(callback);
    assert!(!popped.is_ready());
    device.tick();
    assert_eq!(popped.try_take(), Some(Ok(None)));
}

#[test]
fn destroy_fails_every_pending_callback() {
    let device = common::device();
    let buffer = common::buffer(
        &device,
        64,
        gpu::BufferUsages::MAP_READ | gpu::BufferUsages::COPY_DST,
    );
    let lost = Arc::new(AtomicUsize::new(0));
    let count_lost = |lost: &Arc<AtomicUsize>| {
        let lost = Arc::clone(lost);
        move |failed: bool| {
            if failed {
                lost.fetch_add(1, Ordering::SeqCst);
            }
        }
    };

    let report = count_lost(&lost);
    buffer.map_async(gpu::MapMode::READ, 0, None, move |result| {
        report(result == Err(gpu::BufferMapError::DeviceLost))
    });
    for _ in 0..2 {
        let report = count_lost(&lost);
        device.queue().on_submitted_work_done(move |result| {
            report(result == Err(gpu::QueueWorkDoneError::DeviceLost))
        });
    }
    device.push_error_scope(gpu::ErrorFilter::Validation);
    let report = count_lost(&lost);
    device.pop_error_scope(move |result| {
        report(result == Err(gpu::PopErrorScopeError::DeviceLost))
    });

    let reason = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&reason);
    device.set_device_lost_callback(move |reason, _| *sink.lock().unwrap() = Some(reason));

    device.destroy();
    assert_eq!(lost.load(Ordering::SeqCst), 4);
    assert_eq!(*reason.lock().unwrap(), Some(gpu::DeviceLostReason::Destroyed));
    assert_eq!(device.tick(), 0);
}

#[test]
fn destroying_from_a_callback_fails_the_rest_of_the_batch() {
    let device = common::device();
    let owner = device.reference();
    let (callback, first) = gpu::oneshot();
    device.queue().on_submitted_work_done(move |result| {
        owner.destroy();
        callback(result);
    });
    let (callback, second) = gpu::oneshot();
    device.queue().on_submitted_work_done(callback);

    assert_eq!(device.tick(), 2);
    assert_eq!(first.try_take(), Some(Ok(())));
    assert_eq!(
        second.try_take(),
        Some(Err(gpu::QueueWorkDoneError::DeviceLost))
    );
    assert!(device.is_lost());
}

#[test]
fn callbacks_registered_after_loss_report_it() {
    let device = common::device();
    device.lose_for_testing();
    let (callback, done) = gpu::oneshot();
    device.queue().on_submitted_work_done(callback);
    device.tick();
    assert_eq!(
        pollster::block_on(done),
        Err(gpu::QueueWorkDoneError::DeviceLost)
    );

    let (callback, reason) = gpu::oneshot();
    device.set_device_lost_callback(move |reason, _| callback(reason));
    device.tick();
    assert_eq!(reason.try_take(), Some(gpu::DeviceLostReason::Undefined));
}

#[test]
fn lost_devices_stop_reporting_errors() {
    let device = common::device();
    let uncaptured = common::capture_errors(&device);
    device.inject_error(gpu::ErrorType::DeviceLost, "gone");
    assert!(device.is_lost());

    let buffer = device.create_buffer(&gpu::BufferDesc {
        label: "after",
        size: 16,
        usage: gpu::BufferUsages::empty(),
        mapped_at_creation: false,
    });
    device.inject_error(gpu::ErrorType::Validation, "ignored");
    assert!(!buffer.is_valid());
    assert!(uncaptured.lock().unwrap().is_empty());
}

#[test]
fn dropping_the_last_device_reference_destroys_it() {
    let device = common::device();
    let second = device.reference();
    let (callback, done) = gpu::oneshot();
    second.queue().on_submitted_work_done(callback);

    drop(device);
    assert!(!second.is_lost());
    let queue = second.queue();
    drop(second);
    assert!(done.is_ready());
    assert_eq!(
        pollster::block_on(done),
        Err(gpu::QueueWorkDoneError::DeviceLost)
    );
    drop(queue);
}

#[test]
fn error_messages_name_the_object() {
    let device = common::device();
    let uncaptured = common::capture_errors(&device);
    let encoder = device.create_command_encoder(&gpu::CommandEncoderDesc { label: "frame" });
    encoder.inject_validation_error("custom failure");
    let _ = encoder.finish(&Default::default());

    let uncaptured = uncaptured.lock().unwrap();
    assert_eq!(uncaptured.len(), 1);
    let message = uncaptured[0].message();
    assert!(message.contains("\"frame\""), "{}", message);
    assert!(message.contains("custom failure"), "{}", message);
}
