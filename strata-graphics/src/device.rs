//! Device and queue.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex, RwLock,
    },
    time::Instant,
};

use crate::{
    completion::{CompletionQueue, Job, Outcome},
    error::{ErrorSink, Routed},
    hub::Hub,
    AdapterProperties, AnyKey, DeviceLostReason, Error, ErrorFilter, ErrorType, Features, Limits,
    LoggingType, PopErrorScopeError, QueueWorkDoneError, Toggles,
};

type LostCallback = Box<dyn FnOnce(DeviceLostReason, &str) + Send>;
type LoggingCallback = Arc<dyn Fn(LoggingType, &str) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    lost: Option<LostCallback>,
    logging: Option<LoggingCallback>,
}

/// State shared by a device, its queue and every object created from it.
pub(crate) struct DeviceShared {
    pub(crate) adapter: AdapterProperties,
    pub(crate) features: Features,
    pub(crate) limits: Limits,
    pub(crate) toggles: Toggles,
    pub(crate) memory_budget: u64,
    pub(crate) hub: RwLock<Hub>,
    errors: Mutex<ErrorSink>,
    completions: Mutex<CompletionQueue>,
    callbacks: Mutex<Callbacks>,
    label: Mutex<String>,
    queue_label: Mutex<String>,
    lost: AtomicBool,
    /// Explicit references held by `Device` handles only.
    refs: AtomicU32,
    epoch: Instant,
}

pub(crate) struct DeviceConfig {
    pub adapter: AdapterProperties,
    pub features: Features,
    pub limits: Limits,
    pub toggles: Toggles,
    pub memory_budget: u64,
    pub label: String,
    pub queue_label: String,
}

impl DeviceShared {
    pub(crate) fn new(config: DeviceConfig) -> Arc<Self> {
        Arc::new(Self {
            adapter: config.adapter,
            features: config.features,
            limits: config.limits,
            toggles: config.toggles,
            memory_budget: config.memory_budget,
            hub: RwLock::new(Hub::new()),
            errors: Mutex::new(ErrorSink::default()),
            completions: Mutex::new(CompletionQueue::default()),
            callbacks: Mutex::new(Callbacks::default()),
            label: Mutex::new(config.label),
            queue_label: Mutex::new(config.queue_label),
            lost: AtomicBool::new(false),
            refs: AtomicU32::new(1),
            epoch: Instant::now(),
        })
    }

    pub(crate) fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    pub(crate) fn skips_validation(&self) -> bool {
        self.toggles.contains(Toggles::SKIP_VALIDATION)
    }

    pub(crate) fn release_key(&self, key: AnyKey) {
        // Keys of a lost device point into the hub that was torn down.
        if self.is_lost() {
            return;
        }
        // Drop may run while unwinding from a poisoned lock.
        if let Ok(mut hub) = self.hub.write() {
            hub.release(key);
        }
    }

    /// Routes an error to the innermost matching scope, or to the
    /// uncaptured-error handler. Errors of a lost device are dropped.
    pub(crate) fn report(&self, error: Error) {
        if self.is_lost() {
            log::debug!("Dropping error on lost device: {}", error);
            return;
        }
        let routed = self.errors.lock().unwrap().route(error);
        match routed {
            Routed::Captured => {}
            Routed::Uncaptured(error, Some(handler)) => handler(&error),
            Routed::Uncaptured(error, None) => {
                let label = self.label.lock().unwrap().clone();
                log::error!("Uncaptured error on device '{}': {}", label, error);
            }
        }
    }

    pub(crate) fn validation(&self, message: impl Into<String>) {
        self.report(Error::Validation(message.into()))
    }

    /// Emits a line through `log` and the device logging callback.
    pub(crate) fn log(&self, ty: LoggingType, message: &str) {
        log::log!(ty.level(), "{}", message);
        let callback = self.callbacks.lock().unwrap().logging.clone();
        if let Some(callback) = callback {
            callback(ty, message);
        }
    }

    pub(crate) fn enqueue(&self, job: Job) {
        self.completions.lock().unwrap().push(job);
    }

    /// Records a new submission serial.
    pub(crate) fn advance_serial(&self) -> u64 {
        self.completions.lock().unwrap().advance()
    }

    /// Nanoseconds since the device was created.
    pub(crate) fn timestamp(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    pub(crate) fn tick(&self) -> usize {
        let jobs = self.completions.lock().unwrap().take_all();
        let count = jobs.len();
        for job in jobs {
            // An earlier callback of this batch may have destroyed the device.
            let outcome = if self.is_lost() {
                Outcome::Lost
            } else {
                Outcome::Ready
            };
            job(outcome);
        }
        count
    }

    /// Marks the device lost, fires every pending callback, then tears the hub down.
    pub(crate) fn lose(&self, reason: DeviceLostReason, message: &str) {
        if self.lost.swap(true, Ordering::AcqRel) {
            return;
        }
        let jobs = self.completions.lock().unwrap().take_all();
        log::info!(
            "Device '{}' lost ({:?}): {}, failing {} pending callbacks",
            self.label.lock().unwrap(),
            reason,
            message,
            jobs.len()
        );
        for job in jobs {
            job(Outcome::Lost);
        }
        let callback = self.callbacks.lock().unwrap().lost.take();
        match callback {
            Some(callback) => callback(reason, message),
            None if reason == DeviceLostReason::Undefined => {
                log::error!("Device lost: {}", message);
            }
            None => {}
        }
        self.errors.lock().unwrap().clear();
        let hub = std::mem::replace(&mut *self.hub.write().unwrap(), Hub::new());
        log::debug!("Freed {} objects on device teardown", hub.object_count());
    }
}

//=============================================================================
// Device
//=============================================================================

/// Owns a queue, a hub of live objects, the error scopes and the pending callbacks.
///
/// Devices are counted explicitly: [`Device::reference`] adds an owner and the
/// last owner to be dropped destroys the device. Objects created from the
/// device do not keep it alive.
pub struct Device {
    pub(crate) shared: Arc<DeviceShared>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("label", &self.label())
            .field("lost", &self.is_lost())
            .finish()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if self.shared.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shared
                .lose(DeviceLostReason::Destroyed, "last device reference released");
        }
    }
}

impl Device {
    pub(crate) fn from_shared(shared: Arc<DeviceShared>) -> Self {
        Self { shared }
    }

    pub fn reference(&self) -> Self {
        self.shared.refs.fetch_add(1, Ordering::AcqRel);
        Self {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn release(self) {}

    pub fn set_label(&self, label: &str) {
        *self.shared.label.lock().unwrap() = label.to_string();
    }

    pub fn label(&self) -> String {
        self.shared.label.lock().unwrap().clone()
    }

    pub fn adapter_properties(&self) -> &AdapterProperties {
        &self.shared.adapter
    }

    pub fn features(&self) -> Features {
        self.shared.features
    }

    pub fn has_feature(&self, feature: Features) -> bool {
        self.shared.features.contains(feature)
    }

    pub fn limits(&self) -> &Limits {
        &self.shared.limits
    }

    pub fn toggles(&self) -> Toggles {
        self.shared.toggles
    }

    pub fn is_lost(&self) -> bool {
        self.shared.is_lost()
    }

    /// Bytes of buffer and texture storage currently allocated.
    pub fn memory_used(&self) -> u64 {
        self.shared.hub.read().unwrap().memory_used
    }

    pub fn queue(&self) -> Queue {
        Queue {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Completes submitted work and delivers every callback that became ready,
    /// in registration order. Returns how many callbacks ran.
    #[profiling::function]
    pub fn tick(&self) -> usize {
        self.shared.tick()
    }

    pub fn push_error_scope(&self, filter: ErrorFilter) {
        self.shared.errors.lock().unwrap().push_scope(filter);
    }

    /// Pops the innermost error scope. The callback receives the first error it
    /// captured, if any, on the next tick.
    pub fn pop_error_scope(
        &self,
        callback: impl FnOnce(Result<Option<Error>, PopErrorScopeError>) + Send + 'static,
    ) {
        let result = if self.is_lost() {
            Err(PopErrorScopeError::DeviceLost)
        } else {
            self.shared.errors.lock().unwrap().pop_scope()
        };
        self.shared.enqueue(Box::new(move |outcome| {
            callback(match outcome {
                Outcome::Ready => result,
                Outcome::Lost => Err(PopErrorScopeError::DeviceLost),
            })
        }));
    }

    /// Installs the handler for errors no scope captured. Replaces the default
    /// `log::error!` line.
    pub fn on_uncaptured_error(&self, handler: impl Fn(&Error) + Send + Sync + 'static) {
        self.shared
            .errors
            .lock()
            .unwrap()
            .set_uncaptured_handler(Some(Arc::new(handler)));
    }

    pub fn set_device_lost_callback(
        &self,
        callback: impl FnOnce(DeviceLostReason, &str) + Send + 'static,
    ) {
        if self.is_lost() {
            self.shared.enqueue(Box::new(move |_| {
                callback(DeviceLostReason::Undefined, "device was already lost")
            }));
        } else {
            self.shared.callbacks.lock().unwrap().lost = Some(Box::new(callback));
        }
    }

    pub fn set_logging_callback(&self, callback: impl Fn(LoggingType, &str) + Send + Sync + 'static) {
        self.shared.callbacks.lock().unwrap().logging = Some(Arc::new(callback));
    }

    /// Reports an error of the given type as if the implementation raised it.
    pub fn inject_error(&self, ty: ErrorType, message: &str) {
        match ty {
            ErrorType::Validation => self.shared.report(Error::Validation(message.to_string())),
            ErrorType::OutOfMemory => self.shared.report(Error::OutOfMemory(message.to_string())),
            ErrorType::Internal => self.shared.report(Error::Internal(message.to_string())),
            ErrorType::DeviceLost => self.shared.lose(DeviceLostReason::Undefined, message),
            ErrorType::Unknown => self
                .shared
                .validation(format!("cannot inject an error of type {:?}", ty)),
        }
    }

    pub fn lose_for_testing(&self) {
        self.shared
            .lose(DeviceLostReason::Undefined, "device lost for testing");
    }

    /// Destroys the device now: every pending callback fires with a
    /// device-lost status before this returns, and all objects become invalid.
    pub fn destroy(&self) {
        self.shared.lose(DeviceLostReason::Destroyed, "device destroyed");
    }
}

//=============================================================================
// Queue
//=============================================================================

/// The default queue of a device.
pub struct Queue {
    pub(crate) shared: Arc<DeviceShared>,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue").field("label", &self.label()).finish()
    }
}

impl Queue {
    pub fn reference(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn release(self) {}

    pub fn set_label(&self, label: &str) {
        *self.shared.queue_label.lock().unwrap() = label.to_string();
    }

    pub fn label(&self) -> String {
        self.shared.queue_label.lock().unwrap().clone()
    }

    /// Calls back once all work submitted so far has completed.
    pub fn on_submitted_work_done(
        &self,
        callback: impl FnOnce(Result<(), QueueWorkDoneError>) + Send + 'static,
    ) {
        self.shared.enqueue(Box::new(move |outcome| {
            callback(match outcome {
                Outcome::Ready => Ok(()),
                Outcome::Lost => Err(QueueWorkDoneError::DeviceLost),
            })
        }));
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    pub(crate) fn test_shared() -> Arc<DeviceShared> {
        DeviceShared::new(DeviceConfig {
            adapter: crate::AdapterDesc::software().properties,
            features: Features::empty(),
            limits: Limits::default(),
            toggles: Toggles::empty(),
            memory_budget: 1 << 20,
            label: "test".to_string(),
            queue_label: String::new(),
        })
    }

    #[test]
    fn losing_fails_pending_jobs_once() {
        let shared = test_shared();
        let lost = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let lost = Arc::clone(&lost);
            shared.enqueue(Box::new(move |outcome| {
                if let Outcome::Lost = outcome {
                    lost.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        shared.lose(DeviceLostReason::Destroyed, "test");
        shared.lose(DeviceLostReason::Destroyed, "again");
        assert_eq!(lost.load(Ordering::SeqCst), 3);
        assert_eq!(shared.tick(), 0);
    }

    #[test]
    fn timestamps_increase() {
        let shared = test_shared();
        let a = shared.timestamp();
        let b = shared.timestamp();
        assert!(b >= a);
    }
}
