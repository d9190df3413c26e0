//! Instance and adapters.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use crate::{
    completion::{Job, Outcome},
    device::{Device, DeviceConfig, DeviceShared},
    AdapterDesc, AdapterProperties, AdapterType, DeviceDesc, Features, InstanceDesc, Limits,
    PowerPreference, RequestAdapterError, RequestAdapterOptions, RequestDeviceError, Surface,
    SurfaceDesc, Toggles,
};

pub(crate) struct InstanceShared {
    injected: Vec<AdapterDesc>,
    /// Filled on the first request.
    adapters: Mutex<Option<Vec<Arc<AdapterDesc>>>>,
    events: Mutex<VecDeque<Job>>,
}

impl InstanceShared {
    fn adapters(&self) -> Vec<Arc<AdapterDesc>> {
        let mut adapters = self.adapters.lock().unwrap();
        adapters
            .get_or_insert_with(|| {
                let descs = if self.injected.is_empty() {
                    vec![AdapterDesc::software()]
                } else {
                    self.injected.clone()
                };
                for desc in descs.iter() {
                    log::info!(
                        "Discovered adapter '{}' ({:?}, {:?})",
                        desc.properties.name,
                        desc.properties.adapter_type,
                        desc.properties.backend_type
                    );
                }
                descs.into_iter().map(Arc::new).collect()
            })
            .clone()
    }

    fn enqueue(&self, job: Job) {
        self.events.lock().unwrap().push_back(job);
    }
}

impl Drop for InstanceShared {
    fn drop(&mut self) {
        let events = std::mem::take(self.events.get_mut().unwrap());
        for job in events {
            job(Outcome::Lost);
        }
    }
}

/// Process-wide root object. Owns the adapter list.
pub struct Instance {
    pub(crate) shared: Arc<InstanceShared>,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance").finish_non_exhaustive()
    }
}

impl Default for Instance {
    fn default() -> Self {
        Self::new(&InstanceDesc::default())
    }
}

fn preference_rank(preference: PowerPreference, ty: AdapterType) -> u32 {
    let order: [AdapterType; 4] = match preference {
        PowerPreference::Undefined => return 0,
        PowerPreference::HighPerformance => [
            AdapterType::DiscreteGpu,
            AdapterType::IntegratedGpu,
            AdapterType::Cpu,
            AdapterType::Unknown,
        ],
        PowerPreference::LowPower => [
            AdapterType::IntegratedGpu,
            AdapterType::DiscreteGpu,
            AdapterType::Cpu,
            AdapterType::Unknown,
        ],
    };
    order.iter().position(|&t| t == ty).unwrap_or(order.len()) as u32
}

impl Instance {
    pub fn new(desc: &InstanceDesc) -> Self {
        Self {
            shared: Arc::new(InstanceShared {
                injected: desc.adapters.clone(),
                adapters: Mutex::new(None),
                events: Mutex::new(VecDeque::new()),
            }),
        }
    }

    pub fn reference(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn release(self) {}

    pub fn enumerate_adapters(&self) -> Vec<Adapter> {
        self.shared
            .adapters()
            .into_iter()
            .map(|desc| Adapter {
                desc,
                instance: Arc::clone(&self.shared),
            })
            .collect()
    }

    fn select_adapter(
        &self,
        options: &RequestAdapterOptions,
    ) -> Result<Arc<AdapterDesc>, RequestAdapterError> {
        if let Some(surface) = options.compatible_surface {
            if !surface.belongs_to(&self.shared) {
                return Err(RequestAdapterError::Error(
                    "compatible surface was created by another instance".to_string(),
                ));
            }
        }
        let mut candidates: Vec<_> = self
            .shared
            .adapters()
            .into_iter()
            .filter(|desc| {
                options
                    .backend_type
                    .map_or(true, |backend| desc.properties.backend_type == backend)
            })
            .filter(|desc| {
                !options.force_fallback_adapter
                    || desc.properties.adapter_type == AdapterType::Cpu
            })
            .collect();
        candidates.sort_by_key(|desc| {
            preference_rank(options.power_preference, desc.properties.adapter_type)
        });
        candidates
            .into_iter()
            .next()
            .ok_or(RequestAdapterError::Unavailable)
    }

    /// Picks an adapter matching `options`. The callback runs on the next
    /// [`Instance::process_events`].
    pub fn request_adapter(
        &self,
        options: &RequestAdapterOptions,
        callback: impl FnOnce(Result<Adapter, RequestAdapterError>) + Send + 'static,
    ) {
        let selected = self.select_adapter(options);
        let instance = Arc::downgrade(&self.shared);
        self.shared.enqueue(Box::new(move |outcome| {
            callback(match outcome {
                Outcome::Ready => match instance.upgrade() {
                    Some(instance) => selected.map(|desc| Adapter { desc, instance }),
                    None => Err(RequestAdapterError::InstanceDropped),
                },
                Outcome::Lost => Err(RequestAdapterError::InstanceDropped),
            })
        }));
    }

    /// Delivers pending instance-level callbacks. Returns how many ran.
    #[profiling::function]
    pub fn process_events(&self) -> usize {
        let events = std::mem::take(&mut *self.shared.events.lock().unwrap());
        let count = events.len();
        for job in events {
            job(Outcome::Ready);
        }
        count
    }

    pub fn create_surface(&self, desc: &SurfaceDesc) -> Surface {
        Surface::new(&self.shared, desc)
    }
}

//=============================================================================
// Adapter
//=============================================================================

/// A physical device exposed by an instance. Produces devices but does not own them.
pub struct Adapter {
    desc: Arc<AdapterDesc>,
    instance: Arc<InstanceShared>,
}

impl std::fmt::Debug for Adapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adapter")
            .field("name", &self.desc.properties.name)
            .finish()
    }
}

impl Adapter {
    pub fn reference(&self) -> Self {
        Self {
            desc: Arc::clone(&self.desc),
            instance: Arc::clone(&self.instance),
        }
    }

    pub fn release(self) {}

    pub fn properties(&self) -> &AdapterProperties {
        &self.desc.properties
    }

    pub fn features(&self) -> Features {
        self.desc.features
    }

    pub fn has_feature(&self, feature: Features) -> bool {
        self.desc.features.contains(feature)
    }

    pub fn limits(&self) -> &Limits {
        &self.desc.limits
    }

    fn parse_toggles(desc: &DeviceDesc) -> Result<Toggles, RequestDeviceError> {
        let lookup = |name: &str| {
            Toggles::from_toggle_name(name)
                .ok_or_else(|| RequestDeviceError::Error(format!("unknown toggle '{name}'")))
        };
        let mut toggles = Toggles::empty();
        for name in desc.force_enabled_toggles {
            toggles |= lookup(name)?;
        }
        for name in desc.force_disabled_toggles {
            toggles -= lookup(name)?;
        }
        Ok(toggles)
    }

    /// Creates a device synchronously.
    pub fn create_device(&self, desc: &DeviceDesc) -> Result<Device, RequestDeviceError> {
        let missing = desc.required_features - self.desc.features;
        if !missing.is_empty() {
            return Err(RequestDeviceError::Error(format!(
                "adapter '{}' does not support features {:?}",
                self.desc.properties.name, missing
            )));
        }
        let limits = match desc.required_limits {
            Some(limits) => {
                limits
                    .check_within(&self.desc.limits)
                    .map_err(RequestDeviceError::Error)?;
                limits.clone()
            }
            None => Limits::default(),
        };
        let toggles = Self::parse_toggles(desc)?;
        log::info!(
            "Creating device '{}' on '{}' with features {:?}, toggles {:?}",
            desc.label,
            self.desc.properties.name,
            desc.required_features,
            toggles
        );
        let shared = DeviceShared::new(DeviceConfig {
            adapter: self.desc.properties.clone(),
            features: desc.required_features,
            limits,
            toggles,
            memory_budget: self.desc.memory_budget,
            label: desc.label.to_string(),
            queue_label: desc.default_queue_label.to_string(),
        });
        Ok(Device::from_shared(shared))
    }

    /// Creates a device and hands it to the callback on the next
    /// [`Instance::process_events`] of the owning instance.
    pub fn request_device(
        &self,
        desc: &DeviceDesc,
        callback: impl FnOnce(Result<Device, RequestDeviceError>) + Send + 'static,
    ) {
        let result = self.create_device(desc);
        self.instance.enqueue(Box::new(move |outcome| {
            callback(match outcome {
                Outcome::Ready => result,
                Outcome::Lost => Err(RequestDeviceError::InstanceDropped),
            })
        }));
    }
}
