//! Reference-counted slots keyed by generational slotmap keys.

use slotmap::{Key, SlotMap};

use crate::HandleError;

/// Behavior shared by everything stored in a [`Registry`].
pub(crate) trait HubEntry {
    /// Objects can become unusable while their slot stays alive (e.g. a
    /// shader module that failed to compile).
    fn is_valid(&self) -> bool {
        true
    }
    /// Other hub objects this entry holds a reference on.
    fn dependencies(&self) -> Vec<crate::AnyKey> {
        Vec::new()
    }
    /// Bytes charged against the adapter memory budget.
    fn memory(&self) -> u64 {
        0
    }
}

pub(crate) struct Slot<T> {
    refs: u32,
    label: String,
    /// `None` for error objects.
    value: Option<T>,
}

pub(crate) enum Released<T> {
    Alive,
    /// Last reference dropped. Carries the value unless it was an error object.
    Freed(Option<T>),
    /// The key no longer refers to a slot.
    Stale,
}

pub(crate) struct Registry<K: Key, T> {
    kind: &'static str,
    slots: SlotMap<K, Slot<T>>,
}

impl<K: Key, T: HubEntry> Registry<K, T> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            slots: SlotMap::with_key(),
        }
    }

    pub fn insert(&mut self, label: &str, value: T) -> K {
        self.slots.insert(Slot {
            refs: 1,
            label: label.to_string(),
            value: Some(value),
        })
    }

    pub fn insert_error(&mut self, label: &str) -> K {
        self.slots.insert(Slot {
            refs: 1,
            label: label.to_string(),
            value: None,
        })
    }

    pub fn get(&self, key: K) -> Result<&T, HandleError> {
        match self.slots.get(key) {
            None => Err(HandleError::Released),
            Some(&Slot {
                value: Some(ref value),
                ..
            }) if value.is_valid() => Ok(value),
            Some(_) => Err(HandleError::Invalid),
        }
    }

    pub fn get_mut(&mut self, key: K) -> Result<&mut T, HandleError> {
        match self.slots.get_mut(key) {
            None => Err(HandleError::Released),
            Some(&mut Slot {
                value: Some(ref mut value),
                ..
            }) if value.is_valid() => Ok(value),
            Some(_) => Err(HandleError::Invalid),
        }
    }

    pub fn is_valid(&self, key: K) -> bool {
        self.get(key).is_ok()
    }

    /// Reads a stored value even if it reports itself invalid.
    pub fn peek(&self, key: K) -> Option<&T> {
        self.slots.get(key).and_then(|slot| slot.value.as_ref())
    }

    /// Moves the value out so it can be mutated alongside other registries.
    /// Must be paired with [`Registry::restore`].
    pub fn take(&mut self, key: K) -> Result<T, HandleError> {
        let slot = self.slots.get_mut(key).ok_or(HandleError::Released)?;
        match slot.value.take() {
            Some(value) if value.is_valid() => Ok(value),
            other => {
                slot.value = other;
                Err(HandleError::Invalid)
            }
        }
    }

    pub fn restore(&mut self, key: K, value: T) {
        if let Some(slot) = self.slots.get_mut(key) {
            slot.value = Some(value);
        }
    }

    pub fn retain(&mut self, key: K) -> bool {
        match self.slots.get_mut(key) {
            Some(slot) => {
                slot.refs += 1;
                true
            }
            None => false,
        }
    }

    pub fn release(&mut self, key: K) -> Released<T> {
        let Some(slot) = self.slots.get_mut(key) else {
            return Released::Stale;
        };
        slot.refs -= 1;
        if slot.refs != 0 {
            return Released::Alive;
        }
        match self.slots.remove(key) {
            Some(slot) => Released::Freed(slot.value),
            None => Released::Stale,
        }
    }

    #[cfg(test)]
    pub fn ref_count(&self, key: K) -> u32 {
        self.slots.get(key).map_or(0, |slot| slot.refs)
    }

    pub fn set_label(&mut self, key: K, label: &str) {
        if let Some(slot) = self.slots.get_mut(key) {
            slot.label = label.to_string();
        }
    }

    pub fn label(&self, key: K) -> String {
        self.slots
            .get(key)
            .map(|slot| slot.label.clone())
            .unwrap_or_default()
    }

    /// Names the object in error messages: `[Buffer "label"]`.
    pub fn describe(&self, key: K) -> String {
        match self.slots.get(key) {
            Some(slot) if !slot.label.is_empty() => format!("[{} \"{}\"]", self.kind, slot.label),
            _ => format!("[{}]", self.kind),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }
}

/// Object created by, and only usable with, one device.
pub(crate) trait DeviceChild {
    fn same_device(&self, shared: &std::sync::Arc<crate::device::DeviceShared>) -> bool;
}

/// Declares an owning handle to an object stored in the device hub.
///
/// The handle is not `Clone`: a second owner comes from `reference()`, and
/// dropping the handle releases its reference.
macro_rules! resource_handle {
    ($(#[$meta:meta])* $name:ident, $key:ident, $field:ident) => {
        $(#[$meta])*
        pub struct $name {
            pub(crate) shared: std::sync::Arc<$crate::device::DeviceShared>,
            pub(crate) key: $crate::$key,
        }

        impl $name {
            pub(crate) fn from_parts(
                shared: &std::sync::Arc<$crate::device::DeviceShared>,
                key: $crate::$key,
            ) -> Self {
                Self {
                    shared: std::sync::Arc::clone(shared),
                    key,
                }
            }

            /// Returns a new owner of the same object.
            pub fn reference(&self) -> Self {
                self.shared.hub.write().unwrap().$field.retain(self.key);
                Self::from_parts(&self.shared, self.key)
            }

            /// Drops this owner. The object is freed once every owner is released.
            pub fn release(self) {}

            pub fn set_label(&self, label: &str) {
                self.shared.hub.write().unwrap().$field.set_label(self.key, label);
            }

            pub fn label(&self) -> String {
                self.shared.hub.read().unwrap().$field.label(self.key)
            }

            /// False for error objects and for objects of a lost device.
            pub fn is_valid(&self) -> bool {
                !self.shared.is_lost() && self.shared.hub.read().unwrap().$field.is_valid(self.key)
            }

            pub fn key(&self) -> $crate::$key {
                self.key
            }
        }

        impl $crate::handle::DeviceChild for $name {
            fn same_device(&self, shared: &std::sync::Arc<$crate::device::DeviceShared>) -> bool {
                std::sync::Arc::ptr_eq(&self.shared, shared)
            }
        }

        impl Drop for $name {
            fn drop(&mut self) {
                self.shared.release_key($crate::AnyKey::from(self.key));
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("key", &self.key)
                    .finish()
            }
        }
    };
}

pub(crate) use resource_handle;

#[cfg(test)]
mod tests {
    use super::*;

    slotmap::new_key_type! {
        struct TestKey;
    }

    struct Blob(bool);

    impl HubEntry for Blob {
        fn is_valid(&self) -> bool {
            self.0
        }
    }

    #[test]
    fn last_release_frees_the_slot() {
        let mut registry = Registry::<TestKey, Blob>::new("Blob");
        let key = registry.insert("a", Blob(true));
        assert!(registry.retain(key));
        assert_eq!(registry.ref_count(key), 2);
        assert!(matches!(registry.release(key), Released::Alive));
        assert!(matches!(registry.release(key), Released::Freed(Some(_))));
        assert_eq!(registry.get(key).err(), Some(HandleError::Released));
        assert!(matches!(registry.release(key), Released::Stale));
        assert!(!registry.retain(key));
    }

    #[test]
    fn error_objects_are_invalid() {
        let mut registry = Registry::<TestKey, Blob>::new("Blob");
        let error = registry.insert_error("broken");
        let unusable = registry.insert("", Blob(false));
        assert_eq!(registry.get(error).err(), Some(HandleError::Invalid));
        assert_eq!(registry.get(unusable).err(), Some(HandleError::Invalid));
        assert_eq!(registry.take(unusable).err(), Some(HandleError::Invalid));
        assert!(registry.slots.get(unusable).unwrap().value.is_some());
        assert_eq!(registry.describe(error), "[Blob \"broken\"]");
        assert_eq!(registry.describe(unusable), "[Blob]");
    }

    #[test]
    fn take_and_restore() {
        let mut registry = Registry::<TestKey, Blob>::new("Blob");
        let key = registry.insert("", Blob(true));
        let value = registry.take(key).unwrap();
        assert_eq!(registry.get(key).err(), Some(HandleError::Invalid));
        registry.restore(key, value);
        assert!(registry.is_valid(key));
    }
}
