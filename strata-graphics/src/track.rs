//! Resources kept alive by encoders and command buffers.

use std::collections::HashSet;

use crate::{hub::Hub, AnyKey};

/// Set of objects referenced by recorded work. Each object is retained once,
/// no matter how many commands use it.
#[derive(Debug, Default)]
pub(crate) struct Tracker {
    keys: HashSet<AnyKey>,
}

impl Tracker {
    pub fn track(&mut self, hub: &mut Hub, key: impl Into<AnyKey>) {
        let key = key.into();
        if !self.keys.contains(&key) && hub.retain(key) {
            self.keys.insert(key);
        }
    }

    pub fn track_all(&mut self, hub: &mut Hub, keys: impl IntoIterator<Item = AnyKey>) {
        for key in keys {
            self.track(hub, key);
        }
    }

    /// Moves every key of `other` into `self`, dropping duplicate references.
    pub fn absorb(&mut self, hub: &mut Hub, other: Tracker) {
        for key in other.keys {
            if !self.keys.insert(key) {
                hub.release(key);
            }
        }
    }

    pub fn contains(&self, key: impl Into<AnyKey>) -> bool {
        self.keys.contains(&key.into())
    }

    pub fn keys(&self) -> impl Iterator<Item = AnyKey> + '_ {
        self.keys.iter().copied()
    }

    pub fn take(&mut self) -> Vec<AnyKey> {
        self.keys.drain().collect()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }
}
