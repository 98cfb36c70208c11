//! Generation-checked object registry.
//!
//! [`Registry`] owns scene objects and hands out copyable [`Handle`]s. A handle carries the
//! version of its slot, so once an object is removed every handle to it stops resolving,
//! even after the slot is reused.
//!
//! # Example
//!
//! ```
//! use frameline_scene::Registry;
//!
//! let mut objects = Registry::new();
//! let a = objects.insert("cube");
//! assert_eq!(objects.get(a), Some(&"cube"));
//!
//! objects.remove(a);
//! assert!(objects.get(a).is_none());
//! ```

use slotmap::{SlotMap, new_key_type};

new_key_type! {
    /// Reference to an object in a [`Registry`].
    pub struct Handle;
}

/// Object storage with generation-checked handles.
#[derive(Debug)]
pub struct Registry<T> {
    objects: SlotMap<Handle, T>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self {
            objects: SlotMap::with_key(),
        }
    }

    pub fn insert(&mut self, value: T) -> Handle {
        self.objects.insert(value)
    }

    /// Removes and returns the object, or `None` if the handle is stale.
    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        self.objects.remove(handle)
    }

    #[inline]
    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.objects.get(handle)
    }

    #[inline]
    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        self.objects.get_mut(handle)
    }

    #[inline]
    pub fn contains(&self, handle: Handle) -> bool {
        self.objects.contains_key(handle)
    }

    /// Number of live objects.
    #[inline]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Live objects. The order is stable while the registry is not modified.
    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.objects.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Handle, &mut T)> {
        self.objects.iter_mut()
    }
}
