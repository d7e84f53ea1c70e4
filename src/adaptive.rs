//! Live-tunable values shared between a component and whoever operates it.
//!
//! The rate limiter keeps its `limit` here so operators can raise or lower it
//! without rebuilding the limiter or dropping its windows.

use arc_swap::ArcSwap;
use std::sync::Arc;

/// Shared handle to a value that can be swapped while readers keep reading.
///
/// Clones point at the same slot. Reads never block writers.
#[derive(Debug)]
pub struct DynamicConfig<T> {
    slot: Arc<ArcSwap<T>>,
}

impl<T> Clone for DynamicConfig<T> {
    fn clone(&self) -> Self {
        Self { slot: Arc::clone(&self.slot) }
    }
}

impl<T> DynamicConfig<T> {
    pub fn new(value: T) -> Self {
        Self { slot: Arc::new(ArcSwap::from_pointee(value)) }
    }

    /// Snapshot the current value.
    pub fn get(&self) -> Arc<T> {
        self.slot.load_full()
    }

    /// Replace the value.
    pub fn set(&self, value: T) {
        self.slot.store(Arc::new(value));
    }

    /// Derive the next value from the current one.
    ///
    /// Uses compare-and-swap, so concurrent updates are not lost.
    pub fn update<F>(&self, f: F)
    where
        F: Fn(&T) -> T,
    {
        let _previous = self.slot.rcu(|current| Arc::new(f(&**current)));
    }
}

impl<T: Copy> DynamicConfig<T> {
    /// Copy the current value out.
    pub fn load(&self) -> T {
        **self.slot.load()
    }
}
