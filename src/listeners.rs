//! Listener registries.
//!
//! A [`Listeners`] collection stores callbacks and hands out a
//! [`Subscription`] for each one. Callbacks are cloned out of the registry
//! before they run, so a callback may add or remove listeners (including
//! itself) without deadlocking.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

// ============================================================================
// Types
// ============================================================================

/// Listener callback type.
pub type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Registered callbacks in insertion order.
struct Registry<T> {
    next_id: u64,
    entries: Vec<(u64, Listener<T>)>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            next_id: 0,
            entries: Vec::new(),
        }
    }
}

// ============================================================================
// Listeners
// ============================================================================

/// A set of callbacks triggered with a shared argument.
pub struct Listeners<T> {
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }
}

impl<T: 'static> fmt::Debug for Listeners<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("len", &self.len())
            .finish()
    }
}

impl<T: 'static> Listeners<T> {
    /// Creates an empty registry.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a listener.
    ///
    /// The returned [`Subscription`] removes it again. Dropping the
    /// subscription without calling [`Subscription::unsubscribe`] keeps the
    /// listener registered.
    pub fn add<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = {
            let mut registry = self.registry.lock();
            let id = registry.next_id;
            registry.next_id += 1;
            let listener: Listener<T> = Arc::new(listener);
            registry.entries.push((id, listener));
            id
        };

        let registry: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.registry);
        Subscription::new(move || {
            if let Some(registry) = registry.upgrade() {
                registry.lock().entries.retain(|(entry_id, _)| *entry_id != id);
            }
        })
    }

    /// Calls every listener with `value`.
    pub fn trigger(&self, value: &T) {
        let listeners: Vec<Listener<T>> = self
            .registry
            .lock()
            .entries
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            listener(value);
        }
    }

    /// Removes every listener, then calls each removed listener with `value`.
    pub fn clear_and_trigger(&self, value: &T) {
        let listeners = std::mem::take(&mut self.registry.lock().entries);

        for (_, listener) in listeners {
            listener(value);
        }
    }

    /// Removes every listener.
    pub fn clear(&self) {
        self.registry.lock().entries.clear();
    }

    /// Returns the number of registered listeners.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.registry.lock().entries.len()
    }

    /// Returns `true` if no listener is registered.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Subscription
// ============================================================================

/// Handle returned when registering a listener.
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Creates a subscription running `remove` when unsubscribed.
    pub(crate) fn new<F>(remove: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            remove: Some(Box::new(remove)),
        }
    }

    /// Removes the listener.
    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.remove.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
