//! Single-slot event listener registry.
//!
//! Each event kind holds at most one callback. Registering a second one is a
//! usage error; remove the first to replace it.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::error::{Error, Result};

// ============================================================================
// Types
// ============================================================================

/// Registered callback.
pub type Listener<E> = Arc<dyn Fn(E) + Send + Sync + 'static>;

/// An event kind usable as a slot key.
pub trait EventKey: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    /// Name used in errors and logs.
    fn name(&self) -> &'static str;
}

struct Slot<E> {
    callback: Listener<E>,
    once: bool,
}

// ============================================================================
// Listeners
// ============================================================================

/// One callback slot per event kind.
pub struct Listeners<K, E> {
    slots: Mutex<FxHashMap<K, Slot<E>>>,
}

impl<K, E> Default for Listeners<K, E> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(FxHashMap::default()),
        }
    }
}

impl<K: EventKey, E> fmt::Debug for Listeners<K, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.slots.lock();
        f.debug_set().entries(slots.keys()).finish()
    }
}

impl<K: EventKey, E> Listeners<K, E> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a persistent callback.
    ///
    /// # Errors
    ///
    /// - [`Error::DuplicateListener`] if the slot is taken
    pub fn on(&self, kind: K, callback: Listener<E>) -> Result<()> {
        self.insert(kind, callback, false)
    }

    /// Registers a callback removed after its first call.
    ///
    /// # Errors
    ///
    /// - [`Error::DuplicateListener`] if the slot is taken
    pub fn once(&self, kind: K, callback: Listener<E>) -> Result<()> {
        self.insert(kind, callback, true)
    }

    /// Empties one slot. Returns `true` if it held a callback.
    pub fn remove(&self, kind: K) -> bool {
        self.slots.lock().remove(&kind).is_some()
    }

    /// Empties every slot.
    pub fn clear(&self) {
        self.slots.lock().clear();
    }

    /// Returns `true` if the slot holds a callback.
    #[must_use]
    pub fn has(&self, kind: K) -> bool {
        self.slots.lock().contains_key(&kind)
    }

    /// Invokes the callback for `kind`, if any. Returns `true` if one ran.
    ///
    /// The callback runs outside the registry lock, so it may register or
    /// remove listeners itself.
    pub fn emit(&self, kind: K, event: E) -> bool {
        let callback = {
            let mut slots = self.slots.lock();
            match slots.get(&kind) {
                Some(slot) if slot.once => slots.remove(&kind).map(|slot| slot.callback),
                Some(slot) => Some(Arc::clone(&slot.callback)),
                None => None,
            }
        };

        match callback {
            Some(callback) => {
                callback(event);
                true
            }
            None => {
                trace!(event = kind.name(), "No listener registered");
                false
            }
        }
    }

    fn insert(&self, kind: K, callback: Listener<E>, once: bool) -> Result<()> {
        let mut slots = self.slots.lock();
        if slots.contains_key(&kind) {
            return Err(Error::duplicate_listener_named(kind.name()));
        }
        slots.insert(kind, Slot { callback, once });
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
