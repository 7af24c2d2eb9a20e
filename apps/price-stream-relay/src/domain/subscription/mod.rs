//! Subscription State
//!
//! Per-key bookkeeping shared by the lifecycle, poll loop, and fan-out:
//!
//! - the set of listeners registered for the key, keyed by identity
//! - the last value delivered to them (the value cache)
//!
//! A key's [`KeyState`] exists exactly while its session is open, so
//! dropping it purges both the listener set and the cached value at once.
//!
//! # Change detection
//!
//! [`KeyState::observe`] compares a fresh reading against the cache. Only a
//! differing reading updates the cache and yields the listeners to notify,
//! which keeps downstream traffic proportional to changes rather than polls.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;

use uuid::Uuid;

use super::price::PriceValue;

// =============================================================================
// Listener Identity
// =============================================================================

/// Identity under which a listener is registered.
///
/// Registration is idempotent per identity: the same id registered twice
/// still receives each change once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(Uuid);

impl ListenerId {
    /// Generate a fresh random identity.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }
}

impl Default for ListenerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// =============================================================================
// Listener Set
// =============================================================================

/// Identity-keyed set of listeners for one key.
#[derive(Debug)]
pub struct ListenerSet<L> {
    listeners: HashMap<ListenerId, L>,
}

impl<L> Default for ListenerSet<L> {
    fn default() -> Self {
        Self {
            listeners: HashMap::new(),
        }
    }
}

impl<L> ListenerSet<L> {
    /// Register a listener.
    ///
    /// Returns `false` (and keeps the existing registration) if the id is
    /// already present.
    pub fn insert(&mut self, id: ListenerId, listener: L) -> bool {
        match self.listeners.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(listener);
                true
            }
        }
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn remove(&mut self, id: &ListenerId) -> bool {
        self.listeners.remove(id).is_some()
    }

    /// Whether the id is registered.
    #[must_use]
    pub fn contains(&self, id: &ListenerId) -> bool {
        self.listeners.contains_key(id)
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    /// Whether no listener is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Registered identities.
    pub fn ids(&self) -> impl Iterator<Item = &ListenerId> {
        self.listeners.keys()
    }
}

impl<L: Clone> ListenerSet<L> {
    /// Copy out the current listeners so they can be notified without
    /// holding the lock that guards the set.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(ListenerId, L)> {
        self.listeners
            .iter()
            .map(|(id, listener)| (*id, listener.clone()))
            .collect()
    }
}

// =============================================================================
// Key State
// =============================================================================

/// Outcome of registering a listener on an open key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Join {
    /// Newly registered; carries the cached value to replay, if any.
    Joined {
        /// Value to hand to the new listener immediately.
        replay: Option<PriceValue>,
    },
    /// Identity was already registered; nothing changed.
    AlreadyJoined,
}

/// Outcome of removing a listener from an open key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leave {
    /// The identity was not registered.
    NotRegistered,
    /// Removed; other listeners remain.
    Remaining(usize),
    /// Removed the last listener; the session must be torn down.
    LastListenerLeft,
}

/// Result of comparing a reading against the cache.
#[derive(Debug)]
pub enum Observation<L> {
    /// Reading equals the cached value; nothing to deliver.
    Unchanged,
    /// Reading differs; the cache now holds it.
    Changed {
        /// The new value.
        value: PriceValue,
        /// Listeners registered at the moment of the change.
        listeners: Vec<(ListenerId, L)>,
    },
}

/// Listener set and value cache of one open key.
#[derive(Debug)]
pub struct KeyState<L> {
    listeners: ListenerSet<L>,
    cached: Option<PriceValue>,
}

impl<L> Default for KeyState<L> {
    fn default() -> Self {
        Self {
            listeners: ListenerSet::default(),
            cached: None,
        }
    }
}

impl<L> KeyState<L> {
    /// State for a freshly opened session seeded with its initial value.
    #[must_use]
    pub fn with_initial(value: PriceValue) -> Self {
        Self {
            listeners: ListenerSet::default(),
            cached: Some(value),
        }
    }

    /// Register a listener.
    pub fn join(&mut self, id: ListenerId, listener: L) -> Join {
        if self.listeners.insert(id, listener) {
            Join::Joined {
                replay: self.cached.clone(),
            }
        } else {
            Join::AlreadyJoined
        }
    }

    /// Remove a listener.
    pub fn leave(&mut self, id: &ListenerId) -> Leave {
        if !self.listeners.remove(id) {
            return Leave::NotRegistered;
        }

        match self.listeners.len() {
            0 => Leave::LastListenerLeft,
            n => Leave::Remaining(n),
        }
    }

    /// Last delivered value.
    #[must_use]
    pub const fn current(&self) -> Option<&PriceValue> {
        self.cached.as_ref()
    }

    /// Registered listeners.
    #[must_use]
    pub const fn listeners(&self) -> &ListenerSet<L> {
        &self.listeners
    }
}

impl<L: Clone> KeyState<L> {
    /// Compare a reading against the cache, updating it on change.
    pub fn observe(&mut self, value: PriceValue) -> Observation<L> {
        if self.cached.as_ref() == Some(&value) {
            return Observation::Unchanged;
        }

        self.cached = Some(value.clone());
        Observation::Changed {
            value,
            listeners: self.listeners.snapshot(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
