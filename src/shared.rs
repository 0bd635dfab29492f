use chrono::{Duration, NaiveDateTime};
use std::sync::{Arc, PoisonError, RwLock};

/// A published value together with the version and instant it was published at.
#[derive(Debug)]
pub struct Versioned<T> {
    pub version: u64,
    pub published_at: NaiveDateTime,
    pub value: T,
}

impl<T> Versioned<T> {
    pub fn age(&self, now: NaiveDateTime) -> Duration {
        now.signed_duration_since(self.published_at)
    }
}

#[derive(Debug)]
struct Slot<T> {
    current: Option<Arc<Versioned<T>>>,
    next_version: u64,
    refresh_failed: bool,
}

/// Latest value of a periodically refreshed input (signal snapshot, demand
/// forecast, graph). Readers get an `Arc` to a complete published value and
/// keep it for as long as they need; publishing swaps the whole value.
#[derive(Debug)]
pub struct SharedState<T> {
    slot: RwLock<Slot<T>>,
}

impl<T> Default for SharedState<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> SharedState<T> {
    pub fn empty() -> Self {
        Self {
            slot: RwLock::new(Slot {
                current: None,
                next_version: 1,
                refresh_failed: false,
            }),
        }
    }

    pub fn with_value(value: T, published_at: NaiveDateTime) -> Self {
        let state = Self::empty();
        state.publish(value, published_at);
        state
    }

    /// Swaps in a new value and returns it as published.
    pub fn publish(&self, value: T, published_at: NaiveDateTime) -> Arc<Versioned<T>> {
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        let published = Arc::new(Versioned {
            version: slot.next_version,
            published_at,
            value,
        });
        slot.next_version += 1;
        slot.current = Some(Arc::clone(&published));
        slot.refresh_failed = false;
        published
    }

    /// Keeps the last good value and remembers that a refresh failed.
    pub fn mark_refresh_failed(&self) {
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        slot.refresh_failed = true;
    }

    pub fn refresh_failed(&self) -> bool {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .refresh_failed
    }

    pub fn current(&self) -> Option<Arc<Versioned<T>>> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .current
            .clone()
    }

    /// None when nothing has been published yet.
    pub fn version(&self) -> Option<u64> {
        self.current().map(|v| v.version)
    }
}
