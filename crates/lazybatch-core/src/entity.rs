//! Entity identity handles.
//!
//! Batch results are keyed by identity, never by structural equality: two
//! entities holding equal data are still distinct loadable instances. Every
//! instance receives a process-unique [`EntityId`] when it is created.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_ENTITY_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identity handle of one entity instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(u64);

impl EntityId {
    /// Allocates a fresh, never reused id.
    pub fn next() -> Self {
        EntityId(NEXT_ENTITY_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Anything that can be an element of a batch.
pub trait Identify {
    fn entity_id(&self) -> EntityId;
}

/// Gives a plain value an identity so it can be batched directly.
///
/// Useful with [`Loader`](crate::Loader) for ad hoc batching of values
/// that are not [`Loadable`](crate::Loadable) entities.
#[derive(Debug)]
pub struct Tracked<T> {
    id: EntityId,
    value: T,
}

impl<T> Tracked<T> {
    pub fn new(value: T) -> Self {
        Self {
            id: EntityId::next(),
            value,
        }
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> Identify for Tracked<T> {
    fn entity_id(&self) -> EntityId {
        self.id
    }
}

impl<T> Deref for Tracked<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}
