//! Registries: the batch units of one group, keyed by argument cache key.

use std::fmt;
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::trace;

use crate::args::{Arguments, BoundArguments, CacheKey};
use crate::derivation::DerivationRef;
use crate::entity::{EntityId, Identify};
use crate::error::LoaderResult;
use crate::unit::{dedup_by_identity, BatchUnit, ComputedHook};

/// One group of entities sharing a derivation.
///
/// Every distinct argument set gets its own [`BatchUnit`], scoped to all
/// live elements of the registry. Argument sets with equal cache keys share
/// a unit.
///
/// Elements are held weakly; an entity that has been dropped simply leaves
/// the batches created after it.
pub struct Registry<E> {
    derivation: DerivationRef<E>,
    elements: Vec<Weak<E>>,
    element_ids: Vec<EntityId>,
    units: DashMap<CacheKey, Arc<BatchUnit<E>>>,
    on_computed: RwLock<Option<ComputedHook>>,
}

impl<E> Registry<E>
where
    E: Identify + Send + Sync + 'static,
{
    /// Creates a registry over `elements`, de-duplicated by identity in
    /// first-seen order.
    pub fn new(derivation: DerivationRef<E>, elements: impl IntoIterator<Item = Arc<E>>) -> Self {
        let elements = dedup_by_identity(elements);
        Self {
            derivation,
            element_ids: elements.iter().map(|e| e.entity_id()).collect(),
            elements: elements.iter().map(Arc::downgrade).collect(),
            units: DashMap::new(),
            on_computed: RwLock::new(None),
        }
    }

    /// Registry over a single entity.
    pub fn single(derivation: DerivationRef<E>, entity: &Arc<E>) -> Self {
        Self::new(derivation, [Arc::clone(entity)])
    }

    /// Returns the unit for `bound`, creating it on first use.
    ///
    /// Arguments are validated and keyed before any unit is stored, so an
    /// invalid argument set never leaves a unit behind.
    pub fn with_arguments(&self, bound: BoundArguments) -> LoaderResult<Arc<BatchUnit<E>>> {
        let arguments = Arguments::new(self.derivation.arguments(), bound);
        self.derivation
            .arguments()
            .check(self.derivation.name(), arguments.supplied())?;
        let key = self.derivation.erased().cache_key(&arguments)?;

        // Fast path: the unit usually exists after the first access.
        if let Some(unit) = self.units.get(&key).map(|unit| Arc::clone(unit.value())) {
            trace!(derivation = %self.derivation.name(), "batch unit hit");
            self.adopt_hook(&unit);
            return Ok(unit);
        }

        let unit = match self.units.entry(key) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                trace!(
                    derivation = %self.derivation.name(),
                    elements = self.element_ids.len(),
                    "batch unit miss"
                );
                let unit = Arc::new(BatchUnit::with_arguments(
                    self.derivation.clone(),
                    self.elements(),
                    arguments,
                ));
                entry.insert(Arc::clone(&unit));
                unit
            }
        };
        self.adopt_hook(&unit);
        Ok(unit)
    }

    /// Installs `hook` on this registry and on every existing unit that
    /// carries none yet.
    pub fn set_on_computed(&self, hook: ComputedHook) {
        *self.on_computed.write() = Some(Arc::clone(&hook));
        for unit in self.units.iter() {
            if !unit.has_on_computed() {
                unit.set_on_computed(Arc::clone(&hook));
            }
        }
    }

    pub fn derivation(&self) -> &DerivationRef<E> {
        &self.derivation
    }

    /// Number of elements the registry was created over.
    pub fn len(&self) -> usize {
        self.element_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.element_ids.is_empty()
    }

    /// Elements that are still alive, in registry order.
    pub fn elements(&self) -> Vec<Arc<E>> {
        self.elements.iter().filter_map(Weak::upgrade).collect()
    }

    pub fn element_ids(&self) -> &[EntityId] {
        &self.element_ids
    }

    pub fn contains(&self, entity: EntityId) -> bool {
        self.element_ids.contains(&entity)
    }

    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    /// True if any unit of this registry has computed.
    pub fn is_computed(&self) -> bool {
        self.units.iter().any(|unit| unit.is_computed())
    }

    fn adopt_hook(&self, unit: &BatchUnit<E>) {
        if unit.has_on_computed() {
            return;
        }
        if let Some(hook) = self.on_computed.read().as_ref() {
            unit.set_on_computed(Arc::clone(hook));
        }
    }
}

impl<E> fmt::Debug for Registry<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("derivation", &self.derivation.name())
            .field("elements", &self.element_ids.len())
            .field("units", &self.units.len())
            .finish()
    }
}
