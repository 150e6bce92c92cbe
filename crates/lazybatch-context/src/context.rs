//! Preload contexts: groups of records that preload each other lazily.
//!
//! A context is attached to every record it covers as the record's
//! first-access hook. The first time any member reads an attribute the
//! context wants preloaded, the whole group is preloaded and the read is
//! served from the shared batch. When that batch computes, records found in
//! its values are registered in a child context, so nested reads batch too.

use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use lazybatch_core::{
    BoundArguments, ComputedBatch, ComputedHook, DerivationRef, FirstAccessHook, Identify,
    Loadable, LoaderResult, Preloader, Registry,
};
use parking_lot::Mutex;
use tracing::debug;

use crate::tree::AssociationTree;

/// A group of records sharing lazy preloading.
pub struct PreloadContext<E> {
    records: Vec<Weak<E>>,
    auto_preload: bool,
    tree: AssociationTree,
    preloaded: DashMap<String, Arc<Mutex<bool>>>,
    isolated: DashMap<DerivationRef<E>, Arc<Registry<E>>>,
}

/// Builder for [`PreloadContext`].
#[derive(Debug, Clone, Default)]
pub struct PreloadContextBuilder {
    auto_preload: bool,
    tree: AssociationTree,
}

impl PreloadContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preload every attribute on first access, not only those in the tree.
    pub fn auto_preload(mut self, enabled: bool) -> Self {
        self.auto_preload = enabled;
        self
    }

    /// Preload `name` on first access; records it produces preload `subtree`.
    pub fn lazily(mut self, name: impl Into<String>, subtree: AssociationTree) -> Self {
        self.tree.insert(name, subtree);
        self
    }

    pub fn tree(mut self, tree: AssociationTree) -> Self {
        self.tree.merge(tree);
        self
    }

    /// Creates the context and attaches it to every record.
    pub fn register<E: Loadable>(self, records: &[Arc<E>]) -> Arc<PreloadContext<E>> {
        let mut seen = HashSet::new();
        let context = Arc::new(PreloadContext {
            records: records
                .iter()
                .filter(|record| seen.insert(record.entity_id()))
                .map(Arc::downgrade)
                .collect(),
            auto_preload: self.auto_preload,
            tree: self.tree,
            preloaded: DashMap::new(),
            isolated: DashMap::new(),
        });

        for record in records {
            let hook: Arc<dyn FirstAccessHook<E>> = context.clone();
            record.loader_state().attach_hook(hook);
        }
        debug!(
            records = context.records.len(),
            auto_preload = context.auto_preload,
            "registered preload context"
        );
        context
    }
}

impl<E: Loadable> PreloadContext<E> {
    /// Live records, in registration order.
    pub fn records(&self) -> Vec<Arc<E>> {
        self.records.iter().filter_map(Weak::upgrade).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_auto_preload(&self) -> bool {
        self.auto_preload
    }

    pub fn tree(&self) -> &AssociationTree {
        &self.tree
    }

    pub fn needs_preload(&self, attribute: &str) -> bool {
        self.auto_preload || self.tree.contains(attribute)
    }

    pub fn is_preloaded(&self, attribute: &str) -> bool {
        self.preload_guard(attribute).is_some_and(|done| *done.lock())
    }

    fn preload_guard(&self, attribute: &str) -> Option<Arc<Mutex<bool>>> {
        self.preloaded
            .get(attribute)
            .map(|guard| Arc::clone(guard.value()))
    }

    /// Resolves a derivation that `entity`'s type does not declare, batched
    /// across the entity's context. An entity without a context gets a
    /// fresh auto-preload context of its own.
    pub fn load_isolated<V: Any + Send + Sync>(
        derivation: &DerivationRef<E>,
        entity: &Arc<E>,
        bound: BoundArguments,
    ) -> LoaderResult<Arc<V>> {
        if !entity.loader_state().has_first_access_hook() {
            PreloadContextBuilder::new()
                .auto_preload(true)
                .register(std::slice::from_ref(entity));
        }
        lazybatch_core::load_isolated(derivation, entity, bound)
    }

    fn cascade(&self, attribute: &str) -> Option<ComputedHook> {
        let child = PreloadContextBuilder {
            auto_preload: self.auto_preload,
            tree: self.tree.child(attribute),
        };
        if !child.auto_preload && child.tree.is_empty() {
            return None;
        }

        let hook: ComputedHook = Arc::new(move |batch: &ComputedBatch<'_>| {
            let nested = nested_records::<E>(batch);
            if nested.is_empty() {
                return;
            }
            debug!(
                derivation = batch.derivation(),
                records = nested.len(),
                "registering nested preload context"
            );
            child.clone().register(&nested);
        });
        Some(hook)
    }
}

impl<E: Loadable> FirstAccessHook<E> for PreloadContext<E> {
    fn on_first_access(&self, _entity: &Arc<E>, attribute: &str) {
        if !self.needs_preload(attribute) {
            return;
        }

        let guard = match self.preload_guard(attribute) {
            Some(guard) => guard,
            None => Arc::clone(
                self.preloaded
                    .entry(attribute.to_string())
                    .or_default()
                    .value(),
            ),
        };
        // One guard per attribute, held only while slots are assigned.
        let mut done = guard.lock();
        if *done {
            return;
        }

        let pending = self
            .records()
            .into_iter()
            .filter(|record| record.loader(attribute).is_none());
        let mut preloader = Preloader::new(pending);
        if let Some(hook) = self.cascade(attribute) {
            preloader = preloader.with_on_computed(hook);
        }
        let registries = preloader.preload(&[attribute]);
        *done = true;
        debug!(
            attribute,
            groups = registries.len(),
            records = self.records.len(),
            "preloaded lazily"
        );
    }

    fn shared_registry(&self, derivation: &DerivationRef<E>) -> Option<Arc<Registry<E>>> {
        let registry = self
            .isolated
            .entry(derivation.clone())
            .or_insert_with(|| {
                let registry = Arc::new(Registry::new(derivation.clone(), self.records()));
                if let Some(hook) = self.cascade(derivation.name()) {
                    registry.set_on_computed(hook);
                }
                registry
            });
        Some(Arc::clone(registry.value()))
    }
}

impl<E> fmt::Debug for PreloadContext<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreloadContext")
            .field("records", &self.records.len())
            .field("auto_preload", &self.auto_preload)
            .field("tree", &self.tree)
            .finish()
    }
}

/// Records held by the values of a computed batch, de-duplicated.
fn nested_records<E: Identify + Send + Sync + 'static>(batch: &ComputedBatch<'_>) -> Vec<Arc<E>> {
    let mut seen = HashSet::new();
    let mut records = Vec::new();
    let mut push = |record: &Arc<E>| {
        if seen.insert(record.entity_id()) {
            records.push(Arc::clone(record));
        }
    };

    for value in batch.values() {
        if let Some(record) = value.downcast_ref::<Arc<E>>() {
            push(record);
        } else if let Some(record) = value.downcast_ref::<Option<Arc<E>>>() {
            record.iter().for_each(&mut push);
        } else if let Some(many) = value.downcast_ref::<Vec<Arc<E>>>() {
            many.iter().for_each(&mut push);
        }
    }
    records
}
