//! Entity-side capability: declaring derived attributes on a type and
//! resolving them per instance.
//!
//! An entity type embeds a [`LoaderState`] and points at a shared
//! [`DerivationTable`]. Implementing [`Loadable`] then gives every instance
//! `resolve`, `load`, `reload` and `clear_cache`.
//!
//! # Example
//!
//! ```
//! use std::sync::{Arc, OnceLock};
//! use lazybatch_core::{
//!     BoundArguments, DerivationTable, EntityId, FnDerivation, Identify, Loadable, LoaderState,
//! };
//!
//! struct Post {
//!     id: u64,
//!     loader: LoaderState<Post>,
//! }
//!
//! impl Identify for Post {
//!     fn entity_id(&self) -> EntityId {
//!         self.loader.id()
//!     }
//! }
//!
//! impl Loadable for Post {
//!     fn loader_state(&self) -> &LoaderState<Self> {
//!         &self.loader
//!     }
//!
//!     fn derivations(&self) -> &DerivationTable<Self> {
//!         static TABLE: OnceLock<DerivationTable<Post>> = OnceLock::new();
//!         TABLE.get_or_init(|| {
//!             DerivationTable::new().define(
//!                 "slug",
//!                 FnDerivation::<Post, String>::batch("slug", |posts, _, out| {
//!                     for post in posts {
//!                         out.record(post, format!("post-{}", post.id));
//!                     }
//!                     Ok(())
//!                 }),
//!             )
//!         })
//!     }
//! }
//!
//! let post = Arc::new(Post { id: 7, loader: LoaderState::new() });
//! let slug = post.load::<String>("slug", BoundArguments::new()).unwrap();
//! assert_eq!(*slug, "post-7");
//! ```

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

use crate::args::BoundArguments;
use crate::derivation::{Derivation, DerivationRef, Value};
use crate::entity::{EntityId, Identify};
use crate::error::{LoaderError, LoaderResult};
use crate::observability;
use crate::registry::Registry;
use crate::unit::downcast_value;

/// Observable state of one entity's cache slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Nothing assigned yet.
    Unset,
    /// A registry is assigned but has not computed.
    Lazy,
    /// The assigned registry has computed at least one unit.
    Computed,
}

/// Hook consulted when an entity resolves an attribute whose slot is unset.
///
/// A hook may assign a shared registry to the entity (and its siblings)
/// through [`LoaderState::assign`]; otherwise the entity falls back to a
/// single-element registry.
pub trait FirstAccessHook<E>: Send + Sync {
    fn on_first_access(&self, entity: &Arc<E>, attribute: &str);

    /// Registry shared by this hook's entities for a derivation the entity
    /// type does not declare.
    fn shared_registry(&self, derivation: &DerivationRef<E>) -> Option<Arc<Registry<E>>> {
        let _ = derivation;
        None
    }
}

/// Per-instance loader state: identity, cache slots and the first-access hook.
pub struct LoaderState<E> {
    id: EntityId,
    slots: RwLock<HashMap<String, Arc<Registry<E>>>>,
    first_access: RwLock<Option<Arc<dyn FirstAccessHook<E>>>>,
}

impl<E> LoaderState<E>
where
    E: Identify + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            id: EntityId::next(),
            slots: RwLock::new(HashMap::new()),
            first_access: RwLock::new(None),
        }
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    /// Attaches `hook`, replacing any previous one.
    pub fn attach_hook(&self, hook: Arc<dyn FirstAccessHook<E>>) {
        *self.first_access.write() = Some(hook);
    }

    pub fn detach_hook(&self) {
        *self.first_access.write() = None;
    }

    pub fn first_access_hook(&self) -> Option<Arc<dyn FirstAccessHook<E>>> {
        self.first_access.read().clone()
    }

    pub fn has_first_access_hook(&self) -> bool {
        self.first_access.read().is_some()
    }

    /// Points the slot for `attribute` at `registry`.
    pub fn assign(&self, attribute: impl Into<String>, registry: Arc<Registry<E>>) {
        self.slots.write().insert(attribute.into(), registry);
    }

    pub fn slot(&self, attribute: &str) -> Option<Arc<Registry<E>>> {
        self.slots.read().get(attribute).cloned()
    }

    pub fn slot_state(&self, attribute: &str) -> SlotState {
        match self.slots.read().get(attribute) {
            None => SlotState::Unset,
            Some(registry) if registry.is_computed() => SlotState::Computed,
            Some(_) => SlotState::Lazy,
        }
    }

    pub fn clear(&self, attribute: &str) {
        self.slots.write().remove(attribute);
    }

    pub fn clear_all(&self) {
        self.slots.write().clear();
    }

    /// The registry `entity` resolves `attribute` through, creating one if
    /// the slot is unset.
    fn registry_for(
        &self,
        entity: &Arc<E>,
        attribute: &str,
        derivation: &DerivationRef<E>,
    ) -> Arc<Registry<E>> {
        if let Some(registry) = self.slot(attribute) {
            return registry;
        }

        // The hook may preload siblings; it runs without the slot lock held.
        if let Some(hook) = self.first_access_hook() {
            hook.on_first_access(entity, attribute);
            if let Some(registry) = self.slot(attribute) {
                return registry;
            }
        }

        trace!(attribute, entity = %entity.entity_id(), "falling back to a single-element registry");
        observability::record_unbatched(derivation.name());
        let fresh = Arc::new(Registry::single(derivation.clone(), entity));
        Arc::clone(
            self.slots
                .write()
                .entry(attribute.to_string())
                .or_insert(fresh),
        )
    }

    fn replace_with_single(
        &self,
        entity: &Arc<E>,
        attribute: &str,
        derivation: &DerivationRef<E>,
    ) -> Arc<Registry<E>> {
        let fresh = Arc::new(Registry::single(derivation.clone(), entity));
        self.assign(attribute, Arc::clone(&fresh));
        fresh
    }
}

impl<E> Default for LoaderState<E>
where
    E: Identify + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// A clone is a distinct instance: it gets a fresh id, empty slots and no
/// hook.
impl<E> Clone for LoaderState<E>
where
    E: Identify + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for LoaderState<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut slots: Vec<String> = self.slots.read().keys().cloned().collect();
        slots.sort_unstable();
        f.debug_struct("LoaderState")
            .field("id", &self.id)
            .field("slots", &slots)
            .field("hook", &self.first_access.read().is_some())
            .finish()
    }
}

/// Derived attributes declared by one entity type, by name.
pub struct DerivationTable<E> {
    entries: BTreeMap<String, DerivationRef<E>>,
}

impl<E> DerivationTable<E>
where
    E: Identify + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Starts from a copy of `parent`'s declarations. Later definitions
    /// override inherited ones; the parent is unaffected.
    pub fn inherit(parent: &DerivationTable<E>) -> Self {
        parent.clone()
    }

    pub fn define<D: Derivation<E>>(self, name: impl Into<String>, derivation: D) -> Self {
        self.define_shared(name, DerivationRef::new(derivation))
    }

    /// Declares a derivation handle that other tables may share; entities
    /// of every type declaring the same handle batch together.
    pub fn define_shared(mut self, name: impl Into<String>, derivation: DerivationRef<E>) -> Self {
        self.register(name, derivation);
        self
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        derivation: DerivationRef<E>,
    ) -> Option<DerivationRef<E>> {
        self.entries.insert(name.into(), derivation)
    }

    pub fn get(&self, name: &str) -> Option<&DerivationRef<E>> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Declared names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<E> Default for DerivationTable<E>
where
    E: Identify + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for DerivationTable<E> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<E> fmt::Debug for DerivationTable<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.entries.keys()).finish()
    }
}

/// An entity type exposing lazily computed, batchable derived attributes.
pub trait Loadable: Identify + Send + Sync + Sized + 'static {
    fn loader_state(&self) -> &LoaderState<Self>;

    fn derivations(&self) -> &DerivationTable<Self>;

    /// Resolves `name` for this entity.
    ///
    /// With `reload`, the slot is replaced by a fresh single-element
    /// registry first, so only this entity recomputes.
    fn resolve(
        self: &Arc<Self>,
        name: &str,
        reload: bool,
        bound: BoundArguments,
    ) -> LoaderResult<Value> {
        let derivation = self
            .derivations()
            .get(name)
            .ok_or_else(|| LoaderError::UnknownAttribute {
                attribute: name.to_string(),
            })?;

        let state = self.loader_state();
        let registry = if reload {
            state.replace_with_single(self, name, derivation)
        } else {
            state.registry_for(self, name, derivation)
        };
        registry.with_arguments(bound)?.result_for(self)
    }

    /// Typed [`resolve`](Loadable::resolve) without reload.
    fn load<V: Any + Send + Sync>(
        self: &Arc<Self>,
        name: &str,
        bound: BoundArguments,
    ) -> LoaderResult<Arc<V>> {
        let value = self.resolve(name, false, bound)?;
        self.downcast_attribute(name, value)
    }

    /// Typed [`resolve`](Loadable::resolve) with reload.
    fn reload<V: Any + Send + Sync>(
        self: &Arc<Self>,
        name: &str,
        bound: BoundArguments,
    ) -> LoaderResult<Arc<V>> {
        let value = self.resolve(name, true, bound)?;
        self.downcast_attribute(name, value)
    }

    /// The registry currently assigned to `name`, if any.
    fn loader(&self, name: &str) -> Option<Arc<Registry<Self>>> {
        self.loader_state().slot(name)
    }

    fn slot_state(&self, name: &str) -> SlotState {
        self.loader_state().slot_state(name)
    }

    /// Unsets every slot; the next access recomputes.
    fn clear_cache(&self) {
        self.loader_state().clear_all();
    }

    #[doc(hidden)]
    fn downcast_attribute<V: Any + Send + Sync>(&self, name: &str, value: Value) -> LoaderResult<Arc<V>> {
        match self.derivations().get(name) {
            Some(derivation) => downcast_value(derivation, value),
            None => Err(LoaderError::UnknownAttribute {
                attribute: name.to_string(),
            }),
        }
    }
}

/// Resolves a derivation the entity's type does not declare.
///
/// The entity's hook may supply a registry shared with its siblings;
/// without one the derivation runs for this entity alone.
pub fn resolve_isolated<E: Loadable>(
    derivation: &DerivationRef<E>,
    entity: &Arc<E>,
    bound: BoundArguments,
) -> LoaderResult<Value> {
    let registry = entity
        .loader_state()
        .first_access_hook()
        .and_then(|hook| hook.shared_registry(derivation))
        .unwrap_or_else(|| {
            observability::record_unbatched(derivation.name());
            Arc::new(Registry::single(derivation.clone(), entity))
        });
    registry.with_arguments(bound)?.result_for(entity)
}

/// Typed [`resolve_isolated`].
pub fn load_isolated<E: Loadable, V: Any + Send + Sync>(
    derivation: &DerivationRef<E>,
    entity: &Arc<E>,
    bound: BoundArguments,
) -> LoaderResult<Arc<V>> {
    downcast_value(derivation, resolve_isolated(derivation, entity, bound)?)
}
