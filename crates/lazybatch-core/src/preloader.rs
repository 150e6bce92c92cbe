//! Explicit preloading: assign one shared registry per derivation group.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, instrument};

use crate::derivation::DerivationRef;
use crate::loadable::Loadable;
use crate::registry::Registry;
use crate::unit::ComputedHook;

/// Primes a collection of entities so each derived attribute computes once
/// per group on first read.
///
/// Entities are grouped by the derivation their type declares for a name,
/// so entities of different types batch together when they share one
/// [`DerivationRef`]. Preloading never forces a computation.
pub struct Preloader<E> {
    elements: Vec<Arc<E>>,
    on_computed: Option<ComputedHook>,
}

impl<E: Loadable> Preloader<E> {
    pub fn new(elements: impl IntoIterator<Item = Arc<E>>) -> Self {
        Self {
            elements: elements.into_iter().collect(),
            on_computed: None,
        }
    }

    /// Installs `hook` on every registry this preloader creates.
    pub fn with_on_computed(mut self, hook: ComputedHook) -> Self {
        self.on_computed = Some(hook);
        self
    }

    pub fn elements(&self) -> &[Arc<E>] {
        &self.elements
    }

    /// Preloads every name in turn and returns all created registries.
    #[instrument(skip_all, fields(elements = self.elements.len(), attributes = names.len()))]
    pub fn preload(&self, names: &[&str]) -> Vec<Arc<Registry<E>>> {
        names
            .iter()
            .flat_map(|name| self.preload_attribute(name))
            .collect()
    }

    /// Partitions the elements by their derivation for `name`, in first-seen
    /// order. Elements whose type does not declare `name` are skipped.
    pub fn preload_attribute(&self, name: &str) -> Vec<Arc<Registry<E>>> {
        let mut group_index: HashMap<DerivationRef<E>, usize> = HashMap::new();
        let mut groups: Vec<(DerivationRef<E>, Vec<Arc<E>>)> = Vec::new();

        for element in &self.elements {
            let Some(derivation) = element.derivations().get(name) else {
                continue;
            };
            match group_index.get(derivation) {
                Some(&index) => groups[index].1.push(Arc::clone(element)),
                None => {
                    group_index.insert(derivation.clone(), groups.len());
                    groups.push((derivation.clone(), vec![Arc::clone(element)]));
                }
            }
        }

        debug!(attribute = name, groups = groups.len(), "preloading");

        groups
            .into_iter()
            .map(|(derivation, members)| {
                let registry = Arc::new(Registry::new(derivation, members.iter().cloned()));
                if let Some(hook) = &self.on_computed {
                    registry.set_on_computed(Arc::clone(hook));
                }
                for member in &members {
                    member.loader_state().assign(name, Arc::clone(&registry));
                }
                registry
            })
            .collect()
    }
}
