//! Batch units: one argument-bound derivation over a fixed set of entities.
//!
//! A unit computes lazily on the first result read and then serves every
//! element from the memoized result map. The compute-once transition is
//! guarded by a per-unit mutex:
//!
//! ```text
//! Pending(elements) --first read--> Computing --Ok--> Computed(results)
//!                                        |
//!                                        +--Err---> Failed(error)
//!                                        +--panic-> (stays Computing, reads are Interrupted)
//! ```
//!
//! The computed-hook runs after the state mutex is released, under a
//! separate reentrant gate. Readers that observe `Computed` pass the gate
//! before returning, so no reader sees results before the hook finished.

use std::any::{type_name, Any};
use std::collections::HashSet;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, ReentrantMutex};
use tracing::{debug, instrument, warn};

use crate::args::{Arguments, BoundArguments, CacheKey};
use crate::derivation::{Derivation, DerivationRef, ResultMap, Value};
use crate::entity::{EntityId, Identify};
use crate::error::{LoaderError, LoaderResult};

/// Callback run once per unit right after its first successful computation.
pub type ComputedHook = Arc<dyn Fn(&ComputedBatch<'_>) + Send + Sync>;

/// Read-only view of a freshly computed batch, handed to a [`ComputedHook`].
pub struct ComputedBatch<'a> {
    derivation: &'a str,
    results: &'a ResultMap,
}

impl<'a> ComputedBatch<'a> {
    pub(crate) fn new(derivation: &'a str, results: &'a ResultMap) -> Self {
        Self {
            derivation,
            results,
        }
    }

    pub fn derivation(&self) -> &str {
        self.derivation
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn get(&self, entity: EntityId) -> Option<&Value> {
        self.results.get(&entity)
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.results.values()
    }

    /// Values of type `V`; values of any other type are skipped.
    pub fn values_as<V: Any + Send + Sync>(&self) -> impl Iterator<Item = Arc<V>> + '_ {
        self.results
            .values()
            .filter_map(|value| Arc::clone(value).downcast::<V>().ok())
    }
}

enum UnitState<E> {
    Pending(Vec<Arc<E>>),
    Computing,
    Computed(Arc<ResultMap>),
    Failed(LoaderError),
}

/// One derivation bound to one argument set over a fixed element set.
pub struct BatchUnit<E> {
    derivation: DerivationRef<E>,
    element_ids: Vec<EntityId>,
    arguments: Arguments,
    state: Mutex<UnitState<E>>,
    on_computed: OnceLock<ComputedHook>,
    hook_gate: ReentrantMutex<()>,
}

impl<E> BatchUnit<E>
where
    E: Identify + Send + Sync + 'static,
{
    /// Creates a pending unit. Arguments are validated on first use, not here.
    pub fn new(
        derivation: DerivationRef<E>,
        elements: impl IntoIterator<Item = Arc<E>>,
        bound: BoundArguments,
    ) -> Self {
        let arguments = Arguments::new(derivation.arguments(), bound);
        Self::with_arguments(derivation, elements, arguments)
    }

    pub(crate) fn with_arguments(
        derivation: DerivationRef<E>,
        elements: impl IntoIterator<Item = Arc<E>>,
        arguments: Arguments,
    ) -> Self {
        let elements = dedup_by_identity(elements);
        let element_ids = elements.iter().map(|e| e.entity_id()).collect();
        Self {
            derivation,
            element_ids,
            arguments,
            state: Mutex::new(UnitState::Pending(elements)),
            on_computed: OnceLock::new(),
            hook_gate: ReentrantMutex::new(()),
        }
    }

    pub fn derivation(&self) -> &DerivationRef<E> {
        &self.derivation
    }

    pub fn arguments(&self) -> &Arguments {
        &self.arguments
    }

    /// Ids of the elements, in batch order.
    pub fn element_ids(&self) -> &[EntityId] {
        &self.element_ids
    }

    pub fn len(&self) -> usize {
        self.element_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.element_ids.is_empty()
    }

    /// Validates the arguments, then evaluates the derivation's key.
    pub fn cache_key(&self) -> LoaderResult<CacheKey> {
        self.check_arguments()?;
        self.derivation.erased().cache_key(&self.arguments)
    }

    /// True once a computation has succeeded.
    pub fn is_computed(&self) -> bool {
        matches!(*self.state.lock(), UnitState::Computed(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(*self.state.lock(), UnitState::Failed(_))
    }

    /// Installs the computed-hook. Returns false if one is already set.
    pub fn set_on_computed(&self, hook: ComputedHook) -> bool {
        self.on_computed.set(hook).is_ok()
    }

    pub fn has_on_computed(&self) -> bool {
        self.on_computed.get().is_some()
    }

    /// The value recorded for `element`, computing the batch if needed.
    pub fn result_for(&self, element: &E) -> LoaderResult<Value> {
        let results = self.results()?;
        if results.is_empty() && !self.element_ids.is_empty() {
            return Err(LoaderError::NotFilled {
                derivation: self.derivation.name().to_string(),
            });
        }
        results
            .get(&element.entity_id())
            .cloned()
            .ok_or_else(|| LoaderError::NotLoaded {
                derivation: self.derivation.name().to_string(),
                entity: element.entity_id(),
            })
    }

    /// Typed [`result_for`](Self::result_for).
    pub fn result_for_as<V: Any + Send + Sync>(&self, element: &E) -> LoaderResult<Arc<V>> {
        downcast_value(&self.derivation, self.result_for(element)?)
    }

    /// Computes the batch if it is still pending and returns its results.
    pub(crate) fn results(&self) -> LoaderResult<Arc<ResultMap>> {
        let mut state = self.state.lock();
        match &*state {
            UnitState::Computed(results) => {
                let results = Arc::clone(results);
                drop(state);
                self.wait_for_hook();
                return Ok(results);
            }
            UnitState::Failed(err) => return Err(err.clone()),
            UnitState::Computing => return Err(self.interrupted()),
            UnitState::Pending(_) => {}
        }

        // Computing stays in place if the body unwinds.
        let UnitState::Pending(elements) = std::mem::replace(&mut *state, UnitState::Computing)
        else {
            return Err(self.interrupted());
        };

        match self.compute(&elements) {
            Ok(results) => {
                let results = Arc::new(results);
                *state = UnitState::Computed(Arc::clone(&results));
                // Taken before unlocking so waiting readers queue on the gate.
                let hook = self.on_computed.get();
                let gate = hook.map(|_| self.hook_gate.lock());
                drop(state);
                drop(elements);

                if let Some(hook) = hook {
                    hook(&ComputedBatch::new(self.derivation.name(), &results));
                }
                drop(gate);
                Ok(results)
            }
            Err(err) => {
                *state = UnitState::Failed(err.clone());
                Err(err)
            }
        }
    }

    #[instrument(skip_all, fields(derivation = %self.derivation.name(), elements = elements.len()))]
    fn compute(&self, elements: &[Arc<E>]) -> LoaderResult<ResultMap> {
        self.check_arguments()?;
        debug!("computing batch");

        let mut results = ResultMap::with_capacity(elements.len());
        if let Err(err) = self
            .derivation
            .erased()
            .compute(elements, &self.arguments, &mut results)
        {
            warn!(error = %err, "batch computation failed");
            metrics::counter!(
                "lazybatch_batch_failures_total",
                "derivation" => self.derivation.name().to_string()
            )
            .increment(1);
            return Err(err);
        }

        metrics::counter!(
            "lazybatch_batches_computed_total",
            "derivation" => self.derivation.name().to_string()
        )
        .increment(1);
        metrics::histogram!("lazybatch_batch_size").record(elements.len() as f64);
        debug!(results = results.len(), "batch computed");
        Ok(results)
    }

    /// Blocks until a computed-hook running on another thread has returned.
    fn wait_for_hook(&self) {
        if self.has_on_computed() {
            drop(self.hook_gate.lock());
        }
    }

    fn check_arguments(&self) -> LoaderResult<()> {
        self.derivation
            .arguments()
            .check(self.derivation.name(), self.arguments.supplied())
    }

    fn interrupted(&self) -> LoaderError {
        LoaderError::Interrupted {
            derivation: self.derivation.name().to_string(),
        }
    }
}

impl<E> fmt::Debug for BatchUnit<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.state.lock() {
            UnitState::Pending(_) => "pending",
            UnitState::Computing => "computing",
            UnitState::Computed(_) => "computed",
            UnitState::Failed(_) => "failed",
        };
        f.debug_struct("BatchUnit")
            .field("derivation", &self.derivation.name())
            .field("elements", &self.element_ids.len())
            .field("state", &state)
            .finish()
    }
}

/// Typed batch unit for ad hoc batching outside any entity declaration.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use lazybatch_core::{BoundArguments, FnDerivation, Loader, Tracked};
///
/// let words: Vec<_> = ["a", "bb"].map(|w| Arc::new(Tracked::new(w.to_string()))).into();
/// let lengths = FnDerivation::<Tracked<String>, usize>::batch("length", |words, _, out| {
///     for word in words {
///         out.record(word, word.len());
///     }
///     Ok(())
/// });
///
/// let loader = Loader::new(lengths, words.iter().cloned(), BoundArguments::new());
/// assert_eq!(*loader.result_for(&words[1]).unwrap(), 2);
/// ```
pub struct Loader<E, D> {
    unit: BatchUnit<E>,
    _derivation: PhantomData<fn() -> D>,
}

impl<E, D> Loader<E, D>
where
    E: Identify + Send + Sync + 'static,
    D: Derivation<E>,
{
    pub fn new(
        derivation: D,
        elements: impl IntoIterator<Item = Arc<E>>,
        bound: BoundArguments,
    ) -> Self {
        Self {
            unit: BatchUnit::new(DerivationRef::new(derivation), elements, bound),
            _derivation: PhantomData,
        }
    }

    pub fn result_for(&self, element: &E) -> LoaderResult<Arc<D::Output>> {
        self.unit.result_for_as::<D::Output>(element)
    }

    pub fn is_computed(&self) -> bool {
        self.unit.is_computed()
    }

    pub fn cache_key(&self) -> LoaderResult<CacheKey> {
        self.unit.cache_key()
    }

    pub fn unit(&self) -> &BatchUnit<E> {
        &self.unit
    }
}

pub(crate) fn downcast_value<E, V>(derivation: &DerivationRef<E>, value: Value) -> LoaderResult<Arc<V>>
where
    V: Any + Send + Sync,
{
    value
        .downcast::<V>()
        .map_err(|_| LoaderError::TypeMismatch {
            derivation: derivation.name().to_string(),
            expected: type_name::<V>(),
            actual: derivation.output_type(),
        })
}

/// Drops repeated elements, keeping the first occurrence of each identity.
pub(crate) fn dedup_by_identity<E: Identify>(
    elements: impl IntoIterator<Item = Arc<E>>,
) -> Vec<Arc<E>> {
    let mut seen = HashSet::new();
    elements
        .into_iter()
        .filter(|e| seen.insert(e.entity_id()))
        .collect()
}
