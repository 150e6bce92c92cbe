//! Derivations: the logic that computes a derived attribute for a batch of
//! entities.
//!
//! A derivation is written against the typed [`Derivation`] trait, either
//! by hand or through [`FnDerivation::builder`]. The engine stores it behind
//! a [`DerivationRef`], which erases the output type so derivations with
//! different outputs can share one declaration table. The pointer identity
//! of a `DerivationRef` is what groups entities into one batch.

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

use crate::args::{ArgumentDescriptor, ArgumentSchema, Arguments, CacheKey};
use crate::entity::{EntityId, Identify};
use crate::error::{LoaderError, LoaderResult};

/// A type-erased derived value.
pub type Value = Arc<dyn Any + Send + Sync>;

pub(crate) type ResultMap = HashMap<EntityId, Value>;

/// Collects the results of one computation pass, keyed by entity identity.
pub struct Recorder<'a, E, V> {
    results: &'a mut ResultMap,
    _marker: PhantomData<fn(&E, V)>,
}

impl<'a, E, V> Recorder<'a, E, V>
where
    E: Identify,
    V: Any + Send + Sync,
{
    pub(crate) fn new(results: &'a mut ResultMap) -> Self {
        Self {
            results,
            _marker: PhantomData,
        }
    }

    /// Records the value for `element`. Recording twice keeps the last value.
    pub fn record(&mut self, element: &E, value: V) {
        self.results.insert(element.entity_id(), Arc::new(value));
    }

    pub fn contains(&self, element: &E) -> bool {
        self.results.contains_key(&element.entity_id())
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// Logic computing one derived attribute.
///
/// Only [`perform`](Derivation::perform) is essential. A derivation that
/// can answer a lone entity more cheaply also overrides
/// [`supports_single`](Derivation::supports_single) and
/// [`single`](Derivation::single); both paths share argument validation and
/// result lookup.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use lazybatch_core::{Arguments, Derivation, LoaderResult, Recorder, Tracked};
///
/// struct Doubled;
///
/// impl Derivation<Tracked<i64>> for Doubled {
///     type Output = i64;
///
///     fn perform(
///         &self,
///         elements: &[Arc<Tracked<i64>>],
///         _args: &Arguments,
///         out: &mut Recorder<'_, Tracked<i64>, i64>,
///     ) -> LoaderResult<()> {
///         for element in elements {
///             out.record(element, ***element * 2);
///         }
///         Ok(())
///     }
/// }
/// ```
pub trait Derivation<E>: Send + Sync + 'static {
    type Output: Any + Send + Sync;

    /// Name used in errors and logs.
    fn name(&self) -> &str {
        type_name::<Self>()
    }

    fn arguments(&self) -> &ArgumentSchema {
        ArgumentSchema::empty()
    }

    /// Key distinguishing units within a registry. Evaluated only after the
    /// arguments validated.
    fn cache_key(&self, args: &Arguments) -> LoaderResult<CacheKey> {
        Ok(args.identity_key())
    }

    /// Batch body. Receives the elements in registry order and records a
    /// result for each element it can resolve.
    fn perform(
        &self,
        elements: &[Arc<E>],
        args: &Arguments,
        out: &mut Recorder<'_, E, Self::Output>,
    ) -> LoaderResult<()> {
        let _ = (elements, args, out);
        Err(LoaderError::NotImplemented {
            derivation: self.name().to_string(),
        })
    }

    fn supports_single(&self) -> bool {
        false
    }

    /// Fast path for a batch of exactly one element.
    fn single(&self, element: &Arc<E>, args: &Arguments) -> LoaderResult<Self::Output> {
        let _ = (element, args);
        Err(LoaderError::NotImplemented {
            derivation: self.name().to_string(),
        })
    }
}

pub(crate) trait ErasedDerivation<E>: Send + Sync {
    fn name(&self) -> &str;
    fn arguments(&self) -> &ArgumentSchema;
    fn cache_key(&self, args: &Arguments) -> LoaderResult<CacheKey>;
    fn output_type(&self) -> &'static str;
    fn compute(
        &self,
        elements: &[Arc<E>],
        args: &Arguments,
        results: &mut ResultMap,
    ) -> LoaderResult<()>;
}

struct Typed<D>(D);

impl<E, D> ErasedDerivation<E> for Typed<D>
where
    E: Identify,
    D: Derivation<E>,
{
    fn name(&self) -> &str {
        self.0.name()
    }

    fn arguments(&self) -> &ArgumentSchema {
        self.0.arguments()
    }

    fn cache_key(&self, args: &Arguments) -> LoaderResult<CacheKey> {
        self.0.cache_key(args)
    }

    fn output_type(&self) -> &'static str {
        type_name::<D::Output>()
    }

    fn compute(
        &self,
        elements: &[Arc<E>],
        args: &Arguments,
        results: &mut ResultMap,
    ) -> LoaderResult<()> {
        match elements {
            [] => Ok(()),
            [only] if self.0.supports_single() => {
                let value = self.0.single(only, args)?;
                Recorder::<E, D::Output>::new(results).record(only, value);
                Ok(())
            }
            _ => self.0.perform(elements, args, &mut Recorder::new(results)),
        }
    }
}

/// Shared handle to a derivation.
///
/// Clones compare equal; two handles built from separate `new` calls never
/// do, even around identical derivations.
pub struct DerivationRef<E>(Arc<dyn ErasedDerivation<E>>);

impl<E> DerivationRef<E>
where
    E: Identify + 'static,
{
    pub fn new<D: Derivation<E>>(derivation: D) -> Self {
        DerivationRef(Arc::new(Typed(derivation)))
    }
}

impl<E> DerivationRef<E> {
    pub fn name(&self) -> &str {
        self.0.name()
    }

    pub fn arguments(&self) -> &ArgumentSchema {
        self.0.arguments()
    }

    /// Type name of the values this derivation records.
    pub fn output_type(&self) -> &'static str {
        self.0.output_type()
    }

    pub fn ptr_eq(&self, other: &DerivationRef<E>) -> bool {
        self.addr() == other.addr()
    }

    pub(crate) fn erased(&self) -> &dyn ErasedDerivation<E> {
        self.0.as_ref()
    }

    fn addr(&self) -> usize {
        Arc::as_ptr(&self.0).cast::<()>() as usize
    }
}

impl<E> Clone for DerivationRef<E> {
    fn clone(&self) -> Self {
        DerivationRef(Arc::clone(&self.0))
    }
}

impl<E> PartialEq for DerivationRef<E> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl<E> Eq for DerivationRef<E> {}

impl<E> Hash for DerivationRef<E> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl<E> fmt::Debug for DerivationRef<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivationRef")
            .field("name", &self.name())
            .field("output", &self.output_type())
            .finish()
    }
}

type BatchFn<E, V> =
    Box<dyn Fn(&[Arc<E>], &Arguments, &mut Recorder<'_, E, V>) -> LoaderResult<()> + Send + Sync>;
type SingleFn<E, V> = Box<dyn Fn(&Arc<E>, &Arguments) -> LoaderResult<V> + Send + Sync>;
type KeyFn = Box<dyn Fn(&Arguments) -> LoaderResult<CacheKey> + Send + Sync>;

/// Derivation assembled from closures.
///
/// # Example
///
/// ```
/// use lazybatch_core::{FnDerivation, Tracked};
///
/// let lengths = FnDerivation::<Tracked<String>, usize>::builder("length")
///     .single(|word, _args| Ok(word.len()))
///     .perform(|words, _args, out| {
///         for word in words {
///             out.record(word, word.len());
///         }
///         Ok(())
///     })
///     .build();
/// # let _ = lengths;
/// ```
pub struct FnDerivation<E, V> {
    name: String,
    arguments: ArgumentSchema,
    cache_key: Option<KeyFn>,
    single: Option<SingleFn<E, V>>,
    perform: Option<BatchFn<E, V>>,
}

impl<E, V> FnDerivation<E, V>
where
    E: Identify + Send + Sync + 'static,
    V: Any + Send + Sync,
{
    pub fn builder(name: impl Into<String>) -> FnDerivationBuilder<E, V> {
        FnDerivationBuilder {
            inner: FnDerivation {
                name: name.into(),
                arguments: ArgumentSchema::new(),
                cache_key: None,
                single: None,
                perform: None,
            },
        }
    }

    /// A derivation with only a batch body.
    pub fn batch<F>(name: impl Into<String>, perform: F) -> Self
    where
        F: Fn(&[Arc<E>], &Arguments, &mut Recorder<'_, E, V>) -> LoaderResult<()>
            + Send
            + Sync
            + 'static,
    {
        Self::builder(name).perform(perform).build()
    }
}

impl<E, V> Derivation<E> for FnDerivation<E, V>
where
    E: Identify + Send + Sync + 'static,
    V: Any + Send + Sync,
{
    type Output = V;

    fn name(&self) -> &str {
        &self.name
    }

    fn arguments(&self) -> &ArgumentSchema {
        &self.arguments
    }

    fn cache_key(&self, args: &Arguments) -> LoaderResult<CacheKey> {
        match &self.cache_key {
            Some(key) => key(args),
            None => Ok(args.identity_key()),
        }
    }

    fn perform(
        &self,
        elements: &[Arc<E>],
        args: &Arguments,
        out: &mut Recorder<'_, E, V>,
    ) -> LoaderResult<()> {
        match &self.perform {
            Some(perform) => perform(elements, args, out),
            None => Err(LoaderError::NotImplemented {
                derivation: self.name.clone(),
            }),
        }
    }

    fn supports_single(&self) -> bool {
        self.single.is_some()
    }

    fn single(&self, element: &Arc<E>, args: &Arguments) -> LoaderResult<V> {
        match &self.single {
            Some(single) => single(element, args),
            None => Err(LoaderError::NotImplemented {
                derivation: self.name.clone(),
            }),
        }
    }
}

/// Builder for [`FnDerivation`].
pub struct FnDerivationBuilder<E, V> {
    inner: FnDerivation<E, V>,
}

impl<E, V> FnDerivationBuilder<E, V>
where
    E: Identify + Send + Sync + 'static,
    V: Any + Send + Sync,
{
    pub fn argument(mut self, descriptor: ArgumentDescriptor) -> Self {
        self.inner.arguments = self.inner.arguments.argument(descriptor);
        self
    }

    pub fn required(self, name: impl Into<String>) -> Self {
        self.argument(ArgumentDescriptor::required(name))
    }

    pub fn optional(self, name: impl Into<String>) -> Self {
        self.argument(ArgumentDescriptor::optional(name))
    }

    pub fn with_default<T, F>(self, name: impl Into<String>, supplier: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.argument(ArgumentDescriptor::with_default(name, supplier))
    }

    pub fn cache_key<F>(mut self, key: F) -> Self
    where
        F: Fn(&Arguments) -> LoaderResult<CacheKey> + Send + Sync + 'static,
    {
        self.inner.cache_key = Some(Box::new(key));
        self
    }

    pub fn single<F>(mut self, single: F) -> Self
    where
        F: Fn(&Arc<E>, &Arguments) -> LoaderResult<V> + Send + Sync + 'static,
    {
        self.inner.single = Some(Box::new(single));
        self
    }

    pub fn perform<F>(mut self, perform: F) -> Self
    where
        F: Fn(&[Arc<E>], &Arguments, &mut Recorder<'_, E, V>) -> LoaderResult<()>
            + Send
            + Sync
            + 'static,
    {
        self.inner.perform = Some(Box::new(perform));
        self
    }

    pub fn build(self) -> FnDerivation<E, V> {
        self.inner
    }
}
