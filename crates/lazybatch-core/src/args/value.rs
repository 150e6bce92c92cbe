//! Bound argument values and the name→value mapping supplied on access.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A shared, type-erased argument value.
///
/// The identity of a value is its shared allocation: clones of one
/// `ArgValue` share an identity, two values built from equal data do not.
#[derive(Clone)]
pub struct ArgValue(Arc<dyn Any + Send + Sync>);

impl ArgValue {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        ArgValue(Arc::new(value))
    }

    /// Wraps an existing allocation, keeping its identity.
    pub fn from_arc<T: Any + Send + Sync>(value: Arc<T>) -> Self {
        ArgValue(value)
    }

    /// Address of the shared allocation.
    pub fn identity(&self) -> usize {
        Arc::as_ptr(&self.0).cast::<()>() as usize
    }

    pub fn ptr_eq(&self, other: &ArgValue) -> bool {
        self.identity() == other.identity()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.0).downcast::<T>().ok()
    }
}

impl fmt::Debug for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArgValue({:#x})", self.identity())
    }
}

/// Arguments supplied when a derived attribute is requested.
///
/// Presence is what counts: `false`, `0`, an empty string or `None` are
/// legitimate values.
///
/// # Example
///
/// ```
/// use lazybatch_core::BoundArguments;
///
/// let args = BoundArguments::new().with("from", 10).with("verbose", false);
/// assert!(args.contains("verbose"));
/// assert_eq!(args.len(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct BoundArguments {
    values: HashMap<String, ArgValue>,
}

impl BoundArguments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `name` to a fresh value.
    pub fn with<T: Any + Send + Sync>(self, name: impl Into<String>, value: T) -> Self {
        self.with_value(name, ArgValue::new(value))
    }

    /// Binds `name` to an existing value, sharing its identity.
    pub fn with_value(mut self, name: impl Into<String>, value: ArgValue) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: ArgValue) -> Option<ArgValue> {
        self.values.insert(name.into(), value)
    }

    pub fn get(&self, name: &str) -> Option<&ArgValue> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_identity() {
        let value = ArgValue::new(String::from("x"));
        let copy = value.clone();

        assert!(value.ptr_eq(&copy));
        assert!(!value.ptr_eq(&ArgValue::new(String::from("x"))));
    }

    #[test]
    fn test_from_arc_keeps_allocation_identity() {
        let shared = Arc::new(42u64);
        let a = ArgValue::from_arc(Arc::clone(&shared));
        let b = ArgValue::from_arc(shared);

        assert!(a.ptr_eq(&b));
        assert_eq!(a.downcast_ref::<u64>(), Some(&42));
    }

    #[test]
    fn test_downcast_to_wrong_type_is_none() {
        let value = ArgValue::new(1i32);
        assert!(value.downcast::<i64>().is_none());
        assert_eq!(value.downcast::<i32>().as_deref(), Some(&1));
    }

    #[test]
    fn test_falsy_values_are_present() {
        let args = BoundArguments::new()
            .with("flag", false)
            .with("count", 0u32)
            .with("label", String::new())
            .with("maybe", Option::<u8>::None);

        for name in ["flag", "count", "label", "maybe"] {
            assert!(args.contains(name), "{name} should be bound");
        }
    }

    #[test]
    fn test_rebinding_replaces_value() {
        let mut args = BoundArguments::new().with("limit", 1u32);
        let previous = args.insert("limit", ArgValue::new(2u32));

        assert!(previous.is_some());
        assert_eq!(args.len(), 1);
        assert_eq!(args.get("limit").and_then(|v| v.downcast_ref::<u32>()), Some(&2));
    }
}
