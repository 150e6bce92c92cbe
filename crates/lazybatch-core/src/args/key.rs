//! Type-erased cache keys for batch unit lookup.

use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

trait KeyPart: Send + Sync + 'static {
    fn as_any(&self) -> &dyn Any;
    fn eq_part(&self, other: &dyn KeyPart) -> bool;
    fn hash_part(&self, state: &mut dyn Hasher);
    fn fmt_part(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result;
}

impl<K> KeyPart for K
where
    K: Hash + Eq + fmt::Debug + Send + Sync + 'static,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn eq_part(&self, other: &dyn KeyPart) -> bool {
        other
            .as_any()
            .downcast_ref::<K>()
            .is_some_and(|other| other == self)
    }

    fn hash_part(&self, mut state: &mut dyn Hasher) {
        // Keys of different types must not collide just because their
        // hashes happen to agree.
        TypeId::of::<K>().hash(&mut state);
        self.hash(&mut state);
    }

    fn fmt_part(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Distinguishes batch units within one registry.
///
/// Wraps any `Hash + Eq` value. Two keys are equal only when they wrap the
/// same type and the wrapped values compare equal.
///
/// # Example
///
/// ```
/// use lazybatch_core::CacheKey;
///
/// assert_eq!(CacheKey::new((1, "a")), CacheKey::new((1, "a")));
/// assert_ne!(CacheKey::new(1u32), CacheKey::new(1u64));
/// ```
#[derive(Clone)]
pub struct CacheKey(Arc<dyn KeyPart>);

impl CacheKey {
    pub fn new<K>(key: K) -> Self
    where
        K: Hash + Eq + fmt::Debug + Send + Sync + 'static,
    {
        CacheKey(Arc::new(key))
    }

    /// The key every argument set collapses to.
    pub fn unit() -> Self {
        CacheKey::new(())
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_part(other.0.as_ref())
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash_part(state);
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CacheKey(")?;
        self.0.fmt_part(f)?;
        f.write_str(")")
    }
}
