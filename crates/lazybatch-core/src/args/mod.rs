//! Argument schema: named, optionally defaulted inputs of a derivation and
//! how they collapse into a cache key.

mod key;
mod key_proptest;
mod schema;
mod value;

pub use key::CacheKey;
pub use schema::{ArgumentDescriptor, ArgumentSchema, Arguments, DefaultFn};
pub use value::{ArgValue, BoundArguments};
