//! lazybatch-core: Deferred batched loader engine
//!
//! This crate lets entities expose lazily computed derived attributes that
//! are computed once per group of siblings instead of once per entity:
//! - Argument schemas and cache keys for argument-bound derivations
//! - Batch units that compute on first read and memoize by identity
//! - Registries holding one unit per distinct argument set
//! - Per-type declaration tables and an explicit preloader
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │               lazybatch-core                │
//! ├─────────────────────────────────────────────┤
//! │  args/       - Schemas, bound values, keys  │
//! │  derivation  - Batch logic & type erasure   │
//! │  unit        - Compute-once batch units     │
//! │  registry    - Units by cache key           │
//! │  loadable    - Entity-side capability       │
//! │  preloader   - Group-wide priming           │
//! └─────────────────────────────────────────────┘
//! ```

pub mod args;
pub mod config;
pub mod derivation;
pub mod entity;
pub mod error;
pub mod loadable;
pub mod observability;
pub mod preloader;
pub mod registry;
pub mod unit;

// Re-export commonly used types at the crate root
pub use args::{ArgValue, ArgumentDescriptor, ArgumentSchema, Arguments, BoundArguments, CacheKey};
pub use derivation::{Derivation, DerivationRef, FnDerivation, FnDerivationBuilder, Recorder, Value};
pub use entity::{EntityId, Identify, Tracked};
pub use error::{Arity, LoaderError, LoaderResult};
pub use loadable::{
    load_isolated, resolve_isolated, DerivationTable, FirstAccessHook, Loadable, LoaderState,
    SlotState,
};
pub use preloader::Preloader;
pub use registry::Registry;
pub use unit::{BatchUnit, ComputedBatch, ComputedHook, Loader};
