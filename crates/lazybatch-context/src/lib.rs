//! lazybatch-context: Lazy auto-preloading for lazybatch-core
//!
//! Records registered together in a [`PreloadContext`] preload each other
//! on first access, so reading a derived attribute on one member computes
//! it for the whole group. Records produced by a computed batch join a
//! nested context and batch the same way.
//!
//! ```
//! use std::sync::{Arc, OnceLock};
//! use lazybatch_context::PreloadContextBuilder;
//! use lazybatch_core::{
//!     BoundArguments, DerivationTable, EntityId, FnDerivation, Identify, Loadable, LoaderState,
//! };
//!
//! struct Post {
//!     words: usize,
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
//!                 "reading_time",
//!                 FnDerivation::<Post, usize>::batch("reading_time", |posts, _, out| {
//!                     for post in posts {
//!                         out.record(post, post.words / 200);
//!                     }
//!                     Ok(())
//!                 }),
//!             )
//!         })
//!     }
//! }
//!
//! let posts: Vec<Arc<Post>> = [400, 1000]
//!     .into_iter()
//!     .map(|words| Arc::new(Post { words, loader: LoaderState::new() }))
//!     .collect();
//! let context = PreloadContextBuilder::new().auto_preload(true).register(&posts);
//!
//! let minutes = posts[1].load::<usize>("reading_time", BoundArguments::new()).unwrap();
//!
//! assert_eq!(*minutes, 5);
//! assert!(context.is_preloaded("reading_time"));
//! assert!(posts[0].loader("reading_time").unwrap().is_computed());
//! ```

pub mod context;
pub mod tree;

pub use context::{PreloadContext, PreloadContextBuilder};
pub use tree::AssociationTree;
