//! Nested attribute names for explicit lazy preloading.

use std::collections::BTreeMap;

/// Which derived attributes a context preloads, and what the records they
/// produce preload in turn.
///
/// # Example
///
/// ```
/// use lazybatch_context::AssociationTree;
///
/// let tree = AssociationTree::new()
///     .with("posts", AssociationTree::new().leaf("comments"))
///     .leaf("avatar");
///
/// assert!(tree.contains("posts"));
/// assert!(tree.child("posts").contains("comments"));
/// assert!(tree.child("avatar").is_empty());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssociationTree {
    children: BTreeMap<String, AssociationTree>,
}

impl AssociationTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tree with one leaf per name.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        names.into_iter().fold(Self::new(), |tree, name| tree.leaf(name))
    }

    /// Adds `name` with the subtree its records preload. Adding a name twice
    /// merges both subtrees.
    pub fn with(mut self, name: impl Into<String>, subtree: AssociationTree) -> Self {
        self.insert(name, subtree);
        self
    }

    pub fn leaf(self, name: impl Into<String>) -> Self {
        self.with(name, AssociationTree::new())
    }

    pub fn insert(&mut self, name: impl Into<String>, subtree: AssociationTree) {
        let entry = self.children.entry(name.into()).or_default();
        entry.merge(subtree);
    }

    pub fn merge(&mut self, other: AssociationTree) {
        for (name, subtree) in other.children {
            self.insert(name, subtree);
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.children.contains_key(name)
    }

    /// Subtree under `name`; empty when `name` is absent.
    pub fn child(&self, name: &str) -> AssociationTree {
        self.children.get(name).cloned().unwrap_or_default()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.children.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}
