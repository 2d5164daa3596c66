//! Shared page shape and key ordering for the B+tree.
//!
//! Leaf and index pages share a common "linked page" header: their own
//! offset plus parent and sibling offsets. Links are plain offsets resolved
//! through the page store on demand, never live references.

use std::cmp::Ordering;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::storage::block::{BlockClass, Offset};
use crate::storage::btree::index::IndexPage;
use crate::storage::btree::leaf::LeafPage;

/// Keys and values the tree can persist.
pub trait Storable: Serialize + DeserializeOwned + Clone {}

impl<T: Serialize + DeserializeOwned + Clone> Storable for T {}

/// Total order over keys, injected into the tree.
pub trait KeyOrder<K> {
    fn compare(&self, a: &K, b: &K) -> Ordering;
}

/// The key type's own `Ord`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NaturalOrder;

impl<K: Ord> KeyOrder<K> for NaturalOrder {
    fn compare(&self, a: &K, b: &K) -> Ordering {
        a.cmp(b)
    }
}

/// Ordering given by a comparison closure.
///
/// ```
/// use bptree::storage::btree::{KeyOrder, OrderBy};
///
/// let reversed = OrderBy(|a: &u32, b: &u32| b.cmp(a));
/// assert!(reversed.compare(&1, &2).is_gt());
/// ```
#[derive(Debug, Clone, Copy)]
pub struct OrderBy<F>(pub F);

impl<K, F> KeyOrder<K> for OrderBy<F>
where
    F: Fn(&K, &K) -> Ordering,
{
    fn compare(&self, a: &K, b: &K) -> Ordering {
        (self.0)(a, b)
    }
}

/// Location and neighbours of a page. `None` marks a missing link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageLinks {
    pub offset: Offset,
    pub parent: Option<Offset>,
    pub next: Option<Offset>,
    pub previous: Option<Offset>,
}

impl PageLinks {
    /// Links for a detached page at `offset`.
    #[must_use]
    pub const fn new(offset: Offset) -> Self {
        Self {
            offset,
            parent: None,
            next: None,
            previous: None,
        }
    }
}

/// Page kind discriminant. Decides the block size a page is stored in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Leaf,
    Index,
}

impl PageKind {
    #[must_use]
    pub const fn block_class(self) -> BlockClass {
        match self {
            Self::Leaf => BlockClass::Leaf,
            Self::Index => BlockClass::Index,
        }
    }
}

impl std::fmt::Display for PageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Leaf => write!(f, "leaf"),
            Self::Index => write!(f, "index"),
        }
    }
}

/// A decoded page of either kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Page<K, V> {
    Leaf(LeafPage<K, V>),
    Index(IndexPage<K>),
}

impl<K, V> Page<K, V> {
    #[must_use]
    pub const fn kind(&self) -> PageKind {
        match self {
            Self::Leaf(_) => PageKind::Leaf,
            Self::Index(_) => PageKind::Index,
        }
    }
}

/// Borrowed form of [`Page`] used when storing. Encodes identically.
#[derive(Serialize)]
pub(crate) enum PageRef<'a, K, V> {
    Leaf(&'a LeafPage<K, V>),
    Index(&'a IndexPage<K>),
}
