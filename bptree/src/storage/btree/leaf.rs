//! Leaf pages: sorted key/value entries linked into a doubly linked chain.
//!
//! Entries form a contiguous sorted `Vec`. The vector reserves one slot more
//! than the leaf capacity so an insert can land in a full leaf right before it
//! is split.

use serde::{Deserialize, Serialize};

use crate::storage::block::Offset;
use crate::storage::btree::node::{KeyOrder, PageLinks};
use crate::storage::metadata::Thresholds;

/// One key/value slot in a leaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafEntry<K, V> {
    pub key: K,
    pub value: V,
}

/// Result of [`LeafPage::find_and_update_if_exists`].
#[derive(Debug, PartialEq, Eq)]
pub enum UpdateOutcome<V> {
    /// The key was present. Its previous value.
    Replaced { old: V },
    /// The key was absent. `value` belongs at `index`.
    Vacant { index: usize, value: V },
}

/// A leaf page.
///
/// # Invariants
/// - `entries` is strictly ascending by key under the tree's ordering
/// - `entries.len() <= max_leaf` between operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafPage<K, V> {
    pub links: PageLinks,
    pub entries: Vec<LeafEntry<K, V>>,
}

impl<K, V> LeafPage<K, V> {
    /// Empty leaf sized for a tree of `order`.
    #[must_use]
    pub fn new(links: PageLinks, order: usize) -> Self {
        Self {
            links,
            entries: Vec::with_capacity(order + 1),
        }
    }

    #[must_use]
    pub const fn offset(&self) -> Offset {
        self.links.offset
    }

    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // Vec::len() is not const-stable
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // Vec::is_empty() is not const-stable
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn first_key(&self) -> Option<&K> {
        self.entries.first().map(|e| &e.key)
    }

    /// Binary search for `key`. `Err` carries the insertion index.
    pub fn find<C: KeyOrder<K>>(&self, key: &K, order_by: &C) -> Result<usize, usize> {
        self.entries
            .binary_search_by(|e| order_by.compare(&e.key, key))
    }

    #[must_use]
    pub fn get<C: KeyOrder<K>>(&self, key: &K, order_by: &C) -> Option<&V> {
        self.find(key, order_by).ok().map(|i| &self.entries[i].value)
    }

    /// Overwrite the value of `key` in place if present.
    ///
    /// On a miss the value is handed back together with the insertion index.
    pub fn find_and_update_if_exists<C: KeyOrder<K>>(
        &mut self,
        key: &K,
        value: V,
        order_by: &C,
    ) -> UpdateOutcome<V> {
        match self.find(key, order_by) {
            Ok(index) => UpdateOutcome::Replaced {
                old: std::mem::replace(&mut self.entries[index].value, value),
            },
            Err(index) => UpdateOutcome::Vacant { index, value },
        }
    }

    /// Insert at `index`, shifting later entries right.
    ///
    /// # Pre-conditions
    /// - `index <= len()` and the result stays sorted
    pub fn insert_at(&mut self, index: usize, key: K, value: V) {
        self.entries.insert(index, LeafEntry { key, value });
    }

    /// Remove the entry at `index`, shifting later entries left.
    pub fn delete_at(&mut self, index: usize) -> LeafEntry<K, V> {
        self.entries.remove(index)
    }

    /// Full: the next insert must split.
    #[must_use]
    pub fn is_overflowing(&self, t: &Thresholds) -> bool {
        self.entries.len() >= t.max_leaf
    }

    /// Below the minimum occupancy of a non-root leaf.
    #[must_use]
    pub fn is_deficient(&self, t: &Thresholds) -> bool {
        self.entries.len() < t.min_leaf
    }

    /// Can give one entry to a sibling and stay at or above the minimum.
    #[must_use]
    pub fn is_lendable(&self, t: &Thresholds) -> bool {
        self.entries.len() > t.min_leaf
    }

    /// Move entries at and after `t.mid_point` into a new leaf at `new_offset`.
    ///
    /// The new leaf inherits this leaf's parent and next link and points back
    /// at this leaf. This leaf's `next` is pointed at the new leaf. Relinking
    /// the old next sibling is left to the caller.
    pub fn split(&mut self, t: &Thresholds, new_offset: Offset, order: usize) -> Self {
        let mut right = Self::new(
            PageLinks {
                offset: new_offset,
                parent: self.links.parent,
                next: self.links.next,
                previous: Some(self.links.offset),
            },
            order,
        );
        right.entries.extend(self.entries.drain(t.mid_point..));
        self.links.next = Some(new_offset);
        right
    }
}
