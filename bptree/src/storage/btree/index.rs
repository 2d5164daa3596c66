//! Index pages: separator keys and child offsets.
//!
//! `keys[i]` is the smallest key reachable through `children[i + 1]`, so a
//! page with `n` keys has exactly `n + 1` children.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::storage::block::Offset;
use crate::storage::btree::node::{KeyOrder, PageLinks};
use crate::storage::metadata::Thresholds;

/// An index page.
///
/// # Invariants
/// - `keys` is strictly ascending
/// - `children.len() == keys.len() + 1`
/// - `children_are_leaves` is set only on the level directly above the leaves
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexPage<K> {
    pub links: PageLinks,
    pub keys: Vec<K>,
    pub children: Vec<Offset>,
    pub children_are_leaves: bool,
}

impl<K> IndexPage<K> {
    /// Empty index page sized for a tree of `order`.
    #[must_use]
    pub fn new(links: PageLinks, children_are_leaves: bool, order: usize) -> Self {
        Self {
            links,
            keys: Vec::with_capacity(order + 1),
            children: Vec::with_capacity(order + 2),
            children_are_leaves,
        }
    }

    #[must_use]
    pub const fn offset(&self) -> Offset {
        self.links.offset
    }

    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // Vec::len() is not const-stable
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // Vec::is_empty() is not const-stable
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn find<C: KeyOrder<K>>(&self, key: &K, order_by: &C) -> Result<usize, usize> {
        self.keys.binary_search_by(|k| order_by.compare(k, key))
    }

    /// Index of the child whose subtree may contain `key`.
    ///
    /// An exact separator match descends right, since the separator is the
    /// first key of that child.
    pub fn child_index_for<C: KeyOrder<K>>(&self, key: &K, order_by: &C) -> usize {
        match self.find(key, order_by) {
            Ok(i) => i + 1,
            Err(i) => i,
        }
    }

    /// Insert `key` at its sorted position and return that position.
    pub fn insert_sorted<C: KeyOrder<K>>(&mut self, key: K, order_by: &C) -> usize {
        let idx = match self.find(&key, order_by) {
            Ok(i) | Err(i) => i,
        };
        self.keys.insert(idx, key);
        idx
    }

    pub fn insert_at(&mut self, index: usize, key: K) {
        self.keys.insert(index, key);
    }

    pub fn delete_at(&mut self, index: usize) -> K {
        self.keys.remove(index)
    }

    pub fn insert_child_at(&mut self, index: usize, child: Offset) {
        self.children.insert(index, child);
    }

    pub fn delete_child_at(&mut self, index: usize) -> Offset {
        self.children.remove(index)
    }

    /// Position of `child` among this page's children.
    #[must_use]
    pub fn position_of_child(&self, child: Offset) -> Option<usize> {
        self.children.iter().position(|&c| c == child)
    }

    /// Reached `order` keys and must split.
    #[must_use]
    pub fn is_overflowing(&self, t: &Thresholds) -> bool {
        self.keys.len() >= t.max_index
    }

    #[must_use]
    pub fn is_deficient(&self, t: &Thresholds) -> bool {
        self.keys.len() < t.min_index
    }

    #[must_use]
    pub fn is_lendable(&self, t: &Thresholds) -> bool {
        self.keys.len() > t.min_index
    }

    /// Whether this page and `other` fit in one page together with the
    /// separator pulled down from their parent.
    #[must_use]
    pub fn is_mergeable(&self, other: &Self, t: &Thresholds) -> bool {
        self.keys.len() + other.keys.len() + 1 < t.max_index
    }

    /// Move the keys after `t.mid_point` into a new page at `new_offset`.
    ///
    /// Returns the midpoint key, which is removed from this page and must be
    /// promoted into the parent, and the new right page. Children are moved
    /// separately with [`Self::split_children_into`].
    pub fn split(&mut self, t: &Thresholds, new_offset: Offset, order: usize) -> (K, Self) {
        let mut right = Self::new(
            PageLinks {
                offset: new_offset,
                parent: self.links.parent,
                next: self.links.next,
                previous: Some(self.links.offset),
            },
            self.children_are_leaves,
            order,
        );
        right.keys.extend(self.keys.drain(t.mid_point + 1..));
        let promoted = self.keys.remove(t.mid_point);
        self.links.next = Some(new_offset);
        (promoted, right)
    }

    /// Move the children matching a [`Self::split`] into `right`.
    pub fn split_children_into(&mut self, right: &mut Self, t: &Thresholds) {
        right.children.extend(self.children.drain(t.mid_point + 1..));
    }

    /// Partition `sorted_keys[lower..upper]` by the child each key routes to.
    ///
    /// Returns `(child index, key range)` pairs in key order. Ranges are
    /// absolute indices into `sorted_keys` and cover `lower..upper`.
    pub fn get_ranges_in<C: KeyOrder<K>>(
        &self,
        sorted_keys: &[K],
        lower: usize,
        upper: usize,
        order_by: &C,
    ) -> Vec<(usize, Range<usize>)> {
        let mut ranges: Vec<(usize, Range<usize>)> = Vec::new();
        for (i, key) in sorted_keys[lower..upper].iter().enumerate() {
            let position = lower + i;
            let child = self.child_index_for(key, order_by);
            match ranges.last_mut() {
                Some((last_child, range)) if *last_child == child => range.end = position + 1,
                _ => ranges.push((child, position..position + 1)),
            }
        }
        ranges
    }
}
