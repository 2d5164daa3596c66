//! Bidirectional cursor over the leaf chain.
//!
//! A cursor sits in a gap between two entries of its current leaf. `next`
//! returns the entry after the gap and `previous` the entry before it,
//! following sibling links across leaf boundaries. There is no snapshot: each
//! sibling is read as it is stored when the cursor reaches it.

use crate::storage::btree::leaf::LeafPage;
use crate::storage::btree::node::{KeyOrder, Storable};
use crate::storage::btree::tree::{BTree, BTreeError};

/// Ordered cursor created by [`BTree::seek`], [`BTree::seek_first`] or
/// [`BTree::seek_last`].
pub struct Cursor<'a, K, V, C> {
    tree: &'a mut BTree<K, V, C>,
    /// `None` once closed.
    leaf: Option<LeafPage<K, V>>,
    /// Gap position in `leaf.entries`, `0..=len`.
    index: usize,
}

impl<'a, K: Storable, V: Storable, C: KeyOrder<K>> Cursor<'a, K, V, C> {
    pub(crate) const fn new(
        tree: &'a mut BTree<K, V, C>,
        leaf: LeafPage<K, V>,
        index: usize,
    ) -> Self {
        Self {
            tree,
            leaf: Some(leaf),
            index,
        }
    }

    /// Whether `next_entry` can return an entry.
    #[must_use]
    pub fn has_next(&self) -> bool {
        self.leaf
            .as_ref()
            .is_some_and(|leaf| self.index < leaf.len() || leaf.links.next.is_some())
    }

    /// Whether `previous_entry` can return an entry.
    #[must_use]
    pub fn has_previous(&self) -> bool {
        self.leaf
            .as_ref()
            .is_some_and(|leaf| self.index > 0 || leaf.links.previous.is_some())
    }

    /// Advance past the next entry and return it.
    pub fn next_entry(&mut self) -> Result<Option<(K, V)>, BTreeError> {
        loop {
            let Some(leaf) = &self.leaf else {
                return Ok(None);
            };

            if let Some(entry) = leaf.entries.get(self.index) {
                self.index += 1;
                return Ok(Some((entry.key.clone(), entry.value.clone())));
            }

            let Some(next) = leaf.links.next else {
                return Ok(None);
            };
            self.leaf = Some(self.tree.load_leaf(next)?);
            self.index = 0;
        }
    }

    /// Step back over the previous entry and return it.
    pub fn previous_entry(&mut self) -> Result<Option<(K, V)>, BTreeError> {
        loop {
            let Some(leaf) = &self.leaf else {
                return Ok(None);
            };

            if self.index > 0 {
                self.index -= 1;
                let entry = &leaf.entries[self.index];
                return Ok(Some((entry.key.clone(), entry.value.clone())));
            }

            let Some(previous) = leaf.links.previous else {
                return Ok(None);
            };
            let leaf = self.tree.load_leaf(previous)?;
            self.index = leaf.len();
            self.leaf = Some(leaf);
        }
    }

    /// Invalidate the cursor. Later calls return nothing.
    pub fn close(&mut self) {
        self.leaf = None;
        self.index = 0;
    }
}

impl<K: Storable, V: Storable, C: KeyOrder<K>> Iterator for Cursor<'_, K, V, C> {
    type Item = Result<(K, V), BTreeError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}
