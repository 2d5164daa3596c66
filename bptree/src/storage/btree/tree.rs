//! Disk-backed B+tree engine.
//!
//! All entries live in leaves. Index pages hold separator keys, where each
//! separator is a copy of the first key of the subtree to its right. Splits
//! promote a key into the parent and may grow a new root; deletes borrow from
//! or merge with a sibling and may collapse the root.
//!
//! The engine is single-threaded. An insert that splits stages every page it
//! touches and checks that each one fits its block before writing any of
//! them, so an oversized page fails the insert without leaving a partial
//! split behind. Deletes write pages one at a time.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::storage::block::Offset;
use crate::storage::btree::cursor::Cursor;
use crate::storage::btree::index::IndexPage;
use crate::storage::btree::leaf::{LeafPage, UpdateOutcome};
use crate::storage::btree::node::{KeyOrder, NaturalOrder, PageKind, PageLinks, Storable};
use crate::storage::buffer_pool::BufferPool;
use crate::storage::cache::PageCache;
use crate::storage::metadata::{MetadataError, Thresholds, TreeMetadata};
use crate::storage::store::{PageStore, StoreError};

/// A B+tree stored in a single file.
pub struct BTree<K, V, C = NaturalOrder> {
    store: PageStore,
    order_by: C,
    _entries: PhantomData<fn() -> (K, V)>,
}

impl<K: Storable + Ord, V: Storable> BTree<K, V> {
    /// Create a new tree file at `path` ordered by `K`'s `Ord`.
    ///
    /// Returns an error if the file already exists.
    pub fn create(
        path: &Path,
        index_name: &str,
        order: usize,
        buffer_pool: Arc<BufferPool>,
    ) -> Result<Self, BTreeError> {
        Self::create_with_comparator(path, index_name, order, buffer_pool, NaturalOrder)
    }

    /// Open an existing tree file.
    pub fn open(path: &Path, buffer_pool: Arc<BufferPool>) -> Result<Self, BTreeError> {
        Self::open_with_comparator(path, buffer_pool, NaturalOrder)
    }

    /// Open the tree at `path` if it holds data, otherwise create it.
    pub fn open_or_create(
        path: &Path,
        index_name: &str,
        order: usize,
        buffer_pool: Arc<BufferPool>,
    ) -> Result<Self, BTreeError> {
        Self::open_or_create_with_comparator(path, index_name, order, buffer_pool, NaturalOrder)
    }
}

impl<K: Storable, V: Storable, C: KeyOrder<K>> BTree<K, V, C> {
    /// Create a new tree file with an injected key ordering.
    ///
    /// # Post-conditions
    /// - The file holds a header and one empty root leaf
    pub fn create_with_comparator(
        path: &Path,
        index_name: &str,
        order: usize,
        buffer_pool: Arc<BufferPool>,
        order_by: C,
    ) -> Result<Self, BTreeError> {
        let header = TreeMetadata::new(index_name, order)?;
        let mut store = PageStore::create(path, header, buffer_pool)?;

        let root = store.allocate(PageKind::Leaf)?;
        store.store_leaf(&LeafPage::<K, V>::new(PageLinks::new(root), order))?;

        let header = store.header_mut();
        header.root_offset = root;
        header.root_is_leaf = true;
        header.first_leaf = root;
        header.last_leaf = root;
        store.write_header()?;

        Ok(Self {
            store,
            order_by,
            _entries: PhantomData,
        })
    }

    /// Open an existing tree file with an injected key ordering.
    ///
    /// The ordering must be the one the tree was built with.
    pub fn open_with_comparator(
        path: &Path,
        buffer_pool: Arc<BufferPool>,
        order_by: C,
    ) -> Result<Self, BTreeError> {
        Ok(Self {
            store: PageStore::open(path, buffer_pool)?,
            order_by,
            _entries: PhantomData,
        })
    }

    /// Open the tree at `path` if the file exists and is non-empty, otherwise
    /// create a fresh tree there. An existing empty file is replaced.
    pub fn open_or_create_with_comparator(
        path: &Path,
        index_name: &str,
        order: usize,
        buffer_pool: Arc<BufferPool>,
        order_by: C,
    ) -> Result<Self, BTreeError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > 0 => Self::open_with_comparator(path, buffer_pool, order_by),
            Ok(_) => {
                std::fs::remove_file(path).map_err(StoreError::Io)?;
                Self::create_with_comparator(path, index_name, order, buffer_pool, order_by)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Self::create_with_comparator(path, index_name, order, buffer_pool, order_by)
            }
            Err(e) => Err(StoreError::Io(e).into()),
        }
    }

    /// Attach a page payload cache.
    #[must_use]
    pub fn with_cache(mut self, cache: Box<dyn PageCache>) -> Self {
        self.store.set_cache(cache);
        self
    }

    /// Number of entries.
    #[must_use]
    pub const fn count(&self) -> u64 {
        self.store.header().count
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count() == 0
    }

    #[must_use]
    pub const fn metadata(&self) -> &TreeMetadata {
        self.store.header()
    }

    #[must_use]
    pub fn index_name(&self) -> &str {
        &self.store.header().index_name
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.store.path()
    }

    #[must_use]
    pub const fn order_by(&self) -> &C {
        &self.order_by
    }

    /// Flush file contents to disk.
    pub fn sync(&self) -> Result<(), BTreeError> {
        Ok(self.store.sync()?)
    }

    /// Look up a value by key.
    pub fn get(&mut self, key: &K) -> Result<Option<V>, BTreeError> {
        let mut leaf = self.find_leaf(key)?;
        Ok(match leaf.find(key, &self.order_by) {
            Ok(i) => Some(leaf.entries.swap_remove(i).value),
            Err(_) => None,
        })
    }

    /// Look up a batch of keys, descending once per shared subtree.
    ///
    /// Returns one result per requested key, in request order. Keys should be sorted
    /// under the tree's ordering; unsorted input is still answered correctly,
    /// only with more page loads.
    pub fn get_many(&mut self, sorted_keys: &[K]) -> Result<Vec<Option<V>>, BTreeError> {
        let mut found = Vec::with_capacity(sorted_keys.len());
        if sorted_keys.is_empty() {
            return Ok(found);
        }
        let header = self.store.header();
        let (root, root_is_leaf) = (header.root_offset, header.root_is_leaf);
        self.collect_many(root, root_is_leaf, sorted_keys, &mut found)?;
        Ok(found)
    }

    /// Insert or update an entry.
    ///
    /// Returns the old value if updating, None if inserting.
    pub fn put(&mut self, key: K, value: V) -> Result<Option<V>, BTreeError> {
        let t = self.thresholds();
        // Find the leaf node
        let mut leaf = self.find_leaf(&key)?;

        match leaf.find_and_update_if_exists(&key, value, &self.order_by) {
            UpdateOutcome::Replaced { old } => {
                self.save_leaf(&leaf)?;
                return Ok(Some(old));
            }
            UpdateOutcome::Vacant { index, value } => {
                // A full leaf takes the entry in its spare slot, then splits
                let overflowing = leaf.is_overflowing(&t);
                leaf.insert_at(index, key, value);
                if overflowing {
                    let mut batch = SplitBatch::new();
                    self.split_leaf(&mut batch, leaf)?;
                    self.commit(batch)?;
                } else {
                    self.save_leaf(&leaf)?;
                }
            }
        }

        self.store.header_mut().count += 1;
        self.store.write_header()?;
        Ok(None)
    }

    /// Remove an entry.
    ///
    /// Returns the removed value, or None if the key was absent.
    pub fn delete(&mut self, key: &K) -> Result<Option<V>, BTreeError> {
        if self.is_empty() {
            return Ok(None);
        }

        let mut leaf = self.find_leaf(key)?;
        let Ok(index) = leaf.find(key, &self.order_by) else {
            return Ok(None);
        };

        // Only the first key of a leaf can have been promoted as a separator.
        let successor = if index == 0 && leaf.links.parent.is_some() {
            self.successor(&leaf, index)?
        } else {
            None
        };
        if let Some(successor) = successor {
            self.replace_separator(leaf.links.parent, key, &successor)?;
        }

        // A root leaf may empty out; any other leaf rebalances below minimum
        let removed = leaf.delete_at(index);
        if leaf.links.parent.is_some() && leaf.is_deficient(&self.thresholds()) {
            self.rebalance_leaf(leaf)?;
        } else {
            self.save_leaf(&leaf)?;
        }

        let header = self.store.header_mut();
        header.count = header.count.saturating_sub(1);
        self.store.write_header()?;
        Ok(Some(removed.value))
    }

    /// Cursor positioned before the first key `>=` `key`.
    pub fn seek(&mut self, key: &K) -> Result<Cursor<'_, K, V, C>, BTreeError> {
        let leaf = self.find_leaf(key)?;
        let (Ok(index) | Err(index)) = leaf.find(key, &self.order_by);
        Ok(Cursor::new(self, leaf, index))
    }

    /// Cursor positioned before the first entry.
    pub fn seek_first(&mut self) -> Result<Cursor<'_, K, V, C>, BTreeError> {
        let leaf = self.edge_leaf(Edge::First)?;
        Ok(Cursor::new(self, leaf, 0))
    }

    /// Cursor positioned after the last entry.
    pub fn seek_last(&mut self) -> Result<Cursor<'_, K, V, C>, BTreeError> {
        let leaf = self.edge_leaf(Edge::Last)?;
        let index = leaf.len();
        Ok(Cursor::new(self, leaf, index))
    }

    pub(crate) fn load_leaf(&mut self, offset: Offset) -> Result<LeafPage<K, V>, BTreeError> {
        Ok(self.store.load_leaf(offset)?)
    }

    pub(crate) fn load_index(&mut self, offset: Offset) -> Result<IndexPage<K>, BTreeError> {
        Ok(self.store.load_index(offset)?)
    }

    const fn thresholds(&self) -> Thresholds {
        self.store.header().thresholds
    }

    const fn order(&self) -> usize {
        self.store.header().order
    }

    fn save_leaf(&mut self, leaf: &LeafPage<K, V>) -> Result<(), BTreeError> {
        self.store.store_leaf(leaf)?;
        Ok(())
    }

    fn save_index(&mut self, page: &IndexPage<K>) -> Result<(), BTreeError> {
        self.store.store_index(page)?;
        Ok(())
    }

    /// Descend from the root to the leaf that holds or would hold `key`.
    fn find_leaf(&mut self, key: &K) -> Result<LeafPage<K, V>, BTreeError> {
        let header = self.store.header();
        let mut offset = header.root_offset;
        if header.root_is_leaf {
            return self.load_leaf(offset);
        }

        loop {
            let page = self.load_index(offset)?;
            offset = child_at(&page, page.child_index_for(key, &self.order_by))?;
            if page.children_are_leaves {
                return self.load_leaf(offset);
            }
        }
    }

    /// Descend the leftmost or rightmost spine.
    fn edge_leaf(&mut self, edge: Edge) -> Result<LeafPage<K, V>, BTreeError> {
        let header = self.store.header();
        let mut offset = header.root_offset;
        if header.root_is_leaf {
            return self.load_leaf(offset);
        }

        loop {
            let page = self.load_index(offset)?;
            let index = match edge {
                Edge::First => 0,
                Edge::Last => page.children.len().saturating_sub(1),
            };
            offset = child_at(&page, index)?;
            if page.children_are_leaves {
                return self.load_leaf(offset);
            }
        }
    }

    fn collect_many(
        &mut self,
        offset: Offset,
        is_leaf: bool,
        keys: &[K],
        found: &mut Vec<Option<V>>,
    ) -> Result<(), BTreeError> {
        if is_leaf {
            let leaf = self.load_leaf(offset)?;
            found.extend(keys.iter().map(|k| leaf.get(k, &self.order_by).cloned()));
            return Ok(());
        }

        let page = self.load_index(offset)?;
        for (child, range) in page.get_ranges_in(keys, 0, keys.len(), &self.order_by) {
            let child_offset = child_at(&page, child)?;
            self.collect_many(
                child_offset,
                page.children_are_leaves,
                &keys[range],
                found,
            )?;
        }
        Ok(())
    }

    /// Split an overfull leaf and push the new separator upward.
    fn split_leaf(
        &mut self,
        batch: &mut SplitBatch<K, V>,
        mut leaf: LeafPage<K, V>,
    ) -> Result<(), BTreeError> {
        let t = self.thresholds();
        let right_offset = self.store.allocate(PageKind::Leaf)?;
        let mut right = leaf.split(&t, right_offset, self.order());
        let promoted = right
            .first_key()
            .cloned()
            .ok_or_else(|| BTreeError::Corrupt(format!("leaf {right_offset} empty after split")))?;

        // Splice the new leaf into the chain
        match right.links.next {
            Some(next) => {
                let mut next_leaf = self.staged_leaf(batch, next)?;
                next_leaf.links.previous = Some(right_offset);
                batch.leaves.insert(next, next_leaf);
            }
            None => batch.last_leaf = Some(right_offset),
        }
        debug!(left = leaf.offset(), right = right_offset, "Split leaf");

        match leaf.links.parent {
            None => {
                let root = self.grow_root(batch, leaf.offset(), promoted, right_offset, true)?;
                leaf.links.parent = Some(root);
                right.links.parent = Some(root);
                batch.leaves.insert(leaf.offset(), leaf);
                batch.leaves.insert(right_offset, right);
                Ok(())
            }
            Some(parent) => {
                // Stage both halves first so a parent split re-parents the new leaf
                batch.leaves.insert(leaf.offset(), leaf);
                batch.leaves.insert(right_offset, right);
                self.insert_into_parent(batch, parent, promoted, right_offset)
            }
        }
    }

    /// Add `key` and its right child to an index page, splitting as needed.
    fn insert_into_parent(
        &mut self,
        batch: &mut SplitBatch<K, V>,
        parent_offset: Offset,
        key: K,
        right_child: Offset,
    ) -> Result<(), BTreeError> {
        let mut parent = self.staged_index(batch, parent_offset)?;
        let index = parent.insert_sorted(key, &self.order_by);
        parent.insert_child_at(index + 1, right_child);

        if parent.is_overflowing(&self.thresholds()) {
            self.split_index(batch, parent)
        } else {
            batch.indexes.insert(parent_offset, parent);
            Ok(())
        }
    }

    fn split_index(
        &mut self,
        batch: &mut SplitBatch<K, V>,
        mut page: IndexPage<K>,
    ) -> Result<(), BTreeError> {
        let t = self.thresholds();
        let right_offset = self.store.allocate(PageKind::Index)?;
        let (promoted, mut right) = page.split(&t, right_offset, self.order());
        page.split_children_into(&mut right, &t);

        if let Some(next) = right.links.next {
            let mut next_page = self.staged_index(batch, next)?;
            next_page.links.previous = Some(right_offset);
            batch.indexes.insert(next, next_page);
        }
        // Children that moved right now answer to the new page
        for &child in &right.children {
            self.stage_parent(batch, child, right.children_are_leaves, right_offset)?;
        }
        debug!(left = page.offset(), right = right_offset, "Split index page");

        match page.links.parent {
            None => {
                let root = self.grow_root(batch, page.offset(), promoted, right_offset, false)?;
                page.links.parent = Some(root);
                right.links.parent = Some(root);
                batch.indexes.insert(page.offset(), page);
                batch.indexes.insert(right_offset, right);
                Ok(())
            }
            Some(parent) => {
                batch.indexes.insert(page.offset(), page);
                batch.indexes.insert(right_offset, right);
                self.insert_into_parent(batch, parent, promoted, right_offset)
            }
        }
    }

    /// Allocate a new root above `left` and `right`.
    fn grow_root(
        &mut self,
        batch: &mut SplitBatch<K, V>,
        left: Offset,
        key: K,
        right: Offset,
        children_are_leaves: bool,
    ) -> Result<Offset, BTreeError> {
        let offset = self.store.allocate(PageKind::Index)?;
        let mut root = IndexPage::new(PageLinks::new(offset), children_are_leaves, self.order());
        root.keys.push(key);
        root.children.extend([left, right]);
        batch.indexes.insert(offset, root);
        batch.root = Some(offset);
        debug!(root = offset, "Grew new root");
        Ok(offset)
    }

    fn stage_parent(
        &mut self,
        batch: &mut SplitBatch<K, V>,
        child: Offset,
        is_leaf: bool,
        parent: Offset,
    ) -> Result<(), BTreeError> {
        if is_leaf {
            let mut leaf = self.staged_leaf(batch, child)?;
            leaf.links.parent = Some(parent);
            batch.leaves.insert(child, leaf);
        } else {
            let mut page = self.staged_index(batch, child)?;
            page.links.parent = Some(parent);
            batch.indexes.insert(child, page);
        }
        Ok(())
    }

    /// Take a leaf out of `batch`, or load it if it is not staged.
    fn staged_leaf(
        &mut self,
        batch: &mut SplitBatch<K, V>,
        offset: Offset,
    ) -> Result<LeafPage<K, V>, BTreeError> {
        match batch.leaves.remove(&offset) {
            Some(leaf) => Ok(leaf),
            None => self.load_leaf(offset),
        }
    }

    fn staged_index(
        &mut self,
        batch: &mut SplitBatch<K, V>,
        offset: Offset,
    ) -> Result<IndexPage<K>, BTreeError> {
        match batch.indexes.remove(&offset) {
            Some(page) => Ok(page),
            None => self.load_index(offset),
        }
    }

    /// Write every staged page, then apply the header changes.
    ///
    /// # Post-conditions
    /// - On error, no staged page has been written and the header is unchanged
    fn commit(&mut self, batch: SplitBatch<K, V>) -> Result<(), BTreeError> {
        // Reject the whole split if any page outgrew its block
        for leaf in batch.leaves.values() {
            PageStore::check_leaf_fits(leaf)?;
        }
        for page in batch.indexes.values() {
            PageStore::check_index_fits(page)?;
        }

        for leaf in batch.leaves.values() {
            self.save_leaf(leaf)?;
        }
        for page in batch.indexes.values() {
            self.save_index(page)?;
        }

        let header = self.store.header_mut();
        if let Some(root) = batch.root {
            header.root_offset = root;
            header.root_is_leaf = false;
        }
        if let Some(last_leaf) = batch.last_leaf {
            header.last_leaf = last_leaf;
        }
        Ok(())
    }

    fn set_parent(
        &mut self,
        child: Offset,
        is_leaf: bool,
        parent: Offset,
    ) -> Result<(), BTreeError> {
        if is_leaf {
            let mut leaf = self.load_leaf(child)?;
            leaf.links.parent = Some(parent);
            self.save_leaf(&leaf)
        } else {
            let mut page = self.load_index(child)?;
            page.links.parent = Some(parent);
            self.save_index(&page)
        }
    }

    /// In-order successor of `leaf.entries[index]`.
    fn successor(
        &mut self,
        leaf: &LeafPage<K, V>,
        index: usize,
    ) -> Result<Option<K>, BTreeError> {
        if let Some(entry) = leaf.entries.get(index + 1) {
            return Ok(Some(entry.key.clone()));
        }
        match leaf.links.next {
            Some(next) => {
                let next_leaf = self.load_leaf(next)?;
                next_leaf
                    .first_key()
                    .cloned()
                    .map(Some)
                    .ok_or_else(|| BTreeError::Corrupt(format!("empty leaf at offset {next}")))
            }
            None => Ok(None),
        }
    }

    /// Replace every ancestor separator equal to `key`.
    fn replace_separator(
        &mut self,
        start: Option<Offset>,
        key: &K,
        replacement: &K,
    ) -> Result<(), BTreeError> {
        let mut current = start;
        while let Some(offset) = current {
            let mut page = self.load_index(offset)?;
            if let Ok(i) = page.find(key, &self.order_by) {
                page.keys[i] = replacement.clone();
                self.save_index(&page)?;
            }
            current = page.links.parent;
        }
        Ok(())
    }

    /// Resolve a deficient non-root leaf: borrow left, borrow right, merge
    /// left, merge right, in that order.
    fn rebalance_leaf(&mut self, mut leaf: LeafPage<K, V>) -> Result<(), BTreeError> {
        let t = self.thresholds();
        let (mut parent, index) = self.parent_of(leaf.links.parent, leaf.offset())?;

        // Borrow the left sibling's last entry; it becomes our separator
        let mut left = match index.checked_sub(1) {
            Some(i) => Some(self.load_leaf(child_at(&parent, i)?)?),
            None => None,
        };
        if let Some(left) = left.as_mut().filter(|l| l.is_lendable(&t)) {
            let entry = left.entries.pop().ok_or_else(|| corrupt_empty(left.offset()))?;
            parent.keys[index - 1] = entry.key.clone();
            leaf.entries.insert(0, entry);
            self.save_leaf(left)?;
            self.save_leaf(&leaf)?;
            debug!(leaf = leaf.offset(), from = left.offset(), "Borrowed from left leaf");
            return self.save_index(&parent);
        }

        // Borrow the right sibling's first entry and advance its separator
        let mut right = match parent.children.get(index + 1) {
            Some(&offset) => Some(self.load_leaf(offset)?),
            None => None,
        };
        if let Some(right) = right.as_mut().filter(|r| r.is_lendable(&t)) {
            let entry = right.delete_at(0);
            leaf.entries.push(entry);
            parent.keys[index] = right
                .first_key()
                .cloned()
                .ok_or_else(|| corrupt_empty(right.offset()))?;
            self.save_leaf(right)?;
            self.save_leaf(&leaf)?;
            debug!(leaf = leaf.offset(), from = right.offset(), "Borrowed from right leaf");
            return self.save_index(&parent);
        }

        // Neither sibling can lend, so merge and drop one separator
        if let Some(mut left) = left {
            left.entries.append(&mut leaf.entries);
            left.links.next = leaf.links.next;
            self.relink_leaf_previous(leaf.links.next, left.offset())?;
            parent.delete_at(index - 1);
            parent.delete_child_at(index);
            self.save_leaf(&left)?;
            debug!(leaf = leaf.offset(), into = left.offset(), "Merged leaf into left");
        } else if let Some(mut right) = right {
            leaf.entries.append(&mut right.entries);
            leaf.links.next = right.links.next;
            self.relink_leaf_previous(right.links.next, leaf.offset())?;
            parent.delete_at(index);
            parent.delete_child_at(index + 1);
            self.save_leaf(&leaf)?;
            debug!(leaf = leaf.offset(), from = right.offset(), "Merged right leaf");
        } else {
            return Err(BTreeError::Corrupt(format!(
                "leaf {} has no siblings under parent {}",
                leaf.offset(),
                parent.offset()
            )));
        }

        self.after_child_merge(parent)
    }

    /// Resolve a deficient non-root index page by rotating a key through the
    /// parent or merging with a sibling.
    fn rebalance_index(&mut self, mut page: IndexPage<K>) -> Result<(), BTreeError> {
        let t = self.thresholds();
        let (mut parent, index) = self.parent_of(page.links.parent, page.offset())?;

        // Rotate left: the parent separator comes down, the left's last key goes up
        let mut left = match index.checked_sub(1) {
            Some(i) => Some(self.load_index(child_at(&parent, i)?)?),
            None => None,
        };
        if let Some(left) = left.as_mut().filter(|l| l.is_lendable(&t)) {
            let child = left.children.pop().ok_or_else(|| corrupt_empty(left.offset()))?;
            let separator = left.keys.pop().ok_or_else(|| corrupt_empty(left.offset()))?;
            let down = std::mem::replace(&mut parent.keys[index - 1], separator);
            page.insert_at(0, down);
            page.insert_child_at(0, child);
            self.set_parent(child, page.children_are_leaves, page.offset())?;
            self.save_index(left)?;
            self.save_index(&page)?;
            debug!(page = page.offset(), from = left.offset(), "Borrowed from left index page");
            return self.save_index(&parent);
        }

        // Rotate right
        let mut right = match parent.children.get(index + 1) {
            Some(&offset) => Some(self.load_index(offset)?),
            None => None,
        };
        if let Some(right) = right.as_mut().filter(|r| r.is_lendable(&t)) {
            let child = right.delete_child_at(0);
            let separator = right.delete_at(0);
            let down = std::mem::replace(&mut parent.keys[index], separator);
            page.keys.push(down);
            page.children.push(child);
            self.set_parent(child, page.children_are_leaves, page.offset())?;
            self.save_index(right)?;
            self.save_index(&page)?;
            debug!(page = page.offset(), from = right.offset(), "Borrowed from right index page");
            return self.save_index(&parent);
        }

        // Merge, pulling the separator down between the two key runs
        if let Some(mut left) = left.filter(|l| l.is_mergeable(&page, &t)) {
            left.keys.push(parent.delete_at(index - 1));
            parent.delete_child_at(index);
            left.keys.append(&mut page.keys);
            for &child in &page.children {
                self.set_parent(child, left.children_are_leaves, left.offset())?;
            }
            left.children.append(&mut page.children);
            left.links.next = page.links.next;
            self.relink_index_previous(page.links.next, left.offset())?;
            self.save_index(&left)?;
            debug!(page = page.offset(), into = left.offset(), "Merged index page into left");
        } else if let Some(mut right) = right.filter(|r| page.is_mergeable(r, &t)) {
            page.keys.push(parent.delete_at(index));
            parent.delete_child_at(index + 1);
            page.keys.append(&mut right.keys);
            for &child in &right.children {
                self.set_parent(child, page.children_are_leaves, page.offset())?;
            }
            page.children.append(&mut right.children);
            page.links.next = right.links.next;
            self.relink_index_previous(right.links.next, page.offset())?;
            self.save_index(&page)?;
            debug!(page = page.offset(), from = right.offset(), "Merged right index page");
        } else {
            return Err(BTreeError::Corrupt(format!(
                "index page {} can neither borrow nor merge",
                page.offset()
            )));
        }

        self.after_child_merge(parent)
    }

    /// Persist a parent that just lost a child, collapsing or rebalancing it.
    fn after_child_merge(&mut self, parent: IndexPage<K>) -> Result<(), BTreeError> {
        if parent.links.parent.is_none() {
            if parent.is_empty() {
                return self.collapse_root(&parent);
            }
            return self.save_index(&parent);
        }

        if parent.is_deficient(&self.thresholds()) {
            self.rebalance_index(parent)
        } else {
            self.save_index(&parent)
        }
    }

    /// Promote the only child of an empty root. The old root page is orphaned.
    fn collapse_root(&mut self, root: &IndexPage<K>) -> Result<(), BTreeError> {
        let child = child_at(root, 0)?;
        if root.children_are_leaves {
            let mut leaf = self.load_leaf(child)?;
            leaf.links.parent = None;
            self.save_leaf(&leaf)?;
        } else {
            let mut page = self.load_index(child)?;
            page.links.parent = None;
            self.save_index(&page)?;
        }

        let header = self.store.header_mut();
        header.root_offset = child;
        header.root_is_leaf = root.children_are_leaves;
        debug!(old_root = root.offset(), new_root = child, "Collapsed root");
        Ok(())
    }

    fn parent_of(
        &mut self,
        parent: Option<Offset>,
        child: Offset,
    ) -> Result<(IndexPage<K>, usize), BTreeError> {
        let parent_offset = parent
            .ok_or_else(|| BTreeError::Corrupt(format!("page {child} has no parent")))?;
        let page = self.load_index(parent_offset)?;
        let index = page.position_of_child(child).ok_or_else(|| {
            BTreeError::Corrupt(format!("page {child} missing from parent {parent_offset}"))
        })?;
        Ok((page, index))
    }

    fn relink_leaf_previous(
        &mut self,
        next: Option<Offset>,
        survivor: Offset,
    ) -> Result<(), BTreeError> {
        match next {
            Some(next) => {
                let mut next_leaf = self.load_leaf(next)?;
                next_leaf.links.previous = Some(survivor);
                self.save_leaf(&next_leaf)
            }
            None => {
                self.store.header_mut().last_leaf = survivor;
                Ok(())
            }
        }
    }

    fn relink_index_previous(
        &mut self,
        next: Option<Offset>,
        survivor: Offset,
    ) -> Result<(), BTreeError> {
        if let Some(next) = next {
            let mut next_page = self.load_index(next)?;
            next_page.links.previous = Some(survivor);
            self.save_index(&next_page)?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum Edge {
    First,
    Last,
}

/// Pages and header changes produced by one split cascade, keyed by offset.
struct SplitBatch<K, V> {
    leaves: BTreeMap<Offset, LeafPage<K, V>>,
    indexes: BTreeMap<Offset, IndexPage<K>>,
    root: Option<Offset>,
    last_leaf: Option<Offset>,
}

impl<K, V> SplitBatch<K, V> {
    const fn new() -> Self {
        Self {
            leaves: BTreeMap::new(),
            indexes: BTreeMap::new(),
            root: None,
            last_leaf: None,
        }
    }
}

fn child_at<K>(page: &IndexPage<K>, index: usize) -> Result<Offset, BTreeError> {
    page.children.get(index).copied().ok_or_else(|| {
        BTreeError::Corrupt(format!(
            "index page {} has no child {index}",
            page.offset()
        ))
    })
}

fn corrupt_empty(offset: Offset) -> BTreeError {
    BTreeError::Corrupt(format!("lendable page {offset} is empty"))
}

/// Errors that can occur during B+tree operations.
#[derive(Debug)]
pub enum BTreeError {
    /// Page store error.
    Store(StoreError),
    /// The file's page structure is inconsistent.
    Corrupt(String),
}

impl std::fmt::Display for BTreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Store(e) => write!(f, "store error: {e}"),
            Self::Corrupt(msg) => write!(f, "corrupt tree: {msg}"),
        }
    }
}

impl std::error::Error for BTreeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(e) => Some(e),
            Self::Corrupt(_) => None,
        }
    }
}

impl From<StoreError> for BTreeError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<MetadataError> for BTreeError {
    fn from(e: MetadataError) -> Self {
        Self::Store(StoreError::Metadata(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::block::BlockError;
    use crate::storage::btree::OrderBy;
    use crate::storage::cache::LruPageCache;
    use crate::testing::{check_invariants, keys_forward, new_tree, tree_path, tree_with_keys};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeMap;
    use std::num::NonZeroUsize;
    use tempfile::tempdir;

    /// Keys of every leaf, following the chain from the first leaf.
    fn leaf_keys(tree: &mut BTree<u64, u64>) -> Vec<Vec<u64>> {
        let mut leaves = Vec::new();
        let mut next = Some(tree.metadata().first_leaf);
        while let Some(offset) = next {
            let leaf = tree.load_leaf(offset).expect("load leaf");
            leaves.push(leaf.entries.iter().map(|e| e.key).collect());
            next = leaf.links.next;
        }
        leaves
    }

    fn assert_valid(tree: &mut BTree<u64, u64>) {
        if let Err(e) = check_invariants(tree) {
            panic!("invariant violated: {e}");
        }
    }

    #[test]
    fn test_btree_basic_operations() {
        let dir = tempdir().expect("create temp dir");
        let mut tree = new_tree(&dir, 4);

        assert!(tree.is_empty());
        assert_eq!(tree.put(1, 100).expect("put 1"), None);
        assert_eq!(tree.put(2, 200).expect("put 2"), None);
        assert_eq!(tree.put(3, 300).expect("put 3"), None);

        assert_eq!(tree.get(&1).expect("get 1"), Some(100));
        assert_eq!(tree.get(&2).expect("get 2"), Some(200));
        assert_eq!(tree.get(&3).expect("get 3"), Some(300));
        assert_eq!(tree.get(&4).expect("get 4"), None);
        assert_eq!(tree.count(), 3);
        assert_eq!(tree.index_name(), "test");
    }

    #[test]
    fn test_btree_update_keeps_count() {
        let dir = tempdir().expect("create temp dir");
        let mut tree = tree_with_keys(&dir, 4, &[1, 2, 3, 4, 5]);

        assert_eq!(tree.put(3, 999).expect("update"), Some(30));
        assert_eq!(tree.put(3, 999).expect("update again"), Some(999));
        assert_eq!(tree.get(&3).expect("get"), Some(999));
        assert_eq!(tree.count(), 5);
        assert_eq!(keys_forward(&mut tree), vec![1, 2, 3, 4, 5]);
        assert_valid(&mut tree);
    }

    #[test]
    fn test_btree_delete_missing() {
        let dir = tempdir().expect("create temp dir");
        let mut tree = new_tree(&dir, 4);
        assert_eq!(tree.delete(&1).expect("delete on empty"), None);

        tree.put(1, 10).expect("put");
        assert_eq!(tree.delete(&2).expect("delete missing"), None);
        assert_eq!(tree.count(), 1);
        assert_eq!(tree.delete(&1).expect("delete"), Some(10));
        assert_eq!(tree.get(&1).expect("get"), None);
        assert!(tree.is_empty());
    }

    #[test]
    fn test_order_3_growth_and_delete() {
        let dir = tempdir().expect("create temp dir");
        let mut tree = new_tree(&dir, 3);

        tree.put(1, 100).expect("put");
        tree.put(2, 100).expect("put");
        assert!(tree.metadata().root_is_leaf);
        tree.put(3, 100).expect("put");
        assert!(!tree.metadata().root_is_leaf, "first split creates a root");

        for k in 4..=7 {
            tree.put(k, 100).expect("put");
            assert_valid(&mut tree);
        }
        let root = tree
            .load_index(tree.metadata().root_offset)
            .expect("load root");
        assert!(!root.children_are_leaves, "tree should have grown to three levels");

        assert_eq!(tree.get(&7).expect("get 7"), Some(100));
        assert_eq!(tree.get(&6).expect("get 6"), Some(100));
        assert_eq!(tree.delete(&6).expect("delete 6"), Some(100));
        assert_eq!(tree.get(&6).expect("get 6"), None);
        assert_eq!(tree.get(&7).expect("get 7"), Some(100));
        assert_eq!(tree.count(), 6);
        assert_valid(&mut tree);
    }

    #[test]
    fn test_order_32_cursor_both_directions() {
        let dir = tempdir().expect("create temp dir");
        let mut tree = tree_with_keys(&dir, 32, &(1..=10).collect::<Vec<_>>());

        let mut cursor = tree.seek_first().expect("seek first");
        let mut forward = Vec::new();
        while cursor.has_next() {
            let (k, v) = cursor.next_entry().expect("next").expect("entry");
            assert_eq!(v, k * 10);
            forward.push(k);
        }
        assert_eq!(forward, (1..=10).collect::<Vec<_>>());

        let mut cursor = tree.seek_last().expect("seek last");
        let mut backward = Vec::new();
        while cursor.has_previous() {
            backward.push(cursor.previous_entry().expect("previous").expect("entry").0);
        }
        assert_eq!(backward, (1..=10).rev().collect::<Vec<_>>());
    }

    #[test]
    fn test_order_4_borrow_then_merge() {
        let dir = tempdir().expect("create temp dir");
        let mut tree = tree_with_keys(&dir, 4, &[1, 2, 3, 4, 5, 6]);
        assert_eq!(leaf_keys(&mut tree), vec![vec![1, 2], vec![3, 4], vec![5, 6]]);

        tree.delete(&1).expect("delete 1");
        assert_eq!(leaf_keys(&mut tree), vec![vec![2], vec![3, 4], vec![5, 6]]);

        // [2] empties and borrows from the lendable right sibling.
        tree.delete(&2).expect("delete 2");
        assert_eq!(leaf_keys(&mut tree), vec![vec![3], vec![4], vec![5, 6]]);
        assert_valid(&mut tree);

        // [3] empties, the right sibling cannot lend, so they merge.
        tree.delete(&3).expect("delete 3");
        assert_eq!(leaf_keys(&mut tree), vec![vec![4], vec![5, 6]]);
        assert_valid(&mut tree);
        assert_eq!(tree.count(), 3);
    }

    #[test]
    fn test_order_4_borrow_from_left() {
        let dir = tempdir().expect("create temp dir");
        let mut tree = tree_with_keys(&dir, 4, &[10, 20, 30, 40, 15]);
        assert_eq!(leaf_keys(&mut tree), vec![vec![10, 15, 20], vec![30, 40]]);

        tree.delete(&30).expect("delete 30");
        tree.delete(&40).expect("delete 40");
        assert_eq!(leaf_keys(&mut tree), vec![vec![10, 15], vec![20]]);
        assert_valid(&mut tree);
        assert_eq!(tree.get(&20).expect("get"), Some(200));
    }

    #[test]
    fn test_root_collapses_to_leaf() {
        let dir = tempdir().expect("create temp dir");
        let mut tree = tree_with_keys(&dir, 4, &[1, 2, 3, 4]);
        assert!(!tree.metadata().root_is_leaf);

        tree.delete(&1).expect("delete 1");
        tree.delete(&3).expect("delete 3");
        assert_eq!(leaf_keys(&mut tree), vec![vec![2], vec![4]]);

        // Neither leaf can lend, so they merge and the root empties.
        tree.delete(&4).expect("delete 4");
        assert!(tree.metadata().root_is_leaf);
        assert_eq!(leaf_keys(&mut tree), vec![vec![2]]);
        assert_valid(&mut tree);

        tree.delete(&2).expect("delete 2");
        assert!(tree.is_empty());
        assert_valid(&mut tree);
        assert_eq!(keys_forward(&mut tree), Vec::<u64>::new());
    }

    #[test]
    fn test_delete_replaces_promoted_separator() {
        let dir = tempdir().expect("create temp dir");
        let keys: Vec<u64> = (1..=40).collect();
        let mut tree = tree_with_keys(&dir, 3, &keys);

        // Ascending deletes keep draining the leftmost leaf, forcing borrows
        // and merges at every level.
        for k in 1..=40 {
            assert_eq!(tree.delete(&k).expect("delete"), Some(k * 10));
            assert_valid(&mut tree);
            assert_eq!(tree.get(&k).expect("get"), None);
        }
        assert!(tree.is_empty());
        assert!(tree.metadata().root_is_leaf);
    }

    #[test]
    fn test_descending_deletes() {
        let dir = tempdir().expect("create temp dir");
        let keys: Vec<u64> = (1..=60).collect();
        let mut tree = tree_with_keys(&dir, 5, &keys);

        for k in (1..=60).rev() {
            tree.delete(&k).expect("delete");
            assert_valid(&mut tree);
        }
        assert!(tree.is_empty());
    }

    #[test]
    fn test_random_workload_matches_model() {
        for order in [3, 4, 5, 32] {
            let dir = tempdir().expect("create temp dir");
            let mut tree = new_tree(&dir, order);
            let mut model = BTreeMap::new();
            let mut rng = StdRng::seed_from_u64(0x5eed + order as u64);

            for step in 0..600 {
                let key = rng.random_range(0..200u64);
                if rng.random_bool(0.6) {
                    let value = rng.random_range(0..1_000_000u64);
                    assert_eq!(
                        tree.put(key, value).expect("put"),
                        model.insert(key, value),
                        "order {order} step {step}: put {key}"
                    );
                } else {
                    assert_eq!(
                        tree.delete(&key).expect("delete"),
                        model.remove(&key),
                        "order {order} step {step}: delete {key}"
                    );
                }

                if let Err(e) = check_invariants(&mut tree) {
                    panic!("order {order} step {step}: {e}");
                }
            }

            assert_eq!(tree.count(), model.len() as u64);
            let expected: Vec<u64> = model.keys().copied().collect();
            assert_eq!(keys_forward(&mut tree), expected);
            for (k, v) in &model {
                assert_eq!(tree.get(k).expect("get"), Some(*v));
            }
        }
    }

    #[test]
    fn test_get_many() {
        let dir = tempdir().expect("create temp dir");
        let keys: Vec<u64> = (0..100).map(|k| k * 3).collect();
        let mut tree = tree_with_keys(&dir, 4, &keys);

        let probes = [0, 1, 3, 4, 150, 151, 297, 298, 1000];
        let found = tree.get_many(&probes).expect("get many");
        assert_eq!(
            found,
            vec![
                Some(0),
                None,
                Some(30),
                None,
                Some(1500),
                None,
                Some(2970),
                None,
                None
            ]
        );
        assert!(tree.get_many(&[]).expect("empty batch").is_empty());

        let unsorted = [297, 3, 150];
        assert_eq!(
            tree.get_many(&unsorted).expect("unsorted batch"),
            vec![Some(2970), Some(30), Some(1500)]
        );
    }

    #[test]
    fn test_btree_persistence() {
        let dir = tempdir().expect("create temp dir");
        let path = tree_path(&dir, "test");
        let keys: Vec<u64> = (1..=200).rev().collect();

        {
            let mut tree = tree_with_keys(&dir, 5, &keys);
            for k in (1..=200).step_by(3) {
                tree.delete(&k).expect("delete");
            }
            tree.sync().expect("sync");
        }

        let mut tree: BTree<u64, u64> = BTree::open(&path, BufferPool::new(8)).expect("reopen");
        let expected: Vec<u64> = (1..=200).filter(|k| (k - 1) % 3 != 0).collect();
        assert_eq!(tree.count(), expected.len() as u64);
        assert_eq!(keys_forward(&mut tree), expected);
        assert_eq!(tree.get(&2).expect("get"), Some(20));
        assert_eq!(tree.get(&1).expect("get"), None);
        assert_valid(&mut tree);

        tree.put(1, 11).expect("put after reopen");
        assert_eq!(tree.get(&1).expect("get"), Some(11));
        assert_valid(&mut tree);
    }

    #[test]
    fn test_open_or_create() {
        let dir = tempdir().expect("create temp dir");
        let path = tree_path(&dir, "lazy");
        std::fs::write(&path, b"").expect("create empty file");

        {
            let mut tree: BTree<u64, u64> =
                BTree::open_or_create(&path, "lazy", 4, BufferPool::new(4)).expect("create");
            assert!(tree.is_empty());
            tree.put(7, 70).expect("put");
        }

        let mut tree: BTree<u64, u64> =
            BTree::open_or_create(&path, "ignored", 8, BufferPool::new(4)).expect("open");
        assert_eq!(tree.metadata().order, 4);
        assert_eq!(tree.index_name(), "lazy");
        assert_eq!(tree.get(&7).expect("get"), Some(70));
    }

    #[test]
    fn test_create_rejects_bad_order_and_existing_file() {
        let dir = tempdir().expect("create temp dir");
        let path = tree_path(&dir, "bad");
        let result = BTree::<u64, u64>::create(&path, "bad", 2, BufferPool::new(4));
        assert!(matches!(
            result,
            Err(BTreeError::Store(StoreError::Metadata(
                MetadataError::InvalidOrder(2)
            )))
        ));

        let _tree = new_tree(&dir, 4);
        let existing = tree_path(&dir, "test");
        let result = BTree::<u64, u64>::create(&existing, "test", 4, BufferPool::new(4));
        assert!(matches!(
            result,
            Err(BTreeError::Store(StoreError::AlreadyExists(_)))
        ));
    }

    #[test]
    fn test_oversized_split_leaves_tree_intact() {
        let dir = tempdir().expect("create temp dir");
        let path = tree_path(&dir, "wide");
        let mut tree: BTree<String, u64> =
            BTree::create(&path, "wide", 64, BufferPool::new(8)).expect("create tree");
        let wide_key = |n: u64| format!("{n:0200}");

        // 200-byte separators overflow an index block long before 64 keys
        let mut failure = None;
        for n in 0..2_000u64 {
            if let Err(e) = tree.put(wide_key(n), n) {
                failure = Some((n, e));
                break;
            }
        }
        let Some((failed, error)) = failure else {
            panic!("index page never outgrew its block");
        };
        assert!(matches!(
            error,
            BTreeError::Store(StoreError::Block(BlockError::PayloadTooLarge { .. }))
        ));

        assert_eq!(tree.count(), failed);
        assert!(tree.get(&wide_key(failed)).expect("get").is_none());
        if let Err(e) = check_invariants(&mut tree) {
            panic!("invariant violated: {e}");
        }
        assert_eq!(keys_forward(&mut tree), (0..failed).map(wide_key).collect::<Vec<_>>());

        assert_eq!(tree.put(wide_key(0), 99).expect("update in place"), Some(0));
        drop(tree);
        let mut reopened: BTree<String, u64> =
            BTree::open(&path, BufferPool::new(8)).expect("reopen");
        assert_eq!(reopened.count(), failed);
        if let Err(e) = check_invariants(&mut reopened) {
            panic!("invariant violated after reopen: {e}");
        }
    }

    #[test]
    fn test_cache_does_not_change_results() {
        let dir = tempdir().expect("create temp dir");
        let cache = Box::new(LruPageCache::new(NonZeroUsize::new(16).expect("non-zero")));
        let mut cached: BTree<u64, u64> =
            BTree::create(&tree_path(&dir, "cached"), "cached", 4, BufferPool::new(8))
                .expect("create cached")
                .with_cache(cache);
        let mut plain = new_tree(&dir, 4);

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..300 {
            let key = rng.random_range(0..100u64);
            if rng.random_bool(0.7) {
                assert_eq!(
                    cached.put(key, key + 1).expect("put cached"),
                    plain.put(key, key + 1).expect("put plain")
                );
            } else {
                assert_eq!(
                    cached.delete(&key).expect("delete cached"),
                    plain.delete(&key).expect("delete plain")
                );
            }
        }

        assert_eq!(keys_forward(&mut cached), keys_forward(&mut plain));
        check_invariants(&mut cached).expect("cached tree invariants");
    }

    #[test]
    fn test_custom_comparator() {
        let dir = tempdir().expect("create temp dir");
        let reversed = OrderBy(|a: &String, b: &String| b.cmp(a));
        let mut tree: BTree<String, u32, _> = BTree::create_with_comparator(
            &tree_path(&dir, "names"),
            "names",
            3,
            BufferPool::new(8),
            reversed,
        )
        .expect("create");

        for (i, name) in ["delta", "alpha", "echo", "charlie", "bravo"].iter().enumerate() {
            tree.put((*name).to_string(), u32::try_from(i).expect("small")).expect("put");
        }
        check_invariants(&mut tree).expect("invariants");

        let names = keys_forward(&mut tree);
        assert_eq!(names, vec!["echo", "delta", "charlie", "bravo", "alpha"]);
        assert_eq!(tree.get(&"charlie".to_string()).expect("get"), Some(3));

        tree.delete(&"echo".to_string()).expect("delete");
        tree.delete(&"delta".to_string()).expect("delete");
        check_invariants(&mut tree).expect("invariants after delete");
        assert_eq!(keys_forward(&mut tree), vec!["charlie", "bravo", "alpha"]);
    }
}
