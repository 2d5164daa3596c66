//! Secondary indexes over a collection field.
//!
//! Each index key maps to the set of primary keys holding that value, and
//! each primary key to the location of its record. Small sets are stored
//! inline in the index tree's leaf. Once a set grows past the fan-out
//! threshold it moves into a nested tree file of its own, and the index
//! stores only that file's path.
//!
//! # Thread Safety
//!
//! One `RwLock` guards each index. Writers take the write side and use the
//! index's own tree handle. Readers take the read side and open a private
//! handle on the same file, so lookups can run concurrently. Readers lease
//! blocks from the shared pool and fall back to unpooled blocks when it runs
//! dry, so the reader count is not bounded by the pool's capacity.
//!
//! # Relevant keys
//!
//! The `*_relevant` queries only return primary keys found in a caller's
//! set, typically the survivors of another filter. An empty set means no
//! restriction and the unfiltered query runs instead.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::TreeConfig;
use crate::storage::btree::{BTree, BTreeError, Storable};
use crate::storage::buffer_pool::BufferPool;
use crate::storage::cache::cache_for_capacity;

/// Where a record lives in the data files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordLocation {
    pub data_offset: i64,
    pub file_offset: u8,
}

/// Primary keys stored under one index key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound(
    serialize = "P: Serialize",
    deserialize = "P: Deserialize<'de> + Ord"
))]
pub enum Postings<P> {
    Inline(BTreeMap<P, RecordLocation>),
    /// Nested `BTree<P, RecordLocation>` file.
    Nested { path: PathBuf },
}

/// One `(index key, primary key, location)` result row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Posting<K, P> {
    pub key: K,
    pub primary: P,
    pub location: RecordLocation,
}

/// Consecutive rows of a full scan that share one index key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyGroup<K, P> {
    pub key: K,
    pub postings: Vec<(P, RecordLocation)>,
}

type IndexTree<K, P> = BTree<K, Postings<P>>;
type NestedTree<P> = BTree<P, RecordLocation>;

/// A secondary index stored in `<index>/<collection>-<field>.idx.sieve`.
pub struct SecondaryIndex<K, P> {
    collection: String,
    field: String,
    config: TreeConfig,
    path: PathBuf,
    buffer_pool: Arc<BufferPool>,
    tree: RwLock<IndexTree<K, P>>,
}

impl<K, P> SecondaryIndex<K, P>
where
    K: Storable + Ord + Serialize,
    P: Storable + Ord,
{
    /// Open the index for `collection.field`, creating it if needed.
    ///
    /// # Post-conditions
    /// - The index directory exists
    #[allow(clippy::disallowed_methods)] // Arc::clone of the shared pool
    pub fn open(
        config: &TreeConfig,
        collection: &str,
        field: &str,
        buffer_pool: Arc<BufferPool>,
    ) -> Result<Self, SecondaryIndexError> {
        std::fs::create_dir_all(config.index_directory())?;
        let path = config.index_file(collection, field);
        let tree = IndexTree::open_or_create(
            &path,
            &format!("{collection}-{field}"),
            config.order,
            Arc::clone(&buffer_pool),
        )?
        .with_cache(cache_for_capacity(config.page_cache_capacity));
        info!(path = %path.display(), keys = tree.count(), "Opened secondary index");

        Ok(Self {
            collection: collection.to_string(),
            field: field.to_string(),
            config: config.clone(),
            path,
            buffer_pool,
            tree: RwLock::new(tree),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record that `primary` has value `key`, stored at `location`.
    ///
    /// An existing `(key, primary)` pair is overwritten.
    pub fn put(
        &self,
        primary: P,
        key: K,
        location: RecordLocation,
    ) -> Result<(), SecondaryIndexError> {
        let mut tree = self
            .tree
            .write()
            .map_err(|_| SecondaryIndexError::LockPoisoned)?;

        match tree.get(&key)? {
            None => {
                let postings = Postings::Inline(BTreeMap::from([(primary, location)]));
                tree.put(key, postings)?;
            }
            Some(Postings::Inline(mut map)) => {
                if map.contains_key(&primary) || map.len() < self.config.fan_out_threshold {
                    map.insert(primary, location);
                    tree.put(key, Postings::Inline(map))?;
                } else {
                    let path = self.promote(&key, map, primary, location)?;
                    tree.put(key, Postings::Nested { path })?;
                }
            }
            Some(Postings::Nested { path }) => {
                let mut nested = self.open_nested(&path)?;
                nested.put(primary, location)?;
            }
        }
        Ok(())
    }

    /// Every primary key stored under `key`.
    pub fn get(
        &self,
        key: &K,
    ) -> Result<Option<BTreeMap<P, RecordLocation>>, SecondaryIndexError> {
        self.read(|tree| match tree.get(key)? {
            Some(postings) => self.expand(postings).map(Some),
            None => Ok(None),
        })
    }

    /// Whether `primary` is stored under `key`.
    pub fn contains(&self, key: &K, primary: &P) -> Result<bool, SecondaryIndexError> {
        self.read(|tree| match tree.get(key)? {
            None => Ok(false),
            Some(Postings::Inline(map)) => Ok(map.contains_key(primary)),
            Some(Postings::Nested { path }) => {
                let mut nested = self.open_nested(&path)?;
                Ok(nested.get(primary)?.is_some())
            }
        })
    }

    /// Union of the primary keys under each of `keys`.
    pub fn get_many(
        &self,
        keys: &[K],
    ) -> Result<BTreeMap<P, RecordLocation>, SecondaryIndexError> {
        self.union_of(keys, None)
    }

    /// [`Self::get_many`] restricted to primary keys in `relevant`.
    pub fn get_many_relevant(
        &self,
        keys: &[K],
        relevant: &BTreeSet<P>,
    ) -> Result<BTreeMap<P, RecordLocation>, SecondaryIndexError> {
        self.union_of(keys, restriction(relevant))
    }

    /// Locations under each of `keys`, in the given key order. A key listed
    /// twice contributes its locations twice.
    pub fn in_keys_of(&self, keys: &[K]) -> Result<Vec<RecordLocation>, SecondaryIndexError> {
        let mut locations = Vec::new();
        if keys.is_empty() {
            return Ok(locations);
        }

        self.read(|tree| {
            for key in keys {
                if let Some(postings) = tree.get(key)? {
                    locations.extend(self.expand(postings)?.into_values());
                }
            }
            Ok(())
        })?;
        Ok(locations)
    }

    /// Rows for `keys` in the given key order, primary keys ascending within
    /// a key, skipping the first `skip` rows and returning at most `limit`.
    pub fn in_sorted(
        &self,
        keys: &[K],
        limit: usize,
        skip: usize,
    ) -> Result<Vec<Posting<K, P>>, SecondaryIndexError> {
        self.rows_of(keys, None, limit, skip)
    }

    /// [`Self::in_sorted`] restricted to primary keys in `relevant`. Skipped
    /// rows are counted after filtering.
    pub fn in_sorted_relevant(
        &self,
        keys: &[K],
        relevant: &BTreeSet<P>,
        limit: usize,
        skip: usize,
    ) -> Result<Vec<Posting<K, P>>, SecondaryIndexError> {
        self.rows_of(keys, restriction(relevant), limit, skip)
    }

    /// Union of the primary keys under every key in `lower..=upper`.
    pub fn range(
        &self,
        lower: &K,
        upper: &K,
    ) -> Result<BTreeMap<P, RecordLocation>, SecondaryIndexError> {
        self.union_in(lower, upper, None)
    }

    /// [`Self::range`] restricted to primary keys in `relevant`.
    pub fn range_relevant(
        &self,
        lower: &K,
        upper: &K,
        relevant: &BTreeSet<P>,
    ) -> Result<BTreeMap<P, RecordLocation>, SecondaryIndexError> {
        self.union_in(lower, upper, restriction(relevant))
    }

    /// Rows for keys in `lower..=upper` in key order, paged like
    /// [`Self::in_sorted`].
    pub fn range_sorted(
        &self,
        lower: &K,
        upper: &K,
        limit: usize,
        skip: usize,
    ) -> Result<Vec<Posting<K, P>>, SecondaryIndexError> {
        self.rows_in(lower, upper, None, limit, skip)
    }

    /// [`Self::range_sorted`] restricted to primary keys in `relevant`.
    pub fn range_sorted_relevant(
        &self,
        lower: &K,
        upper: &K,
        relevant: &BTreeSet<P>,
        limit: usize,
        skip: usize,
    ) -> Result<Vec<Posting<K, P>>, SecondaryIndexError> {
        self.rows_in(lower, upper, restriction(relevant), limit, skip)
    }

    /// Page through the whole index in ascending key order, primary keys
    /// ascending within a key. Rows are grouped by key.
    pub fn all(
        &self,
        limit: usize,
        skip: usize,
    ) -> Result<Vec<KeyGroup<K, P>>, SecondaryIndexError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut pager = Pager::new(limit, skip);

        self.read(|tree| {
            let mut cursor = tree.seek_first()?;
            while let Some((key, postings)) = cursor.next_entry()? {
                if !pager.offer_all(&key, self.expand(postings)?) {
                    break;
                }
            }
            Ok(())
        })?;
        Ok(group_by_key(pager.rows))
    }

    /// [`Self::all`] in descending key order, primary keys descending within
    /// a key. The exact reverse of an unpaged [`Self::all`].
    pub fn all_reverse(
        &self,
        limit: usize,
        skip: usize,
    ) -> Result<Vec<KeyGroup<K, P>>, SecondaryIndexError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut pager = Pager::new(limit, skip);

        self.read(|tree| {
            let mut cursor = tree.seek_last()?;
            while let Some((key, postings)) = cursor.previous_entry()? {
                if !pager.offer_all(&key, self.expand(postings)?.into_iter().rev()) {
                    break;
                }
            }
            Ok(())
        })?;
        Ok(group_by_key(pager.rows))
    }

    /// Every index key with its primary keys, in key order.
    pub fn entries(&self) -> Result<Vec<(K, BTreeMap<P, RecordLocation>)>, SecondaryIndexError> {
        self.read(|tree| {
            let mut entries = Vec::new();
            for entry in tree.seek_first()? {
                let (key, postings) = entry?;
                entries.push((key, self.expand(postings)?));
            }
            Ok(entries)
        })
    }

    /// Number of distinct index keys.
    pub fn count(&self) -> Result<u64, SecondaryIndexError> {
        let tree = self
            .tree
            .read()
            .map_err(|_| SecondaryIndexError::LockPoisoned)?;
        Ok(tree.count())
    }

    /// Run `f` against a private handle while holding the read lock.
    #[allow(clippy::disallowed_methods)] // Arc::clone of the shared pool
    #[allow(clippy::significant_drop_tightening)] // the guard must outlive `f`
    fn read<T>(
        &self,
        f: impl FnOnce(&mut IndexTree<K, P>) -> Result<T, SecondaryIndexError>,
    ) -> Result<T, SecondaryIndexError> {
        let _guard = self
            .tree
            .read()
            .map_err(|_| SecondaryIndexError::LockPoisoned)?;
        let mut reader = IndexTree::open(&self.path, Arc::clone(&self.buffer_pool))?;
        f(&mut reader)
    }

    fn union_of(
        &self,
        keys: &[K],
        relevant: Option<&BTreeSet<P>>,
    ) -> Result<BTreeMap<P, RecordLocation>, SecondaryIndexError> {
        let mut result = BTreeMap::new();
        if keys.is_empty() {
            return Ok(result);
        }

        let mut sorted = keys.to_vec();
        sorted.sort();
        sorted.dedup();
        self.read(|tree| {
            for postings in tree.get_many(&sorted)?.into_iter().flatten() {
                result.append(&mut self.select(postings, relevant)?);
            }
            Ok(())
        })?;
        Ok(result)
    }

    fn rows_of(
        &self,
        keys: &[K],
        relevant: Option<&BTreeSet<P>>,
        limit: usize,
        skip: usize,
    ) -> Result<Vec<Posting<K, P>>, SecondaryIndexError> {
        let mut pager = Pager::new(limit, skip);
        if keys.is_empty() || limit == 0 {
            return Ok(pager.rows);
        }

        self.read(|tree| {
            for key in keys {
                let Some(postings) = tree.get(key)? else {
                    continue;
                };
                if !pager.offer_all(key, self.select(postings, relevant)?) {
                    break;
                }
            }
            Ok(())
        })?;
        Ok(pager.rows)
    }

    fn union_in(
        &self,
        lower: &K,
        upper: &K,
        relevant: Option<&BTreeSet<P>>,
    ) -> Result<BTreeMap<P, RecordLocation>, SecondaryIndexError> {
        let mut result = BTreeMap::new();
        if lower > upper {
            return Ok(result);
        }

        self.read(|tree| {
            for entry in tree.seek(lower)? {
                let (key, postings) = entry?;
                if key > *upper {
                    break;
                }
                result.append(&mut self.select(postings, relevant)?);
            }
            Ok(())
        })?;
        Ok(result)
    }

    fn rows_in(
        &self,
        lower: &K,
        upper: &K,
        relevant: Option<&BTreeSet<P>>,
        limit: usize,
        skip: usize,
    ) -> Result<Vec<Posting<K, P>>, SecondaryIndexError> {
        let mut pager = Pager::new(limit, skip);
        if lower > upper || limit == 0 {
            return Ok(pager.rows);
        }

        self.read(|tree| {
            for entry in tree.seek(lower)? {
                let (key, postings) = entry?;
                if key > *upper || !pager.offer_all(&key, self.select(postings, relevant)?) {
                    break;
                }
            }
            Ok(())
        })?;
        Ok(pager.rows)
    }

    /// Move `map` plus the new entry into a fresh nested tree.
    fn promote(
        &self,
        key: &K,
        map: BTreeMap<P, RecordLocation>,
        primary: P,
        location: RecordLocation,
    ) -> Result<PathBuf, SecondaryIndexError> {
        let token = key_token(key)?;
        let path = self
            .config
            .sub_index_file(&self.collection, &self.field, &token);
        let mut nested = self.open_or_create_nested(&path, &token)?;
        for (p, l) in map {
            nested.put(p, l)?;
        }
        nested.put(primary, location)?;
        nested.sync()?;

        debug!(
            path = %path.display(),
            entries = nested.count(),
            "Promoted postings to nested tree"
        );
        Ok(path)
    }

    fn expand(
        &self,
        postings: Postings<P>,
    ) -> Result<BTreeMap<P, RecordLocation>, SecondaryIndexError> {
        match postings {
            Postings::Inline(map) => Ok(map),
            Postings::Nested { path } => {
                let mut nested = self.open_nested(&path)?;
                let mut map = BTreeMap::new();
                for entry in nested.seek_first()? {
                    let (primary, location) = entry?;
                    map.insert(primary, location);
                }
                Ok(map)
            }
        }
    }

    /// The postings of one key, optionally cut down to `relevant`.
    ///
    /// A nested tree is searched once per relevant key rather than expanded.
    fn select(
        &self,
        postings: Postings<P>,
        relevant: Option<&BTreeSet<P>>,
    ) -> Result<BTreeMap<P, RecordLocation>, SecondaryIndexError> {
        let Some(relevant) = relevant else {
            return self.expand(postings);
        };
        match postings {
            Postings::Inline(mut map) => {
                map.retain(|primary, _| relevant.contains(primary));
                Ok(map)
            }
            Postings::Nested { path } => {
                let mut nested = self.open_nested(&path)?;
                let mut map = BTreeMap::new();
                for primary in relevant {
                    if let Some(location) = nested.get(primary)? {
                        map.insert(primary.clone(), location);
                    }
                }
                Ok(map)
            }
        }
    }

    #[allow(clippy::disallowed_methods)] // Arc::clone of the shared pool
    fn open_nested(&self, path: &Path) -> Result<NestedTree<P>, SecondaryIndexError> {
        Ok(NestedTree::open(path, Arc::clone(&self.buffer_pool))?)
    }

    #[allow(clippy::disallowed_methods)] // Arc::clone of the shared pool
    fn open_or_create_nested(
        &self,
        path: &Path,
        token: &str,
    ) -> Result<NestedTree<P>, SecondaryIndexError> {
        let name = format!("{}-{}-{token}", self.collection, self.field);
        Ok(NestedTree::open_or_create(
            path,
            &name,
            self.config.sub_tree_order,
            Arc::clone(&self.buffer_pool),
        )?)
    }
}

/// `None` for an empty set, which places no restriction.
fn restriction<P>(relevant: &BTreeSet<P>) -> Option<&BTreeSet<P>> {
    (!relevant.is_empty()).then_some(relevant)
}

/// Fold consecutive rows with equal keys into one group each.
fn group_by_key<K: PartialEq, P>(rows: Vec<Posting<K, P>>) -> Vec<KeyGroup<K, P>> {
    let mut groups: Vec<KeyGroup<K, P>> = Vec::new();
    for row in rows {
        if let Some(group) = groups.last_mut().filter(|g| g.key == row.key) {
            group.postings.push((row.primary, row.location));
            continue;
        }
        groups.push(KeyGroup {
            key: row.key,
            postings: vec![(row.primary, row.location)],
        });
    }
    groups
}

/// File-name-safe token for a key: hex of its encoded bytes.
fn key_token<K: Serialize>(key: &K) -> Result<String, SecondaryIndexError> {
    let bytes = bincode::serialize(key).map_err(SecondaryIndexError::KeyEncoding)?;
    let mut token = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        // Writing to a String cannot fail.
        let _ = write!(token, "{byte:02x}");
    }
    Ok(token)
}

/// Collects result rows after skipping a prefix, up to a limit.
struct Pager<K, P> {
    limit: usize,
    skip: usize,
    rows: Vec<Posting<K, P>>,
}

impl<K: Clone, P> Pager<K, P> {
    const fn new(limit: usize, skip: usize) -> Self {
        Self {
            limit,
            skip,
            rows: Vec::new(),
        }
    }

    /// Offer every primary key of `key`. Returns false once the page is full.
    fn offer_all(
        &mut self,
        key: &K,
        postings: impl IntoIterator<Item = (P, RecordLocation)>,
    ) -> bool {
        for (primary, location) in postings {
            if self.skip > 0 {
                self.skip -= 1;
                continue;
            }
            if self.rows.len() >= self.limit {
                return false;
            }
            self.rows.push(Posting {
                key: key.clone(),
                primary,
                location,
            });
        }
        self.rows.len() < self.limit
    }
}

/// Errors from secondary index operations.
#[derive(Debug)]
pub enum SecondaryIndexError {
    /// Index or nested tree failure.
    Tree(BTreeError),
    /// Creating the index directory failed.
    Io(std::io::Error),
    /// A key could not be encoded into a nested tree file name.
    KeyEncoding(bincode::Error),
    /// The index lock was poisoned by a panicking writer.
    LockPoisoned,
}

impl std::fmt::Display for SecondaryIndexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tree(e) => write!(f, "index tree error: {e}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::KeyEncoding(e) => write!(f, "failed to encode key: {e}"),
            Self::LockPoisoned => write!(f, "index lock poisoned"),
        }
    }
}

impl std::error::Error for SecondaryIndexError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Tree(e) => Some(e),
            Self::Io(e) => Some(e),
            Self::KeyEncoding(e) => Some(e),
            Self::LockPoisoned => None,
        }
    }
}

impl From<BTreeError> for SecondaryIndexError {
    fn from(e: BTreeError) -> Self {
        Self::Tree(e)
    }
}

impl From<std::io::Error> for SecondaryIndexError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
