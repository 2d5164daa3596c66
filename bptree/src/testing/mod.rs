//! Test fixtures and a structural checker for tree files.

use std::fmt::Debug;
use std::path::PathBuf;

use tempfile::TempDir;

use crate::storage::block::Offset;
use crate::storage::btree::{BTree, KeyOrder, PageLinks, Storable};
use crate::storage::buffer_pool::BufferPool;

/// Path for a tree file inside `dir`.
pub fn tree_path(dir: &TempDir, name: &str) -> PathBuf {
    dir.path().join(format!("{name}.idx"))
}

/// Create an empty `u64 -> u64` tree of `order` in `dir`.
#[allow(clippy::expect_used)]
pub fn new_tree(dir: &TempDir, order: usize) -> BTree<u64, u64> {
    BTree::create(&tree_path(dir, "test"), "test", order, BufferPool::new(8))
        .expect("create tree")
}

/// Create a tree holding `keys`, each mapped to `key * 10`.
#[allow(clippy::expect_used)]
pub fn tree_with_keys(dir: &TempDir, order: usize, keys: &[u64]) -> BTree<u64, u64> {
    let mut tree = new_tree(dir, order);
    for &k in keys {
        tree.put(k, k * 10).expect("put");
    }
    tree
}

/// Collect every key by walking forward from the first leaf.
#[allow(clippy::expect_used)]
pub fn keys_forward<K, V, C>(tree: &mut BTree<K, V, C>) -> Vec<K>
where
    K: Storable,
    V: Storable,
    C: KeyOrder<K>,
{
    let mut cursor = tree.seek_first().expect("seek first");
    let mut keys = Vec::new();
    while let Some((k, _)) = cursor.next_entry().expect("next") {
        keys.push(k);
    }
    keys
}

#[derive(Default)]
struct Walk {
    leaves: Vec<PageLinks>,
    levels: Vec<Vec<PageLinks>>,
    leaf_depth: Option<usize>,
    entries: u64,
}

/// Verify every structural invariant of `tree`.
///
/// Checks key order and bounds, occupancy, child counts, parent pointers,
/// sibling chains at every level, separators equal to subtree minima, uniform
/// leaf depth, and the header's leaf offsets and count.
pub fn check_invariants<K, V, C>(tree: &mut BTree<K, V, C>) -> Result<(), String>
where
    K: Storable + Debug,
    V: Storable,
    C: KeyOrder<K>,
{
    let meta = tree.metadata().clone();
    let mut walk = Walk::default();
    visit(
        tree,
        &mut walk,
        meta.root_offset,
        meta.root_is_leaf,
        None,
        0,
        None,
        None,
    )?;

    check_chain("leaf", &walk.leaves)?;
    for (depth, level) in walk.levels.iter().enumerate() {
        check_chain(&format!("index level {depth}"), level)?;
    }

    let first = walk.leaves.first().map(|l| l.offset);
    let last = walk.leaves.last().map(|l| l.offset);
    if first != Some(meta.first_leaf) || last != Some(meta.last_leaf) {
        return Err(format!(
            "header leaf range {}..{} does not match walk {first:?}..{last:?}",
            meta.first_leaf, meta.last_leaf
        ));
    }
    if walk.entries != meta.count {
        return Err(format!(
            "header count {} but {} entries reachable",
            meta.count, walk.entries
        ));
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)] // recursion state
fn visit<K, V, C>(
    tree: &mut BTree<K, V, C>,
    walk: &mut Walk,
    offset: Offset,
    is_leaf: bool,
    parent: Option<Offset>,
    depth: usize,
    lower: Option<&K>,
    upper: Option<&K>,
) -> Result<Option<K>, String>
where
    K: Storable + Debug,
    V: Storable,
    C: KeyOrder<K>,
{
    let t = tree.metadata().thresholds;

    if is_leaf {
        let leaf = tree.load_leaf(offset).map_err(|e| e.to_string())?;
        check_links(&leaf.links, offset, parent)?;
        let keys: Vec<&K> = leaf.entries.iter().map(|e| &e.key).collect();
        check_keys(tree.order_by(), &keys, lower, upper, offset)?;

        let len = leaf.len();
        if len > t.max_leaf || (parent.is_some() && len < t.min_leaf) {
            return Err(format!("leaf {offset} holds {len} entries"));
        }
        match walk.leaf_depth {
            Some(d) if d != depth => {
                return Err(format!("leaf {offset} at depth {depth}, expected {d}"));
            }
            _ => walk.leaf_depth = Some(depth),
        }

        walk.leaves.push(leaf.links);
        walk.entries += len as u64;
        return Ok(leaf.first_key().cloned());
    }

    let page = tree.load_index(offset).map_err(|e| e.to_string())?;
    check_links(&page.links, offset, parent)?;
    let keys: Vec<&K> = page.keys.iter().collect();
    check_keys(tree.order_by(), &keys, lower, upper, offset)?;

    let len = page.len();
    let min = if parent.is_some() { t.min_index } else { 1 };
    if len >= t.max_index || len < min {
        return Err(format!("index page {offset} holds {len} keys"));
    }
    if page.children.len() != len + 1 {
        return Err(format!(
            "index page {offset} has {len} keys and {} children",
            page.children.len()
        ));
    }

    if walk.levels.len() <= depth {
        walk.levels.resize_with(depth + 1, Vec::new);
    }
    walk.levels[depth].push(page.links);

    let mut subtree_min = None;
    for (i, &child) in page.children.iter().enumerate() {
        let child_lower = if i == 0 { lower } else { Some(&page.keys[i - 1]) };
        let child_upper = if i == len { upper } else { Some(&page.keys[i]) };
        let child_min = visit(
            tree,
            walk,
            child,
            page.children_are_leaves,
            Some(offset),
            depth + 1,
            child_lower,
            child_upper,
        )?;

        if i == 0 {
            subtree_min = child_min;
        } else {
            let separator = &page.keys[i - 1];
            let equal = child_min
                .as_ref()
                .is_some_and(|m| tree.order_by().compare(m, separator).is_eq());
            if !equal {
                return Err(format!(
                    "separator {separator:?} in page {offset} but child {child} starts at {child_min:?}"
                ));
            }
        }
    }
    Ok(subtree_min)
}

fn check_links(links: &PageLinks, offset: Offset, parent: Option<Offset>) -> Result<(), String> {
    if links.offset != offset {
        return Err(format!("page at {offset} records offset {}", links.offset));
    }
    if links.parent != parent {
        return Err(format!(
            "page {offset} records parent {:?}, expected {parent:?}",
            links.parent
        ));
    }
    Ok(())
}

fn check_keys<K: Debug, C: KeyOrder<K>>(
    order_by: &C,
    keys: &[&K],
    lower: Option<&K>,
    upper: Option<&K>,
    offset: Offset,
) -> Result<(), String> {
    for pair in keys.windows(2) {
        if !order_by.compare(pair[0], pair[1]).is_lt() {
            return Err(format!(
                "page {offset}: keys {:?} and {:?} out of order",
                pair[0], pair[1]
            ));
        }
    }
    for key in keys {
        if lower.is_some_and(|l| order_by.compare(key, l).is_lt())
            || upper.is_some_and(|u| !order_by.compare(key, u).is_lt())
        {
            return Err(format!("page {offset}: key {key:?} outside its subtree bounds"));
        }
    }
    Ok(())
}

fn check_chain(name: &str, pages: &[PageLinks]) -> Result<(), String> {
    for (i, links) in pages.iter().enumerate() {
        let previous = i.checked_sub(1).map(|p| pages[p].offset);
        let next = pages.get(i + 1).map(|n| n.offset);
        if links.previous != previous || links.next != next {
            return Err(format!(
                "{name} chain broken at page {}: previous {:?} next {:?}, expected {previous:?} {next:?}",
                links.offset, links.previous, links.next
            ));
        }
    }
    Ok(())
}
