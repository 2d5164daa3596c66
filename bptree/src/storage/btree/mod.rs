//! Disk-based B+tree.
//!
//! # Structure
//!
//! The tree consists of:
//! - Index pages: separator keys and child offsets, 4 KiB blocks
//! - Leaf pages: key-value entries, doubly linked for range scans, 16 KiB blocks
//!
//! Keys and values are any serde-serializable type. Key order is injected
//! through [`KeyOrder`], defaulting to the key's own `Ord`.
//!
//! # Usage
//!
//! ```
//! use bptree::storage::btree::BTree;
//! use bptree::storage::buffer_pool::BufferPool;
//!
//! let dir = tempfile::tempdir().unwrap();
//! let path = dir.path().join("scores.idx");
//! let mut tree: BTree<u64, String> = BTree::create(&path, "scores", 4, BufferPool::new(8)).unwrap();
//!
//! for k in 1..=10 {
//!     tree.put(k, format!("value-{k}")).unwrap();
//! }
//! assert_eq!(tree.get(&7).unwrap().as_deref(), Some("value-7"));
//!
//! let keys: Vec<u64> = tree.seek(&8).unwrap().map(|e| e.unwrap().0).collect();
//! assert_eq!(keys, vec![8, 9, 10]);
//! ```

mod cursor;
mod index;
mod leaf;
mod node;
mod tree;

pub use cursor::Cursor;
pub use index::IndexPage;
pub use leaf::{LeafEntry, LeafPage, UpdateOutcome};
pub(crate) use node::PageRef;
pub use node::{KeyOrder, NaturalOrder, OrderBy, Page, PageKind, PageLinks, Storable};
pub use tree::{BTree, BTreeError};

