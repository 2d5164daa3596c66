//! Single-file page storage for B+trees.
//!
//! # File Format
//!
//! Each tree lives in its own file of fixed-size blocks addressed by byte
//! offset:
//!
//! - Offset 0: 1 KiB metadata block (magic, order, root, leaf range, count)
//! - Index pages: 4 KiB blocks
//! - Leaf pages: 16 KiB blocks
//!
//! Every block holds a `"<len>:"` prefix followed by a bincode payload of
//! `len` bytes and zero padding. Blocks are appended and never reclaimed.

pub mod block;
pub mod btree;
pub mod buffer_pool;
pub mod cache;
pub mod metadata;
pub mod store;
