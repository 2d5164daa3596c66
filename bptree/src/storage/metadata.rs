//! Tree header stored in the metadata block at offset 0.
//!
//! The header records everything needed to reopen a tree: its order and the
//! thresholds derived from it, where the root and the leaf chain ends live,
//! how many entries it holds, and where the next page will be allocated.

use serde::{Deserialize, Serialize};

use crate::storage::block::{METADATA_SIZE, Offset};

/// Magic number identifying a tree file: "BPTREEIX"
pub const MAGIC: [u8; 8] = *b"BPTREEIX";

/// Current format version.
pub const FORMAT_VERSION: u32 = 1;

/// Smallest order that yields a valid tree.
pub const MIN_ORDER: usize = 3;

/// Fill limits for leaf and index pages, derived from the tree order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thresholds {
    /// A leaf holding this many entries must split before the next insert.
    pub max_leaf: usize,
    /// A non-root leaf must keep at least this many entries.
    pub min_leaf: usize,
    /// An index page holding this many keys must split.
    pub max_index: usize,
    /// A non-root index page must keep at least this many keys.
    pub min_index: usize,
    /// Split point. Entries at and after it move to the new right page.
    pub mid_point: usize,
}

impl Thresholds {
    /// Derive thresholds for `order`.
    ///
    /// # Pre-conditions
    /// - `order >= MIN_ORDER`
    #[must_use]
    pub const fn for_order(order: usize) -> Self {
        let half = order.div_ceil(2);
        Self {
            max_leaf: order - 1,
            min_leaf: half - 1,
            max_index: order,
            min_index: half - 1,
            mid_point: (order + 1).div_ceil(2) - 1,
        }
    }
}

/// Persistent tree header.
///
/// # Invariants
/// - `magic == MAGIC` and `format_version == FORMAT_VERSION`
/// - `thresholds == Thresholds::for_order(order)`
/// - `next_offset` is past every allocated block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeMetadata {
    pub magic: [u8; 8],
    pub format_version: u32,
    /// Name the tree was created under. Informational only.
    pub index_name: String,
    pub order: usize,
    pub thresholds: Thresholds,
    pub root_offset: Offset,
    /// Whether the root page is a leaf (tree of height one).
    pub root_is_leaf: bool,
    pub first_leaf: Offset,
    pub last_leaf: Offset,
    /// Number of entries in the tree.
    pub count: u64,
    /// Offset the next allocated page will receive.
    pub next_offset: Offset,
}

impl TreeMetadata {
    /// Header for a new, empty tree.
    ///
    /// The root leaf is placed directly after the metadata block, which is
    /// where the store's first allocation lands.
    pub fn new(index_name: &str, order: usize) -> Result<Self, MetadataError> {
        if order < MIN_ORDER {
            return Err(MetadataError::InvalidOrder(order));
        }

        let first_page = METADATA_SIZE as Offset;
        Ok(Self {
            magic: MAGIC,
            format_version: FORMAT_VERSION,
            index_name: index_name.to_string(),
            order,
            thresholds: Thresholds::for_order(order),
            root_offset: first_page,
            root_is_leaf: true,
            first_leaf: first_page,
            last_leaf: first_page,
            count: 0,
            next_offset: first_page,
        })
    }

    /// Check a header read back from disk.
    pub fn validate(&self) -> Result<(), MetadataError> {
        if self.magic != MAGIC {
            return Err(MetadataError::InvalidMagic(self.magic));
        }
        if self.format_version != FORMAT_VERSION {
            return Err(MetadataError::UnsupportedVersion(self.format_version));
        }
        if self.order < MIN_ORDER {
            return Err(MetadataError::InvalidOrder(self.order));
        }
        if self.thresholds != Thresholds::for_order(self.order) {
            return Err(MetadataError::ThresholdMismatch { order: self.order });
        }
        if self.next_offset < METADATA_SIZE as Offset || self.root_offset >= self.next_offset {
            return Err(MetadataError::OffsetOutOfRange {
                root_offset: self.root_offset,
                next_offset: self.next_offset,
            });
        }
        Ok(())
    }
}

/// Errors from validating a tree header.
#[derive(Debug)]
pub enum MetadataError {
    InvalidMagic([u8; 8]),
    UnsupportedVersion(u32),
    InvalidOrder(usize),
    ThresholdMismatch { order: usize },
    OffsetOutOfRange { root_offset: Offset, next_offset: Offset },
}

impl std::fmt::Display for MetadataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidMagic(magic) => write!(f, "invalid magic number: {magic:?}"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported format version: {v}"),
            Self::InvalidOrder(order) => {
                write!(f, "invalid tree order {order}, must be at least {MIN_ORDER}")
            }
            Self::ThresholdMismatch { order } => {
                write!(f, "stored thresholds do not match order {order}")
            }
            Self::OffsetOutOfRange {
                root_offset,
                next_offset,
            } => write!(
                f,
                "root offset {root_offset} is outside allocated range (next offset {next_offset})"
            ),
        }
    }
}

impl std::error::Error for MetadataError {}
