//! Fixed-size block framing for the tree file.
//!
//! Every record in the file (the header and each page) is written into a
//! block of a fixed size determined by its class:
//!
//! ```text
//! +----------------+-----------------+------------------------+
//! | "<len>:"       | payload (len)   | zero padding           |
//! +----------------+-----------------+------------------------+
//! ```
//!
//! The length prefix is ASCII decimal followed by a `:` delimiter. The payload
//! is a `bincode` encoding of the record.
//!
//! # Practical order limit
//!
//! Block sizes are fixed, so the usable tree order depends on key and value
//! size. Each separator costs its encoded key plus an 8-byte child offset:
//! with `u64` keys an index block holds about 250 separators, so orders above
//! that cannot be used. An insert whose split would produce a page too large
//! for its block fails with [`BlockError::PayloadTooLarge`] before any page
//! of the split is written.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Byte offset of a block inside the tree file. Used as a page address.
pub type Offset = u64;

/// Size of the header block at offset 0 (1 KiB).
pub const METADATA_SIZE: usize = 1024;

/// Size of an index page block (4 KiB).
pub const INDEX_BLOCK_SIZE: usize = 4 * 1024;

/// Size of a leaf page block (16 KiB). Leaves carry values, so they are larger.
pub const LEAF_BLOCK_SIZE: usize = 16 * 1024;

/// Longest length prefix accepted when decoding, delimiter included.
/// `u64::MAX` has 20 decimal digits.
const MAX_PREFIX_LEN: usize = 21;

/// Block size classes. Each class has its own buffer free list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockClass {
    /// Tree header at offset 0.
    Metadata,
    /// Index (internal) page.
    Index,
    /// Leaf page.
    Leaf,
}

impl BlockClass {
    /// All classes, in free-list order.
    pub const ALL: [Self; 3] = [Self::Metadata, Self::Index, Self::Leaf];

    /// Fixed size in bytes of a block of this class.
    #[must_use]
    pub const fn size(self) -> usize {
        match self {
            Self::Metadata => METADATA_SIZE,
            Self::Index => INDEX_BLOCK_SIZE,
            Self::Leaf => LEAF_BLOCK_SIZE,
        }
    }

    /// Block size as u64 for offset arithmetic.
    #[must_use]
    pub const fn size_u64(self) -> u64 {
        self.size() as u64
    }

    pub(crate) const fn slot(self) -> usize {
        match self {
            Self::Metadata => 0,
            Self::Index => 1,
            Self::Leaf => 2,
        }
    }
}

/// Frame `payload` into `block`: length prefix, payload, zero padding.
///
/// The whole block is overwritten, so a reused buffer never leaks stale bytes.
pub fn encode_payload(payload: &[u8], block: &mut [u8]) -> Result<(), BlockError> {
    let prefix = format!("{}:", payload.len());
    let end = framed_len(&prefix, payload.len(), block.len())?;

    block[..prefix.len()].copy_from_slice(prefix.as_bytes());
    block[prefix.len()..end].copy_from_slice(payload);
    block[end..].fill(0);
    Ok(())
}

/// Extract the payload framed by [`encode_payload`].
pub fn decode_payload(block: &[u8]) -> Result<&[u8], BlockError> {
    let search = &block[..block.len().min(MAX_PREFIX_LEN)];
    let delimiter = search
        .iter()
        .position(|&b| b == b':')
        .ok_or(BlockError::MissingLengthPrefix)?;

    let digits = &block[..delimiter];
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(BlockError::InvalidLengthPrefix(
            String::from_utf8_lossy(digits).into_owned(),
        ));
    }
    let len: usize = std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            BlockError::InvalidLengthPrefix(String::from_utf8_lossy(digits).into_owned())
        })?;

    let start = delimiter + 1;
    let capacity = block.len() - start;
    if len > capacity {
        return Err(BlockError::LengthOutOfBounds { len, capacity });
    }

    Ok(&block[start..start + len])
}

/// Serialize a record and frame it into `block`.
pub fn encode_record<T: Serialize>(record: &T, block: &mut [u8]) -> Result<(), BlockError> {
    let payload = bincode::serialize(record).map_err(BlockError::Encode)?;
    encode_payload(&payload, block)
}

/// Check that `record` would fit a block of `class` without encoding it.
///
/// Lets a caller validate every page of a multi-page update before the
/// first one is written.
pub fn check_record_fits<T: Serialize>(record: &T, class: BlockClass) -> Result<(), BlockError> {
    let size = bincode::serialized_size(record).map_err(BlockError::Encode)?;
    let len = usize::try_from(size).unwrap_or(usize::MAX);
    framed_len(&format!("{len}:"), len, class.size()).map(|_| ())
}

/// End of the payload once framed behind `prefix`, if it fits in `block_len`.
fn framed_len(prefix: &str, len: usize, block_len: usize) -> Result<usize, BlockError> {
    let end = prefix.len().saturating_add(len);
    if end > block_len {
        return Err(BlockError::PayloadTooLarge {
            len,
            capacity: block_len.saturating_sub(prefix.len()),
        });
    }
    Ok(end)
}

/// Deserialize a record from an already extracted payload.
pub fn decode_record<T: DeserializeOwned>(payload: &[u8]) -> Result<T, BlockError> {
    bincode::deserialize(payload).map_err(BlockError::Decode)
}

/// Errors from framing or (de)serializing a block.
#[derive(Debug)]
pub enum BlockError {
    /// The encoded record does not fit in its block.
    PayloadTooLarge { len: usize, capacity: usize },
    /// No `:` delimiter near the start of the block.
    MissingLengthPrefix,
    /// The length prefix is not a decimal number.
    InvalidLengthPrefix(String),
    /// The length prefix points past the end of the block.
    LengthOutOfBounds { len: usize, capacity: usize },
    /// Serialization failed.
    Encode(bincode::Error),
    /// Deserialization failed.
    Decode(bincode::Error),
}

impl std::fmt::Display for BlockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PayloadTooLarge { len, capacity } => {
                write!(f, "payload of {len} bytes exceeds block capacity {capacity}")
            }
            Self::MissingLengthPrefix => write!(f, "block has no length prefix"),
            Self::InvalidLengthPrefix(prefix) => write!(f, "invalid length prefix '{prefix}'"),
            Self::LengthOutOfBounds { len, capacity } => {
                write!(f, "payload length {len} exceeds block capacity {capacity}")
            }
            Self::Encode(e) => write!(f, "encode error: {e}"),
            Self::Decode(e) => write!(f, "decode error: {e}"),
        }
    }
}

impl std::error::Error for BlockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Encode(e) | Self::Decode(e) => Some(e),
            _ => None,
        }
    }
}
