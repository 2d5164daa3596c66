//! Tree file I/O.
//!
//! A tree file is the metadata block at offset 0 followed by index and leaf
//! blocks, allocated back to back from a monotonically growing cursor. Freed
//! blocks are never reused.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, trace};

use crate::storage::block::{
    BlockClass, BlockError, Offset, check_record_fits, decode_payload, decode_record,
    encode_record,
};
use crate::storage::btree::{IndexPage, LeafPage, Page, PageKind, PageRef, Storable};
use crate::storage::buffer_pool::{BufferPool, PooledBlock};
use crate::storage::cache::{NoCache, PageCache};
use crate::storage::metadata::{MetadataError, TreeMetadata};

/// A tree file handle with block-level page I/O.
pub struct PageStore {
    file: File,
    path: PathBuf,
    header: TreeMetadata,
    buffer_pool: Arc<BufferPool>,
    cache: Box<dyn PageCache>,
}

impl PageStore {
    /// Create a new tree file holding `header`.
    ///
    /// Returns an error if the file already exists.
    pub fn create(
        path: &Path,
        header: TreeMetadata,
        buffer_pool: Arc<BufferPool>,
    ) -> Result<Self, StoreError> {
        if path.exists() {
            return Err(StoreError::AlreadyExists(path.to_path_buf()));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(StoreError::Io)?;

        let mut store = Self {
            file,
            path: path.to_path_buf(),
            header,
            buffer_pool,
            cache: Box::new(NoCache),
        };
        store.write_header()?;
        info!(path = %path.display(), order = store.header.order, "Created tree file");
        Ok(store)
    }

    /// Open an existing tree file and validate its header.
    pub fn open(path: &Path, buffer_pool: Arc<BufferPool>) -> Result<Self, StoreError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(StoreError::Io)?;

        let mut block = buffer_pool.lease_block_or_alloc(BlockClass::Metadata);
        file.read_exact(&mut block).map_err(StoreError::Io)?;

        let header: TreeMetadata = decode_record(decode_payload(&block)?)?;
        header.validate()?;
        drop(block);

        debug!(
            path = %path.display(),
            order = header.order,
            count = header.count,
            "Opened tree file"
        );
        Ok(Self {
            file,
            path: path.to_path_buf(),
            header,
            buffer_pool,
            cache: Box::new(NoCache),
        })
    }

    /// Replace the payload cache. The old cache is discarded.
    pub fn set_cache(&mut self, cache: Box<dyn PageCache>) {
        self.cache = cache;
    }

    #[must_use]
    pub const fn header(&self) -> &TreeMetadata {
        &self.header
    }

    pub const fn header_mut(&mut self) -> &mut TreeMetadata {
        &mut self.header
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.buffer_pool
    }

    /// Persist the in-memory header to the metadata block.
    pub fn write_header(&mut self) -> Result<(), StoreError> {
        let mut block = self.lease(BlockClass::Metadata);
        encode_record(&self.header, &mut block)?;
        self.write_block(0, &block)
    }

    /// Reserve a block for a new page of `kind` at the end of the file.
    ///
    /// The file is extended immediately. The header's allocation cursor is
    /// advanced in memory and persisted with the next header write.
    pub fn allocate(&mut self, kind: PageKind) -> Result<Offset, StoreError> {
        let offset = self.header.next_offset;
        let end = offset + kind.block_class().size_u64();
        self.file.set_len(end).map_err(StoreError::Io)?;
        self.header.next_offset = end;
        trace!(offset, %kind, "Allocated page");
        Ok(offset)
    }

    /// Load the page at `offset`, stored as `kind`.
    pub fn load<K: Storable, V: Storable>(
        &mut self,
        offset: Offset,
        kind: PageKind,
    ) -> Result<Page<K, V>, StoreError> {
        let payload = self.read_payload(offset, kind.block_class())?;
        let page: Page<K, V> = decode_record(&payload)?;
        if page.kind() != kind {
            return Err(StoreError::WrongPageKind {
                offset,
                expected: kind,
            });
        }
        Ok(page)
    }

    pub fn load_leaf<K: Storable, V: Storable>(
        &mut self,
        offset: Offset,
    ) -> Result<LeafPage<K, V>, StoreError> {
        match self.load(offset, PageKind::Leaf)? {
            Page::Leaf(leaf) => Ok(leaf),
            Page::Index(_) => Err(StoreError::WrongPageKind {
                offset,
                expected: PageKind::Leaf,
            }),
        }
    }

    pub fn load_index<K: Storable>(&mut self, offset: Offset) -> Result<IndexPage<K>, StoreError> {
        match self.load::<K, ()>(offset, PageKind::Index)? {
            Page::Index(index) => Ok(index),
            Page::Leaf(_) => Err(StoreError::WrongPageKind {
                offset,
                expected: PageKind::Index,
            }),
        }
    }

    pub fn store_leaf<K: Storable, V: Storable>(
        &mut self,
        leaf: &LeafPage<K, V>,
    ) -> Result<Offset, StoreError> {
        self.write_page(leaf.links.offset, BlockClass::Leaf, &PageRef::Leaf(leaf))
    }

    pub fn store_index<K: Storable>(&mut self, index: &IndexPage<K>) -> Result<Offset, StoreError> {
        self.write_page(
            index.links.offset,
            BlockClass::Index,
            &PageRef::<K, ()>::Index(index),
        )
    }

    /// Check that `leaf` fits its block, without writing anything.
    pub fn check_leaf_fits<K: Storable, V: Storable>(
        leaf: &LeafPage<K, V>,
    ) -> Result<(), StoreError> {
        Ok(check_record_fits(&PageRef::Leaf(leaf), BlockClass::Leaf)?)
    }

    /// Check that `index` fits its block, without writing anything.
    pub fn check_index_fits<K: Storable>(index: &IndexPage<K>) -> Result<(), StoreError> {
        Ok(check_record_fits(
            &PageRef::<K, ()>::Index(index),
            BlockClass::Index,
        )?)
    }

    /// Flush file contents to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.file.sync_all().map_err(StoreError::Io)
    }

    fn write_page<K: Storable, V: Storable>(
        &mut self,
        offset: Offset,
        class: BlockClass,
        page: &PageRef<'_, K, V>,
    ) -> Result<Offset, StoreError> {
        let mut block = self.lease(class);
        encode_record(page, &mut block)?;
        self.write_block(offset, &block)?;
        Ok(offset)
    }

    fn read_payload(&mut self, offset: Offset, class: BlockClass) -> Result<Vec<u8>, StoreError> {
        if let Some(payload) = self.cache.get(offset) {
            return Ok(payload);
        }

        let end = offset + class.size_u64();
        if end > self.header.next_offset {
            return Err(StoreError::OffsetOutOfBounds {
                offset,
                next_offset: self.header.next_offset,
            });
        }

        let mut block = self.lease(class);
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(StoreError::Io)?;
        self.file.read_exact(&mut block).map_err(StoreError::Io)?;
        trace!(offset, ?class, "Read block");

        let payload = decode_payload(&block)?.to_vec();
        self.cache.set(offset, payload.clone());
        Ok(payload)
    }

    fn write_block(&mut self, offset: Offset, block: &PooledBlock) -> Result<(), StoreError> {
        self.cache.invalidate(offset);
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(StoreError::Io)?;
        self.file.write_all(block).map_err(StoreError::Io)?;
        trace!(offset, class = ?block.class(), "Wrote block");
        Ok(())
    }

    fn lease(&self, class: BlockClass) -> PooledBlock {
        self.buffer_pool.lease_block_or_alloc(class)
    }
}

/// Errors that can occur during tree file operations.
#[derive(Debug)]
pub enum StoreError {
    /// I/O error.
    Io(std::io::Error),
    /// File already exists.
    AlreadyExists(PathBuf),
    /// Block framing or serialization error.
    Block(BlockError),
    /// Header failed validation.
    Metadata(MetadataError),
    /// The page at `offset` is not of the expected kind.
    WrongPageKind { offset: Offset, expected: PageKind },
    /// Block lies past the allocation cursor.
    OffsetOutOfBounds { offset: Offset, next_offset: Offset },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::AlreadyExists(p) => write!(f, "file already exists: {}", p.display()),
            Self::Block(e) => write!(f, "block error: {e}"),
            Self::Metadata(e) => write!(f, "metadata error: {e}"),
            Self::WrongPageKind { offset, expected } => {
                write!(f, "expected {expected} page at offset {offset}")
            }
            Self::OffsetOutOfBounds {
                offset,
                next_offset,
            } => write!(
                f,
                "block at offset {offset} out of bounds (next offset: {next_offset})"
            ),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Block(e) => Some(e),
            Self::Metadata(e) => Some(e),
            Self::AlreadyExists(_)
            | Self::WrongPageKind { .. }
            | Self::OffsetOutOfBounds { .. } => None,
        }
    }
}

impl From<BlockError> for StoreError {
    fn from(e: BlockError) -> Self {
        Self::Block(e)
    }
}

impl From<MetadataError> for StoreError {
    fn from(e: MetadataError) -> Self {
        Self::Metadata(e)
    }
}
