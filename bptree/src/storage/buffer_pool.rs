//! Buffer pool for pre-allocated block buffers.
//!
//! Reading or writing a page needs a scratch buffer of the page's block size.
//! Instead of allocating one per operation, the pool keeps a free list per
//! [`BlockClass`] and leases buffers out. A leased [`PooledBlock`] returns its
//! buffer on drop.
//!
//! When a class runs dry, [`BufferPool::lease_block_or_alloc`] hands out a
//! fresh buffer that is freed on drop instead of joining the pool, so many
//! readers sharing one pool never fail for want of a buffer.
//!
//! # Invariants
//!
//! - Pool capacity per class is fixed after construction
//! - Every buffer in a class free list is exactly `class.size()` bytes
//! - Free list size + pooled leased count == capacity, per class

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::storage::block::BlockClass;

/// Default number of buffers per block class.
///
/// A tree operation holds at most a handful of blocks at once (a page being
/// read plus a page being written), so this leaves plenty of room for several
/// trees sharing one pool.
pub const DEFAULT_POOL_CAPACITY: usize = 64;

/// A buffer pool that pre-allocates block buffers for every size class.
///
/// # Invariants
/// - `free_lists[c].len() + leased(c) == capacity` for each class `c`
pub struct BufferPool {
    /// Free buffers, indexed by `BlockClass::slot`.
    free_lists: [Mutex<Vec<Box<[u8]>>>; 3],
    /// Buffers per class.
    capacity: usize,
}

impl BufferPool {
    /// Create a pool holding `capacity` zeroed buffers of each class.
    ///
    /// # Panics
    /// Panics if capacity is 0.
    #[must_use]
    pub fn new(capacity: usize) -> Arc<Self> {
        assert!(capacity > 0, "Buffer pool capacity must be positive");

        let free_lists = BlockClass::ALL.map(|class| {
            let buffers = (0..capacity)
                .map(|_| vec![0u8; class.size()].into_boxed_slice())
                .collect();
            Mutex::new(buffers)
        });

        Arc::new(Self {
            free_lists,
            capacity,
        })
    }

    /// Lease a raw buffer of the given class.
    ///
    /// Returns `None` if the class is exhausted. Contents are undefined.
    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    pub fn lease(&self, class: BlockClass) -> Option<Box<[u8]>> {
        self.free_lists[class.slot()]
            .lock()
            .expect("lock poisoned")
            .pop()
    }

    /// Lease a block that returns itself to the pool on drop.
    ///
    /// Returns `None` if the class is exhausted.
    #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
    pub fn lease_block(self: &Arc<Self>, class: BlockClass) -> Option<PooledBlock> {
        let buffer = self.lease(class)?;
        Some(PooledBlock::new(buffer, class, Some(Arc::clone(self))))
    }

    /// Lease a pooled block, or allocate an unpooled one if the class is
    /// exhausted. An unpooled block is freed on drop.
    pub fn lease_block_or_alloc(self: &Arc<Self>, class: BlockClass) -> PooledBlock {
        self.lease_block(class).unwrap_or_else(|| {
            trace!(?class, "Buffer pool exhausted, allocating unpooled block");
            PooledBlock::new(vec![0u8; class.size()].into_boxed_slice(), class, None)
        })
    }

    /// Return a buffer to the free list of its class.
    ///
    /// # Panics
    /// Panics if the buffer has the wrong size for `class`, or if returning it
    /// would exceed capacity. Both indicate a bug.
    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    pub fn return_buffer(&self, class: BlockClass, buffer: Box<[u8]>) {
        assert_eq!(
            buffer.len(),
            class.size(),
            "Buffer size does not match block class"
        );
        let mut free_list = self.free_lists[class.slot()]
            .lock()
            .expect("lock poisoned");
        assert!(
            free_list.len() < self.capacity,
            "Buffer pool overflow: returning buffer to full pool"
        );
        free_list.push(buffer);
    }

    /// Number of buffers available for `class`.
    #[must_use]
    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    pub fn available(&self, class: BlockClass) -> usize {
        self.free_lists[class.slot()]
            .lock()
            .expect("lock poisoned")
            .len()
    }

    /// Buffers per class.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

/// A leased block buffer. Dereferences to its bytes.
pub struct PooledBlock {
    buffer: Option<Box<[u8]>>,
    class: BlockClass,
    /// `None` for a block allocated past the pool's capacity.
    pool: Option<Arc<BufferPool>>,
}

impl PooledBlock {
    const fn new(buffer: Box<[u8]>, class: BlockClass, pool: Option<Arc<BufferPool>>) -> Self {
        Self {
            buffer: Some(buffer),
            class,
            pool,
        }
    }

    /// Size class of this block.
    #[must_use]
    pub const fn class(&self) -> BlockClass {
        self.class
    }

    /// Whether the buffer goes back to the pool on drop.
    #[must_use]
    pub const fn is_pooled(&self) -> bool {
        self.pool.is_some()
    }
}

impl Deref for PooledBlock {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buffer.as_deref().unwrap_or_default()
    }
}

impl DerefMut for PooledBlock {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buffer.as_deref_mut().unwrap_or_default()
    }
}

impl Drop for PooledBlock {
    fn drop(&mut self) {
        if let (Some(buffer), Some(pool)) = (self.buffer.take(), &self.pool) {
            pool.return_buffer(self.class, buffer);
        }
    }
}
