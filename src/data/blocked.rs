//! Block-allocated datasets.
//!
//! A [`BlockedDataset`] presents the same logical interface as a contiguous
//! dataset but stores rows in a chain of equal-sized blocks, so it can grow
//! and shrink without relocating existing rows. The block capacity is the
//! largest power of two whose byte size fits the configured target (default
//! 1 GiB), which keeps row addressing to a shift and a mask.

use super::{DataError, VectorData};
use crate::datatype::Element;
use crate::storage::{AllocationPolicy, Storage};

/// Default target block size in bytes (1 GiB).
pub const DEFAULT_BLOCKSIZE_BYTES: usize = 1 << 30;

/// A power of two stored by exponent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerOfTwo(u32);

impl PowerOfTwo {
    /// The largest power of two less than or equal to `x` (minimum 1).
    #[must_use]
    pub fn floor(x: usize) -> Self {
        if x <= 1 {
            Self(0)
        } else {
            Self((usize::BITS - 1) - x.leading_zeros())
        }
    }

    /// The value `2^exponent`.
    #[must_use]
    pub fn value(self) -> usize {
        1 << self.0
    }

    /// The exponent.
    #[must_use]
    pub fn exponent(self) -> u32 {
        self.0
    }

    /// `x` modulo this power of two.
    #[inline]
    #[must_use]
    pub fn modulo(self, x: usize) -> usize {
        x & (self.value() - 1)
    }

    /// `x` divided by this power of two.
    #[inline]
    #[must_use]
    pub fn divide(self, x: usize) -> usize {
        x >> self.0
    }
}

/// A dataset backed by fixed-size blocks, supporting `resize`.
///
/// Row `i` lives in block `i / block_capacity` at slot
/// `i % block_capacity`; both operations are bit twiddles because the
/// capacity is a power of two. Growing appends blocks; shrinking drops
/// whole trailing blocks once they fall entirely past the new size.
pub struct BlockedDataset<T: Element> {
    blocks: Vec<Storage<T>>,
    blocksize: PowerOfTwo,
    blocksize_bytes: PowerOfTwo,
    dimensions: usize,
    size: usize,
    policy: AllocationPolicy,
}

impl<T: Element> BlockedDataset<T> {
    /// Creates a dataset of `size × dimensions` with the default 1 GiB
    /// block target on the heap.
    ///
    /// # Errors
    ///
    /// Propagates allocation failures.
    pub fn new(size: usize, dimensions: usize) -> Result<Self, DataError> {
        Self::with_blocksize(size, dimensions, DEFAULT_BLOCKSIZE_BYTES)
    }

    /// Creates a dataset whose blocks hold the largest power-of-two number
    /// of rows that fits in `blocksize_bytes`.
    ///
    /// # Errors
    ///
    /// Propagates allocation failures.
    pub fn with_blocksize(
        size: usize,
        dimensions: usize,
        blocksize_bytes: usize,
    ) -> Result<Self, DataError> {
        Self::with_policy(size, dimensions, blocksize_bytes, AllocationPolicy::Heap)
    }

    /// Creates a dataset with an explicit backing policy for its blocks.
    ///
    /// # Errors
    ///
    /// Propagates allocation failures.
    pub fn with_policy(
        size: usize,
        dimensions: usize,
        blocksize_bytes: usize,
        policy: AllocationPolicy,
    ) -> Result<Self, DataError> {
        let row_bytes = std::mem::size_of::<T>() * dimensions;
        let blocksize = PowerOfTwo::floor(blocksize_bytes / row_bytes.max(1));
        let mut out = Self {
            blocks: Vec::new(),
            blocksize,
            blocksize_bytes: PowerOfTwo::floor(blocksize_bytes),
            dimensions,
            size: 0,
            policy,
        };
        out.resize(size)?;
        Ok(out)
    }

    /// Rows per block.
    #[must_use]
    pub fn blocksize(&self) -> PowerOfTwo {
        self.blocksize
    }

    /// The power-of-two byte target blocks were sized from.
    #[must_use]
    pub fn blocksize_bytes(&self) -> PowerOfTwo {
        self.blocksize_bytes
    }

    /// Number of allocated blocks.
    #[must_use]
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Rows the dataset can hold before another block is needed.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.num_blocks() * self.blocksize.value()
    }

    /// Splits a row id into `(block, slot)`.
    #[inline]
    #[must_use]
    pub fn resolve(&self, i: usize) -> (usize, usize) {
        (self.blocksize.divide(i), self.blocksize.modulo(i))
    }

    fn add_block(&mut self) -> Result<(), DataError> {
        let elements = self.blocksize.value() * self.dimensions;
        self.blocks
            .push(Storage::allocate(&self.policy, elements)?);
        Ok(())
    }

    /// Grows or shrinks the dataset to `new_size` rows.
    ///
    /// Rows below `min(old_size, new_size)` are preserved in place.
    /// Shrinking drops trailing blocks but keeps the block containing the
    /// last live row.
    ///
    /// # Errors
    ///
    /// Propagates allocation failures while growing.
    pub fn resize(&mut self, new_size: usize) -> Result<(), DataError> {
        if new_size > self.size {
            while new_size > self.capacity() {
                self.add_block()?;
            }
            self.size = new_size;
        } else if new_size < self.size {
            self.size = new_size;
            while self.capacity() - self.blocksize.value() > new_size {
                self.blocks.pop();
            }
        }
        Ok(())
    }
}

impl<T: Element> VectorData<T> for BlockedDataset<T> {
    fn size(&self) -> usize {
        self.size
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    #[inline]
    fn get(&self, i: usize) -> &[T] {
        debug_assert!(i < self.size);
        let (block, slot) = self.resolve(i);
        let start = slot * self.dimensions;
        &self.blocks[block][start..start + self.dimensions]
    }

    #[inline]
    fn get_mut(&mut self, i: usize) -> &mut [T] {
        debug_assert!(i < self.size);
        let (block, slot) = self.resolve(i);
        let start = slot * self.dimensions;
        &mut self.blocks[block].as_mut_slice()[start..start + self.dimensions]
    }
}

impl<T: Element> std::fmt::Debug for BlockedDataset<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "BlockedDataset<{}>({} x {}, {} blocks of {})",
            T::DATA_TYPE,
            self.size,
            self.dimensions,
            self.num_blocks(),
            self.blocksize.value()
        )
    }
}
