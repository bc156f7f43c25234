//! Dense vector datasets.
//!
//! A dataset is a mapping from a vector id in `[0, size)` to a row of
//! exactly `dimensions` elements. Two implementations share the
//! [`VectorData`] interface: [`SimpleDataset`] is one contiguous row-major
//! allocation with a size fixed at construction; [`BlockedDataset`] chains
//! fixed-size blocks and supports resizing (see [`blocked`]).
//!
//! Datasets are created by loaders ([`io`]) or from in-memory arrays, then
//! owned by an index for its lifetime.

use crate::datatype::Element;
use crate::storage::{AllocationPolicy, Storage, StorageError};
use thiserror::Error;

pub mod blocked;
pub mod io;

pub use blocked::BlockedDataset;

/// Errors raised by dataset construction and loading.
#[derive(Debug, Error)]
pub enum DataError {
    /// A row has the wrong number of elements.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Dimensions the dataset was constructed with.
        expected: usize,
        /// Dimensions provided by the caller.
        actual: usize,
    },

    /// The provided buffer does not factor into `size * dimensions`.
    #[error("buffer of {len} elements is not a multiple of {dimensions} dimensions")]
    ShapeMismatch {
        /// Element count of the buffer.
        len: usize,
        /// Requested row width.
        dimensions: usize,
    },

    /// A vector id outside `[0, size)`.
    #[error("index {index} out of bounds for dataset of size {size}")]
    OutOfBounds {
        /// The offending id.
        index: usize,
        /// Dataset size.
        size: usize,
    },

    /// Backing memory could not be acquired.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// I/O failure while loading or saving vectors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A vector file whose contents contradict its framing or extension.
    #[error("malformed vector file {path}: {reason}")]
    MalformedFile {
        /// The offending file.
        path: String,
        /// What went wrong.
        reason: String,
    },
}

/// Read/write access to a dense row-major vector collection.
pub trait VectorData<T: Element>: Send + Sync {
    /// Number of vectors.
    fn size(&self) -> usize;

    /// Elements per vector.
    fn dimensions(&self) -> usize;

    /// The row for vector `i`.
    ///
    /// # Panics
    ///
    /// Panics if `i >= size()`.
    fn get(&self, i: usize) -> &[T];

    /// Mutable access to the row for vector `i`.
    ///
    /// # Panics
    ///
    /// Panics if `i >= size()`.
    fn get_mut(&mut self, i: usize) -> &mut [T];

    /// Overwrites the row for vector `i`.
    ///
    /// # Panics
    ///
    /// Panics if `i >= size()`; debug-asserts the row width.
    fn set(&mut self, i: usize, datum: &[T]) {
        debug_assert_eq!(datum.len(), self.dimensions());
        self.get_mut(i).copy_from_slice(datum);
    }

    /// Hints the row for vector `i` into cache.
    #[inline]
    fn prefetch(&self, i: usize) {
        prefetch_slice(self.get(i));
    }

    /// Returns `true` if the dataset holds no vectors.
    fn is_empty(&self) -> bool {
        self.size() == 0
    }
}

/// Issues a read prefetch for the cache lines covering `slice`.
#[inline]
pub fn prefetch_slice<T>(slice: &[T]) {
    #[cfg(target_arch = "x86_64")]
    {
        const CACHELINE: usize = 64;
        let bytes = std::mem::size_of_val(slice);
        let ptr = slice.as_ptr().cast::<i8>();
        let mut offset = 0;
        while offset < bytes {
            // SAFETY: `ptr + offset` stays within the allocation; prefetch
            // has no memory effects beyond the cache.
            unsafe {
                std::arch::x86_64::_mm_prefetch(
                    ptr.add(offset),
                    std::arch::x86_64::_MM_HINT_T0,
                );
            }
            offset += CACHELINE;
        }
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = slice;
    }
}

/// A contiguous row-major matrix of `size × dimensions` elements.
///
/// The size is fixed at construction; there is no per-slot liveness. The
/// backing memory is type-erased [`Storage`], so heap, huge-page, and
/// file-backed datasets are all the same type.
pub struct SimpleDataset<T: Element> {
    storage: Storage<T>,
    size: usize,
    dimensions: usize,
}

impl<T: Element> SimpleDataset<T> {
    /// Allocates a zero-filled dataset on the heap.
    #[must_use]
    pub fn new(size: usize, dimensions: usize) -> Self {
        Self {
            storage: Storage::heap(size * dimensions),
            size,
            dimensions,
        }
    }

    /// Allocates a zero-filled dataset using `policy` for backing memory.
    ///
    /// # Errors
    ///
    /// Propagates [`StorageError`] from the allocator.
    pub fn with_policy(
        size: usize,
        dimensions: usize,
        policy: &AllocationPolicy,
    ) -> Result<Self, DataError> {
        Ok(Self {
            storage: Storage::allocate(policy, size * dimensions)?,
            size,
            dimensions,
        })
    }

    /// Wraps a flat element buffer as a dataset.
    ///
    /// # Errors
    ///
    /// Returns [`DataError::ShapeMismatch`] if `values.len()` is not a
    /// multiple of `dimensions`.
    pub fn from_vec(values: Vec<T>, dimensions: usize) -> Result<Self, DataError> {
        if dimensions == 0 || values.len() % dimensions != 0 {
            return Err(DataError::ShapeMismatch {
                len: values.len(),
                dimensions,
            });
        }
        let size = values.len() / dimensions;
        Ok(Self {
            storage: Storage::from_vec(values),
            size,
            dimensions,
        })
    }

    /// Builds a dataset by copying rows out of `rows`.
    ///
    /// # Errors
    ///
    /// Returns [`DataError::DimensionMismatch`] if any row differs in
    /// width from the first.
    pub fn from_rows(rows: &[Vec<T>]) -> Result<Self, DataError> {
        let dimensions = rows.first().map_or(0, Vec::len);
        let mut out = Self::new(rows.len(), dimensions);
        for (i, row) in rows.iter().enumerate() {
            if row.len() != dimensions {
                return Err(DataError::DimensionMismatch {
                    expected: dimensions,
                    actual: row.len(),
                });
            }
            out.set(i, row);
        }
        Ok(out)
    }

    /// The full flat element buffer, row-major.
    #[must_use]
    pub fn as_flat(&self) -> &[T] {
        &self.storage
    }

    /// The full flat element buffer, mutable.
    pub fn as_flat_mut(&mut self) -> &mut [T] {
        self.storage.as_mut_slice()
    }

    /// An independent heap copy of this dataset.
    #[must_use]
    pub fn copy(&self) -> Self {
        let mut out = Self::new(self.size, self.dimensions);
        out.storage.as_mut_slice().copy_from_slice(&self.storage);
        out
    }
}

impl<T: Element> VectorData<T> for SimpleDataset<T> {
    fn size(&self) -> usize {
        self.size
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    #[inline]
    fn get(&self, i: usize) -> &[T] {
        let start = i * self.dimensions;
        &self.storage[start..start + self.dimensions]
    }

    #[inline]
    fn get_mut(&mut self, i: usize) -> &mut [T] {
        let start = i * self.dimensions;
        &mut self.storage.as_mut_slice()[start..start + self.dimensions]
    }
}

impl<T: Element> std::fmt::Debug for SimpleDataset<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SimpleDataset<{}>({} x {})",
            T::DATA_TYPE,
            self.size,
            self.dimensions
        )
    }
}
