//! Owning storage backends for datasets and graphs.
//!
//! Large containers in this crate (datasets, adjacency arrays) do not care
//! where their memory comes from: heap, anonymous pages, explicit huge
//! pages, or a memory-mapped file. [`Storage`] erases the backing at
//! construction time so the choice never propagates through consumer types.
//!
//! Huge-page allocation falls back through {1 GiB, 2 MiB, plain pages}
//! unless a strict size is requested. File-backed allocation enforces a
//! create-versus-reuse policy and validates the file length against the
//! requested element count.

use crate::datatype::Element;
use bytemuck::Zeroable;
use memmap2::{MmapMut, MmapOptions};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while acquiring or mapping backing memory.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The underlying allocation or map call failed.
    #[error("allocation failed: {0}")]
    Io(#[from] std::io::Error),

    /// Strict huge-page allocation could not be satisfied.
    #[error("huge page allocation of {requested} bytes with {page_size:?} pages failed")]
    HugepageUnavailable {
        /// Bytes requested.
        requested: usize,
        /// The page size that was demanded.
        page_size: HugepageSize,
    },

    /// A file-backed mapping violated its create-versus-reuse policy.
    #[error("file policy violation for {path:?}: {reason}")]
    PolicyViolation {
        /// The offending path.
        path: PathBuf,
        /// What the policy required.
        reason: String,
    },

    /// An existing file's size does not match the requested mapping.
    #[error("file {path:?} is {actual} bytes, expected {expected}")]
    FileSizeMismatch {
        /// The offending path.
        path: PathBuf,
        /// Bytes found on disk.
        actual: u64,
        /// Bytes implied by the requested element count.
        expected: u64,
    },
}

/// Huge-page sizes supported by the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HugepageSize {
    /// 1 GiB pages.
    Page1G,
    /// 2 MiB pages.
    Page2M,
}

impl HugepageSize {
    /// log2 of the page size, as the kernel mmap interface expects.
    const fn bits(self) -> u8 {
        match self {
            HugepageSize::Page1G => 30,
            HugepageSize::Page2M => 21,
        }
    }
}

/// Whether a file-backed allocation must create its file or reuse one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapPolicy {
    /// The file must not exist; it is created and sized.
    MustCreate,
    /// The file must exist with exactly the expected size.
    MustUseExisting,
}

/// How to obtain backing memory for a container.
#[derive(Debug, Clone)]
pub enum AllocationPolicy {
    /// Ordinary heap allocation.
    Heap,
    /// Anonymous page-backed mapping (4 KiB pages).
    Anonymous,
    /// Huge-page mapping. With `strict` set, only that page size is
    /// accepted; otherwise the allocator falls back through
    /// {1 GiB, 2 MiB, plain pages}.
    Hugepage {
        /// Demand exactly this page size instead of falling back.
        strict: Option<HugepageSize>,
    },
    /// A mapping backed by a file on disk.
    File {
        /// The backing file.
        path: PathBuf,
        /// Create-versus-reuse policy.
        policy: MapPolicy,
    },
}

impl Default for AllocationPolicy {
    fn default() -> Self {
        AllocationPolicy::Heap
    }
}

enum Backing<T> {
    Heap(Vec<T>),
    Mapped(MmapMut),
}

/// A type-erased owning allocation of `len` elements of `T`.
///
/// Dereferences to `[T]`; the backing memory is released when the storage
/// is dropped. Mapped variants keep the full page-rounded mapping but only
/// expose the requested element count.
pub struct Storage<T: Element> {
    backing: Backing<T>,
    len: usize,
}

impl<T: Element> Storage<T> {
    /// Allocates zero-initialized storage for `len` elements under `policy`.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`] when the backing cannot be acquired or a
    /// file policy is violated.
    pub fn allocate(policy: &AllocationPolicy, len: usize) -> Result<Self, StorageError> {
        match policy {
            AllocationPolicy::Heap => Ok(Self::heap(len)),
            AllocationPolicy::Anonymous => Self::anonymous(len),
            AllocationPolicy::Hugepage { strict } => Self::hugepage(len, *strict),
            AllocationPolicy::File { path, policy } => Self::file(path, *policy, len),
        }
    }

    /// Heap-backed storage of `len` zeroed elements.
    #[must_use]
    pub fn heap(len: usize) -> Self {
        Self {
            backing: Backing::Heap(vec![T::zeroed(); len]),
            len,
        }
    }

    /// Storage wrapping an existing vector.
    #[must_use]
    pub fn from_vec(values: Vec<T>) -> Self {
        let len = values.len();
        Self {
            backing: Backing::Heap(values),
            len,
        }
    }

    /// Anonymous page-backed storage (4 KiB pages).
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the mapping fails.
    pub fn anonymous(len: usize) -> Result<Self, StorageError> {
        let bytes = len.max(1) * std::mem::size_of::<T>();
        let map = MmapOptions::new().len(bytes).map_anon()?;
        Ok(Self {
            backing: Backing::Mapped(map),
            len,
        })
    }

    /// Huge-page backed storage.
    ///
    /// Without `strict`, tries 1 GiB pages, then 2 MiB pages, then plain
    /// pages; the fallback is logged. With `strict`, only the requested
    /// page size is attempted.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::HugepageUnavailable`] when a strict request
    /// cannot be satisfied.
    pub fn hugepage(len: usize, strict: Option<HugepageSize>) -> Result<Self, StorageError> {
        let bytes = len.max(1) * std::mem::size_of::<T>();
        if let Some(page_size) = strict {
            let map = MmapOptions::new()
                .len(bytes)
                .huge(Some(page_size.bits()))
                .map_anon()
                .map_err(|_| StorageError::HugepageUnavailable {
                    requested: bytes,
                    page_size,
                })?;
            return Ok(Self {
                backing: Backing::Mapped(map),
                len,
            });
        }

        for page_size in [HugepageSize::Page1G, HugepageSize::Page2M] {
            if let Ok(map) = MmapOptions::new()
                .len(bytes)
                .huge(Some(page_size.bits()))
                .map_anon()
            {
                return Ok(Self {
                    backing: Backing::Mapped(map),
                    len,
                });
            }
            log::debug!("huge page allocation with {page_size:?} pages unavailable, falling back");
        }
        Self::anonymous(len)
    }

    /// File-backed storage of `len` elements at `path` under `policy`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::PolicyViolation`] when the file's existence
    /// contradicts `policy` and [`StorageError::FileSizeMismatch`] when an
    /// existing file has the wrong length.
    pub fn file(path: &Path, policy: MapPolicy, len: usize) -> Result<Self, StorageError> {
        let bytes = (len.max(1) * std::mem::size_of::<T>()) as u64;
        let file = match policy {
            MapPolicy::MustCreate => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create_new(true)
                    .open(path)
                    .map_err(|e| {
                        if e.kind() == std::io::ErrorKind::AlreadyExists {
                            StorageError::PolicyViolation {
                                path: path.to_path_buf(),
                                reason: "file already exists but policy is must-create".into(),
                            }
                        } else {
                            StorageError::Io(e)
                        }
                    })?;
                file.set_len(bytes)?;
                file
            }
            MapPolicy::MustUseExisting => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(path)
                    .map_err(|e| {
                        if e.kind() == std::io::ErrorKind::NotFound {
                            StorageError::PolicyViolation {
                                path: path.to_path_buf(),
                                reason: "file does not exist but policy is must-use-existing"
                                    .into(),
                            }
                        } else {
                            StorageError::Io(e)
                        }
                    })?;
                let actual = file.metadata()?.len();
                if actual != bytes {
                    return Err(StorageError::FileSizeMismatch {
                        path: path.to_path_buf(),
                        actual,
                        expected: bytes,
                    });
                }
                file
            }
        };

        // SAFETY: the file is exclusively owned by this mapping for the
        // storage lifetime; concurrent external truncation is UB the same
        // way it is for every file mapping.
        let map = unsafe { MmapOptions::new().len(bytes as usize).map_mut(&file)? };
        Ok(Self {
            backing: Backing::Mapped(map),
            len,
        })
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the storage holds no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The elements as a slice.
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        match &self.backing {
            Backing::Heap(v) => &v[..self.len],
            Backing::Mapped(map) => {
                let all: &[T] = bytemuck::cast_slice(&map[..]);
                &all[..self.len]
            }
        }
    }

    /// The elements as a mutable slice.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        let len = self.len;
        match &mut self.backing {
            Backing::Heap(v) => &mut v[..len],
            Backing::Mapped(map) => {
                let all: &mut [T] = bytemuck::cast_slice_mut(&mut map[..]);
                &mut all[..len]
            }
        }
    }
}

impl<T: Element> std::ops::Deref for Storage<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<T: Element> std::ops::DerefMut for Storage<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        self.as_mut_slice()
    }
}

impl<T: Element> std::fmt::Debug for Storage<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.backing {
            Backing::Heap(_) => "heap",
            Backing::Mapped(_) => "mapped",
        };
        write!(f, "Storage<{}>({kind}, len={})", T::DATA_TYPE, self.len)
    }
}
