//! Index orchestration.
//!
//! The typed index structs are generic over element type and metric; this
//! module erases both behind small trait objects so callers hold a
//! `Vamana`, `DynamicVamana`, or `Ivf` value with a uniform batch-search
//! API regardless of what is inside.
//!
//! Loading a saved index requires picking the concrete implementation
//! from runtime information. That choice goes through a [`Dispatcher`]
//! keyed on `(distance, element type, dimensionality)`: exact-dimension
//! specializations win when registered, and a dimension-agnostic entry is
//! the fallback. The built-in registries only contain dynamic-dimension
//! entries; the key structure is the hook for specialized kernels.

use crate::datatype::DataType;
use crate::distance::{Cosine, DistanceTag, InnerProduct, L2};
use crate::error::{Result, VesprError};
use crate::index::ivf::IvfIndex;
use crate::index::vamana::{DynamicVamanaIndex, VamanaIndex};
use crate::index::QueryResult;
use crate::saveload::SaveTable;
use half::{bf16, f16};
use std::path::Path;

/// The uniform batch-search surface every index manager exposes.
pub trait SearchInterface: Send {
    /// `k`-nearest search over a row-major query batch.
    ///
    /// # Errors
    ///
    /// Propagates the underlying index's search errors.
    fn search(&mut self, queries: &[f32], k: usize) -> Result<QueryResult>;

    /// Number of indexed vectors.
    fn size(&self) -> usize;

    /// Vector dimensionality.
    fn dimensions(&self) -> usize;

    /// Worker count used for batch searches.
    fn get_num_threads(&self) -> usize;

    /// Changes the worker count.
    ///
    /// # Errors
    ///
    /// Propagates thread-spawn failures.
    fn set_num_threads(&mut self, num_threads: usize) -> Result<()>;
}

/// Dimensionality component of a dispatch key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dims {
    /// Matches any dimensionality.
    Dynamic,
    /// Matches exactly.
    Fixed(usize),
}

/// A `(distance, element type, dims)` dispatch key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchKey {
    /// Distance tag.
    pub distance: DistanceTag,
    /// Element type tag.
    pub eltype: DataType,
    /// Dimensionality constraint.
    pub dims: Dims,
}

/// A registry of loaders keyed by [`DispatchKey`].
///
/// Resolution prefers an exact-dimension entry over a dynamic one.
pub struct Dispatcher<L> {
    entries: Vec<(DispatchKey, L)>,
}

impl<L> Dispatcher<L> {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Registers a loader for `key`.
    pub fn register(&mut self, key: DispatchKey, loader: L) {
        self.entries.push((key, loader));
    }

    /// Resolves `(distance, eltype, dims)`, preferring a fixed-dimension
    /// match and falling back to a dynamic entry.
    pub fn resolve(&self, distance: DistanceTag, eltype: DataType, dims: usize) -> Option<&L> {
        self.entries
            .iter()
            .find(|(key, _)| {
                key.distance == distance
                    && key.eltype == eltype
                    && key.dims == Dims::Fixed(dims)
            })
            .or_else(|| {
                self.entries.iter().find(|(key, _)| {
                    key.distance == distance && key.eltype == eltype && key.dims == Dims::Dynamic
                })
            })
            .map(|(_, loader)| loader)
    }
}

impl<L> Default for Dispatcher<L> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(serde::Deserialize)]
struct RootShape {
    eltype: DataType,
    dims: u64,
}

#[derive(serde::Deserialize)]
struct ConfigShape {
    distance: DistanceTag,
}

fn read_assembly_key(dir: &Path, config_subdir: bool) -> Result<(DataType, DistanceTag, usize)> {
    let root = SaveTable::read(dir)?;
    let shape: RootShape = root.object.clone().try_into().map_err(|e| {
        VesprError::Serialization(crate::saveload::SerializationError::TomlDe(e))
    })?;
    let distance = if config_subdir {
        let config = SaveTable::read(&dir.join("config"))?;
        let shape: ConfigShape = config.object.clone().try_into().map_err(|e| {
            VesprError::Serialization(crate::saveload::SerializationError::TomlDe(e))
        })?;
        shape.distance
    } else {
        let shape: ConfigShape = root.object.clone().try_into().map_err(|e| {
            VesprError::Serialization(crate::saveload::SerializationError::TomlDe(e))
        })?;
        shape.distance
    };
    Ok((shape.eltype, distance, shape.dims as usize))
}

fn no_loader(distance: DistanceTag, eltype: DataType) -> VesprError {
    VesprError::Config(format!(
        "no implementation registered for distance {distance} over element type {eltype}"
    ))
}

// ---------------------------------------------------------------------------
// Vamana manager
// ---------------------------------------------------------------------------

trait VamanaInterface: SearchInterface {
    fn search_window_size(&self) -> usize;
    fn set_search_window_size(&mut self, window: usize);
    fn save(&self, dir: &Path) -> Result<()>;
}

impl<T, M> SearchInterface for VamanaIndex<T, M>
where
    T: crate::datatype::Element,
    M: crate::distance::Metric<T>,
{
    fn search(&mut self, queries: &[f32], k: usize) -> Result<QueryResult> {
        VamanaIndex::search(self, queries, k)
    }

    fn size(&self) -> usize {
        VamanaIndex::size(self)
    }

    fn dimensions(&self) -> usize {
        VamanaIndex::dimensions(self)
    }

    fn get_num_threads(&self) -> usize {
        VamanaIndex::get_num_threads(self)
    }

    fn set_num_threads(&mut self, num_threads: usize) -> Result<()> {
        VamanaIndex::set_num_threads(self, num_threads)
    }
}

impl<T, M> VamanaInterface for VamanaIndex<T, M>
where
    T: crate::datatype::Element,
    M: crate::distance::Metric<T>,
{
    fn search_window_size(&self) -> usize {
        VamanaIndex::search_window_size(self)
    }

    fn set_search_window_size(&mut self, window: usize) {
        VamanaIndex::set_search_window_size(self, window);
    }

    fn save(&self, dir: &Path) -> Result<()> {
        VamanaIndex::save(self, dir)
    }
}

type VamanaLoader = fn(&Path, usize) -> Result<Box<dyn VamanaInterface>>;

fn vamana_dispatcher() -> Dispatcher<VamanaLoader> {
    let mut dispatcher: Dispatcher<VamanaLoader> = Dispatcher::new();

    macro_rules! register {
        ($eltype:ty, $tag:expr, $metric:expr) => {
            dispatcher.register(
                DispatchKey {
                    distance: $tag,
                    eltype: <$eltype as crate::datatype::Element>::DATA_TYPE,
                    dims: Dims::Dynamic,
                },
                |dir, threads| {
                    Ok(Box::new(VamanaIndex::<$eltype, _>::load(
                        dir, $metric, $tag, threads,
                    )?) as Box<dyn VamanaInterface>)
                },
            );
        };
        ($eltype:ty) => {
            register!($eltype, DistanceTag::L2, L2::new());
            register!($eltype, DistanceTag::InnerProduct, InnerProduct::new());
            register!($eltype, DistanceTag::Cosine, Cosine::new());
        };
    }

    register!(f32);
    register!(f16);
    register!(bf16);
    register!(i8);
    register!(u8);
    dispatcher
}

/// Type-erased static Vamana index.
pub struct Vamana {
    inner: Box<dyn VamanaInterface>,
}

impl std::fmt::Debug for Vamana {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vamana").finish_non_exhaustive()
    }
}

impl Vamana {
    /// Wraps a typed index.
    #[must_use]
    pub fn from_index<T, M>(index: VamanaIndex<T, M>) -> Self
    where
        T: crate::datatype::Element,
        M: crate::distance::Metric<T>,
    {
        Self {
            inner: Box::new(index),
        }
    }

    /// Loads a saved index, dispatching on its recorded distance and
    /// element type.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when no implementation matches and
    /// propagates save-protocol failures.
    pub fn assemble(dir: &Path, num_threads: usize) -> Result<Self> {
        let (eltype, distance, dims) = read_assembly_key(dir, true)?;
        let dispatcher = vamana_dispatcher();
        let loader = dispatcher
            .resolve(distance, eltype, dims)
            .ok_or_else(|| no_loader(distance, eltype))?;
        Ok(Self {
            inner: loader(dir, num_threads)?,
        })
    }

    /// The search window size `L`.
    #[must_use]
    pub fn search_window_size(&self) -> usize {
        self.inner.search_window_size()
    }

    /// Sets the search window size `L`.
    pub fn set_search_window_size(&mut self, window: usize) {
        self.inner.set_search_window_size(window);
    }

    /// Saves the index as a directory tree.
    ///
    /// # Errors
    ///
    /// Propagates save-protocol failures.
    pub fn save(&self, dir: &Path) -> Result<()> {
        self.inner.save(dir)
    }
}

impl SearchInterface for Vamana {
    fn search(&mut self, queries: &[f32], k: usize) -> Result<QueryResult> {
        self.inner.search(queries, k)
    }

    fn size(&self) -> usize {
        self.inner.size()
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    fn get_num_threads(&self) -> usize {
        self.inner.get_num_threads()
    }

    fn set_num_threads(&mut self, num_threads: usize) -> Result<()> {
        self.inner.set_num_threads(num_threads)
    }
}

// ---------------------------------------------------------------------------
// Dynamic Vamana manager
// ---------------------------------------------------------------------------

trait DynamicVamanaInterface: SearchInterface {
    fn insert(&mut self, external: u32, vector: &[f32]) -> Result<()>;
    fn delete(&mut self, external: u32) -> Result<()>;
    fn consolidate(&mut self) -> Result<()>;
    fn compact(&mut self) -> Result<()>;
    fn contains(&self, external: u32) -> bool;
    fn search_window_size(&self) -> usize;
    fn set_search_window_size(&mut self, window: usize);
    fn save(&self, dir: &Path) -> Result<()>;
}

impl<T, M> SearchInterface for DynamicVamanaIndex<T, M>
where
    T: crate::datatype::Element,
    M: crate::distance::Metric<T>,
{
    fn search(&mut self, queries: &[f32], k: usize) -> Result<QueryResult> {
        DynamicVamanaIndex::search(self, queries, k)
    }

    fn size(&self) -> usize {
        DynamicVamanaIndex::size(self)
    }

    fn dimensions(&self) -> usize {
        DynamicVamanaIndex::dimensions(self)
    }

    fn get_num_threads(&self) -> usize {
        DynamicVamanaIndex::get_num_threads(self)
    }

    fn set_num_threads(&mut self, num_threads: usize) -> Result<()> {
        DynamicVamanaIndex::set_num_threads(self, num_threads)
    }
}

impl<T, M> DynamicVamanaInterface for DynamicVamanaIndex<T, M>
where
    T: crate::datatype::Element,
    M: crate::distance::Metric<T>,
{
    fn insert(&mut self, external: u32, vector: &[f32]) -> Result<()> {
        let converted: Vec<T> = vector.iter().map(|&x| T::from_f32(x)).collect();
        DynamicVamanaIndex::insert(self, external, &converted)
    }

    fn delete(&mut self, external: u32) -> Result<()> {
        DynamicVamanaIndex::delete(self, external)
    }

    fn consolidate(&mut self) -> Result<()> {
        DynamicVamanaIndex::consolidate(self)
    }

    fn compact(&mut self) -> Result<()> {
        DynamicVamanaIndex::compact(self)
    }

    fn contains(&self, external: u32) -> bool {
        DynamicVamanaIndex::contains(self, external)
    }

    fn search_window_size(&self) -> usize {
        DynamicVamanaIndex::search_window_size(self)
    }

    fn set_search_window_size(&mut self, window: usize) {
        DynamicVamanaIndex::set_search_window_size(self, window);
    }

    fn save(&self, dir: &Path) -> Result<()> {
        DynamicVamanaIndex::save(self, dir)
    }
}

type DynamicVamanaLoader = fn(&Path, usize) -> Result<Box<dyn DynamicVamanaInterface>>;

fn dynamic_vamana_dispatcher() -> Dispatcher<DynamicVamanaLoader> {
    let mut dispatcher: Dispatcher<DynamicVamanaLoader> = Dispatcher::new();

    macro_rules! register {
        ($eltype:ty, $tag:expr, $metric:expr) => {
            dispatcher.register(
                DispatchKey {
                    distance: $tag,
                    eltype: <$eltype as crate::datatype::Element>::DATA_TYPE,
                    dims: Dims::Dynamic,
                },
                |dir, threads| {
                    Ok(Box::new(DynamicVamanaIndex::<$eltype, _>::load(
                        dir, $metric, $tag, threads,
                    )?) as Box<dyn DynamicVamanaInterface>)
                },
            );
        };
        ($eltype:ty) => {
            register!($eltype, DistanceTag::L2, L2::new());
            register!($eltype, DistanceTag::InnerProduct, InnerProduct::new());
            register!($eltype, DistanceTag::Cosine, Cosine::new());
        };
    }

    register!(f32);
    register!(f16);
    register!(bf16);
    register!(i8);
    register!(u8);
    dispatcher
}

/// Type-erased dynamic Vamana index.
pub struct DynamicVamana {
    inner: Box<dyn DynamicVamanaInterface>,
}

impl DynamicVamana {
    /// Wraps a typed index.
    #[must_use]
    pub fn from_index<T, M>(index: DynamicVamanaIndex<T, M>) -> Self
    where
        T: crate::datatype::Element,
        M: crate::distance::Metric<T>,
    {
        Self {
            inner: Box::new(index),
        }
    }

    /// Loads a saved index, dispatching on its recorded distance and
    /// element type.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when no implementation matches and
    /// propagates save-protocol failures.
    pub fn assemble(dir: &Path, num_threads: usize) -> Result<Self> {
        let (eltype, distance, dims) = read_assembly_key(dir, true)?;
        let dispatcher = dynamic_vamana_dispatcher();
        let loader = dispatcher
            .resolve(distance, eltype, dims)
            .ok_or_else(|| no_loader(distance, eltype))?;
        Ok(Self {
            inner: loader(dir, num_threads)?,
        })
    }

    /// Inserts a full-precision vector under `external`, converting to
    /// the index's element type.
    ///
    /// # Errors
    ///
    /// Propagates the underlying index's insert errors.
    pub fn insert(&mut self, external: u32, vector: &[f32]) -> Result<()> {
        self.inner.insert(external, vector)
    }

    /// Tombstones `external`.
    ///
    /// # Errors
    ///
    /// Propagates the underlying index's delete errors.
    pub fn delete(&mut self, external: u32) -> Result<()> {
        self.inner.delete(external)
    }

    /// Relinks around tombstones and frees their slots.
    ///
    /// # Errors
    ///
    /// Propagates worker panics.
    pub fn consolidate(&mut self) -> Result<()> {
        self.inner.consolidate()
    }

    /// Renumbers live slots into a contiguous prefix and shrinks storage.
    ///
    /// # Errors
    ///
    /// Propagates worker panics and allocation failures.
    pub fn compact(&mut self) -> Result<()> {
        self.inner.compact()
    }

    /// Whether `external` is present and live.
    #[must_use]
    pub fn contains(&self, external: u32) -> bool {
        self.inner.contains(external)
    }

    /// The search window size `L`.
    #[must_use]
    pub fn search_window_size(&self) -> usize {
        self.inner.search_window_size()
    }

    /// Sets the search window size `L`.
    pub fn set_search_window_size(&mut self, window: usize) {
        self.inner.set_search_window_size(window);
    }

    /// Saves the index as a directory tree.
    ///
    /// # Errors
    ///
    /// Propagates save-protocol failures.
    pub fn save(&self, dir: &Path) -> Result<()> {
        self.inner.save(dir)
    }
}

impl SearchInterface for DynamicVamana {
    fn search(&mut self, queries: &[f32], k: usize) -> Result<QueryResult> {
        self.inner.search(queries, k)
    }

    fn size(&self) -> usize {
        self.inner.size()
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    fn get_num_threads(&self) -> usize {
        self.inner.get_num_threads()
    }

    fn set_num_threads(&mut self, num_threads: usize) -> Result<()> {
        self.inner.set_num_threads(num_threads)
    }
}

// ---------------------------------------------------------------------------
// IVF manager
// ---------------------------------------------------------------------------

trait IvfInterface: SearchInterface {
    fn n_probes(&self) -> usize;
    fn set_n_probes(&mut self, n_probes: usize);
    fn k_reorder(&self) -> f32;
    fn set_k_reorder(&mut self, k_reorder: f32);
    fn save(&self, dir: &Path) -> Result<()>;
}

impl<T, M> SearchInterface for IvfIndex<T, M>
where
    T: crate::datatype::Element,
    M: crate::distance::Metric<T>,
{
    fn search(&mut self, queries: &[f32], k: usize) -> Result<QueryResult> {
        IvfIndex::search(self, queries, k)
    }

    fn size(&self) -> usize {
        IvfIndex::size(self)
    }

    fn dimensions(&self) -> usize {
        IvfIndex::dimensions(self)
    }

    fn get_num_threads(&self) -> usize {
        IvfIndex::get_num_threads(self)
    }

    fn set_num_threads(&mut self, num_threads: usize) -> Result<()> {
        IvfIndex::set_num_threads(self, num_threads)
    }
}

impl<T, M> IvfInterface for IvfIndex<T, M>
where
    T: crate::datatype::Element,
    M: crate::distance::Metric<T>,
{
    fn n_probes(&self) -> usize {
        IvfIndex::n_probes(self)
    }

    fn set_n_probes(&mut self, n_probes: usize) {
        IvfIndex::set_n_probes(self, n_probes);
    }

    fn k_reorder(&self) -> f32 {
        IvfIndex::k_reorder(self)
    }

    fn set_k_reorder(&mut self, k_reorder: f32) {
        IvfIndex::set_k_reorder(self, k_reorder);
    }

    fn save(&self, dir: &Path) -> Result<()> {
        IvfIndex::save(self, dir)
    }
}

type IvfLoader = fn(&Path, usize) -> Result<Box<dyn IvfInterface>>;

fn ivf_dispatcher() -> Dispatcher<IvfLoader> {
    let mut dispatcher: Dispatcher<IvfLoader> = Dispatcher::new();

    macro_rules! register {
        ($eltype:ty, $tag:expr, $metric:expr) => {
            dispatcher.register(
                DispatchKey {
                    distance: $tag,
                    eltype: <$eltype as crate::datatype::Element>::DATA_TYPE,
                    dims: Dims::Dynamic,
                },
                |dir, threads| {
                    Ok(Box::new(IvfIndex::<$eltype, _>::load(
                        dir, $metric, $tag, threads,
                    )?) as Box<dyn IvfInterface>)
                },
            );
        };
        ($eltype:ty) => {
            register!($eltype, DistanceTag::L2, L2::new());
            register!($eltype, DistanceTag::InnerProduct, InnerProduct::new());
            register!($eltype, DistanceTag::Cosine, Cosine::new());
        };
    }

    register!(f32);
    register!(f16);
    register!(bf16);
    register!(i8);
    register!(u8);
    dispatcher
}

/// Type-erased IVF index.
pub struct Ivf {
    inner: Box<dyn IvfInterface>,
}

impl Ivf {
    /// Wraps a typed index.
    #[must_use]
    pub fn from_index<T, M>(index: IvfIndex<T, M>) -> Self
    where
        T: crate::datatype::Element,
        M: crate::distance::Metric<T>,
    {
        Self {
            inner: Box::new(index),
        }
    }

    /// Loads a saved index, dispatching on its recorded distance and
    /// element type.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when no implementation matches and
    /// propagates save-protocol failures.
    pub fn assemble(dir: &Path, num_threads: usize) -> Result<Self> {
        let (eltype, distance, dims) = read_assembly_key(dir, false)?;
        let dispatcher = ivf_dispatcher();
        let loader = dispatcher
            .resolve(distance, eltype, dims)
            .ok_or_else(|| no_loader(distance, eltype))?;
        Ok(Self {
            inner: loader(dir, num_threads)?,
        })
    }

    /// Number of cells probed per query.
    #[must_use]
    pub fn n_probes(&self) -> usize {
        self.inner.n_probes()
    }

    /// Sets the probe count.
    pub fn set_n_probes(&mut self, n_probes: usize) {
        self.inner.set_n_probes(n_probes);
    }

    /// The rerank expansion factor.
    #[must_use]
    pub fn k_reorder(&self) -> f32 {
        self.inner.k_reorder()
    }

    /// Sets the rerank expansion factor.
    pub fn set_k_reorder(&mut self, k_reorder: f32) {
        self.inner.set_k_reorder(k_reorder);
    }

    /// Saves the index as a directory tree.
    ///
    /// # Errors
    ///
    /// Propagates save-protocol failures.
    pub fn save(&self, dir: &Path) -> Result<()> {
        self.inner.save(dir)
    }
}

impl SearchInterface for Ivf {
    fn search(&mut self, queries: &[f32], k: usize) -> Result<QueryResult> {
        self.inner.search(queries, k)
    }

    fn size(&self) -> usize {
        self.inner.size()
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    fn get_num_threads(&self) -> usize {
        self.inner.get_num_threads()
    }

    fn set_num_threads(&mut self, num_threads: usize) -> Result<()> {
        self.inner.set_num_threads(num_threads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatcher_prefers_fixed_dims() {
        let mut dispatcher: Dispatcher<u32> = Dispatcher::new();
        let dynamic_key = DispatchKey {
            distance: DistanceTag::L2,
            eltype: DataType::F32,
            dims: Dims::Dynamic,
        };
        let fixed_key = DispatchKey {
            distance: DistanceTag::L2,
            eltype: DataType::F32,
            dims: Dims::Fixed(128),
        };
        dispatcher.register(dynamic_key, 1);
        dispatcher.register(fixed_key, 2);

        assert_eq!(dispatcher.resolve(DistanceTag::L2, DataType::F32, 128), Some(&2));
        assert_eq!(dispatcher.resolve(DistanceTag::L2, DataType::F32, 96), Some(&1));
        assert_eq!(dispatcher.resolve(DistanceTag::Cosine, DataType::F32, 128), None);
    }

    #[test]
    fn test_builtin_registry_covers_types() {
        let dispatcher = vamana_dispatcher();
        for eltype in [
            DataType::F32,
            DataType::F16,
            DataType::BF16,
            DataType::I8,
            DataType::U8,
        ] {
            for distance in [
                DistanceTag::L2,
                DistanceTag::InnerProduct,
                DistanceTag::Cosine,
            ] {
                assert!(
                    dispatcher.resolve(distance, eltype, 77).is_some(),
                    "missing {distance} / {eltype}"
                );
            }
        }
        // Id types are not valid vector element types.
        assert!(dispatcher
            .resolve(DistanceTag::L2, DataType::U64, 77)
            .is_none());
    }
}
