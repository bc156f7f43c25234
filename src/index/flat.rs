//! Flat (exhaustive-scan) index.
//!
//! Scores every stored vector against every query. Kept as the exact
//! reference the approximate indexes are measured against and as the
//! reranking primitive; it is not a serious index in its own right.

use crate::data::{SimpleDataset, VectorData};
use crate::datatype::Element;
use crate::distance::{DistanceTag, Metric};
use crate::error::Result;
use crate::index::vamana::SearchBuffer;
use crate::index::{IndexError, QueryResult};
use crate::threads::{DisjointWriter, Partition, ThreadPool};

/// Exhaustive-scan index.
pub struct FlatIndex<T: Element, M: Metric<T>> {
    data: SimpleDataset<T>,
    metric: M,
    distance: DistanceTag,
    pool: ThreadPool,
}

impl<T: Element, M: Metric<T>> FlatIndex<T, M> {
    /// Wraps a dataset for exhaustive search.
    ///
    /// # Errors
    ///
    /// Propagates thread-spawn failures.
    pub fn new(
        data: SimpleDataset<T>,
        metric: M,
        distance: DistanceTag,
        num_threads: usize,
    ) -> Result<Self> {
        Ok(Self {
            data,
            metric,
            distance,
            pool: ThreadPool::new(num_threads)?,
        })
    }

    /// Number of indexed vectors.
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.size()
    }

    /// Vector dimensionality.
    #[must_use]
    pub fn dimensions(&self) -> usize {
        self.data.dimensions()
    }

    /// The distance tag this index scores with.
    #[must_use]
    pub fn distance(&self) -> DistanceTag {
        self.distance
    }

    /// Worker count used for batch searches.
    #[must_use]
    pub fn get_num_threads(&self) -> usize {
        self.pool.size()
    }

    /// Changes the worker count.
    ///
    /// # Errors
    ///
    /// Propagates thread-spawn failures.
    pub fn set_num_threads(&mut self, num_threads: usize) -> Result<()> {
        self.pool.resize(num_threads)?;
        Ok(())
    }

    /// Exact `k`-nearest search over every stored vector.
    ///
    /// # Errors
    ///
    /// Returns a dimension error for misshapen input; propagates worker
    /// panics.
    pub fn search(&mut self, queries: &[f32], k: usize) -> Result<QueryResult> {
        let dims = self.data.dimensions();
        if dims == 0 || queries.len() % dims != 0 {
            return Err(IndexError::QueryDimensionMismatch {
                expected: dims,
                actual: queries.len(),
            }
            .into());
        }
        let num_queries = queries.len() / dims;
        let mut result = QueryResult::new(num_queries, k);
        if k == 0 {
            return Ok(result);
        }

        let data = &self.data;
        let metric_proto = &self.metric;
        {
            let (ids, distances) = result.parts_mut();
            let ids_writer = DisjointWriter::new(ids);
            let dist_writer = DisjointWriter::new(distances);

            self.pool
                .parallel_for(Partition::fixed(num_queries), |range, _| {
                    let mut metric = metric_proto.clone();
                    let mut buffer = SearchBuffer::<M::Order>::new(k);
                    for q in range {
                        metric.fix_argument(&queries[q * dims..(q + 1) * dims]);
                        buffer.clear();
                        for i in 0..data.size() {
                            buffer.insert(i as u32, metric.compute(data.get(i)));
                        }
                        buffer.sort();
                        for (slot, neighbor) in buffer.top_k(k).into_iter().enumerate() {
                            // SAFETY: query rows are disjoint across
                            // workers.
                            unsafe {
                                ids_writer.write(q * k + slot, neighbor.id);
                                dist_writer.write(q * k + slot, neighbor.distance);
                            }
                        }
                    }
                })?;
        }
        Ok(result)
    }
}
