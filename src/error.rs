//! Unified error hierarchy.
//!
//! Each subsystem defines its own error enum next to the code that raises
//! it; this module defines the top-level [`VesprError`] that wraps all of
//! them for callers that operate at the crate boundary.
//!
//! Mutating APIs either complete or leave their receiver unchanged: every
//! validation that can fail happens before the first write.

use crate::data::DataError;
use crate::graph::GraphError;
use crate::index::IndexError;
use crate::saveload::SerializationError;
use crate::threads::ThreadPoolError;
use thiserror::Error;

/// Top-level error type wrapping all component errors.
#[derive(Debug, Error)]
pub enum VesprError {
    /// Input/output failures (missing files, short reads, map failures).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Dataset shape, bounds, and storage errors.
    #[error(transparent)]
    Data(#[from] DataError),

    /// Graph capacity and bounds errors.
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Index construction and id-management errors.
    #[error(transparent)]
    Index(#[from] IndexError),

    /// Save-table schema, version, and artifact errors.
    #[error(transparent)]
    Serialization(#[from] SerializationError),

    /// One or more workers panicked during a parallel region.
    #[error(transparent)]
    Threading(#[from] ThreadPoolError),

    /// Malformed or inconsistent configuration, caught at construction.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, VesprError>;
