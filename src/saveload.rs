//! Versioned save tables and content-addressed binary artifacts.
//!
//! Every serializable type produces a tree-structured *save table* with
//! three fixed fields (a `schema` string, a [`Version`], and an object
//! body), persisted as `svs_config.toml`. Auxiliary binary data goes into
//! sibling `<name>_<uuid>.svs` files minted by a [`SaveContext`]; each is
//! referenced from the table by filename together with its element type,
//! shape, uuid, and CRC-32.
//!
//! Loading is strict: the schema string must match exactly and the
//! version must not exceed the loader's ceiling (comparison is
//! lexicographic on `(major, minor, patch)`). Binary artifacts are
//! checksum-verified before use.

use crate::data::{io as vecio, DataError, SimpleDataset, VectorData};
use crate::datatype::{DataType, Element};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

/// Name of the root table file inside every save directory.
pub const CONFIG_FILE: &str = "svs_config.toml";

/// Errors raised by the save/load protocol.
#[derive(Debug, Error)]
pub enum SerializationError {
    /// The table's schema string is not the one the loader expects.
    #[error("schema mismatch: expected \"{expected}\", found \"{found}\"")]
    SchemaMismatch {
        /// Schema the loader expects.
        expected: String,
        /// Schema found in the table.
        found: String,
    },

    /// The artifact was written by a newer version than the loader accepts.
    #[error("version {found} exceeds loader ceiling {ceiling}")]
    VersionTooNew {
        /// Version found in the table.
        found: Version,
        /// Maximum version the loader accepts.
        ceiling: Version,
    },

    /// A binary artifact's element type does not match the loader's.
    #[error("element type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        /// Element type the loader expects.
        expected: DataType,
        /// Element type recorded in the table.
        found: DataType,
    },

    /// A binary artifact failed checksum verification.
    #[error("checksum mismatch for {file}: expected {expected:#010x}, found {found:#010x}")]
    ChecksumMismatch {
        /// The offending file.
        file: String,
        /// Checksum recorded in the table.
        expected: u32,
        /// Checksum of the bytes on disk.
        found: u32,
    },

    /// An artifact filename does not embed the uuid recorded for it.
    #[error("uuid mismatch for {file}: table records {uuid}")]
    UuidMismatch {
        /// The offending file.
        file: String,
        /// Uuid recorded in the table.
        uuid: String,
    },

    /// TOML encoding failure.
    #[error("toml encode error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    /// TOML decoding failure.
    #[error("toml decode error: {0}")]
    TomlDe(#[from] toml::de::Error),

    /// Malformed version literal.
    #[error("malformed version string: {0:?}")]
    BadVersion(String),

    /// Underlying dataset read/write failure.
    #[error(transparent)]
    Data(#[from] DataError),

    /// Filesystem failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A `(major, minor, patch)` triple with lexicographic ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    /// Major component.
    pub major: u32,
    /// Minor component.
    pub minor: u32,
    /// Patch component.
    pub patch: u32,
}

impl Version {
    /// Creates a version triple.
    #[must_use]
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl From<Version> for String {
    fn from(v: Version) -> String {
        v.to_string()
    }
}

impl TryFrom<String> for Version {
    type Error = SerializationError;

    fn try_from(s: String) -> Result<Self, SerializationError> {
        let mut parts = s.split('.');
        let mut next = || {
            parts
                .next()
                .and_then(|p| p.parse::<u32>().ok())
                .ok_or_else(|| SerializationError::BadVersion(s.clone()))
        };
        let version = Version::new(next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(SerializationError::BadVersion(s));
        }
        Ok(version)
    }
}

/// The root metadata document of a serialized artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveTable {
    /// Identifies what kind of artifact this is.
    pub schema: String,
    /// Version of the serialized layout.
    pub version: Version,
    /// The artifact body.
    pub object: toml::Table,
}

impl SaveTable {
    /// Builds a table from any serializable body.
    ///
    /// # Errors
    ///
    /// Returns [`SerializationError::TomlSer`] if the body does not encode
    /// as a TOML table.
    pub fn new(
        schema: &str,
        version: Version,
        object: impl Serialize,
    ) -> Result<Self, SerializationError> {
        Ok(Self {
            schema: schema.to_string(),
            version,
            object: toml::Table::try_from(object)?,
        })
    }

    /// Writes the table as `svs_config.toml` under `dir`.
    ///
    /// # Errors
    ///
    /// Propagates encoding and filesystem failures.
    pub fn write(&self, dir: &Path) -> Result<(), SerializationError> {
        let text = toml::to_string_pretty(self)?;
        std::fs::write(dir.join(CONFIG_FILE), text)?;
        Ok(())
    }

    /// Reads the table from `svs_config.toml` under `dir`.
    ///
    /// # Errors
    ///
    /// Propagates decoding and filesystem failures.
    pub fn read(dir: &Path) -> Result<Self, SerializationError> {
        let text = std::fs::read_to_string(dir.join(CONFIG_FILE))?;
        Ok(toml::from_str(&text)?)
    }

    /// Validates schema and version, then decodes the body.
    ///
    /// # Errors
    ///
    /// Returns [`SerializationError::SchemaMismatch`] or
    /// [`SerializationError::VersionTooNew`] on a contract violation, or a
    /// decode error if the body does not match `T`.
    pub fn load_object<T: DeserializeOwned>(
        &self,
        schema: &str,
        ceiling: Version,
    ) -> Result<T, SerializationError> {
        if self.schema != schema {
            return Err(SerializationError::SchemaMismatch {
                expected: schema.to_string(),
                found: self.schema.clone(),
            });
        }
        if self.version > ceiling {
            return Err(SerializationError::VersionTooNew {
                found: self.version,
                ceiling,
            });
        }
        Ok(self.object.clone().try_into()?)
    }
}

/// Mints unique auxiliary file names inside a save directory.
pub struct SaveContext {
    dir: PathBuf,
}

impl SaveContext {
    /// Creates the save directory (and parents) if needed.
    ///
    /// # Errors
    ///
    /// Propagates filesystem failures.
    pub fn new(dir: &Path) -> Result<Self, SerializationError> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// The directory this context writes into.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// A child context for a subdirectory.
    ///
    /// # Errors
    ///
    /// Propagates filesystem failures.
    pub fn subdir(&self, name: &str) -> Result<SaveContext, SerializationError> {
        SaveContext::new(&self.dir.join(name))
    }

    /// Mints a fresh `<prefix>_<uuid>.<ext>` name in this directory.
    #[must_use]
    pub fn generate_name(&self, prefix: &str, ext: &str) -> (PathBuf, Uuid) {
        let uuid = Uuid::new_v4();
        let filename = format!("{prefix}_{uuid}.{ext}");
        (self.dir.join(filename), uuid)
    }
}

/// Table entry describing one binary `.svs` artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinaryArtifact {
    /// Filename relative to the save directory.
    pub filename: String,
    /// Element type of the stored array.
    pub eltype: DataType,
    /// Row width.
    pub dims: u64,
    /// Number of rows.
    pub num_vectors: u64,
    /// Uuid embedded in the filename.
    pub uuid: String,
    /// CRC-32 of the file contents.
    pub checksum: u32,
}

/// Writes a dataset as a fresh `.svs` artifact and returns its table entry.
///
/// # Errors
///
/// Propagates filesystem failures.
pub fn save_dataset<T: Element, D: VectorData<T>>(
    ctx: &SaveContext,
    prefix: &str,
    data: &D,
) -> Result<BinaryArtifact, SerializationError> {
    let (path, uuid) = ctx.generate_name(prefix, "svs");
    let checksum = vecio::write_svs(&path, data)?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(BinaryArtifact {
        filename,
        eltype: T::DATA_TYPE,
        dims: data.dimensions() as u64,
        num_vectors: data.size() as u64,
        uuid: uuid.to_string(),
        checksum,
    })
}

/// Loads a `.svs` artifact described by its table entry, verifying element
/// type, uuid, checksum, and shape.
///
/// # Errors
///
/// Returns the specific [`SerializationError`] for whichever validation
/// fails first.
pub fn load_dataset<T: Element>(
    dir: &Path,
    artifact: &BinaryArtifact,
) -> Result<SimpleDataset<T>, SerializationError> {
    if artifact.eltype != T::DATA_TYPE {
        return Err(SerializationError::TypeMismatch {
            expected: T::DATA_TYPE,
            found: artifact.eltype,
        });
    }
    if !artifact.filename.contains(&artifact.uuid) {
        return Err(SerializationError::UuidMismatch {
            file: artifact.filename.clone(),
            uuid: artifact.uuid.clone(),
        });
    }
    let path = dir.join(&artifact.filename);
    let found = vecio::checksum_file(&path)?;
    if found != artifact.checksum {
        return Err(SerializationError::ChecksumMismatch {
            file: artifact.filename.clone(),
            expected: artifact.checksum,
            found,
        });
    }
    let data = vecio::read_svs::<T>(&path, artifact.dims as usize)?;
    if data.size() as u64 != artifact.num_vectors {
        return Err(SerializationError::Data(DataError::MalformedFile {
            path: artifact.filename.clone(),
            reason: format!(
                "expected {} vectors, file holds {}",
                artifact.num_vectors,
                data.size()
            ),
        }));
    }
    Ok(data)
}

/// Packs named binary sub-artifacts into one archive file.
///
/// The format is a flat sequence of `(name_len: u64, name, data_len: u64,
/// data)` records; enough to bundle a directory tree of small blobs into a
/// single `.bin`.
pub struct BundleWriter {
    writer: BufWriter<File>,
}

impl BundleWriter {
    /// Starts a new archive at `path`.
    ///
    /// # Errors
    ///
    /// Propagates filesystem failures.
    pub fn create(path: &Path) -> Result<Self, SerializationError> {
        Ok(Self {
            writer: BufWriter::new(File::create(path)?),
        })
    }

    /// Appends one named blob.
    ///
    /// # Errors
    ///
    /// Propagates write failures.
    pub fn append(&mut self, name: &str, bytes: &[u8]) -> Result<(), SerializationError> {
        self.writer
            .write_all(&(name.len() as u64).to_le_bytes())?;
        self.writer.write_all(name.as_bytes())?;
        self.writer
            .write_all(&(bytes.len() as u64).to_le_bytes())?;
        self.writer.write_all(bytes)?;
        Ok(())
    }

    /// Flushes and closes the archive.
    ///
    /// # Errors
    ///
    /// Propagates write failures.
    pub fn finish(mut self) -> Result<(), SerializationError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Reads archives written by [`BundleWriter`].
pub struct BundleReader {
    reader: BufReader<File>,
    remaining: u64,
}

impl BundleReader {
    /// Opens an archive.
    ///
    /// # Errors
    ///
    /// Propagates filesystem failures.
    pub fn open(path: &Path) -> Result<Self, SerializationError> {
        let file = File::open(path)?;
        let remaining = file.metadata()?.len();
        Ok(Self {
            reader: BufReader::new(file),
            remaining,
        })
    }

    /// Reads the next `(name, bytes)` entry, or `None` at end of archive.
    ///
    /// # Errors
    ///
    /// Propagates read failures and truncation.
    pub fn next_entry(&mut self) -> Result<Option<(String, Vec<u8>)>, SerializationError> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let mut len8 = [0u8; 8];
        self.reader.read_exact(&mut len8)?;
        let name_len = u64::from_le_bytes(len8) as usize;
        let mut name = vec![0u8; name_len];
        self.reader.read_exact(&mut name)?;
        self.reader.read_exact(&mut len8)?;
        let data_len = u64::from_le_bytes(len8) as usize;
        let mut data = vec![0u8; data_len];
        self.reader.read_exact(&mut data)?;
        self.remaining = self
            .remaining
            .saturating_sub(16 + name_len as u64 + data_len as u64);
        Ok(Some((
            String::from_utf8_lossy(&name).into_owned(),
            data,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_ordering() {
        assert!(Version::new(0, 0, 1) < Version::new(0, 1, 0));
        assert!(Version::new(0, 1, 0) < Version::new(1, 0, 0));
        assert!(Version::new(1, 2, 3) == Version::new(1, 2, 3));
        assert!(Version::new(2, 0, 0) > Version::new(1, 9, 9));
    }

    #[test]
    fn test_version_string_roundtrip() {
        let v = Version::try_from("1.4.2".to_string()).unwrap();
        assert_eq!(v, Version::new(1, 4, 2));
        assert_eq!(String::from(v), "1.4.2");
        assert!(Version::try_from("1.4".to_string()).is_err());
        assert!(Version::try_from("1.4.2.9".to_string()).is_err());
        assert!(Version::try_from("a.b.c".to_string()).is_err());
    }

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Body {
        name: String,
        count: u32,
    }

    #[test]
    fn test_save_table_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let body = Body {
            name: "abc".into(),
            count: 7,
        };
        let table = SaveTable::new("test_schema", Version::new(0, 0, 1), &body).unwrap();
        table.write(dir.path()).unwrap();

        let loaded = SaveTable::read(dir.path()).unwrap();
        let decoded: Body = loaded
            .load_object("test_schema", Version::new(0, 0, 5))
            .unwrap();
        assert_eq!(decoded, body);

        // Wrong schema.
        let err = loaded
            .load_object::<Body>("other_schema", Version::new(0, 0, 5))
            .unwrap_err();
        assert!(matches!(err, SerializationError::SchemaMismatch { .. }));

        // Version above the ceiling.
        let err = loaded
            .load_object::<Body>("test_schema", Version::new(0, 0, 0))
            .unwrap_err();
        assert!(matches!(err, SerializationError::VersionTooNew { .. }));
    }

    #[test]
    fn test_dataset_artifact_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = SaveContext::new(dir.path()).unwrap();
        let mut data = SimpleDataset::<f32>::new(5, 3);
        for i in 0..5 {
            data.set(i, &[i as f32, 0.0, -(i as f32)]);
        }

        let artifact = save_dataset(&ctx, "data", &data).unwrap();
        assert!(artifact.filename.starts_with("data_"));
        assert!(artifact.filename.ends_with(".svs"));

        let loaded = load_dataset::<f32>(dir.path(), &artifact).unwrap();
        for i in 0..5 {
            assert_eq!(loaded.get(i), data.get(i));
        }

        // Type mismatch is refused before any bytes are interpreted.
        let err = load_dataset::<u8>(dir.path(), &artifact).unwrap_err();
        assert!(matches!(err, SerializationError::TypeMismatch { .. }));
    }

    #[test]
    fn test_corrupted_artifact_detected() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = SaveContext::new(dir.path()).unwrap();
        let data = SimpleDataset::<f32>::new(4, 2);
        let artifact = save_dataset(&ctx, "data", &data).unwrap();

        let path = dir.path().join(&artifact.filename);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[0] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let err = load_dataset::<f32>(dir.path(), &artifact).unwrap_err();
        assert!(matches!(err, SerializationError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_bundle_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive.bin");
        let mut writer = BundleWriter::create(&path).unwrap();
        writer.append("cluster_0", &[1, 2, 3]).unwrap();
        writer.append("cluster_1", &[]).unwrap();
        writer.append("cluster_2", &[9; 100]).unwrap();
        writer.finish().unwrap();

        let mut reader = BundleReader::open(&path).unwrap();
        let (name, data) = reader.next_entry().unwrap().unwrap();
        assert_eq!(name, "cluster_0");
        assert_eq!(data, vec![1, 2, 3]);
        let (name, data) = reader.next_entry().unwrap().unwrap();
        assert_eq!(name, "cluster_1");
        assert!(data.is_empty());
        let (name, data) = reader.next_entry().unwrap().unwrap();
        assert_eq!(name, "cluster_2");
        assert_eq!(data.len(), 100);
        assert!(reader.next_entry().unwrap().is_none());
    }
}
