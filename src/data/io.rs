//! Vector file loaders and writers.
//!
//! Two on-disk families are supported:
//!
//! - The legacy *vecs* family (`.fvecs`, `.bvecs`, `.ivecs`, `.hvecs`): an
//!   unframed sequence of `(dim: u32, payload: [T; dim])` records with the
//!   element type implied by the extension.
//! - The native format (`.svs`): a flat little-endian `[T]` array with the
//!   dimensionality recorded out-of-band in the enclosing save table.
//!
//! Loaders validate the extension against the requested element type and
//! the file length against the implied shape before any data is touched.

use super::{DataError, SimpleDataset, VectorData};
use crate::datatype::{DataType, Element};
use bytemuck::Zeroable;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

fn extension_for(dtype: DataType) -> Option<&'static str> {
    match dtype {
        DataType::F32 => Some("fvecs"),
        DataType::U8 => Some("bvecs"),
        DataType::U32 => Some("ivecs"),
        DataType::F16 => Some("hvecs"),
        _ => None,
    }
}

fn malformed(path: &Path, reason: impl Into<String>) -> DataError {
    DataError::MalformedFile {
        path: path.display().to_string(),
        reason: reason.into(),
    }
}

/// Reads a `*vecs` file into a contiguous dataset.
///
/// Every record must carry the same dimensionality, and the file length
/// must be an exact multiple of the record size.
///
/// # Errors
///
/// Returns [`DataError::MalformedFile`] for a wrong extension, ragged
/// records, or a trailing partial record, and [`DataError::Io`] for read
/// failures.
pub fn read_vecs<T: Element>(path: &Path) -> Result<SimpleDataset<T>, DataError> {
    let expected_ext = extension_for(T::DATA_TYPE)
        .ok_or_else(|| malformed(path, format!("no vecs encoding for {}", T::DATA_TYPE)))?;
    let actual_ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    if actual_ext != expected_ext {
        return Err(malformed(
            path,
            format!("extension .{actual_ext} does not match element type {}", T::DATA_TYPE),
        ));
    }

    let file = File::open(path)?;
    let total_bytes = file.metadata()?.len();
    let mut reader = BufReader::new(file);

    // The leading dimension field fixes the record size for the file.
    let mut dim_bytes = [0u8; 4];
    if total_bytes == 0 {
        return Err(malformed(path, "empty file"));
    }
    reader.read_exact(&mut dim_bytes)?;
    let dimensions = u32::from_le_bytes(dim_bytes) as usize;
    if dimensions == 0 {
        return Err(malformed(path, "record with zero dimensions"));
    }

    let record_bytes = 4 + dimensions * std::mem::size_of::<T>();
    if total_bytes % record_bytes as u64 != 0 {
        return Err(malformed(
            path,
            format!("file size {total_bytes} is not a multiple of record size {record_bytes}"),
        ));
    }
    let size = (total_bytes / record_bytes as u64) as usize;

    let mut out = SimpleDataset::<T>::new(size, dimensions);
    let mut row = vec![T::zeroed(); dimensions];
    for i in 0..size {
        if i > 0 {
            reader.read_exact(&mut dim_bytes)?;
            let d = u32::from_le_bytes(dim_bytes) as usize;
            if d != dimensions {
                return Err(malformed(
                    path,
                    format!("record {i} has {d} dimensions, expected {dimensions}"),
                ));
            }
        }
        reader.read_exact(bytemuck::cast_slice_mut(&mut row))?;
        out.set(i, &row);
    }
    Ok(out)
}

/// Writes a dataset as a `*vecs` file.
///
/// # Errors
///
/// Returns [`DataError::MalformedFile`] if the element type has no vecs
/// encoding, and [`DataError::Io`] for write failures.
pub fn write_vecs<T: Element, D: VectorData<T>>(path: &Path, data: &D) -> Result<(), DataError> {
    if extension_for(T::DATA_TYPE).is_none() {
        return Err(malformed(
            path,
            format!("no vecs encoding for {}", T::DATA_TYPE),
        ));
    }
    let mut writer = BufWriter::new(File::create(path)?);
    let dim = u32::try_from(data.dimensions()).map_err(|_| {
        malformed(path, "dimensionality exceeds u32")
    })?;
    for i in 0..data.size() {
        writer.write_all(&dim.to_le_bytes())?;
        writer.write_all(bytemuck::cast_slice(data.get(i)))?;
    }
    writer.flush()?;
    Ok(())
}

/// Reads a native `.svs` flat array with out-of-band dimensionality.
///
/// # Errors
///
/// Returns [`DataError::MalformedFile`] if the file length is not a
/// multiple of the row size, and [`DataError::Io`] for read failures.
pub fn read_svs<T: Element>(path: &Path, dimensions: usize) -> Result<SimpleDataset<T>, DataError> {
    if dimensions == 0 {
        return Err(malformed(path, "zero dimensions requested"));
    }
    let file = File::open(path)?;
    let total_bytes = file.metadata()?.len();
    let row_bytes = (dimensions * std::mem::size_of::<T>()) as u64;
    if total_bytes % row_bytes != 0 {
        return Err(malformed(
            path,
            format!("file size {total_bytes} is not a multiple of row size {row_bytes}"),
        ));
    }
    let size = (total_bytes / row_bytes) as usize;

    let mut out = SimpleDataset::<T>::new(size, dimensions);
    let mut reader = BufReader::new(file);
    for i in 0..size {
        reader.read_exact(bytemuck::cast_slice_mut(out.get_mut(i)))?;
    }
    Ok(out)
}

/// Writes a dataset as a native `.svs` flat array and returns the CRC-32
/// of the written bytes.
///
/// # Errors
///
/// Returns [`DataError::Io`] for write failures.
pub fn write_svs<T: Element, D: VectorData<T>>(path: &Path, data: &D) -> Result<u32, DataError> {
    let mut writer = BufWriter::new(File::create(path)?);
    let mut hasher = crc32fast::Hasher::new();
    for i in 0..data.size() {
        let bytes: &[u8] = bytemuck::cast_slice(data.get(i));
        hasher.update(bytes);
        writer.write_all(bytes)?;
    }
    writer.flush()?;
    Ok(hasher.finalize())
}

/// Computes the CRC-32 of an `.svs` file's contents.
///
/// # Errors
///
/// Returns [`DataError::Io`] for read failures.
pub fn checksum_file(path: &Path) -> Result<u32, DataError> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::f16;

    fn sample_data() -> SimpleDataset<f32> {
        let mut data = SimpleDataset::new(3, 4);
        for i in 0..3 {
            let base = i as f32 * 10.0;
            data.set(i, &[base, base + 1.0, base + 2.0, base + 3.0]);
        }
        data
    }

    #[test]
    fn test_fvecs_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.fvecs");
        let data = sample_data();
        write_vecs(&path, &data).unwrap();

        let loaded = read_vecs::<f32>(&path).unwrap();
        assert_eq!(loaded.size(), 3);
        assert_eq!(loaded.dimensions(), 4);
        for i in 0..3 {
            assert_eq!(loaded.get(i), data.get(i));
        }
    }

    #[test]
    fn test_hvecs_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.hvecs");
        let mut data = SimpleDataset::<f16>::new(2, 3);
        data.set(0, &[f16::from_f32(0.5), f16::from_f32(1.5), f16::from_f32(2.5)]);
        write_vecs(&path, &data).unwrap();
        let loaded = read_vecs::<f16>(&path).unwrap();
        assert_eq!(loaded.get(0), data.get(0));
    }

    #[test]
    fn test_wrong_extension_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.bvecs");
        write_vecs(&path, &sample_data()).unwrap();
        // f32 data behind a .bvecs extension must be refused.
        let err = read_vecs::<f32>(&path).unwrap_err();
        assert!(matches!(err, DataError::MalformedFile { .. }));
    }

    #[test]
    fn test_truncated_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.fvecs");
        write_vecs(&path, &sample_data()).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();
        let err = read_vecs::<f32>(&path).unwrap_err();
        assert!(matches!(err, DataError::MalformedFile { .. }));
    }

    #[test]
    fn test_svs_roundtrip_with_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.svs");
        let data = sample_data();
        let crc = write_svs(&path, &data).unwrap();
        assert_eq!(checksum_file(&path).unwrap(), crc);

        let loaded = read_svs::<f32>(&path, 4).unwrap();
        assert_eq!(loaded.size(), 3);
        for i in 0..3 {
            assert_eq!(loaded.get(i), data.get(i));
        }

        // Wrong dimensionality: 3 * 4 floats = 48 bytes, not divisible by 5*4.
        let err = read_svs::<f32>(&path, 5).unwrap_err();
        assert!(matches!(err, DataError::MalformedFile { .. }));
    }
}
