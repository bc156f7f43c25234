//! Element types for dense vectors.
//!
//! Every dataset is a matrix of one of the element types enumerated by
//! [`DataType`]. The [`Element`] trait bounds the generic dataset and index
//! code and provides the f32 round trip used by distance computations and
//! type conversions.

use half::{bf16, f16};
use serde::{Deserialize, Serialize};

/// Runtime tag identifying an element or id type.
///
/// Used in save tables so that a loader can verify the on-disk element type
/// before reinterpreting raw bytes, and by the dispatcher to select a
/// concrete implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// 32-bit IEEE float.
    F32,
    /// 16-bit IEEE float.
    F16,
    /// 16-bit brain float.
    BF16,
    /// Signed 8-bit integer (scalar-quantized codes).
    I8,
    /// Unsigned 8-bit integer.
    U8,
    /// Unsigned 32-bit integer (vertex ids).
    U32,
    /// Unsigned 64-bit integer (external ids, offsets).
    U64,
}

impl DataType {
    /// Size in bytes of a single element of this type.
    #[must_use]
    pub const fn size(self) -> usize {
        match self {
            DataType::I8 | DataType::U8 => 1,
            DataType::F16 | DataType::BF16 => 2,
            DataType::F32 | DataType::U32 => 4,
            DataType::U64 => 8,
        }
    }

    /// The canonical lowercase name, matching the serialized form.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            DataType::F32 => "f32",
            DataType::F16 => "f16",
            DataType::BF16 => "bf16",
            DataType::I8 => "i8",
            DataType::U8 => "u8",
            DataType::U32 => "u32",
            DataType::U64 => "u64",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A fixed-width numeric type that vectors may be composed of.
///
/// The trait is the minimal surface the rest of the crate needs: a byte-safe
/// representation (`bytemuck::Pod`) so storage can be reinterpreted from raw
/// files and maps, plus a lossy f32 round trip for distance arithmetic.
pub trait Element:
    bytemuck::Pod + Copy + Default + PartialEq + Send + Sync + std::fmt::Debug + 'static
{
    /// The runtime tag for this type.
    const DATA_TYPE: DataType;

    /// Widen to f32.
    fn to_f32(self) -> f32;

    /// Narrow from f32. Values outside the representable range saturate.
    fn from_f32(value: f32) -> Self;
}

impl Element for f32 {
    const DATA_TYPE: DataType = DataType::F32;

    #[inline]
    fn to_f32(self) -> f32 {
        self
    }

    #[inline]
    fn from_f32(value: f32) -> Self {
        value
    }
}

impl Element for f16 {
    const DATA_TYPE: DataType = DataType::F16;

    #[inline]
    fn to_f32(self) -> f32 {
        self.to_f32()
    }

    #[inline]
    fn from_f32(value: f32) -> Self {
        f16::from_f32(value)
    }
}

impl Element for bf16 {
    const DATA_TYPE: DataType = DataType::BF16;

    #[inline]
    fn to_f32(self) -> f32 {
        self.to_f32()
    }

    #[inline]
    fn from_f32(value: f32) -> Self {
        bf16::from_f32(value)
    }
}

impl Element for i8 {
    const DATA_TYPE: DataType = DataType::I8;

    #[inline]
    fn to_f32(self) -> f32 {
        f32::from(self)
    }

    #[inline]
    fn from_f32(value: f32) -> Self {
        num_traits::cast::<f32, i8>(value.round())
            .unwrap_or(if value < 0.0 { i8::MIN } else { i8::MAX })
    }
}

impl Element for u8 {
    const DATA_TYPE: DataType = DataType::U8;

    #[inline]
    fn to_f32(self) -> f32 {
        f32::from(self)
    }

    #[inline]
    fn from_f32(value: f32) -> Self {
        num_traits::cast::<f32, u8>(value.round()).unwrap_or(if value < 0.0 { 0 } else { u8::MAX })
    }
}

impl Element for u32 {
    const DATA_TYPE: DataType = DataType::U32;

    #[inline]
    #[allow(clippy::cast_precision_loss)]
    fn to_f32(self) -> f32 {
        self as f32
    }

    #[inline]
    fn from_f32(value: f32) -> Self {
        num_traits::cast::<f32, u32>(value.round()).unwrap_or(0)
    }
}

impl Element for u64 {
    const DATA_TYPE: DataType = DataType::U64;

    #[inline]
    #[allow(clippy::cast_precision_loss)]
    fn to_f32(self) -> f32 {
        self as f32
    }

    #[inline]
    fn from_f32(value: f32) -> Self {
        num_traits::cast::<f32, u64>(value.round()).unwrap_or(0)
    }
}

/// Widen a row of elements into an f32 scratch buffer.
///
/// The scratch buffer is cleared and refilled; reusing one buffer across
/// calls avoids per-row allocation in build loops.
#[inline]
pub fn widen_into<T: Element>(row: &[T], scratch: &mut Vec<f32>) {
    scratch.clear();
    scratch.extend(row.iter().map(|x| x.to_f32()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes() {
        assert_eq!(DataType::F32.size(), 4);
        assert_eq!(DataType::F16.size(), 2);
        assert_eq!(DataType::BF16.size(), 2);
        assert_eq!(DataType::I8.size(), 1);
        assert_eq!(DataType::U64.size(), 8);
    }

    #[test]
    fn test_i8_saturation() {
        assert_eq!(i8::from_f32(300.0), 127);
        assert_eq!(i8::from_f32(-300.0), -128);
        assert_eq!(i8::from_f32(1.4), 1);
        assert_eq!(i8::from_f32(-1.6), -2);
    }

    #[test]
    fn test_f16_roundtrip() {
        let x = f16::from_f32(0.5);
        assert_eq!(x.to_f32(), 0.5);
    }

    #[test]
    fn test_serde_names() {
        let tag: DataType = toml::from_str::<std::collections::HashMap<String, DataType>>(
            "eltype = \"bf16\"",
        )
        .unwrap()["eltype"];
        assert_eq!(tag, DataType::BF16);
        assert_eq!(tag.name(), "bf16");
    }
}
