//! Core data types: voxel element types and layer kinds

use serde::{Deserialize, Serialize};
use std::fmt;

/// Voxel element types supported by the volume format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    /// Unsigned 8-bit integer
    #[serde(rename = "uint8")]
    U8,
    /// Unsigned 16-bit integer
    #[serde(rename = "uint16")]
    U16,
    /// Unsigned 32-bit integer
    #[serde(rename = "uint32")]
    U32,
    /// Unsigned 64-bit integer
    #[serde(rename = "uint64")]
    U64,
    /// 32-bit floating point
    #[serde(rename = "float32")]
    F32,
}

impl DataType {
    /// Size in bytes of this data type
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::U8 => 1,
            DataType::U16 => 2,
            DataType::U32 | DataType::F32 => 4,
            DataType::U64 => 8,
        }
    }

    /// Check if this is a floating point type
    pub fn is_float(&self) -> bool {
        matches!(self, DataType::F32)
    }

    /// Check if this is an integer type
    pub fn is_integer(&self) -> bool {
        !self.is_float()
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::U8 => "uint8",
            DataType::U16 => "uint16",
            DataType::U32 => "uint32",
            DataType::U64 => "uint64",
            DataType::F32 => "float32",
        };
        write!(f, "{}", name)
    }
}

/// Kind of data a layer holds. Affinity layers carry continuous values and
/// downsample like images; only segmentation layers get the label-preserving
/// treatment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayerType {
    #[serde(rename = "image")]
    Image,
    #[serde(rename = "segmentation")]
    Segmentation,
    #[serde(rename = "affinities")]
    Affinities,
}

impl LayerType {
    /// True for layers whose values are discrete object ids
    pub fn is_discrete(&self) -> bool {
        matches!(self, LayerType::Segmentation)
    }
}

impl fmt::Display for LayerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LayerType::Image => "image",
            LayerType::Segmentation => "segmentation",
            LayerType::Affinities => "affinities",
        };
        write!(f, "{}", name)
    }
}

/// Element type storable in a chunk. Fixes the little-endian wire width and
/// provides the casts the averaging downsampler accumulates through.
pub trait Voxel: Copy + Send + Sync + PartialEq + fmt::Debug + 'static {
    const DATA_TYPE: DataType;

    fn zero() -> Self;
    fn write_le(self, out: &mut Vec<u8>);
    /// Reads exactly `DATA_TYPE.size_in_bytes()` bytes.
    fn read_le(bytes: &[u8]) -> Self;
    fn to_accum(self) -> f64;
    /// Truncating cast back to the element width.
    fn from_accum(v: f64) -> Self;
}

macro_rules! impl_voxel_uint {
    ($t:ty, $dtype:expr) => {
        impl Voxel for $t {
            const DATA_TYPE: DataType = $dtype;

            fn zero() -> Self {
                0
            }

            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn read_le(bytes: &[u8]) -> Self {
                let mut buf = [0u8; std::mem::size_of::<$t>()];
                buf.copy_from_slice(bytes);
                <$t>::from_le_bytes(buf)
            }

            fn to_accum(self) -> f64 {
                self as f64
            }

            fn from_accum(v: f64) -> Self {
                v as $t
            }
        }
    };
}

impl_voxel_uint!(u8, DataType::U8);
impl_voxel_uint!(u16, DataType::U16);
impl_voxel_uint!(u32, DataType::U32);
impl_voxel_uint!(u64, DataType::U64);

impl Voxel for f32 {
    const DATA_TYPE: DataType = DataType::F32;

    fn zero() -> Self {
        0.0
    }

    fn write_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }

    fn read_le(bytes: &[u8]) -> Self {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(bytes);
        f32::from_le_bytes(buf)
    }

    fn to_accum(self) -> f64 {
        self as f64
    }

    fn from_accum(v: f64) -> Self {
        v as f32
    }
}

/// Unsigned label type eligible for the COUNTLESS vote. `Wide` is the next
/// larger unsigned width; voting in it leaves headroom for the +1 bias that
/// distinguishes a real zero label from "no match".
pub trait Label: Voxel {
    type Wide: num_traits::PrimInt;

    fn widen(self) -> Self::Wide;
    fn narrow(wide: Self::Wide) -> Self;
    /// Lossless cast into the widest stored label width, for consumers that
    /// work on object ids regardless of the volume's element type.
    fn to_u64(self) -> u64;
}

macro_rules! impl_label {
    ($t:ty, $wide:ty) => {
        impl Label for $t {
            type Wide = $wide;

            fn widen(self) -> $wide {
                self as $wide
            }

            fn narrow(wide: $wide) -> Self {
                wide as $t
            }

            fn to_u64(self) -> u64 {
                self as u64
            }
        }
    };
}

impl_label!(u8, u16);
impl_label!(u16, u32);
impl_label!(u32, u64);
impl_label!(u64, u128);

/// Dispatches a generic expression over the runtime [`DataType`] of a volume.
///
/// ```ignore
/// with_data_type!(info.data_type, T => store.read::<T>(0, &bbox).await)
/// ```
#[macro_export]
macro_rules! with_data_type {
    ($dtype:expr, $T:ident => $body:expr) => {
        match $dtype {
            $crate::types::DataType::U8 => {
                type $T = u8;
                $body
            }
            $crate::types::DataType::U16 => {
                type $T = u16;
                $body
            }
            $crate::types::DataType::U32 => {
                type $T = u32;
                $body
            }
            $crate::types::DataType::U64 => {
                type $T = u64;
                $body
            }
            $crate::types::DataType::F32 => {
                type $T = f32;
                $body
            }
        }
    };
}

/// Like [`with_data_type!`] but restricted to [`Label`] types; the `else`
/// arm handles float volumes, which have no label semantics.
#[macro_export]
macro_rules! with_label_type {
    ($dtype:expr, $T:ident => $body:expr, else => $fallback:expr) => {
        match $dtype {
            $crate::types::DataType::U8 => {
                type $T = u8;
                $body
            }
            $crate::types::DataType::U16 => {
                type $T = u16;
                $body
            }
            $crate::types::DataType::U32 => {
                type $T = u32;
                $body
            }
            $crate::types::DataType::U64 => {
                type $T = u64;
                $body
            }
            $crate::types::DataType::F32 => $fallback,
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_type_sizes() {
        assert_eq!(DataType::U8.size_in_bytes(), 1);
        assert_eq!(DataType::U16.size_in_bytes(), 2);
        assert_eq!(DataType::F32.size_in_bytes(), 4);
        assert_eq!(DataType::U64.size_in_bytes(), 8);
    }

    #[test]
    fn test_data_type_json_names() {
        assert_eq!(serde_json::to_string(&DataType::U8).unwrap(), "\"uint8\"");
        assert_eq!(
            serde_json::to_string(&DataType::F32).unwrap(),
            "\"float32\""
        );
        let dt: DataType = serde_json::from_str("\"uint64\"").unwrap();
        assert_eq!(dt, DataType::U64);
    }

    #[test]
    fn test_voxel_roundtrip() {
        let mut buf = Vec::new();
        0xBEEFu16.write_le(&mut buf);
        assert_eq!(buf, vec![0xEF, 0xBE]);
        assert_eq!(u16::read_le(&buf), 0xBEEF);
    }

    #[test]
    fn test_from_accum_truncates() {
        assert_eq!(u8::from_accum(2.75), 2);
        assert_eq!(u32::from_accum(99.999), 99);
    }

    #[test]
    fn test_label_widen_narrow() {
        let w = 255u8.widen();
        assert_eq!(w + 1, 256u16);
        assert_eq!(u8::narrow(255u16), 255u8);
    }
}
